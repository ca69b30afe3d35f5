use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    boosting::softmax,
    config::LinearParams,
    features::{FeatureRow, FEATURE_COUNT},
    types::CATEGORY_COUNT,
};

/// Multinomial logistic regression over standardized features.
///
/// Parameters are kept as flat vectors so the artifact encoding does not
/// depend on the matrix library's layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticRegression {
    /// Row-major `FEATURE_COUNT x CATEGORY_COUNT`.
    pub weights: Vec<f64>,
    pub bias: Vec<f64>,
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
    pub iterations: usize,
}

impl LogisticRegression {
    /// Batch gradient descent on the mean cross-entropy plus an L2 penalty.
    pub fn fit(rows: &[FeatureRow], labels: &[usize], params: &LinearParams) -> Self {
        let n = rows.len().max(1);
        let (mean, scale) = standardization(rows);

        let x = DMatrix::from_fn(n, FEATURE_COUNT, |i, j| {
            rows.get(i).map_or(0.0, |r| (r[j] - mean[j]) / scale[j])
        });
        let y = DMatrix::from_fn(n, CATEGORY_COUNT, |i, k| {
            (labels.get(i) == Some(&k)) as u8 as f64
        });

        let mut w = DMatrix::<f64>::zeros(FEATURE_COUNT, CATEGORY_COUNT);
        let mut b = DVector::<f64>::zeros(CATEGORY_COUNT);
        let inv_n = 1.0 / n as f64;

        for iter in 0..params.max_iter {
            let mut p = &x * &w;
            for mut row in p.row_iter_mut() {
                let mut logits = [0.0; CATEGORY_COUNT];
                for k in 0..CATEGORY_COUNT {
                    logits[k] = row[k] + b[k];
                }
                let probs = softmax(&logits);
                for k in 0..CATEGORY_COUNT {
                    row[k] = probs[k];
                }
            }

            let err = p - &y;
            let grad_w = x.transpose() * &err * inv_n + &w * params.l2;
            let grad_b = err.row_sum().transpose() * inv_n;

            w -= grad_w * params.learning_rate;
            b -= grad_b * params.learning_rate;

            if iter % 250 == 0 {
                debug!("logistic regression iteration {}", iter);
            }
        }

        Self {
            weights: w.transpose().as_slice().to_vec(),
            bias: b.as_slice().to_vec(),
            mean: mean.to_vec(),
            scale: scale.to_vec(),
            iterations: params.max_iter,
        }
    }

    pub fn predict_proba(&self, row: &FeatureRow) -> [f64; CATEGORY_COUNT] {
        let mut logits = [0.0; CATEGORY_COUNT];
        for (k, logit) in logits.iter_mut().enumerate() {
            *logit = self.bias.get(k).copied().unwrap_or(0.0);
            for (j, value) in row.iter().enumerate() {
                let z = (value - self.mean[j]) / self.scale[j];
                *logit += self.weights[j * CATEGORY_COUNT + k] * z;
            }
        }
        softmax(&logits)
    }

    pub fn is_well_formed(&self) -> bool {
        self.weights.len() == FEATURE_COUNT * CATEGORY_COUNT
            && self.bias.len() == CATEGORY_COUNT
            && self.mean.len() == FEATURE_COUNT
            && self.scale.len() == FEATURE_COUNT
            && self.scale.iter().all(|s| *s > 0.0)
            && self
                .weights
                .iter()
                .chain(&self.bias)
                .chain(&self.mean)
                .all(|v| v.is_finite())
    }
}

/// Column means and standard deviations; constant columns get scale 1.
fn standardization(rows: &[FeatureRow]) -> ([f64; FEATURE_COUNT], [f64; FEATURE_COUNT]) {
    let n = rows.len().max(1) as f64;
    let mut mean = [0.0; FEATURE_COUNT];
    for r in rows {
        for (m, v) in mean.iter_mut().zip(r) {
            *m += v / n;
        }
    }
    let mut scale = [0.0; FEATURE_COUNT];
    for r in rows {
        for j in 0..FEATURE_COUNT {
            scale[j] += (r[j] - mean[j]).powi(2) / n;
        }
    }
    let scale = scale.map(|var| {
        let sd = var.sqrt();
        if sd > 1e-12 {
            sd
        } else {
            1.0
        }
    });
    (mean, scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy() -> (Vec<FeatureRow>, Vec<usize>) {
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..40 {
            let class = i % CATEGORY_COUNT;
            let mut r = [0.0; FEATURE_COUNT];
            // one-hot-ish signals per class plus a constant column
            r[class] = 5.0 + (i % 3) as f64;
            r[8] = 1.0;
            rows.push(r);
            labels.push(class);
        }
        (rows, labels)
    }

    #[test]
    fn test_logistic_regression_separates_classes() {
        let (rows, labels) = toy();
        let params = LinearParams {
            max_iter: 300,
            learning_rate: 0.5,
            l2: 1e-4,
        };
        let model = LogisticRegression::fit(&rows, &labels, &params);
        assert!(model.is_well_formed());

        for (r, y) in rows.iter().zip(&labels) {
            let p = model.predict_proba(r);
            assert!(p[*y] > 0.6, "class {y}: {p:?}");
        }
    }

    #[test]
    fn test_constant_column_has_unit_scale() {
        let (rows, labels) = toy();
        let model = LogisticRegression::fit(&rows, &labels, &LinearParams { max_iter: 1, ..LinearParams::default() });
        assert_eq!(model.scale[8], 1.0);
        assert_eq!(model.scale.len(), FEATURE_COUNT);
    }
}
