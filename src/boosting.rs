use serde::{Deserialize, Serialize};

use crate::{
    config::BoostingParams,
    features::{FeatureRow, FEATURE_COUNT},
    forest::normalize,
    tree::{DecisionTree, TreeParams},
    types::CATEGORY_COUNT,
};

/// Multi-class gradient boosting on the softmax loss. Each round fits one
/// regression tree per class to that class's residual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoosting {
    init: Vec<f64>,
    learning_rate: f64,
    /// `rounds[r][k]` is the tree for class `k` in round `r`.
    rounds: Vec<Vec<DecisionTree>>,
    importances: Vec<f64>,
}

impl GradientBoosting {
    pub fn fit(rows: &[FeatureRow], labels: &[usize], params: &BoostingParams) -> Self {
        let n = rows.len();
        let k = CATEGORY_COUNT as f64;

        // Smoothed log class priors.
        let mut counts = [0usize; CATEGORY_COUNT];
        for &y in labels {
            if let Some(c) = counts.get_mut(y) {
                *c += 1;
            }
        }
        let init: Vec<f64> = counts
            .iter()
            .map(|c| ((*c as f64 + 1.0) / (n as f64 + k)).ln())
            .collect();

        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_split: params.min_samples_split,
            max_features: FEATURE_COUNT,
        };

        let mut scores: Vec<[f64; CATEGORY_COUNT]> = vec![to_array(&init); n];
        let mut rounds = Vec::with_capacity(params.n_rounds);
        let mut importances = vec![0.0; FEATURE_COUNT];

        for _ in 0..params.n_rounds {
            let probs: Vec<[f64; CATEGORY_COUNT]> = scores.iter().map(softmax).collect();
            let mut round = Vec::with_capacity(CATEGORY_COUNT);

            for class in 0..CATEGORY_COUNT {
                let residuals: Vec<f64> = probs
                    .iter()
                    .zip(labels)
                    .map(|(p, &y)| (y == class) as u8 as f64 - p[class])
                    .collect();

                let tree = DecisionTree::fit_regressor(
                    rows,
                    &residuals,
                    (0..n).collect(),
                    tree_params,
                    |idx| newton_step(&residuals, idx, k),
                    &mut importances,
                );

                for (s, row) in scores.iter_mut().zip(rows) {
                    s[class] += params.learning_rate * tree.leaf_value(row).first().copied().unwrap_or(0.0);
                }
                round.push(tree);
            }
            rounds.push(round);
        }

        normalize(&mut importances);

        Self {
            init,
            learning_rate: params.learning_rate,
            rounds,
            importances,
        }
    }

    pub fn predict_proba(&self, row: &FeatureRow) -> [f64; CATEGORY_COUNT] {
        let mut s = to_array(&self.init);
        for round in &self.rounds {
            for (class, tree) in round.iter().enumerate().take(CATEGORY_COUNT) {
                s[class] += self.learning_rate * tree.leaf_value(row).first().copied().unwrap_or(0.0);
            }
        }
        softmax(&s)
    }

    pub fn importances(&self) -> &[f64] {
        &self.importances
    }

    pub fn round_count(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_well_formed(&self) -> bool {
        self.init.len() == CATEGORY_COUNT
            && self.init.iter().all(|v| v.is_finite())
            && self.learning_rate.is_finite()
            && self.importances.len() == FEATURE_COUNT
            && self
                .rounds
                .iter()
                .all(|r| r.len() == CATEGORY_COUNT && r.iter().all(|t| t.is_well_formed(1)))
    }
}

/// Friedman's one-step Newton update for the multinomial deviance.
fn newton_step(residuals: &[f64], idx: &[usize], k: f64) -> f64 {
    let (num, den) = idx.iter().fold((0.0, 0.0), |(num, den), &i| {
        let r = residuals[i];
        (num + r, den + r.abs() * (1.0 - r.abs()))
    });
    if den < 1e-12 {
        return 0.0;
    }
    (k - 1.0) / k * num / den
}

fn to_array(v: &[f64]) -> [f64; CATEGORY_COUNT] {
    let mut out = [0.0; CATEGORY_COUNT];
    for (o, x) in out.iter_mut().zip(v) {
        *o = *x;
    }
    out
}

pub(crate) fn softmax(scores: &[f64; CATEGORY_COUNT]) -> [f64; CATEGORY_COUNT] {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exp = scores.map(|s| (s - max).exp());
    let total: f64 = exp.iter().sum();
    exp.map(|e| e / total)
}
