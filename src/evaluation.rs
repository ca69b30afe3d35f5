use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    config::TrainingConfig,
    features::FeatureRow,
    models::ModelKind,
    types::{ThreatCategory, CATEGORY_COUNT},
};

/// Held-out metrics. Precision, recall and F1 are support-weighted averages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// `confusion[truth][predicted]`, in category declaration order.
    pub confusion: Vec<Vec<usize>>,
    pub support: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidation {
    pub folds: usize,
    pub scores: Vec<f64>,
    pub mean: f64,
    pub std: f64,
}

pub fn evaluate(truth: &[usize], predicted: &[usize]) -> EvaluationMetrics {
    let mut confusion = vec![vec![0usize; CATEGORY_COUNT]; CATEGORY_COUNT];
    for (&t, &p) in truth.iter().zip(predicted) {
        if t < CATEGORY_COUNT && p < CATEGORY_COUNT {
            confusion[t][p] += 1;
        }
    }

    let total: usize = confusion.iter().flatten().sum();
    let correct: usize = (0..CATEGORY_COUNT).map(|k| confusion[k][k]).sum();
    let support: Vec<usize> = confusion.iter().map(|row| row.iter().sum()).collect();

    let (mut precision, mut recall, mut f1) = (0.0, 0.0, 0.0);
    for k in 0..CATEGORY_COUNT {
        if support[k] == 0 {
            continue;
        }
        let tp = confusion[k][k] as f64;
        let predicted_k: usize = confusion.iter().map(|row| row[k]).sum();
        let p = ratio(tp, predicted_k as f64);
        let r = ratio(tp, support[k] as f64);
        let f = ratio(2.0 * p * r, p + r);

        let weight = support[k] as f64 / total as f64;
        precision += weight * p;
        recall += weight * r;
        f1 += weight * f;
    }

    EvaluationMetrics {
        accuracy: ratio(correct as f64, total as f64),
        precision,
        recall,
        f1,
        confusion,
        support,
    }
}

fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Splits indices into (train, test) keeping class proportions. Classes
/// with a single example stay in the training partition.
pub fn stratified_split(labels: &[usize], test_ratio: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for class in 0..CATEGORY_COUNT {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        if members.is_empty() {
            continue;
        }
        members.shuffle(&mut rng);

        let count = members.len();
        let n_test = if count < 2 {
            0
        } else {
            ((count as f64 * test_ratio).round() as usize).clamp(1, count - 1)
        };
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// Assigns every index to one of `k` folds, dealing each shuffled class
/// round-robin so folds stay stratified.
pub fn stratified_folds(labels: &[usize], k: usize, seed: u64) -> Vec<Vec<usize>> {
    let k = k.max(1);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds = vec![Vec::new(); k];
    let mut next = 0;

    for class in 0..CATEGORY_COUNT {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        members.shuffle(&mut rng);
        for i in members {
            folds[next % k].push(i);
            next += 1;
        }
    }

    for fold in folds.iter_mut() {
        fold.sort_unstable();
    }
    folds
}

/// Stratified k-fold accuracy of one family on the given rows.
pub fn cross_validate(
    kind: ModelKind,
    rows: &[FeatureRow],
    labels: &[usize],
    config: &TrainingConfig,
) -> CrossValidation {
    let folds = stratified_folds(labels, config.cv_folds, config.seed);
    let mut scores = Vec::with_capacity(folds.len());

    for (f, held_out) in folds.iter().enumerate() {
        if held_out.is_empty() {
            continue;
        }
        let train_idx: Vec<usize> = folds
            .iter()
            .enumerate()
            .filter(|(g, _)| *g != f)
            .flat_map(|(_, fold)| fold.iter().copied())
            .collect();

        let train_rows: Vec<FeatureRow> = train_idx.iter().map(|&i| rows[i]).collect();
        let train_labels: Vec<usize> = train_idx.iter().map(|&i| labels[i]).collect();
        let model = kind.fit(&train_rows, &train_labels, config);

        let correct = held_out
            .iter()
            .filter(|&&i| model.predict_row(&rows[i]).argmax().0.index() == labels[i])
            .count();
        scores.push(correct as f64 / held_out.len() as f64);
    }

    let n = scores.len().max(1) as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let std = (scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n).sqrt();

    CrossValidation {
        folds: scores.len(),
        scores,
        mean,
        std,
    }
}

/// Text rendering of a confusion matrix with category headers.
pub fn format_confusion(confusion: &[Vec<usize>]) -> String {
    let mut out = format!("{:>10}", "");
    for c in ThreatCategory::ALL {
        out.push_str(&format!("{:>10}", c.as_str()));
    }
    out.push('\n');
    for (c, row) in ThreatCategory::ALL.iter().zip(confusion) {
        out.push_str(&format!("{:>10}", c.as_str()));
        for v in row {
            out.push_str(&format!("{:>10}", v));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_predictions() {
        let truth = vec![0, 1, 2, 3, 0, 1];
        let m = evaluate(&truth, &truth);
        assert_eq!(m.accuracy, 1.0);
        assert!((m.f1 - 1.0).abs() < 1e-12);
        assert_eq!(m.confusion[0][0], 2);
        assert_eq!(m.support, vec![2, 2, 1, 1]);
    }

    #[test]
    fn test_weighted_metrics() {
        // class 0: 3 samples, 2 right; class 1: 1 sample, right
        let truth = vec![0, 0, 0, 1];
        let pred = vec![0, 0, 1, 1];
        let m = evaluate(&truth, &pred);
        assert!((m.accuracy - 0.75).abs() < 1e-12);
        // precision: class0 = 1.0, class1 = 0.5 -> 0.75*1.0 + 0.25*0.5
        assert!((m.precision - 0.875).abs() < 1e-12);
        // recall: class0 = 2/3, class1 = 1.0
        assert!((m.recall - 0.75).abs() < 1e-12);
        assert_eq!(m.confusion[0][1], 1);
    }

    #[test]
    fn test_stratified_split_keeps_every_class() {
        let labels: Vec<usize> = (0..100).map(|i| i % 4).collect();
        let (train, test) = stratified_split(&labels, 0.2, 42);
        assert_eq!(train.len() + test.len(), 100);
        assert_eq!(test.len(), 20);
        for class in 0..4 {
            assert_eq!(test.iter().filter(|&&i| labels[i] == class).count(), 5);
        }
        let again = stratified_split(&labels, 0.2, 42);
        assert_eq!(again, (train, test));
    }

    #[test]
    fn test_singleton_class_stays_in_train() {
        let labels = vec![0, 0, 0, 0, 1];
        let (train, test) = stratified_split(&labels, 0.2, 1);
        assert!(train.contains(&4));
        assert_eq!(test.len(), 1);
    }

    #[test]
    fn test_folds_partition_indices() {
        let labels: Vec<usize> = (0..23).map(|i| i % 3).collect();
        let folds = stratified_folds(&labels, 5, 3);
        assert_eq!(folds.len(), 5);
        let mut all: Vec<usize> = folds.concat();
        all.sort_unstable();
        assert_eq!(all, (0..23).collect::<Vec<_>>());
        assert!(folds.iter().all(|f| f.len() >= 4));
    }

    #[test]
    fn test_format_confusion_has_headers() {
        let text = format_confusion(&vec![vec![1, 0, 0, 0]; 4]);
        assert!(text.contains("phishing"));
        assert_eq!(text.lines().count(), 5);
    }
}
