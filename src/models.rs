use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    boosting::GradientBoosting,
    config::TrainingConfig,
    features::{FeatureRow, FeatureVector, FEATURE_NAMES},
    forest::RandomForest,
    linear::LogisticRegression,
    types::ClassProbabilities,
};

/// Anything that maps a feature vector to a distribution over the four
/// threat categories. Serving code only talks to this trait.
pub trait ProbabilisticClassifier: Send + Sync {
    fn kind(&self) -> ModelKind;

    fn predict_proba(&self, features: &FeatureVector) -> ClassProbabilities;

    /// Normalized per-feature importance, for families that define one.
    fn feature_importances(&self) -> Option<Vec<f64>> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    RandomForest,
    GradientBoosting,
    LogisticRegression,
}

impl ModelKind {
    /// Candidate order; also the final tie-break during selection.
    pub const ALL: [ModelKind; 3] = [
        ModelKind::RandomForest,
        ModelKind::GradientBoosting,
        ModelKind::LogisticRegression,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::RandomForest => "random_forest",
            ModelKind::GradientBoosting => "gradient_boosting",
            ModelKind::LogisticRegression => "logistic_regression",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ModelKind::RandomForest => "Random Forest",
            ModelKind::GradientBoosting => "Gradient Boosting",
            ModelKind::LogisticRegression => "Logistic Regression",
        }
    }

    /// Fits this family on the given rows.
    pub fn fit(&self, rows: &[FeatureRow], labels: &[usize], config: &TrainingConfig) -> TrainedModel {
        match self {
            ModelKind::RandomForest => {
                TrainedModel::RandomForest(RandomForest::fit(rows, labels, &config.forest, config.seed))
            }
            ModelKind::GradientBoosting => {
                TrainedModel::GradientBoosting(GradientBoosting::fit(rows, labels, &config.boosting))
            }
            ModelKind::LogisticRegression => {
                TrainedModel::LogisticRegression(LogisticRegression::fit(rows, labels, &config.linear))
            }
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Fitted parameters tagged by family; this is what the artifact stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrainedModel {
    RandomForest(RandomForest),
    GradientBoosting(GradientBoosting),
    LogisticRegression(LogisticRegression),
}

impl TrainedModel {
    pub fn predict_row(&self, row: &FeatureRow) -> ClassProbabilities {
        let raw = match self {
            TrainedModel::RandomForest(m) => m.predict_proba(row),
            TrainedModel::GradientBoosting(m) => m.predict_proba(row),
            TrainedModel::LogisticRegression(m) => m.predict_proba(row),
        };
        ClassProbabilities::normalized(raw)
    }

    /// Structural sanity check run after decoding an artifact.
    pub fn is_well_formed(&self) -> bool {
        match self {
            TrainedModel::RandomForest(m) => m.is_well_formed(),
            TrainedModel::GradientBoosting(m) => m.is_well_formed(),
            TrainedModel::LogisticRegression(m) => m.is_well_formed(),
        }
    }
}

impl ProbabilisticClassifier for TrainedModel {
    fn kind(&self) -> ModelKind {
        match self {
            TrainedModel::RandomForest(_) => ModelKind::RandomForest,
            TrainedModel::GradientBoosting(_) => ModelKind::GradientBoosting,
            TrainedModel::LogisticRegression(_) => ModelKind::LogisticRegression,
        }
    }

    fn predict_proba(&self, features: &FeatureVector) -> ClassProbabilities {
        self.predict_row(&features.to_array())
    }

    fn feature_importances(&self) -> Option<Vec<f64>> {
        match self {
            TrainedModel::RandomForest(m) => Some(m.importances().to_vec()),
            TrainedModel::GradientBoosting(m) => Some(m.importances().to_vec()),
            TrainedModel::LogisticRegression(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureImportance {
    pub feature: String,
    pub importance: f64,
}

/// Pairs importances with feature names, highest first. Equal scores keep
/// feature order.
pub fn rank_importances(values: &[f64]) -> Vec<FeatureImportance> {
    let mut ranked: Vec<FeatureImportance> = FEATURE_NAMES
        .iter()
        .zip(values)
        .map(|(name, v)| FeatureImportance {
            feature: name.to_string(),
            importance: *v,
        })
        .collect();
    ranked.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BoostingParams, ForestParams, LinearParams},
        features::FEATURE_COUNT,
        types::ThreatCategory,
    };

    fn small_config() -> TrainingConfig {
        TrainingConfig {
            forest: ForestParams {
                n_trees: 5,
                max_depth: 4,
                min_samples_split: 2,
                max_features: Some(FEATURE_COUNT),
            },
            boosting: BoostingParams {
                n_rounds: 5,
                ..BoostingParams::default()
            },
            linear: LinearParams {
                max_iter: 50,
                ..LinearParams::default()
            },
            ..TrainingConfig::default()
        }
    }

    fn data() -> (Vec<FeatureRow>, Vec<usize>) {
        (0..20)
            .map(|i| {
                let mut r = [0.0; FEATURE_COUNT];
                r[2] = (i % 4) as f64;
                (r, i % 4)
            })
            .unzip()
    }

    #[test]
    fn test_every_family_fits_and_predicts_through_trait() {
        let (rows, labels) = data();
        let config = small_config();
        for kind in ModelKind::ALL {
            let model = kind.fit(&rows, &labels, &config);
            assert_eq!(model.kind(), kind);
            assert!(model.is_well_formed());

            let classifier: &dyn ProbabilisticClassifier = &model;
            let probs = classifier.predict_proba(&FeatureVector::from_array(rows[0]));
            let total: f64 = probs.as_array().iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert_eq!(probs.argmax().0, ThreatCategory::Safe);
        }
    }

    #[test]
    fn test_importances_only_for_tree_families() {
        let (rows, labels) = data();
        let config = small_config();
        assert!(ModelKind::RandomForest.fit(&rows, &labels, &config).feature_importances().is_some());
        assert!(ModelKind::LogisticRegression.fit(&rows, &labels, &config).feature_importances().is_none());
    }

    #[test]
    fn test_rank_importances_orders_descending() {
        let mut values = vec![0.0; FEATURE_COUNT];
        values[3] = 0.7;
        values[0] = 0.3;
        let ranked = rank_importances(&values);
        assert_eq!(ranked[0].feature, "has_ip");
        assert_eq!(ranked[1].feature, "domain_length");
        assert_eq!(ranked[2].feature, "url_length");
    }
}
