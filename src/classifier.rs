use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    evaluation::{CrossValidation, EvaluationMetrics},
    features::{FeatureSchema, FeatureVector},
    models::{FeatureImportance, ModelKind, ProbabilisticClassifier},
    storage::{load_artifact, ModelArtifact},
    types::ClassProbabilities,
};

/// Artifact metadata kept alongside the loaded model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub family: ModelKind,
    pub schema_version: u32,
    pub schema_fingerprint: String,
    pub trained_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub metrics: EvaluationMetrics,
    pub cross_validation: CrossValidation,
    pub importances: Option<Vec<FeatureImportance>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

enum State {
    Ready {
        model: Box<dyn ProbabilisticClassifier>,
        info: ModelInfo,
    },
    Unavailable {
        reason: String,
    },
}

/// The trained classifier as seen by the serving path: either a ready
/// model or the reason there is none.
pub struct Classifier {
    state: State,
}

impl Classifier {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            state: State::Unavailable {
                reason: reason.into(),
            },
        }
    }

    pub fn from_artifact(artifact: ModelArtifact) -> Self {
        let info = ModelInfo {
            family: artifact.family,
            schema_version: artifact.schema.version,
            schema_fingerprint: artifact.schema.fingerprint,
            trained_at: artifact.created_at,
            run_id: artifact.run_id,
            metrics: artifact.metrics,
            cross_validation: artifact.cross_validation,
            importances: artifact.importances,
        };
        Self {
            state: State::Ready {
                model: Box::new(artifact.model),
                info,
            },
        }
    }

    /// Loads the artifact at `path`. Any failure leaves the classifier
    /// unavailable rather than failing startup.
    pub fn load(path: &Path, schema: &FeatureSchema) -> Self {
        match load_artifact(path, schema) {
            Ok(artifact) => {
                info!("Classifier ready: {} ({})", artifact.family, artifact.run_id);
                Self::from_artifact(artifact)
            }
            Err(e) => {
                warn!("Model unavailable, serving heuristic-only verdicts: {}", e);
                Self::unavailable(e.to_string())
            }
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.state, State::Ready { .. })
    }

    pub fn predict(&self, features: &FeatureVector) -> Option<ClassProbabilities> {
        match &self.state {
            State::Ready { model, .. } => Some(model.predict_proba(features)),
            State::Unavailable { .. } => None,
        }
    }

    pub fn status(&self) -> ModelStatus {
        match &self.state {
            State::Ready { info, .. } => ModelStatus {
                available: true,
                model: Some(info.clone()),
                reason: None,
            },
            State::Unavailable { reason } => ModelStatus {
                available: false,
                model: None,
                reason: Some(reason.clone()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::FeatureConfig, features::FeatureExtractor};

    #[test]
    fn test_missing_artifact_leaves_classifier_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FeatureExtractor::new(&FeatureConfig::default()).unwrap();
        let classifier = Classifier::load(&dir.path().join("missing.bin"), extractor.schema());

        assert!(!classifier.is_available());
        assert!(classifier.predict(&FeatureVector::default()).is_none());
        let status = classifier.status();
        assert!(!status.available);
        assert!(status.reason.unwrap().contains("no model artifact"));
    }

    #[test]
    fn test_corrupt_artifact_leaves_classifier_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let extractor = FeatureExtractor::new(&FeatureConfig::default()).unwrap();

        let classifier = Classifier::load(&path, extractor.schema());
        assert!(!classifier.is_available());

        let json = serde_json::to_value(classifier.status()).unwrap();
        assert_eq!(json["available"], false);
        assert!(json.get("model").is_none());
    }
}
