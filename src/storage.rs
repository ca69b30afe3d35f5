use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    evaluation::{CrossValidation, EvaluationMetrics},
    features::FeatureSchema,
    models::{FeatureImportance, ModelKind, TrainedModel},
};

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
const MAX_ARTIFACT_BYTES: u64 = 256 * 1024 * 1024;

/// A trained model plus everything needed to decide whether it may serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub schema: FeatureSchema,
    pub created_at: DateTime<Utc>,
    pub run_id: Uuid,
    pub family: ModelKind,
    pub metrics: EvaluationMetrics,
    pub cross_validation: CrossValidation,
    pub importances: Option<Vec<FeatureImportance>>,
    pub model: TrainedModel,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    payload: Vec<u8>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_ARTIFACT_BYTES)
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn encode_artifact(artifact: &ModelArtifact) -> Result<Vec<u8>, AppError> {
    let payload = codec().serialize(artifact)?;
    let envelope = Envelope {
        checksum: checksum(&payload),
        payload,
    };
    Ok(codec().serialize(&envelope)?)
}

/// Decodes and verifies an artifact. Every structural failure is reported
/// as `ArtifactCorrupt`; a feature layout that differs from `expected` is
/// `ModelUnavailable`.
pub fn decode_artifact(bytes: &[u8], expected: &FeatureSchema) -> Result<ModelArtifact, AppError> {
    let envelope: Envelope = codec()
        .deserialize(bytes)
        .map_err(|e| AppError::ArtifactCorrupt(format!("unreadable envelope: {}", e)))?;

    if checksum(&envelope.payload) != envelope.checksum {
        return Err(AppError::ArtifactCorrupt("checksum mismatch".to_string()));
    }

    let artifact: ModelArtifact = codec()
        .deserialize(&envelope.payload)
        .map_err(|e| AppError::ArtifactCorrupt(format!("unreadable payload: {}", e)))?;

    if artifact.format_version != ARTIFACT_FORMAT_VERSION {
        return Err(AppError::ArtifactCorrupt(format!(
            "unsupported format version {} (expected {})",
            artifact.format_version, ARTIFACT_FORMAT_VERSION
        )));
    }

    if !artifact.schema.is_compatible(expected) {
        return Err(AppError::ModelUnavailable(format!(
            "feature schema mismatch: artifact v{} {}, runtime v{} {}",
            artifact.schema.version,
            short(&artifact.schema.fingerprint),
            expected.version,
            short(&expected.fingerprint)
        )));
    }

    if !artifact.model.is_well_formed() {
        return Err(AppError::ArtifactCorrupt(format!(
            "{} parameters failed validation",
            artifact.family.as_str()
        )));
    }

    Ok(artifact)
}

fn short(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

pub fn load_artifact(path: &Path, expected: &FeatureSchema) -> Result<ModelArtifact, AppError> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(AppError::ModelUnavailable(format!(
                "no model artifact at {}",
                path.display()
            )))
        }
        Err(e) => return Err(e.into()),
    };
    if size > MAX_ARTIFACT_BYTES {
        return Err(AppError::ArtifactCorrupt(format!("artifact is {} bytes", size)));
    }

    let bytes = fs::read(path)?;
    let artifact = decode_artifact(&bytes, expected)?;
    info!(
        "Loaded {} model artifact {} from {} (trained {})",
        artifact.family,
        artifact.run_id,
        path.display(),
        artifact.created_at.to_rfc3339()
    );
    Ok(artifact)
}

pub fn save_artifact(path: &Path, artifact: &ModelArtifact) -> Result<(), AppError> {
    let bytes = encode_artifact(artifact)?;
    write_atomic(path, &bytes)?;
    info!("Saved {} model artifact to {}", artifact.family, path.display());
    Ok(())
}

/// Writes to a temporary sibling, syncs, then renames over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::InvalidInput(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = (|| -> Result<(), AppError> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if result.is_err() {
        if let Err(e) = fs::remove_file(&tmp) {
            debug!("Could not remove temporary file {}: {}", tmp.display(), e);
        }
    }
    result
}

/// Exclusive `<artifact>.lock` file held for the duration of a training run.
#[derive(Debug)]
pub struct ArtifactLock {
    path: PathBuf,
}

impl ArtifactLock {
    pub fn lock_path(artifact: &Path) -> PathBuf {
        let mut name = artifact.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn acquire(artifact: &Path) -> Result<Self, AppError> {
        if let Some(parent) = artifact.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let path = Self::lock_path(artifact);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                debug!("Acquired artifact lock {}", path.display());
                Ok(Self { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(AppError::ArtifactLocked(format!(
                "{} exists; another training run may be in progress",
                path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for ArtifactLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release artifact lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{FeatureConfig, LinearParams},
        evaluation::evaluate,
        features::{FeatureRow, FEATURE_COUNT},
        linear::LogisticRegression,
    };

    fn schema() -> FeatureSchema {
        FeatureSchema::new(&FeatureConfig::default().suspicious_keywords)
    }

    fn artifact() -> ModelArtifact {
        let rows: Vec<FeatureRow> = (0..8)
            .map(|i| {
                let mut r = [0.0; FEATURE_COUNT];
                r[0] = (i % 4) as f64;
                r
            })
            .collect();
        let labels: Vec<usize> = (0..8).map(|i| i % 4).collect();
        let model = LogisticRegression::fit(&rows, &labels, &LinearParams { max_iter: 5, ..LinearParams::default() });

        ModelArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            schema: schema(),
            created_at: Utc::now(),
            run_id: Uuid::new_v4(),
            family: ModelKind::LogisticRegression,
            metrics: evaluate(&labels, &labels),
            cross_validation: CrossValidation {
                folds: 2,
                scores: vec![1.0, 1.0],
                mean: 1.0,
                std: 0.0,
            },
            importances: None,
            model: TrainedModel::LogisticRegression(model),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("model.bin");
        let saved = artifact();

        save_artifact(&path, &saved).unwrap();
        let loaded = load_artifact(&path, &schema()).unwrap();
        assert_eq!(loaded.run_id, saved.run_id);
        assert_eq!(loaded.family, ModelKind::LogisticRegression);

        // no temporary files left behind
        let entries = fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_missing_artifact_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_artifact(&dir.path().join("none.bin"), &schema()).unwrap_err();
        assert!(matches!(err, AppError::ModelUnavailable(_)));
    }

    #[test]
    fn test_corrupt_bytes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        fs::write(&path, b"definitely not an artifact").unwrap();
        assert!(matches!(load_artifact(&path, &schema()), Err(AppError::ArtifactCorrupt(_))));

        // flip a payload byte: checksum no longer matches
        let mut bytes = encode_artifact(&artifact()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(decode_artifact(&bytes, &schema()), Err(AppError::ArtifactCorrupt(_))));
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let bytes = encode_artifact(&artifact()).unwrap();
        let other = FeatureSchema::new(&["only".to_string()]);
        assert!(matches!(decode_artifact(&bytes, &other), Err(AppError::ModelUnavailable(_))));
    }

    #[test]
    fn test_unknown_format_version_rejected() {
        let mut a = artifact();
        a.format_version = ARTIFACT_FORMAT_VERSION + 1;
        let bytes = encode_artifact(&a).unwrap();
        assert!(matches!(decode_artifact(&bytes, &schema()), Err(AppError::ArtifactCorrupt(_))));
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");

        let lock = ArtifactLock::acquire(&path).unwrap();
        assert!(ArtifactLock::lock_path(&path).exists());
        assert!(matches!(ArtifactLock::acquire(&path), Err(AppError::ArtifactLocked(_))));

        drop(lock);
        assert!(!ArtifactLock::lock_path(&path).exists());
        assert!(ArtifactLock::acquire(&path).is_ok());
    }
}
