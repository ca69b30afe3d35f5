use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::{Config, TrainingConfig},
    dataset::LabeledUrl,
    error::{invalid_training_data, AppError},
    evaluation::{cross_validate, evaluate, format_confusion, stratified_split, CrossValidation, EvaluationMetrics},
    features::{FeatureExtractor, FeatureRow, FeatureSchema},
    models::{rank_importances, FeatureImportance, ModelKind, ProbabilisticClassifier, TrainedModel},
    storage::{save_artifact, write_atomic, ArtifactLock, ModelArtifact, ARTIFACT_FORMAT_VERSION},
    types::ThreatCategory,
};

pub const TEXT_REPORT: &str = "training_report.txt";
pub const JSON_REPORT: &str = "training_report.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateReport {
    pub family: ModelKind,
    pub metrics: EvaluationMetrics,
    pub cross_validation: CrossValidation,
    pub importances: Option<Vec<FeatureImportance>>,
    pub fit_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub total: usize,
    pub train: usize,
    pub test: usize,
    pub skipped: usize,
    pub class_counts: BTreeMap<ThreatCategory, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub schema: FeatureSchema,
    pub seed: u64,
    pub test_ratio: f64,
    pub cv_folds: usize,
    pub dataset: DatasetSummary,
    pub candidates: Vec<CandidateReport>,
    pub selected: ModelKind,
}

impl TrainingReport {
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(60);
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "CYBERSIGHT URL THREAT MODEL TRAINING REPORT");
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "Run id:         {}", self.run_id);
        let _ = writeln!(out, "Created at:     {}", self.created_at.to_rfc3339());
        let _ = writeln!(out, "Feature schema: v{} {}", self.schema.version, self.schema.fingerprint);
        let _ = writeln!(out, "Seed:           {}", self.seed);
        let _ = writeln!(out);
        let _ = writeln!(out, "Dataset");
        let _ = writeln!(
            out,
            "  total {} | train {} | test {} | skipped {}",
            self.dataset.total, self.dataset.train, self.dataset.test, self.dataset.skipped
        );
        for (category, count) in &self.dataset.class_counts {
            let _ = writeln!(out, "  {:<10} {}", category.as_str(), count);
        }

        for candidate in &self.candidates {
            let m = &candidate.metrics;
            let cv = &candidate.cross_validation;
            let marker = if candidate.family == self.selected { "  [selected]" } else { "" };
            let _ = writeln!(out);
            let _ = writeln!(out, "{}{}", candidate.family, marker);
            let _ = writeln!(out, "{}", "-".repeat(40));
            let _ = writeln!(out, "  Accuracy:  {:.4}", m.accuracy);
            let _ = writeln!(out, "  Precision: {:.4}", m.precision);
            let _ = writeln!(out, "  Recall:    {:.4}", m.recall);
            let _ = writeln!(out, "  F1:        {:.4}", m.f1);
            let _ = writeln!(out, "  CV ({} folds): {:.4} +/- {:.4}", cv.folds, cv.mean, cv.std);
            let _ = writeln!(out, "  Fit time:  {:.2}s", candidate.fit_seconds);
            let _ = writeln!(out, "  Confusion matrix (rows = truth):");
            for line in format_confusion(&m.confusion).lines() {
                let _ = writeln!(out, "    {}", line);
            }
            if let Some(importances) = &candidate.importances {
                let _ = writeln!(out, "  Feature importance:");
                for fi in importances {
                    let _ = writeln!(out, "    {:<26} {:.4}", fi.feature, fi.importance);
                }
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Selected model: {}", self.selected);
        out
    }
}

pub struct TrainingOutcome {
    pub artifact: ModelArtifact,
    pub report: TrainingReport,
}

pub struct Trainer {
    config: TrainingConfig,
    extractor: FeatureExtractor,
}

impl Trainer {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        Ok(Self {
            config: config.training.clone(),
            extractor: FeatureExtractor::new(&config.features)?,
        })
    }

    /// Fits every candidate family and picks one. Touches no files.
    pub fn fit(&self, examples: &[LabeledUrl], skipped: usize) -> Result<TrainingOutcome, AppError> {
        if examples.is_empty() {
            return Err(invalid_training_data("dataset is empty"));
        }

        let mut rows: Vec<FeatureRow> = Vec::with_capacity(examples.len());
        let mut labels: Vec<usize> = Vec::with_capacity(examples.len());
        let mut unparsable = 0;
        for ex in examples {
            let record = self.extractor.parse(&ex.url);
            if !record.parsed {
                unparsable += 1;
                continue;
            }
            rows.push(self.extractor.extract_record(&record).to_array());
            labels.push(ex.label.index());
        }
        if unparsable > 0 {
            warn!("Dropped {} unparsable URLs from the training set", unparsable);
        }

        let mut class_counts = BTreeMap::new();
        for &y in &labels {
            if let Some(category) = ThreatCategory::from_index(y) {
                *class_counts.entry(category).or_insert(0usize) += 1;
            }
        }
        if class_counts.len() < 2 {
            return Err(invalid_training_data(format!(
                "need at least two classes, found {}",
                class_counts.len()
            )));
        }

        let (train_idx, test_idx) = stratified_split(&labels, self.config.test_ratio, self.config.seed);
        if test_idx.is_empty() {
            return Err(invalid_training_data("test partition is empty"));
        }
        if train_idx.len() < self.config.cv_folds {
            return Err(invalid_training_data(format!(
                "{} training rows is fewer than {} cross-validation folds",
                train_idx.len(),
                self.config.cv_folds
            )));
        }

        let train_rows: Vec<FeatureRow> = train_idx.iter().map(|&i| rows[i]).collect();
        let train_labels: Vec<usize> = train_idx.iter().map(|&i| labels[i]).collect();
        let test_rows: Vec<FeatureRow> = test_idx.iter().map(|&i| rows[i]).collect();
        let test_labels: Vec<usize> = test_idx.iter().map(|&i| labels[i]).collect();

        info!(
            "Training on {} rows, evaluating on {} rows",
            train_rows.len(),
            test_rows.len()
        );

        let mut candidates: Vec<(CandidateReport, TrainedModel)> = Vec::with_capacity(ModelKind::ALL.len());
        for kind in ModelKind::ALL {
            let start = Instant::now();
            let model = kind.fit(&train_rows, &train_labels, &self.config);
            let predicted: Vec<usize> = test_rows
                .iter()
                .map(|r| model.predict_row(r).argmax().0.index())
                .collect();
            let metrics = evaluate(&test_labels, &predicted);
            let cross_validation = cross_validate(kind, &train_rows, &train_labels, &self.config);
            let fit_seconds = start.elapsed().as_secs_f64();

            info!(
                "{}: accuracy {:.4}, f1 {:.4}, cv {:.4} +/- {:.4}",
                kind, metrics.accuracy, metrics.f1, cross_validation.mean, cross_validation.std
            );

            candidates.push((
                CandidateReport {
                    family: kind,
                    importances: model.feature_importances().map(|v| rank_importances(&v)),
                    metrics,
                    cross_validation,
                    fit_seconds,
                },
                model,
            ));
        }

        let best = select_best(candidates.iter().map(|(c, _)| c));
        let (selected, model) = candidates
            .get(best)
            .map(|(c, m)| (c.clone(), m.clone()))
            .ok_or_else(|| AppError::Internal("no candidate models".to_string()))?;

        info!("Selected {} (cv {:.4})", selected.family, selected.cross_validation.mean);

        let run_id = Uuid::new_v4();
        let created_at = Utc::now();
        let schema = self.extractor.schema().clone();

        let report = TrainingReport {
            run_id,
            created_at,
            schema: schema.clone(),
            seed: self.config.seed,
            test_ratio: self.config.test_ratio,
            cv_folds: self.config.cv_folds,
            dataset: DatasetSummary {
                total: labels.len(),
                train: train_idx.len(),
                test: test_idx.len(),
                skipped: skipped + unparsable,
                class_counts,
            },
            candidates: candidates.into_iter().map(|(c, _)| c).collect(),
            selected: selected.family,
        };

        let artifact = ModelArtifact {
            format_version: ARTIFACT_FORMAT_VERSION,
            schema,
            created_at,
            run_id,
            family: selected.family,
            metrics: selected.metrics,
            cross_validation: selected.cross_validation,
            importances: selected.importances,
            model,
        };

        Ok(TrainingOutcome { artifact, report })
    }

    /// Fits under the artifact lock, then writes the artifact and both
    /// reports next to it. Invalid data fails before anything is written.
    pub fn train_and_save(
        &self,
        examples: &[LabeledUrl],
        skipped: usize,
        artifact_path: &Path,
    ) -> Result<TrainingOutcome, AppError> {
        let _lock = ArtifactLock::acquire(artifact_path)?;
        let outcome = self.fit(examples, skipped)?;

        save_artifact(artifact_path, &outcome.artifact)?;

        let dir = report_dir(artifact_path);
        write_atomic(&dir.join(TEXT_REPORT), outcome.report.to_text().as_bytes())?;
        write_atomic(&dir.join(JSON_REPORT), &serde_json::to_vec_pretty(&outcome.report)?)?;
        info!("Wrote training reports to {}", dir.display());

        Ok(outcome)
    }
}

fn report_dir(artifact_path: &Path) -> PathBuf {
    artifact_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Highest CV mean, then highest test F1, then earliest candidate.
fn select_best<'a>(candidates: impl Iterator<Item = &'a CandidateReport>) -> usize {
    let mut best: Option<(usize, f64, f64)> = None;
    for (i, c) in candidates.enumerate() {
        let key = (c.cross_validation.mean, c.metrics.f1);
        let better = match best {
            None => true,
            Some((_, cv, f1)) => key.0 > cv || (key.0 == cv && key.1 > f1),
        };
        if better {
            best = Some((i, key.0, key.1));
        }
    }
    best.map_or(0, |(i, _, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BoostingParams, ForestParams, LinearParams},
        dataset::synthetic,
        storage::load_artifact,
    };

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.training.forest = ForestParams {
            n_trees: 10,
            max_depth: 6,
            min_samples_split: 2,
            max_features: None,
        };
        config.training.boosting = BoostingParams {
            n_rounds: 15,
            learning_rate: 0.3,
            ..BoostingParams::default()
        };
        config.training.linear = LinearParams {
            max_iter: 200,
            ..LinearParams::default()
        };
        config.training.cv_folds = 3;
        config
    }

    fn candidate(family: ModelKind, cv: f64, f1: f64) -> CandidateReport {
        CandidateReport {
            family,
            metrics: EvaluationMetrics {
                accuracy: f1,
                precision: f1,
                recall: f1,
                f1,
                confusion: vec![vec![0; 4]; 4],
                support: vec![0; 4],
            },
            cross_validation: CrossValidation {
                folds: 3,
                scores: vec![cv; 3],
                mean: cv,
                std: 0.0,
            },
            importances: None,
            fit_seconds: 0.0,
        }
    }

    #[test]
    fn test_selection_tie_breaks() {
        let c = vec![
            candidate(ModelKind::RandomForest, 0.9, 0.8),
            candidate(ModelKind::GradientBoosting, 0.9, 0.85),
            candidate(ModelKind::LogisticRegression, 0.9, 0.85),
        ];
        assert_eq!(select_best(c.iter()), 1);

        let c = vec![
            candidate(ModelKind::RandomForest, 0.8, 0.99),
            candidate(ModelKind::GradientBoosting, 0.95, 0.5),
        ];
        assert_eq!(select_best(c.iter()), 1);
    }

    #[test]
    fn test_fit_on_synthetic_data() {
        let trainer = Trainer::new(&fast_config()).unwrap();
        let outcome = trainer.fit(&synthetic(120, 42), 0).unwrap();

        assert_eq!(outcome.report.candidates.len(), 3);
        assert_eq!(outcome.report.dataset.total, 120);
        assert_eq!(outcome.report.dataset.test, 24);
        assert!(outcome.artifact.metrics.accuracy > 0.9);
        assert_eq!(outcome.artifact.family, outcome.report.selected);

        let text = outcome.report.to_text();
        assert!(text.contains("[selected]"));
        assert!(text.contains("Random Forest"));
    }

    #[test]
    fn test_fit_is_deterministic() {
        let trainer = Trainer::new(&fast_config()).unwrap();
        let data = synthetic(80, 3);
        let a = trainer.fit(&data, 0).unwrap();
        let b = trainer.fit(&data, 0).unwrap();
        assert_eq!(a.report.selected, b.report.selected);
        for (x, y) in a.report.candidates.iter().zip(&b.report.candidates) {
            assert_eq!(x.metrics, y.metrics);
            assert_eq!(x.cross_validation, y.cross_validation);
        }
    }

    #[test]
    fn test_invalid_data_rejected() {
        let trainer = Trainer::new(&fast_config()).unwrap();

        assert!(matches!(trainer.fit(&[], 0), Err(AppError::TrainingDataInvalid(_))));

        let single: Vec<LabeledUrl> = (0..20)
            .map(|i| LabeledUrl::new(format!("https://site{}.example.org/", i), ThreatCategory::Safe))
            .collect();
        assert!(matches!(trainer.fit(&single, 0), Err(AppError::TrainingDataInvalid(_))));

        let tiny = vec![
            LabeledUrl::new("https://example.org/", ThreatCategory::Safe),
            LabeledUrl::new("https://example.com/", ThreatCategory::Safe),
            LabeledUrl::new("http://10.0.0.1/login", ThreatCategory::Phishing),
            LabeledUrl::new("http://10.0.0.2/login", ThreatCategory::Phishing),
        ];
        assert!(matches!(trainer.fit(&tiny, 0), Err(AppError::TrainingDataInvalid(_))));
    }

    #[test]
    fn test_train_and_save_writes_artifact_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let config = fast_config();
        let trainer = Trainer::new(&config).unwrap();

        let outcome = trainer.train_and_save(&synthetic(80, 5), 0, &path).unwrap();
        let loaded = load_artifact(&path, trainer.extractor.schema()).unwrap();
        assert_eq!(loaded.run_id, outcome.artifact.run_id);
        assert!(dir.path().join(TEXT_REPORT).exists());

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join(JSON_REPORT)).unwrap()).unwrap();
        assert_eq!(json["candidates"].as_array().unwrap().len(), 3);
        assert!(!ArtifactLock::lock_path(&path).exists());
    }

    #[test]
    fn test_failed_training_leaves_artifact_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let trainer = Trainer::new(&fast_config()).unwrap();
        trainer.train_and_save(&synthetic(80, 5), 0, &path).unwrap();
        let before = std::fs::read(&path).unwrap();

        assert!(trainer.train_and_save(&[], 0, &path).is_err());
        let single = vec![LabeledUrl::new("https://example.org/", ThreatCategory::Safe); 10];
        assert!(trainer.train_and_save(&single, 0, &path).is_err());

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_concurrent_run_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let trainer = Trainer::new(&fast_config()).unwrap();

        let _held = ArtifactLock::acquire(&path).unwrap();
        assert!(matches!(
            trainer.train_and_save(&synthetic(40, 1), 0, &path),
            Err(AppError::ArtifactLocked(_))
        ));
        assert!(!path.exists());
    }
}
