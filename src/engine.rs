use rayon::prelude::*;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{
    classifier::{Classifier, ModelStatus},
    config::{Config, FusionConfig, ServerConfig},
    error::{malformed, AppError},
    features::FeatureExtractor,
    heuristics::{HeuristicEngine, HeuristicReport},
    types::*,
};

/// Immutable after construction; share it behind an `Arc`.
pub struct ThreatEngine {
    extractor: FeatureExtractor,
    heuristics: HeuristicEngine,
    classifier: Classifier,
    fusion: FusionConfig,
    limits: ServerConfig,
}

struct Decision {
    category: ThreatCategory,
    confidence: f64,
    source: DecisionSource,
    risk_score: f64,
}

impl ThreatEngine {
    /// Builds the engine and loads the configured artifact. A missing or
    /// unusable artifact yields a heuristic-only engine.
    pub fn new(config: &Config) -> Result<Self, AppError> {
        info!("Initializing threat engine...");
        let extractor = FeatureExtractor::new(&config.features)?;
        let classifier = Classifier::load(&config.model.artifact_path, extractor.schema());
        let engine = Self::assemble(config, extractor, classifier);
        info!(
            "Threat engine initialized (model {})",
            if engine.classifier.is_available() { "available" } else { "unavailable" }
        );
        Ok(engine)
    }

    pub fn with_classifier(config: &Config, classifier: Classifier) -> Result<Self, AppError> {
        let extractor = FeatureExtractor::new(&config.features)?;
        Ok(Self::assemble(config, extractor, classifier))
    }

    fn assemble(config: &Config, extractor: FeatureExtractor, classifier: Classifier) -> Self {
        Self {
            extractor,
            heuristics: HeuristicEngine::new(&config.heuristics),
            classifier,
            fusion: config.fusion.clone(),
            limits: config.server.clone(),
        }
    }

    pub fn model_status(&self) -> ModelStatus {
        self.classifier.status()
    }

    pub fn max_batch_size(&self) -> usize {
        self.limits.max_batch_size
    }

    pub fn classify(&self, url: &str) -> Result<Verdict, AppError> {
        let start = Instant::now();
        let result = self.classify_inner(url);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(verdict) => {
                metrics::counter!(
                    "verdicts_total",
                    "category" => verdict.category.as_str(),
                    "source" => source_label(verdict.source)
                )
                .increment(1);
                metrics::histogram!("classify_duration_ms").record(elapsed_ms);
                debug!(
                    "Classified {} as {} ({:?}, risk {:.2}) in {:.3}ms",
                    verdict.url, verdict.category, verdict.source, verdict.risk_score, elapsed_ms
                );
            }
            Err(e) => {
                metrics::counter!("classify_errors_total").increment(1);
                debug!("Rejected input {:?}: {}", url, e);
            }
        }
        result
    }

    fn classify_inner(&self, url: &str) -> Result<Verdict, AppError> {
        let trimmed = url.trim();
        if trimmed.is_empty() {
            return Err(malformed("URL is empty"));
        }
        if trimmed.chars().count() > self.limits.max_url_length {
            return Err(malformed(format!(
                "URL exceeds {} characters",
                self.limits.max_url_length
            )));
        }

        let record = self.extractor.parse(trimmed);
        if !record.parsed {
            return Err(malformed(format!("cannot parse URL {:?}", trimmed)));
        }

        let features = self.extractor.extract_record(&record);
        let report = self.heuristics.evaluate(&self.extractor, &record, &features);
        let probabilities = self.classifier.predict(&features);
        let decision = self.fuse(&report, probabilities.as_ref());
        let risk_level = self.risk_level(decision.risk_score);

        Ok(Verdict {
            url: record.normalized,
            category: decision.category,
            risk_level,
            risk_score: decision.risk_score,
            confidence: decision.confidence,
            source: decision.source,
            heuristic_score: report.score,
            recommendations: recommendations(decision.category, risk_level),
            findings: report.findings,
            probabilities,
            features,
        })
    }

    /// Classifies each URL independently on the rayon pool. Output order
    /// matches input order; items not started before the batch deadline
    /// become `timeout` errors.
    pub fn classify_batch(&self, urls: &[String]) -> Vec<BatchItem> {
        let deadline = Instant::now() + Duration::from_millis(self.limits.batch_timeout_ms);

        let items: Vec<BatchItem> = urls
            .par_iter()
            .map(|url| {
                if Instant::now() >= deadline {
                    return BatchItem::Error {
                        error: ItemError {
                            url: url.clone(),
                            kind: ItemErrorKind::Timeout,
                            message: "batch deadline expired before this URL was classified".to_string(),
                        },
                    };
                }
                match self.classify(url) {
                    Ok(verdict) => BatchItem::Ok { verdict },
                    Err(e) => BatchItem::Error {
                        error: ItemError {
                            url: url.clone(),
                            kind: ItemErrorKind::MalformedInput,
                            message: e.to_string(),
                        },
                    },
                }
            })
            .collect();

        let failed = items.iter().filter(|i| i.is_error()).count();
        if failed > 0 {
            warn!("Batch of {} URLs finished with {} error items", urls.len(), failed);
        }
        items
    }

    fn fuse(&self, report: &HeuristicReport, probabilities: Option<&ClassProbabilities>) -> Decision {
        let heuristic_risk = report.score.clamp(0, 100) as f64 / 100.0;

        let risk_score = match probabilities {
            Some(p) => {
                let w = self.fusion.model_weight;
                (1.0 - w) * heuristic_risk + w * (1.0 - p.safe)
            }
            None => heuristic_risk,
        }
        .clamp(0.0, 1.0);

        if let Some(p) = probabilities {
            let (category, top) = p.argmax();
            if top >= self.fusion.confidence_floor {
                return Decision {
                    category,
                    confidence: top,
                    source: DecisionSource::Model,
                    risk_score,
                };
            }
        }

        Decision {
            category: self.fallback_category(report),
            confidence: (0.5 + (heuristic_risk - 0.5).abs()).min(0.95),
            source: DecisionSource::Heuristics,
            risk_score,
        }
    }

    /// Any non-safe score takes the dominant finding's Malware or Hacking
    /// hint, and phishing otherwise.
    fn fallback_category(&self, report: &HeuristicReport) -> ThreatCategory {
        if report.score.clamp(0, 100) < self.fusion.threat_threshold {
            return ThreatCategory::Safe;
        }
        match report.dominant().map(|f| f.hint) {
            Some(hint @ (ThreatCategory::Malware | ThreatCategory::Hacking)) => hint,
            _ => ThreatCategory::Phishing,
        }
    }

    fn risk_level(&self, risk_score: f64) -> RiskLevel {
        if risk_score < self.fusion.risk_medium {
            RiskLevel::Low
        } else if risk_score < self.fusion.risk_high {
            RiskLevel::Medium
        } else if risk_score < self.fusion.risk_critical {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

fn source_label(source: DecisionSource) -> &'static str {
    match source {
        DecisionSource::Model => "model",
        DecisionSource::Heuristics => "heuristics",
    }
}

fn recommendations(category: ThreatCategory, risk: RiskLevel) -> Vec<String> {
    let mut lines: Vec<&str> = Vec::new();

    match risk {
        RiskLevel::Low if category == ThreatCategory::Safe => {
            lines.push("This URL appears to be safe to visit");
            lines.push("Always verify you're on the correct website before entering sensitive information");
        }
        RiskLevel::Low | RiskLevel::Medium => {
            lines.push("Exercise caution before visiting this URL");
            lines.push("Verify the URL carefully before clicking");
            lines.push("Do not enter personal or financial information");
            lines.push("Consider using a URL scanner service for additional verification");
        }
        RiskLevel::High | RiskLevel::Critical => {
            lines.push("DO NOT visit this URL");
            lines.push("This URL shows multiple indicators of malicious activity");
            match category {
                ThreatCategory::Phishing => {
                    lines.push("This appears to be a phishing attempt to steal your credentials");
                    lines.push("Report this URL to your IT department or anti-phishing services");
                }
                ThreatCategory::Malware => {
                    lines.push("This URL may attempt to download malware to your device");
                    lines.push("Ensure your antivirus software is up to date");
                }
                ThreatCategory::Hacking => {
                    lines.push("This URL is associated with hacking tools or activities");
                    lines.push("Report this URL to cybersecurity authorities");
                }
                ThreatCategory::Safe => {
                    lines.push("Do not enter personal or financial information");
                }
            }
            if risk == RiskLevel::Critical {
                lines.push("If you've already visited this URL, scan your device for malware");
            }
        }
    }

    lines.into_iter().map(String::from).collect()
}
