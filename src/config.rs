use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::AppError;

pub const ENV_PREFIX: &str = "CYBERSIGHT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub features: FeatureConfig,
    pub heuristics: HeuristicConfig,
    pub fusion: FusionConfig,
    pub training: TrainingConfig,
    pub model: ModelConfig,
}

impl Config {
    /// Defaults, then an optional TOML file, then `CYBERSIGHT__SECTION__KEY`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(p) => builder.add_source(config::File::from(p).required(true)),
            None => builder.add_source(config::File::with_name("cybersight").required(false)),
        };

        let cfg: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("features.suspicious_keywords")
                    .with_list_parse_key("heuristics.risky_tlds")
                    .with_list_parse_key("heuristics.trusted_domains")
                    .with_list_parse_key("heuristics.dangerous_extensions")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let f = &self.fusion;
        if !(0.0..=1.0).contains(&f.confidence_floor) {
            return Err(AppError::InvalidInput(format!(
                "fusion.confidence_floor must be in [0,1], got {}",
                f.confidence_floor
            )));
        }
        if !(0.0..=1.0).contains(&f.model_weight) {
            return Err(AppError::InvalidInput(format!(
                "fusion.model_weight must be in [0,1], got {}",
                f.model_weight
            )));
        }
        if !(0..=100).contains(&f.threat_threshold) {
            return Err(AppError::InvalidInput(format!(
                "fusion.threat_threshold must be in [0,100], got {}",
                f.threat_threshold
            )));
        }
        let cuts = [f.risk_medium, f.risk_high, f.risk_critical];
        if cuts.windows(2).any(|w| w[0] > w[1]) {
            return Err(AppError::InvalidInput(
                "fusion risk cut points must be ascending".to_string(),
            ));
        }

        let t = &self.training;
        if !(t.test_ratio > 0.0 && t.test_ratio < 1.0) {
            return Err(AppError::InvalidInput(format!(
                "training.test_ratio must be in (0,1), got {}",
                t.test_ratio
            )));
        }
        if t.cv_folds < 2 {
            return Err(AppError::InvalidInput(
                "training.cv_folds must be at least 2".to_string(),
            ));
        }
        if self.server.max_batch_size == 0 {
            return Err(AppError::InvalidInput(
                "server.max_batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_batch_size: usize,
    pub batch_timeout_ms: u64,
    pub max_url_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            max_batch_size: 1000,
            batch_timeout_ms: 5000,
            max_url_length: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub suspicious_keywords: Vec<String>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        let keywords = [
            "login", "verify", "secure", "account", "update", "confirm", "bank", "banking",
            "paypal", "ebay", "amazon", "apple", "microsoft", "password", "credential", "signin",
            "signup", "auth", "free", "winner", "prize", "claim", "reward", "gift", "urgent",
            "suspended", "locked", "expired", "alert", "hack", "crack", "exploit", "malware",
            "virus", "trojan", "download", "install", "setup", "exe", "zip", "rar",
        ];
        Self {
            suspicious_keywords: keywords.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    pub weights: RuleWeights,
    pub long_url_threshold: f64,
    pub long_domain_threshold: f64,
    pub max_dots: f64,
    pub keyword_cap: i32,
    pub max_percent_escapes: usize,
    /// Hyphens, underscores and dots tolerated in the host.
    pub max_host_special_chars: usize,
    pub brand_similarity: f64,
    pub risky_tlds: Vec<String>,
    pub trusted_domains: Vec<String>,
    pub dangerous_extensions: Vec<String>,
    pub malware_keywords: Vec<String>,
    pub hacking_keywords: Vec<String>,
    /// Brand name to the domains it legitimately operates.
    pub brands: BTreeMap<String, Vec<String>>,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let mut brands = BTreeMap::new();
        brands.insert("paypal".to_string(), owned(&["paypal.com", "paypal.me"]));
        brands.insert("amazon".to_string(), owned(&["amazon.com", "amazon.co.uk", "amazon.de", "amazonaws.com"]));
        brands.insert("apple".to_string(), owned(&["apple.com", "icloud.com"]));
        brands.insert("microsoft".to_string(), owned(&["microsoft.com", "live.com", "office.com", "outlook.com"]));
        brands.insert("google".to_string(), owned(&["google.com", "gmail.com", "youtube.com"]));
        brands.insert("facebook".to_string(), owned(&["facebook.com", "fb.com"]));
        brands.insert("netflix".to_string(), owned(&["netflix.com"]));
        brands.insert("ebay".to_string(), owned(&["ebay.com", "ebay.co.uk"]));

        Self {
            weights: RuleWeights::default(),
            long_url_threshold: 100.0,
            long_domain_threshold: 30.0,
            max_dots: 4.0,
            keyword_cap: 30,
            max_percent_escapes: 5,
            max_host_special_chars: 3,
            brand_similarity: 0.93,
            risky_tlds: owned(&[
                "tk", "ml", "ga", "cf", "gq", "xyz", "top", "click", "download", "zip", "review",
                "country", "kim", "work", "loan",
            ]),
            trusted_domains: owned(&[
                "google.com", "github.com", "microsoft.com", "apple.com", "amazon.com",
                "wikipedia.org", "paypal.com", "youtube.com", "linkedin.com",
            ]),
            dangerous_extensions: owned(&[
                "exe", "scr", "bat", "cmd", "msi", "vbs", "ps1", "jar", "apk", "dll", "com", "pif",
            ]),
            malware_keywords: owned(&[
                "malware", "virus", "trojan", "download", "install", "setup", "exe", "zip", "rar",
            ]),
            hacking_keywords: owned(&["hack", "crack", "exploit"]),
            brands,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleWeights {
    pub no_https: i32,
    pub direct_ip_host: i32,
    pub excessive_length: i32,
    pub long_domain: i32,
    pub excessive_subdomains: i32,
    pub suspicious_keyword: i32,
    pub risky_tld: i32,
    pub brand_impersonation: i32,
    pub dangerous_file_type: i32,
    pub special_characters: i32,
    pub credential_injection: i32,
    pub encoding_abuse: i32,
    pub trusted_domain: i32,
    pub safe_baseline: i32,
}

impl Default for RuleWeights {
    fn default() -> Self {
        Self {
            no_https: 10,
            direct_ip_host: 30,
            excessive_length: 10,
            long_domain: 15,
            excessive_subdomains: 15,
            suspicious_keyword: 10,
            risky_tld: 25,
            brand_impersonation: 30,
            dangerous_file_type: 35,
            special_characters: 10,
            credential_injection: 30,
            encoding_abuse: 15,
            trusted_domain: -30,
            safe_baseline: -10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub confidence_floor: f64,
    pub model_weight: f64,
    /// Heuristic score at which a URL without a usable model stops being safe.
    pub threat_threshold: i32,
    pub risk_medium: f64,
    pub risk_high: f64,
    pub risk_critical: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            confidence_floor: 0.6,
            model_weight: 0.5,
            threat_threshold: 30,
            risk_medium: 0.25,
            risk_high: 0.5,
            risk_critical: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub test_ratio: f64,
    pub seed: u64,
    pub cv_folds: usize,
    pub forest: ForestParams,
    pub boosting: BoostingParams,
    pub linear: LinearParams,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            test_ratio: 0.2,
            seed: 42,
            cv_folds: 5,
            forest: ForestParams::default(),
            boosting: BoostingParams::default(),
            linear: LinearParams::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    /// Features tried per split; `None` means the square root of the arity.
    pub max_features: Option<usize>,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 5,
            max_features: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingParams {
    pub n_rounds: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    pub min_samples_split: usize,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_rounds: 100,
            max_depth: 5,
            learning_rate: 0.1,
            min_samples_split: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearParams {
    pub max_iter: usize,
    pub learning_rate: f64,
    pub l2: f64,
}

impl Default for LinearParams {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            learning_rate: 0.5,
            l2: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub artifact_path: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("models/url_threat_model.bin"),
        }
    }
}
