use serde::{Deserialize, Serialize};
use std::fmt;

use crate::features::FeatureVector;

pub const CATEGORY_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatCategory {
    Safe,
    Phishing,
    Malware,
    Hacking,
}

impl ThreatCategory {
    /// Declaration order; also the tie-break order for arg-max.
    pub const ALL: [ThreatCategory; CATEGORY_COUNT] = [
        ThreatCategory::Safe,
        ThreatCategory::Phishing,
        ThreatCategory::Malware,
        ThreatCategory::Hacking,
    ];

    pub fn index(self) -> usize {
        match self {
            ThreatCategory::Safe => 0,
            ThreatCategory::Phishing => 1,
            ThreatCategory::Malware => 2,
            ThreatCategory::Hacking => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::Safe => "safe",
            ThreatCategory::Phishing => "phishing",
            ThreatCategory::Malware => "malware",
            ThreatCategory::Hacking => "hacking",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "safe" | "benign" | "legitimate" => Some(ThreatCategory::Safe),
            "phishing" => Some(ThreatCategory::Phishing),
            "malware" => Some(ThreatCategory::Malware),
            "hacking" => Some(ThreatCategory::Hacking),
            _ => None,
        }
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low",
            RiskLevel::Medium => "Medium",
            RiskLevel::High => "High",
            RiskLevel::Critical => "Critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Probability distribution over the four threat categories.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassProbabilities {
    pub safe: f64,
    pub phishing: f64,
    pub malware: f64,
    pub hacking: f64,
}

impl ClassProbabilities {
    pub fn from_array(values: [f64; CATEGORY_COUNT]) -> Self {
        Self {
            safe: values[0],
            phishing: values[1],
            malware: values[2],
            hacking: values[3],
        }
    }

    /// Normalizes non-negative weights into a distribution. All-zero input
    /// becomes uniform.
    pub fn normalized(values: [f64; CATEGORY_COUNT]) -> Self {
        let clean = values.map(|v| if v.is_finite() && v > 0.0 { v } else { 0.0 });
        let total: f64 = clean.iter().sum();
        if total <= 0.0 {
            return Self::from_array([1.0 / CATEGORY_COUNT as f64; CATEGORY_COUNT]);
        }
        Self::from_array(clean.map(|v| v / total))
    }

    pub fn as_array(&self) -> [f64; CATEGORY_COUNT] {
        [self.safe, self.phishing, self.malware, self.hacking]
    }

    /// Highest-probability category; ties resolve to the earlier category.
    pub fn argmax(&self) -> (ThreatCategory, f64) {
        let values = self.as_array();
        let mut best = 0;
        for i in 1..CATEGORY_COUNT {
            if values[i] > values[best] {
                best = i;
            }
        }
        (ThreatCategory::ALL[best], values[best])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Model,
    Heuristics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleId {
    NoHttps,
    DirectIpHost,
    ExcessiveLength,
    LongDomain,
    ExcessiveSubdomains,
    SuspiciousKeyword,
    RiskyTld,
    BrandImpersonation,
    DangerousFileType,
    SpecialCharacters,
    CredentialInjection,
    EncodingAbuse,
    TrustedDomain,
    SafeBaseline,
}

impl RuleId {
    pub fn title(&self) -> &'static str {
        match self {
            RuleId::NoHttps => "No HTTPS",
            RuleId::DirectIpHost => "Direct IP host",
            RuleId::ExcessiveLength => "Excessive length",
            RuleId::LongDomain => "Long domain",
            RuleId::ExcessiveSubdomains => "Excessive subdomains",
            RuleId::SuspiciousKeyword => "Suspicious keyword present",
            RuleId::RiskyTld => "Risky TLD",
            RuleId::BrandImpersonation => "Brand impersonation",
            RuleId::DangerousFileType => "Dangerous file type",
            RuleId::SpecialCharacters => "Multiple special characters",
            RuleId::CredentialInjection => "Credential injection",
            RuleId::EncodingAbuse => "Excessive URL encoding",
            RuleId::TrustedDomain => "Trusted domain",
            RuleId::SafeBaseline => "Safe baseline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicFinding {
    pub rule: RuleId,
    pub title: String,
    pub weight: i32,
    pub description: String,
    pub hint: ThreatCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub url: String,
    pub category: ThreatCategory,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub confidence: f64,
    pub source: DecisionSource,
    pub heuristic_score: i32,
    pub findings: Vec<HeuristicFinding>,
    pub probabilities: Option<ClassProbabilities>,
    pub features: FeatureVector,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    MalformedInput,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub url: String,
    pub kind: ItemErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
    Ok { verdict: Verdict },
    Error { error: ItemError },
}

impl BatchItem {
    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            BatchItem::Ok { verdict } => Some(verdict),
            BatchItem::Error { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, BatchItem::Error { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmax_tie_prefers_declaration_order() {
        let probs = ClassProbabilities::from_array([0.4, 0.4, 0.1, 0.1]);
        assert_eq!(probs.argmax().0, ThreatCategory::Safe);

        let probs = ClassProbabilities::from_array([0.1, 0.2, 0.35, 0.35]);
        assert_eq!(probs.argmax().0, ThreatCategory::Malware);
    }

    #[test]
    fn test_normalized_handles_zero_mass() {
        let probs = ClassProbabilities::normalized([0.0; CATEGORY_COUNT]);
        assert!((probs.safe - 0.25).abs() < 1e-12);

        let probs = ClassProbabilities::normalized([2.0, 2.0, 0.0, 0.0]);
        assert!((probs.phishing - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(ThreatCategory::parse(" Phishing "), Some(ThreatCategory::Phishing));
        assert_eq!(ThreatCategory::parse("benign"), Some(ThreatCategory::Safe));
        assert_eq!(ThreatCategory::parse("spam"), None);
        for category in ThreatCategory::ALL {
            assert_eq!(ThreatCategory::from_index(category.index()), Some(category));
        }
    }

    #[test]
    fn test_batch_item_serializes_with_status_tag() {
        let item = BatchItem::Error {
            error: ItemError {
                url: "http://".to_string(),
                kind: ItemErrorKind::MalformedInput,
                message: "empty host".to_string(),
            },
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["kind"], "malformed_input");
    }
}
