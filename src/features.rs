use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::{config::FeatureConfig, error::AppError};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const FEATURE_COUNT: usize = 9;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "domain_length",
    "url_length",
    "has_https",
    "has_ip",
    "num_dots",
    "num_hyphens",
    "num_slashes",
    "num_digits",
    "has_suspicious_keywords",
];

/// Dense feature row as seen by the model families.
pub type FeatureRow = [f64; FEATURE_COUNT];

/// Lexical features of one URL, in `FEATURE_NAMES` order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub domain_length: f64,
    pub url_length: f64,
    pub has_https: f64,
    pub has_ip: f64,
    pub num_dots: f64,
    pub num_hyphens: f64,
    pub num_slashes: f64,
    pub num_digits: f64,
    pub has_suspicious_keywords: f64,
}

impl FeatureVector {
    pub fn to_array(&self) -> FeatureRow {
        [
            self.domain_length,
            self.url_length,
            self.has_https,
            self.has_ip,
            self.num_dots,
            self.num_hyphens,
            self.num_slashes,
            self.num_digits,
            self.has_suspicious_keywords,
        ]
    }

    pub fn from_array(v: FeatureRow) -> Self {
        Self {
            domain_length: v[0],
            url_length: v[1],
            has_https: v[2],
            has_ip: v[3],
            num_dots: v[4],
            num_hyphens: v[5],
            num_slashes: v[6],
            num_digits: v[7],
            has_suspicious_keywords: v[8],
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.to_array()[i])
    }
}

/// Identity of the feature layout a model was trained against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub names: Vec<String>,
}

impl FeatureSchema {
    pub fn new(keywords: &[String]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(FEATURE_SCHEMA_VERSION.to_le_bytes());
        for name in FEATURE_NAMES {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([0xffu8]);
        for kw in keywords {
            hasher.update(kw.as_bytes());
            hasher.update([0u8]);
        }

        Self {
            version: FEATURE_SCHEMA_VERSION,
            fingerprint: hex::encode(hasher.finalize()),
            names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_compatible(&self, other: &FeatureSchema) -> bool {
        self.version == other.version && self.fingerprint == other.fingerprint && self.names == other.names
    }
}

/// A URL split into the parts the rules look at.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlRecord {
    pub raw: String,
    pub normalized: String,
    pub scheme: Option<String>,
    pub host: String,
    pub ascii_host: String,
    pub path: String,
    pub parsed: bool,
}

impl UrlRecord {
    pub fn is_https(&self) -> bool {
        self.scheme.as_deref() == Some("https")
    }

    /// Host without IPv6 brackets, used for suffix and label checks.
    pub fn bare_host(&self) -> &str {
        self.ascii_host.trim_start_matches('[').trim_end_matches(']')
    }
}

pub struct FeatureExtractor {
    keywords: Vec<String>,
    schema: FeatureSchema,
    ipv4: Regex,
}

impl FeatureExtractor {
    pub fn new(config: &FeatureConfig) -> Result<Self, AppError> {
        let keywords: Vec<String> = config
            .suspicious_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        let schema = FeatureSchema::new(&keywords);

        let ipv4 = Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$")
            .map_err(|e| AppError::Internal(format!("IPv4 pattern: {}", e)))?;

        Ok(Self {
            keywords,
            schema,
            ipv4,
        })
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn parse(&self, raw: &str) -> UrlRecord {
        let normalized = raw.trim().to_string();

        let (scheme, rest) = match normalized.find("://") {
            Some(idx) if is_valid_scheme(&normalized[..idx]) => (
                Some(normalized[..idx].to_ascii_lowercase()),
                &normalized[idx + 3..],
            ),
            _ => (None, normalized.as_str()),
        };

        let authority_end = rest.find(|c: char| matches!(c, '/' | '?' | '#')).unwrap_or(rest.len());
        let authority = &rest[..authority_end];
        let host_port = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);

        let split_host = if host_port.starts_with('[') {
            match host_port.find(']') {
                Some(end) => &host_port[..=end],
                None => host_port,
            }
        } else {
            host_port.split(':').next().unwrap_or("")
        };

        let after_authority = &rest[authority_end..];
        let path_end = after_authority.find(|c: char| matches!(c, '?' | '#')).unwrap_or(after_authority.len());
        let split_path = &after_authority[..path_end];

        let candidate = match scheme {
            Some(_) => normalized.clone(),
            None => format!("http://{}", normalized),
        };
        let url = Url::parse(&candidate).ok();

        // The WHATWG parser wins over the lexical split whenever it accepts
        // the input, so `http://a\b.com/x` is checked against host `a`.
        let (host, path) = match url.as_ref().and_then(|u| u.host_str().map(|h| (h, u.path()))) {
            Some((h, p)) => (display_host(h), p.to_string()),
            None => (split_host.to_lowercase(), split_path.to_string()),
        };

        let ascii_host = if host.starts_with('[') {
            host.clone()
        } else {
            idna::domain_to_ascii(&host).unwrap_or_else(|_| host.clone())
        };

        let parsed = !host.is_empty() && url.is_some();

        UrlRecord {
            raw: raw.to_string(),
            normalized,
            scheme,
            host,
            ascii_host,
            path,
            parsed,
        }
    }

    pub fn extract(&self, raw: &str) -> FeatureVector {
        self.extract_record(&self.parse(raw))
    }

    /// Unparsable records map to the all-zero vector.
    pub fn extract_record(&self, record: &UrlRecord) -> FeatureVector {
        if !record.parsed {
            return FeatureVector::default();
        }

        let url = record.normalized.as_str();
        let count = |c: char| url.chars().filter(|x| *x == c).count() as f64;

        FeatureVector {
            domain_length: record.host.chars().count() as f64,
            url_length: url.chars().count() as f64,
            has_https: flag(record.is_https()),
            has_ip: flag(self.is_ip_host(&record.host)),
            num_dots: count('.'),
            num_hyphens: count('-'),
            num_slashes: count('/'),
            num_digits: url.chars().filter(|c| c.is_ascii_digit()).count() as f64,
            has_suspicious_keywords: flag(!self.matched_keywords(record).is_empty()),
        }
    }

    pub fn is_ip_host(&self, host: &str) -> bool {
        self.ipv4.is_match(host) || (host.starts_with('[') && host.ends_with(']'))
    }

    /// Configured keywords found in the lower-cased URL, in list order.
    pub fn matched_keywords(&self, record: &UrlRecord) -> Vec<&str> {
        let lowered = record.normalized.to_lowercase();
        self.keywords
            .iter()
            .filter(|k| lowered.contains(k.as_str()))
            .map(|k| k.as_str())
            .collect()
    }
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Lower-cased Unicode form of a parsed host. `Url` hands back punycode for
/// special schemes; domain lengths are counted on the Unicode labels.
fn display_host(host: &str) -> String {
    if host.starts_with('[') {
        return host.to_lowercase();
    }
    let (unicode, result) = idna::domain_to_unicode(host);
    match result {
        Ok(()) => unicode.to_lowercase(),
        Err(_) => host.to_lowercase(),
    }
}

fn is_valid_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
