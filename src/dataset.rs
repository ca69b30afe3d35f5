use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::{error::AppError, types::ThreatCategory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledUrl {
    pub url: String,
    pub label: ThreatCategory,
}

impl LabeledUrl {
    pub fn new(url: impl Into<String>, label: ThreatCategory) -> Self {
        Self {
            url: url.into(),
            label,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub examples: Vec<LabeledUrl>,
    pub skipped: usize,
}

impl Dataset {
    pub fn class_counts(&self) -> [usize; 4] {
        let mut counts = [0; 4];
        for ex in &self.examples {
            counts[ex.label.index()] += 1;
        }
        counts
    }
}

#[derive(Deserialize)]
struct JsonRecord {
    url: String,
    label: String,
}

/// Parses JSON Lines (`{"url": ..., "label": ...}`) or `url,label` text.
/// Blank lines, `#` comments and a leading `url,label` header are ignored;
/// any other unusable line is counted in `skipped`.
pub fn parse_dataset(text: &str) -> Dataset {
    let mut dataset = Dataset::default();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed = if line.starts_with('{') {
            serde_json::from_str::<JsonRecord>(line)
                .ok()
                .map(|r| (r.url, r.label))
        } else {
            line.rsplit_once(',')
                .map(|(url, label)| (url.trim().to_string(), label.trim().to_string()))
        };

        match parsed {
            Some((url, label)) if lineno == 0 && url.eq_ignore_ascii_case("url") && label.eq_ignore_ascii_case("label") => {}
            Some((url, label)) => match ThreatCategory::parse(&label) {
                Some(category) if !url.trim().is_empty() => {
                    dataset.examples.push(LabeledUrl::new(url.trim(), category));
                }
                _ => {
                    warn!("Skipping dataset line {}: unusable label {:?}", lineno + 1, label);
                    dataset.skipped += 1;
                }
            },
            None => {
                warn!("Skipping dataset line {}: not a url,label pair", lineno + 1);
                dataset.skipped += 1;
            }
        }
    }

    dataset
}

pub fn load_dataset(path: &Path) -> Result<Dataset, AppError> {
    let text = std::fs::read_to_string(path)?;
    let dataset = parse_dataset(&text);
    info!(
        "Loaded {} labeled URLs from {} ({} skipped)",
        dataset.examples.len(),
        path.display(),
        dataset.skipped
    );
    Ok(dataset)
}

const SAFE_DOMAINS: &[&str] = &[
    "google.com", "microsoft.com", "apple.com", "amazon.com", "facebook.com", "github.com",
    "linkedin.com", "twitter.com", "wikipedia.org", "example.org",
];
const SAFE_PATHS: &[&str] = &["", "home", "products", "about", "contact", "docs/intro", "news"];
const PHISH_PATHS: &[&str] = &[
    "login-verify-account",
    "secure-login",
    "account/update-confirm",
    "signin-verify",
    "banking/login",
];
const BRANDS: &[&str] = &["paypal", "bank", "apple", "amazon", "netflix"];
const MALWARE_HOSTS: &[&str] = &["cdn", "files", "mirror", "dl", "static"];
const MALWARE_FILES: &[&str] = &["setup", "installer", "update", "player", "crack"];
const MALWARE_EXTS: &[&str] = &["exe", "scr", "msi", "bat"];
const HACKING_WORDS: &[&str] = &["root", "shell", "zero", "dark", "warez", "pwn"];

/// Balanced, seeded sample of labeled URLs whose categories differ in
/// their lexical profile.
pub fn synthetic(count: usize, seed: u64) -> Vec<LabeledUrl> {
    let mut rng = StdRng::seed_from_u64(seed);
    let pick = |rng: &mut StdRng, items: &[&'static str]| -> &'static str {
        items.choose(rng).copied().unwrap_or_default()
    };

    (0..count)
        .map(|i| {
            let label = ThreatCategory::ALL[i % ThreatCategory::ALL.len()];
            let url = match label {
                ThreatCategory::Safe => {
                    format!("https://{}/{}", pick(&mut rng, SAFE_DOMAINS), pick(&mut rng, SAFE_PATHS))
                }
                ThreatCategory::Phishing => {
                    if rng.gen_bool(0.5) {
                        format!(
                            "http://192.168.{}.{}/{}",
                            rng.gen_range(0..=255),
                            rng.gen_range(1..=254),
                            pick(&mut rng, PHISH_PATHS)
                        )
                    } else {
                        format!(
                            "http://10.{}.{}.{}/{}-{}",
                            rng.gen_range(0..=255),
                            rng.gen_range(0..=255),
                            rng.gen_range(1..=254),
                            pick(&mut rng, BRANDS),
                            pick(&mut rng, PHISH_PATHS)
                        )
                    }
                }
                ThreatCategory::Malware => format!(
                    "http://{}{}.free-files.net/downloads/{}{}.{}",
                    pick(&mut rng, MALWARE_HOSTS),
                    rng.gen_range(1..=9),
                    pick(&mut rng, MALWARE_FILES),
                    rng.gen_range(10..=99),
                    pick(&mut rng, MALWARE_EXTS)
                ),
                ThreatCategory::Hacking => format!(
                    "http://{}-{}-{}-{}{}.xyz/{}{}",
                    pick(&mut rng, HACKING_WORDS),
                    rng.gen_range(100..=999),
                    pick(&mut rng, HACKING_WORDS),
                    rng.gen_range(10..=99),
                    pick(&mut rng, HACKING_WORDS),
                    rng.gen_range(1000..=9999),
                    rng.gen_range(10..=99)
                ),
            };
            LabeledUrl::new(url, label)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jsonl_and_csv() {
        let text = r#"url,label
https://example.org/,safe
{"url": "http://10.0.0.5/login", "label": "Phishing"}

# comment
http://x.test/a,b.exe,malware
http://bad.test/,spam
not-a-pair
"#;
        let ds = parse_dataset(text);
        assert_eq!(ds.examples.len(), 3);
        assert_eq!(ds.examples[1].label, ThreatCategory::Phishing);
        // the last comma separates the label
        assert_eq!(ds.examples[2].url, "http://x.test/a,b.exe");
        assert_eq!(ds.skipped, 2);
    }

    #[test]
    fn test_load_dataset_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.csv");
        std::fs::write(&path, "https://github.com/,safe\nhttp://1.2.3.4/x,hacking\n").unwrap();
        let ds = load_dataset(&path).unwrap();
        assert_eq!(ds.class_counts(), [1, 0, 0, 1]);

        assert!(matches!(load_dataset(&dir.path().join("missing.csv")), Err(AppError::Io(_))));
    }

    #[test]
    fn test_synthetic_is_balanced_and_seeded() {
        let a = synthetic(40, 7);
        let b = synthetic(40, 7);
        assert_eq!(a, b);
        let ds = Dataset {
            examples: a,
            skipped: 0,
        };
        assert_eq!(ds.class_counts(), [10, 10, 10, 10]);
        assert_ne!(synthetic(40, 8), b);
    }
}
