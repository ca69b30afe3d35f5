use std::collections::HashSet;

use crate::{
    config::HeuristicConfig,
    features::{FeatureExtractor, FeatureVector, UrlRecord},
    types::{HeuristicFinding, RuleId, ThreatCategory},
};

#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicReport {
    pub findings: Vec<HeuristicFinding>,
    pub score: i32,
}

impl HeuristicReport {
    /// Finding with the largest positive weight; the earliest rule wins ties.
    pub fn dominant(&self) -> Option<&HeuristicFinding> {
        let mut best: Option<&HeuristicFinding> = None;
        for finding in self.findings.iter().filter(|f| f.weight > 0) {
            match best {
                Some(b) if finding.weight <= b.weight => {}
                _ => best = Some(finding),
            }
        }
        best
    }

    pub fn fired(&self, rule: RuleId) -> bool {
        self.findings.iter().any(|f| f.rule == rule)
    }
}

pub struct HeuristicEngine {
    config: HeuristicConfig,
    risky_tlds: HashSet<String>,
    dangerous_extensions: HashSet<String>,
    malware_keywords: HashSet<String>,
    hacking_keywords: HashSet<String>,
}

impl HeuristicEngine {
    pub fn new(config: &HeuristicConfig) -> Self {
        let lowered = |items: &[String]| -> HashSet<String> {
            items
                .iter()
                .map(|s| s.trim().trim_start_matches('.').to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };

        Self {
            risky_tlds: lowered(&config.risky_tlds),
            dangerous_extensions: lowered(&config.dangerous_extensions),
            malware_keywords: lowered(&config.malware_keywords),
            hacking_keywords: lowered(&config.hacking_keywords),
            config: config.clone(),
        }
    }

    /// Runs every rule in declaration order. No rule short-circuits another.
    pub fn evaluate(
        &self,
        extractor: &FeatureExtractor,
        record: &UrlRecord,
        features: &FeatureVector,
    ) -> HeuristicReport {
        let w = &self.config.weights;
        let mut findings = Vec::new();

        if features.has_https == 0.0 {
            findings.push(finding(
                RuleId::NoHttps,
                w.no_https,
                "URL does not use HTTPS encryption".to_string(),
                ThreatCategory::Phishing,
            ));
        }

        if features.has_ip == 1.0 {
            findings.push(finding(
                RuleId::DirectIpHost,
                w.direct_ip_host,
                format!("URL uses IP address {} instead of a domain name", record.host),
                ThreatCategory::Hacking,
            ));
        }

        if features.url_length > self.config.long_url_threshold {
            findings.push(finding(
                RuleId::ExcessiveLength,
                w.excessive_length,
                format!("URL is unusually long ({} characters)", features.url_length),
                ThreatCategory::Phishing,
            ));
        }

        if features.domain_length > self.config.long_domain_threshold {
            findings.push(finding(
                RuleId::LongDomain,
                w.long_domain,
                format!("Domain name is unusually long ({} characters)", features.domain_length),
                ThreatCategory::Phishing,
            ));
        }

        if features.num_dots > self.config.max_dots {
            findings.push(finding(
                RuleId::ExcessiveSubdomains,
                w.excessive_subdomains,
                format!("URL contains {} dots, suggesting nested subdomains", features.num_dots),
                ThreatCategory::Phishing,
            ));
        }

        if features.has_suspicious_keywords == 1.0 {
            let matched = extractor.matched_keywords(record);
            let weight = (w.suspicious_keyword * matched.len() as i32).min(self.config.keyword_cap);
            let shown: Vec<&str> = matched.iter().take(5).copied().collect();
            findings.push(finding(
                RuleId::SuspiciousKeyword,
                weight,
                format!("Contains suspicious keywords: {}", shown.join(", ")),
                self.keyword_hint(&matched),
            ));
        }

        let is_ip = features.has_ip == 1.0;
        let bare = record.bare_host();

        if !is_ip {
            if let Some(tld) = bare.rsplit('.').next().filter(|t| self.risky_tlds.contains(*t)) {
                findings.push(finding(
                    RuleId::RiskyTld,
                    w.risky_tld,
                    format!("URL uses a high-risk top-level domain (.{})", tld),
                    ThreatCategory::Phishing,
                ));
            }

            let impersonated = self.impersonated_brands(bare);
            if !impersonated.is_empty() {
                findings.push(finding(
                    RuleId::BrandImpersonation,
                    w.brand_impersonation,
                    format!("Possible brand impersonation: {}", impersonated.join(", ")),
                    ThreatCategory::Phishing,
                ));
            }
        }

        if let Some(ext) = self.dangerous_extension(&record.path) {
            findings.push(finding(
                RuleId::DangerousFileType,
                w.dangerous_file_type,
                format!("URL points to a potentially dangerous file type (.{})", ext),
                ThreatCategory::Malware,
            ));
        }

        let special = record.host.chars().filter(|c| matches!(c, '-' | '_' | '.')).count();
        if special > self.config.max_host_special_chars {
            findings.push(finding(
                RuleId::SpecialCharacters,
                w.special_characters,
                format!("Domain contains multiple special characters ({})", special),
                ThreatCategory::Phishing,
            ));
        }

        if record.normalized.contains('@') {
            findings.push(finding(
                RuleId::CredentialInjection,
                w.credential_injection,
                "URL contains an @ symbol (possible credential injection)".to_string(),
                ThreatCategory::Phishing,
            ));
        }

        let escapes = record.normalized.matches('%').count();
        if escapes > self.config.max_percent_escapes {
            findings.push(finding(
                RuleId::EncodingAbuse,
                w.encoding_abuse,
                format!("Excessive URL encoding detected ({} escapes)", escapes),
                ThreatCategory::Phishing,
            ));
        }

        if !is_ip && self.is_trusted(bare) {
            findings.push(finding(
                RuleId::TrustedDomain,
                w.trusted_domain,
                "Domain is from a known trusted source".to_string(),
                ThreatCategory::Safe,
            ));
        }

        if !findings.iter().any(|f| f.weight > 0) {
            findings.push(finding(
                RuleId::SafeBaseline,
                w.safe_baseline,
                "No risk indicators detected".to_string(),
                ThreatCategory::Safe,
            ));
        }

        let score = findings.iter().map(|f| f.weight).sum();
        HeuristicReport { findings, score }
    }

    fn keyword_hint(&self, matched: &[&str]) -> ThreatCategory {
        if matched.iter().any(|k| self.hacking_keywords.contains(*k)) {
            ThreatCategory::Hacking
        } else if matched.iter().any(|k| self.malware_keywords.contains(*k)) {
            ThreatCategory::Malware
        } else {
            ThreatCategory::Phishing
        }
    }

    fn is_trusted(&self, host: &str) -> bool {
        self.config.trusted_domains.iter().any(|d| host_matches(host, d))
    }

    /// Brands named in (or typo-close to) a host label, excluding hosts the
    /// brand actually operates.
    fn impersonated_brands(&self, host: &str) -> Vec<String> {
        let tokens: Vec<&str> = host
            .split(|c: char| c == '.' || c == '-')
            .filter(|t| !t.is_empty())
            .collect();

        self.config
            .brands
            .iter()
            .filter(|(_, domains)| !domains.iter().any(|d| host_matches(host, d)))
            .filter(|(brand, _)| {
                tokens.iter().any(|t| {
                    t.contains(brand.as_str())
                        || (t.len() >= 4
                            && strsim::jaro_winkler(t, brand) >= self.config.brand_similarity)
                })
            })
            .map(|(brand, _)| brand.clone())
            .collect()
    }

    fn dangerous_extension(&self, path: &str) -> Option<String> {
        let last = path.rsplit('/').next()?;
        let (_, ext) = last.rsplit_once('.')?;
        let ext = ext.to_lowercase();
        self.dangerous_extensions.contains(&ext).then_some(ext)
    }
}

fn finding(rule: RuleId, weight: i32, description: String, hint: ThreatCategory) -> HeuristicFinding {
    HeuristicFinding {
        rule,
        title: rule.title().to_string(),
        weight,
        description,
        hint,
    }
}

fn host_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim().to_lowercase();
    !domain.is_empty() && (host == domain || host.ends_with(&format!(".{}", domain)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureConfig;

    struct Fixture {
        extractor: FeatureExtractor,
        engine: HeuristicEngine,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                extractor: FeatureExtractor::new(&FeatureConfig::default()).unwrap(),
                engine: HeuristicEngine::new(&HeuristicConfig::default()),
            }
        }

        fn run(&self, url: &str) -> HeuristicReport {
            let record = self.extractor.parse(url);
            let features = self.extractor.extract_record(&record);
            self.engine.evaluate(&self.extractor, &record, &features)
        }
    }

    fn rules(report: &HeuristicReport) -> Vec<RuleId> {
        report.findings.iter().map(|f| f.rule).collect()
    }

    #[test]
    fn test_ip_login_url() {
        let report = Fixture::new().run("http://10.0.0.5/secure-login.php");
        assert_eq!(
            rules(&report),
            vec![RuleId::NoHttps, RuleId::DirectIpHost, RuleId::SuspiciousKeyword]
        );
        // 10 + 30 + two keywords at 10 each
        assert_eq!(report.score, 60);
        assert_eq!(report.dominant().map(|f| f.rule), Some(RuleId::DirectIpHost));
    }

    #[test]
    fn test_clean_url_only_baseline() {
        let report = Fixture::new().run("https://www.example.com/");
        assert_eq!(rules(&report), vec![RuleId::SafeBaseline]);
        assert_eq!(report.score, -10);
        assert!(report.dominant().is_none());
    }

    #[test]
    fn test_trusted_domain_offsets_keywords() {
        let report = Fixture::new().run("https://accounts.google.com/signin");
        assert!(report.fired(RuleId::TrustedDomain));
        assert!(report.fired(RuleId::SuspiciousKeyword));
        assert!(!report.fired(RuleId::BrandImpersonation));
        assert!(!report.fired(RuleId::SafeBaseline));
    }

    #[test]
    fn test_keyword_weight_is_capped() {
        let report = Fixture::new().run("https://example.org/login-verify-secure-account-update-confirm");
        let kw = report
            .findings
            .iter()
            .find(|f| f.rule == RuleId::SuspiciousKeyword)
            .unwrap();
        assert_eq!(kw.weight, 30);
        assert_eq!(kw.hint, ThreatCategory::Phishing);
    }

    #[test]
    fn test_malware_download() {
        let report = Fixture::new().run("http://files.example.net/downloads/setup.exe");
        assert!(report.fired(RuleId::DangerousFileType));
        assert_eq!(report.dominant().map(|f| f.hint), Some(ThreatCategory::Malware));
    }

    #[test]
    fn test_brand_impersonation_and_risky_tld() {
        let report = Fixture::new().run("http://paypal-secure-update.xyz/verify");
        assert!(report.fired(RuleId::RiskyTld));
        assert!(report.fired(RuleId::BrandImpersonation));

        // near-typo of a brand
        let report = Fixture::new().run("https://paypall.com/");
        assert!(report.fired(RuleId::BrandImpersonation));

        // the brand's own domain
        let report = Fixture::new().run("https://www.paypal.com/");
        assert!(!report.fired(RuleId::BrandImpersonation));
    }

    #[test]
    fn test_special_characters_in_host() {
        let fixture = Fixture::new();

        // three dots, one hyphen, one underscore
        let report = fixture.run("https://secure-login_portal.example.co.uk/");
        let special = report
            .findings
            .iter()
            .find(|f| f.rule == RuleId::SpecialCharacters)
            .unwrap();
        assert_eq!(special.weight, 10);
        assert_eq!(special.hint, ThreatCategory::Phishing);

        // exactly at the limit
        let report = fixture.run("https://a-b.example.com/");
        assert!(!report.fired(RuleId::SpecialCharacters));

        // special characters in the path do not count
        let report = fixture.run("https://example.com/a-b-c_d.e.f");
        assert!(!report.fired(RuleId::SpecialCharacters));
    }

    #[test]
    fn test_credential_injection_and_encoding() {
        let report =
            Fixture::new().run("https://example.com@evil.test/%2F%2F%61%62%63%64%65");
        assert!(report.fired(RuleId::CredentialInjection));
        assert!(report.fired(RuleId::EncodingAbuse));
    }

    #[test]
    fn test_hacking_keyword_hint() {
        let report = Fixture::new().run("http://free-tools.example.net/crack-exploit");
        let kw = report
            .findings
            .iter()
            .find(|f| f.rule == RuleId::SuspiciousKeyword)
            .unwrap();
        assert_eq!(kw.hint, ThreatCategory::Hacking);
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let fixture = Fixture::new();
        let url = "http://a.b.c.d.e.example.tk/login?x=%20";
        assert_eq!(fixture.run(url), fixture.run(url));
    }
}
