//! privacy/patterns.rs
//!
//! The PII pattern set. Each pattern names a category, a regex, and whether
//! a hit counts as a credential (used by the validator's security checks).
//!
//! A pattern may carry a named group `v`; only that group is redacted, so
//! the surrounding syntax (quotes, `password=`, `Bearer `) survives.

use regex::Regex;

use crate::config::PrivacyConfig;
use crate::error::ConfigError;

pub const PLACEHOLDER_PREFIX: &str = "REDACTED_";

#[derive(Debug, Clone)]
pub struct PiiPattern {
    pub category: String,
    pub regex: Regex,
    pub secret: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiiHit {
    pub category: String,
    pub value: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone)]
pub struct PiiPolicy {
    patterns: Vec<PiiPattern>,
}

/// Built-in set, most specific first.
const STANDARD: &[(&str, &str, bool)] = &[
    (
        "PRIVATE_KEY",
        r"(?s)-----BEGIN [A-Z ]*PRIVATE KEY-----.*?-----END [A-Z ]*PRIVATE KEY-----",
        true,
    ),
    (
        "JWT",
        r"\beyJ[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]{8,}",
        true,
    ),
    ("AWS_KEY", r"\b(?:AKIA|ASIA)[0-9A-Z]{16}\b", true),
    ("GITHUB_TOKEN", r"\bgh[pousr]_[A-Za-z0-9]{30,}\b", true),
    ("API_KEY", r"\bsk-(?:ant-|proj-)?[A-Za-z0-9_-]{20,}", true),
    ("SLACK_TOKEN", r"\bxox[abprs]-[A-Za-z0-9-]{10,}", true),
    (
        "BEARER",
        r"(?i)\bbearer\s+(?P<v>[A-Za-z0-9.~+/-]{16,}=*)",
        true,
    ),
    (
        "SECRET",
        r#"(?i)\b(?:password|passwd|pwd|secret|api[_-]?key|access[_-]?token|auth[_-]?token|client[_-]?secret)\b["']?\s*[:=]\s*["'](?P<v>[^"'\s]{4,})["']"#,
        true,
    ),
    (
        "EMAIL",
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(?:\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}\b",
        false,
    ),
    ("SSN", r"\b\d{3}-\d{2}-\d{4}\b", false),
    (
        "IPV6",
        r"\b(?:[0-9A-Fa-f]{1,4}:){7}[0-9A-Fa-f]{1,4}\b",
        false,
    ),
    (
        "IPV4",
        r"\b(?:(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(?:25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\b",
        false,
    ),
    (
        "NAME",
        r#"["'](?P<v>[A-Z][a-z]+(?: [A-Z][a-z]+){1,2})["']"#,
        false,
    ),
];

impl PiiPolicy {
    pub fn standard() -> Self {
        let patterns = STANDARD
            .iter()
            .filter_map(|(category, re, secret)| {
                Regex::new(re).ok().map(|regex| PiiPattern {
                    category: (*category).to_string(),
                    regex,
                    secret: *secret,
                })
            })
            .collect();

        Self { patterns }
    }

    pub fn from_config(cfg: &PrivacyConfig) -> Result<Self, ConfigError> {
        let mut policy = Self::standard();

        policy.patterns.retain(|p| {
            !cfg
                .disabled_categories
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&p.category))
        });

        for extra in &cfg.extra_patterns {
            let regex = Regex::new(&extra.regex).map_err(|e| {
                ConfigError::Invalid(format!("privacy pattern `{}`: {e}", extra.category))
            })?;
            policy.patterns.push(PiiPattern {
                category: extra.category.to_ascii_uppercase(),
                regex,
                secret: extra.secret,
            });
        }

        Ok(policy)
    }

    pub fn patterns(&self) -> &[PiiPattern] {
        &self.patterns
    }

    /// Every non-exempt hit of every pattern, in pattern order.
    pub fn find_all(&self, text: &str) -> Vec<PiiHit> {
        self.patterns
            .iter()
            .flat_map(|p| hits_for(p, text))
            .collect()
    }

    /// Credential-like hits only.
    pub fn find_secrets(&self, text: &str) -> Vec<PiiHit> {
        self.patterns
            .iter()
            .filter(|p| p.secret)
            .flat_map(|p| hits_for(p, text))
            .collect()
    }
}

pub(crate) fn hits_for(pattern: &PiiPattern, text: &str) -> Vec<PiiHit> {
    pattern
        .regex
        .captures_iter(text)
        .filter_map(|caps| {
            let m = caps.name("v").or_else(|| caps.get(0))?;
            let value = m.as_str();
            if is_exempt(&pattern.category, value) {
                return None;
            }
            Some(PiiHit {
                category: pattern.category.clone(),
                value: value.to_string(),
                start: m.start(),
                end: m.end(),
            })
        })
        .collect()
}

/// Placeholders and loopback addresses are never redacted.
pub(crate) fn is_exempt(category: &str, value: &str) -> bool {
    if value.starts_with(PLACEHOLDER_PREFIX) {
        return true;
    }
    match category {
        "IPV4" => value.starts_with("127.") || value == "0.0.0.0",
        _ => false,
    }
}
