//! validator/quality.rs
//!
//! Per-test quality scoring and intent matching.
//!
//! score = 0.4 * assertion quality + 0.3 * coverage breadth + 0.3 * readability

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::detectors::analyzer::assertions_in;
use crate::detectors::ast::{self, def_name, docstring, function_defs, text};
use crate::state::{Finding, FindingKind};
use crate::testgen::intent::{HttpMethod, Target, TestIntent};

const LONG_TEST_LINES: usize = 30;
const SHORT_TEST_LINES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestScore {
    pub name: String,
    pub assertions: usize,
    pub assertion_quality: f64,
    pub coverage_breadth: f64,
    pub readability: f64,
    pub overall: f64,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct QualityReport {
    pub scores: Vec<TestScore>,
    pub findings: Vec<Finding>,
}

impl QualityReport {
    pub fn mean(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().map(|s| s.overall).sum::<f64>() / self.scores.len() as f64
    }
}

fn body_check() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\.json\(\)|\.data\b|\.text\b|\.content\b|\.get_json\(\)").unwrap()
    })
}

fn error_check() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"pytest\.raises|Exception|Error|\b4\d\d\b").unwrap())
}

pub fn assess(source: &str, intents: &[Arc<TestIntent>], min_score: f64) -> QualityReport {
    let mut report = QualityReport::default();

    let tree = match ast::parse_python("<candidate>", source) {
        Ok(t) => t,
        Err(e) => {
            report.findings.push(quality("unparseable", e.to_string()));
            return report;
        }
    };
    let root = tree.root_node();

    let mut called: BTreeSet<(HttpMethod, String)> = BTreeSet::new();
    for def in function_defs(root, source) {
        let name = def_name(def.node, source);
        if !name.starts_with("test") {
            continue;
        }
        let calls = ast::http_calls(def.node, source);
        called.extend(calls.iter().map(|c| (c.method, c.path.clone())));
        report.scores.push(score_test(def.node, name, !calls.is_empty(), source));
    }

    if report.scores.is_empty() {
        report.findings.push(quality("no-tests", "candidate defines no test functions".into()));
        return report;
    }

    for s in report.scores.iter().filter(|s| s.assertions == 0) {
        report
            .findings
            .push(quality("no-assertions", format!("`{}` asserts nothing", s.name)));
    }

    if let Some(detail) = off_target(source, &called, intents) {
        report.findings.push(quality("off-target", detail));
    }

    let mean = report.mean();
    if mean < min_score {
        report.findings.push(quality(
            "low-score",
            format!("mean quality {mean:.2} is below {min_score:.2}"),
        ));
    }

    report
}

fn score_test(def: tree_sitter::Node, name: &str, is_api: bool, src: &str) -> TestScore {
    let body_text = text(def, src);
    let mut issues = Vec::new();

    let assertions = def
        .child_by_field_name("body")
        .map(|b| assertions_in(b, src).len())
        .unwrap_or(0);
    let mut assertion_quality = match assertions {
        0 => {
            issues.push("no assertions".to_string());
            0.0
        }
        1 => 0.5,
        n => (n as f64 / 4.0).min(1.0),
    };

    let has_status = body_text.contains("status_code") || body_text.contains(".status");
    if is_api && !has_status {
        issues.push("missing status code assertion".to_string());
        assertion_quality *= 0.7;
    }
    let has_body = body_check().is_match(body_text);

    let signals = [
        has_status,
        has_body,
        body_text.contains("headers"),
        error_check().is_match(body_text),
    ];
    let coverage_breadth = signals.iter().filter(|s| **s).count() as f64 / signals.len() as f64;

    let lines = body_text.trim().lines().count();
    let mut readability: f64 = 0.7;
    if docstring(def, src).is_some() {
        readability += 0.1;
    }
    if lines > LONG_TEST_LINES {
        readability -= 0.1;
        issues.push("test is long".to_string());
    }
    if lines < SHORT_TEST_LINES {
        readability -= 0.2;
        issues.push("test is very short".to_string());
    }
    let readability = readability.clamp(0.0, 1.0);

    TestScore {
        name: name.to_string(),
        assertions,
        assertion_quality,
        coverage_breadth,
        readability,
        overall: assertion_quality * 0.4 + coverage_breadth * 0.3 + readability * 0.3,
        issues,
    }
}

/// `Some(detail)` when the candidate exercises none of the intended targets.
fn off_target(
    source: &str,
    called: &BTreeSet<(HttpMethod, String)>,
    intents: &[Arc<TestIntent>],
) -> Option<String> {
    let endpoints: BTreeSet<(HttpMethod, String)> = intents
        .iter()
        .filter_map(|i| i.endpoint().map(|(m, p)| (m, p.to_string())))
        .collect();
    let functions: Vec<&str> = intents
        .iter()
        .filter_map(|i| match &i.target {
            Target::Function { name, .. } => Some(name.as_str()),
            _ => None,
        })
        .collect();

    if endpoints.is_empty() && functions.is_empty() {
        return None;
    }
    let hits_endpoint = called.iter().any(|c| endpoints.contains(c));
    let hits_function = functions.iter().any(|f| source.contains(&format!("{f}(")));
    if hits_endpoint || hits_function {
        return None;
    }

    let wanted: Vec<String> = endpoints
        .iter()
        .map(|(m, p)| format!("{m} {p}"))
        .chain(functions.iter().map(|f| format!("{f}()")))
        .take(5)
        .collect();
    Some(format!("no test exercises the intended targets ({})", wanted.join(", ")))
}

fn quality(rule: &str, detail: String) -> Finding {
    Finding {
        kind: FindingKind::Quality,
        rule: rule.to_string(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testgen::intent::Provenance;

    fn users_intent() -> Arc<TestIntent> {
        Arc::new(TestIntent::new(
            Target::Endpoint {
                method: HttpMethod::Get,
                path: "/users/{param}".into(),
            },
            Provenance::Observed {
                capture: "c.har".into(),
                samples: 1,
            },
        ))
    }

    const GOOD: &str = r#"
import requests

def test_get_user(base_url):
    """Fetch one user."""
    r = requests.get(f"{base_url}/users/42")
    assert r.status_code == 200
    assert r.json()["id"] == 42
    assert r.headers["content-type"].startswith("application/json")
"#;

    #[test]
    fn well_formed_test_scores_high_and_matches_intent() {
        let report = assess(GOOD, &[users_intent()], 0.5);
        assert!(report.findings.is_empty(), "{:?}", report.findings);
        let s = &report.scores[0];
        assert_eq!(s.assertions, 3);
        assert!((s.assertion_quality - 0.75).abs() < 1e-9);
        assert!((s.coverage_breadth - 0.75).abs() < 1e-9);
        assert!((s.readability - 0.8).abs() < 1e-9);
        assert!(report.mean() > 0.7);
    }

    #[test]
    fn assertion_free_test_is_a_quality_problem() {
        let src = "import requests\n\ndef test_a(base_url):\n    requests.get(f\"{base_url}/users/1\")\n";
        let report = assess(src, &[users_intent()], 0.5);
        let rules: Vec<&str> = report.findings.iter().map(|f| f.rule.as_str()).collect();
        assert!(rules.contains(&"no-assertions"));
        assert!(rules.contains(&"low-score"));
        assert_eq!(report.scores[0].assertion_quality, 0.0);
    }

    #[test]
    fn wrong_endpoint_is_off_target() {
        let src = r#"
import requests

def test_orders(base_url):
    r = requests.get(f"{base_url}/orders")
    assert r.status_code == 200
    assert r.json() == []
"#;
        let report = assess(src, &[users_intent()], 0.0);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].rule, "off-target");
        assert!(report.findings[0].detail.contains("GET /users/{param}"));
    }

    #[test]
    fn module_without_tests() {
        let report = assess("def helper():\n    return 1\n", &[], 0.5);
        assert_eq!(report.findings[0].rule, "no-tests");
        assert_eq!(report.mean(), 0.0);
    }
}
