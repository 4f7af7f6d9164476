//! executor/report.rs
//!
//! pytest `-v --tb=short` output -> per-case results.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::state::{CaseOutcome, CaseResult};

const OUTPUT_LIMIT: usize = 10_000;
const MESSAGE_LIMIT: usize = 1_500;

fn verbose_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\S*::(?:\w+::)?(\w+)(?:\[[^\]]*\])?\s+(PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)")
            .unwrap()
    })
}

fn summary_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(FAILED|ERROR)\s+\S*::(?:\w+::)?(\w+)").unwrap())
}

fn failure_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^_{3,}\s+(?:\w+\.)?(\w+)(?:\[[^\]]*\])?\s+_{3,}$").unwrap())
}

pub fn parse_pytest(stdout: &str) -> Vec<CaseResult> {
    let details = failure_details(stdout);
    let mut seen: Vec<String> = Vec::new();
    let mut out = Vec::new();

    for line in stdout.lines() {
        let Some(c) = verbose_line().captures(line.trim()) else {
            continue;
        };
        let name = c[1].to_string();
        if seen.contains(&name) {
            continue;
        }
        let outcome = match &c[2] {
            "PASSED" | "XPASS" => CaseOutcome::Passed,
            "FAILED" => CaseOutcome::Failed,
            "ERROR" => CaseOutcome::Error,
            _ => CaseOutcome::Skipped,
        };
        let message = matches!(outcome, CaseOutcome::Failed | CaseOutcome::Error)
            .then(|| details.get(&name).cloned())
            .flatten();
        seen.push(name.clone());
        out.push(CaseResult {
            name,
            outcome,
            message,
        });
    }

    if out.is_empty() {
        for line in stdout.lines() {
            let Some(c) = summary_line().captures(line.trim()) else {
                continue;
            };
            let name = c[2].to_string();
            if seen.contains(&name) {
                continue;
            }
            seen.push(name.clone());
            out.push(CaseResult {
                message: details.get(&name).cloned(),
                outcome: if &c[1] == "ERROR" {
                    CaseOutcome::Error
                } else {
                    CaseOutcome::Failed
                },
                name,
            });
        }
    }

    out
}

/// Body of each `____ test_x ____` block in the FAILURES section.
fn failure_details(stdout: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(start) = stdout.find("= FAILURES =") else {
        return out;
    };
    let section = &stdout[start..];

    let mut current: Option<(String, Vec<&str>)> = None;
    for line in section.lines().skip(1) {
        if let Some(c) = failure_header().captures(line.trim()) {
            if let Some((name, body)) = current.take() {
                out.insert(name, clip(&body.join("\n"), MESSAGE_LIMIT));
            }
            current = Some((c[1].to_string(), Vec::new()));
            continue;
        }
        if line.starts_with('=') && line.trim_end().ends_with('=') {
            break;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((name, body)) = current {
        out.insert(name, clip(&body.join("\n"), MESSAGE_LIMIT));
    }
    out
}

/// `(passed, failed)` from the final summary line.
pub fn parse_counts(output: &str) -> (usize, usize) {
    static PASS: OnceLock<Regex> = OnceLock::new();
    static FAIL: OnceLock<Regex> = OnceLock::new();
    let pass = PASS.get_or_init(|| Regex::new(r"(\d+)\s+passed").unwrap());
    let fail = FAIL.get_or_init(|| Regex::new(r"(\d+)\s+failed").unwrap());

    let last = |re: &Regex| {
        re.captures_iter(output)
            .last()
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(0)
    };
    (last(pass), last(fail))
}

pub fn truncate_output(text: &str) -> String {
    clip(text, OUTPUT_LIMIT)
}

fn clip(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...[truncated]", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = r#"============================= test session starts ==============================
collected 3 items

test_candidate_1.py::test_get_user PASSED                                [ 33%]
test_candidate_1.py::test_missing_user FAILED                            [ 66%]
test_candidate_1.py::TestUsers::test_list[2] SKIPPED (flag off)          [100%]

=================================== FAILURES ===================================
______________________________ test_missing_user _______________________________
test_candidate_1.py:12: in test_missing_user
    assert r.status_code == 404
E   assert 500 == 404
=========================== short test summary info ============================
FAILED test_candidate_1.py::test_missing_user - assert 500 == 404
==================== 1 failed, 1 passed, 1 skipped in 0.12s ====================
"#;

    #[test]
    fn parses_verbose_lines_and_failure_bodies() {
        let cases = parse_pytest(OUTPUT);
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[0].outcome, CaseOutcome::Passed);
        assert_eq!(cases[1].name, "test_missing_user");
        assert_eq!(cases[1].outcome, CaseOutcome::Failed);
        assert!(cases[1]
            .message
            .as_deref()
            .unwrap()
            .contains("assert 500 == 404"));
        assert_eq!(cases[2].name, "test_list");
        assert_eq!(cases[2].outcome, CaseOutcome::Skipped);
        assert_eq!(parse_counts(OUTPUT), (1, 1));
    }

    #[test]
    fn falls_back_to_short_summary() {
        let out = "FAILED test_x.py::test_a - boom\nERROR test_x.py::test_b\n1 failed";
        let cases = parse_pytest(out);
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[1].outcome, CaseOutcome::Error);
    }

    #[test]
    fn clip_marks_truncation() {
        let long = "x".repeat(OUTPUT_LIMIT + 10);
        assert!(truncate_output(&long).ends_with("[truncated]"));
    }
}
