//! detectors/style.rs
//!
//! Conventions shared by a set of golden files, fed to the generator so
//! new tests look like the old ones.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::detectors::analyzer::GoldenFile;
use crate::testgen::intent::{AssertionStyle, Fixture};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleGuide {
    pub framework: String,
    pub http_client: String,
    pub class_based: bool,
    pub common_imports: Vec<String>,
    pub common_fixtures: Vec<Fixture>,
    /// Most frequent first, at most five.
    pub assertion_styles: Vec<(AssertionStyle, usize)>,
    pub common_decorators: Vec<String>,
    pub avg_assertions_per_test: f64,
    pub avg_test_lines: f64,
    pub uses_docstrings: bool,
    pub uses_parametrize: bool,
}

impl Default for StyleGuide {
    fn default() -> Self {
        Self {
            framework: "pytest".into(),
            http_client: "requests".into(),
            class_based: false,
            common_imports: vec!["import pytest".into(), "import requests".into()],
            common_fixtures: Vec::new(),
            assertion_styles: Vec::new(),
            common_decorators: Vec::new(),
            avg_assertions_per_test: 0.0,
            avg_test_lines: 0.0,
            uses_docstrings: false,
            uses_parametrize: false,
        }
    }
}

impl StyleGuide {
    pub fn from_golden(files: &[GoldenFile]) -> Self {
        if files.is_empty() {
            return Self::default();
        }

        let modules: Vec<&str> = files
            .iter()
            .flat_map(|f| f.modules.iter().map(String::as_str))
            .collect();

        let framework = if modules.iter().any(|m| *m == "unittest") {
            "unittest"
        } else {
            "pytest"
        };

        let any_source = |needle: &str| files.iter().any(|f| f.source.contains(needle));
        let http_client = if any_source("test_client") || any_source("TestClient") {
            "test_client"
        } else if modules.iter().any(|m| m.starts_with("httpx")) {
            "httpx"
        } else if modules.iter().any(|m| m.starts_with("aiohttp")) {
            "aiohttp"
        } else {
            "requests"
        };

        // An import is common when at least half of the files carry it.
        let threshold = (files.len() / 2).max(1);
        let mut import_counts: HashMap<&str, usize> = HashMap::new();
        for f in files {
            let unique: HashSet<&str> = f.imports.iter().map(String::as_str).collect();
            for imp in unique {
                *import_counts.entry(imp).or_default() += 1;
            }
        }
        let mut seen = HashSet::new();
        let common_imports = files
            .iter()
            .flat_map(|f| f.imports.iter())
            .filter(|i| import_counts.get(i.as_str()).copied().unwrap_or(0) >= threshold)
            .filter(|i| seen.insert(i.as_str()))
            .cloned()
            .collect();

        let mut seen = HashSet::new();
        let common_fixtures = files
            .iter()
            .flat_map(|f| f.fixtures.iter())
            .filter(|fx| seen.insert(fx.name.clone()))
            .cloned()
            .collect();

        let tests: Vec<_> = files.iter().flat_map(|f| f.tests.iter()).collect();
        let count = tests.len().max(1) as f64;

        let mut styles: HashMap<AssertionStyle, usize> = HashMap::new();
        let mut decorators: HashMap<&str, usize> = HashMap::new();
        let mut first_seen: HashMap<&str, usize> = HashMap::new();
        for t in &tests {
            for a in &t.assertions {
                *styles.entry(a.style).or_default() += 1;
            }
            for d in &t.decorators {
                let next = first_seen.len();
                first_seen.entry(d.as_str()).or_insert(next);
                *decorators.entry(d.as_str()).or_default() += 1;
            }
        }

        let mut assertion_styles: Vec<(AssertionStyle, usize)> = styles.into_iter().collect();
        assertion_styles.sort_by(|a, b| b.1.cmp(&a.1).then(style_rank(a.0).cmp(&style_rank(b.0))));
        assertion_styles.truncate(5);

        let mut decs: Vec<(&str, usize)> = decorators.into_iter().collect();
        decs.sort_by(|a, b| b.1.cmp(&a.1).then(first_seen[a.0].cmp(&first_seen[b.0])));
        let common_decorators = decs.into_iter().take(5).map(|(d, _)| d.to_string()).collect();

        let total_assertions: usize = tests.iter().map(|t| t.assertions.len()).sum();
        let total_lines: usize = tests.iter().map(|t| t.line_count).sum();
        let with_docs = tests.iter().filter(|t| t.docstring.is_some()).count();

        Self {
            framework: framework.into(),
            http_client: http_client.into(),
            class_based: files.iter().any(|f| !f.classes.is_empty()),
            common_imports,
            common_fixtures,
            assertion_styles,
            common_decorators,
            avg_assertions_per_test: total_assertions as f64 / count,
            avg_test_lines: total_lines as f64 / count,
            uses_docstrings: with_docs as f64 > tests.len() as f64 / 2.0,
            uses_parametrize: tests.iter().any(|t| !t.parametrized.is_empty()),
        }
    }

    /// Prompt-ready summary.
    pub fn render(&self) -> String {
        let mut out = format!(
            "framework: {}\nhttp client: {}\nclass based: {}\n",
            self.framework, self.http_client, self.class_based
        );
        if !self.common_imports.is_empty() {
            out.push_str("imports:\n");
            for i in &self.common_imports {
                out.push_str(&format!("  {i}\n"));
            }
        }
        if !self.common_fixtures.is_empty() {
            out.push_str("fixtures:\n");
            for f in &self.common_fixtures {
                let y = if f.yields { ", yields" } else { "" };
                out.push_str(&format!("  {} (scope={}{y})\n", f.name, f.scope));
            }
        }
        if !self.assertion_styles.is_empty() {
            let styles: Vec<String> = self
                .assertion_styles
                .iter()
                .map(|(s, n)| format!("{s:?} x{n}"))
                .collect();
            out.push_str(&format!("assertion styles: {}\n", styles.join(", ")));
        }
        if !self.common_decorators.is_empty() {
            out.push_str(&format!("decorators: {}\n", self.common_decorators.join(", ")));
        }
        out.push_str(&format!(
            "avg assertions per test: {:.1}\navg test length: {:.0} lines\ndocstrings: {}\nparametrize: {}\n",
            self.avg_assertions_per_test,
            self.avg_test_lines,
            self.uses_docstrings,
            self.uses_parametrize
        ));
        out
    }
}

fn style_rank(s: AssertionStyle) -> u8 {
    match s {
        AssertionStyle::Assert => 0,
        AssertionStyle::PytestRaises => 1,
        AssertionStyle::UnittestAssert => 2,
    }
}
