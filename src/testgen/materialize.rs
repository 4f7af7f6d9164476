use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::testgen::candidate::CandidateTest;

/* ============================================================
   Public entry
   ============================================================ */

/// Write a candidate and its `conftest.py` into `dir`; returns the test path.
pub fn materialize_candidate(
    dir: &Path,
    candidate: &CandidateTest,
    base_url: &str,
) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let path = dir.join(sanitize_name(&candidate.file_name()));
    fs::write(&path, &candidate.source)?;

    let conftest = dir.join("conftest.py");
    if !candidate.source.contains("def base_url") {
        fs::write(&conftest, conftest_source(base_url))?;
    }

    Ok(path)
}

/// Copy an accepted candidate out to `--out`, named after its input.
pub fn export_candidate(out_dir: &Path, stem: &str, candidate: &CandidateTest) -> io::Result<PathBuf> {
    fs::create_dir_all(out_dir)?;
    let stem = sanitize_name(stem);
    let stem = stem.trim_end_matches(".py");
    let name = if stem.starts_with("test_") {
        format!("{stem}_generated.py")
    } else {
        format!("test_{stem}_generated.py")
    };
    let path = out_dir.join(name);
    fs::write(&path, &candidate.source)?;
    Ok(path)
}

/* ============================================================
   conftest
   ============================================================ */

fn conftest_source(base_url: &str) -> String {
    let base_url = base_url.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        r#"import os

import pytest


@pytest.fixture
def base_url():
    """Base URL of the service under test."""
    return os.environ.get("BASE_URL", "{base_url}")
"#
    )
}

/* ============================================================
   Helpers
   ============================================================ */

fn sanitize_name(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.chars().next().unwrap_or('_').is_numeric() {
        format!("test_{name}")
    } else {
        name
    }
}
