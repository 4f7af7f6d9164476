//! executor
//!
//! Candidate execution: sandboxed pytest runs plus optional reruns to spot
//! flaky cases.

pub mod policy;
pub mod report;
pub mod sandbox;

use std::collections::HashMap;

use tracing::info;

use crate::agent::CancelToken;
use crate::config::ForgeConfig;
use crate::error::SandboxError;
use crate::state::{CaseOutcome, ExecutionResult, ExecutionStatus};
use crate::testgen::candidate::CandidateTest;

pub use policy::SandboxPolicy;
pub use sandbox::{ResourceLimits, Sandbox};

#[derive(Debug, Clone)]
pub struct Executor {
    sandbox: Sandbox,
    limits: ResourceLimits,
    reruns: u32,
}

impl Executor {
    pub fn new(sandbox: Sandbox, limits: ResourceLimits, reruns: u32) -> Self {
        Self {
            sandbox,
            limits,
            reruns,
        }
    }

    pub fn from_config(cfg: &ForgeConfig) -> Result<Self, SandboxError> {
        Ok(Self::new(
            Sandbox::from_config(cfg)?,
            ResourceLimits::from_config(cfg),
            cfg.pipeline.flaky_reruns,
        ))
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Run once; if it passed and reruns are configured, run again and
    /// record every case whose outcome moved.
    pub fn execute(
        &self,
        candidate: &CandidateTest,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let mut first = self.sandbox.execute(candidate, &self.limits, cancel)?;
        if first.status != ExecutionStatus::Passed || self.reruns == 0 {
            return Ok(first);
        }

        let baseline: HashMap<&str, CaseOutcome> = first
            .cases
            .iter()
            .map(|c| (c.name.as_str(), c.outcome))
            .collect();
        let mut flaky: Vec<String> = Vec::new();

        for _ in 0..self.reruns {
            if cancel.is_cancelled() {
                break;
            }
            let again = self.sandbox.execute(candidate, &self.limits, cancel)?;
            let mut moved: Vec<String> = again
                .cases
                .iter()
                .filter(|c| baseline.get(c.name.as_str()) != Some(&c.outcome))
                .map(|c| c.name.clone())
                .collect();
            if moved.is_empty() && again.status != ExecutionStatus::Passed {
                moved.push(format!("<module:{:?}>", again.status).to_lowercase());
            }
            for name in moved {
                if !flaky.contains(&name) {
                    flaky.push(name);
                }
            }
        }

        if !flaky.is_empty() {
            info!(attempt = candidate.attempt, flaky = ?flaky, "flaky cases detected");
        }
        first.flaky = flaky;
        Ok(first)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use uuid::Uuid;

    fn candidate() -> CandidateTest {
        CandidateTest {
            request_id: Uuid::new_v4(),
            attempt: 1,
            source: "def test_a():\n    assert True\n".into(),
            test_names: vec!["test_a".into()],
            prompt_hash: "h".into(),
            scrubbed: true,
            created_at: Utc::now(),
        }
    }

    fn executor(bin: &Path, body: &str, reruns: u32) -> Executor {
        let py = bin.join("python");
        fs::write(&py, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&py, fs::Permissions::from_mode(0o755)).unwrap();
        Executor::new(
            Sandbox::new(SandboxPolicy::process_only(), py.display().to_string(), "http://localhost"),
            ResourceLimits {
                timeout: Duration::from_secs(10),
                memory_mb: 4096,
                cpu_secs: 30,
                teardown_grace: Duration::from_millis(500),
            },
            reruns,
        )
    }

    #[test]
    fn alternating_outcome_is_flagged_flaky() {
        let state = tempfile::tempdir().unwrap();
        let counter = state.path().join("n");
        // passes on the first invocation, fails on the second
        let body = format!(
            "if [ -f {c} ]; then echo 'test_x.py::test_a FAILED'; exit 1; fi\ntouch {c}\necho 'test_x.py::test_a PASSED'\nexit 0",
            c = counter.display()
        );
        let exec = executor(state.path(), &body, 1);
        let r = exec.execute(&candidate(), &CancelToken::new()).unwrap();
        assert_eq!(r.status, ExecutionStatus::Passed);
        assert_eq!(r.flaky, vec!["test_a".to_string()]);
    }

    #[test]
    fn stable_run_has_no_flaky_cases() {
        let bin = tempfile::tempdir().unwrap();
        let exec = executor(bin.path(), "echo 'test_x.py::test_a PASSED'\nexit 0", 2);
        let r = exec.execute(&candidate(), &CancelToken::new()).unwrap();
        assert!(r.flaky.is_empty());
    }
}
