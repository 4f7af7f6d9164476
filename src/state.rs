use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::testgen::candidate::CandidateTest;
use crate::testgen::intent::{Target, TestIntent};

/* ---------- entry ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Golden,
    Observed,
}

impl EntryKind {
    /// `.py` is golden; `.har`, `.json`, `.jsonl` are captures.
    pub fn for_path(path: &std::path::Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "py" => Some(EntryKind::Golden),
            "har" | "json" | "jsonl" | "ndjson" => Some(EntryKind::Observed),
            _ => None,
        }
    }
}

/* ---------- lifecycle ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Pending,
    Extracting,
    Scrubbing,
    Generating,
    Executing,
    Validating,
    Retrying,
    Accepted,
    Rejected,
    Exhausted,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Stage::Accepted | Stage::Rejected | Stage::Exhausted | Stage::Failed
        )
    }

    /// Legal edges of the run lifecycle.
    pub fn can_advance_to(self, next: Stage) -> bool {
        use Stage::*;
        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Pending, Extracting)
                | (Extracting, Scrubbing)
                | (Scrubbing, Generating)
                | (Generating, Executing)
                | (Generating, Validating)
                | (Generating, Retrying)
                | (Generating, Exhausted)
                | (Executing, Validating)
                | (Validating, Accepted)
                | (Validating, Rejected)
                | (Validating, Retrying)
                | (Validating, Exhausted)
                | (Retrying, Scrubbing)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageChange {
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
}

/* ---------- execution ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Passed,
    Failed,
    Crashed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOutcome {
    Passed,
    Failed,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: String,
    pub outcome: CaseOutcome,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Fresh process group, cleared env, rlimits, private scratch dir.
    Process,
    /// Wrapped by an external launcher (namespaces, seccomp).
    Launcher,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub wall_ms: u64,
    pub peak_memory_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub usage: ResourceUsage,
    pub isolation: IsolationMode,
    pub cases: Vec<CaseResult>,
    /// Cases whose outcome changed across reruns.
    pub flaky: Vec<String>,
    /// Set when the sandbox killed the process (timeout, memory, cancel).
    pub killed_reason: Option<String>,
}

impl ExecutionResult {
    pub fn failed_cases(&self) -> impl Iterator<Item = &CaseResult> {
        self.cases
            .iter()
            .filter(|c| matches!(c.outcome, CaseOutcome::Failed | CaseOutcome::Error))
    }
}

/* ---------- validation ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Retry,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Security,
    Quality,
    Execution,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub rule: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub decision: Decision,
    pub rationale: String,
    pub findings: Vec<Finding>,
    pub quality_score: Option<f64>,
}

impl ValidationVerdict {
    pub fn retry(rationale: impl Into<String>, findings: Vec<Finding>) -> Self {
        Self {
            decision: Decision::Retry,
            rationale: rationale.into(),
            findings,
            quality_score: None,
        }
    }
}

/* ---------- attempts & runs ---------- */

/// One generate/execute/validate cycle. Frozen once pushed onto a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub number: u32,
    pub prompt_hash: String,
    pub redactions: usize,
    pub candidate: Option<CandidateTest>,
    pub execution: Option<ExecutionResult>,
    pub verdict: ValidationVerdict,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentSummary {
    pub id: String,
    pub target: Target,
}

impl From<&TestIntent> for IntentSummary {
    fn from(i: &TestIntent) -> Self {
        Self {
            id: i.id.clone(),
            target: i.target.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub entry: EntryKind,
    pub input: PathBuf,
    stage: Stage,
    attempts: Vec<Attempt>,
    transitions: Vec<StageChange>,
    pub intents: Vec<IntentSummary>,
    /// Per-item problems that did not stop the run.
    pub diagnostics: Vec<String>,
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(entry: EntryKind, input: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry,
            input,
            stage: Stage::Pending,
            attempts: Vec::new(),
            transitions: Vec::new(),
            intents: Vec::new(),
            diagnostics: Vec::new(),
            rationale: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn transitions(&self) -> &[StageChange] {
        &self.transitions
    }

    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Move along a legal edge. Illegal moves are refused and reported.
    pub(crate) fn advance(&mut self, to: Stage) -> Result<(), String> {
        if !self.stage.can_advance_to(to) {
            return Err(format!("illegal transition {} -> {to}", self.stage));
        }
        self.transitions.push(StageChange {
            from: self.stage,
            to,
            at: Utc::now(),
        });
        self.stage = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) fn push_attempt(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    /// Copy with every free-text field passed through `f`: sources, process
    /// output, case messages, rationales, finding details, diagnostics.
    pub fn map_text<E>(&self, mut f: impl FnMut(&str) -> Result<String, E>) -> Result<Self, E> {
        let mut run = self.clone();
        for a in &mut run.attempts {
            if let Some(c) = &mut a.candidate {
                c.source = f(&c.source)?;
            }
            if let Some(e) = &mut a.execution {
                e.stdout = f(&e.stdout)?;
                e.stderr = f(&e.stderr)?;
                for c in &mut e.cases {
                    if let Some(m) = &c.message {
                        c.message = Some(f(m)?);
                    }
                }
                if let Some(k) = &e.killed_reason {
                    e.killed_reason = Some(f(k)?);
                }
            }
            a.verdict.rationale = f(&a.verdict.rationale)?;
            for finding in &mut a.verdict.findings {
                finding.detail = f(&finding.detail)?;
            }
        }
        for d in &mut run.diagnostics {
            *d = f(d)?;
        }
        if let Some(r) = &run.rationale {
            run.rationale = Some(f(r)?);
        }
        Ok(run)
    }

    /// Drop payload text (sources, process output), keep the audit trail.
    pub fn without_payloads(&self) -> Self {
        let mut run = self.clone();
        for a in &mut run.attempts {
            if let Some(c) = &mut a.candidate {
                c.source = String::new();
            }
            if let Some(e) = &mut a.execution {
                e.stdout = String::new();
                e.stderr = String::new();
                for c in &mut e.cases {
                    c.message = None;
                }
            }
        }
        run
    }
}
