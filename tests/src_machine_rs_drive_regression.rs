use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use testforge::agent::{CancelToken, Extractor};
use testforge::config::{ForgeConfig, ProviderKind};
use testforge::llm::backend::{LlmBackend, ReplayBackend};
use testforge::llm::client::RetryPolicy;
use testforge::llm::LlmGateway;
use testforge::state::{Decision, EntryKind, ExecutionStatus, IsolationMode};
use testforge::{ForgeContext, PipelineRun, RunMachine, Stage};

const GOLDEN: &str = r#"import requests


def test_get_user(base_url):
    user_id = 42
    r = requests.get(f"{base_url}/users/{user_id}")
    assert r.status_code == 200
"#;

const GOOD: &str = r#"```python
import requests


def test_get_user_returns_user(base_url):
    """Fetch an existing user."""
    r = requests.get(f"{base_url}/users/7")
    assert r.status_code == 200
    assert r.json()["id"] == 7
```"#;

const NO_ASSERTS: &str = r#"```python
import requests


def test_get_user_smoke(base_url):
    requests.get(f"{base_url}/users/7")
```"#;

struct Setup {
    dir: tempfile::TempDir,
    ctx: ForgeContext,
    replay: Arc<ReplayBackend>,
}

fn setup(responses: &[&str], max_retries: u32, tweak: impl FnOnce(&mut ForgeConfig, &Path)) -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = ForgeConfig::default();
    cfg.llm.provider = ProviderKind::Replay;
    cfg.pipeline.max_retries = max_retries;
    cfg.store.workspace_dir = dir.path().join(".testforge");
    tweak(&mut cfg, dir.path());

    let replay = Arc::new(ReplayBackend::from_responses(responses.iter().copied()));
    let gateway = LlmGateway::new(
        LlmBackend::Replay(replay.clone()),
        RetryPolicy {
            max_retries: 0,
            base: Duration::from_millis(1),
        },
    )
    .unwrap();
    let ctx = ForgeContext::with_gateway(cfg, gateway).unwrap();
    Setup { dir, ctx, replay }
}

fn write(dir: &Path, name: &str, body: &str) -> PathBuf {
    let p = dir.join(name);
    fs::write(&p, body).unwrap();
    p
}

fn drive(s: &Setup, entry: EntryKind, input: PathBuf, execute: bool) -> PipelineRun {
    let extractor = Extractor::for_entry(entry, None);
    RunMachine::new(&s.ctx, entry, input, extractor, CancelToken::new(), execute).drive()
}

#[test]
fn embedded_secret_is_rejected_not_retried() {
    let leaky = GOOD.replace(
        "    r = requests",
        "    api_key = \"sk-proj-abcdefghijklmnopqrstuvwx\"\n    r = requests",
    );
    let s = setup(&[&leaky, GOOD, GOOD], 2, |_, _| {});
    let input = write(s.dir.path(), "test_users.py", GOLDEN);
    let run = drive(&s, EntryKind::Golden, input, false);

    assert_eq!(run.stage(), Stage::Rejected);
    assert_eq!(run.attempts().len(), 1);
    let verdict = &run.last_attempt().unwrap().verdict;
    assert_eq!(verdict.decision, Decision::Reject);
    assert!(!verdict.rationale.contains("sk-proj-abcdefghijklmnopqrstuvwx"));
    assert_eq!(s.replay.transcript().len(), 1);
}

#[test]
fn quality_failures_exhaust_the_budget() {
    let s = setup(&[NO_ASSERTS, NO_ASSERTS, NO_ASSERTS, GOOD], 2, |_, _| {});
    let input = write(s.dir.path(), "test_users.py", GOLDEN);
    let run = drive(&s, EntryKind::Golden, input, false);

    assert_eq!(run.stage(), Stage::Exhausted);
    assert_eq!(run.attempts().len(), 3);
    assert!(run
        .attempts()
        .iter()
        .all(|a| a.verdict.decision == Decision::Retry));
    let numbers: Vec<u32> = run.attempts().iter().map(|a| a.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[test]
fn observed_capture_never_reaches_the_model_unscrubbed() {
    let s = setup(&[GOOD], 0, |_, _| {});
    let capture = r#"{"method": "GET", "url": "http://localhost:5000/users/7", "status": 200, "request_headers": {"X-Contact": "alice@example.com"}, "response_body": {"id": 7, "email": "alice@example.com", "ssn": "123-45-6789"}}
"#;
    let input = write(s.dir.path(), "traffic.jsonl", capture);
    let run = drive(&s, EntryKind::Observed, input, false);

    assert_ne!(run.stage(), Stage::Failed, "{:?}", run.rationale);
    let prompts = s.replay.transcript();
    assert!(!prompts.is_empty());
    for p in &prompts {
        assert!(!p.contains("alice@example.com"), "{p}");
        assert!(!p.contains("123-45-6789"), "{p}");
    }
}

#[test]
fn history_holds_one_terminal_record_per_run() {
    let s = setup(&[GOOD], 1, |_, _| {});
    let input = write(s.dir.path(), "test_users.py", GOLDEN);
    let run = drive(&s, EntryKind::Golden, input, false);
    assert_eq!(run.stage(), Stage::Accepted);

    let records = s.ctx.history.load_latest(10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].run.id, run.id);
    assert_eq!(records[0].run.stage(), Stage::Accepted);
}

#[cfg(unix)]
mod executed {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_python(dir: &Path, body: &str) -> String {
        let path = dir.join("python");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[test]
    fn failing_assertion_triggers_a_fresh_candidate() {
        let s = setup(&[GOOD, GOOD], 2, |cfg, dir| {
            let counter = dir.join("invocations");
            // fails on the first run, passes afterwards
            let body = format!(
                "if [ ! -f {c} ]; then touch {c}; echo 'test_candidate_1.py::test_get_user_returns_user FAILED'; echo 'E   assert 404 == 200'; exit 1; fi\necho 'test_candidate_2.py::test_get_user_returns_user PASSED'\nexit 0",
                c = counter.display()
            );
            cfg.sandbox.python = fake_python(dir, &body);
            cfg.sandbox.isolation = IsolationMode::Process;
            cfg.sandbox.timeout_secs = 20;
        });
        let input = write(s.dir.path(), "test_users.py", GOLDEN);
        let run = drive(&s, EntryKind::Golden, input, true);

        assert_eq!(run.stage(), Stage::Accepted, "{:?}", run.rationale);
        assert_eq!(run.attempts().len(), 2);

        let first = &run.attempts()[0];
        assert_eq!(first.verdict.decision, Decision::Retry);
        assert_eq!(
            first.execution.as_ref().map(|e| e.status),
            Some(ExecutionStatus::Failed)
        );

        let prompts = s.replay.transcript();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("PREVIOUS ATTEMPT"));
        assert!(run.transitions().iter().any(|t| t.to == Stage::Executing));
    }
}
