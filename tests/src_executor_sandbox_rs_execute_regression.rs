#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use testforge::agent::CancelToken;
use testforge::executor::{ResourceLimits, Sandbox, SandboxPolicy};
use testforge::state::ExecutionStatus;
use testforge::testgen::candidate::CandidateTest;

fn fake_python(dir: &Path, body: &str) -> String {
    let path = dir.join("python");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

fn candidate(source: &str) -> CandidateTest {
    CandidateTest {
        request_id: Uuid::new_v4(),
        attempt: 1,
        source: source.into(),
        test_names: vec!["test_slow".into()],
        prompt_hash: "h".into(),
        scrubbed: true,
        created_at: Utc::now(),
    }
}

#[test]
fn sleeping_test_times_out_within_timeout_plus_grace() {
    let bin = tempfile::tempdir().unwrap();
    // the child spawns a grandchild that would outlive a plain kill
    let py = fake_python(bin.path(), "sleep 60 &\nsleep 60");
    let sandbox = Sandbox::new(SandboxPolicy::process_only(), py, "http://localhost:5000");
    let limits = ResourceLimits {
        timeout: Duration::from_millis(500),
        memory_mb: 4096,
        cpu_secs: 30,
        teardown_grace: Duration::from_millis(500),
    };

    let started = Instant::now();
    let r = sandbox
        .execute(
            &candidate("import time\n\ndef test_slow():\n    time.sleep(60)\n"),
            &limits,
            &CancelToken::new(),
        )
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(r.status, ExecutionStatus::TimedOut);
    assert!(r.killed_reason.as_deref().unwrap_or_default().contains("timed out"));
    // generous slack for a loaded CI box, far below the sleep
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
}

#[test]
fn offline_policy_points_proxies_at_a_blackhole() {
    let bin = tempfile::tempdir().unwrap();
    let py = fake_python(
        bin.path(),
        "echo \"proxy=${HTTPS_PROXY:-none}\"\necho \"no_proxy=${NO_PROXY:-none}\"\necho 'test_x.py::test_slow PASSED'\nexit 0",
    );
    let sandbox = Sandbox::new(SandboxPolicy::process_only(), py, "http://svc.internal:8000");
    let limits = ResourceLimits {
        timeout: Duration::from_secs(10),
        memory_mb: 4096,
        cpu_secs: 30,
        teardown_grace: Duration::from_millis(500),
    };
    let r = sandbox
        .execute(&candidate("def test_slow():\n    pass\n"), &limits, &CancelToken::new())
        .unwrap();

    assert_eq!(r.status, ExecutionStatus::Passed);
    assert!(r.stdout.contains("proxy=http://127.0.0.1:9"), "{}", r.stdout);
    assert!(r.stdout.contains("svc.internal"), "{}", r.stdout);
}
