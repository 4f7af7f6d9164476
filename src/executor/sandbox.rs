//! executor/sandbox.rs
//!
//! Runs one candidate module under pytest in an isolated child process:
//! private scratch dir, cleared environment, own process group, rlimits,
//! optional external launcher. The child is polled, never awaited blindly,
//! so wall-clock timeout, memory ceiling and cancellation are enforced here.

use std::fs;
use std::io::{self, ErrorKind, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::agent::CancelToken;
use crate::config::ForgeConfig;
use crate::error::SandboxError;
use crate::executor::policy::{LauncherVars, SandboxPolicy};
use crate::executor::report::{parse_pytest, truncate_output};
use crate::state::{ExecutionResult, ExecutionStatus, IsolationMode, ResourceUsage};
use crate::testgen::candidate::CandidateTest;
use crate::testgen::materialize::materialize_candidate;

const POLL: Duration = Duration::from_millis(25);
/// Process-table scans happen every Nth poll.
const MEMORY_EVERY: u32 = 4;
/// Bytes kept per output stream; the rest is read and discarded.
const CAPTURE_LIMIT: u64 = 1 << 20;
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// Discard port; proxied traffic goes nowhere.
const BLACKHOLE_PROXY: &str = "http://127.0.0.1:9";

/// Applies rlimits, then becomes the interpreter.
const RLIMIT_SHIM: &str =
    r#"ulimit -v "$TESTFORGE_MEM_KB" 2>/dev/null; ulimit -t "$TESTFORGE_CPU_SECS" 2>/dev/null; exec "$0" "$@""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
    pub cpu_secs: u64,
    pub teardown_grace: Duration,
}

impl ResourceLimits {
    pub fn from_config(cfg: &ForgeConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.sandbox.timeout_secs),
            memory_mb: cfg.sandbox.memory_mb,
            cpu_secs: cfg.sandbox.cpu_secs,
            teardown_grace: Duration::from_millis(cfg.sandbox.teardown_grace_ms),
        }
    }

    fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    policy: SandboxPolicy,
    python: String,
    base_url: String,
}

impl Sandbox {
    pub fn new(policy: SandboxPolicy, python: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            policy,
            python: python.into(),
            base_url: base_url.into(),
        }
    }

    pub fn from_config(cfg: &ForgeConfig) -> Result<Self, SandboxError> {
        let mut policy = match &cfg.sandbox.policy_file {
            Some(path) => SandboxPolicy::load(path)?,
            None => SandboxPolicy::default(),
        };
        if cfg.sandbox.allow_network {
            policy.allow_network = true;
        }
        match cfg.sandbox.isolation {
            IsolationMode::Process => {
                warn!("process-only sandbox: candidates are not kept off the host filesystem");
                policy.launcher.clear();
                policy.require_launcher = false;
            }
            IsolationMode::Launcher if policy.launcher.is_empty() => {
                return Err(SandboxError::Isolation(
                    "no launcher configured; set sandbox.isolation = \"process\" to run without one"
                        .into(),
                ));
            }
            IsolationMode::Launcher => {}
        }
        policy.validate()?;
        Ok(Self::new(
            policy,
            cfg.sandbox.python.clone(),
            cfg.pipeline.base_url.clone(),
        ))
    }

    pub fn isolation(&self) -> IsolationMode {
        if self.policy.launcher.is_empty() {
            IsolationMode::Process
        } else {
            IsolationMode::Launcher
        }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Execute a candidate. `Err` only when isolation could not be set up;
    /// every test outcome, including timeouts and crashes, is `Ok`.
    pub fn execute(
        &self,
        candidate: &CandidateTest,
        limits: &ResourceLimits,
        cancel: &CancelToken,
    ) -> Result<ExecutionResult, SandboxError> {
        if self.policy.require_launcher && self.policy.launcher.is_empty() {
            return Err(SandboxError::Isolation(
                "policy requires a launcher, none configured".into(),
            ));
        }
        let scratch = tempfile::Builder::new().prefix("testforge-").tempdir()?;
        let test_path = materialize_candidate(scratch.path(), candidate, &self.base_url)?;

        let mut cmd = self.command(scratch.path(), &test_path, limits)?;
        let started = Instant::now();

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => SandboxError::Isolation(format!(
                "cannot start `{}`: not found",
                cmd.get_program().to_string_lossy()
            )),
            _ => SandboxError::Isolation(e.to_string()),
        })?;

        debug!(
            pid = child.id(),
            attempt = candidate.attempt,
            isolation = ?self.isolation(),
            "sandbox started"
        );

        let stdout_rx = drain(child.stdout.take());
        let stderr_rx = drain(child.stderr.take());

        let outcome = monitor(&mut child, limits, cancel, started)?;

        let grace = limits.teardown_grace.max(POLL);
        let stdout = stdout_rx.recv_timeout(grace).unwrap_or_default();
        let stderr = stderr_rx.recv_timeout(grace).unwrap_or_default();
        let wall_ms = started.elapsed().as_millis() as u64;

        let (status, exit_code) = match (&outcome.killed, outcome.exit) {
            (Some((status, _)), exit) => (*status, exit.and_then(|s| s.code())),
            (None, Some(exit)) => (status_of(exit), exit.code()),
            (None, None) => (ExecutionStatus::Crashed, None),
        };

        if let Some((_, reason)) = &outcome.killed {
            warn!(attempt = candidate.attempt, reason = %reason, wall_ms, "sandbox killed child");
        }

        let result = ExecutionResult {
            status,
            exit_code,
            cases: parse_pytest(&stdout),
            stdout: truncate_output(&stdout),
            stderr: truncate_output(&stderr),
            usage: ResourceUsage {
                wall_ms,
                peak_memory_bytes: outcome.peak_memory,
            },
            isolation: self.isolation(),
            flaky: Vec::new(),
            killed_reason: outcome.killed.map(|(_, r)| r),
        };

        debug!(
            attempt = candidate.attempt,
            status = ?result.status,
            cases = result.cases.len(),
            wall_ms,
            "sandbox finished"
        );

        // scratch is removed on drop
        Ok(result)
    }

    /* ---------- command ---------- */

    fn command(
        &self,
        scratch: &Path,
        test_path: &Path,
        limits: &ResourceLimits,
    ) -> Result<Command, SandboxError> {
        let test_file = test_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SandboxError::Isolation("candidate path has no file name".into()))?;

        let mut argv: Vec<String> = Vec::new();
        if !self.policy.launcher.is_empty() {
            let policy_path = scratch.join("policy.toml");
            fs::write(&policy_path, self.policy.to_toml()?)?;
            argv.extend(self.policy.launcher_argv(&LauncherVars {
                scratch: scratch.to_path_buf(),
                policy: policy_path,
                memory_mb: limits.memory_mb,
                cpu_secs: limits.cpu_secs,
            }));
        }
        argv.extend(
            [
                "/bin/sh",
                "-c",
                RLIMIT_SHIM,
                self.python.as_str(),
                "-m",
                "pytest",
                test_file.as_str(),
                "-v",
                "--tb=short",
                "-p",
                "no:cacheprovider",
            ]
            .into_iter()
            .map(str::to_string),
        );

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();

        for name in &self.policy.env_passthrough {
            if let Ok(v) = std::env::var(name) {
                cmd.env(name, v);
            }
        }
        if !self.policy.env_passthrough.iter().any(|n| n == "PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }

        cmd.env("HOME", scratch)
            .env("TMPDIR", scratch)
            .env("BASE_URL", &self.base_url)
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONUNBUFFERED", "1")
            .env("TESTFORGE_MEM_KB", (limits.memory_mb * 1024).to_string())
            .env("TESTFORGE_CPU_SECS", limits.cpu_secs.to_string());

        if !self.policy.allow_network {
            for var in ["http_proxy", "https_proxy", "HTTP_PROXY", "HTTPS_PROXY", "ALL_PROXY"] {
                cmd.env(var, BLACKHOLE_PROXY);
            }
            let service = url::Url::parse(&self.base_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| "localhost".into());
            let no_proxy = format!("{service},localhost,127.0.0.1");
            cmd.env("NO_PROXY", &no_proxy).env("no_proxy", &no_proxy);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        Ok(cmd)
    }
}

/* ---------- monitoring ---------- */

struct Outcome {
    exit: Option<ExitStatus>,
    killed: Option<(ExecutionStatus, String)>,
    peak_memory: u64,
}

fn monitor(
    child: &mut Child,
    limits: &ResourceLimits,
    cancel: &CancelToken,
    started: Instant,
) -> Result<Outcome, SandboxError> {
    let pid = Pid::from_u32(child.id());
    let mut sys = System::new();
    let mut peak_memory = 0u64;
    let mut polls = 0u32;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(Outcome {
                    exit: Some(status),
                    killed: None,
                    peak_memory,
                })
            }
            Ok(None) => {}
            Err(e) => {
                kill_tree(child, limits.teardown_grace);
                return Err(SandboxError::Isolation(format!("lost track of child: {e}")));
            }
        }

        let killed = if cancel.is_cancelled() {
            Some((ExecutionStatus::Crashed, "cancelled".to_string()))
        } else if started.elapsed() >= limits.timeout {
            Some((
                ExecutionStatus::TimedOut,
                format!("timed out after {}s", limits.timeout.as_secs_f32()),
            ))
        } else if polls % MEMORY_EVERY == 0 {
            // rlimits are per process; the ceiling covers the whole tree
            let rss = tree_memory(&mut sys, pid);
            peak_memory = peak_memory.max(rss);
            (rss > limits.memory_bytes()).then(|| {
                (
                    ExecutionStatus::Crashed,
                    format!("memory limit of {} MB exceeded", limits.memory_mb),
                )
            })
        } else {
            None
        };
        polls = polls.wrapping_add(1);

        if let Some(killed) = killed {
            let exit = kill_tree(child, limits.teardown_grace);
            return Ok(Outcome {
                exit,
                killed: Some(killed),
                peak_memory,
            });
        }

        thread::sleep(POLL);
    }
}

/// SIGKILL the whole process group, then wait at most `grace` for the reap.
fn kill_tree(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .args(["-KILL", "--", &format!("-{}", child.id())])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();

    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            _ => return None,
        }
    }
}

/// Resident memory of `root` and all its descendants.
fn tree_memory(sys: &mut System, root: Pid) -> u64 {
    sys.refresh_processes(ProcessesToUpdate::All, true);
    sys.processes()
        .iter()
        .filter(|(pid, _)| descends_from(sys, **pid, root))
        .map(|(_, p)| p.memory())
        .sum()
}

fn descends_from(sys: &System, mut pid: Pid, root: Pid) -> bool {
    for _ in 0..64 {
        if pid == root {
            return true;
        }
        match sys.process(pid).and_then(|p| p.parent()) {
            Some(parent) => pid = parent,
            None => return false,
        }
    }
    false
}

/// Keeps the first `CAPTURE_LIMIT` bytes, then reads the pipe dry so the
/// child never blocks on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<String> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            let _ = p.by_ref().take(CAPTURE_LIMIT).read_to_end(&mut buf);
            let _ = io::copy(&mut p, &mut io::sink());
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

/// pytest exit codes: 0 all passed, 1 failures, 5 nothing collected.
fn status_of(exit: ExitStatus) -> ExecutionStatus {
    match exit.code() {
        Some(0) => ExecutionStatus::Passed,
        Some(1) | Some(5) => ExecutionStatus::Failed,
        _ => ExecutionStatus::Crashed,
    }
}
