//! executor/policy.rs
//!
//! Sandbox policy: a deny-by-default syscall allow-list plus an optional
//! launcher that enforces it (bubblewrap, nsjail, a container runtime...).
//! Loaded from TOML; the launcher receives the policy file path.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// Server-side socket calls. Client calls stay allowed so tests can reach
/// the service under test; `allow_network` governs everything beyond it.
const LISTEN_SYSCALLS: &[&str] = &["bind", "listen", "accept", "accept4"];

const BASELINE_SYSCALLS: &[&str] = &[
    "read", "write", "openat", "close", "fstat", "newfstatat", "lseek", "mmap", "munmap",
    "mprotect", "brk", "rt_sigaction", "rt_sigprocmask", "ioctl", "pread64", "readlink",
    "getdents64", "getcwd", "execve", "exit", "exit_group", "futex", "clone", "clone3", "wait4",
    "getpid", "getuid", "geteuid", "getgid", "getegid", "uname", "fcntl", "dup", "dup2", "pipe2",
    "getrandom", "clock_gettime", "sysinfo", "prlimit64", "set_tid_address", "set_robust_list",
    "rseq", "arch_prctl", "sched_getaffinity", "mkdirat", "unlinkat", "statx", "socket",
    "connect", "sendto", "recvfrom", "getsockopt", "setsockopt", "getsockname", "getpeername",
    "poll", "ppoll", "epoll_create1", "epoll_ctl", "epoll_wait",
];

/// Read-only host root, writable scratch only, private /tmp, pid and ipc
/// namespaces. The network namespace is shared so the service under test
/// stays reachable; offline runs rely on the proxy blackhole.
const DEFAULT_LAUNCHER: &[&str] = &[
    "bwrap", "--die-with-parent", "--new-session", "--unshare-pid", "--unshare-ipc",
    "--unshare-uts", "--ro-bind", "/", "/", "--dev", "/dev", "--proc", "/proc", "--tmpfs", "/tmp",
    "--bind", "{scratch}", "{scratch}", "--chdir", "{scratch}", "--",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    pub default_action: String,
    pub allow_syscalls: Vec<String>,
    pub allow_network: bool,
    /// argv template; `{scratch}`, `{policy}`, `{memory_mb}`, `{cpu_secs}`,
    /// `{network}` are substituted. The test command is appended.
    pub launcher: Vec<String>,
    /// Host env vars passed through (everything else is cleared).
    pub env_passthrough: Vec<String>,
    /// Refuse to run when no launcher is configured.
    pub require_launcher: bool,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            default_action: "deny".into(),
            allow_syscalls: BASELINE_SYSCALLS.iter().map(|s| s.to_string()).collect(),
            allow_network: false,
            launcher: DEFAULT_LAUNCHER.iter().map(|s| s.to_string()).collect(),
            env_passthrough: vec!["PATH".into(), "LANG".into()],
            require_launcher: true,
        }
    }
}

impl SandboxPolicy {
    /// No launcher: scratch dir, cleared env, rlimits and a process group
    /// only. The host filesystem is not protected.
    pub fn process_only() -> Self {
        Self {
            launcher: Vec::new(),
            require_launcher: false,
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, SandboxError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| SandboxError::Policy(format!("cannot read {}: {e}", path.display())))?;
        let policy: Self = toml::from_str(&raw)
            .map_err(|e| SandboxError::Policy(format!("{}: {e}", path.display())))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.default_action != "deny" {
            return Err(SandboxError::Policy(format!(
                "default_action must be \"deny\", got {:?}",
                self.default_action
            )));
        }
        if self.allow_syscalls.is_empty() {
            return Err(SandboxError::Policy("allow_syscalls is empty".into()));
        }
        if !self.allow_network {
            if let Some(s) = self
                .allow_syscalls
                .iter()
                .find(|s| LISTEN_SYSCALLS.contains(&s.as_str()))
            {
                return Err(SandboxError::Policy(format!(
                    "syscall `{s}` allowed while network is disabled"
                )));
            }
        }
        if self.require_launcher && self.launcher.is_empty() {
            return Err(SandboxError::Policy(
                "require_launcher is set but no launcher is configured".into(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, SandboxError> {
        toml::to_string_pretty(self).map_err(|e| SandboxError::Policy(e.to_string()))
    }

    /// Launcher argv with placeholders filled in.
    pub fn launcher_argv(&self, vars: &LauncherVars) -> Vec<String> {
        self.launcher
            .iter()
            .map(|a| {
                a.replace("{scratch}", &vars.scratch.display().to_string())
                    .replace("{policy}", &vars.policy.display().to_string())
                    .replace("{memory_mb}", &vars.memory_mb.to_string())
                    .replace("{cpu_secs}", &vars.cpu_secs.to_string())
                    .replace(
                        "{network}",
                        if self.allow_network { "host" } else { "none" },
                    )
            })
            .collect()
    }
}

pub struct LauncherVars {
    pub scratch: PathBuf,
    pub policy: PathBuf,
    pub memory_mb: u64,
    pub cpu_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_deny_and_offline() {
        let p = SandboxPolicy::default();
        assert!(p.validate().is_ok());
        assert!(!p.allow_network);
        assert!(!p.allow_syscalls.iter().any(|s| s == "listen"));
    }

    #[test]
    fn default_policy_requires_a_launcher() {
        let p = SandboxPolicy::default();
        assert!(p.require_launcher);
        assert_eq!(p.launcher.first().map(String::as_str), Some("bwrap"));

        let bare = SandboxPolicy {
            launcher: Vec::new(),
            ..SandboxPolicy::default()
        };
        assert!(matches!(bare.validate(), Err(SandboxError::Policy(_))));
        assert!(SandboxPolicy::process_only().validate().is_ok());
    }

    #[test]
    fn allow_by_default_is_refused() {
        let p: SandboxPolicy = toml::from_str(r#"default_action = "allow""#).unwrap();
        assert!(matches!(p.validate(), Err(SandboxError::Policy(_))));
    }

    #[test]
    fn listening_needs_network() {
        let mut p = SandboxPolicy::default();
        p.allow_syscalls.push("listen".into());
        assert!(p.validate().is_err());
        p.allow_network = true;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn launcher_placeholders_are_filled() {
        let p: SandboxPolicy = toml::from_str(
            r#"
            launcher = ["bwrap", "--bind", "{scratch}", "/work", "--seccomp-policy", "{policy}", "--net={network}", "--mem={memory_mb}"]
            "#,
        )
        .unwrap();
        let argv = p.launcher_argv(&LauncherVars {
            scratch: "/tmp/s".into(),
            policy: "/tmp/s/policy.toml".into(),
            memory_mb: 256,
            cpu_secs: 10,
        });
        assert_eq!(
            argv,
            vec![
                "bwrap",
                "--bind",
                "/tmp/s",
                "/work",
                "--seccomp-policy",
                "/tmp/s/policy.toml",
                "--net=none",
                "--mem=256"
            ]
        );
    }

    #[test]
    fn load_reads_and_validates_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        fs::write(
            &path,
            "default_action = \"deny\"\nallow_syscalls = [\"read\"]\nrequire_launcher = false\nlauncher = []\n",
        )
        .unwrap();
        let p = SandboxPolicy::load(&path).unwrap();
        assert_eq!(p.allow_syscalls, vec!["read"]);
        assert!(SandboxPolicy::load(&dir.path().join("missing.toml")).is_err());
    }
}
