//! config.rs
//!
//! Process-wide configuration. Loaded once at start-up, validated, then
//! shared read-only behind an `Arc`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::state::IsolationMode;

pub const ENV_PREFIX: &str = "TESTFORGE_";
const LOCAL_CONFIG: &str = "testforge.toml";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(alias = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
    Replay,
}

impl ProviderKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Some(ProviderKind::OpenAi),
            "anthropic" => Some(ProviderKind::Anthropic),
            "ollama" => Some(ProviderKind::Ollama),
            "replay" => Some(ProviderKind::Replay),
            _ => None,
        }
    }

    pub fn is_remote(self) -> bool {
        matches!(self, ProviderKind::OpenAi | ProviderKind::Anthropic)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_transport_retries: u32,
    pub backoff_base_ms: u64,
    /// JSON array of canned responses for the `replay` provider.
    pub replay_file: Option<PathBuf>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: "gpt-4o".into(),
            api_key: String::new(),
            base_url: None,
            temperature: 0.2,
            max_tokens: 4096,
            timeout_secs: 60,
            max_transport_retries: 3,
            backoff_base_ms: 350,
            replay_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub max_parallel_runs: usize,
    pub num_tests: usize,
    pub base_url: String,
    pub app_description: String,
    pub min_quality_score: f64,
    pub flaky_reruns: u32,
    /// Hosts a generated test may talk to besides the base URL host.
    pub allowed_hosts: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            max_parallel_runs: 4,
            num_tests: 10,
            base_url: "http://localhost:5000".into(),
            app_description: String::new(),
            min_quality_score: 0.5,
            flaky_reruns: 0,
            allowed_hosts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub policy_file: Option<PathBuf>,
    pub python: String,
    pub timeout_secs: u64,
    pub memory_mb: u64,
    pub cpu_secs: u64,
    pub teardown_grace_ms: u64,
    pub allow_network: bool,
    /// `launcher` (default) fails closed when the launcher is missing;
    /// `process` is an explicit opt-in to run without one.
    pub isolation: IsolationMode,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            policy_file: None,
            python: "python3".into(),
            timeout_secs: 60,
            memory_mb: 512,
            cpu_secs: 60,
            teardown_grace_ms: 500,
            allow_network: false,
            isolation: IsolationMode::Launcher,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraPattern {
    pub category: String,
    pub regex: String,
    #[serde(default)]
    pub secret: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    pub extra_patterns: Vec<ExtraPattern>,
    pub disabled_categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub workspace_dir: PathBuf,
    pub history_file: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from(".testforge"),
            history_file: "runs.jsonl".into(),
        }
    }
}

impl StoreConfig {
    pub fn history_path(&self) -> PathBuf {
        self.workspace_dir.join(&self.history_file)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub sandbox: SandboxConfig,
    pub privacy: PrivacyConfig,
    pub store: StoreConfig,
}

impl ForgeConfig {
    /// Resolve, parse, apply environment overrides and validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match resolve_path(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(p) = var("LLM_PROVIDER") {
            self.llm.provider = ProviderKind::parse(&p)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown provider `{p}`")))?;
        }
        if let Some(m) = var("LLM_MODEL") {
            self.llm.model = m;
        }
        if let Some(k) = var("LLM_API_KEY") {
            self.llm.api_key = k;
        }
        if let Some(u) = var("LLM_BASE_URL") {
            self.llm.base_url = Some(u);
        }
        if let Some(r) = var("MAX_RETRIES") {
            self.pipeline.max_retries = r
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("MAX_RETRIES is not a number: {r}")))?;
        }
        if let Some(t) = var("TIMEOUT_SECONDS") {
            self.sandbox.timeout_secs = t.parse().map_err(|_| {
                ConfigError::Invalid(format!("TIMEOUT_SECONDS is not a number: {t}"))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |m: &str| Err(ConfigError::Invalid(m.to_string()));

        if self.llm.model.trim().is_empty() && self.llm.provider != ProviderKind::Replay {
            return invalid("llm.model must not be empty");
        }
        if self.llm.provider.is_remote() && self.llm.api_key.trim().is_empty() {
            return invalid("llm.api_key is required for remote providers");
        }
        if self.llm.provider == ProviderKind::Replay && self.llm.replay_file.is_none() {
            return invalid("llm.replay_file is required for the replay provider");
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return invalid("llm.temperature must be within 0.0..=2.0");
        }
        if self.llm.max_tokens == 0 || self.llm.timeout_secs == 0 {
            return invalid("llm.max_tokens and llm.timeout_secs must be positive");
        }
        if self.pipeline.max_parallel_runs == 0 {
            return invalid("pipeline.max_parallel_runs must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.pipeline.min_quality_score) {
            return invalid("pipeline.min_quality_score must be within 0.0..=1.0");
        }
        if self.sandbox.timeout_secs == 0 || self.sandbox.memory_mb == 0 || self.sandbox.cpu_secs == 0
        {
            return invalid("sandbox limits must be positive");
        }
        if self.sandbox.python.trim().is_empty() {
            return invalid("sandbox.python must name an interpreter");
        }
        for p in &self.privacy.extra_patterns {
            if let Err(e) = regex::Regex::new(&p.regex) {
                return Err(ConfigError::Invalid(format!(
                    "privacy pattern `{}` does not compile: {e}",
                    p.category
                )));
            }
        }
        Ok(())
    }
}

fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }

    let local = PathBuf::from(LOCAL_CONFIG);
    if local.is_file() {
        return Some(local);
    }

    let global = dirs::config_dir()?.join("testforge").join("config.toml");
    global.is_file().then_some(global)
}
