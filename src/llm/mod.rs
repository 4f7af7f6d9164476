pub mod backend;
pub mod client;
pub mod prompt;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{LlmConfig, ProviderKind};

pub use client::{Completion, LlmGateway};
pub use prompt::{build_prompt, LlmPrompt, ScrubbedPrompt};

/// Per-call model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub provider: ProviderKind,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl CompletionOptions {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            provider: cfg.provider,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            timeout_secs: cfg.timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Options for the next attempt: slightly cooler sampling.
    pub fn for_retry(&self) -> Self {
        Self {
            temperature: (self.temperature - 0.1).max(0.0),
            ..self.clone()
        }
    }
}
