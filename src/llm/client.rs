// src/llm/client.rs

use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::error::{ConfigError, GatewayError};
use crate::llm::backend::LlmBackend;
use crate::llm::prompt::ScrubbedPrompt;
use crate::llm::CompletionOptions;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub prompt_hash: String,
    /// Requests made, including retried ones.
    pub requests: u32,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
}

impl RetryPolicy {
    /// `base * 2^(n-1)`, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// The single outbound path to a model provider.
///
/// Accepts only `ScrubbedPrompt`, so nothing reaches the wire without
/// having gone through the privacy gate.
#[derive(Clone)]
pub struct LlmGateway {
    backend: LlmBackend,
    http: Client,
    retry: RetryPolicy,
}

impl LlmGateway {
    pub fn new(backend: LlmBackend, retry: RetryPolicy) -> Result<Self, ConfigError> {
        let http = Client::builder()
            .user_agent(concat!("testforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;
        Ok(Self {
            backend,
            http,
            retry,
        })
    }

    pub fn from_config(cfg: &LlmConfig) -> Result<Self, ConfigError> {
        Self::new(
            LlmBackend::from_config(cfg)?,
            RetryPolicy {
                max_retries: cfg.max_transport_retries,
                base: Duration::from_millis(cfg.backoff_base_ms),
            },
        )
    }

    pub fn backend(&self) -> &LlmBackend {
        &self.backend
    }

    pub fn complete(
        &self,
        prompt: &ScrubbedPrompt,
        opts: &CompletionOptions,
    ) -> Result<Completion, GatewayError> {
        if opts.provider != self.backend.kind() {
            return Err(GatewayError::ProviderUnavailable(format!(
                "{:?} is not configured",
                opts.provider
            )));
        }

        let prompt_hash = prompt.hash();
        let started = Instant::now();
        let mut requests = 0u32;

        info!(
            provider = ?opts.provider,
            model = %opts.model,
            prompt_hash = %&prompt_hash[..12],
            prompt_len = prompt.len(),
            "llm request"
        );

        loop {
            requests += 1;
            match self.backend.send(&self.http, prompt, opts) {
                Ok(text) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    debug!(
                        prompt_hash = %&prompt_hash[..12],
                        response_len = text.len(),
                        requests,
                        latency_ms,
                        "llm response"
                    );
                    return Ok(Completion {
                        text,
                        prompt_hash,
                        requests,
                        latency_ms,
                    });
                }
                Err(e) if e.is_transient() && requests <= self.retry.max_retries => {
                    let delay = self.retry.delay(requests);
                    warn!(error = %e, attempt = requests, ?delay, "transient llm failure, backing off");
                    thread::sleep(delay);
                }
                Err(e) => {
                    warn!(error = %e, requests, "llm request failed");
                    return Err(e);
                }
            }
        }
    }
}
