//! error.rs
//!
//! Failure taxonomy for the pipeline. Test outcomes (pass, fail, crash,
//! timeout) are data and live in `state.rs`, not here.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Scoped to one input item; never aborts a batch.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("cannot read {path}: {message}")]
    Unreadable { path: String, message: String },

    #[error("{path} is not valid python: {message}")]
    Syntax { path: String, message: String },

    #[error("malformed capture record in {path} (entry {index}): {message}")]
    MalformedRecord {
        path: String,
        index: usize,
        message: String,
    },

    #[error("unsupported input type: {0}")]
    Unsupported(String),

    #[error("parser unavailable: {0}")]
    Parser(String),
}

/// The privacy gate fails closed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScrubError {
    #[error("payload contains encoded content that decodes to {category} data")]
    AmbiguousEncoding { category: String },

    #[error("{count} {category} match(es) survived redaction")]
    ResidualMatch { category: String, count: usize },

    #[error("payload contains control bytes that cannot be inspected")]
    OpaqueBytes,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("provider rate limited the request: {0}")]
    RateLimited(String),

    #[error("request timed out after {0}s")]
    TimedOut(u64),

    #[error("provider returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("prompt rejected by provider: {0}")]
    MalformedPrompt(String),
}

impl GatewayError {
    /// Transient errors are retried with backoff; the rest surface at once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited(_)
                | GatewayError::TimedOut(_)
                | GatewayError::ProviderUnavailable(_)
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// The model answered, but the answer is not a usable test module.
    #[error("generated output is unusable: {0}")]
    Unusable(String),

    #[error("llm transport failure: {0}")]
    Transport(#[from] GatewayError),
}

/// Infrastructure failures only: the isolated context could not be set up.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("cannot establish isolation: {0}")]
    Isolation(String),

    #[error("sandbox policy rejected: {0}")]
    Policy(String),

    #[error("scratch space unavailable: {0}")]
    Scratch(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("history store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("history record encoding: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("history record refused by privacy gate: {0}")]
    Scrub(#[from] ScrubError),
}

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Scrub(#[from] ScrubError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
