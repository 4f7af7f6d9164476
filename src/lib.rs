//! testforge
//!
//! Agent pipeline that turns golden tests or observed API traffic into new
//! pytest modules: extract intents, scrub, generate, execute in a sandbox,
//! validate, retry within budget.

pub mod agent;
pub mod commands;
pub mod config;
pub mod context;
pub mod detectors;
pub mod error;
pub mod executor;
pub mod llm;
pub mod logger;
pub mod machine;
pub mod orchestrator;
pub mod persistence;
pub mod privacy;
pub mod state;
pub mod testgen;
pub mod validator;

pub use agent::CancelToken;
pub use config::ForgeConfig;
pub use context::ForgeContext;
pub use error::ForgeError;
pub use machine::RunMachine;
pub use orchestrator::{discover, BatchInput, Orchestrator};
pub use state::{PipelineRun, Stage};
