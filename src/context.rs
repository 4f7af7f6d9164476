//! context.rs
//!
//! Process-wide, read-only context threaded through the orchestrator and
//! every run. Built once from a validated `ForgeConfig`.

use std::sync::Arc;

use crate::config::ForgeConfig;
use crate::error::ForgeError;
use crate::executor::Executor;
use crate::llm::LlmGateway;
use crate::persistence::HistoryStore;
use crate::privacy::{PiiPolicy, Scrubber};
use crate::testgen::generator::Generator;
use crate::validator::Validator;

pub struct ForgeContext {
    pub config: Arc<ForgeConfig>,
    pub scrubber: Scrubber,
    pub generator: Generator,
    pub executor: Executor,
    pub validator: Validator,
    pub history: HistoryStore,
}

impl ForgeContext {
    pub fn from_config(config: ForgeConfig) -> Result<Self, ForgeError> {
        let gateway = LlmGateway::from_config(&config.llm)?;
        Self::with_gateway(config, gateway)
    }

    /// Same as `from_config` with an explicit gateway.
    pub fn with_gateway(config: ForgeConfig, gateway: LlmGateway) -> Result<Self, ForgeError> {
        let policy = PiiPolicy::from_config(&config.privacy)?;
        let executor = Executor::from_config(&config)?;
        let validator = Validator::from_config(&config, policy.clone());
        let history = HistoryStore::from_config(&config.store);

        Ok(Self {
            scrubber: Scrubber::new(policy),
            generator: Generator::new(gateway),
            executor,
            validator,
            history,
            config: Arc::new(config),
        })
    }

    /// Categories enforced by the privacy gate, for the generation record.
    pub fn scrub_categories(&self) -> Vec<String> {
        self.scrubber
            .policy()
            .patterns()
            .iter()
            .map(|p| p.category.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn context_is_shareable_across_workers() {
        assert_send_sync::<ForgeContext>();
    }

    #[test]
    fn disabled_categories_leave_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let replay = dir.path().join("r.json");
        std::fs::write(&replay, "[]").unwrap();

        let mut cfg = ForgeConfig::default();
        cfg.llm.provider = ProviderKind::Replay;
        cfg.llm.replay_file = Some(replay);
        cfg.privacy.disabled_categories = vec!["name".into()];

        let ctx = ForgeContext::from_config(cfg).unwrap();
        let cats = ctx.scrub_categories();
        assert!(cats.contains(&"EMAIL".to_string()));
        assert!(!cats.contains(&"NAME".to_string()));
    }
}
