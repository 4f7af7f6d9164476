use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detectors::style::StyleGuide;
use crate::llm::CompletionOptions;
use crate::testgen::intent::TestIntent;

/// Everything one generation attempt needs.
///
/// Built by the run state machine; `attempt` and `feedback` change
/// between retries, the rest stays fixed for the run.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub run_id: Uuid,
    pub attempt: u32,
    pub intents: Vec<Arc<TestIntent>>,
    pub style: Arc<StyleGuide>,
    pub golden_examples: Arc<Vec<String>>,
    pub options: CompletionOptions,
    pub max_retries: u32,
    /// Privacy categories enforced on every outbound payload.
    pub scrub_categories: Vec<String>,
    pub base_url: String,
    pub app_description: String,
    pub num_tests: usize,
    pub feedback: Option<String>,
}

impl GenerationRequest {
    /// Same request, next attempt.
    pub fn retry(&self, feedback: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            attempt: self.attempt + 1,
            options: self.options.for_retry(),
            feedback: Some(feedback),
            ..self.clone()
        }
    }
}

/// A generated test module. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTest {
    pub request_id: Uuid,
    pub attempt: u32,
    pub source: String,
    pub test_names: Vec<String>,
    /// Hash of the scrubbed prompt that produced it.
    pub prompt_hash: String,
    /// Always true: only scrubbed prompts reach the model.
    pub scrubbed: bool,
    pub created_at: DateTime<Utc>,
}

impl CandidateTest {
    pub fn file_name(&self) -> String {
        format!("test_candidate_{}.py", self.attempt)
    }
}
