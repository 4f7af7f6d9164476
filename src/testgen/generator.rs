//! generator.rs
//!
//! Test module generation: prompt draft in, `CandidateTest` out.
//!
//! The generator never sees raw prompts on the way out. The run state
//! machine drafts with `draft`, scrubs, and hands back a `ScrubbedPrompt`.

use chrono::Utc;
use tracing::debug;

use crate::detectors::ast::{self, def_name, function_defs};
use crate::detectors::style::StyleGuide;
use crate::error::GenerationError;
use crate::llm::{build_prompt, LlmGateway, LlmPrompt, ScrubbedPrompt};
use crate::testgen::candidate::{CandidateTest, GenerationRequest};

#[derive(Clone)]
pub struct Generator {
    gateway: LlmGateway,
}

impl Generator {
    pub fn new(gateway: LlmGateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &LlmGateway {
        &self.gateway
    }

    /// Raw prompt for a request. Must be scrubbed before `generate`.
    pub fn draft(&self, req: &GenerationRequest) -> LlmPrompt {
        build_prompt(req)
    }

    pub fn generate(
        &self,
        prompt: &ScrubbedPrompt,
        req: &GenerationRequest,
    ) -> Result<CandidateTest, GenerationError> {
        let completion = self.gateway.complete(prompt, &req.options)?;
        let (source, test_names) = extract_module(&completion.text, &req.style)?;

        debug!(
            run = %req.run_id,
            attempt = req.attempt,
            tests = test_names.len(),
            source_len = source.len(),
            "candidate extracted"
        );

        Ok(CandidateTest {
            request_id: req.id,
            attempt: req.attempt,
            source,
            test_names,
            prompt_hash: completion.prompt_hash,
            scrubbed: true,
            created_at: Utc::now(),
        })
    }
}

/// Pull a runnable pytest module out of a model reply.
pub fn extract_module(
    raw: &str,
    style: &StyleGuide,
) -> Result<(String, Vec<String>), GenerationError> {
    let code = strip_fences(raw).trim().to_string();
    if code.is_empty() {
        return Err(GenerationError::Unusable("empty response".into()));
    }

    let tree = ast::parse_python("<candidate>", &code)
        .map_err(|e| GenerationError::Unusable(e.to_string()))?;
    let root = tree.root_node();

    let test_names: Vec<String> = function_defs(root, &code)
        .into_iter()
        .map(|d| def_name(d.node, &code).to_string())
        .filter(|n| n.starts_with("test"))
        .collect();
    if test_names.is_empty() {
        return Err(GenerationError::Unusable("no test functions in output".into()));
    }

    let code = if ast::import_lines(root, &code).is_empty() && !style.common_imports.is_empty() {
        format!("{}\n\n{code}", style.common_imports.join("\n"))
    } else {
        code
    };

    Ok((format!("{}\n", code.trim_end()), test_names))
}

/// Body of the longest fenced block, or the input when there is none.
fn strip_fences(raw: &str) -> &str {
    let mut best: Option<&str> = None;
    let mut rest = raw;

    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
        let body = &after[body_start..];
        let Some(close) = body.find("```") else {
            // Unterminated fence: take everything after it.
            let candidate = body;
            if best.map(|b| candidate.len() > b.len()).unwrap_or(true) {
                best = Some(candidate);
            }
            break;
        };
        let candidate = &body[..close];
        if best.map(|b| candidate.len() > b.len()).unwrap_or(true) {
            best = Some(candidate);
        }
        rest = &body[close + 3..];
    }

    best.unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_reply_is_unwrapped() {
        let raw = "Here you go:\n```python\nimport requests\n\ndef test_a():\n    assert 1 == 1\n```\nEnjoy.";
        let (src, names) = extract_module(raw, &StyleGuide::default()).unwrap();
        assert!(src.starts_with("import requests"));
        assert_eq!(names, vec!["test_a"]);
    }

    #[test]
    fn longest_fence_wins() {
        let raw = "```\nx\n```\ntext\n```python\ndef test_b():\n    assert True\n```";
        assert_eq!(strip_fences(raw), "def test_b():\n    assert True\n");
    }

    #[test]
    fn missing_imports_come_from_style() {
        let (src, _) =
            extract_module("def test_a():\n    assert True\n", &StyleGuide::default()).unwrap();
        assert!(src.starts_with("import pytest\nimport requests\n\ndef test_a"));
    }

    #[test]
    fn prose_and_testless_code_are_unusable() {
        let style = StyleGuide::default();
        assert!(matches!(
            extract_module("I cannot help with that (sorry", &style),
            Err(GenerationError::Unusable(_))
        ));
        assert!(matches!(
            extract_module("def helper():\n    return 1\n", &style),
            Err(GenerationError::Unusable(_))
        ));
        assert!(matches!(extract_module("   ", &style), Err(GenerationError::Unusable(_))));
    }
}
