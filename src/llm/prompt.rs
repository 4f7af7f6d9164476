use sha2::{Digest, Sha256};

use crate::error::ScrubError;
use crate::privacy::{Scrubber, ScrubbedText};
use crate::testgen::candidate::GenerationRequest;
use crate::testgen::intent::{Target, TestIntent};

const PROMPT_ABI_VERSION: &str = "v1-testforge-generate";

/// Golden sources are cut to this many characters each.
const GOLDEN_EXAMPLE_LIMIT: usize = 4_000;
const FEEDBACK_LIMIT: usize = 3_000;

/// Raw prompt. Never leaves the process; see `ScrubbedPrompt`.
#[derive(Debug, Clone)]
pub struct LlmPrompt {
    pub system: String,
    pub user: String,
}

/// The only prompt shape the gateway accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrubbedPrompt {
    pub system: ScrubbedText,
    pub user: ScrubbedText,
    pub redactions: usize,
}

impl LlmPrompt {
    pub fn scrub(&self, scrubber: &Scrubber) -> Result<ScrubbedPrompt, ScrubError> {
        let system = scrubber.scrub(&self.system)?;
        let user = scrubber.scrub(&self.user)?;
        Ok(ScrubbedPrompt {
            redactions: system.replacements.len() + user.replacements.len(),
            system: system.text,
            user: user.text,
        })
    }
}

impl ScrubbedPrompt {
    pub fn hash(&self) -> String {
        let mut h = Sha256::new();
        h.update(PROMPT_ABI_VERSION.as_bytes());
        h.update(self.system.as_str().as_bytes());
        h.update(self.user.as_str().as_bytes());
        hex::encode(h.finalize())
    }

    pub fn len(&self) -> usize {
        self.system.as_str().len() + self.user.as_str().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn build_prompt(req: &GenerationRequest) -> LlmPrompt {
    LlmPrompt {
        system: system_prompt(req),
        user: user_prompt(req),
    }
}

/* ============================================================
   System prompt (stable per style guide)
   ============================================================ */

fn system_prompt(req: &GenerationRequest) -> String {
    let mut out = String::from(
        r#"
You are an expert test engineer. You write pytest modules that exercise a running HTTP service.

Rules:
- Output a single Python module, nothing else
- Every test function name starts with test_
- Every test has at least one meaningful assertion
- Check status codes AND response content where possible
- Read the service location from the BASE_URL environment variable or the base_url fixture
- Never hard-code credentials, tokens, or personal data; values like REDACTED_* are placeholders, keep them as opaque strings
- Never spawn processes, open raw sockets, or write outside the current directory
- Tests must be deterministic and independent
"#
        .trim(),
    );

    out.push_str("\n\nSTYLE GUIDE (match it)\n");
    out.push_str(&req.style.render());
    out
}

/* ============================================================
   User prompt (derived from intents and feedback)
   ============================================================ */

fn user_prompt(req: &GenerationRequest) -> String {
    let mut out = String::new();

    out.push_str("CONTEXT\n");
    out.push_str(&format!("Base URL: {}\n", req.base_url));
    if !req.app_description.trim().is_empty() {
        out.push_str(&format!("Application: {}\n", req.app_description.trim()));
    }
    out.push_str(&format!("Attempt: {}\n\n", req.attempt));

    out.push_str(&format!(
        "TEST INTENTS ({} total, write up to {} tests)\n",
        req.intents.len(),
        req.num_tests
    ));
    for (i, intent) in req.intents.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, describe_intent(intent)));
    }

    if !req.golden_examples.is_empty() {
        out.push_str("\nGOLDEN EXAMPLES\n");
        for g in req.golden_examples.iter() {
            out.push_str("```python\n");
            out.push_str(truncate(g, GOLDEN_EXAMPLE_LIMIT));
            out.push_str("\n```\n");
        }
    }

    if let Some(feedback) = &req.feedback {
        out.push_str("\nPREVIOUS ATTEMPT WAS REJECTED\n");
        out.push_str(truncate(feedback, FEEDBACK_LIMIT));
        out.push_str("\nFix these problems in the new module.\n");
    }

    out.push_str("\nOUTPUT\nReturn only the complete Python test module.\n");
    out
}

fn describe_intent(intent: &TestIntent) -> String {
    let mut line = match &intent.target {
        Target::Endpoint { method, path } => format!("{method} {path}"),
        Target::Function { signature, .. } => format!("call {signature}"),
    };

    if let Some(d) = &intent.description {
        line.push_str(&format!(" -- {d}"));
    }

    let s = &intent.shape;
    if !s.status_codes.is_empty() {
        let codes: Vec<String> = s.status_codes.iter().map(u16::to_string).collect();
        line.push_str(&format!("\n   observed status: {}", codes.join(", ")));
    }
    if !s.path_params.is_empty() {
        line.push_str(&format!("\n   path params: {}", s.path_params.join(", ")));
    }
    if !s.query_params.is_empty() {
        line.push_str(&format!("\n   query params: {}", s.query_params.join(", ")));
    }
    if let Some(auth) = s.auth {
        line.push_str(&format!("\n   auth: {auth:?}"));
    }
    if let Some(schema) = &s.request_schema {
        line.push_str(&format!("\n   request body: {schema}"));
    }
    if let Some(schema) = &s.response_schema {
        line.push_str(&format!("\n   response body: {schema}"));
    }
    if !s.depends_on.is_empty() {
        line.push_str(&format!("\n   needs first: {}", s.depends_on.join(", ")));
    }
    if !intent.fixtures.is_empty() {
        let names: Vec<&str> = intent.fixtures.iter().map(|f| f.name.as_str()).collect();
        line.push_str(&format!("\n   fixtures: {}", names.join(", ")));
    }
    for a in intent.assertions.iter().take(4) {
        line.push_str(&format!("\n   expect: {}", a.text));
    }
    line
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privacy::PiiPolicy;

    #[test]
    fn scrubbed_prompt_hash_is_content_addressed() {
        let scrubber = Scrubber::new(PiiPolicy::standard());
        let p = LlmPrompt {
            system: "sys".into(),
            user: "email bob@example.com please".into(),
        };
        let a = p.scrub(&scrubber).unwrap();
        let b = p.scrub(&scrubber).unwrap();

        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.redactions, 1);
        assert_eq!(a.user.as_str(), "email REDACTED_EMAIL_1 please");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
