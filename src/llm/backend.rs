use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{LlmConfig, ProviderKind};
use crate::error::{ConfigError, GatewayError};
use crate::llm::prompt::ScrubbedPrompt;
use crate::llm::CompletionOptions;

const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const OLLAMA_URL: &str = "http://localhost:11434/api/chat";

#[derive(Clone)]
pub enum LlmBackend {
    OpenAi { url: String, api_key: String },
    Anthropic { url: String, api_key: String },
    Ollama { url: String },
    Replay(Arc<ReplayBackend>),
}

impl LlmBackend {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self, ConfigError> {
        let url = |default: &str| cfg.base_url.clone().unwrap_or_else(|| default.to_string());

        Ok(match cfg.provider {
            ProviderKind::OpenAi => LlmBackend::OpenAi {
                url: url(OPENAI_URL),
                api_key: cfg.api_key.clone(),
            },
            ProviderKind::Anthropic => LlmBackend::Anthropic {
                url: url(ANTHROPIC_URL),
                api_key: cfg.api_key.clone(),
            },
            ProviderKind::Ollama => LlmBackend::Ollama {
                url: url(OLLAMA_URL),
            },
            ProviderKind::Replay => {
                let path = cfg.replay_file.as_deref().ok_or_else(|| {
                    ConfigError::Invalid("llm.replay_file is required for the replay provider".into())
                })?;
                LlmBackend::Replay(Arc::new(ReplayBackend::load(path)?))
            }
        })
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            LlmBackend::OpenAi { .. } => ProviderKind::OpenAi,
            LlmBackend::Anthropic { .. } => ProviderKind::Anthropic,
            LlmBackend::Ollama { .. } => ProviderKind::Ollama,
            LlmBackend::Replay(_) => ProviderKind::Replay,
        }
    }

    /// One request, no retries.
    pub fn send(
        &self,
        http: &Client,
        prompt: &ScrubbedPrompt,
        opts: &CompletionOptions,
    ) -> Result<String, GatewayError> {
        if let LlmBackend::Replay(replay) = self {
            return replay.next(prompt);
        }

        let (url, headers, body) = self.build_request(prompt, opts);

        let mut req = http.post(url).timeout(opts.timeout()).json(&body);
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .map_err(|e| classify_transport(&e, opts.timeout_secs))?;
        let status = resp.status();
        let raw = resp
            .text()
            .map_err(|e| classify_transport(&e, opts.timeout_secs))?;

        if !status.is_success() {
            return Err(classify_status(status, &raw));
        }

        let json: Value = serde_json::from_str(&raw)
            .map_err(|e| GatewayError::MalformedResponse(format!("body is not json: {e}")))?;
        self.extract_text(&json)
    }

    fn build_request(
        &self,
        prompt: &ScrubbedPrompt,
        opts: &CompletionOptions,
    ) -> (String, Vec<(&'static str, String)>, Value) {
        let system = prompt.system.as_str();
        let user = prompt.user.as_str();

        match self {
            LlmBackend::OpenAi { url, api_key } => (
                url.clone(),
                vec![("Authorization", format!("Bearer {api_key}"))],
                json!({
                    "model": opts.model,
                    "temperature": opts.temperature,
                    "max_tokens": opts.max_tokens,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user }
                    ]
                }),
            ),

            LlmBackend::Anthropic { url, api_key } => (
                url.clone(),
                vec![
                    ("x-api-key", api_key.clone()),
                    ("anthropic-version", "2023-06-01".into()),
                ],
                json!({
                    "model": opts.model,
                    "max_tokens": opts.max_tokens,
                    "temperature": opts.temperature,
                    "system": system,
                    "messages": [ { "role": "user", "content": user } ]
                }),
            ),

            LlmBackend::Ollama { url } => (
                url.clone(),
                Vec::new(),
                json!({
                    "model": opts.model,
                    "stream": false,
                    "options": { "temperature": opts.temperature, "num_predict": opts.max_tokens },
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user }
                    ]
                }),
            ),

            LlmBackend::Replay(_) => (String::new(), Vec::new(), Value::Null),
        }
    }

    fn extract_text(&self, v: &Value) -> Result<String, GatewayError> {
        let text = match self {
            LlmBackend::OpenAi { .. } => v
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str),
            LlmBackend::Anthropic { .. } => v
                .get("content")
                .and_then(Value::as_array)
                .and_then(|blocks| {
                    blocks
                        .iter()
                        .find(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                })
                .and_then(|b| b.get("text"))
                .and_then(Value::as_str),
            LlmBackend::Ollama { .. } => v.pointer("/message/content").and_then(Value::as_str),
            LlmBackend::Replay(_) => None,
        };

        text.map(str::to_owned).ok_or_else(|| {
            GatewayError::MalformedResponse(format!("{:?} response has no text", self.kind()))
        })
    }
}

fn classify_transport(e: &reqwest::Error, timeout_secs: u64) -> GatewayError {
    if e.is_timeout() {
        GatewayError::TimedOut(timeout_secs)
    } else if e.is_decode() || e.is_body() {
        GatewayError::MalformedResponse(e.to_string())
    } else {
        GatewayError::ProviderUnavailable(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status.as_u16() {
        429 => GatewayError::RateLimited(detail),
        401 | 403 => GatewayError::Authentication(detail),
        408 | 504 => GatewayError::TimedOut(0),
        400 | 404 | 413 | 422 => GatewayError::MalformedPrompt(detail),
        _ if status.is_server_error() => GatewayError::ProviderUnavailable(detail),
        _ => GatewayError::MalformedResponse(detail),
    }
}

/* ============================================================
   Replay provider: canned responses, in order
   ============================================================ */

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ReplayEntry {
    Text(String),
    Fault { error: String },
}

pub struct ReplayBackend {
    queue: Mutex<VecDeque<ReplayEntry>>,
    transcript: Mutex<Vec<String>>,
}

impl ReplayBackend {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<ReplayEntry> =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(Self::from_entries(entries))
    }

    pub fn from_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_entries(responses.into_iter().map(|s| ReplayEntry::Text(s.into())).collect())
    }

    fn from_entries(entries: Vec<ReplayEntry>) -> Self {
        Self {
            queue: Mutex::new(entries.into()),
            transcript: Mutex::new(Vec::new()),
        }
    }

    /// Every prompt received, as sent (system, blank line, user).
    pub fn transcript(&self) -> Vec<String> {
        self.transcript
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    fn next(&self, prompt: &ScrubbedPrompt) -> Result<String, GatewayError> {
        if let Ok(mut t) = self.transcript.lock() {
            t.push(format!("{}\n\n{}", prompt.system.as_str(), prompt.user.as_str()));
        }

        let entry = self
            .queue
            .lock()
            .map_err(|_| GatewayError::ProviderUnavailable("replay queue poisoned".into()))?
            .pop_front()
            .ok_or_else(|| GatewayError::ProviderUnavailable("replay responses exhausted".into()))?;

        match entry {
            ReplayEntry::Text(t) => Ok(t),
            ReplayEntry::Fault { error } => Err(match error.as_str() {
                "rate_limited" => GatewayError::RateLimited("replayed 429".into()),
                "timeout" => GatewayError::TimedOut(0),
                "auth" => GatewayError::Authentication("replayed 401".into()),
                "bad_prompt" => GatewayError::MalformedPrompt("replayed 400".into()),
                "malformed" => GatewayError::MalformedResponse("replayed garbage".into()),
                _ => GatewayError::ProviderUnavailable(format!("replayed {error}")),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(kind: ProviderKind) -> LlmBackend {
        let cfg = LlmConfig {
            provider: kind,
            api_key: "k".into(),
            ..LlmConfig::default()
        };
        LlmBackend::from_config(&cfg).unwrap()
    }

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            GatewayError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            GatewayError::Authentication(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, ""),
            GatewayError::MalformedPrompt(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            GatewayError::ProviderUnavailable(_)
        ));
    }

    #[test]
    fn extracts_text_per_provider() {
        let openai = json!({"choices": [{"message": {"content": "def test_a(): pass"}}]});
        assert_eq!(
            backend(ProviderKind::OpenAi).extract_text(&openai).unwrap(),
            "def test_a(): pass"
        );

        let anthropic = json!({"content": [{"type": "text", "text": "x"}]});
        assert_eq!(
            backend(ProviderKind::Anthropic).extract_text(&anthropic).unwrap(),
            "x"
        );

        let ollama = json!({"message": {"content": "y"}});
        assert_eq!(backend(ProviderKind::Ollama).extract_text(&ollama).unwrap(), "y");

        assert!(matches!(
            backend(ProviderKind::OpenAi).extract_text(&json!({})),
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn replay_entries_parse_text_and_faults() {
        let entries: Vec<ReplayEntry> =
            serde_json::from_str(r#"["a", {"error": "rate_limited"}]"#).unwrap();
        assert!(matches!(entries[0], ReplayEntry::Text(_)));
        assert!(matches!(entries[1], ReplayEntry::Fault { .. }));
    }
}
