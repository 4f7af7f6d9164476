//! testgen/intent.rs
//!
//! `TestIntent`: what one test is for, independent of which pipeline found
//! it. Built once by the analyzer or the mapper, then shared behind `Arc`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 7] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Patch,
        HttpMethod::Delete,
        HttpMethod::Head,
        HttpMethod::Options,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Endpoint { method: HttpMethod, path: String },
    Function { name: String, signature: String },
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Endpoint { method, path } => write!(f, "{method} {path}"),
            Target::Function { signature, .. } => write!(f, "{signature}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixture {
    pub name: String,
    pub scope: String,
    pub yields: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionStyle {
    Assert,
    PytestRaises,
    UnittestAssert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    pub style: AssertionStyle,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Bearer,
    Basic,
    ApiKey,
    Custom,
}

/// Traffic-derived detail. Empty for golden intents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointShape {
    pub status_codes: Vec<u16>,
    pub query_params: Vec<String>,
    pub path_params: Vec<String>,
    pub auth: Option<AuthKind>,
    pub request_schema: Option<Value>,
    pub response_schema: Option<Value>,
    pub sample_request: Option<Value>,
    pub sample_response: Option<Value>,
    pub depends_on: Vec<String>,
    pub mean_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    Golden { file: String, test_name: String },
    Observed { capture: String, samples: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestIntent {
    pub id: String,
    pub target: Target,
    pub description: Option<String>,
    pub fixtures: Vec<Fixture>,
    pub parameters: Vec<String>,
    pub assertions: Vec<Assertion>,
    pub shape: EndpointShape,
    pub provenance: Provenance,
}

impl TestIntent {
    pub fn new(target: Target, provenance: Provenance) -> Self {
        let id = compute_id(&target, &provenance);
        Self {
            id,
            target,
            description: None,
            fixtures: Vec::new(),
            parameters: Vec::new(),
            assertions: Vec::new(),
            shape: EndpointShape::default(),
            provenance,
        }
    }

    pub fn with_description(mut self, d: Option<String>) -> Self {
        self.description = d;
        self
    }

    pub fn with_fixtures(mut self, f: Vec<Fixture>) -> Self {
        self.fixtures = f;
        self
    }

    pub fn with_parameters(mut self, p: Vec<String>) -> Self {
        self.parameters = p;
        self
    }

    pub fn with_assertions(mut self, a: Vec<Assertion>) -> Self {
        self.assertions = a;
        self
    }

    pub fn with_shape(mut self, s: EndpointShape) -> Self {
        self.shape = s;
        self
    }

    /// `(method, normalized path)` for endpoint intents.
    pub fn endpoint(&self) -> Option<(HttpMethod, &str)> {
        match &self.target {
            Target::Endpoint { method, path } => Some((*method, path.as_str())),
            Target::Function { .. } => None,
        }
    }
}

/// Stable across runs: hash of target and provenance.
fn compute_id(target: &Target, provenance: &Provenance) -> String {
    let mut h = Sha256::new();
    h.update(target.to_string().as_bytes());
    match provenance {
        Provenance::Golden { file, test_name } => {
            h.update(file.as_bytes());
            h.update(test_name.as_bytes());
        }
        Provenance::Observed { capture, .. } => h.update(capture.as_bytes()),
    }
    hex::encode(&h.finalize()[..8])
}
