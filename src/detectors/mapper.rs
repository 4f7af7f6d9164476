//! detectors/mapper.rs
//!
//! Observed exchanges -> one `TestIntent` per distinct endpoint
//! `(method, normalized path)`, enriched with what the traffic showed:
//! status codes, params, auth, inferred body schemas and create-before-use
//! dependencies.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::detectors::observer::ObservedExchange;
use crate::detectors::path::{normalize_path, PARAM};
use crate::testgen::intent::{
    Assertion, AssertionStyle, AuthKind, EndpointShape, HttpMethod, Provenance, Target, TestIntent,
};

const SKIP_COMMON_HEADERS: &[&str] = &[
    "host",
    "user-agent",
    "accept",
    "accept-encoding",
    "accept-language",
    "connection",
    "content-length",
    "content-type",
    "cookie",
    "authorization",
];

#[derive(Debug, Default)]
pub struct EndpointMap {
    pub intents: Vec<Arc<TestIntent>>,
    pub auth_patterns: Vec<String>,
    pub common_headers: BTreeMap<String, String>,
}

pub fn map_exchanges(capture: &str, exchanges: &[ObservedExchange]) -> EndpointMap {
    let mut grouped: BTreeMap<(HttpMethod, String), Vec<&ObservedExchange>> = BTreeMap::new();
    for ex in exchanges {
        if let Some(path) = normalize_path(&ex.path) {
            grouped.entry((ex.method, path)).or_default().push(ex);
        }
    }

    let creators: BTreeMap<String, String> = grouped
        .keys()
        .filter(|(m, p)| *m == HttpMethod::Post && !p.contains(PARAM))
        .filter_map(|(m, p)| resource_of(p).map(|r| (r, format!("{m} {p}"))))
        .collect();

    let intents = grouped
        .iter()
        .map(|((method, path), group)| {
            let mut shape = endpoint_shape(path, group);
            if path.contains(PARAM) {
                if let Some(dep) = resource_of(path).and_then(|r| creators.get(&r)) {
                    shape.depends_on.push(dep.clone());
                }
            }

            let assertions = expected_assertions(&shape);
            let parameters = shape.path_params.clone();

            Arc::new(
                TestIntent::new(
                    Target::Endpoint {
                        method: *method,
                        path: path.clone(),
                    },
                    Provenance::Observed {
                        capture: capture.to_string(),
                        samples: group.len(),
                    },
                )
                .with_parameters(parameters)
                .with_assertions(assertions)
                .with_shape(shape),
            )
        })
        .collect();

    EndpointMap {
        intents,
        auth_patterns: auth_patterns(exchanges),
        common_headers: common_headers(exchanges),
    }
}

fn endpoint_shape(path: &str, group: &[&ObservedExchange]) -> EndpointShape {
    let status_codes: BTreeSet<u16> = group.iter().map(|e| e.status).collect();
    let query_params: BTreeSet<String> = group
        .iter()
        .flat_map(|e| e.query.keys().cloned())
        .collect();

    let auth = group
        .iter()
        .find_map(|e| e.request_headers.get("authorization").map(|v| auth_kind(v)))
        .or_else(|| {
            group
                .iter()
                .any(|e| e.request_headers.contains_key("x-api-key"))
                .then_some(AuthKind::ApiKey)
        });

    let request_schema = group
        .iter()
        .find_map(|e| e.request_body.as_ref().and_then(Value::as_object))
        .map(infer_schema);

    let success = group
        .iter()
        .find(|e| (200..400).contains(&e.status) && e.response_body.is_some());
    let sample_response = success.and_then(|e| e.response_body.clone());
    let response_schema = sample_response
        .as_ref()
        .and_then(Value::as_object)
        .map(infer_schema);

    let durations: Vec<f64> = group.iter().filter_map(|e| e.duration_ms).collect();
    let mean_duration_ms =
        (!durations.is_empty()).then(|| durations.iter().sum::<f64>() / durations.len() as f64);

    EndpointShape {
        status_codes: status_codes.into_iter().collect(),
        query_params: query_params.into_iter().collect(),
        path_params: path_param_names(path),
        auth,
        request_schema,
        response_schema,
        sample_request: group.iter().find_map(|e| e.request_body.clone()),
        sample_response,
        depends_on: Vec::new(),
        mean_duration_ms,
    }
}

fn auth_kind(header: &str) -> AuthKind {
    if header.starts_with("Bearer ") {
        AuthKind::Bearer
    } else if header.starts_with("Basic ") {
        AuthKind::Basic
    } else {
        AuthKind::Custom
    }
}

/// `{"id": 1, "tags": []}` -> `{"id": "integer", "tags": "array"}`.
pub fn infer_schema(obj: &Map<String, Value>) -> Value {
    let fields = obj
        .iter()
        .map(|(k, v)| {
            let t = match v {
                Value::String(_) => Value::from("string"),
                Value::Bool(_) => Value::from("boolean"),
                Value::Number(n) if n.is_i64() || n.is_u64() => Value::from("integer"),
                Value::Number(_) => Value::from("number"),
                Value::Array(_) => Value::from("array"),
                Value::Object(inner) => infer_schema(inner),
                Value::Null => Value::from("nullable"),
            };
            (k.clone(), t)
        })
        .collect();
    Value::Object(fields)
}

/// `/api/users/{param}/posts/{param}` -> `["user_id", "post_id"]`.
fn path_param_names(path: &str) -> Vec<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    segments
        .iter()
        .enumerate()
        .filter(|(_, s)| s.contains(PARAM))
        .map(|(i, _)| match i.checked_sub(1).map(|j| segments[j]) {
            Some(prev) if !prev.contains(PARAM) => {
                let singular = prev.strip_suffix('s').unwrap_or(prev);
                format!("{}_id", singular.replace('-', "_"))
            }
            _ => format!("param{}", i + 1),
        })
        .collect()
}

/// First segment that names a resource, skipping `api` and version prefixes.
fn resource_of(path: &str) -> Option<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .find(|s| {
            *s != "api"
                && !(s.starts_with('v') && s.len() > 1 && s[1..].chars().all(|c| c.is_ascii_digit()))
        })
        .filter(|s| !s.contains(PARAM))
        .map(str::to_owned)
}

fn expected_assertions(shape: &EndpointShape) -> Vec<Assertion> {
    let mut out = Vec::new();
    match shape.status_codes.as_slice() {
        [] => {}
        [one] => out.push(Assertion {
            style: AssertionStyle::Assert,
            text: format!("assert response.status_code == {one}"),
        }),
        many => {
            let list: Vec<String> = many.iter().map(u16::to_string).collect();
            out.push(Assertion {
                style: AssertionStyle::Assert,
                text: format!("assert response.status_code in ({})", list.join(", ")),
            });
        }
    }
    if let Some(Value::Object(fields)) = &shape.response_schema {
        for key in fields.keys().take(5) {
            out.push(Assertion {
                style: AssertionStyle::Assert,
                text: format!("assert \"{key}\" in response.json()"),
            });
        }
    }
    out
}

fn auth_patterns(exchanges: &[ObservedExchange]) -> Vec<String> {
    let mut out = BTreeSet::new();
    for ex in exchanges {
        if let Some(v) = ex.request_headers.get("authorization") {
            out.insert(match auth_kind(v) {
                AuthKind::Bearer => "Bearer token",
                AuthKind::Basic => "Basic auth",
                _ => "Custom auth header",
            });
        }
        if ex.request_headers.contains_key("x-api-key") {
            out.insert("API key header");
        }
        if ex.request_headers.contains_key("cookie") {
            out.insert("Cookie-based session");
        }
    }
    out.into_iter().map(str::to_owned).collect()
}

/// Headers every request carried, minus transport noise and credentials.
fn common_headers(exchanges: &[ObservedExchange]) -> BTreeMap<String, String> {
    let Some(first) = exchanges.first() else {
        return BTreeMap::new();
    };
    first
        .request_headers
        .iter()
        .filter(|(k, _)| !SKIP_COMMON_HEADERS.contains(&k.as_str()))
        .filter(|(k, _)| exchanges.iter().all(|e| e.request_headers.contains_key(*k)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ex(method: HttpMethod, path: &str, status: u16) -> ObservedExchange {
        ObservedExchange {
            method,
            url: format!("http://localhost:5000{path}"),
            path: path.into(),
            query: BTreeMap::new(),
            request_headers: BTreeMap::from([("x-tenant".to_string(), "acme".to_string())]),
            request_body: None,
            status,
            response_headers: BTreeMap::new(),
            response_body: None,
            duration_ms: Some(10.0),
        }
    }

    #[test]
    fn groups_by_normalized_endpoint() {
        let mut a = ex(HttpMethod::Get, "/users/42", 200);
        a.response_body = Some(json!({"id": 42, "name": "x", "tags": [], "meta": {"ok": true}}));
        a.request_headers
            .insert("authorization".into(), "Bearer t0k3n".into());
        let b = ex(HttpMethod::Get, "/users/43", 404);
        let mut c = ex(HttpMethod::Post, "/users", 201);
        c.request_body = Some(json!({"name": "y", "score": 1.5}));

        let map = map_exchanges("cap.har", &[a, b, c]);
        assert_eq!(map.intents.len(), 2);

        let get = map
            .intents
            .iter()
            .find(|i| i.endpoint() == Some((HttpMethod::Get, "/users/{param}")))
            .unwrap();
        assert_eq!(get.shape.status_codes, vec![200, 404]);
        assert_eq!(get.shape.auth, Some(AuthKind::Bearer));
        assert_eq!(get.shape.path_params, vec!["user_id"]);
        assert_eq!(get.shape.depends_on, vec!["POST /users"]);
        assert_eq!(
            get.shape.response_schema,
            Some(json!({"id": "integer", "name": "string", "tags": "array", "meta": {"ok": "boolean"}}))
        );
        assert_eq!(
            get.assertions[0].text,
            "assert response.status_code in (200, 404)"
        );
        assert!(matches!(get.provenance, Provenance::Observed { samples: 2, .. }));

        let post = map
            .intents
            .iter()
            .find(|i| i.endpoint() == Some((HttpMethod::Post, "/users")))
            .unwrap();
        assert_eq!(
            post.shape.request_schema,
            Some(json!({"name": "string", "score": "number"}))
        );

        assert_eq!(map.auth_patterns, vec!["Bearer token"]);
        assert_eq!(map.common_headers["x-tenant"], "acme");
    }

    #[test]
    fn versioned_prefixes_are_not_resources() {
        assert_eq!(resource_of("/api/v1/orders").as_deref(), Some("orders"));
        assert_eq!(resource_of("/{param}"), None);
    }
}
