//! detectors/observer.rs
//!
//! Captured traffic import. Two formats:
//!   - HAR (`.har`, or `.json` with a `log.entries` array)
//!   - JSON lines, one exchange per line (`.jsonl`)
//!
//! A malformed entry is skipped and reported; it never fails the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::error::InputError;
use crate::testgen::intent::HttpMethod;

#[derive(Debug, Clone, PartialEq)]
pub struct ObservedExchange {
    pub method: HttpMethod,
    pub url: String,
    /// Path as captured, before normalization.
    pub path: String,
    pub query: BTreeMap<String, String>,
    /// Header names are lower-cased.
    pub request_headers: BTreeMap<String, String>,
    pub request_body: Option<Value>,
    pub status: u16,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: Option<Value>,
    pub duration_ms: Option<f64>,
}

#[derive(Debug, Default)]
pub struct Observation {
    pub capture: String,
    pub exchanges: Vec<ObservedExchange>,
    pub skipped: Vec<InputError>,
}

pub fn load_capture(path: &Path) -> Result<Observation, InputError> {
    let origin = path.display().to_string();
    let raw = fs::read_to_string(path).map_err(|e| InputError::Unreadable {
        path: origin.clone(),
        message: e.to_string(),
    })?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    match ext.as_str() {
        "har" | "json" => parse_har(&origin, &raw),
        "jsonl" | "ndjson" => Ok(parse_jsonl(&origin, &raw)),
        other => Err(InputError::Unsupported(format!("capture format `.{other}`"))),
    }
}

/* ===================== HAR ===================== */

pub fn parse_har(origin: &str, raw: &str) -> Result<Observation, InputError> {
    let doc: Value = serde_json::from_str(raw).map_err(|e| InputError::MalformedRecord {
        path: origin.to_string(),
        index: 0,
        message: format!("not a HAR document: {e}"),
    })?;

    let entries = doc
        .pointer("/log/entries")
        .and_then(Value::as_array)
        .ok_or_else(|| InputError::MalformedRecord {
            path: origin.to_string(),
            index: 0,
            message: "missing log.entries".into(),
        })?;

    let mut obs = Observation {
        capture: origin.to_string(),
        ..Observation::default()
    };

    for (i, entry) in entries.iter().enumerate() {
        match har_entry(entry) {
            Ok(ex) => obs.exchanges.push(ex),
            Err(message) => {
                debug!(capture = origin, index = i, %message, "skipping HAR entry");
                obs.skipped.push(InputError::MalformedRecord {
                    path: origin.to_string(),
                    index: i,
                    message,
                });
            }
        }
    }

    Ok(obs)
}

fn har_entry(entry: &Value) -> Result<ObservedExchange, String> {
    let req = entry.get("request").ok_or("entry has no request")?;
    let resp = entry.get("response").ok_or("entry has no response")?;

    let method = req
        .get("method")
        .and_then(Value::as_str)
        .and_then(HttpMethod::parse)
        .ok_or("missing or unknown request method")?;
    let url = req
        .get("url")
        .and_then(Value::as_str)
        .ok_or("missing request url")?
        .to_string();

    let mut query = name_value_pairs(req.get("queryString"), false);
    if query.is_empty() {
        query = query_from_url(&url);
    }

    let req_headers = name_value_pairs(req.get("headers"), true);
    let resp_headers = name_value_pairs(resp.get("headers"), true);

    let request_body = req.get("postData").and_then(|p| {
        body_value(
            p.get("text").and_then(Value::as_str),
            p.get("mimeType").and_then(Value::as_str),
        )
    });
    let response_body = resp.get("content").and_then(|c| {
        body_value(
            c.get("text").and_then(Value::as_str),
            c.get("mimeType").and_then(Value::as_str),
        )
    });

    let status = resp.get("status").and_then(status_code).ok_or("missing response status")?;

    // HAR `time` is milliseconds; -1 means unknown.
    let duration_ms = entry
        .get("time")
        .and_then(Value::as_f64)
        .filter(|t| *t >= 0.0);

    Ok(ObservedExchange {
        method,
        path: path_of(&url),
        url,
        query,
        request_headers: req_headers,
        request_body,
        status,
        response_headers: resp_headers,
        response_body,
        duration_ms,
    })
}

fn name_value_pairs(v: Option<&Value>, lower: bool) -> BTreeMap<String, String> {
    v.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|h| {
                    let name = h.get("name")?.as_str()?;
                    let value = h.get("value")?.as_str()?;
                    let name = if lower {
                        name.to_ascii_lowercase()
                    } else {
                        name.to_string()
                    };
                    Some((name, value.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/* ===================== JSON lines ===================== */

pub fn parse_jsonl(origin: &str, raw: &str) -> Observation {
    let mut obs = Observation {
        capture: origin.to_string(),
        ..Observation::default()
    };

    for (i, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<Value>(line)
            .map_err(|e| e.to_string())
            .and_then(|v| jsonl_record(&v));

        match parsed {
            Ok(ex) => obs.exchanges.push(ex),
            Err(message) => {
                debug!(capture = origin, line = i + 1, %message, "skipping capture line");
                obs.skipped.push(InputError::MalformedRecord {
                    path: origin.to_string(),
                    index: i,
                    message,
                });
            }
        }
    }

    obs
}

fn jsonl_record(v: &Value) -> Result<ObservedExchange, String> {
    let method = v
        .get("method")
        .and_then(Value::as_str)
        .and_then(HttpMethod::parse)
        .ok_or("missing or unknown method")?;

    let url = v
        .get("url")
        .or_else(|| v.get("path"))
        .and_then(Value::as_str)
        .ok_or("missing url/path")?
        .to_string();

    let status = v
        .get("status")
        .or_else(|| v.get("status_code"))
        .and_then(status_code)
        .ok_or("missing or non-numeric status")?;

    let duration_ms = v
        .get("duration_ms")
        .and_then(Value::as_f64)
        .or_else(|| {
            v.get("duration_s")
                .or_else(|| v.get("elapsed"))
                .and_then(Value::as_f64)
                .map(|s| s * 1000.0)
        });

    let mut query = string_map(v.get("query").or_else(|| v.get("query_params")), false);
    if query.is_empty() {
        query = query_from_url(&url);
    }

    Ok(ObservedExchange {
        method,
        path: path_of(&url),
        query,
        request_headers: string_map(v.get("request_headers"), true),
        request_body: v.get("request_body").cloned().map(reparse_json_string),
        status,
        response_headers: string_map(v.get("response_headers"), true),
        response_body: v.get("response_body").cloned().map(reparse_json_string),
        duration_ms,
        url,
    })
}

fn string_map(v: Option<&Value>, lower: bool) -> BTreeMap<String, String> {
    v.and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .map(|(k, v)| {
                    let k = if lower {
                        k.to_ascii_lowercase()
                    } else {
                        k.clone()
                    };
                    let v = v.as_str().map(str::to_owned).unwrap_or_else(|| v.to_string());
                    (k, v)
                })
                .collect()
        })
        .unwrap_or_default()
}

/* ===================== Shared ===================== */

/// Integer, or a numeric string like `"200"` or `"200 OK"`.
fn status_code(v: &Value) -> Option<u16> {
    let code: u16 = match v {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok())?,
        Value::String(s) => s.split_whitespace().next()?.parse().ok()?,
        _ => return None,
    };
    (100..600).contains(&code).then_some(code)
}

fn body_value(text: Option<&str>, mime: Option<&str>) -> Option<Value> {
    let text = text.filter(|t| !t.is_empty())?;
    if mime.map(|m| m.contains("json")).unwrap_or(false) {
        if let Ok(v) = serde_json::from_str(text) {
            return Some(v);
        }
    }
    Some(Value::String(text.to_string()))
}

fn reparse_json_string(v: Value) -> Value {
    match &v {
        Value::String(s) if s.trim_start().starts_with(['{', '[']) => {
            serde_json::from_str(s).unwrap_or(v)
        }
        _ => v,
    }
}

fn path_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(u) => u.path().to_string(),
        Err(_) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}

fn query_from_url(url: &str) -> BTreeMap<String, String> {
    let parsed = url::Url::parse(url).or_else(|_| url::Url::parse(&format!("http://capture{url}")));
    parsed
        .map(|u| u.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect())
        .unwrap_or_default()
}
