//! detectors/path.rs
//!
//! Endpoint path normalization shared by both extraction pipelines, so a
//! golden `f"/users/{user_id}"` and an observed `/users/42` land on the
//! same key.

use std::sync::OnceLock;

use regex::Regex;

pub const PARAM: &str = "{param}";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[^{}]*\}|<[^<>]*>|:[A-Za-z_]\w*$").unwrap())
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .unwrap()
    })
}

fn hex_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-fA-F]{16,}$").unwrap())
}

/// Strip origin, query and fragment; collapse ids and templates to `{param}`.
///
/// Returns `None` when the input does not look like a path at all.
pub fn normalize_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    // Not `Url::parse`: it would percent-encode template braces.
    let path = if raw.starts_with("http://") || raw.starts_with("https://") {
        strip_origin(raw)?
    } else {
        raw.to_string()
    };

    let path = path
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_string();

    if !path.starts_with('/') {
        return None;
    }

    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(normalize_segment)
        .collect();

    if segments.is_empty() {
        return Some("/".into());
    }
    Some(format!("/{}", segments.join("/")))
}

fn strip_origin(raw: &str) -> Option<String> {
    let after_scheme = raw.split_once("://")?.1;
    match after_scheme.find('/') {
        Some(i) => Some(after_scheme[i..].to_string()),
        None => Some("/".into()),
    }
}

fn normalize_segment(seg: &str) -> String {
    if seg.chars().all(|c| c.is_ascii_digit()) || uuid_re().is_match(seg) || hex_id_re().is_match(seg)
    {
        return PARAM.into();
    }
    placeholder_re().replace_all(seg, PARAM).into_owned()
}

/// Names of the templated segments in an un-normalized path, e.g.
/// `/users/{user_id}` -> `["user_id"]`.
pub fn template_names(raw: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][\w.]*)\}|<(?:\w+:)?(\w+)>").unwrap());

    re.captures_iter(raw)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().rsplit('.').next().unwrap_or_default().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_and_templates_converge() {
        assert_eq!(normalize_path("/users/42").as_deref(), Some("/users/{param}"));
        assert_eq!(
            normalize_path("/users/{user_id}").as_deref(),
            Some("/users/{param}")
        );
        assert_eq!(
            normalize_path("/orders/3fa85f64-5717-4562-b3fc-2c963f66afa6/items")
                .as_deref(),
            Some("/orders/{param}/items")
        );
        assert_eq!(
            normalize_path("/files/<int:file_id>").as_deref(),
            Some("/files/{param}")
        );
    }

    #[test]
    fn origin_query_and_trailing_slash_are_dropped() {
        assert_eq!(
            normalize_path("http://localhost:5000/api/users/?page=2").as_deref(),
            Some("/api/users")
        );
        assert_eq!(
            normalize_path("http://{host}/api/items/7#frag").as_deref(),
            Some("/api/items/{param}")
        );
        assert_eq!(normalize_path("https://svc.test").as_deref(), Some("/"));
    }

    #[test]
    fn non_paths_are_rejected() {
        assert_eq!(normalize_path("users"), None);
        assert_eq!(normalize_path("   "), None);
    }

    #[test]
    fn template_names_are_collected() {
        assert_eq!(
            template_names("/users/{user_id}/posts/{post.id}"),
            vec!["user_id", "id"]
        );
        assert_eq!(template_names("/files/<int:file_id>"), vec!["file_id"]);
    }
}
