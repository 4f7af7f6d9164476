//! validator/security.rs
//!
//! Static security checks on candidate source. Independent of the sandbox:
//! a candidate that would be contained is still rejected.

use tree_sitter::Node;

use crate::detectors::ast::{self, callee, descendants_of_kind, named_children, template_of, text, Piece};
use crate::privacy::PiiPolicy;
use crate::state::{Finding, FindingKind};

/// Modules whose import alone is disallowed.
const FORBIDDEN_MODULES: &[&str] = &["subprocess", "socket", "ctypes", "pty", "telnetlib", "ftplib"];

/// Callees that spawn processes, evaluate code, or open raw connections.
const FORBIDDEN_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "os.system",
    "os.popen",
    "os.fork",
    "os.kill",
    "os.killpg",
    "urllib.request.urlopen",
    "urlopen",
];

const FORBIDDEN_CALL_PREFIXES: &[&str] = &[
    "subprocess.",
    "socket.",
    "ctypes.",
    "os.exec",
    "os.spawn",
    "http.client.",
];

/// Filesystem mutations that must stay inside the scratch dir.
const FS_MUTATIONS: &[&str] = &[
    "os.remove",
    "os.unlink",
    "os.rmdir",
    "os.removedirs",
    "os.rename",
    "os.replace",
    "os.chmod",
    "os.chown",
    "os.makedirs",
    "os.mkdir",
    "shutil.rmtree",
    "shutil.move",
    "shutil.copy",
    "shutil.copyfile",
    "shutil.copytree",
];

#[derive(Debug, Clone)]
pub struct SecurityScanner {
    secrets: PiiPolicy,
    allowed_hosts: Vec<String>,
}

impl SecurityScanner {
    pub fn new(secrets: PiiPolicy, allowed_hosts: Vec<String>) -> Self {
        Self {
            secrets,
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn allowed_hosts(&self) -> &[String] {
        &self.allowed_hosts
    }

    pub fn scan(&self, source: &str) -> Vec<Finding> {
        let mut findings = Vec::new();

        for hit in self.secrets.find_secrets(source) {
            findings.push(finding(
                "credential-literal",
                format!(
                    "{} literal at byte {} ({} chars)",
                    hit.category,
                    hit.start,
                    hit.value.len()
                ),
            ));
        }

        let tree = match ast::parse_python("<candidate>", source) {
            Ok(t) => t,
            Err(e) => {
                findings.push(finding("unparseable", e.to_string()));
                return findings;
            }
        };
        let root = tree.root_node();

        for module in ast::imported_modules(root, source) {
            let top = module.split('.').next().unwrap_or(&module);
            if FORBIDDEN_MODULES.contains(&top) {
                findings.push(finding("forbidden-import", format!("imports `{module}`")));
            }
        }

        for call in descendants_of_kind(root, "call") {
            let name = callee(call, source);
            let line = ast::line_of(call);

            if FORBIDDEN_CALLS.contains(&name)
                || FORBIDDEN_CALL_PREFIXES.iter().any(|p| name.starts_with(p))
            {
                findings.push(finding(
                    "forbidden-call",
                    format!("line {line}: `{name}(...)`"),
                ));
                continue;
            }

            if let Some(detail) = write_outside_scratch(call, name, source) {
                findings.push(finding("write-outside-scratch", format!("line {line}: {detail}")));
            }
        }

        for http in ast::http_calls(root, source) {
            if let Some(host) = &http.host {
                if !self.allowed_hosts.iter().any(|h| h == host) {
                    findings.push(finding(
                        "disallowed-host",
                        format!("line {}: {} {} targets `{host}`", http.line, http.method, http.path),
                    ));
                }
            }
        }

        findings
    }
}

fn finding(rule: &str, detail: String) -> Finding {
    Finding {
        kind: FindingKind::Security,
        rule: rule.to_string(),
        detail,
    }
}

/* ---------- filesystem ---------- */

fn write_outside_scratch(call: Node, name: &str, src: &str) -> Option<String> {
    let args = call.child_by_field_name("arguments")?;
    let positional: Vec<Node> = named_children(args)
        .into_iter()
        .filter(|a| a.kind() != "keyword_argument" && a.kind() != "comment")
        .collect();

    if name == "open" || name == "io.open" {
        let path = positional.first()?;
        let mode = positional
            .get(1)
            .copied()
            .or_else(|| ast::keyword_arg(args, "mode", src))
            .and_then(|m| literal(m, src))
            .unwrap_or_else(|| "r".into());
        if !mode.contains(['w', 'a', 'x', '+']) {
            return None;
        }
        return escapes(*path, src).then(|| format!("opens `{}` for writing", text(*path, src)));
    }

    if FS_MUTATIONS.contains(&name) {
        let path = positional.first()?;
        return escapes(*path, src).then(|| format!("`{name}` on `{}`", text(*path, src)));
    }

    // Path("/etc/x").write_text(...)
    if name.ends_with(".write_text") || name.ends_with(".write_bytes") || name.ends_with(".unlink") {
        let func = call.child_by_field_name("function")?;
        let object = func.child_by_field_name("object")?;
        if object.kind() == "call" && callee(object, src).ends_with("Path") {
            let inner = object.child_by_field_name("arguments")?.named_child(0)?;
            return escapes(inner, src).then(|| format!("writes through `{}`", text(object, src)));
        }
    }

    None
}

/// A path argument escapes scratch when it is absolute, climbs with `..`,
/// or points at the home directory.
fn escapes(path: Node, src: &str) -> bool {
    let Some(pieces) = template_of(path, src) else {
        return false;
    };
    let Some(Piece::Lit(first)) = pieces.first() else {
        return false;
    };
    let rendered = ast::render_template(&pieces);
    first.starts_with('/') || first.starts_with('~') || rendered.split(['/', '\\']).any(|s| s == "..")
}

fn literal(node: Node, src: &str) -> Option<String> {
    match template_of(node, src)?.as_slice() {
        [Piece::Lit(s)] => Some(s.clone()),
        _ => None,
    }
}
