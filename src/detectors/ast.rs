//! detectors/ast.rs
//!
//! Python AST helpers on top of tree-sitter: parsing, walking, string
//! templates and HTTP call-site detection.

use std::cell::RefCell;

use tree_sitter::{Node, Parser, Tree};

use crate::detectors::path::normalize_path;
use crate::error::InputError;
use crate::testgen::intent::HttpMethod;

thread_local! {
    static PY_PARSER: RefCell<Option<Parser>> = RefCell::new(make_python_parser());
}

fn make_python_parser() -> Option<Parser> {
    let mut p = Parser::new();
    p.set_language(&tree_sitter_python::language()).ok()?;
    Some(p)
}

/// Parse a whole module. A tree with error nodes is rejected.
pub fn parse_python(origin: &str, source: &str) -> Result<Tree, InputError> {
    let tree = PY_PARSER
        .with(|p| p.borrow_mut().as_mut().and_then(|p| p.parse(source, None)))
        .ok_or_else(|| InputError::Parser("tree-sitter python grammar failed to load".into()))?;

    let root = tree.root_node();
    if root.has_error() {
        let at = first_error(root)
            .map(|n| n.start_position().row + 1)
            .unwrap_or(1);
        return Err(InputError::Syntax {
            path: origin.to_string(),
            message: format!("syntax error near line {at}"),
        });
    }
    Ok(tree)
}

fn first_error(node: Node) -> Option<Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|c| c.has_error())
        .find_map(first_error)
}

pub fn text<'a>(node: Node, src: &'a str) -> &'a str {
    node.utf8_text(src.as_bytes()).unwrap_or_default()
}

pub fn line_of(node: Node) -> usize {
    node.start_position().row + 1
}

/// Pre-order walk over every named descendant, including `node`.
pub fn walk<'t>(node: Node<'t>, f: &mut impl FnMut(Node<'t>)) {
    f(node);
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        walk(child, f);
    }
}

pub fn descendants_of_kind<'t>(node: Node<'t>, kind: &str) -> Vec<Node<'t>> {
    let mut out = Vec::new();
    walk(node, &mut |n| {
        if n.kind() == kind {
            out.push(n);
        }
    });
    out
}

pub fn named_children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

/// Function definitions at module level and inside classes, with their
/// decorators (if any) and enclosing class name.
pub struct FunctionDef<'t> {
    pub node: Node<'t>,
    pub decorators: Vec<Node<'t>>,
    pub class: Option<String>,
}

pub fn function_defs<'t>(root: Node<'t>, src: &str) -> Vec<FunctionDef<'t>> {
    let mut out = Vec::new();
    collect_defs(root, src, None, &mut out);
    out
}

fn collect_defs<'t>(
    scope: Node<'t>,
    src: &str,
    class: Option<&str>,
    out: &mut Vec<FunctionDef<'t>>,
) {
    for child in named_children(scope) {
        match child.kind() {
            "function_definition" => out.push(FunctionDef {
                node: child,
                decorators: Vec::new(),
                class: class.map(str::to_owned),
            }),
            "decorated_definition" => {
                let decorators: Vec<Node> = named_children(child)
                    .into_iter()
                    .filter(|n| n.kind() == "decorator")
                    .collect();
                match child.child_by_field_name("definition") {
                    Some(def) if def.kind() == "function_definition" => out.push(FunctionDef {
                        node: def,
                        decorators,
                        class: class.map(str::to_owned),
                    }),
                    Some(def) if def.kind() == "class_definition" => visit_class(def, src, out),
                    _ => {}
                }
            }
            "class_definition" => visit_class(child, src, out),
            _ => {}
        }
    }
}

fn visit_class<'t>(class: Node<'t>, src: &str, out: &mut Vec<FunctionDef<'t>>) {
    let name = class
        .child_by_field_name("name")
        .map(|n| text(n, src).to_string());
    if let Some(body) = class.child_by_field_name("body") {
        collect_defs(body, src, name.as_deref(), out);
    }
}

pub fn def_name<'a>(def: Node, src: &'a str) -> &'a str {
    def.child_by_field_name("name")
        .map(|n| text(n, src))
        .unwrap_or_default()
}

/// Plain parameter names, without `self`/`cls`.
pub fn param_names(def: Node, src: &str) -> Vec<String> {
    let Some(params) = def.child_by_field_name("parameters") else {
        return Vec::new();
    };
    named_children(params)
        .into_iter()
        .filter_map(|p| match p.kind() {
            "identifier" => Some(text(p, src).to_string()),
            "default_parameter" | "typed_parameter" | "typed_default_parameter" => p
                .child_by_field_name("name")
                .or_else(|| p.named_child(0))
                .map(|n| text(n, src).to_string()),
            _ => None,
        })
        .filter(|n| n != "self" && n != "cls")
        .collect()
}

/// First statement of a block when it is a bare string literal.
pub fn docstring(def: Node, src: &str) -> Option<String> {
    let body = def.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let lit = first.named_child(0)?;
    if lit.kind() != "string" {
        return None;
    }
    let pieces = string_pieces(lit, src)?;
    let doc: String = pieces
        .iter()
        .map(|p| match p {
            Piece::Lit(s) => s.as_str(),
            Piece::Hole(_) => "",
        })
        .collect();
    let doc = doc.trim();
    (!doc.is_empty()).then(|| doc.to_string())
}

/* ===================== String templates ===================== */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    Lit(String),
    Hole(String),
}

/// Flatten a string-valued expression into literal runs and holes.
///
/// Handles plain and f-strings, implicit concatenation, `+` and
/// `"...".format(...)`. Returns `None` when no literal part is present.
pub fn template_of(node: Node, src: &str) -> Option<Vec<Piece>> {
    let pieces = expr_pieces(node, src)?;
    pieces
        .iter()
        .any(|p| matches!(p, Piece::Lit(s) if !s.is_empty()))
        .then_some(pieces)
}

fn expr_pieces(node: Node, src: &str) -> Option<Vec<Piece>> {
    match node.kind() {
        "string" => string_pieces(node, src),
        "concatenated_string" => {
            let mut out = Vec::new();
            for part in named_children(node) {
                out.extend(string_pieces(part, src)?);
            }
            Some(out)
        }
        "parenthesized_expression" => expr_pieces(node.named_child(0)?, src),
        "binary_operator" => {
            let op = node.child_by_field_name("operator").map(|o| text(o, src));
            if op != Some("+") {
                return None;
            }
            let mut out = operand_pieces(node.child_by_field_name("left")?, src);
            out.extend(operand_pieces(node.child_by_field_name("right")?, src));
            Some(out)
        }
        "call" => {
            let func = node.child_by_field_name("function")?;
            if func.kind() != "attribute" {
                return None;
            }
            let attr = func.child_by_field_name("attribute").map(|a| text(a, src));
            if attr != Some("format") {
                return None;
            }
            expr_pieces(func.child_by_field_name("object")?, src)
        }
        _ => None,
    }
}

fn operand_pieces(node: Node, src: &str) -> Vec<Piece> {
    expr_pieces(node, src).unwrap_or_else(|| vec![Piece::Hole(text(node, src).to_string())])
}

fn string_pieces(node: Node, src: &str) -> Option<Vec<Piece>> {
    if node.kind() != "string" {
        return None;
    }

    let mut out = Vec::new();
    let mut saw_body = false;
    for child in named_children(node) {
        match child.kind() {
            "string_content" | "escape_sequence" => {
                saw_body = true;
                out.push(Piece::Lit(text(child, src).to_string()));
            }
            "interpolation" => {
                saw_body = true;
                let expr = child
                    .child_by_field_name("expression")
                    .or_else(|| child.named_child(0))
                    .map(|e| text(e, src).to_string())
                    .unwrap_or_default();
                out.push(Piece::Hole(expr));
            }
            _ => {}
        }
    }

    if !saw_body {
        // Empty string, or a grammar without content nodes.
        let raw = text(node, src);
        let body = raw
            .trim_start_matches(|c: char| c.is_ascii_alphabetic())
            .trim_matches(|c| c == '"' || c == '\'');
        out.push(Piece::Lit(body.to_string()));
    }
    Some(out)
}

/// Render pieces back into a path template: holes become `{name}`.
pub fn render_template(pieces: &[Piece]) -> String {
    pieces
        .iter()
        .map(|p| match p {
            Piece::Lit(s) => s.clone(),
            Piece::Hole(expr) => format!("{{{}}}", hole_name(expr)),
        })
        .collect()
}

fn hole_name(expr: &str) -> String {
    let last = expr
        .rsplit(['.', '[', '(', '\'', '"', ']', ')'])
        .find(|s| !s.trim().is_empty())
        .unwrap_or("param");
    let ident: String = last
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if ident.is_empty() {
        "param".into()
    } else {
        ident
    }
}

/// Endpoint template from URL pieces: a leading hole followed by `/...`
/// is the base URL and is dropped; an absolute literal origin is stripped.
pub fn endpoint_template(pieces: &[Piece]) -> Option<String> {
    let pieces = match pieces {
        [Piece::Hole(_), Piece::Lit(next), ..] if next.starts_with('/') => &pieces[1..],
        _ => pieces,
    };
    let rendered = render_template(pieces);
    let rendered = rendered.trim();
    if rendered.starts_with('/') || rendered.starts_with("http://") || rendered.starts_with("https://") {
        Some(rendered.to_string())
    } else {
        None
    }
}

/// Literal host of an absolute URL template, when it is not templated.
pub fn literal_host(pieces: &[Piece]) -> Option<String> {
    let Some(Piece::Lit(first)) = pieces.first() else {
        return None;
    };
    let rest = first
        .strip_prefix("http://")
        .or_else(|| first.strip_prefix("https://"))?;
    let authority = rest.split('/').next()?;
    if authority.is_empty() || authority.contains('{') {
        return None;
    }
    let host = authority.rsplit('@').next()?;
    let host = host.split(':').next()?;
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/* ===================== HTTP call sites ===================== */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCall {
    pub method: HttpMethod,
    /// Path as written, holes rendered as `{name}`.
    pub template: String,
    /// Normalized endpoint key.
    pub path: String,
    pub host: Option<String>,
    pub line: usize,
}

/// Every `<client>.<verb>(url, ...)` and `<client>.request("VERB", url)`
/// under `node`, in source order.
pub fn http_calls(node: Node, src: &str) -> Vec<HttpCall> {
    descendants_of_kind(node, "call")
        .into_iter()
        .filter_map(|call| http_call(call, src))
        .collect()
}

fn http_call(call: Node, src: &str) -> Option<HttpCall> {
    let func = call.child_by_field_name("function")?;
    if func.kind() != "attribute" {
        return None;
    }
    let verb = text(func.child_by_field_name("attribute")?, src);
    let args = call.child_by_field_name("arguments")?;
    let positional: Vec<Node> = named_children(args)
        .into_iter()
        .filter(|a| a.kind() != "keyword_argument" && a.kind() != "comment")
        .collect();

    let (method, url_node) = if verb == "request" {
        let m = template_of(*positional.first()?, src)?;
        let [Piece::Lit(m)] = m.as_slice() else {
            return None;
        };
        (HttpMethod::parse(m)?, positional.get(1).copied().or_else(|| keyword_arg(args, "url", src))?)
    } else {
        if verb.chars().any(|c| c.is_ascii_uppercase()) {
            return None;
        }
        let method = HttpMethod::parse(verb)?;
        (method, positional.first().copied().or_else(|| keyword_arg(args, "url", src))?)
    };

    let pieces = template_of(url_node, src)?;
    let template = endpoint_template(&pieces)?;
    let path = normalize_path(&template)?;

    Some(HttpCall {
        method,
        template,
        path,
        host: literal_host(&pieces),
        line: line_of(call),
    })
}

pub fn keyword_arg<'t>(args: Node<'t>, name: &str, src: &str) -> Option<Node<'t>> {
    named_children(args)
        .into_iter()
        .filter(|a| a.kind() == "keyword_argument")
        .find(|a| {
            a.child_by_field_name("name")
                .map(|n| text(n, src) == name)
                .unwrap_or(false)
        })
        .and_then(|a| a.child_by_field_name("value"))
}

/// Dotted callee of a call node, e.g. `subprocess.run`.
pub fn callee<'a>(call: Node, src: &'a str) -> &'a str {
    call.child_by_field_name("function")
        .map(|f| text(f, src))
        .unwrap_or_default()
}

/// Module names brought in by `import` / `from ... import`.
pub fn imported_modules(root: Node, src: &str) -> Vec<String> {
    let mut out = Vec::new();
    for node in named_children(root) {
        match node.kind() {
            "import_statement" => {
                for name in named_children(node) {
                    let target = match name.kind() {
                        "aliased_import" => name.child_by_field_name("name"),
                        _ => Some(name),
                    };
                    if let Some(t) = target {
                        out.push(text(t, src).to_string());
                    }
                }
            }
            "import_from_statement" => {
                if let Some(m) = node.child_by_field_name("module_name") {
                    out.push(text(m, src).to_string());
                }
            }
            _ => {}
        }
    }
    out
}

/// Full text of every top-level import statement.
pub fn import_lines(root: Node, src: &str) -> Vec<String> {
    named_children(root)
        .into_iter()
        .filter(|n| matches!(n.kind(), "import_statement" | "import_from_statement"))
        .map(|n| text(n, src).trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_call_pieces(src: &str) -> Vec<Piece> {
        let tree = parse_python("t.py", src).unwrap();
        let call = descendants_of_kind(tree.root_node(), "call")
            .into_iter()
            .next()
            .unwrap();
        let args = call.child_by_field_name("arguments").unwrap();
        template_of(args.named_child(0).unwrap(), src).unwrap()
    }

    #[test]
    fn rejects_broken_source() {
        let err = parse_python("bad.py", "def test_x(:\n    pass\n").unwrap_err();
        assert!(matches!(err, InputError::Syntax { .. }));
    }

    #[test]
    fn fstring_base_url_is_dropped() {
        let pieces = first_call_pieces("requests.get(f\"{base_url}/users/{user_id}\")\n");
        assert_eq!(endpoint_template(&pieces).as_deref(), Some("/users/{user_id}"));
    }

    #[test]
    fn concatenation_renders_holes() {
        let pieces = first_call_pieces("client.get(BASE + \"/items/\" + str(item.id))\n");
        assert_eq!(endpoint_template(&pieces).as_deref(), Some("/items/{id}"));
    }

    #[test]
    fn detects_http_calls_in_order() {
        let src = r#"
def test_flow(client, base_url):
    r = client.post(f"{base_url}/api/users", json={"n": 1})
    uid = r.json().get("id")
    client.request("DELETE", f"{base_url}/api/users/{uid}")
"#;
        let tree = parse_python("t.py", src).unwrap();
        let calls = http_calls(tree.root_node(), src);
        let got: Vec<(HttpMethod, &str)> =
            calls.iter().map(|c| (c.method, c.path.as_str())).collect();
        assert_eq!(
            got,
            vec![
                (HttpMethod::Post, "/api/users"),
                (HttpMethod::Delete, "/api/users/{param}")
            ]
        );
    }

    #[test]
    fn absolute_url_exposes_host() {
        let pieces = first_call_pieces("requests.get(\"https://Evil.example.com:8443/x\")\n");
        assert_eq!(literal_host(&pieces).as_deref(), Some("evil.example.com"));
    }

    #[test]
    fn collects_defs_inside_classes() {
        let src = r#"
import pytest
from app import client as c

class TestUsers:
    @pytest.mark.smoke
    def test_a(self, client):
        """Lists users."""
        pass

def helper():
    pass
"#;
        let tree = parse_python("t.py", src).unwrap();
        let root = tree.root_node();
        let defs = function_defs(root, src);
        assert_eq!(defs.len(), 2);
        assert_eq!(def_name(defs[0].node, src), "test_a");
        assert_eq!(defs[0].class.as_deref(), Some("TestUsers"));
        assert_eq!(defs[0].decorators.len(), 1);
        assert_eq!(param_names(defs[0].node, src), vec!["client"]);
        assert_eq!(docstring(defs[0].node, src).as_deref(), Some("Lists users."));
        assert_eq!(imported_modules(root, src), vec!["pytest", "app"]);
    }
}
