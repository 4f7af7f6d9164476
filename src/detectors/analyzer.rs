//! detectors/analyzer.rs
//!
//! Golden-test analysis: parse a pytest module, pull out its fixtures and
//! test functions, and turn every test into a `TestIntent`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tree_sitter::Node;

use crate::detectors::ast::{
    self, def_name, descendants_of_kind, docstring, function_defs, http_calls, param_names, text,
    FunctionDef,
};
use crate::error::InputError;
use crate::testgen::intent::{
    Assertion, AssertionStyle, EndpointShape, Fixture, Provenance, Target, TestIntent,
};
use crate::detectors::path::template_names;

#[derive(Debug, Clone, PartialEq)]
pub struct TestFunction {
    pub name: String,
    pub class: Option<String>,
    pub docstring: Option<String>,
    pub decorators: Vec<String>,
    pub fixtures_used: Vec<String>,
    pub parametrized: Vec<String>,
    pub assertions: Vec<Assertion>,
    pub target: Option<Target>,
    /// Raw path template of the primary call, e.g. `/users/{user_id}`.
    pub endpoint_template: Option<String>,
    pub line_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GoldenFile {
    pub origin: String,
    pub source: String,
    pub imports: Vec<String>,
    pub modules: Vec<String>,
    pub fixtures: Vec<Fixture>,
    pub tests: Vec<TestFunction>,
    pub helpers: Vec<String>,
    pub classes: Vec<String>,
}

impl GoldenFile {
    pub fn load(path: &Path) -> Result<Self, InputError> {
        let origin = path.display().to_string();
        let source = fs::read_to_string(path).map_err(|e| InputError::Unreadable {
            path: origin.clone(),
            message: e.to_string(),
        })?;
        Self::parse(&origin, source)
    }

    pub fn parse(origin: &str, source: String) -> Result<Self, InputError> {
        let tree = ast::parse_python(origin, &source)?;
        let root = tree.root_node();
        let src = source.as_str();

        let mut fixtures = Vec::new();
        let mut tests = Vec::new();
        let mut helpers = Vec::new();

        for def in function_defs(root, src) {
            let name = def_name(def.node, src).to_string();
            if let Some(fixture) = fixture_of(&def, &name, src) {
                fixtures.push(fixture);
            } else if name.starts_with("test") {
                tests.push(test_function(&def, name, src));
            } else {
                helpers.push(name);
            }
        }

        let classes = ast::named_children(root)
            .into_iter()
            .filter_map(|n| match n.kind() {
                "class_definition" => Some(n),
                "decorated_definition" => n
                    .child_by_field_name("definition")
                    .filter(|d| d.kind() == "class_definition"),
                _ => None,
            })
            .filter_map(|c| c.child_by_field_name("name"))
            .map(|n| text(n, src).to_string())
            .collect();

        Ok(Self {
            origin: origin.to_string(),
            imports: ast::import_lines(root, src),
            modules: ast::imported_modules(root, src),
            fixtures,
            tests,
            helpers,
            classes,
            source,
        })
    }

    /// One intent per test function.
    pub fn intents(&self) -> Vec<Arc<TestIntent>> {
        self.tests
            .iter()
            .map(|t| {
                let target = t.target.clone().unwrap_or_else(|| Target::Function {
                    name: t.name.clone(),
                    signature: format!("{}()", t.name),
                });

                let fixtures = t
                    .fixtures_used
                    .iter()
                    .filter_map(|u| self.fixtures.iter().find(|f| &f.name == u).cloned())
                    .collect();

                let shape = EndpointShape {
                    path_params: t
                        .endpoint_template
                        .as_deref()
                        .map(template_names)
                        .unwrap_or_default(),
                    ..EndpointShape::default()
                };

                let mut seen = HashSet::new();
                let parameters: Vec<String> = t
                    .fixtures_used
                    .iter()
                    .chain(&t.parametrized)
                    .filter(|p| seen.insert(p.as_str()))
                    .cloned()
                    .collect();

                Arc::new(
                    TestIntent::new(
                        target,
                        Provenance::Golden {
                            file: self.origin.clone(),
                            test_name: t.name.clone(),
                        },
                    )
                    .with_description(t.docstring.clone())
                    .with_fixtures(fixtures)
                    .with_parameters(parameters)
                    .with_assertions(t.assertions.clone())
                    .with_shape(shape),
                )
            })
            .collect()
    }
}

fn decorator_text(dec: Node, src: &str) -> String {
    text(dec, src).trim_start_matches('@').trim().to_string()
}

fn fixture_of(def: &FunctionDef, name: &str, src: &str) -> Option<Fixture> {
    let dec = def
        .decorators
        .iter()
        .find(|d| decorator_text(**d, src).contains("fixture"))?;

    let scope = descendants_of_kind(*dec, "keyword_argument")
        .into_iter()
        .find(|k| {
            k.child_by_field_name("name")
                .map(|n| text(n, src) == "scope")
                .unwrap_or(false)
        })
        .and_then(|k| k.child_by_field_name("value"))
        .and_then(|v| ast::template_of(v, src))
        .map(|p| ast::render_template(&p))
        .unwrap_or_else(|| "function".into());

    let yields = def
        .node
        .child_by_field_name("body")
        .map(|b| !descendants_of_kind(b, "yield").is_empty())
        .unwrap_or(false);

    Some(Fixture {
        name: name.to_string(),
        scope,
        yields,
    })
}

fn test_function(def: &FunctionDef, name: String, src: &str) -> TestFunction {
    let decorators: Vec<String> = def.decorators.iter().map(|d| decorator_text(*d, src)).collect();

    let parametrized = def
        .decorators
        .iter()
        .filter(|d| decorator_text(**d, src).contains("parametrize"))
        .filter_map(|d| descendants_of_kind(*d, "argument_list").into_iter().next())
        .filter_map(|args| args.named_child(0))
        .filter_map(|first| ast::template_of(first, src))
        .flat_map(|p| {
            ast::render_template(&p)
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let fixtures_used = param_names(def.node, src)
        .into_iter()
        .filter(|p| !parametrized.contains(p))
        .collect();

    let body = def.node.child_by_field_name("body");
    let assertions = body.map(|b| assertions_in(b, src)).unwrap_or_default();

    let calls = body.map(|b| http_calls(b, src)).unwrap_or_default();
    let (target, endpoint_template) = match calls.first() {
        Some(c) => (
            Some(Target::Endpoint {
                method: c.method,
                path: c.path.clone(),
            }),
            Some(c.template.clone()),
        ),
        None => (body.and_then(|b| function_under_test(b, src)), None),
    };

    let line_count = def.node.end_position().row - def.node.start_position().row + 1;

    TestFunction {
        name,
        class: def.class.clone(),
        docstring: docstring(def.node, src),
        decorators,
        fixtures_used,
        parametrized,
        assertions,
        target,
        endpoint_template,
        line_count,
    }
}

/// `assert ...`, `with pytest.raises(...)`, and `self.assertXxx(...)`.
pub fn assertions_in(body: Node, src: &str) -> Vec<Assertion> {
    let mut out = Vec::new();
    ast::walk(body, &mut |n| match n.kind() {
        "assert_statement" => out.push(Assertion {
            style: AssertionStyle::Assert,
            text: one_line(text(n, src)),
        }),
        "with_item" => {
            let value = n.child_by_field_name("value").or_else(|| n.named_child(0));
            if let Some(call) = value.filter(|v| v.kind() == "call") {
                if ast::callee(call, src).ends_with("raises") {
                    out.push(Assertion {
                        style: AssertionStyle::PytestRaises,
                        text: one_line(text(call, src)),
                    });
                }
            }
        }
        "call" => {
            let callee = ast::callee(n, src);
            if callee.starts_with("self.assert") {
                out.push(Assertion {
                    style: AssertionStyle::UnittestAssert,
                    text: one_line(text(n, src)),
                });
            }
        }
        _ => {}
    });
    out
}

/// First plain call in a non-HTTP test, e.g. `add(1, 2)` in `assert add(1, 2) == 3`.
fn function_under_test(body: Node, src: &str) -> Option<Target> {
    const IGNORED: &[&str] = &[
        "len", "str", "int", "float", "list", "dict", "set", "tuple", "isinstance", "print",
        "range", "sorted", "type", "any", "all",
    ];
    descendants_of_kind(body, "call").into_iter().find_map(|call| {
        let func = call.child_by_field_name("function")?;
        if func.kind() != "identifier" {
            return None;
        }
        let name = text(func, src);
        if IGNORED.contains(&name) {
            return None;
        }
        Some(Target::Function {
            name: name.to_string(),
            signature: one_line(text(call, src)),
        })
    })
}

fn one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
