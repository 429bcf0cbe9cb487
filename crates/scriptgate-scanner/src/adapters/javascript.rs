//! JavaScript adapter
//!
//! Uses the TypeScript grammar, which accepts plain JavaScript as well as
//! scripts carrying type annotations.

use super::{callee_name, first_string_argument, lower, string_literal, LanguageAdapter, Lowered};
use crate::error::ParseError;
use crate::tree::{looks_like_path, NodeKind, SyntaxNode};
use scriptgate_model::Language;
use tree_sitter::Node;

/// Lowers JavaScript source
#[derive(Debug, Clone, Copy, Default)]
pub struct JavaScriptAdapter;

impl LanguageAdapter for JavaScriptAdapter {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn parse(&self, source: &str) -> Result<SyntaxNode, ParseError> {
        lower(
            &tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            Language::JavaScript,
            source,
            classify,
        )
    }
}

/// `node:fs` and `fs` name the same module
fn module_specifier(raw: String) -> String {
    match raw.strip_prefix("node:") {
        Some(rest) => rest.to_string(),
        None => raw,
    }
}

fn source_import(node: Node<'_>, source: &str) -> Vec<Lowered> {
    node.child_by_field_name("source")
        .and_then(|spec| {
            string_literal(spec, source)
                .map(|name| vec![Lowered::leaf(NodeKind::Import, module_specifier(name), spec)])
        })
        .unwrap_or_default()
}

fn classify(node: Node<'_>, source: &str) -> Vec<Lowered> {
    match node.kind() {
        "import_statement" | "export_statement" => source_import(node, source),
        "call_expression" => {
            let Some(function) = node.child_by_field_name("function") else {
                return Vec::new();
            };
            // dynamic `import("x")`
            if function.kind() == "import" {
                return first_string_argument(node, source)
                    .map(|name| {
                        vec![Lowered::frame(NodeKind::Import, module_specifier(name), node)]
                    })
                    .unwrap_or_default();
            }
            if !matches!(function.kind(), "identifier" | "member_expression") {
                return Vec::new();
            }
            let Some(name) = callee_name(function, source) else {
                return Vec::new();
            };
            let mut lowered = Vec::with_capacity(2);
            if name == "require" {
                if let Some(module) = first_string_argument(node, source) {
                    lowered.push(Lowered::leaf(NodeKind::Import, module_specifier(module), node));
                }
            }
            lowered.push(Lowered::frame(NodeKind::Call, name, node));
            lowered
        }
        "new_expression" => node
            .child_by_field_name("constructor")
            .filter(|ctor| matches!(ctor.kind(), "identifier" | "member_expression"))
            .and_then(|ctor| callee_name(ctor, source))
            .map(|name| vec![Lowered::frame(NodeKind::Call, name, node)])
            .unwrap_or_default(),
        "string" => string_literal(node, source)
            .filter(|content| looks_like_path(content))
            .map(|content| vec![Lowered::leaf(NodeKind::PathLiteral, content, node)])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}
