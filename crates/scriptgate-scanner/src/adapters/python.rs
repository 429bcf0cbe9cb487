//! Python adapter (tree-sitter-python)

use super::{callee_name, first_string_argument, lower, string_literal, LanguageAdapter, Lowered};
use crate::error::ParseError;
use crate::tree::{looks_like_path, NodeKind, SyntaxNode};
use scriptgate_model::Language;
use tree_sitter::Node;

/// Callees whose literal first argument names a module
const DYNAMIC_IMPORTS: [&str; 2] = ["__import__", "importlib.import_module"];

/// Lowers Python source
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonAdapter;

impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn parse(&self, source: &str) -> Result<SyntaxNode, ParseError> {
        lower(&tree_sitter_python::LANGUAGE.into(), Language::Python, source, classify)
    }
}

/// Imported module name of a `dotted_name` or `aliased_import`
fn module_name(node: Node<'_>, source: &str) -> Option<String> {
    let target = match node.kind() {
        "aliased_import" => node.child_by_field_name("name")?,
        "dotted_name" => node,
        _ => return None,
    };
    callee_name(target, source)
}

fn classify(node: Node<'_>, source: &str) -> Vec<Lowered> {
    match node.kind() {
        "import_statement" => {
            let mut cursor = node.walk();
            node.children_by_field_name("name", &mut cursor)
                .filter_map(|child| {
                    module_name(child, source).map(|name| Lowered::leaf(NodeKind::Import, name, child))
                })
                .collect()
        }
        "import_from_statement" => {
            let Some(module) = node.child_by_field_name("module_name") else {
                return Vec::new();
            };
            // relative imports stay inside the script's own package
            if module.kind() == "relative_import" {
                return Vec::new();
            }
            let Some(base) = callee_name(module, source) else {
                return Vec::new();
            };
            let mut lowered = vec![Lowered::leaf(NodeKind::Import, base.clone(), module)];
            let mut cursor = node.walk();
            lowered.extend(
                node.children_by_field_name("name", &mut cursor)
                    .filter_map(|child| {
                        module_name(child, source).map(|name| {
                            Lowered::leaf(NodeKind::Import, format!("{base}.{name}"), child)
                        })
                    }),
            );
            lowered
        }
        "call" => {
            let Some(function) = node.child_by_field_name("function") else {
                return Vec::new();
            };
            if !matches!(function.kind(), "identifier" | "attribute") {
                return Vec::new();
            }
            let Some(name) = callee_name(function, source) else {
                return Vec::new();
            };
            let mut lowered = Vec::with_capacity(2);
            if DYNAMIC_IMPORTS.contains(&name.as_str()) {
                if let Some(module) = first_string_argument(node, source) {
                    lowered.push(Lowered::leaf(NodeKind::Import, module, node));
                }
            }
            lowered.push(Lowered::frame(NodeKind::Call, name, node));
            lowered
        }
        "string" => string_literal(node, source)
            .filter(|content| looks_like_path(content))
            .map(|content| vec![Lowered::leaf(NodeKind::PathLiteral, content, node)])
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(source: &str, kind: NodeKind) -> Vec<String> {
        let tree = PythonAdapter.parse(source).unwrap();
        tree.walk()
            .filter(|n| n.kind == kind)
            .map(|n| n.name.clone())
            .collect()
    }

    #[test]
    fn imports() {
        let source = "import os.path, json as j\nfrom subprocess import run, Popen as P\nfrom . import sibling\n";
        assert_eq!(
            names(source, NodeKind::Import),
            vec!["os.path", "json", "subprocess", "subprocess.run", "subprocess.Popen"]
        );
    }

    #[test]
    fn dynamic_import_with_literal() {
        let source = "m = __import__('socket')\nn = importlib.import_module(\"ctypes\")\n";
        assert_eq!(names(source, NodeKind::Import), vec!["socket", "ctypes"]);
    }

    #[test]
    fn calls_keep_dotted_callee() {
        let source = "os.system('ls')\nprint(len([1]))\nfoo()[0]()\n";
        assert_eq!(
            names(source, NodeKind::Call),
            vec!["os.system", "print", "len", "foo"]
        );
    }

    #[test]
    fn nested_calls_nest_in_tree() {
        let tree = PythonAdapter.parse("print(eval('1'))\n").unwrap();
        let print = &tree.children[0];
        assert_eq!(print.name, "print");
        assert_eq!(print.children[0].name, "eval");
        assert_eq!(print.children[0].span.column, 7);
    }

    #[test]
    fn path_literals() {
        let source = "open('/etc/passwd')\nx = 'hello'\ny = f'/tmp/{name}'\n";
        assert_eq!(names(source, NodeKind::PathLiteral), vec!["/etc/passwd", "/tmp/"]);
    }

    #[test]
    fn syntax_error_position() {
        let err = PythonAdapter.parse("x = 1\ndef broken(:\n    pass\n").unwrap_err();
        let (line, _) = err.position();
        assert_eq!(line, 2);
    }
}
