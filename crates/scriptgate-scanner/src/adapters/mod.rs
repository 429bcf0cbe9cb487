//! Per-language adapters producing the abstract [`SyntaxNode`] tree
//!
//! Each adapter owns a tree-sitter grammar and a classifier that maps native
//! nodes onto [`NodeKind`]s. Lowering is shared: one iterative cursor walk
//! that nests classified nodes the way they nest in the source.

mod javascript;
mod python;

pub use javascript::JavaScriptAdapter;
pub use python::PythonAdapter;

use crate::error::ParseError;
use crate::tree::{LineIndex, NodeKind, SyntaxNode};
use scriptgate_model::Language;
use tree_sitter::{Language as Grammar, Node, Parser};

/// Parses one language into the abstract tree
pub trait LanguageAdapter: Send + Sync {
    /// Language handled by this adapter
    fn language(&self) -> Language;

    /// Parse `source`
    ///
    /// # Errors
    /// Returns error if the source is not syntactically valid
    fn parse(&self, source: &str) -> Result<SyntaxNode, ParseError>;
}

/// A classified native node
#[derive(Debug)]
pub(crate) struct Lowered {
    kind: NodeKind,
    name: String,
    offset: usize,
    /// Whether later nodes inside this one nest under it
    opens: bool,
}

impl Lowered {
    /// Node that nests whatever sits inside its native range
    pub(crate) fn frame(kind: NodeKind, name: String, node: Node<'_>) -> Self {
        Self {
            kind,
            name,
            offset: node.start_byte(),
            opens: true,
        }
    }

    /// Node attached to the enclosing frame
    pub(crate) fn leaf(kind: NodeKind, name: String, node: Node<'_>) -> Self {
        Self {
            kind,
            name,
            offset: node.start_byte(),
            opens: false,
        }
    }
}

/// Native text of `node`, or empty when it is not valid UTF-8
pub(crate) fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

/// Callee text with whitespace removed, when it is a plain dotted name
pub(crate) fn callee_name(node: Node<'_>, source: &str) -> Option<String> {
    let name: String = text(node, source)
        .replace("?.", ".")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    crate::tree::is_dotted_name(&name).then_some(name)
}

/// Contents of a plain string literal, without interpolations or escapes
pub(crate) fn string_literal(node: Node<'_>, source: &str) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let mut cursor = node.walk();
    let content = node
        .named_children(&mut cursor)
        .filter(|child| matches!(child.kind(), "string_content" | "string_fragment"))
        .map(|child| text(child, source))
        .collect();
    Some(content)
}

/// First named argument of a call, when it is a string literal
pub(crate) fn first_string_argument(call: Node<'_>, source: &str) -> Option<String> {
    let arguments = call.child_by_field_name("arguments")?;
    let mut cursor = arguments.walk();
    let first = arguments.named_children(&mut cursor).next()?;
    string_literal(first, source)
}

/// Parse `source` with `grammar` and lower the native tree using `classify`
pub(crate) fn lower(
    grammar: &Grammar,
    language: Language,
    source: &str,
    classify: fn(Node<'_>, &str) -> Vec<Lowered>,
) -> Result<SyntaxNode, ParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(grammar)
        .map_err(|e| ParseError::Grammar {
            language: language.name().to_string(),
            message: e.to_string(),
        })?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| ParseError::NoTree(language.name().to_string()))?;

    let index = LineIndex::new(source);
    let mut frames: Vec<(usize, SyntaxNode)> = vec![(0, SyntaxNode::module())];
    let mut first_error: Option<Node<'_>> = None;

    let mut cursor = tree.walk();
    let mut depth = 1usize;
    'walk: loop {
        let node = cursor.node();

        while frames.len() > 1 && frames.last().is_some_and(|(d, _)| *d >= depth) {
            close_frame(&mut frames);
        }

        if first_error.is_none() && (node.is_error() || node.is_missing()) {
            first_error = Some(node);
        }

        let mut opened = None;
        for lowered in classify(node, source) {
            let built = SyntaxNode::leaf(lowered.kind, lowered.name, index.span(lowered.offset));
            if lowered.opens && opened.is_none() {
                opened = Some(built);
            } else if let Some((_, parent)) = frames.last_mut() {
                parent.children.push(built);
            }
        }
        if let Some(built) = opened {
            frames.push((depth, built));
        }

        if cursor.goto_first_child() {
            depth += 1;
            continue;
        }
        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                break 'walk;
            }
            depth -= 1;
        }
    }

    if tree.root_node().has_error() {
        return Err(match first_error {
            Some(node) => {
                let span = index.span(node.start_byte());
                let message = if node.is_missing() {
                    format!("missing {}", node.kind())
                } else {
                    let snippet: String = text(node, source).chars().take(24).collect();
                    format!("unexpected '{}'", snippet.trim())
                };
                ParseError::syntax(span.line, span.column, message)
            }
            None => ParseError::syntax(1, 1, "invalid syntax"),
        });
    }

    while frames.len() > 1 {
        close_frame(&mut frames);
    }
    Ok(frames.pop().map_or_else(SyntaxNode::module, |(_, root)| root))
}

fn close_frame(frames: &mut Vec<(usize, SyntaxNode)>) {
    if let Some((_, done)) = frames.pop() {
        if let Some((_, parent)) = frames.last_mut() {
            parent.children.push(done);
        }
    }
}

/// Adapter for `language`
#[must_use]
pub fn adapter_for(language: Language) -> Box<dyn LanguageAdapter> {
    match language {
        Language::Python => Box::new(PythonAdapter),
        Language::JavaScript => Box::new(JavaScriptAdapter),
    }
}
