//! Language-independent syntax tree
//!
//! Adapters lower each grammar's native tree into [`SyntaxNode`]s that keep
//! only what the scanner inspects: imports, calls and path literals, nested
//! the way they appear in the source.

/// Kind of an abstract node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// Root of a file
    Module,
    /// Module/package reference (static or dynamic import)
    Import,
    /// Call or construction with a literal callee name
    Call,
    /// String literal that looks like an absolute path
    PathLiteral,
}

/// 1-based source position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span {
    /// Line
    pub line: usize,
    /// Column in characters
    pub column: usize,
}

/// Abstract syntax node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxNode {
    /// Node kind
    pub kind: NodeKind,
    /// Literal name (module, dotted callee, or path)
    pub name: String,
    /// Where the node starts
    pub span: Span,
    /// Nested nodes
    pub children: Vec<SyntaxNode>,
}

impl SyntaxNode {
    /// Root node
    #[must_use]
    pub fn module() -> Self {
        Self::leaf(NodeKind::Module, String::new(), Span { line: 1, column: 1 })
    }

    /// Node without children
    #[must_use]
    pub fn leaf(kind: NodeKind, name: String, span: Span) -> Self {
        Self {
            kind,
            name,
            span,
            children: Vec::new(),
        }
    }

    /// Depth-first, pre-order iterator over this node and its descendants
    #[must_use]
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }
}

/// Iterative pre-order traversal; no recursion, so deep trees are safe
#[derive(Debug)]
pub struct Walk<'a> {
    stack: Vec<&'a SyntaxNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a SyntaxNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

/// Maps byte offsets to 1-based line/column positions
#[derive(Debug)]
pub struct LineIndex<'a> {
    source: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    /// Index `source`
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            source,
            line_starts,
        }
    }

    /// Position of `offset`, clamped to the source length
    #[must_use]
    pub fn span(&self, offset: usize) -> Span {
        let offset = offset.min(self.source.len());
        let line = self.line_starts.partition_point(|&start| start <= offset) - 1;
        let start = self.line_starts[line];
        let column = self
            .source
            .get(start..offset)
            .map_or(offset - start, |prefix| prefix.chars().count());
        Span {
            line: line + 1,
            column: column + 1,
        }
    }
}

/// Whether a string literal's content reads as an absolute or home path
#[must_use]
pub fn looks_like_path(text: &str) -> bool {
    let rest = if let Some(rest) = text.strip_prefix("~/") {
        rest
    } else if let Some(rest) = text.strip_prefix('/') {
        rest
    } else {
        return false;
    };
    !rest.is_empty()
        && rest
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
}

/// Whether `text` is a plain dotted identifier path like `os.path.join`
#[must_use]
pub fn is_dotted_name(text: &str) -> bool {
    !text.is_empty()
        && text.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
                && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_index_positions() {
        let index = LineIndex::new("ab\ncdé\nx");
        assert_eq!(index.span(0), Span { line: 1, column: 1 });
        assert_eq!(index.span(3), Span { line: 2, column: 1 });
        // 'é' is two bytes; the column counts characters
        assert_eq!(index.span(7), Span { line: 2, column: 4 });
        assert_eq!(index.span(8), Span { line: 3, column: 1 });
        assert_eq!(index.span(999), Span { line: 3, column: 2 });
    }

    #[test]
    fn walk_is_preorder() {
        let span = Span::default();
        let mut root = SyntaxNode::module();
        let mut call = SyntaxNode::leaf(NodeKind::Call, "outer".into(), span);
        call.children
            .push(SyntaxNode::leaf(NodeKind::Call, "inner".into(), span));
        root.children.push(call);
        root.children
            .push(SyntaxNode::leaf(NodeKind::Import, "os".into(), span));

        let names: Vec<_> = root.walk().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["", "outer", "inner", "os"]);
    }

    #[test]
    fn path_literal_detection() {
        assert!(looks_like_path("/etc/passwd"));
        assert!(looks_like_path("~/.ssh/id_rsa"));
        assert!(!looks_like_path("/"));
        assert!(!looks_like_path("a/b"));
        assert!(!looks_like_path("/ per second"));
    }

    #[test]
    fn dotted_names() {
        assert!(is_dotted_name("os.system"));
        assert!(is_dotted_name("$el.html"));
        assert!(!is_dotted_name("f()"));
        assert!(!is_dotted_name("a..b"));
        assert!(!is_dotted_name(""));
    }
}
