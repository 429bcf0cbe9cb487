//! Error types for the scanner

/// Errors produced while turning source into a syntax tree
///
/// The scanner never surfaces these to callers: a parse error becomes a
/// REJECTED scan result, since unparsable code is never executed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Source is not syntactically valid
    #[error("syntax error at {line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    /// Grammar could not be loaded
    #[error("grammar unavailable for {language}: {message}")]
    Grammar { language: String, message: String },

    /// Parser gave up (cancelled or timed out)
    #[error("parser produced no tree for {0}")]
    NoTree(String),
}

impl ParseError {
    /// Create syntax error
    pub fn syntax(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            line,
            column,
            message: message.into(),
        }
    }

    /// Position of the error, when known
    #[inline]
    #[must_use]
    pub fn position(&self) -> (usize, usize) {
        match self {
            Self::Syntax { line, column, .. } => (*line, *column),
            _ => (1, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_display() {
        let err = ParseError::syntax(3, 7, "unexpected ')'");
        assert_eq!(err.to_string(), "syntax error at 3:7: unexpected ')'");
        assert_eq!(err.position(), (3, 7));
        assert_eq!(ParseError::NoTree("python".into()).position(), (1, 1));
    }
}
