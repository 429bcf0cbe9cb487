//! scriptgate Security Scanner
//!
//! Static analysis of generated code against a [`SecurityPolicy`]. Nothing
//! here executes the code.
//!
//! # Architecture
//!
//! ```text
//! source ──► LanguageAdapter (tree-sitter) ──► SyntaxNode tree ──► walk ──┐
//!    │                                                                    ├─► findings ──► ScanResult
//!    └────────────────────► pattern rules (regex over raw text) ─────────┘
//! ```
//!
//! Source that fails to parse is rejected, never passed through.
//!
//! [`SecurityPolicy`]: scriptgate_policy::SecurityPolicy

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod adapters;
pub mod error;
pub mod scanner;
pub mod tree;

pub use adapters::{adapter_for, JavaScriptAdapter, LanguageAdapter, PythonAdapter};
pub use error::ParseError;
pub use scanner::{
    Scanner, RULE_BLOCKED_CALL, RULE_BLOCKED_IMPORT, RULE_PATH_OUTSIDE_ALLOWLIST, RULE_SYNTAX_ERROR,
};
pub use tree::{NodeKind, Span, SyntaxNode};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
