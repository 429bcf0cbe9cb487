//! scriptgate shared model
//!
//! Value types that flow between the policy engine, the scanner, the result
//! cache, the execution runner and the audit log.
//!
//! # Architecture
//!
//! ```text
//! (prompt, language, policy@version, params, context) ──► Fingerprint ──► cache / audit key
//! source ──► SourceDigest ──► ScanResult ──► ExecutionResult
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod context;
pub mod error;
pub mod execution;
pub mod fingerprint;
pub mod language;
pub mod scan;
pub mod severity;

pub use context::{normalize_context, GenerationContext, InputKind, InputsSummary};
pub use error::ModelError;
pub use execution::{ExecutionResult, ExecutionState, ResourceKind, TerminationReason};
pub use fingerprint::{Fingerprint, GenerationParams, SourceDigest};
pub use language::Language;
pub use scan::{PolicyId, ScanFinding, ScanResult, Verdict};
pub use severity::Severity;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the scriptgate model
    pub use crate::context::GenerationContext;
    pub use crate::execution::{ExecutionResult, ResourceKind, TerminationReason};
    pub use crate::fingerprint::{Fingerprint, GenerationParams, SourceDigest};
    pub use crate::language::Language;
    pub use crate::scan::{PolicyId, ScanFinding, ScanResult, Verdict};
    pub use crate::severity::Severity;
}
