//! scriptgate Policy Engine
//!
//! Named, immutable security policies describing what generated code may
//! import, call and contain, and the resource ceilings it runs under.
//!
//! # Architecture
//!
//! ```text
//! YAML/TOML ──► PolicyDocument ──merge(base, overrides)──► SecurityPolicy (immutable)
//!                                                              │
//!                         PolicyRegistry: RwLock<Arc<PolicyTable>> ◄── reload = atomic swap
//! ```
//!
//! Lists merge additively: a derived policy keeps every rule of its base
//! unless it sets `replace_lists`.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod builtin;
pub mod document;
pub mod error;
pub mod policy;
pub mod registry;

pub use builtin::DEFAULT_POLICY;
pub use document::{CeilingsDocument, NameRule, PatternDocument, PolicyDocument, PolicyMode};
pub use error::PolicyError;
pub use policy::{merge, PatternRule, ResourceCeilings, SecurityPolicy};
pub use registry::{PolicyRegistry, PolicyTable, ReloadReport};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// JSON schema of [`PolicyDocument`], for editor tooling
#[must_use]
pub fn document_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(PolicyDocument)
}
