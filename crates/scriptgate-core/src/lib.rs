//! scriptgate pipeline orchestrator
//!
//! Generates code from a prompt, scans it against a security policy, caches
//! the result under a request fingerprint and optionally runs it in a
//! sandbox. Every decision lands in the audit log.
//!
//! # Architecture
//!
//! ```text
//!                 ┌───────────────────────────────┐
//!  GenerateRequest│           Pipeline            │
//!  ──────────────►│ policy snapshot + fingerprint │
//!                 └──────────────┬────────────────┘
//!                                │ get_or_create (single-flight)
//!                 ┌──────────────▼────────────────┐
//!                 │          ResultCache          │
//!                 └──────────────┬────────────────┘
//!                           miss │
//!        ┌───────────────┐  ┌────▼─────┐  ┌──────────┐
//!        │ CodeGenerator ├─►│ extract  ├─►│ Scanner  │
//!        └───────────────┘  └──────────┘  └────┬─────┘
//!                                     PASSED   │   REJECTED -> ScanRejected
//!                                 ┌────────────▼───────────┐
//!                                 │ Runner (isolated exec) │
//!                                 └────────────┬───────────┘
//!                                              ▼
//!                                          AuditLog
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod config;
pub mod error;
pub mod generator;
pub mod logging;
pub mod pipeline;

pub use config::{GateConfig, LogFormat, ProviderConfig};
pub use error::{ConfigError, PipelineError};
pub use generator::{
    extract_code, CodeGenerator, CommandGenerator, FallbackGenerator, GenerationError,
    GenerationRequest, ProviderStats,
};
pub use pipeline::{
    ClearTarget, GenerateRequest, ListFilter, Pipeline, PipelineBuilder, PipelineOutcome,
    PipelineStats,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
