//! scriptgate Execution Runner
//!
//! Runs scanner-approved code in a throwaway, resource-capped sandbox and
//! reports how it ended.
//!
//! # Architecture
//!
//! ```text
//! ApprovedSource ──verify──► Scratch (TempDir) ──► Command + IsolationPlan (pre_exec)
//!                                                        │
//!        ┌───────────────── select! ─────────────────────┤
//!        │ child exit │ wall deadline │ cancel │ /proc tick
//!        ▼
//!   SIGTERM group ─grace─► SIGKILL ─► reap ─► classify ─► ExecutionResult
//! ```
//!
//! Isolation on Linux: a new session, rlimits (CPU, address space for
//! Python, file size, core), a private mount namespace whose every mount is
//! read-only except the scratch directory when the policy allows writes, a
//! private network namespace when the policy denies network, a dropped
//! identity when started as root, `no_new_privs` and a seccomp deny-list.
//! If any step fails the workload never starts.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod bindings;
pub mod capture;
pub mod config;
pub mod error;
mod isolation;
#[cfg(target_os = "linux")]
mod mounts;
pub mod process;
pub mod runner;
mod scratch;
#[cfg(target_os = "linux")]
mod syscalls;

pub use bindings::{ApprovedSource, ExecutionBindings};
pub use capture::CappedBuffer;
pub use config::{RunnerConfig, RuntimeCommand, DEFAULT_PATH, NOBODY};
pub use error::RunnerError;
pub use process::{KillSignal, ProcSample};
pub use runner::Runner;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
