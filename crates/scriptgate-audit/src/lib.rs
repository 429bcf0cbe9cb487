//! scriptgate Audit Log
//!
//! Append-only record of every scan verdict, cache decision and execution,
//! hash-chained so tampering is detectable after the fact.
//!
//! # Architecture
//!
//! ```text
//! NewEvent ──► AuditLog::append ──(Mutex: seq+1, prev_hash, hash)──► AuditSink::write
//!                                                                       │
//!                        AuditQuery (bounded at committed seq) ◄── AuditSink::read
//! ```
//!
//! An append that the sink cannot record fails, and callers treat that
//! failure as blocking: nothing proceeds unaudited.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod error;
pub mod event;
pub mod log;
pub mod sink;

pub use error::AuditError;
pub use event::{AuditEvent, AuditEventKind, AuditPayload, NewEvent, GENESIS_HASH};
pub use log::{AuditFilter, AuditLog, AuditQuery, AuditStats};
pub use sink::{AuditSink, EventIter, JsonlFileSink, MemorySink};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
