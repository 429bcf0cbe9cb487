//! Audit events and their hash chain

use crate::error::AuditError;
use chrono::{DateTime, Utc};
use scriptgate_model::{ExecutionResult, Fingerprint, Language, PolicyId, ScanResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// `prev_hash` of the first event
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What an audit event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// Scan verdict PASSED
    ScanPassed,
    /// Scan verdict REJECTED
    ScanRejected,
    /// Request served from the cache (or a coalesced flight)
    CacheHit,
    /// Request had to generate
    CacheMiss,
    /// Workload is about to launch
    ExecutionStarted,
    /// Workload ran to completion or failed on its own
    ExecutionFinished,
    /// Workload was terminated by enforcement or cancellation
    ExecutionKilled,
    /// Generator gave up
    GenerationFailed,
    /// Policy table swapped
    PolicyReloaded,
    /// Internal failure worth keeping
    Error,
}

impl AuditEventKind {
    /// Every kind
    pub const ALL: [Self; 10] = [
        Self::ScanPassed,
        Self::ScanRejected,
        Self::CacheHit,
        Self::CacheMiss,
        Self::ExecutionStarted,
        Self::ExecutionFinished,
        Self::ExecutionKilled,
        Self::GenerationFailed,
        Self::PolicyReloaded,
        Self::Error,
    ];

    /// Stable snake_case name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScanPassed => "scan_passed",
            Self::ScanRejected => "scan_rejected",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionFinished => "execution_finished",
            Self::ExecutionKilled => "execution_killed",
            Self::GenerationFailed => "generation_failed",
            Self::PolicyReloaded => "policy_reloaded",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| format!("unknown audit event kind: {s}"))
    }
}

/// Event body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditPayload {
    /// Scan outcome
    Scan(ScanResult),
    /// Final execution outcome
    Execution(ExecutionResult),
    /// Execution about to launch
    ExecutionStarted {
        /// Id the terminal event will carry
        execution_id: Uuid,
        /// Workload language
        language: Language,
    },
    /// Cache lookup outcome
    Cache {
        /// `cached`, `coalesced` or `generated`
        origin: String,
    },
    /// Failure description
    Error {
        /// Message
        message: String,
    },
    /// Policy table change
    Policy {
        /// Policies added or changed
        names: Vec<String>,
    },
}

/// Fields the hash covers, in a fixed order
#[derive(Serialize)]
struct Hashed<'a> {
    seq: u64,
    timestamp: &'a DateTime<Utc>,
    kind: AuditEventKind,
    correlation_id: Option<&'a Fingerprint>,
    policy: Option<&'a PolicyId>,
    payload: &'a AuditPayload,
    prev_hash: &'a str,
}

/// A committed audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Monotonic sequence number, starting at 1
    pub seq: u64,
    /// When the event was appended
    pub timestamp: DateTime<Utc>,
    /// Event kind
    pub kind: AuditEventKind,
    /// Fingerprint of the request the event belongs to
    pub correlation_id: Option<Fingerprint>,
    /// Policy in force
    pub policy: Option<PolicyId>,
    /// Body
    pub payload: AuditPayload,
    /// Hash of the previous event
    pub prev_hash: String,
    /// SHA-256 over every other field
    pub hash: String,
}

impl AuditEvent {
    /// Hash this event's content would have
    ///
    /// # Errors
    /// Returns error if the event cannot be serialized
    pub fn compute_hash(&self) -> Result<String, AuditError> {
        let hashed = Hashed {
            seq: self.seq,
            timestamp: &self.timestamp,
            kind: self.kind,
            correlation_id: self.correlation_id.as_ref(),
            policy: self.policy.as_ref(),
            payload: &self.payload,
            prev_hash: &self.prev_hash,
        };
        let bytes = serde_json::to_vec(&hashed)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// An event before the log assigns sequence, time and hashes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Event kind
    pub kind: AuditEventKind,
    /// Correlation fingerprint
    pub correlation_id: Option<Fingerprint>,
    /// Policy in force
    pub policy: Option<PolicyId>,
    /// Body
    pub payload: AuditPayload,
}

impl NewEvent {
    /// Uncorrelated event
    #[must_use]
    pub fn new(kind: AuditEventKind, payload: AuditPayload) -> Self {
        Self {
            kind,
            correlation_id: None,
            policy: None,
            payload,
        }
    }

    /// Attach the request fingerprint
    #[must_use]
    pub fn correlated(mut self, fingerprint: Fingerprint) -> Self {
        self.correlation_id = Some(fingerprint);
        self
    }

    /// Attach the policy in force
    #[must_use]
    pub fn under(mut self, policy: PolicyId) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Scan verdict event; the kind follows the verdict
    #[must_use]
    pub fn scan(result: ScanResult) -> Self {
        let kind = if result.is_passed() {
            AuditEventKind::ScanPassed
        } else {
            AuditEventKind::ScanRejected
        };
        let policy = result.policy().clone();
        Self::new(kind, AuditPayload::Scan(result)).under(policy)
    }

    /// Terminal execution event; the kind follows the termination reason
    #[must_use]
    pub fn execution(result: ExecutionResult) -> Self {
        let kind = if result.termination.is_forced() {
            AuditEventKind::ExecutionKilled
        } else {
            AuditEventKind::ExecutionFinished
        };
        Self::new(kind, AuditPayload::Execution(result))
    }

    /// Failure event of `kind`
    #[must_use]
    pub fn error(kind: AuditEventKind, message: impl Into<String>) -> Self {
        Self::new(
            kind,
            AuditPayload::Error {
                message: message.into(),
            },
        )
    }
}
