//! Error types for the audit log

/// Audit log errors
///
/// Every variant carries owned text so errors can be cloned into the
/// results handed to coalesced callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// Sink could not durably record an event
    #[error("audit sink failure: {0}")]
    SinkFailure(String),

    /// Event could not be encoded or decoded
    #[error("audit serialization error: {0}")]
    Serialization(String),

    /// Stored line is not a valid event
    #[error("corrupt audit record at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    /// Sequence or hash chain is broken
    #[error("audit chain broken at seq {seq}: {reason}")]
    Integrity { seq: u64, reason: String },
}

impl AuditError {
    /// Create sink failure from any displayable cause
    pub fn sink(cause: impl std::fmt::Display) -> Self {
        Self::SinkFailure(cause.to_string())
    }

    /// Whether the error means events may have gone unrecorded
    #[inline]
    #[must_use]
    pub fn is_sink_failure(&self) -> bool {
        matches!(self, Self::SinkFailure(_))
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
