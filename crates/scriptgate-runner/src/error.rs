//! Error types for the execution runner

use scriptgate_audit::AuditError;

/// Runner errors
///
/// Timeouts and resource kills are not errors; they come back as an
/// [`ExecutionResult`](scriptgate_model::ExecutionResult) with the matching
/// termination reason.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// Source lacks a passed scan bound to these exact bytes and policy
    #[error("refusing to execute unscanned code: {0}")]
    UnscannedCode(String),

    /// The sandbox could not be established; nothing ran unisolated
    #[error("isolation setup failed: {0}")]
    IsolationSetup(String),

    /// A caller-supplied binding is unusable
    #[error("invalid execution binding: {0}")]
    InvalidBinding(String),

    /// Interpreter for the language is not installed
    #[error("runtime '{program}' is not available: {message}")]
    RuntimeUnavailable { program: String, message: String },

    /// Scratch or pipe I/O failed
    #[error("runner I/O error: {0}")]
    Io(String),

    /// Audit log refused the event; the run does not proceed unaudited
    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl RunnerError {
    /// Create I/O error with context
    pub fn io(context: &str, err: &std::io::Error) -> Self {
        Self::Io(format!("{context}: {err}"))
    }

    /// Whether the error happened before anything was launched
    #[inline]
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::UnscannedCode(_) | Self::InvalidBinding(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_classes() {
        assert!(RunnerError::UnscannedCode("digest mismatch".into()).is_rejection());
        assert!(!RunnerError::IsolationSetup("unshare: EPERM".into()).is_rejection());
        let err: RunnerError = AuditError::sink("disk full").into();
        assert!(matches!(err, RunnerError::Audit(_)));
    }
}
