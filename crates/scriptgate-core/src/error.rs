//! Error types for the pipeline orchestrator

use crate::generator::GenerationError;
use scriptgate_audit::AuditError;
use scriptgate_model::{Fingerprint, ScanFinding};
use scriptgate_policy::PolicyError;
use scriptgate_runner::RunnerError;
use std::path::PathBuf;

/// Pipeline errors
///
/// `Clone` because a single generation failure is handed to every caller
/// coalesced onto the same fingerprint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    /// Requested policy does not exist
    #[error("policy not found: '{0}'")]
    PolicyNotFound(String),

    /// Policy table could not be loaded or reloaded
    #[error("policy error: {0}")]
    Policy(String),

    /// Every generator gave up
    #[error(transparent)]
    Generation(#[from] GenerationError),

    /// The candidate failed its security scan
    #[error("script {} rejected by policy '{policy}' with {} finding(s)", .script_id.short(), .findings.len())]
    ScanRejected {
        /// Request fingerprint
        script_id: Fingerprint,
        /// Policy that rejected it
        policy: String,
        /// Every finding, blocking or not
        findings: Vec<ScanFinding>,
    },

    /// The runner could not execute approved code
    #[error("execution failed: {message}")]
    Execution {
        /// Runner error text
        message: String,
        /// Whether the sandbox itself could not be built
        isolation: bool,
    },

    /// Audit log refused an event; the operation was blocked
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// No cached script with this id
    #[error("script not found: {0}")]
    NotFound(String),

    /// Script id is not a 64-character hex fingerprint
    #[error("invalid script id '{0}'")]
    InvalidScriptId(String),

    /// Request could not be fingerprinted
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Execution task panicked or was aborted
    #[error("execution task aborted: {0}")]
    Aborted(String),
}

impl PipelineError {
    /// Whether retrying the same request could succeed
    ///
    /// Only transient generator failures qualify. Rejections, missing
    /// policies and isolation failures are terminal for the request.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Generation(err) => err.retryable,
            _ => false,
        }
    }

    /// Findings of a rejected scan
    #[must_use]
    pub fn findings(&self) -> Option<&[ScanFinding]> {
        match self {
            Self::ScanRejected { findings, .. } => Some(findings),
            _ => None,
        }
    }
}

impl From<PolicyError> for PipelineError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::NotFound(name) => Self::PolicyNotFound(name),
            other => Self::Policy(other.to_string()),
        }
    }
}

impl From<RunnerError> for PipelineError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Audit(audit) => Self::Audit(audit),
            other => Self::Execution {
                isolation: matches!(other, RunnerError::IsolationSetup(_)),
                message: other.to_string(),
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Config file
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("invalid config {path}: {source}")]
    Parse {
        /// Config file
        path: PathBuf,
        /// Parser diagnostics
        #[source]
        source: toml::de::Error,
    },

    /// An environment override has an unusable value
    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv {
        /// Variable name
        key: String,
        /// Rejected value
        value: String,
    },
}
