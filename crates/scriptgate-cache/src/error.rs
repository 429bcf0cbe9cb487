//! Error types for the result cache

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Persistence store errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("cache store I/O error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Record could not be encoded or decoded
    #[error("cache record at {path} is invalid: {message}")]
    Serialization { path: PathBuf, message: String },
}

impl StoreError {
    /// Create I/O error
    pub fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Errors from [`ResultCache`](crate::ResultCache) lookups
///
/// `E` is the factory's error type. A factory failure is shared by every
/// caller coalesced onto the same flight, hence the `Arc`.
#[derive(Debug, thiserror::Error)]
pub enum CacheError<E> {
    /// The factory failed; every coalesced caller receives the same error
    #[error("factory failed: {0}")]
    Factory(Arc<E>),

    /// The in-flight computation panicked or was aborted
    #[error("single-flight computation aborted: {0}")]
    FlightAborted(String),

    /// Backing store unusable
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl<E> Clone for CacheError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Factory(err) => Self::Factory(Arc::clone(err)),
            Self::FlightAborted(msg) => Self::FlightAborted(msg.clone()),
            Self::Unavailable(msg) => Self::Unavailable(msg.clone()),
        }
    }
}

impl<E> CacheError<E> {
    /// Factory error, if that is what this is
    #[must_use]
    pub fn factory_error(&self) -> Option<&E> {
        match self {
            Self::Factory(err) => Some(err),
            _ => None,
        }
    }

    /// Whether caching itself (not the factory) failed
    #[inline]
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl<E> From<StoreError> for CacheError<E> {
    fn from(err: StoreError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Displays a factory error without requiring `E: Display` at the call site
pub(crate) struct FlightLabel<'a, E>(pub(crate) &'a CacheError<E>);

impl<E> fmt::Display for FlightLabel<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.0 {
            CacheError::Factory(_) => "factory",
            CacheError::FlightAborted(_) => "aborted",
            CacheError::Unavailable(_) => "unavailable",
        })
    }
}
