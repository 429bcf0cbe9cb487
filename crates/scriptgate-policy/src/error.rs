//! Error types for the policy engine

use std::path::PathBuf;

/// Errors raised while loading, merging or resolving policies
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// No policy registered under this name
    #[error("policy not found: '{0}'")]
    NotFound(String),

    /// A document names a base policy that does not exist
    #[error("policy '{policy}' extends unknown base '{base}'")]
    UnknownBase { policy: String, base: String },

    /// Base references form a cycle
    #[error("policy inheritance cycle involving: {0:?}")]
    InheritanceCycle(Vec<String>),

    /// A custom document would replace a built-in policy wholesale
    #[error("policy '{0}' shadows a built-in policy; declare `base: {0}` to extend it")]
    ShadowsBuiltin(String),

    /// Document has no name
    #[error("policy document in {path} has no name")]
    MissingName { path: PathBuf },

    /// Pattern rule does not compile
    #[error("invalid pattern '{rule}': {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    /// IO error reading a policy file
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML document error
    #[error("invalid YAML policy in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// TOML document error
    #[error("invalid TOML policy in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Serialization failure while exporting or digesting a policy
    #[error("policy serialization failed: {0}")]
    Serialization(String),

    /// No policies directory configured for a directory reload
    #[error("no policies directory configured")]
    NoPolicyDir,
}

impl PolicyError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is a configuration problem rather than a missing name
    #[inline]
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        !matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_error_display() {
        let err = PolicyError::NotFound("paranoid".into());
        assert_eq!(err.to_string(), "policy not found: 'paranoid'");
        assert!(!err.is_configuration());

        let err = PolicyError::UnknownBase {
            policy: "team".into(),
            base: "missing".into(),
        };
        assert!(err.to_string().contains("unknown base 'missing'"));
        assert!(err.is_configuration());
    }
}
