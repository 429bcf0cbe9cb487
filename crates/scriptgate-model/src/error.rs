//! Error types for the shared model

/// Errors raised while building or parsing model values
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Invalid digest length
    #[error("invalid hash length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex encoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unsupported language name
    #[error("unknown language: '{0}'")]
    UnknownLanguage(String),

    /// Unknown severity name
    #[error("unknown severity: '{0}'")]
    UnknownSeverity(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_display() {
        let err = ModelError::UnknownLanguage("cobol".into());
        assert_eq!(err.to_string(), "unknown language: 'cobol'");

        let err = ModelError::InvalidLength { expected: 32, actual: 4 };
        assert!(err.to_string().contains("expected 32"));
    }
}
