//! Error types for the RAG operator

use std::fmt;

/// Result type alias using RagError
pub type Result<T> = std::result::Result<T, RagError>;

/// Main error type for the RAG operator
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Referenced secret is missing or unreadable
    #[error("secret '{0}' not found")]
    MissingSecret(String),

    /// Source URI could not be parsed
    #[error("invalid source URI: {0}")]
    InvalidUri(String),

    /// S3 listing or configuration error
    #[error("S3 source error: {0}")]
    S3(String),

    /// HTTP metadata check error
    #[error("HTTP source error: {0}")]
    Http(String),

    /// Git remote-ref lookup error
    #[error("git source error: {0}")]
    Git(String),

    /// Filesystem error from a PVC walk
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    /// Create an internal error from any error type
    pub fn internal<E: fmt::Display>(err: E) -> Self {
        RagError::Internal(err.to_string())
    }

    /// Configuration errors are terminal for the current cycle: they are
    /// surfaced as a Failed phase on the resource instead of being retried
    /// by the work-queue, and recovery requires a spec change.
    pub fn is_config_error(&self) -> bool {
        matches!(self, RagError::MissingSecret(_) | RagError::InvalidUri(_))
    }
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        RagError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_classification() {
        assert!(RagError::MissingSecret("creds".into()).is_config_error());
        assert!(RagError::InvalidUri("ftp://x".into()).is_config_error());
        assert!(!RagError::S3("listing failed".into()).is_config_error());
        assert!(!RagError::Internal("boom".into()).is_config_error());
    }

    #[test]
    fn test_error_display() {
        let err = RagError::MissingSecret("source-creds".into());
        assert_eq!(err.to_string(), "secret 'source-creds' not found");
    }
}
