//! Error types for bitsync core

use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur in bitsync core
///
/// Every caller sharing a transfer observes the same result, so the error is
/// cheap to clone.
#[derive(Debug, Clone, Error)]
pub enum BitsyncError {
    #[error("Transport failed for bit {hash}: {reason}")]
    Transport {
        hash: String,
        reason: Arc<anyhow::Error>,
    },

    #[error("No transport backend configured")]
    NoBackend,

    #[error("Downloads must be started from within a tokio runtime")]
    NoRuntime,

    #[error("Transfer of bit {hash} was aborted")]
    Aborted { hash: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl BitsyncError {
    pub(crate) fn transport(hash: &str, error: anyhow::Error) -> Self {
        BitsyncError::Transport {
            hash: hash.to_string(),
            reason: Arc::new(error),
        }
    }

    /// Check if a fresh attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BitsyncError::Transport { .. } | BitsyncError::Aborted { .. }
        )
    }
}

// Allow converting to String for display layers
impl From<BitsyncError> for String {
    fn from(error: BitsyncError) -> Self {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_is_retryable() {
        let error = BitsyncError::transport("abc", anyhow::anyhow!("connection reset"));
        assert!(error.is_retryable());
        assert_eq!(
            error.to_string(),
            "Transport failed for bit abc: connection reset"
        );
    }

    #[test]
    fn test_configuration_errors_are_not_retryable() {
        assert!(!BitsyncError::NoBackend.is_retryable());
        assert!(!BitsyncError::NoRuntime.is_retryable());
    }
}
