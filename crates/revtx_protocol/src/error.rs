//! Error types for the session protocol.

use revtx_model::ModelError;
use thiserror::Error;

/// Result type for protocol calls.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Failures of a protocol call itself.
///
/// A commit the repository refuses is reported through
/// [`CommitTransactionResult`](crate::CommitTransactionResult), not here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The call did not complete within the session timeout.
    #[error("operation timed out")]
    Timeout,

    /// A lock or unlock wait was interrupted.
    #[error("lock wait interrupted: {0}")]
    Interrupted(String),

    /// The session is closed.
    #[error("not connected to repository")]
    NotConnected,

    /// The repository raised an exception while serving the call.
    #[error("repository error: {0}")]
    Remote(String),

    /// Request or response could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl ProtocolError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProtocolError::Transport { retryable, .. } => *retryable,
            ProtocolError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true for an interrupted lock wait.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ProtocolError::Interrupted(_))
    }
}

impl From<ModelError> for ProtocolError {
    fn from(err: ModelError) -> Self {
        ProtocolError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ProtocolError::transport_retryable("connection reset").is_retryable());
        assert!(!ProtocolError::transport_fatal("bad certificate").is_retryable());
        assert!(ProtocolError::Timeout.is_retryable());
        assert!(!ProtocolError::Remote("boom".into()).is_retryable());
        assert!(!ProtocolError::Interrupted("x".into()).is_retryable());
    }

    #[test]
    fn interrupted_is_distinct() {
        assert!(ProtocolError::Interrupted("shutdown".into()).is_interrupted());
        assert!(!ProtocolError::Timeout.is_interrupted());
    }

    #[test]
    fn model_errors_become_codec_errors() {
        let err: ProtocolError = ModelError::serialization("truncated").into();
        assert!(matches!(err, ProtocolError::Codec(ref m) if m.contains("truncated")));
    }
}
