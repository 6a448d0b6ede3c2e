//! Error types for the MPT runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur while loading, evaluating or quantizing a model.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Bad magic, unsupported version, unknown encoding or truncated framing.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// A tensor record names a tensor the catalog does not declare.
    #[error("unknown tensor: {0}")]
    UnknownTensor(String),

    /// Declared element count or dimensions diverge from the catalog.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Declared payload byte size diverges from the catalog.
    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    /// A catalog entry was never written by any tensor record.
    #[error("missing tensor: {0}")]
    MissingTensor(String),

    /// Evaluation would overflow the context window.
    #[error("context limit exceeded: n_past {n_past} + {n_tokens} new tokens > n_ctx {n_ctx}")]
    ContextLimitExceeded {
        /// Positions already evaluated.
        n_past: usize,
        /// Tokens in the rejected call.
        n_tokens: usize,
        /// Context window of the model.
        n_ctx: usize,
    },

    /// Token id outside the vocabulary.
    #[error("invalid token {token} (n_vocab {n_vocab})")]
    InvalidToken {
        /// Offending token id.
        token: u32,
        /// Vocabulary size of the model.
        n_vocab: usize,
    },

    /// An evaluation call carried no tokens.
    #[error("empty token batch")]
    EmptyBatch,

    /// A storage arena, cache or scratch buffer could not be allocated.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// The quantizer was asked for an encoding it cannot produce.
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

/// Coarse status codes exposed through the handle API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,
    /// Caller supplied bad input (file contents, tokens, handle).
    Invalid = 1,
    /// Internal failure (allocation, I/O, backend).
    Failure = 2,
    /// The context window would overflow.
    ContextLimit = 3,
}

impl RuntimeError {
    /// Collapse the error into its handle-API status code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidFormat(_)
            | Self::UnknownTensor(_)
            | Self::ShapeMismatch(_)
            | Self::SizeMismatch(_)
            | Self::MissingTensor(_)
            | Self::InvalidToken { .. }
            | Self::EmptyBatch
            | Self::UnsupportedEncoding(_) => ErrorCode::Invalid,
            Self::ContextLimitExceeded { .. } => ErrorCode::ContextLimit,
            Self::AllocationFailure(_)
            | Self::IoError(_)
            | Self::SerdeError(_)
            | Self::TensorError(_) => ErrorCode::Failure,
        }
    }

    /// Map a short read inside the container to `InvalidFormat`.
    pub(crate) fn from_read(err: std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::InvalidFormat(format!("truncated file while reading {what}"))
        } else {
            Self::IoError(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(
            RuntimeError::InvalidFormat("bad magic".into()).code(),
            ErrorCode::Invalid
        );
        assert_eq!(
            RuntimeError::ContextLimitExceeded {
                n_past: 7,
                n_tokens: 2,
                n_ctx: 8
            }
            .code(),
            ErrorCode::ContextLimit
        );
        assert_eq!(
            RuntimeError::AllocationFailure("arena".into()).code(),
            ErrorCode::Failure
        );
    }

    #[test]
    fn short_read_is_invalid_format() {
        let eof = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        let err = RuntimeError::from_read(eof, "header");
        assert!(matches!(err, RuntimeError::InvalidFormat(_)));

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(
            RuntimeError::from_read(denied, "header"),
            RuntimeError::IoError(_)
        ));
    }
}
