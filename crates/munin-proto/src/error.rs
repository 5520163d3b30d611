//! Protocol error types.

use thiserror::Error;

/// Errors produced while parsing or encoding IRC lines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,

    #[error("invalid message at byte {position}: {line}")]
    InvalidMessage { line: String, position: usize },

    #[error("invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("message exceeds 512 bytes ({0})")]
    LineTooLong(usize),

    #[error("too many parameters ({0}, max 15)")]
    TooManyParams(usize),
}

impl ProtocolError {
    /// Stable machine-readable code for logging and metrics labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyMessage => "empty_message",
            Self::InvalidMessage { .. } => "invalid_message",
            Self::InvalidPrefix(_) => "invalid_prefix",
            Self::LineTooLong(_) => "line_too_long",
            Self::TooManyParams(_) => "too_many_params",
        }
    }
}
