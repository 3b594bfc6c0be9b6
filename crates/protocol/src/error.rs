//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering the ways a command or prompt can be rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The command line cannot be sent as a single line.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The prompt pattern is empty or does not compile.
    #[error("invalid prompt pattern: {0}")]
    InvalidPrompt(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<regex::Error> for ProtocolError {
    fn from(err: regex::Error) -> Self {
        ProtocolError::InvalidPrompt(err.to_string())
    }
}
