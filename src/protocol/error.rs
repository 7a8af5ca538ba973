//! Protocol error types.

use thiserror::Error;

/// Errors related to protocol message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame too short: expected {expected} bytes, got {got}")]
    FrameTooShort { expected: usize, got: usize },

    #[error("frame too large: max {max}, got {got}")]
    FrameTooLarge { max: usize, got: usize },

    #[error("failed to encode message: {0}")]
    Encode(#[source] postcard::Error),

    #[error("message is not a conversation message")]
    NotConversation,

    #[error("message builder has no signing key")]
    NoSigningKey,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Check if this error means the byte stream can no longer be trusted.
    ///
    /// Framing errors leave the stream unsynchronized; the only recovery is
    /// closing the connection.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedFrame(_)
                | ProtocolError::FrameTooShort { .. }
                | ProtocolError::FrameTooLarge { .. }
        )
    }
}
