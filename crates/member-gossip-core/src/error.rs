//! Error types for member-gossip

use crate::types::MessageType;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// member-gossip error types
#[derive(Debug, Error)]
pub enum Error {
    /// Payload could not be packed or unpacked
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),

    /// Buffer carried no type tag at all
    #[error("empty message")]
    EmptyMessage,

    /// Leading tag byte is not a known message type
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// A known tag arrived on a path that only accepts another one
    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessageType {
        expected: MessageType,
        actual: MessageType,
    },

    /// Packed node metadata does not fit the transport's limit
    #[error("node metadata too large: {size} bytes (limit {limit})")]
    MetadataTooLarge { size: usize, limit: usize },
}
