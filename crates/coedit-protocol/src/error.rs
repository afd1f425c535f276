//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Empty message")]
    Empty,

    #[error("Unknown channel: {0}")]
    UnknownChannel(u8),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::InvalidJson(e.to_string())
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
