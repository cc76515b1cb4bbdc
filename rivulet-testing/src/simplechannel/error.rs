//! Error types for the simple channel.

use thiserror::Error;

/// Result type for simple channel operations.
pub type Result<T> = std::result::Result<T, SimpleChannelError>;

/// Errors specific to the simple channel implementation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimpleChannelError {
    #[error("Channel is full")]
    BufferFull,

    #[error("Failed to write frame: {0}")]
    Write(String),

    #[error("Failed to send acknowledgement: {0}")]
    Ack(String),

    #[error("Channel {0} is closed")]
    Closed(&'static str),
}
