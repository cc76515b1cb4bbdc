use thiserror::Error;

use crate::message::RecordId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Buffer is full")]
    BufferFull,

    #[error("Transport Error - {0}")]
    Transport(String),

    #[error("Codec Error - {0}")]
    Codec(String),

    #[error("Operator Error - {0}")]
    Operator(String),

    /// The fault-tolerance state of the operator can no longer be trusted.
    #[error("Buffer Error - {0}")]
    Buffer(String),

    #[error("Record {id} was not acknowledged after {attempts} redeliveries")]
    RedeliveryExhausted { id: RecordId, attempts: u32 },

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ActorPatternRecv(e.to_string())
    }
}
