//! Boundary to the network transport that physically carries frames between operators. The
//! transport gives one reliable, ordered byte lane per output channel, a way to receive
//! acknowledgements flowing back upstream, and, for task and sink operators, an input to pull
//! records from. Frames are opaque here, see [crate::codec].

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::Result;

#[cfg(test)]
pub(crate) mod simplechannel;

/// Failure of a single frame write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("Channel is full")]
    BufferFull,
    #[error("Write failed - {0}")]
    WriteFailed(String),
}

/// Sends frames on the output channels of an operator.
#[async_trait]
pub trait ChannelWriter: Send + Sync {
    /// Sends one frame on `channel`. Frames sent on the same channel arrive in order.
    async fn send_bytes(&self, channel: usize, frame: Bytes) -> std::result::Result<(), WriteError>;
}

/// Receives acknowledgement frames from downstream.
#[async_trait]
pub trait AckReader: Send {
    /// Next ack frame and the channel it came back on, `None` once no more acks can arrive.
    async fn next_ack(&mut self) -> Option<(usize, Bytes)>;
}

/// A record frame read from one of the input lanes of an operator.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub lane: usize,
    pub frame: Bytes,
}

/// Input of a task or sink operator.
#[async_trait]
pub trait InputReader: Send {
    /// Waits for the next frame, `None` once every input lane is closed.
    async fn read(&mut self) -> Result<Option<InboundFrame>>;

    /// Sends an ack frame upstream on `lane`.
    async fn ack(&mut self, lane: usize, frame: Bytes) -> Result<()>;
}
