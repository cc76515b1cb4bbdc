//! Downstream half of a simple channel.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::error::{Result, SimpleChannelError};
use super::error_injector::ErrorInjector;

/// Reads frames from the data lane.
#[derive(Debug)]
pub struct SimpleReceiver {
    pub(super) rx: mpsc::Receiver<Bytes>,
    pub(super) acks: AckSender,
}

impl SimpleReceiver {
    /// Waits for the next frame. Returns `None` once every sender is dropped and the lane is
    /// drained.
    pub async fn read(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Handle used to acknowledge frames back to the upstream side.
    pub fn ack_sender(&self) -> AckSender {
        self.acks.clone()
    }

    /// Splits the receiver into a stream of frames and its ack sender.
    pub fn into_split(self) -> (ReceiverStream<Bytes>, AckSender) {
        (ReceiverStream::new(self.rx), self.acks)
    }
}

/// Sends acknowledgement frames upstream. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AckSender {
    pub(super) tx: mpsc::UnboundedSender<Bytes>,
    pub(super) name: &'static str,
    pub(super) error_injector: Arc<ErrorInjector>,
}

impl AckSender {
    /// Sends an acknowledgement frame. A dropped ack (see [ErrorInjector::drop_acks]) still
    /// returns `Ok`, the loss is only observable upstream.
    pub fn ack(&self, frame: Bytes) -> Result<()> {
        if self.error_injector.should_fail_ack() {
            return Err(SimpleChannelError::Ack("injected ack failure".to_string()));
        }
        if self.error_injector.should_drop_ack() {
            return Ok(());
        }
        self.tx
            .send(frame)
            .map_err(|_| SimpleChannelError::Closed(self.name))
    }
}
