//! Upstream half of a simple channel.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::error::{Result, SimpleChannelError};
use super::error_injector::ErrorInjector;

/// Writes frames onto the data lane. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SimpleSender {
    pub(super) tx: mpsc::Sender<Bytes>,
    pub(super) name: &'static str,
    pub(super) error_injector: Arc<ErrorInjector>,
}

impl SimpleSender {
    /// Write a frame without waiting for room on the lane.
    pub async fn write(&self, frame: Bytes) -> Result<()> {
        if self.error_injector.should_fail_write() {
            return Err(SimpleChannelError::Write(
                "injected write failure".to_string(),
            ));
        }

        if self.error_injector.is_buffer_full() {
            return Err(SimpleChannelError::BufferFull);
        }

        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SimpleChannelError::BufferFull),
            Err(TrySendError::Closed(_)) => Err(SimpleChannelError::Closed(self.name)),
        }
    }
}

/// Receives acknowledgement frames sent back by the downstream half.
#[derive(Debug)]
pub struct AckInbox {
    pub(super) rx: mpsc::UnboundedReceiver<Bytes>,
}

impl AckInbox {
    /// Waits for the next acknowledgement frame, `None` once the downstream half is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Converts the inbox into a stream of acknowledgement frames.
    pub fn into_stream(self) -> UnboundedReceiverStream<Bytes> {
        UnboundedReceiverStream::new(self.rx)
    }
}
