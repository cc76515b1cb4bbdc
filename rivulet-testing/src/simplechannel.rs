//! Simple channel implementation for testing.
//!
//! A [SimpleChannel] is one logical connection between an upstream and a downstream operator: a
//! bounded, ordered data lane flowing downstream and an unbounded acknowledgement lane flowing
//! back upstream. Both lanes carry opaque bytes, the framing belongs to the caller.
//!
//! # Features
//! - Bounded data lane, a full lane rejects writes with [SimpleChannelError::BufferFull]
//! - Per-lane ordering, like a reliable ordered network connection
//! - Error injection for failed writes, forced buffer-full and lost acknowledgements
//!
//! # Example
//! ```ignore
//! use rivulet_testing::simplechannel::SimpleChannel;
//!
//! let channel = SimpleChannel::new(100, "edge-0");
//! let injector = channel.error_injector();
//! let (sender, receiver, acks) = channel.split();
//! ```

/// Error types.
mod error;
/// Error injector for testing.
mod error_injector;
/// Downstream half: data reader and ack sender.
mod receiver;
/// Upstream half: data writer and ack inbox.
mod sender;

pub use error::{Result, SimpleChannelError};
pub use error_injector::ErrorInjector;
pub use receiver::{AckSender, SimpleReceiver};
pub use sender::{AckInbox, SimpleSender};

use std::sync::Arc;

use tokio::sync::mpsc;

/// One in-memory connection, not yet split into its upstream and downstream halves.
#[derive(Debug)]
pub struct SimpleChannel {
    sender: SimpleSender,
    receiver: SimpleReceiver,
    acks: AckInbox,
    error_injector: Arc<ErrorInjector>,
}

impl SimpleChannel {
    /// Create a new simple channel whose data lane holds at most `capacity` frames.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of undelivered frames on the data lane.
    /// * `name` - Name of the channel (must be static).
    pub fn new(capacity: usize, name: &'static str) -> Self {
        let error_injector = Arc::new(ErrorInjector::new());
        let (data_tx, data_rx) = mpsc::channel(capacity.max(1));
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        Self {
            sender: SimpleSender {
                tx: data_tx,
                name,
                error_injector: Arc::clone(&error_injector),
            },
            receiver: SimpleReceiver {
                rx: data_rx,
                acks: AckSender {
                    tx: ack_tx,
                    name,
                    error_injector: Arc::clone(&error_injector),
                },
            },
            acks: AckInbox { rx: ack_rx },
            error_injector,
        }
    }

    /// Get the error injector shared by both halves of this channel.
    pub fn error_injector(&self) -> Arc<ErrorInjector> {
        Arc::clone(&self.error_injector)
    }

    /// Split the channel into the upstream writer, the downstream reader and the upstream ack
    /// inbox.
    pub fn split(self) -> (SimpleSender, SimpleReceiver, AckInbox) {
        (self.sender, self.receiver, self.acks)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn test_data_flows_downstream_and_acks_upstream() {
        let channel = SimpleChannel::new(4, "test-channel");
        let (sender, mut receiver, mut acks) = channel.split();

        sender.write(Bytes::from("one")).await.unwrap();
        sender.write(Bytes::from("two")).await.unwrap();

        assert_eq!(receiver.read().await.unwrap(), Bytes::from("one"));
        assert_eq!(receiver.read().await.unwrap(), Bytes::from("two"));

        receiver.ack_sender().ack(Bytes::from("ack-one")).unwrap();
        assert_eq!(acks.recv().await.unwrap(), Bytes::from("ack-one"));
    }

    #[tokio::test]
    async fn test_full_lane_rejects_writes() {
        let channel = SimpleChannel::new(1, "full-channel");
        let (sender, _receiver, _acks) = channel.split();

        sender.write(Bytes::from("one")).await.unwrap();
        let result = sender.write(Bytes::from("two")).await;
        assert!(matches!(result, Err(SimpleChannelError::BufferFull)));
    }

    #[tokio::test]
    async fn test_reader_sees_end_of_stream_when_sender_dropped() {
        let channel = SimpleChannel::new(1, "closing-channel");
        let (sender, mut receiver, _acks) = channel.split();
        drop(sender);
        assert!(receiver.read().await.is_none());
    }

    #[tokio::test]
    async fn test_injected_errors_are_shared_by_both_halves() {
        let channel = SimpleChannel::new(4, "injected-channel");
        let injector = channel.error_injector();
        let (sender, receiver, mut acks) = channel.split();

        injector.fail_writes(1);
        assert!(matches!(
            sender.write(Bytes::from("x")).await,
            Err(SimpleChannelError::Write(_))
        ));
        assert!(sender.write(Bytes::from("x")).await.is_ok());

        injector.drop_acks(1);
        let ack_sender = receiver.ack_sender();
        ack_sender.ack(Bytes::from("lost")).unwrap();
        ack_sender.ack(Bytes::from("kept")).unwrap();
        assert_eq!(acks.recv().await.unwrap(), Bytes::from("kept"));
    }
}
