//! Transport traits over the in-memory `rivulet-testing` simplechannel, used to wire operators
//! together in tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rivulet_testing::simplechannel::{
    AckSender, ErrorInjector, SimpleChannel, SimpleChannelError, SimpleReceiver, SimpleSender,
};
use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

use crate::Result;
use crate::error::Error;
use crate::transport::{AckReader, ChannelWriter, InboundFrame, InputReader, WriteError};

pub(crate) struct SimpleChannelWriter {
    senders: Vec<SimpleSender>,
}

#[async_trait]
impl ChannelWriter for SimpleChannelWriter {
    async fn send_bytes(&self, channel: usize, frame: Bytes) -> std::result::Result<(), WriteError> {
        let sender = self
            .senders
            .get(channel)
            .ok_or_else(|| WriteError::WriteFailed(format!("no such channel {channel}")))?;
        sender.write(frame).await.map_err(|e| match e {
            SimpleChannelError::BufferFull => WriteError::BufferFull,
            other => WriteError::WriteFailed(other.to_string()),
        })
    }
}

pub(crate) struct SimpleAckReader {
    acks: StreamMap<usize, UnboundedReceiverStream<Bytes>>,
}

#[async_trait]
impl AckReader for SimpleAckReader {
    async fn next_ack(&mut self) -> Option<(usize, Bytes)> {
        self.acks.next().await
    }
}

pub(crate) struct SimpleInputReader {
    lanes: StreamMap<usize, ReceiverStream<Bytes>>,
    ackers: Vec<AckSender>,
}

impl SimpleInputReader {
    pub(crate) fn new(receivers: Vec<SimpleReceiver>) -> Self {
        let mut lanes = StreamMap::new();
        let mut ackers = Vec::with_capacity(receivers.len());
        for (lane, receiver) in receivers.into_iter().enumerate() {
            let (stream, acker) = receiver.into_split();
            lanes.insert(lane, stream);
            ackers.push(acker);
        }
        Self { lanes, ackers }
    }
}

#[async_trait]
impl InputReader for SimpleInputReader {
    async fn read(&mut self) -> Result<Option<InboundFrame>> {
        Ok(self
            .lanes
            .next()
            .await
            .map(|(lane, frame)| InboundFrame { lane, frame }))
    }

    async fn ack(&mut self, lane: usize, frame: Bytes) -> Result<()> {
        let acker = self
            .ackers
            .get(lane)
            .ok_or_else(|| Error::Transport(format!("no such input lane {lane}")))?;
        acker
            .ack(frame)
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// Output side of an operator wired to `channels` in-memory lanes.
pub(crate) struct SimpleWiring {
    pub(crate) writer: SimpleChannelWriter,
    pub(crate) ack_reader: SimpleAckReader,
    /// downstream ends, one per channel
    pub(crate) receivers: Vec<SimpleReceiver>,
    pub(crate) injectors: Vec<Arc<ErrorInjector>>,
}

pub(crate) fn wire(channels: usize, capacity: usize) -> SimpleWiring {
    let mut senders = Vec::with_capacity(channels);
    let mut receivers = Vec::with_capacity(channels);
    let mut injectors = Vec::with_capacity(channels);
    let mut acks = StreamMap::new();

    for channel in 0..channels {
        let simple = SimpleChannel::new(capacity, "test-lane");
        injectors.push(simple.error_injector());
        let (sender, receiver, inbox) = simple.split();
        senders.push(sender);
        receivers.push(receiver);
        acks.insert(channel, inbox.into_stream());
    }

    SimpleWiring {
        writer: SimpleChannelWriter { senders },
        ack_reader: SimpleAckReader { acks },
        receivers,
        injectors,
    }
}
