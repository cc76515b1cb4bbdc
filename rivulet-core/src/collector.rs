//! Collector is how emitted records leave an operator. For every record it
//!   1. picks the destination channels: the [ChannelSelector] over all channels, or, when an
//!      [OutputSelector] is configured, the [ChannelSelector] within the range of each selected
//!      output,
//!   2. inserts the encoded record into the fault-tolerance buffer, once, keyed by its id,
//!   3. sends the frame on each destination channel.
//!
//! The buffer insert comes first, it is where backpressure or [Error::BufferFull] happens. Once
//! buffered, a record is never lost by a failing send: the redelivery sweep retries every channel
//! that did not acknowledge it.

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::Result;
use crate::buffer::{BufferHandle, Redelivery};
use crate::codec::encode_record;
use crate::error::Error;
use crate::message::{Record, RecordId};
use crate::metrics::{operator_labels, runtime_metrics};
use crate::partitioner::ChannelSelector;
use crate::selector::{OutputRouting, OutputSelector};
use crate::transport::ChannelWriter;

/// Output selector and the channel ranges of the names it may return.
#[derive(Clone)]
struct OutputSelection {
    selector: Arc<dyn OutputSelector>,
    routing: Arc<OutputRouting>,
}

#[derive(Clone)]
pub struct Collector {
    channel_selector: Arc<dyn ChannelSelector>,
    output_selection: Option<OutputSelection>,
    num_channels: usize,
    writer: Arc<dyn ChannelWriter>,
    buffer: BufferHandle,
    /// reused accumulator handed to the output selector
    outputs: Vec<String>,
    labels: Vec<(String, String)>,
}

impl Collector {
    pub fn new(
        operator: &str,
        num_channels: usize,
        channel_selector: Arc<dyn ChannelSelector>,
        writer: Arc<dyn ChannelWriter>,
        buffer: BufferHandle,
    ) -> Result<Self> {
        if num_channels == 0 {
            return Err(Error::Config(format!(
                "operator {operator} has no output channels"
            )));
        }
        Ok(Self {
            channel_selector,
            output_selection: None,
            num_channels,
            writer,
            buffer,
            outputs: Vec::new(),
            labels: operator_labels(operator),
        })
    }

    /// Routes every record only to the channels of the named outputs `selector` picks for it.
    pub fn with_output_selector(
        mut self,
        selector: Arc<dyn OutputSelector>,
        routing: OutputRouting,
    ) -> Self {
        self.output_selection = Some(OutputSelection {
            selector,
            routing: Arc::new(routing),
        });
        self
    }

    /// Channels that must receive `record`, ascending. With output selection every selected
    /// output gets the channels the channel selector picks among its own range, so a shuffled
    /// record still reaches one channel of each output.
    pub fn destinations(&mut self, record: &Record) -> BTreeSet<usize> {
        let Some(selection) = &self.output_selection else {
            return self.select_within(record, 0..self.num_channels);
        };

        self.outputs.clear();
        selection.selector.select(record, &mut self.outputs);
        for name in self.outputs.iter() {
            if !selection.routing.contains(name) {
                debug!(output = %name, id = %record.id(), "Ignoring unconfigured output");
            }
        }

        let mut channels = BTreeSet::new();
        for range in selection.routing.ranges(&self.outputs) {
            channels.extend(self.select_within(record, range));
        }
        channels
    }

    fn select_within(&self, record: &Record, range: Range<usize>) -> BTreeSet<usize> {
        let width = range.len();
        self.channel_selector
            .select_channels(record, width)
            .into_iter()
            .filter(|channel| *channel < width)
            .map(|channel| range.start + channel)
            .collect()
    }

    /// Buffers `record` and sends it to its destination channels. Returns once the record is
    /// buffered and every send was attempted; a failed send is left to the redelivery sweep.
    pub async fn collect(&mut self, record: Record) -> Result<()> {
        let destinations = self.destinations(&record);
        if destinations.is_empty() {
            debug!(id = %record.id(), "Record has no destination, dropping it");
            runtime_metrics()
                .dropped_total
                .get_or_create(&self.labels)
                .inc();
            return Ok(());
        }

        let frame = encode_record(&record)?;
        self.buffer
            .insert(record.id().clone(), frame.clone(), destinations.clone())
            .await?;
        runtime_metrics()
            .emitted_total
            .get_or_create(&self.labels)
            .inc();

        for channel in destinations {
            self.send(channel, frame.clone(), record.id()).await;
        }
        Ok(())
    }

    /// Sends an expired record again on every channel that has not acknowledged it.
    pub async fn redeliver(&self, redelivery: &Redelivery) {
        for &channel in &redelivery.channels {
            self.send(channel, redelivery.frame.clone(), &redelivery.id)
                .await;
        }
        runtime_metrics()
            .redelivered_total
            .get_or_create(&self.labels)
            .inc();
    }

    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    async fn send(&self, channel: usize, frame: Bytes, id: &RecordId) {
        if let Err(e) = self.writer.send_bytes(channel, frame).await {
            warn!(?e, %id, channel, "Send failed, the record will be redelivered");
            runtime_metrics()
                .send_error_total
                .get_or_create(&self.labels)
                .inc();
        }
    }
}
