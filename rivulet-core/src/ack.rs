//! Acknowledgement protocol between a downstream consumer and the upstream buffer.
//!
//! A consumer that fully processed a record sends an [AckEvent] back on the channel the record
//! arrived on. The [AckListener] applies it to the buffer; acks of unknown or retired records are
//! no-ops since acks may arrive late or duplicated.
//!
//! Independently, the [RedeliverySweep] wakes up every `sweep_interval`, takes a bounded batch of
//! entries older than the ack timeout from the buffer and sends them again with their original
//! ids. The buffer refreshes their insertion time, so a record is redelivered at most once per
//! timeout.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::Result;
use crate::buffer::{AckOutcome, BufferHandle};
use crate::codec::decode_ack;
use crate::collector::Collector;
use crate::message::RecordId;
use crate::transport::AckReader;

/// Confirms durable downstream consumption of the record with `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckEvent {
    pub id: RecordId,
}

impl AckEvent {
    pub fn new(id: RecordId) -> Self {
        Self { id }
    }
}

/// Reads ack frames from downstream and retires the acknowledged records.
pub(crate) struct AckListener {
    reader: Box<dyn AckReader>,
    buffer: BufferHandle,
}

impl AckListener {
    pub(crate) fn new(reader: Box<dyn AckReader>, buffer: BufferHandle) -> Self {
        Self { reader, buffer }
    }

    /// Runs until cancelled or until no more acks can arrive. Only a failing buffer is an error.
    pub(crate) async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = self.reader.next_ack() => next,
            };
            let Some((channel, frame)) = next else {
                debug!("All ack channels are closed, stopping the ack listener");
                return Ok(());
            };

            let ack = match decode_ack(frame) {
                Ok(ack) => ack,
                Err(e) => {
                    warn!(?e, channel, "Dropping undecodable ack frame");
                    continue;
                }
            };

            match self.buffer.ack(channel, ack.id.clone()).await? {
                AckOutcome::Retired => trace!(id = %ack.id, channel, "Record retired"),
                AckOutcome::Pending { remaining } => {
                    trace!(id = %ack.id, channel, remaining, "Record partially acknowledged")
                }
                AckOutcome::Unknown => {
                    debug!(id = %ack.id, channel, "Ignoring ack of unknown or retired record")
                }
            }
        }
    }
}

/// Time driven redelivery of records whose acknowledgement timed out.
pub(crate) struct RedeliverySweep {
    collector: Collector,
    interval: Duration,
}

impl RedeliverySweep {
    pub(crate) fn new(collector: Collector, interval: Duration) -> Self {
        Self {
            collector,
            interval,
        }
    }

    /// Sweeps every interval until cancelled. Fails when the buffer fails or a record ran out of
    /// redeliveries.
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            self.sweep_once().await?;
        }
    }

    /// Redelivers one batch of expired records, returning how many were sent again.
    pub(crate) async fn sweep_once(&self) -> Result<usize> {
        let redeliveries = self.collector.buffer().expire().await?;
        if redeliveries.is_empty() {
            return Ok(0);
        }

        for redelivery in &redeliveries {
            debug!(
                id = %redelivery.id,
                attempt = redelivery.attempt,
                channels = ?redelivery.channels,
                "Redelivering record"
            );
            self.collector.redeliver(redelivery).await;
        }
        info!(
            count = redeliveries.len(),
            "Redelivered records whose acknowledgement timed out"
        );
        Ok(redeliveries.len())
    }
}
