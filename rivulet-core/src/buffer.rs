//! Fault-tolerance buffer holds every emitted record until all of its destination channels have
//! acknowledged it, so it can be redelivered if an acknowledgement does not arrive in time.
//!
//! The buffer is an actor: the collector inserts, the ack listener retires, and the redelivery
//! sweep expires entries, all through a cloneable [BufferHandle]. The actor owns the
//! [index::RecordIndex] and the [block] store, so every mutation is serialized without a lock.
//!
//! ```text
//! collector --insert--> +-------------------------+ <--ack-- ack listener
//!                       | index: id -> (blk, ent) |
//!                       | blocks: payload slots   |
//!   sweep --expire----> +-------------------------+
//! ```
//!
//! Inserts beyond `capacity` either wait in FIFO order for acknowledgements to free a slot or fail
//! with [Error::BufferFull], see [BufferFullStrategy].

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Result;
use crate::buffer::block::BlockStore;
use crate::buffer::index::{Location, RecordIndex};
use crate::config::{AckConfig, BufferConfig, BufferFullStrategy};
use crate::error::Error;
use crate::message::RecordId;
use crate::metrics::{operator_labels, runtime_metrics};

pub(crate) mod block;
pub mod index;

/// log every Nth parked insert while the buffer is full
const BUFFER_FULL_LOG_INTERVAL: usize = 500;

/// Result of applying an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// every destination acknowledged, the entry is gone
    Retired,
    /// still waiting for `remaining` channels
    Pending { remaining: usize },
    /// unknown, already retired or already acknowledged on this channel
    Unknown,
}

/// An expired record that has to be sent again.
#[derive(Debug, Clone, PartialEq)]
pub struct Redelivery {
    pub id: RecordId,
    pub frame: Bytes,
    /// channels that have not acknowledged yet
    pub channels: Vec<usize>,
    /// how many times the record has been redelivered, including this one
    pub attempt: u32,
}

#[derive(Debug)]
struct BufferedEntry {
    frame: Bytes,
    outstanding: BTreeSet<usize>,
    redeliveries: u32,
}

struct PendingInsert {
    id: RecordId,
    frame: Bytes,
    channels: BTreeSet<usize>,
    respond_to: oneshot::Sender<Result<()>>,
}

enum ActorMessage {
    Insert {
        id: RecordId,
        frame: Bytes,
        channels: BTreeSet<usize>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Ack {
        channel: usize,
        id: RecordId,
        respond_to: oneshot::Sender<Result<AckOutcome>>,
    },
    Expire {
        respond_to: oneshot::Sender<Result<Vec<Redelivery>>>,
    },
    WaitDrained {
        respond_to: oneshot::Sender<()>,
    },
    EvictAll {
        respond_to: oneshot::Sender<Vec<RecordId>>,
    },
    Get {
        id: RecordId,
        respond_to: oneshot::Sender<Option<Location>>,
    },
    Len {
        respond_to: oneshot::Sender<usize>,
    },
}

struct FaultToleranceBuffer {
    receiver: mpsc::Receiver<ActorMessage>,
    index: RecordIndex,
    store: BlockStore<BufferedEntry>,
    capacity: usize,
    strategy: BufferFullStrategy,
    ack_timeout: Duration,
    sweep_batch_size: usize,
    max_redeliveries: Option<u32>,
    parked: VecDeque<PendingInsert>,
    parked_total: usize,
    drain_waiters: Vec<oneshot::Sender<()>>,
    labels: Vec<(String, String)>,
}

impl FaultToleranceBuffer {
    fn new(
        receiver: mpsc::Receiver<ActorMessage>,
        operator: &str,
        buffer_config: &BufferConfig,
        ack_config: &AckConfig,
    ) -> Self {
        Self {
            receiver,
            index: RecordIndex::new(),
            store: BlockStore::new(buffer_config.block_size),
            capacity: buffer_config.capacity,
            strategy: buffer_config.buffer_full_strategy,
            ack_timeout: ack_config.timeout,
            sweep_batch_size: ack_config.sweep_batch_size,
            max_redeliveries: ack_config.max_redeliveries,
            parked: VecDeque::new(),
            parked_total: 0,
            drain_waiters: Vec::new(),
            labels: operator_labels(operator),
        }
    }

    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Insert {
                id,
                frame,
                channels,
                respond_to,
            } => self.handle_insert(PendingInsert {
                id,
                frame,
                channels,
                respond_to,
            }),
            ActorMessage::Ack {
                channel,
                id,
                respond_to,
            } => {
                let outcome = self.handle_ack(channel, &id);
                let _ = respond_to.send(outcome);
            }
            ActorMessage::Expire { respond_to } => {
                let _ = respond_to.send(self.handle_expire());
            }
            ActorMessage::WaitDrained { respond_to } => {
                if self.is_drained() {
                    let _ = respond_to.send(());
                } else {
                    self.drain_waiters.push(respond_to);
                }
            }
            ActorMessage::EvictAll { respond_to } => {
                let _ = respond_to.send(self.handle_evict_all());
            }
            ActorMessage::Get { id, respond_to } => {
                let _ = respond_to.send(self.index.get(&id));
            }
            ActorMessage::Len { respond_to } => {
                let _ = respond_to.send(self.index.len());
            }
        }
    }

    fn handle_insert(&mut self, insert: PendingInsert) {
        // a known id replaces its entry and does not take a new slot
        let replaces = self.index.get(&insert.id).is_some();
        if !replaces && self.store.live() >= self.capacity {
            match self.strategy {
                BufferFullStrategy::Fail => {
                    let _ = insert.respond_to.send(Err(Error::BufferFull));
                }
                BufferFullStrategy::Block => {
                    if self.parked_total % BUFFER_FULL_LOG_INTERVAL == 0 {
                        warn!(
                            capacity = self.capacity,
                            parked = self.parked.len() + 1,
                            "Fault-tolerance buffer is full, blocking emission until acknowledgements arrive"
                        );
                    }
                    self.parked_total += 1;
                    self.parked.push_back(insert);
                }
            }
            return;
        }

        self.store_entry(insert.id, insert.frame, insert.channels, 0);
        let _ = insert.respond_to.send(Ok(()));
    }

    fn store_entry(
        &mut self,
        id: RecordId,
        frame: Bytes,
        outstanding: BTreeSet<usize>,
        redeliveries: u32,
    ) {
        let location = self.store.append(BufferedEntry {
            frame,
            outstanding,
            redeliveries,
        });
        if let Some(previous) = self.index.put(id, location, Instant::now()) {
            self.store.release(previous);
        }
        self.update_pending_gauge();
    }

    fn handle_ack(&mut self, channel: usize, id: &RecordId) -> Result<AckOutcome> {
        let Some(location) = self.index.get(id) else {
            return Ok(AckOutcome::Unknown);
        };
        let Some(entry) = self.store.get_mut(location) else {
            return Err(Error::Buffer(format!(
                "index entry of {id} points to released slot {location}"
            )));
        };
        if !entry.outstanding.remove(&channel) {
            return Ok(AckOutcome::Unknown);
        }
        if !entry.outstanding.is_empty() {
            return Ok(AckOutcome::Pending {
                remaining: entry.outstanding.len(),
            });
        }

        self.index.remove(id);
        self.store.release(location);
        runtime_metrics().acked_total.get_or_create(&self.labels).inc();
        self.update_pending_gauge();
        self.admit_parked();
        self.notify_drained();
        Ok(AckOutcome::Retired)
    }

    /// Collects up to `sweep_batch_size` expired entries, relocating each one to a fresh slot with
    /// a refreshed insertion time.
    fn handle_expire(&mut self) -> Result<Vec<Redelivery>> {
        let now = Instant::now();
        let Some(cutoff) = now.checked_sub(self.ack_timeout) else {
            return Ok(vec![]);
        };

        let expired = self.index.entries_older_than(cutoff, self.sweep_batch_size);
        let mut redeliveries = Vec::with_capacity(expired.len());
        for (id, location) in expired {
            let Some(entry) = self.store.get(location) else {
                return Err(Error::Buffer(format!(
                    "index entry of {id} points to released slot {location}"
                )));
            };
            if self
                .max_redeliveries
                .is_some_and(|max| entry.redeliveries >= max)
            {
                return Err(Error::RedeliveryExhausted {
                    id,
                    attempts: entry.redeliveries,
                });
            }

            let Some(entry) = self.store.release(location) else {
                return Err(Error::Buffer(format!(
                    "slot {location} of {id} vanished during redelivery"
                )));
            };
            let attempt = entry.redeliveries + 1;
            debug!(?id, attempt, from = %location, "Redelivering expired record");
            redeliveries.push(Redelivery {
                id: id.clone(),
                frame: entry.frame.clone(),
                channels: entry.outstanding.iter().copied().collect(),
                attempt,
            });
            self.store_entry(id, entry.frame, entry.outstanding, attempt);
        }
        Ok(redeliveries)
    }

    /// Drops every entry, returning the ids in insertion order.
    fn handle_evict_all(&mut self) -> Vec<RecordId> {
        let evicted = self.index.evict_oldest(self.index.len());
        let mut ids = Vec::with_capacity(evicted.len());
        for (id, location) in evicted {
            self.store.release(location);
            ids.push(id);
        }
        self.update_pending_gauge();
        self.admit_parked();
        self.notify_drained();
        ids
    }

    /// Moves parked inserts into the buffer while there is room.
    fn admit_parked(&mut self) {
        while self.store.live() < self.capacity {
            let Some(insert) = self.parked.pop_front() else {
                break;
            };
            // the emitter gave up waiting
            if insert.respond_to.is_closed() {
                continue;
            }
            self.store_entry(insert.id, insert.frame, insert.channels, 0);
            let _ = insert.respond_to.send(Ok(()));
        }
    }

    fn is_drained(&self) -> bool {
        self.index.is_empty() && self.parked.is_empty()
    }

    fn notify_drained(&mut self) {
        if self.is_drained() {
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn update_pending_gauge(&self) {
        runtime_metrics()
            .buffer_pending
            .get_or_create(&self.labels)
            .set(self.index.len() as i64);
    }
}

/// BufferHandle is the interface to the fault-tolerance buffer of one operator. It is cheap to
/// clone; the buffer lives until the last handle is dropped.
#[derive(Clone)]
pub struct BufferHandle {
    sender: mpsc::Sender<ActorMessage>,
}

impl BufferHandle {
    /// Creates the buffer of `operator` and spawns its actor.
    pub fn new(operator: &str, buffer_config: &BufferConfig, ack_config: &AckConfig) -> Self {
        let (sender, receiver) = mpsc::channel(100);
        let buffer = FaultToleranceBuffer::new(receiver, operator, buffer_config, ack_config);
        tokio::spawn(buffer.run());
        Self { sender }
    }

    /// Buffers the encoded record until each of `channels` acknowledged it. Waits for room when
    /// the buffer is full and the strategy is [BufferFullStrategy::Block].
    pub async fn insert(&self, id: RecordId, frame: Bytes, channels: BTreeSet<usize>) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::Insert {
            id,
            frame,
            channels,
            respond_to,
        })
        .await?;
        response.await?
    }

    /// Applies an acknowledgement of `id` received on `channel`.
    pub async fn ack(&self, channel: usize, id: RecordId) -> Result<AckOutcome> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::Ack {
            channel,
            id,
            respond_to,
        })
        .await?;
        response.await?
    }

    /// Takes a bounded batch of entries whose acknowledgement timed out. The returned records are
    /// already re-buffered with a fresh timestamp and must be sent again.
    pub async fn expire(&self) -> Result<Vec<Redelivery>> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::Expire { respond_to }).await?;
        response.await?
    }

    /// Resolves once nothing is buffered or waiting for room.
    pub async fn wait_until_drained(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::WaitDrained { respond_to }).await?;
        Ok(response.await?)
    }

    /// Drops every buffered entry, returning the ids that were never acknowledged.
    pub async fn evict_all(&self) -> Result<Vec<RecordId>> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::EvictAll { respond_to }).await?;
        Ok(response.await?)
    }

    /// Location of the buffered payload of `id`, `None` if it is not buffered.
    pub async fn get(&self, id: &RecordId) -> Result<Option<Location>> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::Get {
            id: id.clone(),
            respond_to,
        })
        .await?;
        Ok(response.await?)
    }

    /// Number of buffered records.
    pub async fn len(&self) -> Result<usize> {
        let (respond_to, response) = oneshot::channel();
        self.send(ActorMessage::Len { respond_to }).await?;
        Ok(response.await?)
    }

    async fn send(&self, message: ActorMessage) -> Result<()> {
        self.sender
            .send(message)
            .await
            .map_err(|e| Error::Buffer(format!("buffer actor is gone: {e}")))
    }
}
