//! Record distribution and fault-tolerance core of the rivulet stream engine.
//!
//! Operators emit [message::Record]s through a [collector::Collector], which picks the output
//! channels ([partitioner], [selector]), keeps every record in the [buffer] until all of its
//! destinations acknowledged it ([ack]), and redelivers what was not acknowledged in time.
//! The [runtime] drives source, task and sink operators through their lifecycle.

pub use self::error::{Error, Result};

mod error;

/// Acknowledgement protocol and redelivery.
pub mod ack;

/// Fault-tolerance buffer and its ordered index.
pub mod buffer;

/// Framing of records and acks on the transport.
pub mod codec;

pub mod collector;

pub mod config;

pub mod message;

pub mod metrics;

/// User operator roles and the emitter.
pub mod operator;

/// Channel selectors.
pub mod partitioner;

pub mod runtime;

/// Named output selection.
pub mod selector;

pub mod setup_tracing;

/// Transport boundary.
pub mod transport;
