//! Channel selectors decide which of an operator's output channels receive a record.
//!
//! ```text
//! Shuffle   : one uniformly random channel, load spreading only
//! Fields    : hash(designated fields) % channels, equal keys always land together
//! Broadcast : every channel
//! ```
//!
//! The channel count is validated when the collector is built, selectors never see zero.

use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use fxhash::FxHasher64;
use rand::Rng;
use serde::Deserialize;

use crate::Result;
use crate::error::Error;
use crate::message::{Record, Value};

/// Chooses the output channels of a record.
pub trait ChannelSelector: Send + Sync + fmt::Debug {
    /// Returns the sorted, de-duplicated channel indices in `[0, num_channels)` that must
    /// receive the record. An empty result means the record goes nowhere.
    fn select_channels(&self, record: &Record, num_channels: usize) -> Vec<usize>;
}

/// Uniformly random single channel. Equal records may land on different channels.
#[derive(Debug, Default, Clone)]
pub struct Shuffle;

impl ChannelSelector for Shuffle {
    fn select_channels(&self, _record: &Record, num_channels: usize) -> Vec<usize> {
        if num_channels == 0 {
            return vec![];
        }
        vec![rand::rng().random_range(0..num_channels)]
    }
}

/// Deterministic routing on the hash of the fields at `positions`. The hash is unkeyed, so the
/// same values pick the same channel across restarts and redeliveries.
#[derive(Debug, Clone)]
pub struct Fields {
    positions: Vec<usize>,
}

impl Fields {
    pub fn new(positions: Vec<usize>) -> Result<Self> {
        if positions.is_empty() {
            return Err(Error::Config(
                "fields partitioning needs at least one field position".to_string(),
            ));
        }
        Ok(Self { positions })
    }
}

impl ChannelSelector for Fields {
    fn select_channels(&self, record: &Record, num_channels: usize) -> Vec<usize> {
        if num_channels == 0 {
            return vec![];
        }
        let mut hasher = FxHasher64::default();
        for &position in &self.positions {
            // a record without the designated field matches no partition
            let Some(value) = record.field(position) else {
                return vec![];
            };
            hash_value(&mut hasher, value);
        }
        vec![(hasher.finish() % num_channels as u64) as usize]
    }
}

/// Every channel.
#[derive(Debug, Default, Clone)]
pub struct Broadcast;

impl ChannelSelector for Broadcast {
    fn select_channels(&self, _record: &Record, num_channels: usize) -> Vec<usize> {
        (0..num_channels).collect()
    }
}

/// Hash a value with an explicit, platform independent byte layout.
fn hash_value(hasher: &mut FxHasher64, value: &Value) {
    match value {
        Value::Null => hasher.write_u8(0),
        Value::Bool(v) => {
            hasher.write_u8(1);
            hasher.write_u8(u8::from(*v));
        }
        Value::Int(v) => {
            hasher.write_u8(2);
            hasher.write(&v.to_le_bytes());
        }
        Value::Float(v) => {
            hasher.write_u8(3);
            hasher.write(&v.to_bits().to_le_bytes());
        }
        Value::Str(v) => {
            hasher.write_u8(4);
            hasher.write(&(v.len() as u64).to_le_bytes());
            hasher.write(v.as_bytes());
        }
        Value::Bytes(v) => {
            hasher.write_u8(5);
            hasher.write(&(v.len() as u64).to_le_bytes());
            hasher.write(v);
        }
    }
}

/// Partitioning as it appears in the operator configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Partitioning {
    #[default]
    Shuffle,
    Fields {
        positions: Vec<usize>,
    },
    Broadcast,
}

impl Partitioning {
    /// Builds the selector, rejecting invalid settings at build time.
    pub fn selector(&self) -> Result<Arc<dyn ChannelSelector>> {
        Ok(match self {
            Partitioning::Shuffle => Arc::new(Shuffle),
            Partitioning::Fields { positions } => Arc::new(Fields::new(positions.clone())?),
            Partitioning::Broadcast => Arc::new(Broadcast),
        })
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::message::RecordId;

    fn record(seq: u64, fields: Vec<Value>) -> Record {
        Record::new(RecordId::new("test", seq), fields).unwrap()
    }

    #[test]
    fn test_shuffle_spreads_load() {
        let selector = Shuffle;
        let channels = 4;
        let iterations = 40_000;
        let mut counts = vec![0usize; channels];
        let r = record(1, vec![Value::from("same")]);

        for _ in 0..iterations {
            let selected = selector.select_channels(&r, channels);
            assert_eq!(selected.len(), 1);
            counts[selected[0]] += 1;
        }

        let expected = iterations / channels;
        for count in counts {
            // ~10 standard deviations of headroom, this should never flake
            assert!(
                count.abs_diff(expected) < expected / 10,
                "count {count} too far from {expected}"
            );
        }
    }

    #[test]
    fn test_fields_is_deterministic() {
        let selector = Fields::new(vec![0, 2]).unwrap();
        for channels in 1..16 {
            for key in 0..50i64 {
                // different ids and a different non-key field, same key fields
                let r1 = record(1, vec![Value::from(key), Value::from("a"), Value::from("k")]);
                let r2 = record(2, vec![Value::from(key), Value::from("b"), Value::from("k")]);
                assert_eq!(
                    selector.select_channels(&r1, channels),
                    selector.select_channels(&r2, channels)
                );
            }
        }
    }

    #[test]
    fn test_fields_uses_a_stable_hash() {
        // the channel must not depend on process state, recompute with a fresh selector
        let r = record(1, vec![Value::from("user-17")]);
        let first = Fields::new(vec![0]).unwrap().select_channels(&r, 8);
        let second = Fields::new(vec![0]).unwrap().select_channels(&r, 8);
        assert_eq!(first, second);
    }

    #[test]
    fn test_fields_spreads_distinct_keys() {
        let selector = Fields::new(vec![0]).unwrap();
        let mut seen = std::collections::HashSet::new();
        for key in 0..200i64 {
            seen.extend(selector.select_channels(&record(1, vec![Value::from(key)]), 4));
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_fields_missing_field_selects_nothing() {
        let selector = Fields::new(vec![3]).unwrap();
        assert!(selector.select_channels(&record(1, vec![Value::from(1i64)]), 4).is_empty());
    }

    #[test]
    fn test_fields_requires_positions() {
        assert!(matches!(Fields::new(vec![]), Err(Error::Config(_))));
    }

    #[test]
    fn test_broadcast_selects_all() {
        let r = record(1, vec![Value::from(1i64)]);
        assert_eq!(Broadcast.select_channels(&r, 3), vec![0, 1, 2]);
    }

    #[test]
    fn test_single_channel_always_selects_zero() {
        let r = record(1, vec![Value::from("x")]);
        let selectors: Vec<Arc<dyn ChannelSelector>> = vec![
            Arc::new(Shuffle),
            Arc::new(Fields::new(vec![0]).unwrap()),
            Arc::new(Broadcast),
        ];
        for selector in selectors {
            for _ in 0..20 {
                assert_eq!(selector.select_channels(&r, 1), vec![0], "{selector:?}");
            }
        }
    }

    #[test]
    fn test_partitioning_from_config() {
        let p: Partitioning =
            serde_json::from_str(r#"{"type":"fields","positions":[1]}"#).unwrap();
        assert_eq!(p, Partitioning::Fields { positions: vec![1] });
        assert!(p.selector().is_ok());

        let p: Partitioning = serde_json::from_str(r#"{"type":"broadcast"}"#).unwrap();
        assert_eq!(p, Partitioning::Broadcast);

        let p = Partitioning::Fields { positions: vec![] };
        assert!(p.selector().is_err());
    }
}
