//! Record is the unit of data that flows from an operator to its downstream channels. Every record
//! carries a [RecordId] assigned exactly once by the producing operator, which makes the record
//! individually trackable by the [crate::buffer] until every destination has acknowledged it.
//! A redelivered record keeps its original [RecordId].
//!
//! NOTE: [Record] is cheap to clone; the fields are shared, never copied. An operator that wants
//! to reuse storage must build a new record, the buffer may still hold the emitted one.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

/// Unique identifier of a record within a run. It is a pair of the producing task's identity
/// and that task's monotonically increasing sequence number, so producers never coordinate.
/// It is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    pub(crate) producer: Arc<str>,
    pub(crate) sequence: u64,
}

impl RecordId {
    pub fn new(producer: impl Into<Arc<str>>, sequence: u64) -> Self {
        Self {
            producer: producer.into(),
            sequence,
        }
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.producer, self.sequence)
    }
}

/// Hands out [RecordId]s for one producing task. Each operator owns exactly one generator, it is
/// never shared between tasks.
#[derive(Debug)]
pub struct RecordIdGenerator {
    producer: Arc<str>,
    next_sequence: u64,
}

impl RecordIdGenerator {
    pub fn new(producer: impl Into<Arc<str>>) -> Self {
        Self {
            producer: producer.into(),
            next_sequence: 1,
        }
    }

    /// Returns a fresh id. Sequence numbers are never reused within a run.
    pub fn next_id(&mut self) -> RecordId {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        RecordId {
            producer: Arc::clone(&self.producer),
            sequence,
        }
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }
}

/// A typed field value of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(#[serde(with = "float_repr")] f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// JSON has no NaN or infinity, those are written as strings.
mod float_repr {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub(super) fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if v.is_nan() {
            serializer.serialize_str("NaN")
        } else if v.is_infinite() {
            serializer.serialize_str(if v.is_sign_positive() { "inf" } else { "-inf" })
        } else {
            serializer.serialize_f64(*v)
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(v) => Ok(v),
            Repr::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid float {other:?}"))),
            },
        }
    }
}

/// The record that is passed from an operator to its downstream channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: RecordId,
    fields: Arc<[Value]>,
}

impl Record {
    /// Creates a record. A record carries at least one field.
    pub fn new(id: RecordId, fields: Vec<Value>) -> Result<Self> {
        if fields.is_empty() {
            return Err(Error::Operator(format!("record {id} has no fields")));
        }
        Ok(Self {
            id,
            fields: fields.into(),
        })
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn field(&self, position: usize) -> Option<&Value> {
        self.fields.get(position)
    }
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_record_id_display() {
        let id = RecordId::new("map-0", 7);
        assert_eq!(format!("{}", id), "map-0-7");
        assert_eq!(id.producer(), "map-0");
        assert_eq!(id.sequence(), 7);
    }

    #[test]
    fn test_record_id_ordering() {
        assert!(RecordId::new("a", 2) < RecordId::new("a", 10));
        assert!(RecordId::new("a", 10) < RecordId::new("b", 1));
        assert_eq!(RecordId::new("a", 1), RecordId::new("a", 1));
    }

    #[test]
    fn test_generator_ids_are_unique_and_monotonic() {
        let mut generator = RecordIdGenerator::new("source-0");
        let ids: Vec<RecordId> = (0..1000).map(|_| generator.next_id()).collect();

        let unique: HashSet<&RecordId> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids.iter().all(|id| id.producer() == "source-0"));
    }

    #[test]
    fn test_generators_of_different_tasks_do_not_collide() {
        let mut first = RecordIdGenerator::new("map-0");
        let mut second = RecordIdGenerator::new("map-1");
        let a = first.next_id();
        let b = second.next_id();
        assert_eq!(a.sequence(), b.sequence());
        assert_ne!(a, b);
    }

    #[test]
    fn test_record_requires_fields() {
        let id = RecordId::new("t", 1);
        assert!(Record::new(id.clone(), vec![]).is_err());

        let record = Record::new(id, vec![Value::from("word"), Value::from(3i64)]).unwrap();
        assert_eq!(record.fields().len(), 2);
        assert_eq!(record.field(0), Some(&Value::Str("word".to_string())));
        assert_eq!(record.field(5), None);
    }

    #[test]
    fn test_clone_shares_fields() {
        let record = Record::new(RecordId::new("t", 1), vec![Value::from(1i64)]).unwrap();
        let copy = record.clone();
        assert!(std::ptr::eq(record.fields(), copy.fields()));
    }
}
