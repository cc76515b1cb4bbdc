//! User operator roles. An operator is a [Source] that manufactures records, a [Task] that turns
//! each input record into zero or more output records, or a [Sink] that only consumes. All of
//! them emit through an [Emitter], the runtime hands the emitted records to the collector.
//!
//! [Source]: SourceOperator
//! [Task]: TaskOperator
//! [Sink]: SinkOperator

use crate::Result;
use crate::message::{Record, RecordIdGenerator, Value};

/// Error returned by user logic. Any such error fails the operator.
pub type OperatorError = Box<dyn std::error::Error + Send + Sync>;

/// Whether a source has more to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Continue,
    Done,
}

pub trait SourceOperator: Send {
    /// Emits the next records. Called until it returns [SourceState::Done] or the operator is
    /// stopped.
    fn produce(&mut self, emitter: &mut Emitter) -> std::result::Result<SourceState, OperatorError>;
}

pub trait TaskOperator: Send {
    fn process(
        &mut self,
        input: &Record,
        emitter: &mut Emitter,
    ) -> std::result::Result<(), OperatorError>;

    /// Called once after the input is exhausted, before the operator closes.
    fn finish(&mut self, _emitter: &mut Emitter) -> std::result::Result<(), OperatorError> {
        Ok(())
    }
}

pub trait SinkOperator: Send {
    fn consume(&mut self, input: &Record) -> std::result::Result<(), OperatorError>;
}

/// An operator together with its role.
pub enum Operator {
    Source(Box<dyn SourceOperator>),
    Task(Box<dyn TaskOperator>),
    Sink(Box<dyn SinkOperator>),
}

impl Operator {
    pub fn role(&self) -> &'static str {
        match self {
            Operator::Source(_) => "source",
            Operator::Task(_) => "task",
            Operator::Sink(_) => "sink",
        }
    }
}

/// Emission side of an operator. It owns the id generator of the task, so every record built
/// here gets an id that was never handed out before.
#[derive(Debug)]
pub struct Emitter {
    ids: RecordIdGenerator,
    emitted: Vec<Record>,
}

impl Emitter {
    pub fn new(ids: RecordIdGenerator) -> Self {
        Self {
            ids,
            emitted: Vec::new(),
        }
    }

    /// Builds a record with a fresh id. It is not emitted until passed to [Emitter::emit].
    pub fn new_record(&mut self, fields: Vec<Value>) -> Result<Record> {
        Record::new(self.ids.next_id(), fields)
    }

    /// Emits a record. Ownership moves to the collector.
    pub fn emit(&mut self, record: Record) {
        self.emitted.push(record);
    }

    /// Builds and emits a record in one step.
    pub fn emit_fields(&mut self, fields: Vec<Value>) -> Result<()> {
        let record = self.new_record(fields)?;
        self.emit(record);
        Ok(())
    }

    pub fn producer(&self) -> &str {
        self.ids.producer()
    }

    /// Records emitted since the last call, in emission order.
    pub(crate) fn take(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Splitter;

    impl TaskOperator for Splitter {
        fn process(
            &mut self,
            input: &Record,
            emitter: &mut Emitter,
        ) -> std::result::Result<(), OperatorError> {
            let Some(Value::Str(line)) = input.field(0) else {
                return Err("expected a string field".into());
            };
            for word in line.split_whitespace() {
                emitter.emit_fields(vec![Value::from(word)])?;
            }
            Ok(())
        }
    }

    #[test]
    fn test_emitter_assigns_fresh_ids() {
        let mut emitter = Emitter::new(RecordIdGenerator::new("split-0"));
        let input = Record::new(
            crate::message::RecordId::new("source-0", 1),
            vec![Value::from("a b c")],
        )
        .unwrap();

        let mut splitter = Splitter;
        splitter.process(&input, &mut emitter).unwrap();
        let out = emitter.take();
        assert_eq!(out.len(), 3);
        let sequences: Vec<u64> = out.iter().map(|r| r.id().sequence()).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert!(out.iter().all(|r| r.id().producer() == "split-0"));
        assert!(emitter.take().is_empty());

        splitter.process(&input, &mut emitter).unwrap();
        assert_eq!(emitter.take().first().map(|r| r.id().sequence()), Some(4));
    }

    #[test]
    fn test_user_errors_surface() {
        let mut emitter = Emitter::new(RecordIdGenerator::new("split-0"));
        let input =
            Record::new(crate::message::RecordId::new("source-0", 1), vec![Value::from(1i64)])
                .unwrap();
        assert!(Splitter.process(&input, &mut emitter).is_err());
    }

    #[test]
    fn test_new_record_is_not_emitted_implicitly() {
        let mut emitter = Emitter::new(RecordIdGenerator::new("gen-0"));
        let record = emitter.new_record(vec![Value::Null]).unwrap();
        assert!(emitter.take().is_empty());
        emitter.emit(record.clone());
        assert_eq!(emitter.take(), vec![record]);
        assert!(emitter.new_record(vec![]).is_err());
    }
}
