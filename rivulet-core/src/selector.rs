//! Output selection routes a record to a subset of named outputs, for topologies that branch into
//! several downstream paths. Each name owns a contiguous range of the operator's channels.
//!
//! The framework clears the accumulator before every call to [OutputSelector::select] and reads
//! it right after, so a selector never sees names left over from another record.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use serde::Deserialize;

use crate::Result;
use crate::error::Error;
use crate::message::Record;

/// Picks the named outputs a record is routed to.
pub trait OutputSelector: Send + Sync {
    /// Appends zero or more output names for `record` to `outputs`. Must be a pure function of
    /// the record: the same record always yields the same names.
    fn select(&self, record: &Record, outputs: &mut Vec<String>);
}

impl<F> OutputSelector for F
where
    F: Fn(&Record, &mut Vec<String>) + Send + Sync,
{
    fn select(&self, record: &Record, outputs: &mut Vec<String>) {
        self(record, outputs)
    }
}

/// A named output and the channel range it owns.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedOutput {
    pub name: String,
    /// first channel of the output
    pub start: usize,
    /// number of channels
    pub count: usize,
}

impl NamedOutput {
    pub fn new(name: impl Into<String>, start: usize, count: usize) -> Self {
        Self {
            name: name.into(),
            start,
            count,
        }
    }
}

/// Mapping from output names to their channel ranges, validated against the channel count.
#[derive(Debug, Clone)]
pub struct OutputRouting {
    ranges: HashMap<String, Range<usize>>,
}

impl OutputRouting {
    pub fn new(num_channels: usize, outputs: &[NamedOutput]) -> Result<Self> {
        if outputs.is_empty() {
            return Err(Error::Config(
                "output selection needs at least one named output".to_string(),
            ));
        }

        let mut ranges = HashMap::with_capacity(outputs.len());
        for output in outputs {
            let end = output
                .start
                .checked_add(output.count)
                .filter(|end| output.count > 0 && *end <= num_channels)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "output {} maps {} channels from {} outside [0, {num_channels})",
                        output.name, output.count, output.start
                    ))
                })?;
            if ranges
                .insert(output.name.clone(), output.start..end)
                .is_some()
            {
                return Err(Error::Config(format!(
                    "output {} is configured more than once",
                    output.name
                )));
            }
        }
        Ok(Self { ranges })
    }

    /// Channel ranges of the configured names among `names`, one per distinct name in name
    /// order. Unknown names are skipped.
    pub fn ranges<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Vec<Range<usize>> {
        names
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|name| self.ranges.get(name))
            .cloned()
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ranges.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RecordId, Value};

    fn routing() -> OutputRouting {
        OutputRouting::new(
            6,
            &[
                NamedOutput::new("a", 0, 2),
                NamedOutput::new("b", 2, 1),
                NamedOutput::new("c", 3, 3),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_ranges_of_selected_names() {
        let routing = routing();
        let names = vec!["c".to_string(), "a".to_string(), "c".to_string()];
        assert_eq!(routing.ranges(&names), vec![0..2, 3..6]);
        assert!(routing.ranges(&Vec::new()).is_empty());
    }

    #[test]
    fn test_unknown_names_are_skipped() {
        let routing = routing();
        let names = vec!["b".to_string(), "z".to_string()];
        assert_eq!(routing.ranges(&names), vec![2..3]);
        assert!(!routing.contains("z"));
    }

    #[test]
    fn test_invalid_routing_is_a_config_error() {
        assert!(matches!(
            OutputRouting::new(2, &[NamedOutput::new("a", 1, 2)]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            OutputRouting::new(2, &[NamedOutput::new("a", 0, 0)]),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            OutputRouting::new(
                4,
                &[NamedOutput::new("a", 0, 1), NamedOutput::new("a", 1, 1)]
            ),
            Err(Error::Config(_))
        ));
        assert!(matches!(OutputRouting::new(4, &[]), Err(Error::Config(_))));
        // start + count does not fit in usize
        assert!(matches!(
            OutputRouting::new(4, &[NamedOutput::new("a", usize::MAX, 1)]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_closure_selector() {
        let selector = |record: &Record, outputs: &mut Vec<String>| {
            if let Some(Value::Int(v)) = record.field(0) {
                outputs.push(if v % 2 == 0 { "even" } else { "odd" }.to_string());
            }
        };
        let record = Record::new(RecordId::new("t", 1), vec![Value::from(4i64)]).unwrap();
        let mut outputs = Vec::new();
        selector.select(&record, &mut outputs);
        assert_eq!(outputs, vec!["even".to_string()]);
    }
}
