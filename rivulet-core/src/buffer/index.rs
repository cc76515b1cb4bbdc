//! Ordered index from [RecordId] to the slot holding the record's payload. A second ordered map
//! keyed by insertion age lets the redelivery sweep find expired entries without scanning the
//! whole index.

use std::collections::BTreeMap;
use std::fmt;

use tokio::time::Instant;

use crate::message::RecordId;

/// Physical address of a buffered payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub block_id: u64,
    /// position within the block
    pub entry_id: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block_id, self.entry_id)
    }
}

/// Age key, insertion time plus a tie breaker so equal instants keep insertion order.
type AgeKey = (Instant, u64);

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    location: Location,
    age: AgeKey,
}

/// Both maps always hold the same set of ids.
#[derive(Debug, Default)]
pub struct RecordIndex {
    by_id: BTreeMap<RecordId, IndexEntry>,
    by_age: BTreeMap<AgeKey, RecordId>,
    next_tiebreak: u64,
}

impl RecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry of `id`, returning the location it replaced.
    pub fn put(&mut self, id: RecordId, location: Location, inserted_at: Instant) -> Option<Location> {
        let age = (inserted_at, self.next_tiebreak);
        self.next_tiebreak += 1;

        let previous = self.by_id.insert(id.clone(), IndexEntry { location, age });
        if let Some(previous) = previous {
            self.by_age.remove(&previous.age);
        }
        self.by_age.insert(age, id);
        previous.map(|entry| entry.location)
    }

    /// `None` for an id never inserted or already removed.
    pub fn get(&self, id: &RecordId) -> Option<Location> {
        self.by_id.get(id).map(|entry| entry.location)
    }

    pub fn inserted_at(&self, id: &RecordId) -> Option<Instant> {
        self.by_id.get(id).map(|entry| entry.age.0)
    }

    pub fn remove(&mut self, id: &RecordId) -> Option<Location> {
        let entry = self.by_id.remove(id)?;
        self.by_age.remove(&entry.age);
        Some(entry.location)
    }

    /// Up to `limit` entries inserted at or before `cutoff`, oldest first.
    pub fn entries_older_than(&self, cutoff: Instant, limit: usize) -> Vec<(RecordId, Location)> {
        self.by_age
            .range(..=(cutoff, u64::MAX))
            .take(limit)
            .filter_map(|(_, id)| self.by_id.get(id).map(|entry| (id.clone(), entry.location)))
            .collect()
    }

    /// The `n` oldest entries, oldest first.
    pub fn oldest_entries(&self, n: usize) -> Vec<(RecordId, Location)> {
        self.by_age
            .values()
            .take(n)
            .filter_map(|id| self.by_id.get(id).map(|entry| (id.clone(), entry.location)))
            .collect()
    }

    /// Removes and returns the `n` oldest entries.
    pub fn evict_oldest(&mut self, n: usize) -> Vec<(RecordId, Location)> {
        let mut evicted = Vec::with_capacity(n.min(self.len()));
        while evicted.len() < n {
            let Some((_, id)) = self.by_age.pop_first() else {
                break;
            };
            if let Some(entry) = self.by_id.remove(&id) {
                evicted.push((id, entry.location));
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
