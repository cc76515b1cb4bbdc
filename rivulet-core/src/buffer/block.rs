//! Block structured payload store. Entries are appended to the open block; once it holds
//! `block_size` entries it is sealed and a new block with the next id is opened. A sealed block
//! is dropped as soon as its last live entry is released.

use std::collections::BTreeMap;

use crate::buffer::index::Location;

#[derive(Debug)]
struct Block<T> {
    entries: Vec<Option<T>>,
    live: usize,
}

impl<T> Block<T> {
    fn new(block_size: usize) -> Self {
        Block {
            entries: Vec::with_capacity(block_size),
            live: 0,
        }
    }
}

#[derive(Debug)]
pub(crate) struct BlockStore<T> {
    block_size: usize,
    blocks: BTreeMap<u64, Block<T>>,
    open_block: u64,
    live: usize,
}

impl<T> BlockStore<T> {
    pub(crate) fn new(block_size: usize) -> Self {
        BlockStore {
            block_size: block_size.max(1),
            blocks: BTreeMap::new(),
            open_block: 0,
            live: 0,
        }
    }

    pub(crate) fn append(&mut self, item: T) -> Location {
        let open_full = self
            .blocks
            .get(&self.open_block)
            .is_some_and(|block| block.entries.len() >= self.block_size);
        if open_full {
            // seal the open block
            if self
                .blocks
                .get(&self.open_block)
                .is_some_and(|block| block.live == 0)
            {
                self.blocks.remove(&self.open_block);
            }
            self.open_block += 1;
        }

        let block_size = self.block_size;
        let block = self
            .blocks
            .entry(self.open_block)
            .or_insert_with(|| Block::new(block_size));
        let entry_id = block.entries.len();
        block.entries.push(Some(item));
        block.live += 1;
        self.live += 1;

        Location {
            block_id: self.open_block,
            entry_id,
        }
    }

    pub(crate) fn get(&self, location: Location) -> Option<&T> {
        self.blocks
            .get(&location.block_id)?
            .entries
            .get(location.entry_id)?
            .as_ref()
    }

    pub(crate) fn get_mut(&mut self, location: Location) -> Option<&mut T> {
        self.blocks
            .get_mut(&location.block_id)?
            .entries
            .get_mut(location.entry_id)?
            .as_mut()
    }

    /// Takes the entry out of its slot, `None` if the slot was already released.
    pub(crate) fn release(&mut self, location: Location) -> Option<T> {
        let block = self.blocks.get_mut(&location.block_id)?;
        let item = block.entries.get_mut(location.entry_id)?.take()?;
        block.live -= 1;
        self.live -= 1;

        if block.live == 0 && location.block_id != self.open_block {
            self.blocks.remove(&location.block_id);
        }
        Some(item)
    }

    /// Number of entries not yet released.
    pub(crate) fn live(&self) -> usize {
        self.live
    }

    #[cfg(test)]
    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_fills_blocks_in_order() {
        let mut store = BlockStore::new(2);
        let locations: Vec<Location> = (0..5).map(|i| store.append(i)).collect();
        assert_eq!(
            locations,
            vec![
                Location { block_id: 0, entry_id: 0 },
                Location { block_id: 0, entry_id: 1 },
                Location { block_id: 1, entry_id: 0 },
                Location { block_id: 1, entry_id: 1 },
                Location { block_id: 2, entry_id: 0 },
            ]
        );
        assert_eq!(store.live(), 5);
        assert_eq!(store.block_count(), 3);
        assert_eq!(store.get(Location { block_id: 1, entry_id: 1 }), Some(&3));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut store = BlockStore::new(4);
        let location = store.append("a");
        assert_eq!(store.release(location), Some("a"));
        assert_eq!(store.release(location), None);
        assert_eq!(store.get(location), None);
        assert_eq!(store.live(), 0);
    }

    #[test]
    fn test_sealed_empty_block_is_dropped() {
        let mut store = BlockStore::new(2);
        let first = store.append(1);
        let second = store.append(2);
        let third = store.append(3);
        assert_eq!(store.block_count(), 2);

        store.release(first);
        assert_eq!(store.block_count(), 2);
        store.release(second);
        // block 0 is sealed and empty
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.get(third), Some(&3));
    }

    #[test]
    fn test_open_block_survives_until_sealed() {
        let mut store = BlockStore::new(2);
        let first = store.append(1);
        store.release(first);
        assert_eq!(store.block_count(), 1);

        let second = store.append(2);
        assert_eq!(second, Location { block_id: 0, entry_id: 1 });
        store.release(second);

        // block 0 is full with no live entry, the next append seals and drops it
        let third = store.append(3);
        assert_eq!(third.block_id, 1);
        assert_eq!(store.block_count(), 1);
    }

    #[test]
    fn test_get_mut() {
        let mut store = BlockStore::new(2);
        let location = store.append(vec![1]);
        if let Some(v) = store.get_mut(location) {
            v.push(2);
        }
        assert_eq!(store.get(location), Some(&vec![1, 2]));
    }
}
