//! Sequence-keyed reorder buffer.

use std::collections::BTreeMap;

/// Holds early arrivals until the gap before them is filled.
///
/// Items are released strictly in sequence order starting at 0. An item
/// whose sequence was already released, or is already buffered, is
/// rejected on insert.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Buffers `item` at `seq`. Returns `false` if it was a duplicate.
    pub fn insert(&mut self, seq: u64, item: T) -> bool {
        if seq < self.next {
            return false;
        }
        match self.pending.entry(seq) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(item);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    /// Releases the next in-order item, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    /// Releases the whole contiguous run starting at the expected sequence.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(item) = self.pop_ready() {
            ready.push(item);
        }
        ready
    }

    /// The sequence the buffer is waiting for, i.e. how many items have
    /// been released so far.
    pub fn next_expected(&self) -> u64 {
        self.next
    }

    /// Number of early arrivals waiting for a gap to close.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of early arrivals with a sequence below `bound`.
    pub fn pending_below(&self, bound: u64) -> usize {
        self.pending.range(..bound).count()
    }
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}
