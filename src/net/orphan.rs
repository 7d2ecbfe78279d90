//! The orphan queue: transactions whose parents (or sender keys) have not
//! arrived yet.

use std::collections::VecDeque;

use crate::constants;
use crate::crypto::keys::Signature;
use crate::transaction::Transaction;

use super::bus::PeerId;

/// A queued transaction together with what is needed to verify it later.
#[derive(Clone, Debug)]
pub struct OrphanEntry {
    pub transaction: Transaction,
    pub peer: PeerId,
    pub signature: Signature,
}

/// A bounded FIFO ring of orphaned transactions.
///
/// Starts at capacity [`constants::ORPHAN_QUEUE_MIN`] and doubles when full,
/// up to [`constants::ORPHAN_QUEUE_MAX`]; at the ceiling the oldest entry is
/// rotated out. After a drain leaves the ring at most half full, while still
/// holding more than the minimum, it is compacted back down. Entries have no
/// age limit: an orphan whose parents never arrive lives until rotation
/// evicts it.
pub struct OrphanQueue {
    entries: VecDeque<OrphanEntry>,
    capacity: usize,
}

impl OrphanQueue {
    pub fn new() -> Self {
        OrphanQueue {
            entries: VecDeque::with_capacity(constants::ORPHAN_QUEUE_MIN),
            capacity: constants::ORPHAN_QUEUE_MIN,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, growing the ring or rotating out the oldest entry
    /// when at the ceiling.
    pub fn push(&mut self, entry: OrphanEntry) {
        if self.entries.len() == self.capacity {
            if self.capacity < constants::ORPHAN_QUEUE_MAX {
                self.capacity = (self.capacity * 2).min(constants::ORPHAN_QUEUE_MAX);
                self.entries.reserve(self.capacity - self.entries.len());
            } else {
                let dropped = self.entries.pop_front();
                if let Some(dropped) = dropped {
                    tracing::warn!(
                        hash = %dropped.transaction.hash(),
                        "orphan queue full, rotating out oldest entry"
                    );
                }
            }
        }
        self.entries.push_back(entry);
    }

    /// Remove and return everything currently queued, FIFO. Entries that
    /// re-orphan during processing are pushed back behind any new arrivals.
    pub fn take_all(&mut self) -> Vec<OrphanEntry> {
        self.entries.drain(..).collect()
    }

    /// Compact the backing ring after a drain left it underused. The gate is
    /// on the current size: a nearly emptied ring keeps its grown capacity.
    pub fn shrink(&mut self) {
        if self.entries.len() <= self.capacity / 2
            && self.entries.len() > constants::ORPHAN_QUEUE_MIN
        {
            self.capacity = self.entries.len().next_power_of_two();
            let mut tight = VecDeque::with_capacity(self.capacity);
            tight.extend(self.entries.drain(..));
            self.entries = tight;
        }
    }
}

impl Default for OrphanQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;

    fn entry(tag: u8) -> OrphanEntry {
        OrphanEntry {
            transaction: Transaction::new(vec![crate::hash_b64(&[tag])], vec![], vec![], 1),
            peer: PeerId::random(),
            signature: Signature::empty(),
        }
    }

    #[test]
    fn starts_at_minimum_capacity() {
        let queue = OrphanQueue::new();
        assert_eq!(queue.capacity(), constants::ORPHAN_QUEUE_MIN);
        assert!(queue.is_empty());
    }

    #[test]
    fn doubles_when_full() {
        let mut queue = OrphanQueue::new();
        for i in 0..=constants::ORPHAN_QUEUE_MIN as u8 {
            queue.push(entry(i));
        }
        assert_eq!(queue.capacity(), constants::ORPHAN_QUEUE_MIN * 2);
        assert_eq!(queue.len(), constants::ORPHAN_QUEUE_MIN + 1);
    }

    #[test]
    fn rotates_at_ceiling() {
        let mut queue = OrphanQueue::new();
        for _ in 0..constants::ORPHAN_QUEUE_MAX {
            queue.push(entry(0));
        }
        assert_eq!(queue.capacity(), constants::ORPHAN_QUEUE_MAX);

        let first_evicted = queue.entries[0].transaction.hash().clone();
        queue.push(entry(1));
        assert_eq!(queue.len(), constants::ORPHAN_QUEUE_MAX);
        assert_ne!(*queue.entries[0].transaction.hash(), first_evicted);
    }

    #[test]
    fn take_all_is_fifo_and_empties() {
        let mut queue = OrphanQueue::new();
        queue.push(entry(1));
        queue.push(entry(2));
        let first_hash = queue.entries[0].transaction.hash().clone();

        let drained = queue.take_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(*drained[0].transaction.hash(), first_hash);
        assert!(queue.is_empty());
    }

    #[test]
    fn shrink_compacts_after_drain() {
        let mut queue = OrphanQueue::new();
        for i in 0..64 {
            queue.push(entry(i));
        }
        assert_eq!(queue.capacity(), 64);

        queue.take_all();
        for i in 0..12 {
            queue.push(entry(i));
        }
        queue.shrink();
        assert_eq!(queue.capacity(), 16);
        assert_eq!(queue.len(), 12);
    }

    #[test]
    fn shrink_skips_nearly_empty_queue() {
        let mut queue = OrphanQueue::new();
        for i in 0..64 {
            queue.push(entry(i));
        }
        queue.take_all();
        queue.push(entry(0));

        // At or below the minimum size the ring keeps its grown capacity.
        queue.shrink();
        assert_eq!(queue.capacity(), 64);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn shrink_never_goes_below_minimum() {
        let mut queue = OrphanQueue::new();
        queue.shrink();
        assert_eq!(queue.capacity(), constants::ORPHAN_QUEUE_MIN);
    }
}
