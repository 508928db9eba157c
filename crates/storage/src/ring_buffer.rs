//! Bounded append-only buffer with monotonic sequence numbers.
//!
//! Sequence numbers start at 1 and are never reused: the entry at index `i` of a
//! buffer holding `len` entries has sequence `total_added - len + 1 + i`. A
//! "position" is a value of `total_added`, so "entries added since position p"
//! are exactly the entries with sequence `> p`.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    entries: VecDeque<T>,
    added_at: VecDeque<DateTime<Utc>>,
    capacity: usize,
    total_added: u64,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            added_at: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            total_added: 0,
        }
    }

    pub fn push(&mut self, item: T) {
        self.push_at(item, Utc::now());
    }

    /// Appends `item`, evicting the oldest entry when full. Never fails.
    pub fn push_at(&mut self, item: T, at: DateTime<Utc>) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.added_at.pop_front();
        }
        self.entries.push_back(item);
        self.added_at.push_back(at);
        self.total_added += 1;
    }

    /// Changes the capacity, evicting oldest entries that no longer fit.
    /// Returns how many entries were evicted.
    pub fn set_capacity(&mut self, capacity: usize) -> usize {
        self.capacity = capacity.max(1);
        let mut evicted = 0;
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
            self.added_at.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Drops all retained entries. `total_added` is preserved so positions
    /// recorded before the clear stay meaningful.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        self.added_at.clear();
        n
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_added(&self) -> u64 {
        self.total_added
    }

    /// Sequence of the oldest retained entry, or `total_added + 1` when empty.
    pub fn oldest_sequence(&self) -> u64 {
        self.total_added - self.entries.len() as u64 + 1
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.entries.back()
    }

    pub fn newest_added_at(&self) -> Option<DateTime<Utc>> {
        self.added_at.back().copied()
    }

    /// Position (a `total_added` value) covering every retained entry added at or
    /// before `t`. Entries evicted before the search window are counted as covered.
    pub fn position_at_time(&self, t: DateTime<Utc>) -> u64 {
        let idx = self.added_at.partition_point(|at| *at <= t);
        self.total_added - (self.entries.len() - idx) as u64
    }

    pub fn snapshot(&self) -> BufferSnapshot<T> {
        BufferSnapshot {
            entries: self.entries.iter().cloned().collect(),
            added_at: self.added_at.iter().copied().collect(),
            total_added: self.total_added,
        }
    }

    /// Retained entries with a sequence greater than `position`.
    pub fn since_position(&self, position: u64) -> Vec<T> {
        let oldest = self.oldest_sequence();
        let skip = position.saturating_add(1).saturating_sub(oldest) as usize;
        self.entries.iter().skip(skip).cloned().collect()
    }
}

/// Point-in-time copy of a [`RingBuffer`], safe to iterate without holding a lock.
#[derive(Debug, Clone)]
pub struct BufferSnapshot<T> {
    pub entries: Vec<T>,
    pub added_at: Vec<DateTime<Utc>>,
    pub total_added: u64,
}

impl<T> BufferSnapshot<T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn oldest_sequence(&self) -> u64 {
        self.total_added - self.entries.len() as u64 + 1
    }

    pub fn sequence_of(&self, index: usize) -> u64 {
        self.oldest_sequence() + index as u64
    }

    /// `(sequence, added_at, entry)` in insertion order.
    pub fn sequenced(&self) -> impl DoubleEndedIterator<Item = (u64, DateTime<Utc>, &T)> + '_ {
        let base = self.oldest_sequence();
        self.entries
            .iter()
            .zip(self.added_at.iter())
            .enumerate()
            .map(move |(i, (entry, at))| (base + i as u64, *at, entry))
    }
}
