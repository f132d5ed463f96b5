//! State Buffer
//!
//! Bounded, time-ordered history of received snapshots for one remote
//! entity. Timestamps never decrease; the oldest entry is evicted when full.

use std::collections::VecDeque;

use crate::core::clock::Millis;
use super::state::EntityState;

/// One buffered snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct BufferedState {
    /// Reconstructed full snapshot.
    pub state: EntityState,
    /// Buffer timestamp (ms), non-decreasing across the buffer.
    pub timestamp: Millis,
}

/// Entries either side of a target time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Bracket<'a> {
    /// Buffer is empty.
    Empty,
    /// Only one usable entry (single-entry buffer, or target outside the range).
    Single(&'a BufferedState),
    /// `from.timestamp <= target`, `to` is the entry right after `from`.
    Pair {
        /// Newest entry at or before the target.
        from: &'a BufferedState,
        /// Entry immediately after `from`.
        to: &'a BufferedState,
    },
}

/// Fixed-capacity snapshot history.
#[derive(Clone, Debug)]
pub struct StateBuffer {
    capacity: usize,
    entries: VecDeque<BufferedState>,
}

impl StateBuffer {
    /// Create a buffer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a snapshot. A timestamp older than the newest entry is
    /// clamped up to it. Returns the evicted entry, if any.
    pub fn push(&mut self, state: EntityState, timestamp: Millis) -> Option<BufferedState> {
        let timestamp = match self.entries.back() {
            Some(last) if timestamp < last.timestamp => last.timestamp,
            _ => timestamp,
        };

        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(BufferedState { state, timestamp });
        evicted
    }

    /// Newest entry.
    pub fn latest(&self) -> Option<&BufferedState> {
        self.entries.back()
    }

    /// Oldest entry.
    pub fn oldest(&self) -> Option<&BufferedState> {
        self.entries.front()
    }

    /// Find the entries straddling `target`.
    pub fn bracket(&self, target: Millis) -> Bracket<'_> {
        if self.entries.is_empty() {
            return Bracket::Empty;
        }

        // First index with timestamp > target.
        let idx = self.entries.partition_point(|e| e.timestamp <= target);

        if idx == 0 {
            // Before everything buffered: earliest entry, no extrapolation.
            Bracket::Single(&self.entries[0])
        } else if idx == self.entries.len() {
            Bracket::Single(&self.entries[idx - 1])
        } else {
            Bracket::Pair {
                from: &self.entries[idx - 1],
                to: &self.entries[idx],
            }
        }
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &BufferedState> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
