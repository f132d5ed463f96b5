//! Time-to-live set.
//!
//! Remembers keys for a fixed window. Eviction is explicit and driven by the
//! caller's notion of "now", so the policy can be tested without timers.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use super::clock::Millis;

/// Set whose entries expire `ttl_ms` after insertion.
#[derive(Debug, Clone)]
pub struct TtlSet<K> {
    ttl_ms: Millis,
    /// Key -> expiry.
    entries: HashMap<K, Millis>,
    /// Insertion order, for cheap front eviction.
    order: VecDeque<(Millis, K)>,
}

impl<K: Eq + Hash + Clone> TtlSet<K> {
    /// Create an empty set with the given window.
    pub fn new(ttl_ms: Millis) -> Self {
        Self {
            ttl_ms,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Window length.
    pub fn ttl_ms(&self) -> Millis {
        self.ttl_ms
    }

    /// Insert (or refresh) a key at time `now`.
    pub fn insert(&mut self, key: K, now: Millis) {
        self.purge_expired(now);
        let expires_at = now.saturating_add(self.ttl_ms);
        self.entries.insert(key.clone(), expires_at);
        self.order.push_back((expires_at, key));
    }

    /// True if `key` was inserted less than `ttl_ms` before `now`.
    pub fn contains(&self, key: &K, now: Millis) -> bool {
        matches!(self.entries.get(key), Some(&expires_at) if now < expires_at)
    }

    /// Drop every entry whose window has elapsed. Returns how many were evicted.
    pub fn purge_expired(&mut self, now: Millis) -> usize {
        let mut evicted = 0;
        while let Some((expires_at, _)) = self.order.front() {
            if *expires_at > now {
                break;
            }
            if let Some((expires_at, key)) = self.order.pop_front() {
                // A refreshed key has a later expiry in `entries`; keep it.
                if self.entries.get(&key) == Some(&expires_at) {
                    self.entries.remove(&key);
                    evicted += 1;
                }
            }
        }
        evicted
    }

    /// Number of tracked keys (including any not yet purged).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
