//! Compute-once-per-key memoization shared between threads.
//!
//! The map from key to slot is the single mutation point: the first caller
//! for a key inserts the slot and computes the value, and concurrent callers
//! for the same key wait on that slot instead of computing again.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::{Arc, OnceLock};

pub struct Memo<K, V> {
    slots: DashMap<K, Arc<OnceLock<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for Memo<K, V> {
    fn default() -> Self {
        Memo {
            slots: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Memo<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, computing it with `f` if no one has.
    /// The bool is true when this call ran `f`.
    pub fn get_or_compute(&self, key: &K, f: impl FnOnce() -> V) -> (V, bool) {
        let slot = match self.slots.get(key) {
            Some(slot) => slot.clone(),
            None => self.slots.entry(key.clone()).or_default().clone(),
        };
        // The shard lock is released above; only the slot is waited on.
        let mut computed = false;
        let value = slot.get_or_init(|| {
            computed = true;
            f()
        });
        (value.clone(), computed)
    }

    /// The value for `key` if it has finished computing.
    pub fn get(&self, key: &K) -> Option<V> {
        self.slots.get(key).and_then(|slot| slot.get().cloned())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    /// Drops the entry so the next caller computes afresh.  Callers waiting on
    /// the old slot still see its value.
    pub fn forget(&self, key: &K) {
        self.slots.remove(key);
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
