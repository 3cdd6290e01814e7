//! Insertion-ordered map used for every pending queue in a cache.
//!
//! A [`KeyedQueue`] stores one value per key and remembers the order in which
//! keys first arrived. Replacing the value of a queued key keeps its position,
//! so a record can be mutated while it waits for a flush without moving to
//! the tail or appearing twice. Values live in a hash map keyed by identity;
//! order lives in a separate sequence-number index.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// A queued value plus its arrival sequence number.
#[derive(Debug, Clone)]
struct Slot<V> {
    seq: u64,
    value: V,
}

/// Duplicate-free FIFO of `(key, value)` pairs with O(1) lookup by key.
#[derive(Debug, Clone)]
pub struct KeyedQueue<K, V> {
    /// Next sequence number to hand out.
    next_seq: u64,
    /// Arrival order: sequence number -> key.
    order: BTreeMap<u64, K>,
    /// Current values: key -> slot.
    entries: HashMap<K, Slot<V>>,
}

impl<K, V> Default for KeyedQueue<K, V> {
    fn default() -> Self {
        Self {
            next_seq: 0,
            order: BTreeMap::new(),
            entries: HashMap::new(),
        }
    }
}

impl<K, V> KeyedQueue<K, V>
where
    K: Copy + Eq + Hash,
    V: Clone,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is queued.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Current value queued for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Queue `value` under `key`.
    ///
    /// A new key goes to the tail. An already-queued key keeps its position
    /// and has its value overwritten; the previous value is returned.
    pub fn upsert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(slot) = self.entries.get_mut(&key) {
            return Some(std::mem::replace(&mut slot.value, value));
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.order.insert(seq, key);
        self.entries.insert(key, Slot { seq, value });
        None
    }

    /// Overwrite the value of an already-queued key in place.
    ///
    /// Returns `false` (and stores nothing) if `key` is not queued.
    pub fn replace(&mut self, key: &K, value: V) -> bool {
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.value = value;
                true
            }
            None => false,
        }
    }

    /// Remove `key` and return its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot.value)
    }

    /// Copy of the first `limit` entries in arrival order.
    pub fn front(&self, limit: usize) -> Vec<(K, V)> {
        self.order
            .values()
            .take(limit)
            .filter_map(|key| self.entries.get(key).map(|slot| (*key, slot.value.clone())))
            .collect()
    }

    /// Remove every entry for which `keep` returns `false`.
    ///
    /// Returns the number of entries removed.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) -> usize {
        let before = self.entries.len();
        let order = &mut self.order;
        self.entries.retain(|key, slot| {
            let kept = keep(key, &slot.value);
            if !kept {
                order.remove(&slot.seq);
            }
            kept
        });
        before.saturating_sub(self.entries.len())
    }

    /// Iterate over entries in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order
            .values()
            .filter_map(|key| self.entries.get(key).map(|slot| (key, &slot.value)))
    }
}
