//! Pluggable eviction caches enforcing the byte budget.
//!
//! The execution core owns exactly one of these and drives it from a single
//! thread, so neither implementation is synchronized. Removal flows through
//! one callback carrying a typed reason; the core uses it to keep the TTL
//! table consistent and to journal byte-budget evictions.
//!
//! Ordering state lives in `BTreeMap`s keyed by monotonic sequence numbers:
//! for LRU the first entry is the least recently used; for LFU the key is
//! `(frequency, sequence)`, so the first entry is the least-recent member of
//! the lowest-frequency bucket. `peek` never touches either structure.

use std::collections::{BTreeMap, HashMap};

use crate::value::Value;

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveReason {
    /// Byte-budget pressure.
    Evicted,
    /// TTL expiry (lazy or active).
    Expired,
    /// Explicit deletion (DEL, emptied container, replaced key).
    Deleted,
    /// Bulk clear (snapshot apply).
    Cleared,
}

/// Removal hook. Fires synchronously inside the mutating call, after the
/// entry has already been unlinked.
pub type OnRemove = Box<dyn FnMut(&[u8], &Value, RemoveReason)>;

/// Contract between the execution core and an eviction policy.
///
/// The `ttl` argument of `add` is reserved; the core manages expiry in its
/// own table and always passes 0.
pub trait EvictionCache {
    fn add(&mut self, key: &[u8], value: Value, ttl: i64);
    /// Promoting lookup.
    fn get(&mut self, key: &[u8]) -> Option<&Value>;
    /// Promoting lookup with in-place mutation; callers that change the
    /// value's size must follow up with `rebalance`.
    fn get_mut(&mut self, key: &[u8]) -> Option<&mut Value>;
    /// Non-promoting lookup.
    fn peek(&self, key: &[u8]) -> Option<&Value>;
    /// Remove with reason `Deleted`. Returns whether the key was present.
    fn remove(&mut self, key: &[u8]) -> bool;
    /// Remove with reason `Expired`. Returns whether the key was present.
    fn remove_expired(&mut self, key: &[u8]) -> bool;
    /// Recompute an entry's charged size after in-place mutation and evict
    /// while over budget.
    fn rebalance(&mut self, key: &[u8]);
    /// Visit entries in no particular order; stop when `f` returns false.
    fn for_each(&self, f: &mut dyn FnMut(&[u8], &Value) -> bool);
    fn len(&self) -> usize;
    /// Tracked total of charged entry sizes.
    fn used_bytes(&self) -> usize;
    /// Remove everything with reason `Cleared`.
    fn clear(&mut self);
    fn close(&mut self) {}
}

fn charged_size(key: &[u8], value: &Value) -> usize {
    key.len() + value.size_estimate()
}

// ---------------------------------------------------------------------------
// LRU
// ---------------------------------------------------------------------------

struct LruEntry {
    value: Value,
    charged: usize,
    seq: u64,
}

/// Least-recently-used eviction over a byte budget (0 = unlimited).
pub struct LruCache {
    max_bytes: usize,
    used: usize,
    seq: u64,
    entries: HashMap<Vec<u8>, LruEntry>,
    order: BTreeMap<u64, Vec<u8>>,
    on_remove: Option<OnRemove>,
}

impl LruCache {
    pub fn new(max_bytes: usize, on_remove: Option<OnRemove>) -> Self {
        Self {
            max_bytes,
            used: 0,
            seq: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            on_remove,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn touch(&mut self, key: &[u8]) {
        let next = self.next_seq();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.seq);
            entry.seq = next;
            self.order.insert(next, key.to_vec());
        }
    }

    fn remove_inner(&mut self, key: &[u8], reason: RemoveReason) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.order.remove(&entry.seq);
        self.used -= entry.charged;
        if let Some(cb) = self.on_remove.as_mut() {
            cb(key, &entry.value, reason);
        }
        true
    }

    fn evict_over_budget(&mut self) {
        while self.max_bytes != 0 && self.used > self.max_bytes {
            let Some((_, key)) = self.order.iter().next() else {
                break;
            };
            let key = key.clone();
            self.remove_inner(&key, RemoveReason::Evicted);
        }
    }
}

impl EvictionCache for LruCache {
    fn add(&mut self, key: &[u8], value: Value, _ttl: i64) {
        let charged = charged_size(key, &value);
        let next = self.next_seq();
        if let Some(entry) = self.entries.get_mut(key) {
            self.used = self.used - entry.charged + charged;
            self.order.remove(&entry.seq);
            entry.value = value;
            entry.charged = charged;
            entry.seq = next;
            self.order.insert(next, key.to_vec());
        } else {
            self.entries.insert(
                key.to_vec(),
                LruEntry {
                    value,
                    charged,
                    seq: next,
                },
            );
            self.order.insert(next, key.to_vec());
            self.used += charged;
        }
        self.evict_over_budget();
    }

    fn get(&mut self, key: &[u8]) -> Option<&Value> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| &e.value)
    }

    fn get_mut(&mut self, key: &[u8]) -> Option<&mut Value> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.entries.get_mut(key).map(|e| &mut e.value)
    }

    fn peek(&self, key: &[u8]) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        self.remove_inner(key, RemoveReason::Deleted)
    }

    fn remove_expired(&mut self, key: &[u8]) -> bool {
        self.remove_inner(key, RemoveReason::Expired)
    }

    fn rebalance(&mut self, key: &[u8]) {
        if let Some(entry) = self.entries.get_mut(key) {
            let charged = key.len() + entry.value.size_estimate();
            self.used = self.used - entry.charged + charged;
            entry.charged = charged;
        }
        self.evict_over_budget();
    }

    fn for_each(&self, f: &mut dyn FnMut(&[u8], &Value) -> bool) {
        for (key, entry) in &self.entries {
            if !f(key, &entry.value) {
                return;
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn used_bytes(&self) -> usize {
        self.used
    }

    fn clear(&mut self) {
        let keys: Vec<Vec<u8>> = self.entries.keys().cloned().collect();
        for key in keys {
            self.remove_inner(&key, RemoveReason::Cleared);
        }
    }
}

// ---------------------------------------------------------------------------
// LFU
// ---------------------------------------------------------------------------

struct LfuEntry {
    value: Value,
    charged: usize,
    freq: u64,
    seq: u64,
}

/// Least-frequently-used eviction with LRU tie-breaking inside the lowest
/// frequency bucket. New entries start at frequency 1; writes count as an
/// access.
pub struct LfuCache {
    max_bytes: usize,
    used: usize,
    seq: u64,
    entries: HashMap<Vec<u8>, LfuEntry>,
    order: BTreeMap<(u64, u64), Vec<u8>>,
    on_remove: Option<OnRemove>,
}

impl LfuCache {
    pub fn new(max_bytes: usize, on_remove: Option<OnRemove>) -> Self {
        Self {
            max_bytes,
            used: 0,
            seq: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            on_remove,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Move an entry into the next frequency bucket, most-recent position.
    fn promote(&mut self, key: &[u8]) {
        let next = self.next_seq();
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&(entry.freq, entry.seq));
            entry.freq += 1;
            entry.seq = next;
            self.order.insert((entry.freq, entry.seq), key.to_vec());
        }
    }

    fn remove_inner(&mut self, key: &[u8], reason: RemoveReason) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.order.remove(&(entry.freq, entry.seq));
        self.used -= entry.charged;
        if let Some(cb) = self.on_remove.as_mut() {
            cb(key, &entry.value, reason);
        }
        true
    }

    fn evict_over_budget(&mut self) {
        while self.max_bytes != 0 && self.used > self.max_bytes {
            let Some((_, key)) = self.order.iter().next() else {
                break;
            };
            let key = key.clone();
            self.remove_inner(&key, RemoveReason::Evicted);
        }
    }
}

impl EvictionCache for LfuCache {
    fn add(&mut self, key: &[u8], value: Value, _ttl: i64) {
        let charged = charged_size(key, &value);
        if self.entries.contains_key(key) {
            self.promote(key);
            let entry = self.entries.get_mut(key).unwrap();
            self.used = self.used - entry.charged + charged;
            entry.value = value;
            entry.charged = charged;
        } else {
            let seq = self.next_seq();
            self.entries.insert(
                key.to_vec(),
                LfuEntry {
                    value,
                    charged,
                    freq: 1,
                    seq,
                },
            );
            self.order.insert((1, seq), key.to_vec());
            self.used += charged;
        }
        self.evict_over_budget();
    }

    fn get(&mut self, key: &[u8]) -> Option<&Value> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.promote(key);
        self.entries.get(key).map(|e| &e.value)
    }

    fn get_mut(&mut self, key: &[u8]) -> Option<&mut Value> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.promote(key);
        self.entries.get_mut(key).map(|e| &mut e.value)
    }

    fn peek(&self, key: &[u8]) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        self.remove_inner(key, RemoveReason::Deleted)
    }

    fn remove_expired(&mut self, key: &[u8]) -> bool {
        self.remove_inner(key, RemoveReason::Expired)
    }

    fn rebalance(&mut self, key: &[u8]) {
        if let Some(entry) = self.entries.get_mut(key) {
            let charged = key.len() + entry.value.size_estimate();
            self.used = self.used - entry.charged + charged;
            entry.charged = charged;
        }
        self.evict_over_budget();
    }

    fn for_each(&self, f: &mut dyn FnMut(&[u8], &Value) -> bool) {
        for (key, entry) in &self.entries {
            if !f(key, &entry.value) {
                return;
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn used_bytes(&self) -> usize {
        self.used
    }

    fn clear(&mut self) {
        let keys: Vec<Vec<u8>> = self.entries.keys().cloned().collect();
        for key in keys {
            self.remove_inner(&key, RemoveReason::Cleared);
        }
    }
}
