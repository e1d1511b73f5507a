//! Deep-copy snapshots of the live keyspace, taken and applied inside the
//! executor so they always observe a consistent state.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::rdb::{EntryData, SnapshotEntry};

use super::*;

impl DbState {
    /// Copy every live entry into a typed record with its absolute expiry.
    /// Past-due keys are purged first so they never reach a snapshot or a
    /// rewritten log. The result is sorted by key for reproducible output.
    pub(super) fn snapshot_entries(&mut self) -> Vec<SnapshotEntry> {
        let now = now_ms();
        self.purge_expired(now);

        let mut entries = Vec::with_capacity(self.cache.len());
        {
            let side = self.side.borrow();
            self.cache.for_each(&mut |key, value| {
                let expire_at_ms = match side.ttl.get(key) {
                    Some(&at) if at <= now => return true,
                    Some(&at) => at,
                    None => 0,
                };
                let data = match value {
                    Value::Str(b) => EntryData::Str(b.clone()),
                    Value::List(items) => EntryData::List(items.iter().cloned().collect()),
                    Value::Hash(fields) => EntryData::Hash(
                        fields.iter().map(|(f, v)| (f.clone(), v.clone())).collect(),
                    ),
                    Value::Set(members) => {
                        EntryData::Set(members.iter().cloned().collect())
                    }
                };
                entries.push(SnapshotEntry {
                    key: key.to_vec(),
                    expire_at_ms,
                    data,
                });
                true
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Replace the whole keyspace with `entries`, skipping anything whose
    /// absolute expiry has already passed.
    pub(super) fn apply_snapshot(&mut self, entries: Vec<SnapshotEntry>) {
        self.cache.clear();
        self.side.borrow_mut().ttl.clear();

        let now = now_ms();
        for entry in entries {
            if entry.expire_at_ms > 0 && entry.expire_at_ms <= now {
                continue;
            }
            let value = match entry.data {
                EntryData::Str(b) => Value::Str(b),
                EntryData::List(items) => Value::List(VecDeque::from(items)),
                EntryData::Hash(fields) => {
                    Value::Hash(fields.into_iter().collect::<HashMap<_, _>>())
                }
                EntryData::Set(members) => {
                    Value::Set(members.into_iter().collect::<HashSet<_>>())
                }
            };
            self.cache.add(&entry.key, value, 0);
            if entry.expire_at_ms > 0 {
                self.side
                    .borrow_mut()
                    .ttl
                    .insert(entry.key.clone(), entry.expire_at_ms);
            }
        }
    }

    /// Drop every key whose TTL is past due.
    pub(super) fn purge_expired(&mut self, now: i64) {
        let due: Vec<Vec<u8>> = self
            .side
            .borrow()
            .ttl
            .iter()
            .filter(|(_, &at)| at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            self.cache.remove_expired(&key);
        }
    }
}
