//! Bounded, time-limited id memory.
//!
//! Backs decision archival, exactly-once outcome recording, and exactly-once
//! usage charging. Entries are forgotten after the retention window or when
//! the entry cap is reached (oldest first), whichever comes first.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::hash::Hash;

use crate::clock::UnixMillis;

/// Sharded map whose entries expire after `retention_ms` and whose size is
/// capped at `max_entries`.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug)]
pub struct RetentionMap<K, V>
where
    K: Eq + Hash + Clone,
{
    entries: DashMap<K, V>,
    order: Mutex<VecDeque<(K, UnixMillis)>>,
    retention_ms: u64,
    max_entries: usize,
}

impl<K, V> RetentionMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty map. A `max_entries` of zero is treated as one.
    pub fn new(retention_ms: u64, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            retention_ms,
            max_entries: max_entries.max(1),
        }
    }

    /// Insert `value` under `key` unless the key is already remembered.
    ///
    /// Returns `Ok(())` on insertion, or `Err(existing)` with the value
    /// already stored.
    pub fn insert_if_absent(&self, key: K, value: V, now: UnixMillis) -> Result<(), V> {
        self.purge(now);
        match self.entries.entry(key.clone()) {
            Entry::Occupied(e) => return Err(e.get().clone()),
            Entry::Vacant(e) => {
                e.insert(value);
            }
        }
        // Shard guard is released; the order lock is never taken while one is held.
        let mut order = self.order.lock();
        order.push_back((key, now));
        while order.len() > self.max_entries {
            if let Some((old, _)) = order.pop_front() {
                self.entries.remove(&old);
            }
        }
        Ok(())
    }

    /// Value stored under `key`, if still remembered.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Return `true` if `key` is remembered.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Forget `key` early.
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.entries.remove(key).map(|(_, v)| v);
        if removed.is_some() {
            self.order.lock().retain(|(k, _)| k != key);
        }
        removed
    }

    /// Drop entries older than the retention window.
    pub fn purge(&self, now: UnixMillis) {
        let mut order = self.order.lock();
        while let Some((key, at)) = order.front() {
            if now.saturating_sub(*at) <= self.retention_ms {
                break;
            }
            self.entries.remove(key);
            order.pop_front();
        }
    }

    /// Remembered entry count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_if_absent_rejects_duplicate() {
        let map: RetentionMap<String, u32> = RetentionMap::new(1_000, 10);
        assert!(map.insert_if_absent("a".into(), 1, 0).is_ok());
        assert_eq!(map.insert_if_absent("a".into(), 2, 10), Err(1));
        assert_eq!(map.get(&"a".into()), Some(1));
    }

    #[test]
    fn test_entries_expire_after_retention() {
        let map: RetentionMap<String, ()> = RetentionMap::new(1_000, 10);
        map.insert_if_absent("a".into(), (), 0).unwrap();
        map.purge(1_000);
        assert!(map.contains(&"a".into()));
        map.purge(1_001);
        assert!(!map.contains(&"a".into()));
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let map: RetentionMap<u32, ()> = RetentionMap::new(u64::MAX, 2);
        for k in 0..3 {
            map.insert_if_absent(k, (), 0).unwrap();
        }
        assert_eq!(map.len(), 2);
        assert!(!map.contains(&0));
        assert!(map.contains(&2));
    }

    #[test]
    fn test_remove_forgets_key() {
        let map: RetentionMap<u32, ()> = RetentionMap::new(1_000, 10);
        map.insert_if_absent(1, (), 0).unwrap();
        map.remove(&1);
        assert!(map.insert_if_absent(1, (), 0).is_ok());
    }
}
