//! Bounded, access-ordered connection pool.
//! An explicit recency-stamped map: no reliance on a map implementation
//! with eviction hooks. The owner disconnects an evicted session *before*
//! admitting the entry that displaced it.

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

struct PoolEntry<T> {
    value: T,
    stamp: u64,
}

struct PoolInner<T> {
    entries: HashMap<String, PoolEntry<T>>,
    clock: u64,
}

/// Access-ordered map from device address to a pooled value, bounded by
/// `capacity`. Every `get` and insert marks the entry most recently used.
///
/// `size <= capacity` holds after every mutation: [`ConnectionPool::insert_new`]
/// refuses to overflow, and the owner loops `evict_candidate` + release
/// until the insert is admitted.
pub(crate) struct ConnectionPool<T> {
    capacity: usize,
    inner: Mutex<PoolInner<T>>,
}

impl<T: Clone> ConnectionPool<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Looks up an entry and marks it most recently used.
    pub(crate) fn get(&self, address: &str) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.clock += 1;
        let stamp = inner.clock;
        let entry = inner.entries.get_mut(address)?;
        entry.stamp = stamp;
        Some(entry.value.clone())
    }

    /// Removes and returns the least-recently-used entry when inserting
    /// `incoming` would exceed capacity. Returns `None` when there is room
    /// (or when `incoming` is already pooled and no insert will happen).
    pub(crate) fn evict_candidate(&self, incoming: &str) -> Option<(String, T)> {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(incoming) || inner.entries.len() < self.capacity {
            return None;
        }
        let address = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.stamp)
            .map(|(address, _)| address.clone())?;
        let entry = inner.entries.remove(&address)?;
        debug!("pool: evicting least recently used session {address}");
        Some((address, entry.value))
    }

    /// Admits a new entry. Returns `false` (and drops nothing) when the
    /// address is already pooled or the pool is still at capacity; the
    /// caller then re-runs its evict/lookup loop.
    pub(crate) fn insert_new(&self, address: &str, value: T) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(address) || inner.entries.len() >= self.capacity {
            return false;
        }
        inner.clock += 1;
        let stamp = inner.clock;
        inner.entries.insert(address.to_string(), PoolEntry { value, stamp });
        true
    }

    /// Explicit release: removes the entry with no eviction side effect.
    pub(crate) fn remove(&self, address: &str) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(address).map(|entry| entry.value)
    }

    /// Drains every entry.
    pub(crate) fn clear(&self) -> Vec<T> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entries
            .drain()
            .map(|(_, entry)| entry.value)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub(crate) fn values(&self) -> Vec<T> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .values()
            .map(|entry| entry.value.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admit(pool: &ConnectionPool<u32>, address: &str, value: u32) -> Vec<(String, u32)> {
        let mut evicted = Vec::new();
        loop {
            if pool.get(address).is_some() {
                return evicted;
            }
            match pool.evict_candidate(address) {
                Some(victim) => evicted.push(victim),
                None => {
                    if pool.insert_new(address, value) {
                        return evicted;
                    }
                }
            }
        }
    }

    #[test]
    fn size_never_exceeds_capacity_and_lru_is_evicted() {
        let pool = ConnectionPool::new(3);
        admit(&pool, "A", 1);
        admit(&pool, "B", 2);
        admit(&pool, "C", 3);
        assert_eq!(pool.len(), 3);

        // Touch A so B becomes least recently used.
        assert_eq!(pool.get("A"), Some(1));

        let evicted = admit(&pool, "D", 4);
        assert_eq!(evicted, vec![("B".to_string(), 2)]);
        assert_eq!(pool.len(), 3);
        assert!(pool.get("B").is_none());
        assert!(pool.get("D").is_some());
    }

    #[test]
    fn inserting_a_pooled_address_is_a_lookup() {
        let pool = ConnectionPool::new(2);
        admit(&pool, "A", 1);
        let evicted = admit(&pool, "A", 9);
        assert!(evicted.is_empty());
        assert_eq!(pool.get("A"), Some(1));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn exactly_one_eviction_for_capacity_plus_one_inserts() {
        let pool = ConnectionPool::new(7);
        let mut evictions = Vec::new();
        for (index, address) in ["A", "B", "C", "D", "E", "F", "G", "H"].iter().enumerate() {
            evictions.extend(admit(&pool, address, index as u32));
            assert!(pool.len() <= 7, "capacity violated after inserting {address}");
        }
        assert_eq!(evictions, vec![("A".to_string(), 0)]);
    }

    #[test]
    fn remove_has_no_eviction_side_effect() {
        let pool = ConnectionPool::new(2);
        admit(&pool, "A", 1);
        admit(&pool, "B", 2);
        assert_eq!(pool.remove("A"), Some(1));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.remove("A"), None);
    }

    #[test]
    fn clear_drains_everything() {
        let pool = ConnectionPool::new(3);
        admit(&pool, "A", 1);
        admit(&pool, "B", 2);
        let mut drained = pool.clear();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(pool.len(), 0);
    }
}
