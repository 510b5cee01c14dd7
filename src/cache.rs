//! Generic bounded TTL cache, generalized from the host's kind-10050 inbox
//! relay cache (`inbox_relays.rs`): entries remember whether the value came
//! from a successful or failed lookup and use a shorter TTL for failures so
//! transient errors don't suppress routing for long.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    ok: bool,
}

/// A `Mutex<HashMap>`-backed cache with per-entry TTL that differs between
/// "ok" and "error" results, and a soft cap evicting the oldest entries once
/// exceeded (last-touched replacement, per the concurrency model's LRU note).
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl_ok: Duration,
    ttl_err: Duration,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl_ok: Duration, ttl_err: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_ok,
            ttl_err,
            capacity,
        }
    }

    /// Look up a still-valid entry. Expired entries are treated as a miss
    /// (and lazily dropped on the next `insert`).
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        let ttl = if entry.ok { self.ttl_ok } else { self.ttl_err };
        if entry.inserted_at.elapsed() < ttl {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    /// Insert a value, recording whether the lookup that produced it
    /// succeeded. Even failed lookups are cached (with the shorter TTL) to
    /// avoid hammering a remote endpoint that just failed.
    pub fn insert(&self, key: K, value: V, ok: bool) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                ok,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_entries_survive_until_ttl() {
        let cache: TtlCache<u8, Vec<String>> =
            TtlCache::new(Duration::from_secs(60), Duration::from_secs(1), 8);
        cache.insert(1, vec!["wss://a".to_string()], true);
        assert_eq!(cache.get(&1), Some(vec!["wss://a".to_string()]));
    }

    #[test]
    fn error_entries_use_shorter_ttl() {
        let cache: TtlCache<u8, Vec<String>> =
            TtlCache::new(Duration::from_secs(60), Duration::from_millis(1), 8);
        cache.insert(1, vec![], false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let cache: TtlCache<u8, u8> = TtlCache::new(Duration::from_secs(60), Duration::from_secs(60), 2);
        cache.insert(1, 1, true);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(2, 2, true);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(3, 3, true);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
    }
}
