//! Keyed cache with an optional time-to-live
//!
//! `ttl = None` is for immutable data (past stake snapshots, published
//! distributions): entries never expire and only leave through
//! `invalidate`/`clear`. Mutable data gets a short TTL.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct TtlCache<K, V> {
    ttl: Option<Duration>,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn immutable() -> Self {
        Self::new(None)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match (entries.get(key), self.ttl) {
            (None, _) => return None,
            (Some((inserted, _)), Some(ttl)) => inserted.elapsed() >= ttl,
            (Some(_), None) => false,
        };
        if expired {
            entries.remove(key);
            return None;
        }
        entries.get(key).map(|(_, value)| value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immutable_entries_never_expire() {
        let cache = TtlCache::immutable();
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        cache.invalidate(&"a");
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = TtlCache::new(Some(Duration::ZERO));
        cache.insert(1u64, "stale");
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());

        let cache = TtlCache::new(Some(Duration::from_secs(300)));
        cache.insert(1u64, "fresh");
        assert_eq!(cache.get(&1), Some("fresh"));
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
