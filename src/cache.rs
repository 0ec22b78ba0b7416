use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Time-expiring key -> value cache with a monotonic clock.
///
/// `get`/`put` are safe to call from concurrent callers; under
/// contention two callers may both miss and both refetch, which is
/// acceptable (no thundering-herd suppression is required).
pub struct ExpiringCache<V> {
    entries: RwLock<HashMap<Option<String>, (V, Instant)>>,
}

impl<V: Clone> Default for ExpiringCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> ExpiringCache<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &Option<String>) -> Option<V> {
        let entries = self.entries.read().unwrap();
        let (value, expires_at) = entries.get(key)?;
        if Instant::now() < *expires_at {
            Some(value.clone())
        } else {
            None
        }
    }

    pub fn put(&self, key: Option<String>, value: V, expires_in: Duration) {
        let expires_at = Instant::now() + expires_in;
        self.entries.write().unwrap().insert(key, (value, expires_at));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miss_on_empty_cache() {
        let cache: ExpiringCache<String> = ExpiringCache::new();
        assert_eq!(cache.get(&Some("k".to_string())), None);
    }

    #[test]
    fn hit_before_expiry_miss_after() {
        let cache: ExpiringCache<String> = ExpiringCache::new();
        cache.put(Some("k".to_string()), "v".to_string(), Duration::from_millis(50));
        assert_eq!(cache.get(&Some("k".to_string())), Some("v".to_string()));

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(cache.get(&Some("k".to_string())), None);
    }

    #[test]
    fn none_key_is_a_valid_key() {
        let cache: ExpiringCache<String> = ExpiringCache::new();
        cache.put(None, "catalog".to_string(), Duration::from_secs(5));
        assert_eq!(cache.get(&None), Some("catalog".to_string()));
    }

    #[test]
    fn put_overwrites_existing_entry() {
        let cache: ExpiringCache<u32> = ExpiringCache::new();
        cache.put(Some("k".to_string()), 1, Duration::from_secs(5));
        cache.put(Some("k".to_string()), 2, Duration::from_secs(5));
        assert_eq!(cache.get(&Some("k".to_string())), Some(2));
    }
}
