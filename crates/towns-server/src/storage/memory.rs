//! In-memory datasets using DashMap, each gated by a [`Cache`]

use dashmap::DashMap;
use std::hash::Hash;
use towns_core::{Cache, CacheStatus, Result};
use tracing::{debug, warn};

/// Keyed dataset served from memory.
///
/// Every read and write fails with `CacheNotLoaded` unless the cache is
/// LOADED. Loading goes through `begin_load` / `load` / `complete_load`.
pub struct CachedMap<K, V> {
    cache: Cache,
    data: DashMap<K, V>,
}

impl<K, V> CachedMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            cache: Cache::new(name),
            data: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Move to UPDATING and drop the previous contents
    pub fn begin_load(&self) -> Result<()> {
        self.cache.transition(CacheStatus::Updating)?;
        self.data.clear();
        self.cache.clear_items_loaded();
        Ok(())
    }

    /// Add one item while UPDATING
    pub fn load(&self, key: K, value: V) {
        if self.data.insert(key, value).is_none() {
            self.cache.increment_items_loaded();
        }
    }

    pub fn complete_load(&self) -> Result<()> {
        self.cache.transition(CacheStatus::Loaded)?;
        debug!("Loaded {} {} entries", self.len(), self.cache.name());
        Ok(())
    }

    pub fn fail_load(&self) {
        if let Err(e) = self.cache.transition(CacheStatus::Error) {
            warn!("Could not mark {} cache as failed: {}", self.cache.name(), e);
        }
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.cache.ensure_loaded()?;
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    pub fn values(&self) -> Result<Vec<V>> {
        self.cache.ensure_loaded()?;
        Ok(self.data.iter().map(|entry| entry.value().clone()).collect())
    }

    pub fn entries(&self) -> Result<Vec<(K, V)>> {
        self.cache.ensure_loaded()?;
        Ok(self
            .data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    /// First entry matching `predicate`
    pub fn find(&self, predicate: impl Fn(&K, &V) -> bool) -> Result<Option<(K, V)>> {
        self.cache.ensure_loaded()?;
        Ok(self
            .data
            .iter()
            .find(|entry| predicate(entry.key(), entry.value()))
            .map(|entry| (entry.key().clone(), entry.value().clone())))
    }

    /// Insert or replace; returns the previous value
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        self.cache.ensure_loaded()?;
        let previous = self.data.insert(key, value);
        if previous.is_none() {
            self.cache.increment_items_loaded();
        }
        Ok(previous)
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        self.cache.ensure_loaded()?;
        let removed = self.data.remove(key).map(|(_, value)| value);
        if removed.is_some() {
            self.cache.decrement_items_loaded();
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use towns_core::TownsError;

    fn loaded_map() -> CachedMap<String, i32> {
        let map = CachedMap::new("test");
        assert_ok!(map.begin_load());
        map.load("one".to_string(), 1);
        map.load("two".to_string(), 2);
        map.complete_load().unwrap();
        map
    }

    #[test]
    fn test_reads_fail_until_loaded() {
        let map: CachedMap<String, i32> = CachedMap::new("town");
        let err = map.get(&"one".to_string()).unwrap_err();
        assert!(err.is_cache_not_loaded());
        assert!(err.to_string().contains("UNINITIALIZED"));

        map.begin_load().unwrap();
        assert!(map.values().unwrap_err().is_cache_not_loaded());
    }

    #[test]
    fn test_basic_operations() {
        let map = loaded_map();
        assert_eq!(map.cache().items_loaded(), 2);
        assert_eq!(map.get(&"one".to_string()).unwrap(), Some(1));
        assert_eq!(map.get(&"three".to_string()).unwrap(), None);

        assert_eq!(map.insert("three".to_string(), 3).unwrap(), None);
        assert_eq!(map.insert("three".to_string(), 33).unwrap(), Some(3));
        assert_eq!(map.cache().items_loaded(), 3);

        assert_eq!(map.remove(&"one".to_string()).unwrap(), Some(1));
        assert_eq!(map.remove(&"one".to_string()).unwrap(), None);
        assert_eq!(map.cache().items_loaded(), 2);

        let found = map.find(|_, v| *v > 30).unwrap();
        assert_eq!(found, Some(("three".to_string(), 33)));
    }

    #[test]
    fn test_reload_replaces_contents() {
        let map = loaded_map();
        map.begin_load().unwrap();
        assert!(map.is_empty());
        assert_eq!(map.cache().items_loaded(), 0);
        map.load("four".to_string(), 4);
        map.complete_load().unwrap();
        assert_eq!(map.values().unwrap(), vec![4]);
    }

    #[test]
    fn test_concurrent_load_is_rejected() {
        let map: CachedMap<String, i32> = CachedMap::new("claim world");
        map.begin_load().unwrap();
        let err = assert_err!(map.begin_load());
        assert!(matches!(err, TownsError::IllegalTransition { .. }));
        map.fail_load();
        assert_eq!(map.cache().status(), CacheStatus::Error);
        assert!(map.get(&"x".to_string()).unwrap_err().is_cache_not_loaded());
        // ERROR may retry
        map.begin_load().unwrap();
    }
}
