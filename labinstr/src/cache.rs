/// The smart cache remembers the last value programmed for each parameter of one instrument,
/// so unchanged parameters are not written again.
///
/// A parameter is either `Unknown` (the next program call always writes) or `Cached`. The
/// cache is owned by the worker of a single connection and never shared.
use std::collections::BTreeMap;
use std::future::Future;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CacheState<'a, V> {
    Unknown,
    Cached(&'a V),
}

#[derive(Clone, Debug)]
pub struct SmartCache<K: Ord, V> {
    entries: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for SmartCache<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: PartialEq> SmartCache<K, V> {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn state(&self, key: &K) -> CacheState<'_, V> {
        match self.entries.get(key) {
            Some(x) => CacheState::Cached(x),
            None => CacheState::Unknown,
        }
    }

    pub fn cached(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn needs_write(&self, key: &K, value: &V, fresh: bool) -> bool {
        fresh || self.entries.get(key) != Some(value)
    }

    pub fn store(&mut self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes `value` through `write` unless it is already cached and `fresh` is not set.
    /// The entry is `Unknown` while the write is in flight and stays so if it fails.
    /// Returns whether a write was issued.
    pub async fn program<F, Fut>(&mut self, key: K, value: V, fresh: bool, write: F) -> crate::Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<()>>,
    {
        if !self.needs_write(&key, &value, fresh) {
            return Ok(false);
        }
        self.entries.remove(&key);
        write().await?;
        self.entries.insert(key, value);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::cell::Cell;

    #[tokio::test]
    async fn same_value_is_written_once() {
        let mut cache = SmartCache::new();
        let writes = Cell::new(0);
        for _ in 0..3 {
            cache
                .program("freq0", 10_000_000_u64, false, || async {
                    writes.set(writes.get() + 1);
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(writes.get(), 1);
        assert_eq!(cache.state(&"freq0"), CacheState::Cached(&10_000_000));
    }

    #[tokio::test]
    async fn fresh_and_changed_values_are_written() {
        let mut cache = SmartCache::new();
        cache.store("amp0", 1_u64);
        let wrote = cache.program("amp0", 1, true, || async { Ok(()) }).await.unwrap();
        assert!(wrote);
        let wrote = cache.program("amp0", 2, false, || async { Ok(()) }).await.unwrap();
        assert!(wrote);
        let wrote = cache.program("amp0", 2, false, || async { Ok(()) }).await.unwrap();
        assert!(!wrote);
    }

    #[tokio::test]
    async fn failed_write_leaves_entry_unknown() {
        let mut cache = SmartCache::new();
        cache.store("freq0", 5_u64);
        let ret = cache.program("freq0", 6, false, || async { Err(Error::timeout()) }).await;
        assert!(matches!(ret, Err(Error::Timeout)));
        assert_eq!(cache.state(&"freq0"), CacheState::Unknown);
        // the next attempt is unconditional, even for the previously cached value
        assert!(cache.needs_write(&"freq0", &5, false));
    }

    #[test]
    fn invalidation() {
        let mut cache = SmartCache::new();
        cache.store("a", 1);
        cache.store("b", 2);
        cache.invalidate(&"a");
        assert_eq!(cache.cached(&"a"), None);
        assert_eq!(cache.cached(&"b"), Some(&2));
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
