use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};
use rustc_hash::FxHashMap;

/// A copy-on-write map for registries that are read on every message and changed rarely (sender
///  pools per member, channel listeners). Readers get a cheap snapshot that is never affected by
///  later updates.
pub struct AtomicMap<K,V> {
    map: RwLock<Arc<FxHashMap<K,V>>>,
}
impl <K: Hash+Eq+Clone+Sync+Send,V:Clone+Sync+Send> Default for AtomicMap<K,V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash+Eq+Clone+Sync+Send, V:Clone+Sync+Send> AtomicMap<K,V> {
    pub fn new() -> AtomicMap<K,V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn snapshot(&self) -> Arc<FxHashMap<K,V>> {
        self.map.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.snapshot()
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Applies `f` to a copy of the map and publishes the result. Concurrent updates are
    ///  serialized, so no update is lost.
    pub fn update<R>(&self, f: impl FnOnce(&mut FxHashMap<K,V>) -> R) -> R {
        let mut lock = self.map.write()
            .unwrap_or_else(PoisonError::into_inner);

        let mut map: FxHashMap<K,V> = lock.as_ref().clone();
        let result = f(&mut map);
        *lock = Arc::new(map);
        result
    }

    pub fn get_or_insert_with(&self, key: K, f: impl FnOnce() -> V) -> V {
        if let Some(existing) = self.get(&key) {
            return existing;
        }
        self.update(|m| m.entry(key).or_insert_with(f).clone())
    }

    pub fn overwrite_entry(&self, key: K, value: V) {
        self.update(|m| {
            m.insert(key, value);
        });
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.update(|m| m.remove(key))
    }

    pub fn clear(&self) -> Arc<FxHashMap<K,V>> {
        let mut lock = self.map.write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *lock)
    }
}
