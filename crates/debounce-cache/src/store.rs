use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::lock::FairRwLock;

/// The cache map, guarded by a [`FairRwLock`].
///
/// The two methods below are the only paths to the underlying map: lookups
/// take the lock in shared mode, writes take it in exclusive mode. This is
/// where the lock's invariants are enforced for the whole crate.
pub struct CacheStore<K, V> {
    entries: FairRwLock<HashMap<K, V>>,
}

impl<K: Eq + Hash, V: Clone> CacheStore<K, V> {
    pub fn new() -> Self {
        Self {
            entries: FairRwLock::new(HashMap::new()),
        }
    }

    /// Looks up `key` under the shared lock.
    pub async fn read_through(&self, key: &K) -> Option<V> {
        self.entries.read().await.get(key).cloned()
    }

    /// Inserts or overwrites `key` under the exclusive lock.
    pub async fn write(&self, key: K, value: V) {
        self.entries.write().await.insert(key, value);
    }
}

impl<K: Eq + Hash, V: Clone> Default for CacheStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for CacheStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_through() {
        let store = CacheStore::new();
        assert_eq!(store.read_through(&7).await, None);

        store.write(7, "V7".to_string()).await;
        assert_eq!(store.read_through(&7).await.as_deref(), Some("V7"));
    }

    #[tokio::test]
    async fn write_overwrites() {
        let store = CacheStore::new();
        store.write(1, "old".to_string()).await;
        store.write(1, "new".to_string()).await;
        assert_eq!(store.read_through(&1).await.as_deref(), Some("new"));
    }
}
