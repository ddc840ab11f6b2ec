use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::coordinator::{CoordinatorRegistry, KeyState};
use crate::error::{CacheError, CacheResult};
use crate::store::CacheStore;

/// The origin a [`Debouncer`] fetches from when a key is missing.
///
/// Fetches are assumed slow and idempotent per key; the debouncer invokes
/// [`fetch`](Self::fetch) at most once per key per fetch epoch, no matter
/// how many callers ask for the key concurrently.
pub trait OriginSource: Send + Sync + 'static {
    type Key: fmt::Debug + Clone + Eq + Hash + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Fetches the value for `key` from the origin.
    fn fetch(&self, key: &Self::Key) -> BoxFuture<'_, CacheResult<Self::Value>>;
}

/// Debounces cache fetches: concurrent [`get`](Self::get) calls for the
/// same missing key trigger a single origin fetch, whose result is written
/// to the [`CacheStore`] and shared with every waiting caller.
///
/// Clones share the same origin, store and coordinators, so a `Debouncer`
/// can be handed to any number of concurrent tasks.
pub struct Debouncer<S: OriginSource> {
    origin: Arc<S>,
    store: Arc<CacheStore<S::Key, S::Value>>,
    coordinators: Arc<CoordinatorRegistry<S::Key>>,
}

impl<S: OriginSource> Clone for Debouncer<S> {
    fn clone(&self) -> Self {
        Self {
            origin: Arc::clone(&self.origin),
            store: Arc::clone(&self.store),
            coordinators: Arc::clone(&self.coordinators),
        }
    }
}

impl<S: OriginSource> fmt::Debug for Debouncer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl<S: OriginSource> Debouncer<S> {
    pub fn new(origin: S) -> Self {
        Self {
            origin: Arc::new(origin),
            store: Arc::new(CacheStore::new()),
            coordinators: Arc::new(CoordinatorRegistry::default()),
        }
    }

    /// The cache store backing this debouncer.
    pub fn store(&self) -> &CacheStore<S::Key, S::Value> {
        &self.store
    }

    /// Resolves `key`, fetching it from the origin if no fetch epoch has
    /// completed for it yet.
    ///
    /// Exactly one of any number of concurrent calls for a missing key
    /// performs the origin fetch; the others wait for it to settle and
    /// then read the freshly written store entry. An origin failure is
    /// returned to every caller of the failed epoch, and the next call
    /// for that key retries the origin.
    pub async fn get(&self, key: S::Key) -> CacheResult<S::Value> {
        let coordinator = self.coordinators.get_or_create(&key);

        loop {
            if let Some(claim) = coordinator.try_claim() {
                tracing::trace!(?key, "fetching from origin");
                return match self.origin.fetch(&key).await {
                    Ok(value) => {
                        // The store write must complete before waiters are
                        // woken; they read the entry right after.
                        self.store.write(key, value.clone()).await;
                        claim.complete();
                        Ok(value)
                    }
                    Err(error) => {
                        tracing::debug!(?key, %error, "origin fetch failed");
                        claim.fail(error.clone());
                        Err(error)
                    }
                };
            }

            match coordinator.settled().await {
                KeyState::Present => {
                    tracing::trace!(?key, "serving from cache");
                    // The fetcher populated the store before broadcasting
                    // `Present`, so the entry must exist.
                    return self
                        .store
                        .read_through(&key)
                        .await
                        .ok_or(CacheError::InternalError);
                }
                KeyState::Failed(error) => return Err(error),
                // Raced with the start of a new epoch; try again.
                KeyState::Absent | KeyState::Fetching => continue,
            }
        }
    }
}
