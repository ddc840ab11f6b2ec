//! Per-key fetch coordination.
//!
//! Each key the [`Debouncer`](crate::Debouncer) has ever seen owns a
//! [`KeyCoordinator`]: a small state machine deciding which caller performs
//! the origin fetch and which callers wait for it. The state lives in a
//! [`watch`] channel, whose semantics are exactly what the wait/wake
//! protocol needs: transitions are atomic, the current state is re-checked
//! before parking (no lost wakeups), and a transition wakes *all* waiters.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::CacheError;

/// The fetch state of a single cache key.
///
/// A fetch epoch moves `Absent` → `Fetching` → `Present`; `Present` is
/// terminal. A failed epoch ends in `Failed` instead, which is equivalent
/// to `Absent` for starting the next epoch but carries the error for the
/// callers that waited on the failed one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum KeyState {
    Absent,
    Fetching,
    Present,
    Failed(CacheError),
}

/// Coordinates concurrent fetches of a single key.
pub(crate) struct KeyCoordinator {
    state: watch::Sender<KeyState>,
}

impl KeyCoordinator {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(KeyState::Absent),
        }
    }

    /// Tries to start a new fetch epoch.
    ///
    /// At most one concurrent caller wins the transition to
    /// [`KeyState::Fetching`] and receives the [`Claim`] obliging it to
    /// perform the fetch. Everyone else gets `None` and should wait via
    /// [`settled`](Self::settled).
    pub fn try_claim(self: &Arc<Self>) -> Option<Claim> {
        let claimed = self.state.send_if_modified(|state| match state {
            KeyState::Absent | KeyState::Failed(_) => {
                *state = KeyState::Fetching;
                true
            }
            KeyState::Fetching | KeyState::Present => false,
        });
        claimed.then(|| Claim {
            coordinator: Arc::clone(self),
            settled: false,
        })
    }

    /// Waits until no fetch is in flight and returns the settled state.
    ///
    /// Returns immediately if the key is not currently being fetched.
    pub async fn settled(&self) -> KeyState {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, KeyState::Fetching))
            .await
            .expect("key coordinator dropped while a caller was waiting");
        state.clone()
    }
}

/// The exclusive right to perform the origin fetch for one epoch.
///
/// The holder must settle the claim with [`complete`](Self::complete) or
/// [`fail`](Self::fail); both broadcast the new state to all waiters.
/// Dropping an unsettled claim broadcasts [`CacheError::Canceled`] so that
/// waiters never hang on an abandoned fetch.
#[must_use]
pub(crate) struct Claim {
    coordinator: Arc<KeyCoordinator>,
    settled: bool,
}

impl Claim {
    /// Marks the fetched value as present and wakes all waiters.
    ///
    /// The value must already be in the cache store: waiters read it from
    /// there as soon as they observe [`KeyState::Present`].
    pub fn complete(mut self) {
        self.settled = true;
        self.coordinator.state.send_replace(KeyState::Present);
    }

    /// Propagates a fetch failure to all waiters of this epoch and reopens
    /// the key for a later retry.
    pub fn fail(mut self, error: CacheError) {
        self.settled = true;
        self.coordinator.state.send_replace(KeyState::Failed(error));
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator
                .state
                .send_replace(KeyState::Failed(CacheError::Canceled));
        }
    }
}

/// Lazily creates and hands out the per-key coordinators.
///
/// At most one [`KeyCoordinator`] ever exists per key: lookup and creation
/// happen under a single critical section. Coordinators are retained for
/// the registry's lifetime.
pub(crate) struct CoordinatorRegistry<K> {
    coordinators: Mutex<HashMap<K, Arc<KeyCoordinator>>>,
}

impl<K: Clone + Eq + Hash> CoordinatorRegistry<K> {
    pub fn get_or_create(&self, key: &K) -> Arc<KeyCoordinator> {
        let mut coordinators = self.coordinators.lock();
        if let Some(coordinator) = coordinators.get(key) {
            return Arc::clone(coordinator);
        }
        let coordinator = Arc::new(KeyCoordinator::new());
        coordinators.insert(key.clone(), Arc::clone(&coordinator));
        coordinator
    }
}

impl<K> Default for CoordinatorRegistry<K> {
    fn default() -> Self {
        Self {
            coordinators: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_one_claim_per_epoch() {
        let coordinator = Arc::new(KeyCoordinator::new());

        let claim = coordinator.try_claim().unwrap();
        assert!(coordinator.try_claim().is_none());

        claim.complete();
        assert_eq!(coordinator.settled().await, KeyState::Present);
        // `Present` is terminal; nothing ever fetches this key again.
        assert!(coordinator.try_claim().is_none());
    }

    #[tokio::test]
    async fn completion_wakes_waiters() {
        let coordinator = Arc::new(KeyCoordinator::new());
        let claim = coordinator.try_claim().unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.settled().await })
            })
            .collect();

        tokio::task::yield_now().await;
        claim.complete();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), KeyState::Present);
        }
    }

    #[tokio::test]
    async fn failure_propagates_and_reopens_the_key() {
        let coordinator = Arc::new(KeyCoordinator::new());

        let claim = coordinator.try_claim().unwrap();
        claim.fail(CacheError::Origin("origin down".into()));

        assert_eq!(
            coordinator.settled().await,
            KeyState::Failed(CacheError::Origin("origin down".into()))
        );
        // The next caller starts a fresh epoch.
        assert!(coordinator.try_claim().is_some());
    }

    #[tokio::test]
    async fn dropped_claim_cancels_waiters() {
        let coordinator = Arc::new(KeyCoordinator::new());

        let claim = coordinator.try_claim().unwrap();
        drop(claim);

        assert_eq!(
            coordinator.settled().await,
            KeyState::Failed(CacheError::Canceled)
        );
    }

    #[test]
    fn registry_creates_one_coordinator_per_key() {
        let registry = CoordinatorRegistry::default();

        let first = registry.get_or_create(&1);
        let again = registry.get_or_create(&1);
        let other = registry.get_or_create(&2);

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
    }
}
