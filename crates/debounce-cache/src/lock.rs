//! A starvation-free shared/exclusive lock.
//!
//! [`FairRwLock`] admits any number of concurrent readers, or a single
//! writer. Unlike a reader-preferring lock, it never lets a continuous
//! stream of new readers defer a pending writer indefinitely: a writer
//! waiting for the readers to drain holds the entry gate, which blocks
//! all newly arriving readers until the write has gone through.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bookkeeping for the shared side of the lock.
#[derive(Default)]
struct ReaderState {
    /// Number of currently admitted readers.
    count: usize,
    /// The resource permit, acquired by the first reader on behalf of all
    /// readers and dropped by the last one out.
    resource: Option<OwnedSemaphorePermit>,
}

/// A shared/exclusive lock over `T` that does not starve writers.
///
/// Both acquisition paths go through the *entry gate* before touching the
/// *resource gate*. Readers release the entry gate as soon as they are
/// admitted, so they run concurrently; a writer keeps it for the whole
/// write, including the time it spends waiting for readers to drain.
/// Readers that arrive during that wait queue up behind the writer instead
/// of extending the read phase forever.
///
/// Waiters on either gate are served in FIFO order.
pub struct FairRwLock<T> {
    /// The starvation gate.
    entry: Arc<Semaphore>,
    /// The actual shared/exclusive resource gate. Held (with its single
    /// permit checked out) whenever `readers.count > 0` or a writer is
    /// active, never both.
    resource: Arc<Semaphore>,
    readers: Mutex<ReaderState>,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is mediated entirely by the resource gate;
// see the guard `Deref` impls below.
unsafe impl<T: Send> Send for FairRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for FairRwLock<T> {}

impl<T> FairRwLock<T> {
    /// Creates a new lock owning `value`.
    pub fn new(value: T) -> Self {
        Self {
            entry: Arc::new(Semaphore::new(1)),
            resource: Arc::new(Semaphore::new(1)),
            readers: Mutex::new(ReaderState::default()),
            value: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock, returning the value it protects.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    /// Acquires the lock in shared mode.
    ///
    /// Blocks while a writer is active, and also while one is *waiting*:
    /// a pending writer holds the entry gate, so new readers are queued
    /// behind it rather than riding along with the current read phase.
    pub async fn read(&self) -> FairReadGuard<'_, T> {
        let entry = self
            .entry
            .acquire()
            .await
            .expect("entry gate semaphore closed");

        let riding_along = {
            let mut readers = self.readers.lock();
            if readers.count > 0 {
                // Some reader already holds the resource gate for us.
                readers.count += 1;
                true
            } else {
                false
            }
        };

        if !riding_along {
            // First reader in: take the resource gate on behalf of all
            // readers. The entry permit serializes this section against
            // other acquirers, and with a count of zero there is no
            // release that could race the state update below.
            let permit = Arc::clone(&self.resource)
                .acquire_owned()
                .await
                .expect("resource gate semaphore closed");
            let mut readers = self.readers.lock();
            debug_assert_eq!(readers.count, 0);
            debug_assert!(readers.resource.is_none());
            readers.count = 1;
            readers.resource = Some(permit);
        }

        drop(entry);
        FairReadGuard { lock: self }
    }

    /// Acquires the lock in exclusive mode.
    ///
    /// The entry gate is held until the returned guard is dropped, so no
    /// new reader is admitted between this call and the end of the write.
    pub async fn write(&self) -> FairWriteGuard<'_, T> {
        let entry = Arc::clone(&self.entry)
            .acquire_owned()
            .await
            .expect("entry gate semaphore closed");
        let resource = Arc::clone(&self.resource)
            .acquire_owned()
            .await
            .expect("resource gate semaphore closed");
        FairWriteGuard {
            lock: self,
            _resource: resource,
            _entry: entry,
        }
    }
}

impl<T: Default> Default for FairRwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for FairRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairRwLock")
            .field("readers", &self.readers.lock().count)
            .finish_non_exhaustive()
    }
}

/// Shared access to the value in a [`FairRwLock`].
pub struct FairReadGuard<'a, T> {
    lock: &'a FairRwLock<T>,
}

impl<T> Deref for FairReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: while this guard exists the reader count is positive,
        // which keeps the resource gate checked out and excludes writers.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> Drop for FairReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut readers = self.lock.readers.lock();
        readers.count -= 1;
        if readers.count == 0 {
            // Last reader out returns the resource gate.
            readers.resource.take();
        }
    }
}

/// Exclusive access to the value in a [`FairRwLock`].
pub struct FairWriteGuard<'a, T> {
    lock: &'a FairRwLock<T>,
    // Field order matters: the resource gate is released before the entry
    // gate when the guard is dropped.
    _resource: OwnedSemaphorePermit,
    _entry: OwnedSemaphorePermit,
}

impl<T> Deref for FairWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: this guard holds the resource gate's only permit, so no
        // reader or other writer can access the value.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for FairWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: see `Deref`.
        unsafe { &mut *self.lock.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use tokio::sync::Barrier;
    use tokio::time::{sleep, timeout};

    use super::*;

    const TICK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn read_write_roundtrip() {
        let lock = FairRwLock::new(0);
        assert_eq!(*lock.read().await, 0);

        *lock.write().await = 42;
        assert_eq!(*lock.read().await, 42);
        assert_eq!(lock.into_inner(), 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn readers_run_concurrently() {
        let lock = Arc::new(FairRwLock::new(()));
        let barrier = Arc::new(Barrier::new(4));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    let _guard = lock.read().await;
                    // Only passes if all four readers hold the lock at once.
                    timeout(TICK * 20, barrier.wait()).await.unwrap();
                })
            })
            .collect();

        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test]
    async fn writer_is_exclusive() {
        let lock = Arc::new(FairRwLock::new(0));
        let guard = lock.write().await;

        assert!(timeout(TICK, lock.read()).await.is_err());
        assert!(timeout(TICK, lock.write()).await.is_err());

        drop(guard);
        assert_eq!(*lock.read().await, 0);
    }

    #[tokio::test]
    async fn writer_waits_for_readers() {
        let lock = Arc::new(FairRwLock::new(0));
        let guard = lock.read().await;

        assert!(timeout(TICK, lock.write()).await.is_err());

        drop(guard);
        *lock.write().await = 1;
        assert_eq!(*lock.read().await, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_writer_blocks_new_readers() {
        let lock = Arc::new(FairRwLock::new(0));
        let reader = lock.read().await;

        let writer = tokio::spawn({
            let lock = Arc::clone(&lock);
            async move { *lock.write().await = 7 }
        });

        // Let the writer park on the resource gate while it holds the
        // entry gate.
        sleep(TICK).await;

        // New readers must queue behind the pending writer instead of
        // riding along with the active read phase.
        assert!(timeout(TICK, lock.read()).await.is_err());

        drop(reader);
        writer.await.unwrap();
        assert_eq!(*lock.read().await, 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writer_completes_under_reader_stream() {
        let lock = Arc::new(FairRwLock::new(0u64));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let stop = Arc::clone(&stop);
                tokio::spawn(async move {
                    while !stop.load(Ordering::Relaxed) {
                        let _guard = lock.read().await;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        sleep(TICK).await;

        // The writer is admitted after a bounded number of reader
        // turnovers even though new read attempts never stop.
        timeout(TICK * 40, async { *lock.write().await = 1 })
            .await
            .expect("writer was starved by the reader stream");

        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.await.unwrap();
        }
        assert_eq!(*lock.read().await, 1);
    }
}
