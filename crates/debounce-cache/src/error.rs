use thiserror::Error;

/// An error surfaced by [`Debouncer::get`](crate::Debouncer::get).
///
/// These are cheap to clone because a single failed fetch is propagated to
/// every caller waiting on that fetch epoch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The origin failed to produce a value for the key.
    ///
    /// The attached string contains the origin's error message.
    #[error("origin fetch failed: {0}")]
    Origin(String),
    /// The in-flight fetch was abandoned before it settled, for example
    /// because the fetching task was aborted or panicked.
    #[error("origin fetch was canceled")]
    Canceled,
    /// An internal invariant was violated.
    #[error("internal error")]
    InternalError,
}

/// Shorthand for results carrying a [`CacheError`].
pub type CacheResult<T = ()> = Result<T, CacheError>;
