//! Debounced ("single-flight") fetching for a keyed cache.
//!
//! When many concurrent callers ask for the same missing key, only one of
//! them performs the expensive origin fetch; the rest wait for it to
//! finish and then reuse its result. The cache map itself sits behind
//! [`FairRwLock`], a shared/exclusive lock that admits any number of
//! concurrent readers without ever letting a stream of new readers starve
//! a pending writer.
//!
//! The entry point is [`Debouncer::get`]; the origin is anything
//! implementing [`OriginSource`].

mod coordinator;
mod debouncer;
mod error;
pub mod lock;
mod store;

pub use debouncer::{Debouncer, OriginSource};
pub use error::{CacheError, CacheResult};
pub use lock::{FairReadGuard, FairRwLock, FairWriteGuard};
pub use store::CacheStore;
