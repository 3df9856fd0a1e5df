pub mod entry;
pub mod lock;
pub mod mediator;
pub mod store;

pub use lock::{LockError, LockGuard};
pub use mediator::CacheMediator;
pub use store::{CacheStore, CacheStoreError, MemoryCacheStore};

use std::time::Duration;

///
/// CacheConfig
///
/// Tunables for the look-aside cache layer. The entry TTL is an explicit
/// knob: `None` disables time-based expiry and leaves invalidation fully
/// write-triggered.
///

#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Lease duration of one distributed lock record.
    pub lock_ttl: Duration,
    /// Bounded wait for lock acquisition before degrading to a direct read.
    pub lock_wait: Duration,
    /// Poll interval between acquisition attempts.
    pub lock_retry: Duration,
    /// Optional maximum staleness bound for cached entries.
    pub entry_ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            lock_wait: Duration::from_secs(5),
            lock_retry: Duration::from_millis(20),
            entry_ttl: None,
        }
    }
}
