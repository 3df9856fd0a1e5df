use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;

///
/// CacheStore
///
/// Contract to the external cache service (a Redis- or
/// Memcached-compatible key/value store reachable over the network).
/// Lock records and the table version counter live here too, so the
/// store must offer atomic create-if-absent and increment primitives.
///

pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError>;

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<(), CacheStoreError>;

    /// Atomic create-if-absent. Returns `false` when an unexpired value
    /// already exists under `key`.
    fn add(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<bool, CacheStoreError>;

    fn delete(&self, key: &str) -> Result<(), CacheStoreError>;

    /// Atomic increment of a counter key; a missing key starts at zero.
    fn incr(&self, key: &str) -> Result<u64, CacheStoreError>;
}

///
/// CacheStoreError
///
/// Cache-layer failures never surface to callers of the core; the
/// mediator degrades to direct backend access and reports through the
/// diagnostics sink instead.
///

#[derive(Clone, Debug, ThisError, Eq, PartialEq)]
pub enum CacheStoreError {
    #[error("cache store unavailable: {message}")]
    Unavailable { message: String },
}

///
/// MemoryCacheStore
///
/// Reference in-process cache store with TTL expiry and fault injection.
/// Shared across sessions/threads in tests the way a network cache
/// service would be shared across processes.
///

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
    unavailable: AtomicBool,
}

struct StoredEntry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl MemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a cache service outage; all operations fail until restored.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), CacheStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheStoreError::Unavailable {
                message: "injected outage".to_string(),
            });
        }

        Ok(())
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("cache state");

        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.expired(now)) {
            entries.remove(key);
        }

        Ok(entries.get(key).map(|entry| entry.bytes.clone()))
    }

    fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("cache state");
        entries.insert(
            key.to_string(),
            StoredEntry {
                bytes: value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );

        Ok(())
    }

    fn add(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("cache state");

        let now = Instant::now();
        if entries.get(key).is_some_and(|entry| entry.expired(now)) {
            entries.remove(key);
        }
        if entries.contains_key(key) {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            StoredEntry {
                bytes: value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );

        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), CacheStoreError> {
        self.check_available()?;
        self.entries.lock().expect("cache state").remove(key);

        Ok(())
    }

    fn incr(&self, key: &str) -> Result<u64, CacheStoreError> {
        self.check_available()?;
        let mut entries = self.entries.lock().expect("cache state");

        let current = entries
            .get(key)
            .and_then(|entry| entry.bytes.as_slice().try_into().ok())
            .map_or(0u64, u64::from_be_bytes);
        let next = current.saturating_add(1);
        entries.insert(
            key.to_string(),
            StoredEntry {
                bytes: next.to_be_bytes().to_vec(),
                expires_at: None,
            },
        );

        Ok(next)
    }
}

///
/// TESTS
///
