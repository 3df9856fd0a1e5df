use crate::cache::store::{CacheStore, CacheStoreError};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error as ThisError;
use ulid::Ulid;

///
/// Distributed table lock
///
/// Lease-based mutual exclusion keyed by (table, lock key), stored in the
/// external cache service so it survives client restarts and is visible
/// to every cooperating process. Non-reentrant, TTL-bounded, no fairness:
/// contention is resolved by whichever acquire attempt lands first.
///

fn lock_record_key(table: &str, key: &str) -> String {
    format!("kt:{table}:lock:{key}")
}

/// Acquire the lock for `(table, key)`, polling until `wait` elapses.
///
/// The lease record is created atomically with `lease_ttl` and a
/// caller-unique owner token, so an abandoned lease self-expires.
pub fn acquire(
    store: &Arc<dyn CacheStore>,
    table: &str,
    key: &str,
    wait: Duration,
    lease_ttl: Duration,
    retry: Duration,
) -> Result<LockGuard, LockError> {
    let record_key = lock_record_key(table, key);
    let token = Ulid::new().to_string();
    let deadline = Instant::now() + wait;

    loop {
        let created = store.add(&record_key, token.clone().into_bytes(), Some(lease_ttl))?;
        if created {
            return Ok(LockGuard {
                store: Arc::clone(store),
                table: table.to_string(),
                key: key.to_string(),
                record_key,
                token,
                released: false,
            });
        }

        if Instant::now() >= deadline {
            return Err(LockError::TimedOut {
                table: table.to_string(),
                key: key.to_string(),
            });
        }
        std::thread::sleep(retry);
    }
}

///
/// LockGuard
///
/// Exclusive lease held until `release` or drop. Drop release is
/// best-effort and swallows errors; an unreleased lease self-expires at
/// its TTL.
///

pub struct LockGuard {
    store: Arc<dyn CacheStore>,
    table: String,
    key: String,
    record_key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Release the lease, verifying ownership first so a lease already
    /// reassigned after TTL expiry is never torn down by a stale holder.
    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let current = self.store.get(&self.record_key)?;
        match current {
            Some(owner) if owner == self.token.as_bytes() => {
                self.store.delete(&self.record_key)?;
                Ok(())
            }
            _ => Err(LockError::NotOwner {
                table: self.table.clone(),
                key: self.key.clone(),
            }),
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("table", &self.table)
            .field("key", &self.key)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release_inner();
        }
    }
}

///
/// LockError
///

#[derive(Clone, Debug, ThisError, Eq, PartialEq)]
pub enum LockError {
    #[error("lock wait timed out for (table '{table}', key '{key}')")]
    TimedOut { table: String, key: String },

    #[error("lock for (table '{table}', key '{key}') is not owned by this holder")]
    NotOwner { table: String, key: String },

    #[error(transparent)]
    Store(#[from] CacheStoreError),
}

///
/// TESTS
///
