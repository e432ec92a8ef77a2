//! Cross-process mutual exclusion on a (network, host) pair.
//!
//! The lock is a row in the shared database: inserting it takes the lock,
//! a uniqueness violation means someone else holds it, deleting it releases
//! it. Acquisition retries a bounded number of times with a fixed backoff.
use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use config::LockPolicy;
use fabric_core::metrics;

use crate::{IsConflict, Storage};

#[derive(Debug, Error)]
pub enum LockError<E> {
    #[error("lock for ({network_id}, {host}) unavailable after {attempts} attempts")]
    Unavailable {
        network_id: String,
        host: String,
        attempts: u32,
    },
    #[error("database error")]
    DbError(#[from] E),
}

/// Hands out [`LockGuard`]s for rows in the `attachment_locks` table
pub struct AttachmentLock<T> {
    store: Arc<T>,
    policy: LockPolicy,
}

impl<T> Clone for AttachmentLock<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: self.policy,
        }
    }
}

impl<T> fmt::Debug for AttachmentLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentLock")
            .field("policy", &self.policy)
            .finish()
    }
}

impl<T: Storage> AttachmentLock<T> {
    pub fn new(store: Arc<T>, policy: LockPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// take the lock with the configured retry budget
    pub async fn acquire(
        &self,
        network_id: &str,
        host: &str,
    ) -> Result<LockGuard<T>, LockError<T::Error>> {
        self.acquire_with(network_id, host, self.policy).await
    }

    /// single attempt, used by background work that can come back later
    pub async fn try_acquire(
        &self,
        network_id: &str,
        host: &str,
    ) -> Result<LockGuard<T>, LockError<T::Error>> {
        let policy = LockPolicy {
            attempts: 1,
            retry_interval: Duration::ZERO,
        };
        self.acquire_with(network_id, host, policy).await
    }

    async fn acquire_with(
        &self,
        network_id: &str,
        host: &str,
        policy: LockPolicy,
    ) -> Result<LockGuard<T>, LockError<T::Error>> {
        let attempts = policy.attempts.max(1);
        for attempt in 1..=attempts {
            match self.store.insert_lock(network_id, host).await {
                Ok(()) => {
                    trace!(%network_id, ?host, attempt, "attachment lock acquired");
                    return Ok(LockGuard {
                        store: Arc::clone(&self.store),
                        network_id: network_id.to_owned(),
                        host: host.to_owned(),
                        released: false,
                    });
                }
                Err(err) if err.is_conflict() => {
                    metrics::LOCK_CONTENTION.inc();
                    debug!(%network_id, ?host, attempt, "attachment lock held elsewhere");
                    if attempt < attempts {
                        tokio::time::sleep(policy.retry_interval).await;
                    }
                }
                Err(err) => return Err(LockError::DbError(err)),
            }
        }
        metrics::LOCK_UNAVAILABLE.inc();
        warn!(%network_id, ?host, attempts, "giving up on attachment lock");
        Err(LockError::Unavailable {
            network_id: network_id.to_owned(),
            host: host.to_owned(),
            attempts,
        })
    }
}

/// Held lock. Call [`release`] when done; a guard dropped without it
/// releases from a spawned task.
///
/// [`release`]: crate::lock::LockGuard::release
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<T: Storage> {
    store: Arc<T>,
    network_id: String,
    host: String,
    released: bool,
}

impl<T: Storage> fmt::Debug for LockGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("network_id", &self.network_id)
            .field("host", &self.host)
            .field("released", &self.released)
            .finish()
    }
}

impl<T: Storage> LockGuard<T> {
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn release(mut self) -> Result<(), T::Error> {
        self.released = true;
        if !self.store.delete_lock(&self.network_id, &self.host).await? {
            warn!(network_id = %self.network_id, host = ?self.host, "attachment lock row was already gone");
        }
        trace!(network_id = %self.network_id, host = ?self.host, "attachment lock released");
        Ok(())
    }
}

impl<T: Storage> Drop for LockGuard<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = Arc::clone(&self.store);
        let network_id = std::mem::take(&mut self.network_id);
        let host = std::mem::take(&mut self.host);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = store.delete_lock(&network_id, &host).await {
                        error!(?err, %network_id, ?host, "failed to release dropped attachment lock");
                    }
                });
            }
            Err(_) => {
                error!(%network_id, ?host, "attachment lock dropped outside a runtime, row left behind");
            }
        }
    }
}
