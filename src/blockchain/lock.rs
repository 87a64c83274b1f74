use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Errors that can occur while acquiring a named lock
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {timeout:?} waiting for lock {name}")]
    Timeout { name: String, timeout: Duration },
}

/// Name of the lock serialising block production on `chain_id`
pub fn block_production_lock_name(chain_id: u16) -> String {
    format!("block-production:{}", chain_id)
}

/// Held while producing a block; releasing happens on drop
pub struct LockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        debug!("Released lock {}", self.name);
    }
}

/// A named mutual-exclusion lock.
///
/// A node sharing its database with other authority processes plugs in a
/// distributed implementation here.
#[async_trait]
pub trait BlockProductionLock: Send + Sync {
    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError>;
}

/// Process-wide named locks
#[derive(Default)]
pub struct LocalLockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
    timeout: Option<Duration>,
}

impl LocalLockRegistry {
    /// Fails acquisition that waits longer than `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        LocalLockRegistry {
            locks: DashMap::new(),
            timeout: Some(timeout),
        }
    }

    fn mutex(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl BlockProductionLock for LocalLockRegistry {
    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        let mutex = self.mutex(name);
        let guard = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, mutex.lock_owned())
                .await
                .map_err(|_| LockError::Timeout {
                    name: name.to_string(),
                    timeout,
                })?,
            None => mutex.lock_owned().await,
        };
        debug!("Acquired lock {}", name);
        Ok(LockGuard {
            name: name.to_string(),
            _guard: guard,
        })
    }
}
