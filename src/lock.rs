//! Partition-scoped lock tokens with a time-to-live.
//!
//! At most one valid token exists per partition. Expired tokens count as
//! absent. There is no queue: callers that lose retry with backoff through
//! [`acquire_with_timeout`].

mod file;
mod memory;

pub use file::FileLockCoordinator;
pub use memory::MemoryLockCoordinator;

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("partition '{partition}' is locked by '{holder}' until {expires_at}")]
    LockHeld {
        partition: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("'{holder}' does not hold the lock on partition '{partition}'")]
    NotHolder { partition: String, holder: String },

    #[error("timed out after {waited:?} waiting for the lock on partition '{partition}'")]
    Timeout { partition: String, waited: Duration },

    #[error("invalid partition id: {0:?}")]
    InvalidPartition(String),

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt lock token: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LockToken {
    pub partition_id: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl LockToken {
    pub fn new(partition_id: &str, holder_id: &str, ttl: Duration) -> Self {
        Self {
            partition_id: partition_id.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: Utc::now(),
            ttl,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.acquired_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    fn held_error(&self) -> LockError {
        LockError::LockHeld {
            partition: self.partition_id.clone(),
            holder: self.holder_id.clone(),
            expires_at: self.expires_at(),
        }
    }
}

pub trait LockCoordinator: Send + Sync {
    /// Take the lock if no valid token exists. Never re-entrant.
    fn acquire(
        &self,
        partition_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockToken, LockError>;

    /// Extend the lock for another `ttl` from now. Fails with `NotHolder`
    /// unless `holder_id` owns the current valid token, so an expired lock
    /// cannot be revived once someone else may have taken it.
    fn renew(
        &self,
        partition_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockToken, LockError>;

    /// Drop the lock. Fails with `NotHolder` unless `holder_id` owns the
    /// current valid token.
    fn release(&self, partition_id: &str, holder_id: &str) -> Result<(), LockError>;

    /// The valid token for a partition, if any.
    fn current(&self, partition_id: &str) -> Result<Option<LockToken>, LockError>;

    /// Remove any token regardless of holder. Returns what was removed.
    fn force_release(&self, partition_id: &str) -> Result<Option<LockToken>, LockError>;
}

fn not_holder(partition_id: &str, holder_id: &str) -> LockError {
    LockError::NotHolder {
        partition: partition_id.to_string(),
        holder: holder_id.to_string(),
    }
}

fn validate_partition(partition_id: &str) -> Result<(), LockError> {
    if matches!(partition_id, "" | "." | "..") {
        return Err(LockError::InvalidPartition(partition_id.to_string()));
    }
    Ok(())
}

/// Keep trying while the lock is held by someone else, up to `timeout`.
pub async fn acquire_with_timeout(
    coordinator: &dyn LockCoordinator,
    partition_id: &str,
    holder_id: &str,
    ttl: Duration,
    timeout: Duration,
    backoff: &RetryPolicy,
) -> Result<LockToken, LockError> {
    let started = tokio::time::Instant::now();
    let deadline = started + timeout;
    let mut failures = 0u32;

    loop {
        match coordinator.acquire(partition_id, holder_id, ttl) {
            Ok(token) => {
                tracing::info!(partition = partition_id, holder = holder_id, "lock acquired");
                return Ok(token);
            }
            Err(LockError::LockHeld { holder, .. }) => {
                failures = failures.saturating_add(1);
                let now = tokio::time::Instant::now();
                if now >= deadline || failures >= backoff.max_attempts {
                    return Err(LockError::Timeout {
                        partition: partition_id.to_string(),
                        waited: now - started,
                    });
                }
                let delay = backoff.delay_for(failures).min(deadline - now);
                tracing::debug!(
                    partition = partition_id,
                    current_holder = %holder,
                    delay_ms = delay.as_millis() as u64,
                    "lock busy, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}
