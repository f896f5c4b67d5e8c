//! State locking for concurrent access protection.
//!
//! Only one apply or destroy may run against a stack at a time. Locks carry
//! an expiry so a crashed run does not block the stack forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

use super::store::StateStore;

/// Lock expiry duration in seconds; long enough for a cluster create.
pub const LOCK_EXPIRY_SECS: i64 = 3_600;

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

/// A lock held by this process for the duration of a run.
#[derive(Debug)]
pub struct StateLock {
    /// Lock information.
    info: LockInfo,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

impl StateLock {
    /// Acquires the stack lock, generating a holder id when none is given.
    ///
    /// # Errors
    ///
    /// Returns an error if another live lock exists or the store fails.
    pub async fn acquire(store: &dyn StateStore, holder: Option<&str>) -> Result<Self> {
        let holder = holder.map_or_else(generate_holder_id, str::to_string);
        let info = store.acquire_lock(&holder).await?;
        Ok(Self { info })
    }

    /// Releases the lock. Failures are logged; the lock then expires on
    /// its own.
    pub async fn release(self, store: &dyn StateStore) {
        if let Err(e) = store.release_lock(&self.info.lock_id).await {
            warn!("Failed to release state lock {}: {e}", self.info.lock_id);
        }
    }

    /// Gets the lock ID.
    #[must_use]
    pub fn lock_id(&self) -> &str {
        &self.info.lock_id
    }

    /// Gets the lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().to_string(),
    );

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::LocalStateStore;
    use tempfile::TempDir;

    #[test]
    fn test_lock_info_creation() {
        let info = LockInfo::new("test-holder");
        assert_eq!(info.holder, "test-holder");
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 0);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);

        let pid = std::process::id().to_string();
        assert!(id1.contains(&pid));
    }

    #[tokio::test]
    async fn test_state_lock_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());

        let lock = StateLock::acquire(&store, None).await.expect("acquire");
        assert!(store.is_locked().await.expect("is_locked"));
        assert_eq!(
            store.get_lock_info().await.expect("info").map(|i| i.lock_id),
            Some(lock.lock_id().to_string())
        );

        assert!(StateLock::acquire(&store, Some("other")).await.is_err());

        lock.release(&store).await;
        assert!(!store.is_locked().await.expect("is_locked"));
    }
}
