//! Advisory lock on a project's state.
//!
//! Only one run may mutate a state at a time. Locks carry an expiry so a
//! crashed run does not block its successors forever.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// Interval at which a running apply renews its lock, in seconds.
pub const LOCK_RENEW_SECS: u64 = 60;

/// Information about a held state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier, required to release the lock.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Operation the holder is running (`apply`, `destroy`, ...).
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates lock info for a new acquisition.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Refreshes the lock expiry time.
    pub fn refresh(&mut self) {
        self.expires_at = Utc::now() + Duration::seconds(LOCK_EXPIRY_SECS);
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let pid = std::process::id();
    let suffix = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_live() {
        let lock = LockInfo::new("ci-runner", "apply");
        assert_eq!(lock.operation, "apply");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
    }

    #[test]
    fn test_backdated_lock_expires() {
        let mut lock = LockInfo::new("ci-runner", "destroy");
        lock.expires_at = Utc::now() - Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
    }

    #[test]
    fn test_refresh_revives_backdated_lock() {
        let mut lock = LockInfo::new("ci-runner", "apply");
        lock.expires_at = Utc::now() - Duration::seconds(1);
        let acquired_at = lock.acquired_at;

        lock.refresh();
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
        assert_eq!(lock.acquired_at, acquired_at);
    }

    #[test]
    fn test_holder_ids_are_unique_per_call() {
        let first = generate_holder_id();
        assert_ne!(first, generate_holder_id());
        assert!(first.contains(&std::process::id().to_string()));
    }
}
