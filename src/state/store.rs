//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Every mutation is persisted before the call returns, so a crash mid-run
//! leaves state consistent with exactly the actions that finished.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::graph::Address;

use super::lock::LockInfo;
use super::types::StateRecord;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads the record of one address.
    ///
    /// Returns `None` if the address has no record.
    async fn read(&self, address: &Address) -> Result<Option<StateRecord>>;

    /// Writes the record of one address, replacing any previous record.
    async fn write(&self, address: &Address, record: StateRecord) -> Result<()>;

    /// Deletes the record of one address. Deleting an absent record succeeds.
    async fn delete(&self, address: &Address) -> Result<()>;

    /// Returns every record.
    async fn snapshot(&self) -> Result<BTreeMap<Address, StateRecord>>;

    /// Acquires the state lock for `operation`.
    ///
    /// An empty `holder` is replaced by a generated process identifier.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases a lock previously returned by `acquire_lock`.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Extends the expiry of a held lock.
    ///
    /// Fails with [`StateError::LockFailed`](crate::error::StateError::LockFailed)
    /// if `lock_id` no longer holds the lock.
    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo>;

    /// Removes any lock regardless of its holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn read(&self, address: &Address) -> Result<Option<StateRecord>> {
        (**self).read(address).await
    }

    async fn write(&self, address: &Address, record: StateRecord) -> Result<()> {
        (**self).write(address, record).await
    }

    async fn delete(&self, address: &Address) -> Result<()> {
        (**self).delete(address).await
    }

    async fn snapshot(&self) -> Result<BTreeMap<Address, StateRecord>> {
        (**self).snapshot().await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        (**self).renew_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
