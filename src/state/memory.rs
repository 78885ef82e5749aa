//! In-process state store.
//!
//! Used for plan-only runs against a throwaway state and in tests.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::error::{Result, StateError};
use crate::graph::Address;

use super::lock::{generate_holder_id, LockInfo};
use super::store::StateStore;
use super::types::{StateFile, StateRecord};

/// State store keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<StateFile>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = (Address, StateRecord)>) -> Self {
        let mut state = StateFile::new();
        state.resources.extend(records);
        Self {
            state: Mutex::new(state),
            lock: Mutex::new(None),
        }
    }

    /// Returns the number of persisted changes so far.
    pub async fn serial(&self) -> u64 {
        self.state.lock().await.serial
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn read(&self, address: &Address) -> Result<Option<StateRecord>> {
        Ok(self.state.lock().await.get(address).cloned())
    }

    async fn write(&self, address: &Address, record: StateRecord) -> Result<()> {
        self.state.lock().await.set(address.clone(), record);
        Ok(())
    }

    async fn delete(&self, address: &Address) -> Result<()> {
        self.state.lock().await.remove(address);
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<Address, StateRecord>> {
        Ok(self.state.lock().await.resources.clone())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;
        if let Some(existing) = lock.as_ref().filter(|l| !l.is_expired()) {
            return Err(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }
            .into());
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let info = LockInfo::new(&holder_id, operation);
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.lock().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;
        match lock.as_mut().filter(|l| l.lock_id == lock_id) {
            Some(held) => {
                held.refresh();
                Ok(held.clone())
            }
            None => Err(StateError::LockFailed {
                message: format!("Lock {lock_id} is no longer held"),
            }
            .into()),
        }
    }

    async fn force_unlock(&self) -> Result<()> {
        *self.lock.lock().await = None;
        Ok(())
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Attributes;

    #[tokio::test]
    async fn test_write_read_delete() {
        let store = MemoryStateStore::new();
        let address = Address::new("network", "main");
        let record = StateRecord::clean(Attributes::new(), Attributes::new(), Vec::new());

        store.write(&address, record.clone()).await.expect("write");
        assert_eq!(store.read(&address).await.expect("read"), Some(record));

        store.delete(&address).await.expect("delete");
        assert!(store.read(&address).await.expect("read").is_none());
        assert_eq!(store.serial().await, 2);
    }

    #[tokio::test]
    async fn test_release_requires_matching_id() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("", "plan").await.expect("lock");
        assert!(store.acquire_lock("other", "apply").await.is_err());

        store.release_lock("not-the-id").await.expect("release");
        assert!(store.lock_info().await.expect("info").is_some());

        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(store.lock_info().await.expect("info").is_none());
        assert!(store.renew_lock(&lock.lock_id).await.is_err());
    }
}
