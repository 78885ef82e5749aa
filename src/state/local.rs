//! Local file-based state storage backend.
//!
//! The whole state is one JSON document. Every write replaces it atomically
//! (temp file, fsync, rename) while holding an in-process mutex, so parallel
//! actions never interleave their writes.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};
use crate::graph::Address;

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{StateFile, StateRecord, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// Default state file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Loaded state, `None` until first access.
    cache: Mutex<Option<StateFile>>,
}

impl LocalStateStore {
    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            cache: Mutex::new(None),
        }
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            state_path,
            lock_path,
            cache: Mutex::new(None),
        }
    }

    /// Returns the path of the state file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Loads the full state document, bypassing the cache.
    ///
    /// Returns `None` if no state file exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if it was
    /// written by an incompatible version.
    pub async fn load_file(&self) -> Result<Option<StateFile>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path)
            .await
            .map_err(|e| corrupted(format!("Failed to read state file: {e}")))?;

        let state: StateFile = serde_json::from_str(&content)
            .map_err(|e| corrupted(format!("Failed to parse state file: {e}")))?;

        if state.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }
            .into());
        }

        Ok(Some(state))
    }

    /// Runs `f` against the loaded state while holding the store mutex.
    ///
    /// When `f` returns true the modified document is persisted before the
    /// cache is updated, so a failed write leaves the cache untouched.
    async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StateFile) -> bool + Send,
    {
        let mut guard = self.cache.lock().await;
        let mut next = match guard.as_ref() {
            Some(state) => state.clone(),
            None => self.load_file().await?.unwrap_or_default(),
        };

        if f(&mut next) {
            self.persist(&next).await?;
        }
        *guard = Some(next);
        Ok(())
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::write_failed(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Writes the state document atomically.
    async fn persist(&self, state: &StateFile) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let temp_path = self.state_path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::write_failed(format!("Failed to create temp state file: {e}"))
        })?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::write_failed(format!("Failed to write state file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::write_failed(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::write_failed(format!("Failed to rename state file: {e}")))?;

        debug!("State saved (serial {})", state.serial);
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(corrupted(format!("Failed to read lock file: {e}"))),
        };

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if another process created it first.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
            .map_err(|e| lock_failed(format!("Failed to create lock file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed(format!("Failed to write lock file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| lock_failed(format!("Failed to sync lock file: {e}")))?;

        Ok(())
    }

    /// Replaces the lock file of a held lock atomically.
    async fn rewrite_lock_file(&self, lock_info: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let temp_path = self.lock_path.with_extension("lock.tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| lock_failed(format!("Failed to create temp lock file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| lock_failed(format!("Failed to write lock file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| lock_failed(format!("Failed to sync lock file: {e}")))?;

        fs::rename(&temp_path, &self.lock_path)
            .await
            .map_err(|e| lock_failed(format!("Failed to rename lock file: {e}")))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(lock_failed(format!("Failed to delete lock file: {e}"))),
        }
    }
}

fn corrupted(message: String) -> ConvergeError {
    StateError::Corrupted { message }.into()
}

fn lock_failed(message: String) -> ConvergeError {
    StateError::LockFailed { message }.into()
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn read(&self, address: &Address) -> Result<Option<StateRecord>> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_file().await?.unwrap_or_default());
        }
        Ok(guard.as_ref().and_then(|state| state.get(address).cloned()))
    }

    async fn write(&self, address: &Address, record: StateRecord) -> Result<()> {
        debug!("Recording {} as {}", address, record.status);
        let address = address.clone();
        self.update(move |state| {
            state.set(address, record);
            true
        })
        .await
    }

    async fn delete(&self, address: &Address) -> Result<()> {
        debug!("Removing {} from state", address);
        self.update(|state| state.remove(address).is_some()).await
    }

    async fn snapshot(&self) -> Result<BTreeMap<Address, StateRecord>> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_file().await?.unwrap_or_default());
        }
        Ok(guard
            .as_ref()
            .map(|state| state.resources.clone())
            .unwrap_or_default())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            warn!(
                "Taking over expired lock held by {} since {}",
                existing.holder, existing.acquired_at
            );
            self.delete_lock_file().await?;
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id, operation);
        if let Err(e) = self.create_lock_file(&lock_info).await {
            // Lost a race against another process.
            if let Some(winner) = self.read_lock_file().await? {
                return Err(StateError::LockedByOther {
                    holder: winner.holder,
                    since: winner.acquired_at.to_rfc3339(),
                }
                .into());
            }
            return Err(e);
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                debug!("Released state lock: {lock_id}");
            } else {
                warn!(
                    "Not releasing lock {}: held as {} by {}",
                    lock_id, existing.lock_id, existing.holder
                );
            }
        }
        Ok(())
    }

    async fn renew_lock(&self, lock_id: &str) -> Result<LockInfo> {
        let mut held = match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => existing,
            _ => return Err(lock_failed(format!("Lock {lock_id} is no longer held"))),
        };

        held.refresh();
        self.rewrite_lock_file(&held).await?;
        debug!("Renewed state lock: {} (expires in {}s)", lock_id, held.remaining_secs());
        Ok(held)
    }

    async fn force_unlock(&self) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            warn!("Force-unlocking state held by {}", existing.holder);
        }
        self.delete_lock_file().await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttributeValue, Attributes};
    use crate::state::ResourceStatus;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(value: &str) -> StateRecord {
        StateRecord::clean(
            Attributes::from([("prefix".to_string(), AttributeValue::string(value))]),
            Attributes::new(),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_write_persists_immediately() {
        let (store, temp) = create_test_store();
        let address = Address::new("subnet", "app");

        store
            .write(&address, record("10.0.1.0/24"))
            .await
            .expect("write");

        // A fresh store sees the write without any explicit flush.
        let reopened = LocalStateStore::with_base_dir(temp.path());
        let loaded = reopened
            .read(&address)
            .await
            .expect("read")
            .expect("record exists");
        let expected = record("10.0.1.0/24");
        assert_eq!(loaded.attributes, expected.attributes);
        assert_eq!(loaded.attributes_hash, expected.attributes_hash);
        assert!(!temp.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_missing_state() {
        let (store, _temp) = create_test_store();
        let result = store
            .read(&Address::new("network", "main"))
            .await
            .expect("read should not fail");
        assert!(result.is_none());
        assert!(store.snapshot().await.expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn test_delete_bumps_serial_once() {
        let (store, _temp) = create_test_store();
        let address = Address::new("network", "main");
        store.write(&address, record("a")).await.expect("write");
        store.delete(&address).await.expect("delete");
        store.delete(&address).await.expect("second delete is a no-op");

        let file = store.load_file().await.expect("load").expect("exists");
        assert_eq!(file.serial, 2);
        assert!(file.resources.is_empty());
    }

    #[tokio::test]
    async fn test_parallel_writes_do_not_interleave() {
        let (store, temp) = create_test_store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let address = Address::new("subnet", format!("s{i}"));
                store.write(&address, record(&i.to_string())).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("write");
        }

        let reopened = LocalStateStore::with_base_dir(temp.path());
        let file = reopened.load_file().await.expect("load").expect("exists");
        assert_eq!(file.resources.len(), 16);
        assert_eq!(file.serial, 16);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let (store, temp) = create_test_store();
        let mut file = StateFile::new();
        file.version = "0.1".to_string();
        std::fs::write(
            temp.path().join("state.json"),
            serde_json::to_string(&file).expect("serialize"),
        )
        .expect("write fixture");

        let err = store.snapshot().await.expect_err("old version");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");
        assert_eq!(
            store.lock_info().await.expect("lock info").map(|l| l.holder),
            Some("test-holder".to_string())
        );

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");
        assert!(store.lock_info().await.expect("lock info").is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict_and_force_unlock() {
        let (store, _temp) = create_test_store();

        let _first = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let err = store
            .acquire_lock("holder-2", "apply")
            .await
            .expect_err("second lock must fail");
        assert!(matches!(
            err,
            ConvergeError::State(StateError::LockedByOther { ref holder, .. }) if holder == "holder-1"
        ));

        store.force_unlock().await.expect("force unlock");
        store
            .acquire_lock("holder-2", "apply")
            .await
            .expect("lock after force unlock");
    }

    #[tokio::test]
    async fn test_renew_extends_only_the_held_lock() {
        let (store, _temp) = create_test_store();
        let lock = store.acquire_lock("holder-1", "apply").await.expect("lock");

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let renewed = store.renew_lock(&lock.lock_id).await.expect("renew");
        assert!(renewed.expires_at > lock.expires_at);
        assert_eq!(renewed.acquired_at, lock.acquired_at);
        assert_eq!(store.lock_info().await.expect("lock info"), Some(renewed));

        let err = store.renew_lock("someone-else").await.expect_err("foreign lock");
        assert!(matches!(err, ConvergeError::State(StateError::LockFailed { .. })));

        store.release_lock(&lock.lock_id).await.expect("release");
        assert!(store.renew_lock(&lock.lock_id).await.is_err());
    }

    #[tokio::test]
    async fn test_tainted_status_round_trips() {
        let (store, temp) = create_test_store();
        let address = Address::new("keyvault", "main");
        store
            .write(&address, record("x").marked(ResourceStatus::Tainted))
            .await
            .expect("write");

        let reopened = LocalStateStore::with_base_dir(temp.path());
        let loaded = reopened.read(&address).await.expect("read").expect("exists");
        assert_eq!(loaded.status, ResourceStatus::Tainted);
    }
}
