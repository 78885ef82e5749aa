//! State management module for Converge.
//!
//! This module provides persistent state storage for applied resources:
//! one [`StateRecord`] per address, written immediately after each action,
//! plus an advisory lock serializing runs against the same state.

mod local;
mod lock;
mod memory;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS, LOCK_RENEW_SECS};
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{ResourceStatus, StateFile, StateRecord, STATE_VERSION};
