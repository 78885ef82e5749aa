//! Error types for the Converge reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, planning, action execution, and
//! state management.

use std::path::PathBuf;
use thiserror::Error;

use crate::graph::{Address, Reference};
use crate::planner::ApplyReport;

/// The main error type for the Converge engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Action execution errors.
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// State could not be written after actions were carried out.
    ///
    /// No new action was started once the write failed; in-flight actions
    /// were settled before the run stopped.
    #[error("Apply interrupted: {source}")]
    ApplyInterrupted {
        /// Outcomes of the actions evaluated before the run stopped.
        report: Box<ApplyReport>,
        /// The failure that stopped the run.
        source: Box<ConvergeError>,
    },

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The project file was not found.
    #[error("Project file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The project file could not be parsed.
    #[error("Failed to parse project file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing or malformed.
    #[error("Missing or invalid environment variable: {name}")]
    MissingEnvVar {
        /// Name of the variable.
        name: String,
    },
}

/// Errors raised while building or ordering the resource graph.
///
/// All of them are fatal: the run stops before any action is evaluated.
#[derive(Debug, Error)]
pub enum GraphError {
    /// An address or reference string is malformed.
    #[error("Invalid address '{value}': {reason}")]
    InvalidAddress {
        /// The offending text.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Two definitions share the same address.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: Address,
    },

    /// A reference points to an address that is not defined.
    #[error("Resource {from} references undefined resource {}", reference.address)]
    DanglingReference {
        /// The resource holding the reference.
        from: Address,
        /// The dangling reference.
        reference: Reference,
    },

    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", format_cycle(cycle))]
    CycleDetected {
        /// Addresses along the cycle, first address repeated at the end.
        cycle: Vec<Address>,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A reference could not be resolved to a planned or last-known value.
    #[error("Cannot resolve {reference} referenced by {from}: attribute is neither declared nor recorded")]
    UnresolvableReference {
        /// The resource holding the reference.
        from: Address,
        /// The unresolvable reference.
        reference: Reference,
    },

    /// Recorded dependencies between resources to destroy form a cycle.
    #[error("Destroy ordering cycle between: {}", format_cycle(addresses))]
    DestroyOrderCycle {
        /// Addresses involved in the inconsistent ordering.
        addresses: Vec<Address>,
    },

    /// The plan changed between confirmation and execution.
    #[error("Plan {confirmed} was confirmed but the current plan is {current}; review it again")]
    StalePlan {
        /// Short fingerprint of the confirmed plan.
        confirmed: String,
        /// Short fingerprint of the plan computed at execution time.
        current: String,
    },
}

/// Errors returned by provider calls for a single action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    /// Network or timeout class failure, safe to retry.
    #[error("Transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// Validation or authorization class failure, never retried.
    #[error("Permanent provider failure: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },

    /// A transient failure persisted across every attempt.
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last transient error seen.
        last: String,
    },

    /// The run was cancelled before the action could be confirmed.
    #[error("Cancelled before completion was confirmed")]
    Cancelled,
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be written.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Result type alias for Converge operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

fn format_cycle(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error stops a run before any action is evaluated.
    ///
    /// [`ConvergeError::ApplyInterrupted`] is the only error raised once
    /// provider calls have started, and it is never a hard abort.
    #[must_use]
    pub const fn aborts_before_apply(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Graph(_) | Self::Plan(_) | Self::State(_)
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl ActionError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Returns true if the executor should retry after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the provider may or may not have carried out the call.
    ///
    /// Permanent errors are rejections, so nothing changed remotely.
    #[must_use]
    pub const fn is_unconfirmed(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::RetriesExhausted { .. } | Self::Cancelled
        )
    }
}

impl StateError {
    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write_failed(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_classes() {
        assert!(ActionError::transient("timeout").is_retryable());
        assert!(!ActionError::permanent("forbidden").is_retryable());
        assert!(!ActionError::permanent("forbidden").is_unconfirmed());
        assert!(ActionError::Cancelled.is_unconfirmed());
    }

    #[test]
    fn test_interrupted_apply_is_not_a_hard_abort() {
        let source: ConvergeError = StateError::write_failed("disk full").into();
        assert!(source.aborts_before_apply());

        let err = ConvergeError::ApplyInterrupted {
            report: Box::new(ApplyReport {
                outcomes: Vec::new(),
                cancelled: false,
                duration_ms: 0,
            }),
            source: Box::new(source),
        };
        assert!(!err.aborts_before_apply());
        assert_eq!(
            err.to_string(),
            "Apply interrupted: State error: Failed to write state: disk full"
        );
    }

    #[test]
    fn test_cycle_message_lists_addresses() {
        let a = Address::new("net", "a");
        let b = Address::new("net", "b");
        let err = GraphError::CycleDetected {
            cycle: vec![a.clone(), b, a],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle detected: net.a -> net.b -> net.a"
        );
    }

    #[test]
    fn test_hard_failures_abort_before_apply() {
        let graph: ConvergeError = GraphError::DuplicateAddress {
            address: Address::new("kv", "main"),
        }
        .into();
        assert!(graph.aborts_before_apply());

        let action: ConvergeError = ActionError::permanent("denied").into();
        assert!(!action.aborts_before_apply());
    }
}
