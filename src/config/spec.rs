//! Configuration specification types for the project file.
//!
//! This module defines the structs that map to `converge.yaml`: run
//! settings, per-type change policies and the desired resource definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

use crate::error::GraphError;
use crate::graph::{Address, Attributes, ResourceDefinition};
use crate::planner::{ImmutabilityPolicy, ResourcePolicy, RetryPolicy};
use crate::state::STATE_DIR;

/// The root structure of a project file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Run settings.
    #[serde(default)]
    pub settings: Settings,
    /// Change policies keyed by resource type, `default` applying to all others.
    #[serde(default)]
    pub policies: BTreeMap<String, ResourcePolicy>,
    /// Desired resources.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// One desired resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    /// Resource type.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource name, unique within its type.
    pub name: String,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: Attributes,
}

/// Run settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Maximum number of concurrently running actions.
    #[validate(range(min = 1, max = 256))]
    pub concurrency: usize,
    /// Bound on a single provider call, in seconds.
    #[validate(range(min = 1))]
    pub call_timeout_secs: u64,
    /// Time given to in-flight actions after cancellation, in seconds.
    pub grace_period_secs: u64,
    /// Retry settings for transient failures.
    #[validate(nested)]
    pub retry: RetrySettings,
    /// State storage settings.
    pub state: StateSettings,
}

/// Retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Total attempts including the first one.
    #[validate(range(min = 1, max = 32))]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

/// State storage settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StateSettings {
    /// Path of the state file, relative to the project file.
    pub path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            call_timeout_secs: 300,
            grace_period_secs: 30,
            retry: RetrySettings::default(),
            state: StateSettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: u64::try_from(policy.base_delay.as_millis()).unwrap_or(u64::MAX),
            max_delay_ms: u64::try_from(policy.max_delay.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(STATE_DIR).join("state.json"),
        }
    }
}

impl Settings {
    /// Returns the retry policy described by these settings.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Returns the per-call timeout.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Returns the cancellation grace period.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl ResourceSpec {
    /// Returns the validated address of this resource.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidAddress`] if the type or name is malformed.
    pub fn address(&self) -> Result<Address, GraphError> {
        Address::try_new(&self.resource_type, &self.name)
    }
}

impl ProjectConfig {
    /// Returns the immutability policy built from the `policies` section.
    #[must_use]
    pub fn immutability_policy(&self) -> ImmutabilityPolicy {
        ImmutabilityPolicy::from_map(self.policies.clone())
    }

    /// Converts the resource section into graph definitions.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidAddress`] for a malformed type or name.
    pub fn definitions(&self) -> Result<Vec<ResourceDefinition>, GraphError> {
        self.resources
            .iter()
            .map(|spec| Ok(ResourceDefinition::new(spec.address()?, spec.attributes.clone())))
            .collect()
    }

    /// Returns the number of desired resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}
