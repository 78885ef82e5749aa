//! Provider abstraction.
//!
//! A [`Provider`] performs the actual API calls for one kind of
//! infrastructure. Credentials and provider settings are never read from
//! ambient state inside a call: they arrive through an explicit
//! [`ProviderContext`] built once per run.

mod simulated;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::ActionError;
use crate::graph::{Address, Attributes};

pub use simulated::{ProviderCall, SimulatedProvider};

/// Prefix of environment variables copied into the provider context.
pub const PROVIDER_ENV_PREFIX: &str = "CONVERGE_PROVIDER_";

/// Variable name suffixes treated as secrets.
const SECRET_SUFFIXES: [&str; 4] = ["_KEY", "_SECRET", "_TOKEN", "_PASSWORD"];

/// Performs API calls against real (or simulated) infrastructure.
///
/// Errors must be classified: [`ActionError::Transient`] for network or
/// timeout class failures (retried), [`ActionError::Permanent`] for
/// validation or authorization failures (never retried).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Creates a resource and returns its outputs.
    async fn create(
        &self,
        ctx: &ProviderContext,
        address: &Address,
        attributes: &Attributes,
    ) -> Result<Attributes, ActionError>;

    /// Updates a resource in place and returns its outputs.
    async fn update(
        &self,
        ctx: &ProviderContext,
        address: &Address,
        prior: &Attributes,
        attributes: &Attributes,
    ) -> Result<Attributes, ActionError>;

    /// Deletes a resource. Deleting a resource that no longer exists succeeds.
    async fn delete(
        &self,
        ctx: &ProviderContext,
        address: &Address,
        prior: &Attributes,
    ) -> Result<(), ActionError>;

    /// Reads the current outputs of a resource, `None` if it does not exist.
    async fn read(
        &self,
        ctx: &ProviderContext,
        address: &Address,
        prior: &Attributes,
    ) -> Result<Option<Attributes>, ActionError>;
}

/// Explicit per-run provider configuration.
#[derive(Clone, Default)]
pub struct ProviderContext {
    /// Identifier of the current run.
    pub run_id: Uuid,
    credentials: BTreeMap<String, String>,
    settings: BTreeMap<String, String>,
}

impl ProviderContext {
    /// Creates an empty context for a new run.
    #[must_use]
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            ..Self::default()
        }
    }

    /// Builds a context from `CONVERGE_PROVIDER_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Builds a context from `(name, value)` pairs, keeping only
    /// `CONVERGE_PROVIDER_*` names. Names ending in `_KEY`, `_SECRET`,
    /// `_TOKEN` or `_PASSWORD` are stored as credentials.
    #[must_use]
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut context = Self::new();
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(PROVIDER_ENV_PREFIX) else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            let is_secret = SECRET_SUFFIXES.iter().any(|suffix| key.ends_with(suffix));
            let key = key.to_lowercase();
            if is_secret {
                context.credentials.insert(key, value);
            } else {
                context.settings.insert(key, value);
            }
        }
        context
    }

    /// Adds a credential.
    #[must_use]
    pub fn with_credential(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(name.into(), value.into());
        self
    }

    /// Adds a setting.
    #[must_use]
    pub fn with_setting(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(name.into(), value.into());
        self
    }

    /// Returns a credential by lower-case name.
    #[must_use]
    pub fn credential(&self, name: &str) -> Option<&str> {
        self.credentials.get(name).map(String::as_str)
    }

    /// Returns a setting by lower-case name.
    #[must_use]
    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(String::as_str)
    }
}

impl fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderContext")
            .field("run_id", &self.run_id)
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_from_vars_splits_secrets() {
        let context = ProviderContext::from_vars([
            ("CONVERGE_PROVIDER_REGION".to_string(), "westeurope".to_string()),
            ("CONVERGE_PROVIDER_API_TOKEN".to_string(), "s3cr3t".to_string()),
            ("CONVERGE_CONCURRENCY".to_string(), "8".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]);

        assert_eq!(context.setting("region"), Some("westeurope"));
        assert_eq!(context.credential("api_token"), Some("s3cr3t"));
        assert!(context.setting("api_token").is_none());
        assert!(context.setting("concurrency").is_none());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let context = ProviderContext::new().with_credential("api_token", "s3cr3t");
        let rendered = format!("{context:?}");
        assert!(rendered.contains("api_token"));
        assert!(!rendered.contains("s3cr3t"));
    }
}
