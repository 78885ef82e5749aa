//! In-process provider used for local runs and tests.
//!
//! Resources live in memory. Failures and latency can be injected per
//! address, and every call is logged so tests can assert ordering.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::ActionError;
use crate::graph::{Address, AttributeValue, Attributes};

use super::{Provider, ProviderContext};

/// A call received by the simulated provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    /// `create` was called.
    Create(Address),
    /// `update` was called.
    Update(Address),
    /// `delete` was called.
    Delete(Address),
    /// `read` was called.
    Read(Address),
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Permanent,
    Transient { remaining: u32 },
}

/// Provider keeping resources in memory.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    resources: Mutex<BTreeMap<Address, Attributes>>,
    failures: Mutex<HashMap<Address, Failure>>,
    missing: Mutex<HashSet<Address>>,
    calls: Mutex<Vec<ProviderCall>>,
    latency: Duration,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedProvider {
    /// Creates a provider with no resources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Makes every call for `address` fail permanently.
    #[must_use]
    pub fn fail_permanently(self, address: Address) -> Self {
        locked(&self.failures).insert(address, Failure::Permanent);
        self
    }

    /// Makes the next `times` calls for `address` fail transiently.
    #[must_use]
    pub fn fail_transiently(self, address: Address, times: u32) -> Self {
        locked(&self.failures).insert(address, Failure::Transient { remaining: times });
        self
    }

    /// Simulates a resource deleted outside of the engine.
    pub fn remove_out_of_band(&self, address: &Address) {
        locked(&self.resources).remove(address);
        locked(&self.missing).insert(address.clone());
    }

    /// Returns every call received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        locked(&self.calls).clone()
    }

    /// Returns the current attributes of a resource.
    #[must_use]
    pub fn resource(&self, address: &Address) -> Option<Attributes> {
        locked(&self.resources).get(address).cloned()
    }

    /// Returns the number of live resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        locked(&self.resources).len()
    }

    async fn begin(&self, call: ProviderCall) -> Result<(), ActionError> {
        let address = match &call {
            ProviderCall::Create(a)
            | ProviderCall::Update(a)
            | ProviderCall::Delete(a)
            | ProviderCall::Read(a) => a.clone(),
        };
        locked(&self.calls).push(call);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut failures = locked(&self.failures);
        match failures.get_mut(&address) {
            Some(Failure::Permanent) => Err(ActionError::permanent(format!(
                "simulated rejection of {address}"
            ))),
            Some(Failure::Transient { remaining }) if *remaining > 0 => {
                *remaining -= 1;
                Err(ActionError::transient(format!("simulated timeout for {address}")))
            }
            _ => Ok(()),
        }
    }
}

fn new_id(address: &Address) -> AttributeValue {
    let suffix = Uuid::new_v4().simple().to_string();
    AttributeValue::String(format!(
        "/{}/{}/{}",
        address.resource_type(),
        address.name(),
        &suffix[..8]
    ))
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn create(
        &self,
        _ctx: &ProviderContext,
        address: &Address,
        attributes: &Attributes,
    ) -> Result<Attributes, ActionError> {
        self.begin(ProviderCall::Create(address.clone())).await?;

        let mut outputs = attributes.clone();
        outputs.insert("id".to_string(), new_id(address));
        locked(&self.resources).insert(address.clone(), outputs.clone());
        locked(&self.missing).remove(address);
        debug!("Simulated create of {}", address);
        Ok(outputs)
    }

    async fn update(
        &self,
        _ctx: &ProviderContext,
        address: &Address,
        prior: &Attributes,
        attributes: &Attributes,
    ) -> Result<Attributes, ActionError> {
        self.begin(ProviderCall::Update(address.clone())).await?;

        let mut resources = locked(&self.resources);
        let id = resources
            .get(address)
            .and_then(|r| r.get("id"))
            .or_else(|| prior.get("id"))
            .cloned()
            .unwrap_or_else(|| new_id(address));
        let mut outputs = attributes.clone();
        outputs.insert("id".to_string(), id);
        resources.insert(address.clone(), outputs.clone());
        debug!("Simulated update of {}", address);
        Ok(outputs)
    }

    async fn delete(
        &self,
        _ctx: &ProviderContext,
        address: &Address,
        _prior: &Attributes,
    ) -> Result<(), ActionError> {
        self.begin(ProviderCall::Delete(address.clone())).await?;

        locked(&self.resources).remove(address);
        debug!("Simulated delete of {}", address);
        Ok(())
    }

    async fn read(
        &self,
        _ctx: &ProviderContext,
        address: &Address,
        prior: &Attributes,
    ) -> Result<Option<Attributes>, ActionError> {
        self.begin(ProviderCall::Read(address.clone())).await?;

        if locked(&self.missing).contains(address) {
            return Ok(None);
        }
        // Resources created by an earlier process are not held in memory,
        // so the recorded values stand in for them.
        Ok(Some(
            locked(&self.resources)
                .get(address)
                .cloned()
                .unwrap_or_else(|| prior.clone()),
        ))
    }
}
