//! Reconciler driving a full run.
//!
//! This module ties the stages together: it builds and orders the
//! resource graph, refreshes untrusted records through the provider,
//! computes the plan and hands it to the executor, all while holding (and
//! renewing) the state lock. Planning alone never writes state.

use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{AttributeHasher, ProjectConfig};
use crate::error::{PlanError, Result};
use crate::graph::{Address, DependencyResolver, ExecutionOrder, ResourceGraph};
use crate::planner::{ApplyReport, CancelSignal, DiffEngine, Plan, PlanExecutor, PlanSummary};
use crate::provider::{Provider, ProviderContext};
use crate::state::{
    generate_holder_id, LockInfo, ResourceStatus, StateRecord, StateStore, LOCK_RENEW_SECS,
};

/// Exit code of a run where every action converged.
pub const EXIT_SUCCESS: u8 = 0;

/// Exit code of a run stopped before any action was evaluated.
pub const EXIT_HARD_FAILURE: u8 = 1;

/// Exit code of a run where some actions did not converge.
pub const EXIT_PARTIAL_FAILURE: u8 = 2;

/// Reconciler for one project.
pub struct Reconciler<'a> {
    /// Project configuration.
    project: &'a ProjectConfig,
    /// State store.
    store: &'a dyn StateStore,
    /// Provider performing the calls.
    provider: Arc<dyn Provider>,
    /// Explicit provider context.
    context: Arc<ProviderContext>,
    /// Lock holder identifier.
    holder: String,
    /// Interval between lock renewals during a run.
    lock_renewal: Duration,
}

/// Refresh results read from the provider but not yet persisted.
struct Refreshed {
    summary: RefreshSummary,
    /// New record per refreshed address, `None` when the resource is gone.
    changes: BTreeMap<Address, Option<StateRecord>>,
}

/// Outcome of refreshing untrusted records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    /// Records whose outputs were read again.
    pub refreshed: usize,
    /// Records removed because the resource no longer exists.
    pub removed: usize,
    /// Records left as they were because the read failed.
    pub failed: usize,
}

/// Result of an apply or destroy run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Counts of the executed plan.
    pub plan: PlanSummary,
    /// Fingerprint of the executed plan.
    pub fingerprint: String,
    /// Refresh performed before planning.
    pub refresh: RefreshSummary,
    /// Per-action outcomes.
    pub apply: ApplyReport,
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(
        project: &'a ProjectConfig,
        store: &'a dyn StateStore,
        provider: Arc<dyn Provider>,
        context: ProviderContext,
    ) -> Self {
        Self {
            project,
            store,
            provider,
            context: Arc::new(context),
            holder: generate_holder_id(),
            lock_renewal: Duration::from_secs(LOCK_RENEW_SECS),
        }
    }

    /// Sets how often the state lock is renewed while a run executes.
    #[must_use]
    pub const fn with_lock_renewal(mut self, interval: Duration) -> Self {
        self.lock_renewal = interval;
        self
    }

    /// Sets the lock holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Builds and orders the resource graph of the project.
    ///
    /// # Errors
    ///
    /// Returns a graph error for invalid addresses, duplicates, dangling
    /// references or cycles.
    pub fn graph(&self) -> Result<(ResourceGraph, ExecutionOrder)> {
        let graph = ResourceGraph::from_definitions(self.project.definitions()?)?;
        let order = DependencyResolver::new().resolve(&graph)?;
        debug!(
            "Resolved {} resources into {} independent branches",
            graph.len(),
            order.branch_count()
        );
        Ok((graph, order))
    }

    /// Computes the plan for the current definitions.
    ///
    /// Untrusted records are re-read from the provider, but the results
    /// only feed this plan: state is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere, or if the graph,
    /// the state or the plan is invalid.
    pub async fn plan(&self) -> Result<Plan> {
        self.plan_locked(false).await
    }

    /// Computes the plan destroying every recorded resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held elsewhere or state is invalid.
    pub async fn plan_destroy(&self) -> Result<Plan> {
        self.plan_locked(true).await
    }

    /// Plans and applies the current definitions.
    ///
    /// # Errors
    ///
    /// Returns an error if the run stops before any action is evaluated.
    /// A state write failing mid-run yields
    /// [`ConvergeError::ApplyInterrupted`](crate::error::ConvergeError::ApplyInterrupted).
    /// Action failures are reported in the returned [`RunReport`].
    pub async fn apply(&self, cancel: CancelSignal) -> Result<RunReport> {
        self.run("apply", false, None, cancel).await
    }

    /// Applies the current definitions if they still produce `confirmed`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::StalePlan`] without touching anything if the
    /// plan changed since it was shown. Otherwise same as
    /// [`Reconciler::apply`].
    pub async fn apply_confirmed(&self, confirmed: &Plan, cancel: CancelSignal) -> Result<RunReport> {
        self.run("apply", false, Some(&confirmed.fingerprint), cancel)
            .await
    }

    /// Destroys every recorded resource in reverse dependency order.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::apply`].
    pub async fn destroy(&self, cancel: CancelSignal) -> Result<RunReport> {
        self.run("destroy", true, None, cancel).await
    }

    /// Destroys every recorded resource if that still matches `confirmed`.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::apply_confirmed`].
    pub async fn destroy_confirmed(
        &self,
        confirmed: &Plan,
        cancel: CancelSignal,
    ) -> Result<RunReport> {
        self.run("destroy", true, Some(&confirmed.fingerprint), cancel)
            .await
    }

    /// Re-reads every record whose status is `unknown` and persists the result.
    ///
    /// A resource that no longer exists loses its record, so the next plan
    /// creates it again. A resource that still exists gets its outputs
    /// updated but keeps the `unknown` status, which forces a re-apply.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or written.
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        let refreshed = self.observe(&self.store.snapshot().await?).await;
        self.persist(refreshed.changes).await?;
        Ok(refreshed.summary)
    }

    /// Reads untrusted records from the provider without writing state.
    async fn observe(&self, records: &BTreeMap<Address, StateRecord>) -> Refreshed {
        let mut summary = RefreshSummary::default();
        let mut changes = BTreeMap::new();

        for (address, record) in records {
            if record.status != ResourceStatus::Unknown {
                continue;
            }

            match self
                .provider
                .read(&self.context, address, &record.known_values())
                .await
            {
                Ok(None) => {
                    info!("{} no longer exists", address);
                    changes.insert(address.clone(), None);
                    summary.removed += 1;
                }
                Ok(Some(outputs)) => {
                    debug!("Refreshed outputs of {}", address);
                    let refreshed = StateRecord {
                        outputs,
                        ..record.marked(ResourceStatus::Unknown)
                    };
                    changes.insert(address.clone(), Some(refreshed));
                    summary.refreshed += 1;
                }
                Err(e) => {
                    warn!("Could not refresh {}: {}", address, e);
                    summary.failed += 1;
                }
            }
        }

        Refreshed { summary, changes }
    }

    async fn persist(&self, changes: BTreeMap<Address, Option<StateRecord>>) -> Result<()> {
        for (address, change) in changes {
            match change {
                Some(record) => self.store.write(&address, record).await?,
                None => {
                    info!("Dropping the record of {}", address);
                    self.store.delete(&address).await?;
                }
            }
        }
        Ok(())
    }

    async fn plan_locked(&self, destroy: bool) -> Result<Plan> {
        let lock = self.store.acquire_lock(&self.holder, "plan").await?;
        let result = self.while_locked(&lock, self.plan_unlocked(destroy)).await;
        self.release(&lock).await;
        result.map(|(plan, _)| plan)
    }

    async fn run(
        &self,
        operation: &str,
        destroy: bool,
        confirmed: Option<&str>,
        cancel: CancelSignal,
    ) -> Result<RunReport> {
        let lock = self.store.acquire_lock(&self.holder, operation).await?;
        info!(
            "Starting {} with {} state and {} provider (run {})",
            operation,
            self.store.backend_type(),
            self.provider.name(),
            self.context.run_id
        );
        let result = self
            .while_locked(&lock, self.run_unlocked(destroy, confirmed, cancel))
            .await;
        self.release(&lock).await;
        result
    }

    /// Drives `work` to completion while renewing `lock` in the background.
    async fn while_locked<T>(&self, lock: &LockInfo, work: impl Future<Output = T>) -> T {
        let mut work = std::pin::pin!(work);
        let mut renewal = std::pin::pin!(self.keep_lock(lock));
        let mut renewing = true;

        loop {
            tokio::select! {
                output = &mut work => return output,
                () = &mut renewal, if renewing => renewing = false,
            }
        }
    }

    /// Renews `lock` periodically. Returns only if a renewal fails.
    async fn keep_lock(&self, lock: &LockInfo) {
        loop {
            tokio::time::sleep(self.lock_renewal).await;
            match self.store.renew_lock(&lock.lock_id).await {
                Ok(renewed) => debug!(
                    "Renewed state lock {} until {}",
                    renewed.lock_id, renewed.expires_at
                ),
                Err(e) => {
                    error!("Could not renew state lock {}: {}", lock.lock_id, e);
                    return;
                }
            }
        }
    }

    async fn run_unlocked(
        &self,
        destroy: bool,
        confirmed: Option<&str>,
        cancel: CancelSignal,
    ) -> Result<RunReport> {
        let (plan, refreshed) = self.plan_unlocked(destroy).await?;
        if let Some(confirmed) = confirmed
            && confirmed != plan.fingerprint
        {
            return Err(PlanError::StalePlan {
                confirmed: AttributeHasher::short_hash(confirmed),
                current: AttributeHasher::short_hash(&plan.fingerprint),
            }
            .into());
        }

        let refresh = refreshed.summary;
        self.persist(refreshed.changes).await?;
        let summary = plan.summary();
        let fingerprint = plan.fingerprint.clone();

        if plan.has_changes() {
            info!(
                "Plan {}: {} to create, {} to update, {} to replace, {} to destroy",
                AttributeHasher::short_hash(&fingerprint),
                summary.create,
                summary.update,
                summary.replace,
                summary.destroy
            );
        } else {
            info!("No changes. Infrastructure matches the definitions.");
        }

        let settings = &self.project.settings;
        let executor = PlanExecutor::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.context),
            self.store,
        );
        let apply = executor
            .with_concurrency(settings.concurrency)
            .with_retry(settings.retry_policy())
            .with_call_timeout(settings.call_timeout())
            .with_grace_period(settings.grace_period())
            .with_cancellation(cancel)
            .execute(plan)
            .await?;

        Ok(RunReport {
            plan: summary,
            fingerprint,
            refresh,
            apply,
        })
    }

    async fn plan_unlocked(&self, destroy: bool) -> Result<(Plan, Refreshed)> {
        let (graph, order) = if destroy {
            let graph = ResourceGraph::default();
            let order = DependencyResolver::new().resolve(&graph)?;
            (graph, order)
        } else {
            self.graph()?
        };

        let mut state = self.store.snapshot().await?;
        let refreshed = self.observe(&state).await;
        for (address, change) in &refreshed.changes {
            match change {
                Some(record) => state.insert(address.clone(), record.clone()),
                None => state.remove(address),
            };
        }

        let diff = DiffEngine::new(self.project.immutability_policy())
            .compute_diff(&graph, &order, &state)?;
        let plan = Plan::from_diff(diff, &graph, &order)?;

        Ok((plan, refreshed))
    }

    async fn release(&self, lock: &LockInfo) {
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {}", lock.lock_id, e);
        }
    }
}

impl RunReport {
    /// Returns true if every action converged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.apply.is_success()
    }

    /// Returns the process exit code for this run.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::{ConvergeError, StateError};
    use crate::graph::{Address, AttributeValue};
    use crate::planner::{cancellation, ActionType, ChangeReason};
    use crate::provider::SimulatedProvider;
    use crate::state::{MemoryStateStore, LOCK_EXPIRY_SECS};

    fn project(space: &str) -> ProjectConfig {
        let yaml = format!(
            r#"
settings:
  retry: {{ max_attempts: 2, base_delay_ms: 1, max_delay_ms: 5 }}
policies:
  network:
    immutable: [address_space]
resources:
  - type: network
    name: main
    attributes:
      address_space: "{space}"
  - type: subnet
    name: app
    attributes:
      vnet: {{ $ref: network.main.id }}
      prefix: "10.0.1.0/24"
  - type: keyvault
    name: main
"#
        );
        ConfigParser::new().parse_yaml(&yaml, None).expect("project")
    }

    fn network() -> Address {
        Address::new("network", "main")
    }

    fn subnet() -> Address {
        Address::new("subnet", "app")
    }

    #[tokio::test]
    async fn test_apply_converges_and_is_idempotent() {
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new());
        let config = project("10.0.0.0/16");
        let reconciler = Reconciler::new(&config, &store, provider.clone(), ProviderContext::new());

        let report = reconciler.apply(CancelSignal::never()).await.expect("apply");
        assert_eq!(report.plan.create, 3);
        assert_eq!(report.exit_code(), EXIT_SUCCESS);
        assert_eq!(provider.resource_count(), 3);

        let second = reconciler.plan().await.expect("plan");
        assert!(!second.has_changes());
        assert!(store.lock_info().await.expect("lock").is_none());
    }

    #[tokio::test]
    async fn test_immutable_change_replaces_and_updates_dependent() {
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new());
        let before = project("10.0.0.0/16");
        Reconciler::new(&before, &store, provider.clone(), ProviderContext::new())
            .apply(CancelSignal::never())
            .await
            .expect("initial apply");
        let old_id = store.read(&network()).await.expect("read").expect("network").outputs["id"].clone();

        let after = project("10.1.0.0/16");
        let reconciler = Reconciler::new(&after, &store, provider, ProviderContext::new());
        let report = reconciler.apply(CancelSignal::never()).await.expect("apply");

        assert_eq!((report.plan.replace, report.plan.update), (1, 1));
        assert!(report.is_success());

        let net = store.read(&network()).await.expect("read").expect("network");
        let sub = store.read(&subnet()).await.expect("read").expect("subnet");
        assert_ne!(net.outputs["id"], old_id);
        assert_eq!(sub.attributes["vnet"], net.outputs["id"]);
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new());
        let config = project("10.0.0.0/16");
        let reconciler = Reconciler::new(&config, &store, provider.clone(), ProviderContext::new());
        reconciler.apply(CancelSignal::never()).await.expect("apply");

        let plan = reconciler.plan_destroy().await.expect("destroy plan");
        let sub = plan.position(&subnet(), ActionType::Destroy).expect("subnet");
        let net = plan.position(&network(), ActionType::Destroy).expect("network");
        assert!(sub < net);

        let report = reconciler.destroy(CancelSignal::never()).await.expect("destroy");
        assert_eq!(report.plan.destroy, 3);
        assert!(store.snapshot().await.expect("snapshot").is_empty());
        assert_eq!(provider.resource_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_failure_exit_code() {
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new().fail_permanently(network()));
        let config = project("10.0.0.0/16");
        let reconciler = Reconciler::new(&config, &store, provider, ProviderContext::new());

        let report = reconciler.apply(CancelSignal::never()).await.expect("apply");
        assert_eq!(report.exit_code(), EXIT_PARTIAL_FAILURE);
        assert_eq!(report.apply.succeeded(), 1);
        assert_eq!(report.apply.blocked(), 1);
    }

    #[tokio::test]
    async fn test_refresh_of_unknown_records() {
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new());
        let config = project("10.0.0.0/16");
        let reconciler = Reconciler::new(&config, &store, provider.clone(), ProviderContext::new());
        reconciler.apply(CancelSignal::never()).await.expect("apply");

        for address in [network(), Address::new("keyvault", "main")] {
            let record = store.read(&address).await.expect("read").expect("record");
            store
                .write(&address, record.marked(ResourceStatus::Unknown))
                .await
                .expect("mark");
        }
        provider.remove_out_of_band(&network());

        let summary = reconciler.refresh().await.expect("refresh");
        assert_eq!(summary, RefreshSummary { refreshed: 1, removed: 1, failed: 0 });

        let plan = reconciler.plan().await.expect("plan");
        let net = plan.position(&network(), ActionType::Create).expect("network recreated");
        assert_eq!(plan.actions[net].reason, ChangeReason::NotInState);
        let kv = plan
            .position(&Address::new("keyvault", "main"), ActionType::Update)
            .expect("keyvault re-applied");
        assert_eq!(plan.actions[kv].reason, ChangeReason::Refresh);
    }

    #[tokio::test]
    async fn test_locked_state_aborts_before_apply() {
        let store = MemoryStateStore::new();
        store.acquire_lock("someone-else", "apply").await.expect("lock");
        let config = project("10.0.0.0/16");
        let provider = Arc::new(SimulatedProvider::new());
        let reconciler = Reconciler::new(&config, &store, provider.clone(), ProviderContext::new());

        let err = reconciler.apply(CancelSignal::never()).await.expect_err("locked");
        assert!(matches!(err, ConvergeError::State(StateError::LockedByOther { .. })));
        assert!(err.aborts_before_apply());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_aborts_before_apply() {
        let mut config = project("10.0.0.0/16");
        config.resources[0].attributes.insert(
            "subnet".to_string(),
            AttributeValue::Reference(subnet().attr("id")),
        );
        let store = MemoryStateStore::new();
        let reconciler = Reconciler::new(
            &config,
            &store,
            Arc::new(SimulatedProvider::new()),
            ProviderContext::new(),
        );

        let err = reconciler.apply(CancelSignal::never()).await.expect_err("cycle");
        assert!(err.aborts_before_apply());
        assert!(store.lock_info().await.expect("lock").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_state_untouched() {
        let store = MemoryStateStore::new();
        let config = project("10.0.0.0/16");
        let reconciler = Reconciler::new(
            &config,
            &store,
            Arc::new(SimulatedProvider::new()),
            ProviderContext::new(),
        );
        let (handle, signal) = cancellation();
        handle.cancel();

        let report = reconciler.apply(signal).await.expect("apply");
        assert_eq!(report.apply.cancelled_count(), 3);
        assert_eq!(report.exit_code(), EXIT_PARTIAL_FAILURE);
        assert!(store.snapshot().await.expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn test_plan_reads_refresh_without_writing_state() {
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new());
        let config = project("10.0.0.0/16");
        let reconciler = Reconciler::new(&config, &store, provider.clone(), ProviderContext::new());
        reconciler.apply(CancelSignal::never()).await.expect("apply");

        let keyvault = Address::new("keyvault", "main");
        for address in [network(), keyvault.clone()] {
            let record = store.read(&address).await.expect("read").expect("record");
            store
                .write(&address, record.marked(ResourceStatus::Unknown))
                .await
                .expect("mark");
        }
        provider.remove_out_of_band(&network());
        let before = store.snapshot().await.expect("snapshot");
        let serial = store.serial().await;

        let plan = reconciler.plan().await.expect("plan");
        assert!(plan.position(&network(), ActionType::Create).is_some());
        assert!(plan.position(&keyvault, ActionType::Update).is_some());
        assert_eq!(store.snapshot().await.expect("snapshot"), before);
        assert_eq!(store.serial().await, serial);

        let report = reconciler.apply(CancelSignal::never()).await.expect("apply");
        assert_eq!(report.refresh, RefreshSummary { refreshed: 1, removed: 1, failed: 0 });
        assert!(report.is_success());
        assert!(store.read(&network()).await.expect("read").expect("network").is_clean());
    }

    #[tokio::test]
    async fn test_lock_is_renewed_during_a_run() {
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new().with_latency(Duration::from_millis(150)));
        let config = project("10.0.0.0/16");
        let reconciler = Reconciler::new(&config, &store, provider, ProviderContext::new())
            .with_lock_renewal(Duration::from_millis(20));

        let (report, lock) = tokio::join!(reconciler.apply(CancelSignal::never()), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store.lock_info().await
        });

        assert!(report.expect("apply").is_success());
        let lock = lock.expect("lock info").expect("held during the run");
        assert!(lock.expires_at - lock.acquired_at > chrono::Duration::seconds(LOCK_EXPIRY_SECS));
        assert!(store.lock_info().await.expect("lock").is_none());
    }

    #[tokio::test]
    async fn test_confirmed_plan_must_still_match() {
        let store = MemoryStateStore::new();
        let provider = Arc::new(SimulatedProvider::new());
        let shown = project("10.0.0.0/16");
        let confirmed = Reconciler::new(&shown, &store, provider.clone(), ProviderContext::new())
            .plan()
            .await
            .expect("plan");

        let edited = project("10.1.0.0/16");
        let reconciler = Reconciler::new(&edited, &store, provider.clone(), ProviderContext::new());
        let err = reconciler
            .apply_confirmed(&confirmed, CancelSignal::never())
            .await
            .expect_err("stale");
        assert!(matches!(err, ConvergeError::Plan(PlanError::StalePlan { .. })));
        assert!(err.aborts_before_apply());
        assert!(provider.calls().is_empty());

        let current = reconciler.plan().await.expect("plan");
        let report = reconciler
            .apply_confirmed(&current, CancelSignal::never())
            .await
            .expect("apply");
        assert!(report.is_success());
        assert_eq!(provider.resource_count(), 3);
    }
}
