//! Plan executor for applying plans.
//!
//! Actions run on a bounded pool of tokio tasks. An action starts once every
//! action it depends on has succeeded; a failure blocks its transitive
//! dependents while independent branches keep going. State is written after
//! every settled action so an interrupted run never loses applied work. If a
//! state write fails, no new action starts and the in-flight ones are
//! settled before the run stops.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{ActionError, ConvergeError, Result};
use crate::graph::{resolve_attributes, Address, AttributeValue, Attributes, Reference};
use crate::provider::{Provider, ProviderContext};
use crate::state::{ResourceStatus, StateRecord, StateStore};

use super::plan::{ActionType, Plan};
use super::retry::RetryPolicy;

/// Default number of concurrently running actions.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Creates a linked cancel handle and signal.
#[must_use]
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Requests cancellation of a running apply.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Signals cancellation. Calling it again has no effect.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes cancellation requests.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let fired = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
        if fired.is_err() {
            // The handle is gone, so nothing can cancel anymore.
            std::future::pending::<()>().await;
        }
    }
}

/// Executor for plans.
pub struct PlanExecutor<'a> {
    provider: Arc<dyn Provider>,
    context: Arc<ProviderContext>,
    store: &'a dyn StateStore,
    concurrency: usize,
    retry: RetryPolicy,
    call_timeout: Duration,
    grace_period: Duration,
    cancel: CancelSignal,
}

/// Final status of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    /// The provider confirmed the change.
    Succeeded,
    /// Nothing had to be done.
    Unchanged,
    /// The provider rejected the change; state is untouched.
    Failed {
        /// Provider error.
        error: String,
    },
    /// Not attempted because a dependency did not succeed.
    Blocked {
        /// Address whose action failed first.
        by: Address,
    },
    /// Never started because the run was cancelled or interrupted.
    Cancelled,
    /// The outcome could not be confirmed; the record was tainted or marked unknown.
    Unconfirmed {
        /// Last error seen.
        error: String,
    },
}

/// Outcome of one action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    /// Position in the plan.
    pub index: usize,
    /// Resource address.
    pub address: Address,
    /// Action type.
    #[serde(rename = "action")]
    pub action_type: ActionType,
    /// True when the action is half of a replacement.
    pub replacement: bool,
    /// Final status.
    #[serde(flatten)]
    pub status: ActionStatus,
    /// Provider attempts made.
    pub attempts: u32,
    /// Status written to state, `None` when the record was not written.
    pub recorded: Option<ResourceStatus>,
}

/// Result of executing a whole plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Per-action outcomes in plan order.
    pub outcomes: Vec<ActionOutcome>,
    /// True if cancellation was requested during the run.
    pub cancelled: bool,
    /// Wall time of the run in milliseconds.
    pub duration_ms: u64,
}

struct Job {
    address: Address,
    action_type: ActionType,
    attributes: Attributes,
    prior: Attributes,
    provider: Arc<dyn Provider>,
    context: Arc<ProviderContext>,
    retry: RetryPolicy,
    call_timeout: Duration,
    cancel: CancelSignal,
}

struct TaskResult {
    attempts: u32,
    result: std::result::Result<Option<Attributes>, ActionError>,
}

struct InFlight {
    index: usize,
    attributes: Attributes,
}

struct Settled {
    status: ActionStatus,
    attempts: u32,
    recorded: Option<ResourceStatus>,
}

/// Scheduling bookkeeping for one execution.
struct Run {
    dependents: Vec<Vec<usize>>,
    remaining: Vec<usize>,
    ready: BTreeSet<usize>,
    records: BTreeMap<Address, StateRecord>,
    settled: Vec<Option<Settled>>,
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(
        provider: Arc<dyn Provider>,
        context: Arc<ProviderContext>,
        store: &'a dyn StateStore,
    ) -> Self {
        Self {
            provider,
            context,
            store,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(300),
            grace_period: Duration::from_secs(30),
            cancel: CancelSignal::never(),
        }
    }

    /// Sets the maximum number of concurrently running actions.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the retry policy for transient failures.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Bounds every single provider call.
    #[must_use]
    pub const fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Sets how long in-flight actions may run after cancellation.
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Observes `signal` for cancellation.
    #[must_use]
    pub fn with_cancellation(mut self, signal: CancelSignal) -> Self {
        self.cancel = signal;
        self
    }

    /// Executes a plan.
    ///
    /// Action failures do not make this method fail: they are reported per
    /// address in the returned [`ApplyReport`].
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read before the first action.
    /// A failed state write afterwards yields
    /// [`ConvergeError::ApplyInterrupted`] carrying the partial report.
    pub async fn execute(&self, plan: Plan) -> Result<ApplyReport> {
        let started = Instant::now();
        info!(
            "Executing plan with {} actions (concurrency {})",
            plan.len(),
            self.concurrency
        );

        let mut run = Run::new(&plan, self.store.snapshot().await?);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, InFlight> = HashMap::new();
        let mut deadline: Option<Instant> = None;
        let mut aborted = false;
        let mut interrupted: Option<ConvergeError> = None;

        loop {
            if deadline.is_none() && interrupted.is_none() {
                if self.cancel.is_cancelled() {
                    deadline = Some(self.begin_cancellation(in_flight.len()));
                } else {
                    self.schedule(&plan, &mut run, &semaphore, &mut tasks, &mut in_flight);
                }
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(joined) = tasks.join_next_with_id() => {
                    let (id, attempts, result) = match joined {
                        Ok((id, task)) => (id, task.attempts, task.result),
                        Err(join_error) => {
                            let error = if join_error.is_panic() {
                                error!("Action task panicked: {join_error}");
                                ActionError::transient("action task panicked")
                            } else {
                                ActionError::Cancelled
                            };
                            (join_error.id(), 1, Err(error))
                        }
                    };
                    if let Some(flight) = in_flight.remove(&id)
                        && let Err(e) = self.settle(&plan, &mut run, flight, attempts, result).await
                        && interrupted.is_none()
                    {
                        warn!(
                            "State is not writable, waiting for {} in-flight actions before stopping",
                            in_flight.len()
                        );
                        interrupted = Some(e);
                    }
                }
                () = self.cancel.cancelled(), if deadline.is_none() => {
                    deadline = Some(self.begin_cancellation(in_flight.len()));
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() && !aborted =>
                {
                    warn!(
                        "Grace period elapsed, aborting {} in-flight actions",
                        in_flight.len()
                    );
                    tasks.abort_all();
                    aborted = true;
                }
            }
        }

        let report = run.into_report(&plan, deadline.is_some(), started.elapsed());
        info!(
            "Apply finished: {} succeeded, {} failed, {} blocked, {} cancelled",
            report.succeeded(),
            report.failed(),
            report.blocked(),
            report.cancelled_count()
        );

        if let Some(source) = interrupted {
            return Err(ConvergeError::ApplyInterrupted {
                report: Box::new(report),
                source: Box::new(source),
            });
        }
        Ok(report)
    }

    fn begin_cancellation(&self, in_flight: usize) -> Instant {
        warn!(
            "Cancellation requested, waiting up to {}s for {} in-flight actions",
            self.grace_period.as_secs(),
            in_flight
        );
        Instant::now() + self.grace_period
    }

    /// Starts ready actions while permits are available.
    fn schedule(
        &self,
        plan: &Plan,
        run: &mut Run,
        semaphore: &Arc<Semaphore>,
        tasks: &mut JoinSet<TaskResult>,
        in_flight: &mut HashMap<task::Id, InFlight>,
    ) {
        while let Some(&index) = run.ready.first() {
            let action = &plan.actions[index];

            if action.action_type == ActionType::NoOp {
                run.ready.pop_first();
                debug!("{}", action.description());
                run.succeed(index, ActionStatus::Unchanged, 0, None);
                continue;
            }

            let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
                break;
            };
            run.ready.pop_first();

            let attributes = match action.action_type {
                ActionType::Destroy => Attributes::new(),
                _ => match resolve_attributes(&action.attributes, |r| lookup(&run.records, r)) {
                    Ok(attributes) => attributes,
                    Err(error) => {
                        error!("{} failed: {}", action.description(), error);
                        let status = ActionStatus::Failed {
                            error: error.to_string(),
                        };
                        run.fail(plan, index, status, 0, None);
                        continue;
                    }
                },
            };
            let prior = run
                .records
                .get(&action.address)
                .map(StateRecord::known_values)
                .unwrap_or_default();

            info!("Starting: {}", action.description());
            let job = Job {
                address: action.address.clone(),
                action_type: action.action_type,
                attributes: attributes.clone(),
                prior,
                provider: Arc::clone(&self.provider),
                context: Arc::clone(&self.context),
                retry: self.retry,
                call_timeout: self.call_timeout,
                cancel: self.cancel.clone(),
            };
            let handle = tasks.spawn(job.run(permit));
            in_flight.insert(handle.id(), InFlight { index, attributes });
        }
    }

    /// Records the outcome of a finished action.
    ///
    /// A failed state write still settles the action, as unconfirmed, and
    /// returns the write error.
    async fn settle(
        &self,
        plan: &Plan,
        run: &mut Run,
        flight: InFlight,
        attempts: u32,
        result: std::result::Result<Option<Attributes>, ActionError>,
    ) -> Result<()> {
        let action = &plan.actions[flight.index];
        let address = &action.address;

        match result {
            Ok(outputs) => {
                let persisted = if action.action_type == ActionType::Destroy {
                    self.store.delete(address).await.map(|()| None)
                } else {
                    let record = StateRecord::clean(
                        flight.attributes,
                        outputs.unwrap_or_default(),
                        action.resource_dependencies.clone(),
                    );
                    self.store.write(address, record.clone()).await.map(|()| Some(record))
                };
                let recorded = match persisted {
                    Ok(Some(record)) => {
                        run.records.insert(address.clone(), record);
                        Some(ResourceStatus::Clean)
                    }
                    Ok(None) => {
                        run.records.remove(address);
                        None
                    }
                    Err(e) => return Err(run.unrecorded(plan, flight.index, attempts, e)),
                };
                info!("Completed: {} ({} attempts)", action.description(), attempts);
                run.succeed(flight.index, ActionStatus::Succeeded, attempts, recorded);
            }
            Err(error) if error.is_unconfirmed() => {
                let record = match (action.action_type, run.records.get(address)) {
                    (ActionType::Update, Some(prior)) => prior.marked(ResourceStatus::Unknown),
                    (ActionType::Destroy, Some(prior)) => prior.marked(ResourceStatus::Tainted),
                    _ => StateRecord::tainted(flight.attributes, action.resource_dependencies.clone()),
                };
                let recorded = record.status;
                if let Err(e) = self.store.write(address, record.clone()).await {
                    return Err(run.unrecorded(plan, flight.index, attempts, e));
                }
                run.records.insert(address.clone(), record);
                warn!(
                    "Unconfirmed: {} ({}), recorded as {}",
                    action.description(),
                    error,
                    recorded
                );
                let status = ActionStatus::Unconfirmed {
                    error: error.to_string(),
                };
                run.fail(plan, flight.index, status, attempts, Some(recorded));
            }
            Err(error) => {
                error!("Failed: {} ({})", action.description(), error);
                let status = ActionStatus::Failed {
                    error: error.to_string(),
                };
                run.fail(plan, flight.index, status, attempts, None);
            }
        }
        Ok(())
    }
}

/// Returns the current value of a referenced attribute.
fn lookup(
    records: &BTreeMap<Address, StateRecord>,
    reference: &Reference,
) -> std::result::Result<AttributeValue, ActionError> {
    records
        .get(&reference.address)
        .and_then(|record| {
            record
                .outputs
                .get(&reference.attribute)
                .or_else(|| record.attributes.get(&reference.attribute))
        })
        .cloned()
        .ok_or_else(|| ActionError::permanent(format!("{reference} has no value after apply")))
}

impl Job {
    async fn run(self, _permit: OwnedSemaphorePermit) -> TaskResult {
        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let outcome = match tokio::time::timeout(self.call_timeout, self.call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ActionError::transient(format!(
                    "call timed out after {}s",
                    self.call_timeout.as_secs_f64()
                ))),
            };

            match outcome {
                Ok(outputs) => break Ok(outputs),
                Err(error) if error.is_retryable() && self.retry.allows_another(attempts) => {
                    let delay = self.retry.delay_for_attempt(attempts);
                    warn!(
                        "{} attempt {} failed: {}, retrying in {:?}",
                        self.address, attempts, error, delay
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => break Err(ActionError::Cancelled),
                    }
                }
                Err(error) if error.is_retryable() => {
                    break Err(ActionError::RetriesExhausted {
                        attempts,
                        last: error.to_string(),
                    });
                }
                Err(error) => break Err(error),
            }
        };
        TaskResult { attempts, result }
    }

    async fn call(&self) -> std::result::Result<Option<Attributes>, ActionError> {
        let ctx = self.context.as_ref();
        match self.action_type {
            ActionType::Create => self
                .provider
                .create(ctx, &self.address, &self.attributes)
                .await
                .map(Some),
            ActionType::Update => self
                .provider
                .update(ctx, &self.address, &self.prior, &self.attributes)
                .await
                .map(Some),
            ActionType::Destroy => self
                .provider
                .delete(ctx, &self.address, &self.prior)
                .await
                .map(|()| None),
            ActionType::NoOp => Ok(None),
        }
    }
}

impl Run {
    fn new(plan: &Plan, records: BTreeMap<Address, StateRecord>) -> Self {
        Self {
            dependents: plan.dependents(),
            remaining: plan.actions.iter().map(|a| a.dependencies.len()).collect(),
            ready: plan.ready_actions().into_iter().collect(),
            records,
            settled: plan.actions.iter().map(|_| None).collect(),
        }
    }

    fn succeed(
        &mut self,
        index: usize,
        status: ActionStatus,
        attempts: u32,
        recorded: Option<ResourceStatus>,
    ) {
        self.settled[index] = Some(Settled {
            status,
            attempts,
            recorded,
        });
        for &dependent in &self.dependents[index] {
            self.remaining[dependent] -= 1;
            if self.remaining[dependent] == 0 && self.settled[dependent].is_none() {
                self.ready.insert(dependent);
            }
        }
    }

    /// Settles a failed action and blocks everything downstream of it.
    fn fail(
        &mut self,
        plan: &Plan,
        index: usize,
        status: ActionStatus,
        attempts: u32,
        recorded: Option<ResourceStatus>,
    ) {
        self.settled[index] = Some(Settled {
            status,
            attempts,
            recorded,
        });

        let blocker = &plan.actions[index].address;
        let mut stack = self.dependents[index].clone();
        while let Some(dependent) = stack.pop() {
            if self.settled[dependent].is_some() {
                continue;
            }
            debug!(
                "Blocking {} behind {}",
                plan.actions[dependent].description(),
                blocker
            );
            self.settled[dependent] = Some(Settled {
                status: ActionStatus::Blocked { by: blocker.clone() },
                attempts: 0,
                recorded: None,
            });
            self.ready.remove(&dependent);
            stack.extend(self.dependents[dependent].iter().copied());
        }
    }

    /// Settles an action whose outcome could not be written to state.
    fn unrecorded(
        &mut self,
        plan: &Plan,
        index: usize,
        attempts: u32,
        error: ConvergeError,
    ) -> ConvergeError {
        error!("Could not record {}: {}", plan.actions[index].description(), error);
        let status = ActionStatus::Unconfirmed {
            error: format!("state write failed: {error}"),
        };
        self.fail(plan, index, status, attempts, None);
        error
    }

    fn into_report(self, plan: &Plan, cancelled: bool, elapsed: Duration) -> ApplyReport {
        let outcomes = plan
            .actions
            .iter()
            .zip(self.settled)
            .enumerate()
            .map(|(index, (action, settled))| {
                let settled = settled.unwrap_or(Settled {
                    status: ActionStatus::Cancelled,
                    attempts: 0,
                    recorded: None,
                });
                ActionOutcome {
                    index,
                    address: action.address.clone(),
                    action_type: action.action_type,
                    replacement: action.replacement,
                    status: settled.status,
                    attempts: settled.attempts,
                    recorded: settled.recorded,
                }
            })
            .collect();

        ApplyReport {
            outcomes,
            cancelled,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl ApplyReport {
    fn count(&self, predicate: impl Fn(&ActionStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.status)).count()
    }

    /// Number of actions confirmed by the provider.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Succeeded))
    }

    /// Number of no-op actions.
    #[must_use]
    pub fn unchanged(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Unchanged))
    }

    /// Number of failed actions, confirmed or not.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Failed { .. } | ActionStatus::Unconfirmed { .. }))
    }

    /// Number of actions blocked by a failed dependency.
    #[must_use]
    pub fn blocked(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Blocked { .. }))
    }

    /// Number of actions never started because of cancellation.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.count(|s| matches!(s, ActionStatus::Cancelled))
    }

    /// Returns true if every action converged.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| matches!(o.status, ActionStatus::Succeeded | ActionStatus::Unchanged))
    }

    /// Returns the outcome of the last action for an address.
    #[must_use]
    pub fn outcome(&self, address: &Address) -> Option<&ActionOutcome> {
        self.outcomes.iter().rev().find(|o| &o.address == address)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            Self::Blocked { by } => write!(f, "blocked by {by}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unconfirmed { error } => write!(f, "unconfirmed: {error}"),
        }
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Apply {}: {} succeeded, {} unchanged, {} failed, {} blocked, {} cancelled",
            if self.is_success() { "complete" } else { "incomplete" },
            self.succeeded(),
            self.unchanged(),
            self.failed(),
            self.blocked(),
            self.cancelled_count()
        )?;
        for outcome in &self.outcomes {
            if outcome.status != ActionStatus::Unchanged {
                writeln!(
                    f,
                    "  {} {}: {}",
                    outcome.action_type, outcome.address, outcome.status
                )?;
            }
        }
        Ok(())
    }
}
