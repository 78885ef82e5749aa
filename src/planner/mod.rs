//! Planning and execution.
//!
//! This module compares the resource graph with recorded state, expands
//! the differences into an ordered plan and applies that plan through a
//! provider.

mod diff;
mod executor;
mod plan;
mod policy;
mod retry;

pub use diff::{AttributeChange, ChangeReason, ChangeType, DiffEngine, DiffResult, ResourceDiff};
pub use executor::{
    cancellation, ActionOutcome, ActionStatus, ApplyReport, CancelHandle, CancelSignal,
    PlanExecutor, DEFAULT_CONCURRENCY,
};
pub use plan::{ActionType, Plan, PlanAction, PlanSummary};
pub use policy::{ImmutabilityPolicy, ResourcePolicy, DEFAULT_POLICY_KEY};
pub use retry::RetryPolicy;
