//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{AttributeHasher, ValidationResult};
use crate::graph::{Address, ExecutionOrder, ResourceGraph};
use crate::planner::{ActionStatus, ActionType, ApplyReport, Plan, PlanAction};
use crate::reconciler::RunReport;
use crate::state::{LockInfo, ResourceStatus, StateFile};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct GraphRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "Resource")]
    address: String,
    #[tabled(rename = "Level")]
    level: usize,
    #[tabled(rename = "Branch")]
    branch: usize,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

/// Outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
}

/// State record row for table display.
#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Resource")]
    address: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

#[derive(Serialize)]
struct GraphNodeJson<'a> {
    address: &'a Address,
    level: usize,
    branch: usize,
    dependencies: Vec<Address>,
}

#[derive(Serialize)]
struct StateJson<'a> {
    state: Option<&'a StateFile>,
    lock: Option<&'a LockInfo>,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the output format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes. Infrastructure matches the definitions.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan {}\n\n", AttributeHasher::short_hash(&plan.fingerprint));

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.action_type != ActionType::NoOp)
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action(a),
                resource: a.address.to_string(),
                after: a
                    .dependencies
                    .iter()
                    .map(|d| (d + 1).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
                reason: Self::truncate(&a.reason.to_string(), 48),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan
                .actions
                .iter()
                .filter(|a| a.action_type != ActionType::NoOp && !a.changes.is_empty())
            {
                let _ = writeln!(output, "\n  {} {}", action.symbol(), action.address);
                for change in &action.changes {
                    let old = change.old_value.as_ref().map_or_else(|| "-".to_string(), ToString::to_string);
                    let new = change.new_value.as_ref().map_or_else(|| "-".to_string(), ToString::to_string);
                    let marker = if change.forces_replacement {
                        " (forces replacement)".red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(output, "      {}: {} -> {}{}", change.attribute, old, new, marker);
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            summary.create.to_string().green(),
            summary.update.to_string().yellow(),
            summary.replace.to_string().magenta(),
            summary.destroy.to_string().red()
        );

        output
    }

    /// Formats the resource graph in execution order.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph, order: &ExecutionOrder) -> String {
        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<GraphNodeJson<'_>> = order
                    .order()
                    .iter()
                    .map(|&i| GraphNodeJson {
                        address: &graph.node(i).address,
                        level: order.level(i),
                        branch: order.branch(i),
                        dependencies: graph.dependency_addresses(i),
                    })
                    .collect();
                to_json(&nodes)
            }
            OutputFormat::Text => {
                if graph.is_empty() {
                    return String::from("No resources defined.\n");
                }
                let rows: Vec<GraphRow> = order
                    .order()
                    .iter()
                    .enumerate()
                    .map(|(position, &i)| GraphRow {
                        position: position + 1,
                        address: graph.node(i).address.to_string(),
                        level: order.level(i),
                        branch: order.branch(i),
                        depends_on: graph
                            .dependency_addresses(i)
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(", "),
                    })
                    .collect();

                let mut output = Table::new(rows).to_string();
                let _ = write!(
                    output,
                    "\n\n{} resources, {} dependencies, {} independent branches\n",
                    graph.len(),
                    graph.edges().count(),
                    order.branch_count()
                );
                output
            }
        }
    }

    /// Formats the report of an apply or destroy run.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let mut output = Self::apply_text(&report.apply);
                if report.refresh.refreshed + report.refresh.removed > 0 {
                    let _ = writeln!(
                        output,
                        "   Refreshed: {} ({} gone)",
                        report.refresh.refreshed + report.refresh.removed,
                        report.refresh.removed
                    );
                }
                output
            }
        }
    }

    /// Formats the outcomes of a run that stopped early.
    #[must_use]
    pub fn format_apply(&self, apply: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(apply),
            OutputFormat::Text => Self::apply_text(apply),
        }
    }

    /// Formats recorded state and the current lock.
    #[must_use]
    pub fn format_state(&self, state: Option<&StateFile>, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&StateJson { state, lock }),
            OutputFormat::Text => {
                let Some(state) = state else {
                    return String::from("No state found.\n");
                };

                let mut output = String::new();
                let _ = writeln!(output, "\nState serial {} (lineage {})", state.serial, state.lineage);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated.format("%Y-%m-%d %H:%M:%S"));
                if let Some(lock) = lock {
                    let _ = writeln!(
                        output,
                        "   Locked by {} for {} ({}s left)",
                        lock.holder,
                        lock.operation,
                        lock.remaining_secs()
                    );
                }
                output.push('\n');

                if state.resources.is_empty() {
                    output.push_str("   No resources recorded.\n");
                    return output;
                }

                let rows: Vec<StateRow> = state
                    .resources
                    .iter()
                    .map(|(address, record)| StateRow {
                        address: address.to_string(),
                        status: Self::format_resource_status(record.status),
                        id: record
                            .outputs
                            .get("id")
                            .map_or_else(String::new, |id| Self::truncate(&id.to_string(), 32)),
                        hash: AttributeHasher::short_hash(&record.attributes_hash),
                        updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        let mut output = if result.is_valid() {
            format!("{} Project is valid\n", "✓".green())
        } else {
            format!("{} Project has {} errors\n", "✗".red(), result.error_count())
        };
        for error in &result.errors {
            let _ = writeln!(output, "   - {error}");
        }
        if show_warnings && !result.warnings.is_empty() {
            let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
            for warning in &result.warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }
        output
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &format!("{} {message}", "✓".green()), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &format!("{} {message}", "✗".red()), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &format!("{} {message}", "⚠".yellow()), message)
    }

    fn message(&self, status: &str, text: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                to_json(&serde_json::json!({ "status": status, "message": message }))
            }
            OutputFormat::Text => text.to_string(),
        }
    }

    /// Formats an action with its plan symbol and color.
    fn format_action(action: &PlanAction) -> String {
        let label = format!("{} {}", action.symbol(), action.action_type);
        match (action.action_type, action.replacement) {
            (ActionType::Create, false) => label.green().to_string(),
            (ActionType::Update, _) => label.yellow().to_string(),
            (ActionType::Create | ActionType::Destroy, true) => label.magenta().to_string(),
            (ActionType::Destroy, false) => label.red().to_string(),
            (ActionType::NoOp, _) => label.dimmed().to_string(),
        }
    }

    fn apply_text(apply: &ApplyReport) -> String {
        let status = if apply.is_success() {
            format!("{} Apply complete", "✓".green())
        } else if apply.cancelled {
            format!("{} Apply cancelled", "⚠".yellow())
        } else {
            format!("{} Apply incomplete", "✗".red())
        };
        let mut output = format!("{status}\n\n");

        let rows: Vec<OutcomeRow> = apply
            .outcomes
            .iter()
            .filter(|o| o.status != ActionStatus::Unchanged)
            .map(|o| OutcomeRow {
                action: o.action_type.to_string(),
                resource: o.address.to_string(),
                status: Self::format_action_status(&o.status),
                attempts: o.attempts,
            })
            .collect();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = write!(
            output,
            "\n   Succeeded: {}\n   Unchanged: {}\n   Failed: {}\n   Blocked: {}\n   Cancelled: {}\n",
            apply.succeeded(),
            apply.unchanged(),
            apply.failed(),
            apply.blocked(),
            apply.cancelled_count()
        );
        output
    }

    /// Formats an action status with color.
    fn format_action_status(status: &ActionStatus) -> String {
        match status {
            ActionStatus::Succeeded => status.to_string().green().to_string(),
            ActionStatus::Unchanged | ActionStatus::Cancelled => status.to_string().dimmed().to_string(),
            ActionStatus::Blocked { .. } | ActionStatus::Unconfirmed { .. } => {
                status.to_string().yellow().to_string()
            }
            ActionStatus::Failed { .. } => status.to_string().red().to_string(),
        }
    }

    /// Formats a record status with color.
    fn format_resource_status(status: ResourceStatus) -> String {
        match status {
            ResourceStatus::Clean => "clean".green().to_string(),
            ResourceStatus::Tainted => "tainted".red().to_string(),
            ResourceStatus::Unknown => "unknown".yellow().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttributeValue, Attributes, DependencyResolver, ResourceDefinition};
    use crate::planner::{DiffEngine, ImmutabilityPolicy};
    use std::collections::BTreeMap;

    fn plan() -> (ResourceGraph, ExecutionOrder, Plan) {
        let network = Address::new("network", "main");
        let graph = ResourceGraph::from_definitions(vec![
            ResourceDefinition::new(network.clone(), Attributes::new()),
            ResourceDefinition::new(
                Address::new("subnet", "app"),
                Attributes::from([("vnet".to_string(), AttributeValue::from(network.attr("id")))]),
            ),
        ])
        .expect("graph");
        let order = DependencyResolver::new().resolve(&graph).expect("order");
        let diff = DiffEngine::new(ImmutabilityPolicy::new())
            .compute_diff(&graph, &order, &BTreeMap::new())
            .expect("diff");
        let plan = Plan::from_diff(diff, &graph, &order).expect("plan");
        (graph, order, plan)
    }

    #[test]
    fn test_text_plan_lists_actions() {
        colored::control::set_override(false);
        let (_, _, plan) = plan();
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, true);
        assert!(text.contains("network.main"));
        assert!(text.contains("subnet.app"));
        assert!(text.contains("Plan: 2 to create, 0 to update, 0 to replace, 0 to destroy"));
    }

    #[test]
    fn test_json_graph_is_ordered() {
        let (graph, order, _) = plan();
        let json = OutputFormatter::new(OutputFormat::Json).format_graph(&graph, &order);
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(value[0]["address"], "network.main");
        assert_eq!(value[1]["dependencies"][0], "network.main");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a-very-long-identifier", 10), "a-very-...");
    }
}
