//! Plan types and construction.
//!
//! A [`Plan`] expands per-address decisions into executable actions. A
//! replacement becomes a destroy followed by a create; destroys run in
//! reverse dependency order as recorded in state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::config::AttributeHasher;
use crate::error::PlanError;
use crate::graph::{Address, Attributes, ExecutionOrder, ResourceGraph};

use super::diff::{AttributeChange, ChangeReason, ChangeType, DiffResult};

/// An ordered, immutable set of actions.
///
/// Consumed by value when executed, so a plan runs at most once.
#[derive(Debug, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Fingerprint of the planned actions.
    pub fingerprint: String,
    /// Planned actions in execution order.
    pub actions: Vec<PlanAction>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlanAction {
    /// Resource address.
    pub address: Address,
    /// Action type.
    #[serde(rename = "action")]
    pub action_type: ActionType,
    /// True when this action is half of a replacement.
    pub replacement: bool,
    /// Reason for this action.
    pub reason: ChangeReason,
    /// Attribute diff.
    #[serde(rename = "attribute_diff")]
    pub changes: Vec<AttributeChange>,
    /// Desired attributes, still containing references.
    #[serde(skip)]
    pub attributes: Attributes,
    /// Indices of actions that must succeed first.
    pub dependencies: Vec<usize>,
    /// Direct resource dependencies to record on success.
    #[serde(skip)]
    pub resource_dependencies: Vec<Address>,
    /// Independent branch of the resource graph, `None` for orphans.
    pub branch: Option<usize>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    /// Create a resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Destroy a resource.
    Destroy,
    /// Keep a resource as is.
    NoOp,
}

/// Action counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to destroy and create again.
    pub replace: usize,
    /// Resources to destroy.
    pub destroy: usize,
    /// Resources left untouched.
    pub unchanged: usize,
}

impl Plan {
    /// Expands a diff into an ordered plan.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DestroyOrderCycle`] when the dependencies
    /// recorded in state cannot be ordered.
    pub fn from_diff(
        diff: DiffResult,
        graph: &ResourceGraph,
        order: &ExecutionOrder,
    ) -> Result<Self, PlanError> {
        let mut actions: Vec<PlanAction> = Vec::with_capacity(diff.diffs.len());
        let mut apply_index: HashMap<Address, usize> = HashMap::new();
        let mut destroy_index: HashMap<Address, usize> = HashMap::new();
        // address -> addresses that depended on it when last applied
        let mut prior_dependents: HashMap<Address, Vec<Address>> = HashMap::new();

        for resource_diff in diff.diffs {
            for dependency in &resource_diff.prior_dependencies {
                prior_dependents
                    .entry(dependency.clone())
                    .or_default()
                    .push(resource_diff.address.clone());
            }

            let (attributes, resource_dependencies, branch) = match resource_diff.index {
                Some(i) => (
                    graph.node(i).attributes.clone(),
                    graph.dependency_addresses(i),
                    Some(order.branch(i)),
                ),
                None => (Attributes::new(), Vec::new(), None),
            };

            let action = |action_type, replacement| PlanAction {
                address: resource_diff.address.clone(),
                action_type,
                replacement,
                reason: resource_diff.reason.clone(),
                changes: resource_diff.details.clone(),
                attributes: attributes.clone(),
                dependencies: Vec::new(),
                resource_dependencies: resource_dependencies.clone(),
                branch,
            };

            match resource_diff.change {
                ChangeType::Create | ChangeType::Update | ChangeType::NoOp => {
                    let action_type = match resource_diff.change {
                        ChangeType::Create => ActionType::Create,
                        ChangeType::Update => ActionType::Update,
                        _ => ActionType::NoOp,
                    };
                    apply_index.insert(resource_diff.address.clone(), actions.len());
                    actions.push(action(action_type, false));
                }
                ChangeType::Replace => {
                    destroy_index.insert(resource_diff.address.clone(), actions.len());
                    let mut destroy = action(ActionType::Destroy, true);
                    destroy.attributes = Attributes::new();
                    destroy.resource_dependencies = resource_diff.prior_dependencies.clone();
                    actions.push(destroy);
                    apply_index.insert(resource_diff.address.clone(), actions.len());
                    actions.push(action(ActionType::Create, true));
                }
                ChangeType::Destroy => {
                    destroy_index.insert(resource_diff.address.clone(), actions.len());
                    let mut destroy = action(ActionType::Destroy, false);
                    destroy.resource_dependencies = resource_diff.prior_dependencies.clone();
                    actions.push(destroy);
                }
            }
        }

        for (index, action) in actions.iter_mut().enumerate() {
            let mut dependencies = BTreeSet::new();
            match action.action_type {
                ActionType::Destroy => {
                    for dependent in prior_dependents.get(&action.address).into_iter().flatten() {
                        if let Some(&d) = destroy_index.get(dependent) {
                            dependencies.insert(d);
                        } else if !action.replacement
                            && let Some(&a) = apply_index.get(dependent)
                        {
                            // A kept former dependent stops referencing the
                            // orphan before the orphan goes away.
                            dependencies.insert(a);
                        }
                    }
                }
                _ => {
                    for dependency in &action.resource_dependencies {
                        if let Some(&a) = apply_index.get(dependency) {
                            dependencies.insert(a);
                        }
                    }
                    if action.replacement
                        && let Some(&d) = destroy_index.get(&action.address)
                    {
                        dependencies.insert(d);
                    }
                }
            }
            dependencies.remove(&index);
            action.dependencies = dependencies.into_iter().collect();
        }

        let actions = sort_actions(actions)?;
        let fingerprint = AttributeHasher::fingerprint(actions.iter().map(|a| {
            format!(
                "{}|{}|{}|{}",
                a.address,
                a.action_type,
                a.replacement,
                AttributeHasher::hash_attributes(&a.attributes)
            )
        }));

        Ok(Self {
            created_at: Utc::now(),
            fingerprint,
            actions,
        })
    }

    /// Creates an empty plan (no changes needed).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            created_at: Utc::now(),
            fingerprint: AttributeHasher::fingerprint(std::iter::empty::<&[u8]>()),
            actions: Vec::new(),
        }
    }

    /// Returns the number of actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if the plan has no actions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns true if any action changes infrastructure.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.action_type != ActionType::NoOp)
    }

    /// Counts actions per kind, a replacement counting once.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match (action.action_type, action.replacement) {
                (ActionType::Create, false) => summary.create += 1,
                (ActionType::Create, true) => summary.replace += 1,
                (ActionType::Update, _) => summary.update += 1,
                (ActionType::Destroy, false) => summary.destroy += 1,
                (ActionType::Destroy, true) => {}
                (ActionType::NoOp, _) => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Returns the index of the first action for an address.
    #[must_use]
    pub fn position(&self, address: &Address, action_type: ActionType) -> Option<usize> {
        self.actions
            .iter()
            .position(|a| &a.address == address && a.action_type == action_type)
    }

    /// Returns actions that can be executed immediately (no dependencies).
    #[must_use]
    pub fn ready_actions(&self) -> Vec<usize> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.dependencies.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Returns, for every action, the indices of actions depending on it.
    #[must_use]
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.actions.len()];
        for (index, action) in self.actions.iter().enumerate() {
            for &dependency in &action.dependencies {
                dependents[dependency].push(index);
            }
        }
        dependents
    }
}

/// Sorts actions topologically, keeping insertion order where free, and
/// remaps dependency indices to the new positions.
fn sort_actions(actions: Vec<PlanAction>) -> Result<Vec<PlanAction>, PlanError> {
    let count = actions.len();
    let mut remaining: Vec<usize> = actions.iter().map(|a| a.dependencies.len()).collect();
    let mut dependents = vec![Vec::new(); count];
    for (index, action) in actions.iter().enumerate() {
        for &dependency in &action.dependencies {
            dependents[dependency].push(index);
        }
    }

    let mut ready: BTreeSet<usize> = (0..count).filter(|&i| remaining[i] == 0).collect();
    let mut sorted = Vec::with_capacity(count);
    while let Some(index) = ready.pop_first() {
        sorted.push(index);
        for &dependent in &dependents[index] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if sorted.len() < count {
        let addresses: BTreeSet<Address> = (0..count)
            .filter(|&i| remaining[i] > 0)
            .map(|i| actions[i].address.clone())
            .collect();
        return Err(PlanError::DestroyOrderCycle {
            addresses: addresses.into_iter().collect(),
        });
    }

    let mut new_position = vec![0; count];
    for (position, &index) in sorted.iter().enumerate() {
        new_position[index] = position;
    }

    let mut slots: Vec<Option<PlanAction>> = actions.into_iter().map(Some).collect();
    Ok(sorted
        .into_iter()
        .filter_map(|index| slots[index].take())
        .map(|mut action| {
            action.dependencies = action
                .dependencies
                .iter()
                .map(|&d| new_position[d])
                .collect();
            action.dependencies.sort_unstable();
            action
        })
        .collect())
}

impl PlanAction {
    /// Returns the plan symbol of the action.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match (self.action_type, self.replacement) {
            (ActionType::Create, false) => "+",
            (ActionType::Create, true) => "+/-",
            (ActionType::Update, _) => "~",
            (ActionType::Destroy, true) => "-/+",
            (ActionType::Destroy, false) => "-",
            (ActionType::NoOp, _) => " ",
        }
    }

    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match (self.action_type, self.replacement) {
            (ActionType::Create, false) => format!("Create {}", self.address),
            (ActionType::Create, true) => format!("Create replacement for {}", self.address),
            (ActionType::Update, _) => format!("Update {} in place", self.address),
            (ActionType::Destroy, true) => format!("Destroy {} before replacement", self.address),
            (ActionType::Destroy, false) => format!("Destroy {}", self.address),
            (ActionType::NoOp, _) => format!("No change for {}", self.address),
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.symbol(), self.address, self.reason)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes. Infrastructure matches the definitions.");
        }

        let summary = self.summary();
        writeln!(
            f,
            "Plan: {} to create, {} to update, {} to replace, {} to destroy",
            summary.create, summary.update, summary.replace, summary.destroy
        )?;
        for (i, action) in self.actions.iter().enumerate() {
            if action.action_type != ActionType::NoOp {
                writeln!(f, "  {i}. {action}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AttributeValue, DependencyResolver, ResourceDefinition};
    use crate::planner::{DiffEngine, ImmutabilityPolicy, ResourcePolicy};
    use crate::state::StateRecord;
    use std::collections::BTreeMap;

    fn network() -> Address {
        Address::new("network", "main")
    }

    fn subnet() -> Address {
        Address::new("subnet", "app")
    }

    fn vault() -> Address {
        Address::new("keyvault", "main")
    }

    fn example_definitions(space: &str) -> Vec<ResourceDefinition> {
        vec![
            ResourceDefinition::new(
                network(),
                Attributes::from([("address_space".to_string(), AttributeValue::string(space))]),
            ),
            ResourceDefinition::new(
                subnet(),
                Attributes::from([
                    ("vnet".to_string(), network().attr("id").into()),
                    ("prefix".to_string(), AttributeValue::string("10.0.1.0/24")),
                ]),
            ),
            ResourceDefinition::new(vault(), Attributes::new()),
        ]
    }

    fn plan(
        defs: Vec<ResourceDefinition>,
        state: &BTreeMap<Address, StateRecord>,
    ) -> Result<Plan, PlanError> {
        let graph = ResourceGraph::from_definitions(defs).expect("graph");
        let order = DependencyResolver::new().resolve(&graph).expect("order");
        let policy = ImmutabilityPolicy::new()
            .with_type("network", ResourcePolicy::immutable(["address_space"]));
        let diff = DiffEngine::new(policy).compute_diff(&graph, &order, state)?;
        Plan::from_diff(diff, &graph, &order)
    }

    fn record(attrs: &[(&str, &str)], id: &str, deps: Vec<Address>) -> StateRecord {
        StateRecord::clean(
            attrs
                .iter()
                .map(|(k, v)| ((*k).to_string(), AttributeValue::string(*v)))
                .collect(),
            Attributes::from([("id".to_string(), AttributeValue::string(id))]),
            deps,
        )
    }

    fn applied_state() -> BTreeMap<Address, StateRecord> {
        BTreeMap::from([
            (network(), record(&[("address_space", "10.0.0.0/16")], "net-1", Vec::new())),
            (
                subnet(),
                record(
                    &[("vnet", "net-1"), ("prefix", "10.0.1.0/24")],
                    "sub-1",
                    vec![network()],
                ),
            ),
            (vault(), record(&[], "kv-1", Vec::new())),
        ])
    }

    #[test]
    fn test_initial_plan_creates_everything() {
        let plan = plan(example_definitions("10.0.0.0/16"), &BTreeMap::new()).expect("plan");

        assert_eq!(plan.len(), 3);
        assert!(plan.actions.iter().all(|a| a.action_type == ActionType::Create));

        let net = plan.position(&network(), ActionType::Create).expect("network");
        let sub = plan.position(&subnet(), ActionType::Create).expect("subnet");
        let kv = plan.position(&vault(), ActionType::Create).expect("vault");
        assert!(net < sub);
        assert_eq!(plan.actions[sub].dependencies, vec![net]);
        assert!(plan.actions[kv].dependencies.is_empty());
        assert_ne!(plan.actions[kv].branch, plan.actions[net].branch);
        assert_eq!(plan.summary().create, 3);
    }

    #[test]
    fn test_immutable_change_orders_replacement_before_dependent() {
        let plan = plan(example_definitions("10.1.0.0/16"), &applied_state()).expect("plan");

        let destroy = plan.position(&network(), ActionType::Destroy).expect("destroy");
        let create = plan.position(&network(), ActionType::Create).expect("create");
        let sub = plan
            .actions
            .iter()
            .position(|a| a.address == subnet() && a.action_type != ActionType::Destroy)
            .expect("subnet re-evaluation");

        assert!(plan.actions[destroy].replacement);
        assert!(plan.actions[create].replacement);
        assert!(destroy < create && create < sub);
        assert_eq!(plan.actions[sub].action_type, ActionType::Update);
        assert!(plan.actions[create].dependencies.contains(&destroy));
        assert!(plan.actions[sub].dependencies.contains(&create));

        let summary = plan.summary();
        assert_eq!((summary.replace, summary.update, summary.unchanged), (1, 1, 1));
    }

    #[test]
    fn test_second_plan_is_all_no_op() {
        let plan = plan(example_definitions("10.0.0.0/16"), &applied_state()).expect("plan");
        assert!(!plan.has_changes());
        assert!(plan.actions.iter().all(|a| a.action_type == ActionType::NoOp));
    }

    #[test]
    fn test_orphans_destroyed_in_reverse_dependency_order() {
        let plan = plan(Vec::new(), &applied_state()).expect("plan");
        assert_eq!(plan.summary().destroy, 3);

        let net = plan.position(&network(), ActionType::Destroy).expect("network");
        let sub = plan.position(&subnet(), ActionType::Destroy).expect("subnet");
        assert!(sub < net);
        assert_eq!(plan.actions[net].dependencies, vec![sub]);
    }

    #[test]
    fn test_replacing_a_parent_destroys_replaced_children_first() {
        let policy = ImmutabilityPolicy::new()
            .with_type("network", ResourcePolicy::immutable(["address_space"]))
            .with_type(
                "subnet",
                ResourcePolicy::default().with_replace_on_dependency_replacement(true),
            );
        let defs = example_definitions("10.1.0.0/16");
        let graph = ResourceGraph::from_definitions(defs).expect("graph");
        let order = DependencyResolver::new().resolve(&graph).expect("order");
        let diff = DiffEngine::new(policy)
            .compute_diff(&graph, &order, &applied_state())
            .expect("diff");
        let plan = Plan::from_diff(diff, &graph, &order).expect("plan");

        let destroy_sub = plan.position(&subnet(), ActionType::Destroy).expect("subnet destroy");
        let destroy_net = plan.position(&network(), ActionType::Destroy).expect("network destroy");
        let create_net = plan.position(&network(), ActionType::Create).expect("network create");
        let create_sub = plan.position(&subnet(), ActionType::Create).expect("subnet create");

        assert!(destroy_sub < destroy_net);
        assert!(destroy_net < create_net);
        assert!(create_net < create_sub);
    }

    #[test]
    fn test_inconsistent_recorded_dependencies_are_rejected() {
        let state = BTreeMap::from([
            (network(), record(&[], "net-1", vec![subnet()])),
            (subnet(), record(&[], "sub-1", vec![network()])),
        ]);
        let err = plan(Vec::new(), &state).expect_err("cycle");
        assert!(matches!(
            err,
            PlanError::DestroyOrderCycle { ref addresses } if addresses.len() == 2
        ));
    }

    #[test]
    fn test_plan_serializes_for_inspection() {
        let plan = plan(example_definitions("10.0.0.0/16"), &BTreeMap::new()).expect("plan");
        let json = serde_json::to_value(&plan).expect("serialize");
        let first = &json["actions"][0];
        assert_eq!(first["action"], "create");
        assert_eq!(first["reason"]["kind"], "not_in_state");
        assert!(first["attribute_diff"].is_array());
    }
}
