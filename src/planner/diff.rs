//! Diff engine for comparing desired definitions against recorded state.
//!
//! Resources are visited in dependency order so that every reference can be
//! resolved against the *planned* values of its target: last-known values
//! when the target is kept, or the target's declared attributes (anything
//! else being computed) when the target is created or replaced.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use tracing::debug;

use crate::config::AttributeHasher;
use crate::error::PlanError;
use crate::graph::{
    resolve_attributes, Address, AttributeValue, Attributes, ExecutionOrder, ResourceGraph,
};
use crate::state::{ResourceStatus, StateRecord};

use super::policy::ImmutabilityPolicy;

/// Engine for computing diffs between desired and recorded states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Replacement rules per resource type.
    policy: ImmutabilityPolicy,
}

/// Decision taken for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeType {
    /// Resource needs to be created.
    Create,
    /// Resource can be updated in place.
    Update,
    /// Resource must be destroyed and created again.
    Replace,
    /// Resource is no longer defined and must be destroyed.
    Destroy,
    /// Resource is up to date.
    NoOp,
}

/// Why a decision was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeReason {
    /// No record exists for the address.
    NotInState,
    /// Mutable attributes differ from the record.
    AttributesChanged,
    /// Attributes that cannot change in place differ from the record.
    ImmutableAttributeChanged {
        /// The offending attributes.
        attributes: Vec<String>,
    },
    /// The record is tainted.
    Tainted,
    /// The record's status is unknown and must be re-applied.
    Refresh,
    /// A dependency gets a new identity.
    DependencyReplaced {
        /// The replaced dependencies.
        dependencies: Vec<Address>,
    },
    /// The resource is no longer defined.
    RemovedFromDefinitions,
    /// Nothing differs.
    UpToDate,
}

/// Difference for a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Recorded value.
    pub old_value: Option<AttributeValue>,
    /// Planned value, possibly computed.
    pub new_value: Option<AttributeValue>,
    /// Whether this change forces a replacement.
    pub forces_replacement: bool,
}

/// Decision for a single address.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource address.
    pub address: Address,
    /// Index in the resource graph, `None` for destroys.
    pub index: Option<usize>,
    /// Decision.
    pub change: ChangeType,
    /// Why.
    pub reason: ChangeReason,
    /// Differing attributes.
    pub details: Vec<AttributeChange>,
    /// Desired attributes with references resolved as far as known at plan time.
    pub planned: Attributes,
    /// Dependencies recorded in state, empty when there is no record.
    pub prior_dependencies: Vec<Address>,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Desired resources in dependency order, then destroys by address.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to destroy.
    pub destroys: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

/// Planned view of an already visited resource.
struct Planned {
    change: ChangeType,
    values: Attributes,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new(policy: ImmutabilityPolicy) -> Self {
        Self { policy }
    }

    /// Returns the replacement policy.
    #[must_use]
    pub const fn policy(&self) -> &ImmutabilityPolicy {
        &self.policy
    }

    /// Computes the diff between the graph and the recorded state.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnresolvableReference`] if a reference targets an
    /// attribute that a kept resource neither declares nor recorded.
    pub fn compute_diff(
        &self,
        graph: &ResourceGraph,
        order: &ExecutionOrder,
        state: &BTreeMap<Address, StateRecord>,
    ) -> Result<DiffResult, PlanError> {
        let mut planned: HashMap<usize, Planned> = HashMap::with_capacity(graph.len());
        let mut diffs = Vec::with_capacity(graph.len());

        for &index in order.order() {
            let node = graph.node(index);
            let resolved = resolve_attributes(&node.attributes, |reference| {
                let target = graph
                    .index_of(&reference.address)
                    .and_then(|i| planned.get(&i));
                match target {
                    Some(Planned {
                        change: ChangeType::Create | ChangeType::Replace,
                        values,
                    }) => Ok(values
                        .get(&reference.attribute)
                        .cloned()
                        .unwrap_or(AttributeValue::Computed)),
                    Some(Planned { values, .. }) => values
                        .get(&reference.attribute)
                        .cloned()
                        .ok_or_else(|| PlanError::UnresolvableReference {
                            from: node.address.clone(),
                            reference: reference.clone(),
                        }),
                    None => Err(PlanError::UnresolvableReference {
                        from: node.address.clone(),
                        reference: reference.clone(),
                    }),
                }
            })?;

            let renewed: Vec<Address> = graph
                .dependencies(index)
                .iter()
                .filter(|&d| {
                    planned
                        .get(d)
                        .is_some_and(|p| matches!(p.change, ChangeType::Create | ChangeType::Replace))
                })
                .map(|&d| graph.node(d).address.clone())
                .collect();

            let diff = self.diff_resource(
                index,
                &node.address,
                resolved,
                state.get(&node.address),
                renewed,
            );

            let values = match (diff.change, state.get(&node.address)) {
                (ChangeType::NoOp | ChangeType::Update, Some(record)) => {
                    let mut values = record.known_values();
                    values.extend(diff.planned.iter().map(|(k, v)| (k.clone(), v.clone())));
                    values
                }
                _ => diff.planned.clone(),
            };
            planned.insert(
                index,
                Planned {
                    change: diff.change,
                    values,
                },
            );
            diffs.push(diff);
        }

        for (address, record) in state {
            if graph.index_of(address).is_none() {
                debug!("{} is no longer defined, planning destroy", address);
                diffs.push(ResourceDiff {
                    address: address.clone(),
                    index: None,
                    change: ChangeType::Destroy,
                    reason: ChangeReason::RemovedFromDefinitions,
                    details: record
                        .attributes
                        .iter()
                        .map(|(attribute, old)| AttributeChange {
                            attribute: attribute.clone(),
                            old_value: Some(old.clone()),
                            new_value: None,
                            forces_replacement: false,
                        })
                        .collect(),
                    planned: Attributes::new(),
                    prior_dependencies: record.dependencies.clone(),
                });
            }
        }

        Ok(DiffResult::from_diffs(diffs))
    }

    /// Decides what happens to one defined resource.
    fn diff_resource(
        &self,
        index: usize,
        address: &Address,
        planned: Attributes,
        record: Option<&StateRecord>,
        renewed_dependencies: Vec<Address>,
    ) -> ResourceDiff {
        let resource_type = address.resource_type();

        let Some(record) = record else {
            debug!("{} needs to be created", address);
            let details = planned
                .iter()
                .map(|(attribute, new)| AttributeChange {
                    attribute: attribute.clone(),
                    old_value: None,
                    new_value: Some(new.clone()),
                    forces_replacement: false,
                })
                .collect();
            return ResourceDiff {
                address: address.clone(),
                index: Some(index),
                change: ChangeType::Create,
                reason: ChangeReason::NotInState,
                details,
                planned,
                prior_dependencies: Vec::new(),
            };
        };

        let details = self.attribute_changes(
            resource_type,
            &record.attributes,
            &planned,
            &record.attributes_hash,
        );
        let immutable: Vec<String> = details
            .iter()
            .filter(|c| c.forces_replacement)
            .map(|c| c.attribute.clone())
            .collect();

        let (change, reason) = if record.status == ResourceStatus::Tainted {
            (ChangeType::Replace, ChangeReason::Tainted)
        } else if !immutable.is_empty() {
            (
                ChangeType::Replace,
                ChangeReason::ImmutableAttributeChanged {
                    attributes: immutable,
                },
            )
        } else if !renewed_dependencies.is_empty()
            && self.policy.replace_on_dependency_replacement(resource_type)
        {
            (
                ChangeType::Replace,
                ChangeReason::DependencyReplaced {
                    dependencies: renewed_dependencies,
                },
            )
        } else if !details.is_empty() {
            (ChangeType::Update, ChangeReason::AttributesChanged)
        } else if record.status == ResourceStatus::Unknown {
            (ChangeType::Update, ChangeReason::Refresh)
        } else if !renewed_dependencies.is_empty() {
            (
                ChangeType::Update,
                ChangeReason::DependencyReplaced {
                    dependencies: renewed_dependencies,
                },
            )
        } else {
            (ChangeType::NoOp, ChangeReason::UpToDate)
        };

        debug!("{} planned as {} ({})", address, change, reason);

        ResourceDiff {
            address: address.clone(),
            index: Some(index),
            change,
            reason,
            details,
            planned,
            prior_dependencies: record.dependencies.clone(),
        }
    }

    /// Lists differing attributes. A computed value always differs.
    fn attribute_changes(
        &self,
        resource_type: &str,
        recorded: &Attributes,
        planned: &Attributes,
        recorded_hash: &str,
    ) -> Vec<AttributeChange> {
        let all_known = planned.values().all(AttributeValue::is_known);
        if all_known
            && AttributeHasher::hashes_match(&AttributeHasher::hash_attributes(planned), recorded_hash)
        {
            return Vec::new();
        }

        let keys: BTreeSet<&String> = recorded.keys().chain(planned.keys()).collect();
        keys.into_iter()
            .filter_map(|key| {
                let old = recorded.get(key);
                let new = planned.get(key);
                let differs = old != new || new.is_some_and(|v| !v.is_known());
                differs.then(|| AttributeChange {
                    attribute: key.clone(),
                    old_value: old.cloned(),
                    new_value: new.cloned(),
                    forces_replacement: self.policy.is_immutable(resource_type, key),
                })
            })
            .collect()
    }
}

impl DiffResult {
    fn from_diffs(diffs: Vec<ResourceDiff>) -> Self {
        let count = |change: ChangeType| diffs.iter().filter(|d| d.change == change).count();
        Self {
            creates: count(ChangeType::Create),
            updates: count(ChangeType::Update),
            replaces: count(ChangeType::Replace),
            destroys: count(ChangeType::Destroy),
            unchanged: count(ChangeType::NoOp),
            diffs,
        }
    }

    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.destroys
    }

    /// Returns the diff of one address.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| &d.address == address)
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInState => write!(f, "not in state"),
            Self::AttributesChanged => write!(f, "attributes changed"),
            Self::ImmutableAttributeChanged { attributes } => {
                write!(f, "immutable attributes changed: {}", attributes.join(", "))
            }
            Self::Tainted => write!(f, "tainted"),
            Self::Refresh => write!(f, "refresh"),
            Self::DependencyReplaced { dependencies } => {
                let names: Vec<String> = dependencies.iter().map(ToString::to_string).collect();
                write!(f, "dependency replaced: {}", names.join(", "))
            }
            Self::RemovedFromDefinitions => write!(f, "removed from definitions"),
            Self::UpToDate => write!(f, "up to date"),
        }
    }
}

impl fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.address, self.change)?;
        if !self.details.is_empty() {
            let fields: Vec<&str> = self.details.iter().map(|d| d.attribute.as_str()).collect();
            write!(f, " ({})", fields.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DependencyResolver, Reference, ResourceDefinition};
    use crate::planner::ResourcePolicy;

    fn network() -> Address {
        Address::new("network", "main")
    }

    fn subnet() -> Address {
        Address::new("subnet", "app")
    }

    fn definitions(space: &str) -> Vec<ResourceDefinition> {
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
        ]
    }

    fn policy() -> ImmutabilityPolicy {
        ImmutabilityPolicy::new().with_type("network", ResourcePolicy::immutable(["address_space"]))
    }

    fn applied_state() -> BTreeMap<Address, StateRecord> {
        BTreeMap::from([
            (
                network(),
                StateRecord::clean(
                    Attributes::from([(
                        "address_space".to_string(),
                        AttributeValue::string("10.0.0.0/16"),
                    )]),
                    Attributes::from([("id".to_string(), AttributeValue::string("net-1"))]),
                    Vec::new(),
                ),
            ),
            (
                subnet(),
                StateRecord::clean(
                    Attributes::from([
                        ("vnet".to_string(), AttributeValue::string("net-1")),
                        ("prefix".to_string(), AttributeValue::string("10.0.1.0/24")),
                    ]),
                    Attributes::from([("id".to_string(), AttributeValue::string("sub-1"))]),
                    vec![network()],
                ),
            ),
        ])
    }

    fn diff(
        defs: Vec<ResourceDefinition>,
        state: &BTreeMap<Address, StateRecord>,
    ) -> Result<DiffResult, PlanError> {
        let graph = ResourceGraph::from_definitions(defs).expect("graph");
        let order = DependencyResolver::new().resolve(&graph).expect("order");
        DiffEngine::new(policy()).compute_diff(&graph, &order, state)
    }

    #[test]
    fn test_empty_state_creates_with_computed_references() {
        let result = diff(definitions("10.0.0.0/16"), &BTreeMap::new()).expect("diff");
        assert_eq!(result.creates, 2);

        let subnet_diff = result.get(&subnet()).expect("subnet diff");
        assert_eq!(subnet_diff.planned["vnet"], AttributeValue::Computed);
    }

    #[test]
    fn test_unchanged_resources_are_no_op() {
        let result = diff(definitions("10.0.0.0/16"), &applied_state()).expect("diff");
        assert_eq!(result.unchanged, 2);
        assert!(!result.has_changes());
        assert_eq!(
            result.get(&subnet()).expect("subnet").planned["vnet"],
            AttributeValue::string("net-1")
        );
    }

    #[test]
    fn test_immutable_change_replaces_and_propagates() {
        let result = diff(definitions("10.1.0.0/16"), &applied_state()).expect("diff");

        let net = result.get(&network()).expect("network");
        assert_eq!(net.change, ChangeType::Replace);
        assert_eq!(
            net.reason,
            ChangeReason::ImmutableAttributeChanged {
                attributes: vec!["address_space".to_string()]
            }
        );

        let sub = result.get(&subnet()).expect("subnet");
        assert_eq!(sub.change, ChangeType::Update);
        assert_eq!(sub.details.len(), 1);
        assert_eq!(sub.details[0].new_value, Some(AttributeValue::Computed));
    }

    #[test]
    fn test_dependency_replacement_with_declared_reference() {
        // Subnet only reads a declared attribute, so its own values stay the same.
        let defs = vec![
            ResourceDefinition::new(
                network(),
                Attributes::from([
                    ("address_space".to_string(), AttributeValue::string("10.1.0.0/16")),
                    ("name".to_string(), AttributeValue::string("core")),
                ]),
            ),
            ResourceDefinition::new(
                subnet(),
                Attributes::from([("vnet".to_string(), network().attr("name").into())]),
            ),
        ];
        let state = BTreeMap::from([
            (
                network(),
                StateRecord::clean(
                    Attributes::from([
                        ("address_space".to_string(), AttributeValue::string("10.0.0.0/16")),
                        ("name".to_string(), AttributeValue::string("core")),
                    ]),
                    Attributes::new(),
                    Vec::new(),
                ),
            ),
            (
                subnet(),
                StateRecord::clean(
                    Attributes::from([("vnet".to_string(), AttributeValue::string("core"))]),
                    Attributes::new(),
                    vec![network()],
                ),
            ),
        ]);

        let result = diff(defs.clone(), &state).expect("diff");
        let sub = result.get(&subnet()).expect("subnet");
        assert_eq!(sub.change, ChangeType::Update);
        assert_eq!(
            sub.reason,
            ChangeReason::DependencyReplaced {
                dependencies: vec![network()]
            }
        );

        let graph = ResourceGraph::from_definitions(defs).expect("graph");
        let order = DependencyResolver::new().resolve(&graph).expect("order");
        let cascading = policy().with_type(
            "subnet",
            ResourcePolicy::default().with_replace_on_dependency_replacement(true),
        );
        let result = DiffEngine::new(cascading)
            .compute_diff(&graph, &order, &state)
            .expect("diff");
        assert_eq!(result.get(&subnet()).expect("subnet").change, ChangeType::Replace);
    }

    #[test]
    fn test_status_flags_force_changes() {
        let mut state = applied_state();
        let tainted = state[&network()].marked(ResourceStatus::Tainted);
        state.insert(network(), tainted);
        let unknown = state[&subnet()].marked(ResourceStatus::Unknown);
        state.insert(subnet(), unknown);

        let result = diff(definitions("10.0.0.0/16"), &state).expect("diff");
        let net = result.get(&network()).expect("network");
        assert_eq!((net.change, &net.reason), (ChangeType::Replace, &ChangeReason::Tainted));

        // The tainted network gets a new id, so the subnet's vnet is computed.
        let sub = result.get(&subnet()).expect("subnet");
        assert_eq!(sub.change, ChangeType::Update);
        assert_eq!(sub.reason, ChangeReason::AttributesChanged);
    }

    #[test]
    fn test_unknown_without_diff_is_refresh() {
        let mut state = applied_state();
        let unknown = state[&subnet()].marked(ResourceStatus::Unknown);
        state.insert(subnet(), unknown);

        let result = diff(definitions("10.0.0.0/16"), &state).expect("diff");
        let sub = result.get(&subnet()).expect("subnet");
        assert_eq!((sub.change, &sub.reason), (ChangeType::Update, &ChangeReason::Refresh));
    }

    #[test]
    fn test_orphans_are_destroyed() {
        let mut state = applied_state();
        let vault = Address::new("keyvault", "old");
        state.insert(
            vault.clone(),
            StateRecord::clean(Attributes::new(), Attributes::new(), Vec::new()),
        );

        let result = diff(definitions("10.0.0.0/16"), &state).expect("diff");
        assert_eq!(result.destroys, 1);
        let orphan = result.get(&vault).expect("orphan");
        assert_eq!(orphan.reason, ChangeReason::RemovedFromDefinitions);
        assert!(orphan.index.is_none());
    }

    #[test]
    fn test_missing_attribute_on_kept_target_is_unresolvable() {
        let mut defs = definitions("10.0.0.0/16");
        defs[1].attributes.insert(
            "region".to_string(),
            AttributeValue::Reference(Reference::parse("network.main.region").expect("ref")),
        );

        let err = diff(defs, &applied_state()).expect_err("unresolvable");
        assert!(matches!(
            err,
            PlanError::UnresolvableReference { ref from, .. } if *from == subnet()
        ));
    }
}
