//! Resource graph construction.
//!
//! The graph is discovered from reference attributes: every reference to
//! address X inside a definition adds an edge from that definition to X.
//! Nodes live in a `Vec` and edges are stored as index sets, so a built
//! graph is plain data that can be shared across worker tasks.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::error::GraphError;

use super::address::{Address, Reference};
use super::value::Attributes;

/// A desired resource, immutable once parsed for a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDefinition {
    /// Unique address of the resource.
    pub address: Address,
    /// Declared attributes, possibly containing references.
    pub attributes: Attributes,
}

/// Directed edge `from -> to`: `from` is applied after `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DependencyEdge {
    /// Index of the dependent node.
    pub from: usize,
    /// Index of the node depended upon.
    pub to: usize,
}

/// Index-based resource graph.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceDefinition>,
    index: HashMap<Address, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
}

/// Collects definitions and builds a [`ResourceGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    definitions: Vec<ResourceDefinition>,
}

impl ResourceDefinition {
    /// Creates a new definition.
    #[must_use]
    pub const fn new(address: Address, attributes: Attributes) -> Self {
        Self {
            address,
            attributes,
        }
    }

    /// Returns every reference in the definition, including nested ones.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        for value in self.attributes.values() {
            value.collect_references(&mut refs);
        }
        refs
    }
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            definitions: Vec::new(),
        }
    }

    /// Adds a definition.
    #[must_use]
    pub fn with(mut self, definition: ResourceDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Adds a definition in place.
    pub fn add(&mut self, definition: ResourceDefinition) {
        self.definitions.push(definition);
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateAddress`] when two definitions share an
    /// address, [`GraphError::DanglingReference`] when a reference targets an
    /// undefined address, and [`GraphError::CycleDetected`] for a
    /// self-reference.
    pub fn build(self) -> Result<ResourceGraph, GraphError> {
        let mut index = HashMap::with_capacity(self.definitions.len());
        for (i, definition) in self.definitions.iter().enumerate() {
            if index.insert(definition.address.clone(), i).is_some() {
                return Err(GraphError::DuplicateAddress {
                    address: definition.address.clone(),
                });
            }
        }

        let count = self.definitions.len();
        let mut dependencies = vec![BTreeSet::new(); count];
        let mut dependents = vec![BTreeSet::new(); count];

        for (from, definition) in self.definitions.iter().enumerate() {
            for reference in definition.references() {
                let Some(&to) = index.get(&reference.address) else {
                    return Err(GraphError::DanglingReference {
                        from: definition.address.clone(),
                        reference: reference.clone(),
                    });
                };
                if to == from {
                    return Err(GraphError::CycleDetected {
                        cycle: vec![definition.address.clone(), definition.address.clone()],
                    });
                }
                dependencies[from].insert(to);
                dependents[to].insert(from);
            }
        }

        debug!(
            "Built resource graph with {} nodes and {} edges",
            count,
            dependencies.iter().map(BTreeSet::len).sum::<usize>()
        );

        Ok(ResourceGraph {
            nodes: self.definitions,
            index,
            dependencies,
            dependents,
        })
    }
}

impl ResourceGraph {
    /// Builds a graph from a list of definitions.
    ///
    /// # Errors
    ///
    /// See [`GraphBuilder::build`].
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ResourceDefinition>,
    ) -> Result<Self, GraphError> {
        let mut builder = GraphBuilder::new();
        for definition in definitions {
            builder.add(definition);
        }
        builder.build()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the definition at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn node(&self, index: usize) -> &ResourceDefinition {
        &self.nodes[index]
    }

    /// Returns all definitions in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceDefinition] {
        &self.nodes
    }

    /// Returns the index of an address.
    #[must_use]
    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.index.get(address).copied()
    }

    /// Returns the definition for an address.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&ResourceDefinition> {
        self.index_of(address).map(|i| &self.nodes[i])
    }

    /// Returns the indices `index` depends on.
    #[must_use]
    pub fn dependencies(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependencies[index]
    }

    /// Returns the indices depending on `index`.
    #[must_use]
    pub fn dependents(&self, index: usize) -> &BTreeSet<usize> {
        &self.dependents[index]
    }

    /// Returns the addresses `index` directly depends on, sorted.
    #[must_use]
    pub fn dependency_addresses(&self, index: usize) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.dependencies[index]
            .iter()
            .map(|&i| self.nodes[i].address.clone())
            .collect();
        addresses.sort();
        addresses
    }

    /// Iterates over every edge.
    pub fn edges(&self) -> impl Iterator<Item = DependencyEdge> + '_ {
        self.dependencies
            .iter()
            .enumerate()
            .flat_map(|(from, targets)| targets.iter().map(move |&to| DependencyEdge { from, to }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttributeValue;

    fn definition(address: &Address, attrs: &[(&str, AttributeValue)]) -> ResourceDefinition {
        ResourceDefinition::new(
            address.clone(),
            attrs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_edges_from_references() {
        let network = Address::new("network", "main");
        let subnet = Address::new("subnet", "app");
        let vault = Address::new("keyvault", "main");

        let graph = GraphBuilder::new()
            .with(definition(&network, &[("address_space", "10.0.0.0/16".into())]))
            .with(definition(
                &subnet,
                &[
                    ("vnet", network.attr("id").into()),
                    ("prefix", "10.0.1.0/24".into()),
                ],
            ))
            .with(definition(&vault, &[]))
            .build()
            .expect("graph builds");

        let edges: Vec<DependencyEdge> = graph.edges().collect();
        assert_eq!(edges, vec![DependencyEdge { from: 1, to: 0 }]);
        assert!(graph.dependents(0).contains(&1));
        assert!(graph.dependencies(2).is_empty());
    }

    #[test]
    fn test_nested_reference_creates_single_edge() {
        let network = Address::new("network", "main");
        let rule = Address::new("firewall", "rule");
        let nested = AttributeValue::List(vec![
            AttributeValue::Map(
                [("target".to_string(), network.attr("id").into())]
                    .into_iter()
                    .collect(),
            ),
            network.attr("name").into(),
        ]);

        let graph = GraphBuilder::new()
            .with(definition(&network, &[]))
            .with(definition(&rule, &[("targets", nested)]))
            .build()
            .expect("graph builds");

        assert_eq!(graph.edges().count(), 1);
        assert_eq!(graph.dependency_addresses(1), vec![network]);
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let vault = Address::new("keyvault", "main");
        let err = GraphBuilder::new()
            .with(definition(&vault, &[]))
            .with(definition(&vault, &[]))
            .build()
            .expect_err("duplicate must fail");
        assert!(matches!(err, GraphError::DuplicateAddress { address } if address == vault));
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let subnet = Address::new("subnet", "app");
        let missing = Address::new("network", "missing");
        let err = GraphBuilder::new()
            .with(definition(&subnet, &[("vnet", missing.attr("id").into())]))
            .build()
            .expect_err("dangling reference must fail");
        match err {
            GraphError::DanglingReference { from, reference } => {
                assert_eq!(from, subnet);
                assert_eq!(reference.address, missing);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let node = Address::new("network", "loop");
        let err = GraphBuilder::new()
            .with(definition(&node, &[("me", node.attr("id").into())]))
            .build()
            .expect_err("self reference must fail");
        assert!(matches!(err, GraphError::CycleDetected { .. }));
    }
}
