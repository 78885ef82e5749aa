//! Dependency ordering for the resource graph.
//!
//! Produces a deterministic topological order (ties broken by address), the
//! depth level of every node, the weakly connected branch each node belongs
//! to, and the transitive dependency closure used for independence checks.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::GraphError;

use super::address::Address;
use super::builder::ResourceGraph;

/// Computes an [`ExecutionOrder`] for a [`ResourceGraph`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyResolver;

/// Result of resolving a resource graph.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOrder {
    order: Vec<usize>,
    position: Vec<usize>,
    levels: Vec<usize>,
    branches: Vec<usize>,
    branch_count: usize,
    closure: Vec<BTreeSet<usize>>,
}

impl DependencyResolver {
    /// Creates a new resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Orders the graph so that every dependency precedes its dependents.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] with the closed address sequence
    /// of one cycle if the graph is not acyclic.
    pub fn resolve(&self, graph: &ResourceGraph) -> Result<ExecutionOrder, GraphError> {
        let count = graph.len();
        let mut remaining: Vec<usize> = (0..count).map(|i| graph.dependencies(i).len()).collect();
        let mut ready: BTreeMap<&Address, usize> = graph
            .nodes()
            .iter()
            .enumerate()
            .filter(|(i, _)| remaining[*i] == 0)
            .map(|(i, node)| (&node.address, i))
            .collect();

        let mut order = Vec::with_capacity(count);
        let mut levels = vec![0; count];

        while let Some((_, index)) = ready.pop_first() {
            order.push(index);
            for &dependent in graph.dependents(index) {
                levels[dependent] = levels[dependent].max(levels[index] + 1);
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(&graph.node(dependent).address, dependent);
                }
            }
        }

        if order.len() < count {
            return Err(GraphError::CycleDetected {
                cycle: find_cycle(graph, &remaining),
            });
        }

        let mut position = vec![0; count];
        for (pos, &index) in order.iter().enumerate() {
            position[index] = pos;
        }

        let mut closure: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); count];
        for &index in &order {
            let mut reachable = BTreeSet::new();
            for &dependency in graph.dependencies(index) {
                reachable.insert(dependency);
                reachable.extend(closure[dependency].iter().copied());
            }
            closure[index] = reachable;
        }

        let (branches, branch_count) = label_branches(graph, &order);

        debug!(
            "Resolved {} resources into {} levels across {} branches",
            count,
            levels.iter().max().map_or(0, |max| max + 1),
            branch_count
        );

        Ok(ExecutionOrder {
            order,
            position,
            levels,
            branches,
            branch_count,
            closure,
        })
    }
}

/// Walks unresolved nodes through their smallest unresolved dependency until
/// a node repeats. Every unresolved node has at least one unresolved
/// dependency, so the walk always closes a loop.
fn find_cycle(graph: &ResourceGraph, remaining: &[usize]) -> Vec<Address> {
    let stuck = |i: &usize| remaining[*i] > 0;

    let Some(start) = smallest_address(graph, (0..graph.len()).filter(stuck)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen_at = BTreeMap::from([(start, 0_usize)]);
    let mut current = start;

    while let Some(next) =
        smallest_address(graph, graph.dependencies(current).iter().copied().filter(stuck))
    {
        if let Some(&at) = seen_at.get(&next) {
            let mut cycle: Vec<Address> = path[at..]
                .iter()
                .map(|&i| graph.node(i).address.clone())
                .collect();
            cycle.push(graph.node(next).address.clone());
            return cycle;
        }
        seen_at.insert(next, path.len());
        path.push(next);
        current = next;
    }

    path.iter().map(|&i| graph.node(i).address.clone()).collect()
}

fn smallest_address(graph: &ResourceGraph, candidates: impl Iterator<Item = usize>) -> Option<usize> {
    candidates.min_by(|a, b| graph.node(*a).address.cmp(&graph.node(*b).address))
}

/// Labels weakly connected components, numbered by first appearance in `order`.
fn label_branches(graph: &ResourceGraph, order: &[usize]) -> (Vec<usize>, usize) {
    let mut branches = vec![usize::MAX; graph.len()];
    let mut next_branch = 0;

    for &start in order {
        if branches[start] != usize::MAX {
            continue;
        }
        let mut stack = vec![start];
        branches[start] = next_branch;
        while let Some(index) = stack.pop() {
            for &neighbour in graph.dependencies(index).iter().chain(graph.dependents(index)) {
                if branches[neighbour] == usize::MAX {
                    branches[neighbour] = next_branch;
                    stack.push(neighbour);
                }
            }
        }
        next_branch += 1;
    }

    (branches, next_branch)
}

impl ExecutionOrder {
    /// Returns node indices in application order.
    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Returns the position of a node in the order.
    #[must_use]
    pub fn position(&self, index: usize) -> usize {
        self.position[index]
    }

    /// Returns the depth level of a node (0 for nodes without dependencies).
    #[must_use]
    pub fn level(&self, index: usize) -> usize {
        self.levels[index]
    }

    /// Returns the branch id of a node.
    #[must_use]
    pub fn branch(&self, index: usize) -> usize {
        self.branches[index]
    }

    /// Returns the number of independent branches.
    #[must_use]
    pub const fn branch_count(&self) -> usize {
        self.branch_count
    }

    /// Returns true if `a` transitively depends on `b`.
    #[must_use]
    pub fn depends_on(&self, a: usize, b: usize) -> bool {
        self.closure[a].contains(&b)
    }

    /// Returns true if no dependency path exists between `a` and `b` in
    /// either direction.
    #[must_use]
    pub fn is_independent(&self, a: usize, b: usize) -> bool {
        a != b && !self.depends_on(a, b) && !self.depends_on(b, a)
    }

    /// Groups node indices by level, each group in application order.
    #[must_use]
    pub fn parallel_groups(&self) -> Vec<Vec<usize>> {
        let depth = self.levels.iter().max().map_or(0, |max| max + 1);
        let mut groups = vec![Vec::new(); depth];
        for &index in &self.order {
            groups[self.levels[index]].push(index);
        }
        groups
    }
}
