// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;

use crate::dag::node::NodeKind;
use crate::errors::{PipewrightError, Result};

/// Stores a node's kind and its immediate neighbours, both sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DagNode {
    kind: NodeKind,
    /// Direct dependencies: nodes this one's code references.
    deps: Vec<String>,
    /// Direct dependents: nodes whose code references this one.
    dependents: Vec<String>,
}

/// Acyclic dependency graph over targets and imports.
///
/// Edge `u -> v` means `v` references `u`. Self references are recorded in
/// [`self_loops`](Self::self_loops) but never become edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, DagNode>,
    order: Vec<String>,
    self_loops: BTreeSet<String>,
}

impl DependencyGraph {
    /// Assemble a graph from node kinds and `(from, to)` edges, rejecting cycles.
    pub fn from_parts(
        kinds: BTreeMap<String, NodeKind>,
        edges: BTreeSet<(String, String)>,
        self_loops: BTreeSet<String>,
    ) -> Result<Self> {
        let mut nodes: BTreeMap<String, DagNode> = kinds
            .into_iter()
            .map(|(name, kind)| {
                (
                    name,
                    DagNode {
                        kind,
                        deps: Vec::new(),
                        dependents: Vec::new(),
                    },
                )
            })
            .collect();

        for (from, to) in &edges {
            if let Some(node) = nodes.get_mut(to) {
                node.deps.push(from.clone());
            }
            if let Some(node) = nodes.get_mut(from) {
                node.dependents.push(to.clone());
            }
        }

        let order = topological_order(&nodes, &edges)?;
        Ok(Self {
            nodes,
            order,
            self_loops,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<NodeKind> {
        self.nodes.get(name).map(|n| n.kind)
    }

    /// All nodes with their kinds, sorted by name.
    pub fn nodes(&self) -> impl Iterator<Item = (&str, NodeKind)> {
        self.nodes.iter().map(|(name, n)| (name.as_str(), n.kind))
    }

    /// Target names, sorted.
    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.nodes()
            .filter(|(_, kind)| *kind == NodeKind::Target)
            .map(|(name, _)| name)
    }

    /// Import names, sorted.
    pub fn imports(&self) -> impl Iterator<Item = &str> {
        self.nodes()
            .filter(|(_, kind)| kind.is_import())
            .map(|(name, _)| name)
    }

    /// Immediate dependencies of a node.
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a node.
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependencies that are targets.
    pub fn target_dependencies_of(&self, name: &str) -> Vec<String> {
        self.dependencies_of(name)
            .iter()
            .filter(|d| self.kind_of(d) == Some(NodeKind::Target))
            .cloned()
            .collect()
    }

    /// Every edge as `(from, to)`, sorted.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for (name, node) in &self.nodes {
            for dep in &node.deps {
                edges.push((dep.clone(), name.clone()));
            }
        }
        edges.sort();
        edges
    }

    /// Nodes in dependency order; ties broken by name.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Nodes whose code references themselves.
    pub fn self_loops(&self) -> &BTreeSet<String> {
        &self.self_loops
    }

    /// `names` plus everything they transitively depend on.
    pub fn upstream_closure<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        self.walk(names, |n| self.dependencies_of(n))
    }

    /// `names` plus everything that transitively depends on them.
    pub fn downstream_closure<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> BTreeSet<String> {
        self.walk(names, |n| self.dependents_of(n))
    }

    fn walk<'a, 's>(
        &'s self,
        names: impl IntoIterator<Item = &'a str>,
        next: impl Fn(&str) -> &'s [String],
    ) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = names.into_iter().map(str::to_string).collect();
        while let Some(name) = queue.pop_front() {
            if !self.contains(&name) || !seen.insert(name.clone()) {
                continue;
            }
            queue.extend(next(&name).iter().cloned());
        }
        seen
    }
}

fn topological_order(
    nodes: &BTreeMap<String, DagNode>,
    edges: &BTreeSet<(String, String)>,
) -> Result<Vec<String>> {
    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in nodes.keys() {
        graph.add_node(name.as_str());
    }
    for (from, to) in edges {
        graph.add_edge(from.as_str(), to.as_str(), ());
    }

    if toposort(&graph, None).is_err() {
        let mut members: Vec<String> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .flatten()
            .map(str::to_string)
            .collect();
        members.sort();
        return Err(PipewrightError::DagCycle(members));
    }

    // Kahn's algorithm over a sorted frontier keeps the order independent
    // of insertion order.
    let mut indegree: BTreeMap<&str, usize> = nodes
        .iter()
        .map(|(name, node)| (name.as_str(), node.deps.len()))
        .collect();
    let mut frontier: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(name) = frontier.pop_first() {
        order.push(name.to_string());
        for dependent in &nodes[name].dependents {
            if let Some(d) = indegree.get_mut(dependent.as_str()) {
                *d -= 1;
                if *d == 0 {
                    frontier.insert(dependent.as_str());
                }
            }
        }
    }
    Ok(order)
}
