// src/dag/export.rs

//! Read-only snapshot of the graph for external visualisation.

use serde::Serialize;

use crate::dag::graph::DependencyGraph;
use crate::dag::node::NodeKind;
use crate::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    UpToDate,
    Outdated,
    /// The latest build attempt failed.
    Failed,
    /// Never built.
    Missing,
    Import,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportNode {
    pub name: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphExport {
    pub nodes: Vec<ExportNode>,
    pub edges: Vec<ExportEdge>,
}

impl GraphExport {
    /// Snapshot `graph`, asking `target_status` for the status of each target.
    pub fn new(graph: &DependencyGraph, target_status: impl Fn(&str) -> NodeStatus) -> Self {
        let nodes = graph
            .nodes()
            .map(|(name, kind)| ExportNode {
                name: name.to_string(),
                kind,
                status: if kind.is_import() {
                    NodeStatus::Import
                } else {
                    target_status(name)
                },
            })
            .collect();
        let edges = graph
            .edges()
            .into_iter()
            .map(|(from, to)| ExportEdge { from, to })
            .collect();
        Self { nodes, edges }
    }

    pub fn node(&self, name: &str) -> Option<&ExportNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
