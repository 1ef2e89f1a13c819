// src/dag/mod.rs

//! The dependency graph.
//!
//! - [`node`] defines node kinds (targets and the import kinds).
//! - [`builder`] resolves extracted dependencies into nodes and edges.
//! - [`graph`] holds the acyclic graph and its deterministic topological order.
//! - [`export`] produces the read-only snapshot used for visualisation.

pub mod builder;
pub mod export;
pub mod graph;
pub mod node;

pub use builder::build_graph;
pub use export::{ExportEdge, ExportNode, GraphExport, NodeStatus};
pub use graph::DependencyGraph;
pub use node::{file_node, file_path, NodeKind};
