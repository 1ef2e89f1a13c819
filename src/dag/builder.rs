// src/dag/builder.rs

//! Resolve extracted dependencies into a [`DependencyGraph`].

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::dag::graph::DependencyGraph;
use crate::dag::node::{file_node, NodeKind};
use crate::errors::{PipewrightError, Result};
use crate::extract::Deps;
use crate::imports::ImportTable;

/// Build the graph for `targets` (name -> extracted dependencies).
///
/// Names resolve to targets first, then imports; anything else (natives,
/// locals of other scopes, typos) is ignored. Input files produced by a
/// target become edges from that target; other input files become file
/// nodes. Imports only ever depend on other imports.
pub fn build_graph(targets: &BTreeMap<String, Deps>, imports: &ImportTable) -> Result<DependencyGraph> {
    let producers = output_producers(targets)?;

    let mut builder = Builder {
        targets,
        imports,
        kinds: BTreeMap::new(),
        edges: BTreeSet::new(),
        self_loops: BTreeSet::new(),
    };

    for name in targets.keys() {
        builder.kinds.insert(name.clone(), NodeKind::Target);
    }

    for (name, deps) in targets {
        for symbol in deps.referenced_names() {
            builder.resolve_target_ref(name, &symbol);
        }
        for ns in &deps.namespaced {
            builder.add_import_node(ns, NodeKind::Namespaced);
            builder.edge(ns, name);
        }
        for path in deps.input_files() {
            match producers.get(&path) {
                Some(producer) if producer == name => {
                    trace!(target = %name, file = %path, "target reads its own output file");
                }
                Some(producer) => builder.edge(producer, name),
                None => {
                    let node = file_node(&path);
                    builder.add_import_node(&node, NodeKind::File);
                    builder.edge(&node, name);
                }
            }
        }
    }

    let graph = DependencyGraph::from_parts(builder.kinds, builder.edges, builder.self_loops)?;
    debug!(
        nodes = graph.nodes().count(),
        edges = graph.edges().len(),
        "built dependency graph"
    );
    Ok(graph)
}

/// Map every declared output file to the target producing it.
fn output_producers(targets: &BTreeMap<String, Deps>) -> Result<BTreeMap<String, String>> {
    let mut producers: BTreeMap<String, String> = BTreeMap::new();
    for (name, deps) in targets {
        for path in &deps.file_out {
            if let Some(other) = producers.insert(path.clone(), name.clone()) {
                return Err(PipewrightError::ConfigError(format!(
                    "output file '{path}' is declared by both '{other}' and '{name}'"
                )));
            }
        }
    }
    Ok(producers)
}

struct Builder<'a> {
    targets: &'a BTreeMap<String, Deps>,
    imports: &'a ImportTable,
    kinds: BTreeMap<String, NodeKind>,
    edges: BTreeSet<(String, String)>,
    self_loops: BTreeSet<String>,
}

impl Builder<'_> {
    fn edge(&mut self, from: &str, to: &str) {
        if from == to {
            self.self_loops.insert(to.to_string());
            return;
        }
        self.edges.insert((from.to_string(), to.to_string()));
    }

    fn add_import_node(&mut self, name: &str, kind: NodeKind) -> bool {
        if self.kinds.contains_key(name) {
            return false;
        }
        self.kinds.insert(name.to_string(), kind);
        true
    }

    fn resolve_target_ref(&mut self, target: &str, symbol: &str) {
        if self.targets.contains_key(symbol) {
            self.edge(symbol, target);
        } else if self.imports.contains(symbol) {
            self.add_import(symbol);
            self.edge(symbol, target);
        } else {
            trace!(target, symbol, "unresolved symbol ignored");
        }
    }

    /// Add an import node and, recursively, the imports it references.
    fn add_import(&mut self, name: &str) {
        let Some(def) = self.imports.get(name) else {
            return;
        };
        if !self.add_import_node(name, def.kind) {
            return;
        }
        for symbol in def.deps.symbols.iter().chain(def.wraps.iter()) {
            if symbol == name {
                self.self_loops.insert(name.to_string());
            } else if self.imports.contains(symbol) && !self.targets.contains_key(symbol) {
                self.add_import(symbol);
                self.edge(symbol, name);
            }
        }
        for ns in &def.deps.namespaced {
            self.add_import_node(ns, NodeKind::Namespaced);
            self.edge(ns, name);
        }
        for path in &def.deps.file_in {
            let node = file_node(path);
            self.add_import_node(&node, NodeKind::File);
            self.edge(&node, name);
        }
    }
}
