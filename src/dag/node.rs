// src/dag/node.rs

use std::fmt;

use serde::Serialize;

/// What a graph node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Target,
    /// A function defined by an environment script.
    Function,
    /// Any other value defined by an environment script.
    Object,
    /// A declared input file that no target produces.
    File,
    /// A `pkg::name` reference.
    Namespaced,
    /// A generic function. Calls depend on the generic, never on the method
    /// that runs.
    DispatchPoint,
}

impl NodeKind {
    pub fn is_import(self) -> bool {
        self != NodeKind::Target
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Target => "target",
            NodeKind::Function => "function",
            NodeKind::Object => "object",
            NodeKind::File => "file",
            NodeKind::Namespaced => "namespaced",
            NodeKind::DispatchPoint => "dispatch_point",
        };
        f.write_str(s)
    }
}

/// Graph node name of a declared file. Quoting keeps file nodes apart from
/// symbols that happen to look like paths.
pub fn file_node(path: &str) -> String {
    format!("\"{path}\"")
}

/// Path of a file node created by [`file_node`].
pub fn file_path(node: &str) -> Option<&str> {
    node.strip_prefix('"')?.strip_suffix('"')
}
