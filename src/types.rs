// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How dependency values are staged for the builds that read them.
///
/// - `Eager`: load a target's dependencies into a shared resident set
///   before dispatch and evict them once every consumer is finished
///   (default).
/// - `Lazy`: load a dependency inside the worker the first time the
///   command references it. Concurrent consumers may load the same value
///   more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStrategyKind {
    #[default]
    Eager,
    Lazy,
}

impl FromStr for MemoryStrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "eager" | "eager-prune" | "eager_prune" => Ok(MemoryStrategyKind::Eager),
            "lazy" => Ok(MemoryStrategyKind::Lazy),
            other => Err(format!(
                "invalid memory_strategy: {other} (expected \"eager\" or \"lazy\")"
            )),
        }
    }
}

impl fmt::Display for MemoryStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryStrategyKind::Eager => f.write_str("eager"),
            MemoryStrategyKind::Lazy => f.write_str("lazy"),
        }
    }
}

/// Worker slot number, `1..=jobs`.
pub type WorkerId = usize;
