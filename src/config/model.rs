// src/config/model.rs

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lang::Expr;
use crate::stale::Trigger;
use crate::types::{MemoryStrategyKind, WorkerId};

/// Plan file as read from TOML, before validation.
///
/// ```toml
/// [config]
/// jobs = 2
/// environment = ["functions.pw"]
///
/// [[target]]
/// name = "raw"
/// command = 'read_lines(file_in("data/raw.csv"))'
///
/// [[target]]
/// name = "summary"
/// command = "length(raw)"
/// trigger = "command"
/// ```
///
/// Row order carries no meaning.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawPlanFile {
    #[serde(default)]
    pub config: ConfigSection,

    #[serde(default)]
    pub target: Vec<TargetConfig>,
}

/// `[config]` section.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConfigSection {
    /// Store directory, relative to the plan file.
    #[serde(default = "default_store")]
    pub store: String,

    /// Number of worker slots.
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Keep building independent targets after a failure.
    #[serde(default)]
    pub keep_going: bool,

    #[serde(default)]
    pub memory_strategy: MemoryStrategyKind,

    /// Default environment lock for every target.
    #[serde(default = "default_lock_envir")]
    pub lock_envir: bool,

    /// Environment scripts, sourced in this order.
    #[serde(default)]
    pub environment: Vec<String>,
}

fn default_store() -> String {
    ".pipewright".to_string()
}

fn default_jobs() -> usize {
    1
}

fn default_lock_envir() -> bool {
    true
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            store: default_store(),
            jobs: default_jobs(),
            keep_going: false,
            memory_strategy: MemoryStrategyKind::default(),
            lock_envir: default_lock_envir(),
            environment: Vec::new(),
        }
    }
}

/// One `[[target]]` row.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TargetConfig {
    pub name: String,

    /// Source text of the command.
    pub command: String,

    #[serde(default)]
    pub priority: f64,

    #[serde(default)]
    pub retries: u32,

    #[serde(default)]
    pub trigger: Option<TriggerConfig>,

    /// Elapsed wall-clock limit, e.g. `"30s"`.
    #[serde(default)]
    pub timeout: Option<String>,

    /// Compute budget, e.g. `"10s"`.
    #[serde(default)]
    pub cpu: Option<String>,

    /// Preferred worker slot; a number or a numeric string.
    #[serde(default)]
    pub worker: Option<WorkerConfig>,

    /// Overrides `[config].lock_envir` for this target.
    #[serde(default)]
    pub lock_envir: Option<bool>,

    /// Opaque hints, recorded in build metadata.
    #[serde(default)]
    pub resources: Option<toml::Value>,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            priority: 0.0,
            retries: 0,
            trigger: None,
            timeout: None,
            cpu: None,
            worker: None,
            lock_envir: None,
            resources: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum WorkerConfig {
    Id(usize),
    Name(String),
}

/// `trigger = "command"` or an inline table.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TriggerConfig {
    Preset(String),
    Table(TriggerTable),
}

/// Flags default to the `default` preset (all on).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TriggerTable {
    #[serde(default = "default_true")]
    pub command: bool,
    #[serde(default = "default_true")]
    pub depend: bool,
    #[serde(default = "default_true")]
    pub file: bool,
    #[serde(default = "default_true")]
    pub missing: bool,
    /// Expression; rebuild whenever it is `TRUE`.
    #[serde(default)]
    pub condition: Option<String>,
    /// Expression; rebuild whenever its value changes.
    #[serde(default)]
    pub change: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TriggerTable {
    fn default() -> Self {
        Self {
            command: true,
            depend: true,
            file: true,
            missing: true,
            condition: None,
            change: None,
        }
    }
}

/// A validated target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetDef {
    pub name: String,
    pub command: Expr,
    pub priority: f64,
    pub retries: u32,
    pub trigger: Trigger,
    pub timeout: Option<Duration>,
    pub cpu: Option<Duration>,
    pub worker: Option<WorkerId>,
    pub lock_envir: Option<bool>,
    pub resources: Option<serde_json::Value>,
}

impl TargetDef {
    /// A target with default settings.
    pub fn new(name: impl Into<String>, command: Expr) -> Self {
        Self {
            name: name.into(),
            command,
            priority: 0.0,
            retries: 0,
            trigger: Trigger::default(),
            timeout: None,
            cpu: None,
            worker: None,
            lock_envir: None,
            resources: None,
        }
    }
}

/// A validated plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanFile {
    pub config: ConfigSection,
    /// Targets in plan order.
    pub targets: Vec<TargetDef>,
}

impl PlanFile {
    /// Assemble a plan without validating it. Used by the `TryFrom`
    /// implementation after checks pass.
    pub fn new_unchecked(config: ConfigSection, targets: Vec<TargetDef>) -> Self {
        Self { config, targets }
    }

    pub fn target(&self, name: &str) -> Option<&TargetDef> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.name.as_str())
    }
}
