// src/config/builder.rs

//! Programmatic construction of plans.
//!
//! Produces the same [`PlanFile`] as a TOML plan, through the same
//! validation.

use crate::config::model::{
    ConfigSection, PlanFile, RawPlanFile, TargetConfig, TriggerConfig, TriggerTable, WorkerConfig,
};
use crate::errors::Result;
use crate::types::MemoryStrategyKind;

#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    raw: RawPlanFile,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self {
            raw: RawPlanFile {
                config: ConfigSection::default(),
                target: Vec::new(),
            },
        }
    }

    /// Add a target with default settings.
    pub fn target(self, name: &str, command: &str) -> Self {
        self.with_target(TargetConfig::new(name, command))
    }

    pub fn with_target(mut self, target: TargetConfig) -> Self {
        self.raw.target.push(target);
        self
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.raw.config.jobs = jobs;
        self
    }

    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.raw.config.keep_going = keep_going;
        self
    }

    pub fn memory_strategy(mut self, kind: MemoryStrategyKind) -> Self {
        self.raw.config.memory_strategy = kind;
        self
    }

    pub fn lock_envir(mut self, lock: bool) -> Self {
        self.raw.config.lock_envir = lock;
        self
    }

    pub fn store(mut self, dir: &str) -> Self {
        self.raw.config.store = dir.to_string();
        self
    }

    /// Append an environment script path.
    pub fn environment(mut self, script: &str) -> Self {
        self.raw.config.environment.push(script.to_string());
        self
    }

    pub fn raw(&self) -> &RawPlanFile {
        &self.raw
    }

    pub fn build(self) -> Result<PlanFile> {
        PlanFile::try_from(self.raw)
    }
}

/// Builder for a single [`TargetConfig`].
#[derive(Debug, Clone)]
pub struct TargetBuilder {
    target: TargetConfig,
}

impl TargetBuilder {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            target: TargetConfig::new(name, command),
        }
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.target.priority = priority;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.target.retries = retries;
        self
    }

    /// A named preset: `default`, `command`, `always`, `never`, `missing`.
    pub fn trigger(mut self, preset: &str) -> Self {
        self.target.trigger = Some(TriggerConfig::Preset(preset.to_string()));
        self
    }

    pub fn trigger_table(mut self, table: TriggerTable) -> Self {
        self.target.trigger = Some(TriggerConfig::Table(table));
        self
    }

    pub fn timeout(mut self, duration: &str) -> Self {
        self.target.timeout = Some(duration.to_string());
        self
    }

    pub fn cpu(mut self, duration: &str) -> Self {
        self.target.cpu = Some(duration.to_string());
        self
    }

    pub fn worker(mut self, worker: usize) -> Self {
        self.target.worker = Some(WorkerConfig::Id(worker));
        self
    }

    pub fn lock_envir(mut self, lock: bool) -> Self {
        self.target.lock_envir = Some(lock);
        self
    }

    pub fn resources(mut self, resources: toml::Value) -> Self {
        self.target.resources = Some(resources);
        self
    }

    pub fn build(self) -> TargetConfig {
        self.target
    }
}
