// src/engine/report.rs

//! Outcome of a `make` run.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::engine::{RunState, TargetName};
use crate::stale::Reason;
use crate::types::WorkerId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetReport {
    pub state: RunState,
    /// Whether a build ran and was committed in this run.
    pub built: bool,
    /// Build attempts made in this run.
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the target was considered stale.
    pub reasons: Vec<Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
}

impl TargetReport {
    pub fn new() -> Self {
        Self {
            state: RunState::Waiting,
            built: false,
            attempts: 0,
            error: None,
            reasons: Vec::new(),
            worker: None,
        }
    }
}

impl Default for TargetReport {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub targets: BTreeMap<TargetName, TargetReport>,
    /// Set when the run was interrupted by an abort.
    pub aborted: bool,
    /// Dependency values loaded from the store.
    pub dep_loads: usize,
}

impl RunReport {
    /// True when every target ended Done.
    pub fn success(&self) -> bool {
        !self.aborted && self.targets.values().all(|t| t.state == RunState::Done)
    }

    pub fn state_of(&self, target: &str) -> Option<RunState> {
        self.targets.get(target).map(|t| t.state)
    }

    pub fn attempts_of(&self, target: &str) -> u32 {
        self.targets.get(target).map(|t| t.attempts).unwrap_or(0)
    }

    /// Targets built in this run, sorted.
    pub fn built(&self) -> Vec<&str> {
        self.select(|t| t.built)
    }

    /// Targets found up to date.
    pub fn skipped(&self) -> Vec<&str> {
        self.select(|t| t.state == RunState::Done && !t.built)
    }

    /// Targets that failed, including those that timed out.
    pub fn failed(&self) -> Vec<&str> {
        self.select(|t| t.state == RunState::Failed)
    }

    pub fn cancelled(&self) -> Vec<&str> {
        self.select(|t| t.state == RunState::Cancelled)
    }

    fn select(&self, keep: impl Fn(&TargetReport) -> bool) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|(_, t)| keep(t))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "built {}, up to date {}, failed {}, cancelled {}",
            self.built().len(),
            self.skipped().len(),
            self.failed().len(),
            self.cancelled().len()
        )?;
        for (name, t) in &self.targets {
            if let Some(error) = &t.error {
                writeln!(f, "  {name} ({}): {error}", t.state)?;
            }
        }
        if self.aborted {
            writeln!(f, "run aborted")?;
        }
        Ok(())
    }
}
