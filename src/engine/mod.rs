// src/engine/mod.rs

//! Scheduler/executor for builds.
//!
//! The pure state machine lives in [`scheduler`]; the async coordinator that
//! drives it, talks to the store and spawns workers is in [`runtime`].

pub mod assess;
pub mod memory;
pub mod report;
pub mod runtime;
pub mod scheduler;
pub mod worker;

use std::fmt;

use serde::Serialize;

use crate::lang::CancelToken;
use crate::types::MemoryStrategyKind;

/// Canonical target name type used throughout the engine.
pub type TargetName = String;

/// Per-run state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Some dependency is not done yet.
    Waiting,
    /// Dependencies done; being assessed or queued for a worker.
    Ready,
    Running,
    Done,
    /// Errored or timed out on its last attempt.
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Done | RunState::Failed | RunState::Cancelled
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Waiting => "waiting",
            RunState::Ready => "ready",
            RunState::Running => "running",
            RunState::Done => "done",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Options for one `make` run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    /// Number of worker slots.
    pub jobs: usize,
    pub keep_going: bool,
    pub memory: MemoryStrategyKind,
    /// Restrict the run to these targets and everything upstream of them.
    pub targets: Option<Vec<TargetName>>,
    /// Environment lock applied to targets without their own `lock_envir`.
    pub lock_envir: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            jobs: 1,
            keep_going: false,
            memory: MemoryStrategyKind::Eager,
            targets: None,
            lock_envir: true,
        }
    }
}

/// Lets another task abort a running `make`.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    cancel: CancelToken,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn aborted(&self) {
        self.cancel.cancelled().await
    }
}

pub use memory::{EagerPrune, Lazy, MemoryStrategy};
pub use report::{RunReport, TargetReport};
pub use runtime::{BuildPlan, Runtime};
pub use scheduler::{Dispatch, Scheduler, SchedulerStep, TaskOutcome, TaskSpec};
