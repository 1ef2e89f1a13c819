// src/engine/scheduler.rs

//! Pure scheduler core.
//!
//! Tracks the run state of every participating target and decides what may
//! be dispatched next. No IO, no clocks, no channels: the async coordinator
//! feeds it completions and asks it for dispatches, and tests can step it by
//! hand.
//!
//! Life of a target:
//!
//! ```text
//! Waiting --(deps done)--> Ready --(stale)--> queued --(slot free)--> Running
//!                            |                                          |
//!                            +--(up to date)--> Done <--(success)-------+
//!                                                         Failed / Cancelled
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::engine::{RunState, TargetName};
use crate::types::WorkerId;

/// Static description of one target for the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub name: TargetName,
    /// Higher runs first.
    pub priority: f64,
    /// Extra attempts after the first one fails.
    pub retries: u32,
    /// Preferred worker slot.
    pub worker: Option<WorkerId>,
    /// Targets that must be done first. Names outside the run are ignored.
    pub deps: Vec<TargetName>,
}

impl TaskSpec {
    pub fn new(name: impl Into<TargetName>) -> Self {
        Self {
            name: name.into(),
            priority: 0.0,
            retries: 0,
            worker: None,
            deps: Vec::new(),
        }
    }
}

/// How a target left the Ready or Running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Built successfully.
    Success,
    /// Found up to date; no build needed.
    UpToDate,
    Failed { retryable: bool },
    TimedOut { retryable: bool },
    Cancelled,
}

/// What changed as a result of one completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStep {
    /// Targets whose dependencies are now all done. The caller decides
    /// whether each one needs building.
    pub newly_ready: Vec<TargetName>,
    /// Targets cancelled because of a failure.
    pub cancelled: Vec<TargetName>,
    /// Set when the completed target was re-queued for another attempt.
    pub retrying: Option<TargetName>,
}

/// A build the coordinator should start now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub name: TargetName,
    pub worker: WorkerId,
    /// 1 for the first attempt.
    pub attempt: u32,
}

/// Ready-queue key: higher priority first, then lexical name.
#[derive(Debug, Clone, PartialEq)]
struct ReadyKey {
    priority: f64,
    name: TargetName,
}

impl Eq for ReadyKey {}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct TaskInfo {
    spec: TaskSpec,
    state: RunState,
    attempts: u32,
    worker: Option<WorkerId>,
    dependents: Vec<TargetName>,
}

#[derive(Debug)]
pub struct Scheduler {
    tasks: BTreeMap<TargetName, TaskInfo>,
    queue: BTreeSet<ReadyKey>,
    free_workers: BTreeSet<WorkerId>,
    jobs: usize,
    keep_going: bool,
    /// Set after a terminal failure without keep-going, or an abort.
    halted: bool,
}

impl Scheduler {
    pub fn new(specs: impl IntoIterator<Item = TaskSpec>, jobs: usize, keep_going: bool) -> Self {
        let jobs = jobs.max(1);
        let mut tasks: BTreeMap<TargetName, TaskInfo> = specs
            .into_iter()
            .map(|spec| {
                let worker = match spec.worker {
                    Some(w) if (1..=jobs).contains(&w) => Some(w),
                    Some(w) => {
                        warn!(target = %spec.name, worker = w, jobs, "preferred worker out of range; ignoring");
                        None
                    }
                    None => None,
                };
                (
                    spec.name.clone(),
                    TaskInfo {
                        spec: TaskSpec { worker, ..spec },
                        state: RunState::Waiting,
                        attempts: 0,
                        worker: None,
                        dependents: Vec::new(),
                    },
                )
            })
            .collect();

        // Drop dependencies outside the run and wire up dependents.
        let names: BTreeSet<TargetName> = tasks.keys().cloned().collect();
        let mut dependents: BTreeMap<TargetName, Vec<TargetName>> = BTreeMap::new();
        for (name, info) in tasks.iter_mut() {
            info.spec.deps.retain(|d| names.contains(d) && d != name);
            info.spec.deps.sort();
            info.spec.deps.dedup();
            for dep in &info.spec.deps {
                dependents.entry(dep.clone()).or_default().push(name.clone());
            }
        }
        for (name, list) in dependents {
            if let Some(info) = tasks.get_mut(&name) {
                info.dependents = list;
            }
        }

        Self {
            tasks,
            queue: BTreeSet::new(),
            free_workers: (1..=jobs).collect(),
            jobs,
            keep_going,
            halted: false,
        }
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    pub fn state_of(&self, name: &str) -> Option<RunState> {
        self.tasks.get(name).map(|t| t.state)
    }

    /// Number of times the target has been dispatched.
    pub fn attempts_of(&self, name: &str) -> u32 {
        self.tasks.get(name).map(|t| t.attempts).unwrap_or(0)
    }

    /// Every target with its current state, sorted by name.
    pub fn states(&self) -> impl Iterator<Item = (&str, RunState)> {
        self.tasks.iter().map(|(name, t)| (name.as_str(), t.state))
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn running(&self) -> Vec<TargetName> {
        self.in_state(RunState::Running)
    }

    /// Move every target without dependencies to Ready.
    pub fn start(&mut self) -> Vec<TargetName> {
        let roots: Vec<TargetName> = self
            .tasks
            .values()
            .filter(|t| t.state == RunState::Waiting && t.spec.deps.is_empty())
            .map(|t| t.spec.name.clone())
            .collect();
        for name in &roots {
            self.set_state(name, RunState::Ready);
        }
        info!(targets = self.tasks.len(), ready = roots.len(), jobs = self.jobs, "scheduler started");
        roots
    }

    /// A Ready target turned out stale: put it in the dispatch queue.
    pub fn queue_for_build(&mut self, name: &str) {
        let Some(info) = self.tasks.get(name) else {
            warn!(target = %name, "queue_for_build for unknown target; ignoring");
            return;
        };
        if info.state != RunState::Ready {
            warn!(target = %name, state = ?info.state, "queue_for_build outside Ready; ignoring");
            return;
        }
        self.queue.insert(ReadyKey {
            priority: info.spec.priority,
            name: name.to_string(),
        });
    }

    /// Queued targets in dispatch order.
    pub fn queued(&self) -> Vec<TargetName> {
        self.queue.iter().map(|k| k.name.clone()).collect()
    }

    /// Pop the next queued target that can run on a free worker.
    ///
    /// A target with a preferred worker waits for that slot; the others take
    /// the lowest free slot.
    pub fn next_dispatch(&mut self) -> Option<Dispatch> {
        if self.halted || self.free_workers.is_empty() {
            return None;
        }

        let key = self.queue.iter().find(|key| {
            match self.tasks.get(&key.name).and_then(|t| t.spec.worker) {
                Some(w) => self.free_workers.contains(&w),
                None => true,
            }
        })?;
        let key = key.clone();
        self.queue.remove(&key);

        let info = self.tasks.get_mut(&key.name)?;
        let worker = match info.spec.worker {
            Some(w) => w,
            None => *self.free_workers.first()?,
        };
        self.free_workers.remove(&worker);
        info.state = RunState::Running;
        info.attempts += 1;
        info.worker = Some(worker);

        debug!(target = %key.name, worker, attempt = info.attempts, "dispatching");
        Some(Dispatch {
            name: key.name,
            worker,
            attempt: info.attempts,
        })
    }

    /// Record how a Ready or Running target finished.
    pub fn complete(&mut self, name: &str, outcome: TaskOutcome) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        let Some(info) = self.tasks.get_mut(name) else {
            warn!(target = %name, "completion for unknown target; ignoring");
            return step;
        };
        if !matches!(info.state, RunState::Ready | RunState::Running) {
            debug!(target = %name, state = ?info.state, "completion for settled target; ignoring");
            return step;
        }
        if let Some(worker) = info.worker.take() {
            self.free_workers.insert(worker);
        }

        let retryable = match outcome {
            TaskOutcome::Failed { retryable } | TaskOutcome::TimedOut { retryable } => retryable,
            _ => false,
        };
        if retryable && info.attempts <= info.spec.retries && !self.halted {
            info!(
                target = %name,
                attempt = info.attempts,
                retries = info.spec.retries,
                "build failed; retrying"
            );
            info.state = RunState::Ready;
            let key = ReadyKey {
                priority: info.spec.priority,
                name: name.to_string(),
            };
            self.queue.insert(key);
            step.retrying = Some(name.to_string());
            return step;
        }

        match outcome {
            TaskOutcome::Success | TaskOutcome::UpToDate => {
                self.set_state(name, RunState::Done);
                step.newly_ready = self.promote_dependents(name);
            }
            TaskOutcome::Failed { .. } | TaskOutcome::TimedOut { .. } => {
                if matches!(outcome, TaskOutcome::TimedOut { .. }) {
                    warn!(target = %name, attempts = info.attempts, "target timed out on its last attempt");
                }
                self.set_state(name, RunState::Failed);
                step.cancelled = if self.keep_going {
                    self.cancel_dependents(name)
                } else {
                    warn!(target = %name, "target failed; halting (keep_going = false)");
                    self.halted = true;
                    self.cancel_pending()
                };
            }
            TaskOutcome::Cancelled => {
                self.set_state(name, RunState::Cancelled);
                step.cancelled = self.cancel_dependents(name);
            }
        }
        step
    }

    /// Global abort: every non-terminal target becomes Cancelled.
    ///
    /// Returns the targets that were running.
    pub fn abort(&mut self) -> Vec<TargetName> {
        let running = self.running();
        self.halted = true;
        self.queue.clear();
        for info in self.tasks.values_mut() {
            if !info.state.is_terminal() {
                info.state = RunState::Cancelled;
            }
            if let Some(worker) = info.worker.take() {
                self.free_workers.insert(worker);
            }
        }
        warn!(running = running.len(), "run aborted");
        running
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.state.is_terminal())
    }

    fn in_state(&self, state: RunState) -> Vec<TargetName> {
        self.tasks
            .values()
            .filter(|t| t.state == state)
            .map(|t| t.spec.name.clone())
            .collect()
    }

    fn set_state(&mut self, name: &str, state: RunState) {
        if let Some(info) = self.tasks.get_mut(name) {
            debug!(target = %name, from = ?info.state, to = ?state, "state change");
            info.state = state;
        }
    }

    /// Move Waiting dependents of `name` whose dependencies are all Done to Ready.
    fn promote_dependents(&mut self, name: &str) -> Vec<TargetName> {
        let dependents = self
            .tasks
            .get(name)
            .map(|t| t.dependents.clone())
            .unwrap_or_default();

        let mut ready = Vec::new();
        for dependent in dependents {
            let Some(info) = self.tasks.get(&dependent) else {
                continue;
            };
            if info.state != RunState::Waiting {
                continue;
            }
            let satisfied = info
                .spec
                .deps
                .iter()
                .all(|d| self.state_of(d) == Some(RunState::Done));
            if satisfied {
                self.set_state(&dependent, RunState::Ready);
                ready.push(dependent);
            }
        }
        ready
    }

    /// Cancel every non-terminal transitive dependent of `failed`.
    fn cancel_dependents(&mut self, failed: &str) -> Vec<TargetName> {
        let mut stack: Vec<TargetName> = self
            .tasks
            .get(failed)
            .map(|t| t.dependents.clone())
            .unwrap_or_default();
        let mut cancelled = Vec::new();

        while let Some(name) = stack.pop() {
            let Some(info) = self.tasks.get_mut(&name) else {
                continue;
            };
            if info.state.is_terminal() || info.state == RunState::Running {
                continue;
            }
            info.state = RunState::Cancelled;
            self.queue.retain(|k| k.name != name);
            debug!(target = %name, upstream = %failed, "cancelled by upstream failure");
            stack.extend(info.dependents.iter().cloned());
            cancelled.push(name);
        }
        cancelled.sort();
        cancelled
    }

    /// Cancel every Waiting or Ready target.
    fn cancel_pending(&mut self) -> Vec<TargetName> {
        self.queue.clear();
        let mut cancelled = Vec::new();
        for info in self.tasks.values_mut() {
            if matches!(info.state, RunState::Waiting | RunState::Ready) {
                info.state = RunState::Cancelled;
                cancelled.push(info.spec.name.clone());
            }
        }
        cancelled
    }
}
