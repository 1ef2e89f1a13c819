// src/engine/runtime.rs

//! Async coordinator for a `make` run.
//!
//! Owns the [`Scheduler`], assesses targets as they become Ready, spawns
//! workers for stale ones, and commits their results. Build results come
//! back over an mpsc channel. When the store does not accept concurrent
//! writers, every write goes through this loop.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::TargetDef;
use crate::dag::{DependencyGraph, NodeKind};
use crate::engine::assess::Assessor;
use crate::engine::memory::{strategy_for, MemoryStrategy};
use crate::engine::report::RunReport;
use crate::engine::scheduler::{Dispatch, Scheduler, SchedulerStep, TaskOutcome, TaskSpec};
use crate::engine::worker::{self, BuildJob, BuildResult, FailureKind};
use crate::engine::{AbortHandle, RunOptions, RunState, TargetName};
use crate::errors::{PipewrightError, Result};
use crate::extract::Deps;
use crate::lang::{CancelToken, DepSource, EnvLock, EvalContext, NoDeps};
use crate::store::{
    Attempt, BuildMeta, BuildStatus, Diagnostic, FileHashCache, Fingerprint, FingerprintParts,
    FingerprintStore,
};

/// Everything static about a run: the resolved plan.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub graph: DependencyGraph,
    pub targets: BTreeMap<TargetName, TargetDef>,
    pub deps: BTreeMap<TargetName, Deps>,
    /// Fingerprints of every import node, computed for this run.
    pub import_fingerprints: BTreeMap<String, Fingerprint>,
}

impl BuildPlan {
    /// Targets taking part in a run restricted to `requested` (all when
    /// `None`): the requested ones and everything upstream.
    pub fn participants(&self, requested: Option<&[TargetName]>) -> Result<BTreeSet<TargetName>> {
        let Some(requested) = requested else {
            return Ok(self.targets.keys().cloned().collect());
        };
        for name in requested {
            if !self.targets.contains_key(name) {
                return Err(PipewrightError::TargetNotFound(name.clone()));
            }
        }
        Ok(self
            .graph
            .upstream_closure(requested.iter().map(String::as_str))
            .into_iter()
            .filter(|n| self.graph.kind_of(n) == Some(NodeKind::Target))
            .collect())
    }
}

pub struct Runtime {
    plan: Arc<BuildPlan>,
    ctx: Arc<EvalContext>,
    store: Arc<dyn FingerprintStore>,
    options: RunOptions,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.options)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(
        plan: Arc<BuildPlan>,
        ctx: Arc<EvalContext>,
        store: Arc<dyn FingerprintStore>,
        options: RunOptions,
    ) -> Self {
        Self {
            plan,
            ctx,
            store,
            options,
        }
    }

    /// Drive every participating target to a terminal state.
    ///
    /// Returns `Err` only for problems that stop the whole run (unknown
    /// requested targets, store failures). Target failures are in the report.
    pub async fn run(self, abort: AbortHandle) -> Result<RunReport> {
        let participants = self.plan.participants(self.options.targets.as_deref())?;

        let specs: Vec<TaskSpec> = participants
            .iter()
            .filter_map(|name| self.plan.targets.get(name))
            .map(|def| TaskSpec {
                name: def.name.clone(),
                priority: def.priority,
                retries: def.retries,
                worker: def.worker,
                deps: self.plan.graph.target_dependencies_of(&def.name),
            })
            .collect();

        let mut consumers: BTreeMap<TargetName, Vec<TargetName>> = BTreeMap::new();
        for spec in &specs {
            for dep in &spec.deps {
                consumers.entry(dep.clone()).or_default().push(spec.name.clone());
            }
        }

        info!(
            targets = specs.len(),
            jobs = self.options.jobs,
            keep_going = self.options.keep_going,
            memory = %self.options.memory,
            "starting run"
        );

        let mut coordinator = Coordinator {
            scheduler: Scheduler::new(specs, self.options.jobs, self.options.keep_going),
            strategy: strategy_for(self.options.memory, self.store.clone(), consumers),
            lock: EnvLock::acquire(self.ctx.shared.clone(), self.options.lock_envir),
            fingerprints: self.plan.import_fingerprints.clone(),
            files: FileHashCache::new(),
            report: RunReport::default(),
            staged: BTreeMap::new(),
            pending: BTreeMap::new(),
            attempts: BTreeMap::new(),
            running: BTreeMap::new(),
            plan: self.plan,
            ctx: self.ctx,
            store: self.store,
        };
        for name in &participants {
            coordinator.report.targets.insert(name.clone(), Default::default());
        }

        let (tx, rx) = mpsc::channel::<BuildResult>(64);
        match coordinator.drive(&abort, tx, rx).await {
            Ok(()) => Ok(coordinator.finish()),
            Err(e) => {
                error!(error = %e, "run stopped");
                coordinator.cancel_running();
                Err(e)
            }
        }
    }
}

struct Coordinator {
    plan: Arc<BuildPlan>,
    ctx: Arc<EvalContext>,
    store: Arc<dyn FingerprintStore>,
    scheduler: Scheduler,
    strategy: Arc<dyn MemoryStrategy>,
    lock: EnvLock,
    /// Final fingerprint of every resolved node.
    fingerprints: BTreeMap<String, Fingerprint>,
    files: FileHashCache,
    report: RunReport,
    /// Dependency values staged for queued targets.
    staged: BTreeMap<TargetName, Arc<dyn DepSource>>,
    /// Fingerprint components of targets queued for building.
    pending: BTreeMap<TargetName, FingerprintParts>,
    attempts: BTreeMap<TargetName, Vec<Attempt>>,
    running: BTreeMap<TargetName, CancelToken>,
}

impl Coordinator {
    async fn drive(
        &mut self,
        abort: &AbortHandle,
        tx: mpsc::Sender<BuildResult>,
        mut rx: mpsc::Receiver<BuildResult>,
    ) -> Result<()> {
        let mut worklist: VecDeque<TargetName> = self.scheduler.start().into();

        loop {
            if abort.is_aborted() {
                self.abort();
                return Ok(());
            }

            while let Some(name) = worklist.pop_front() {
                let step = self.on_ready(&name)?;
                self.absorb(&step, &mut worklist);
            }

            while let Some(dispatch) = self.scheduler.next_dispatch() {
                self.dispatch(dispatch, &tx)?;
            }

            if self.scheduler.all_terminal() {
                return Ok(());
            }
            if self.running.is_empty() {
                warn!("no build running but targets remain unsettled; stopping");
                return Ok(());
            }

            tokio::select! {
                Some(result) = rx.recv() => {
                    let step = self.on_result(result)?;
                    self.absorb(&step, &mut worklist);
                }
                _ = abort.aborted() => {
                    self.abort();
                    return Ok(());
                }
            }
        }
    }

    /// A target's dependencies are all done: decide whether it needs a build.
    fn on_ready(&mut self, name: &str) -> Result<SchedulerStep> {
        let plan = self.plan.clone();
        let (Some(def), Some(deps)) = (plan.targets.get(name), plan.deps.get(name)) else {
            warn!(target = %name, "ready target missing from plan; skipping");
            return Ok(SchedulerStep::default());
        };

        // Trigger expressions may read dependency values.
        let values: Arc<dyn DepSource> = if def.trigger.expressions().next().is_some() {
            let staged = self.stage(name)?;
            self.staged.insert(name.to_string(), staged.clone());
            staged
        } else {
            Arc::new(NoDeps)
        };

        let assessor = Assessor {
            graph: &plan.graph,
            ctx: &self.ctx,
            store: self.store.as_ref(),
        };
        let assessment = match assessor.assess(def, deps, &self.fingerprints, &mut self.files, values.as_ref()) {
            Ok(assessment) => assessment,
            Err(e @ PipewrightError::Store { .. }) => return Err(e),
            Err(e) => {
                let message = e.to_string();
                warn!(target = %name, error = %message, "cannot assess target");
                let meta = BuildMeta {
                    error: Some(message.clone()),
                    finished_at: crate::store::now_secs(),
                    ..BuildMeta::default()
                };
                self.put_diagnostic(name, meta)?;
                self.report_error(name, message);
                let step = self.scheduler.complete(name, TaskOutcome::Failed { retryable: false });
                self.settle(name);
                return Ok(step);
            }
        };

        if let (false, Some(entry)) = (assessment.staleness.needs_build(), &assessment.entry) {
            debug!(target = %name, "up to date");
            // The cached build is current again; an older failure no longer applies.
            self.store.clear_diagnostic(name)?;
            self.fingerprints.insert(name.to_string(), entry.fingerprint.clone());
            let step = self.scheduler.complete(name, TaskOutcome::UpToDate);
            self.settle(name);
            return Ok(step);
        }

        let reasons = assessment.staleness.reasons();
        info!(
            target = %name,
            reasons = %reasons.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "),
            "outdated"
        );
        if let Some(report) = self.report.targets.get_mut(name) {
            report.reasons = reasons;
        }
        self.pending.insert(name.to_string(), assessment.state.parts);
        self.scheduler.queue_for_build(name);
        Ok(SchedulerStep::default())
    }

    fn stage(&self, name: &str) -> Result<Arc<dyn DepSource>> {
        let deps = self.plan.graph.target_dependencies_of(name);
        self.strategy.stage(name, &deps)
    }

    fn dispatch(&mut self, dispatch: Dispatch, tx: &mpsc::Sender<BuildResult>) -> Result<()> {
        let Dispatch {
            name,
            worker,
            attempt,
        } = dispatch;
        let plan = self.plan.clone();
        let Some(def) = plan.targets.get(&name) else {
            return Err(PipewrightError::TargetNotFound(name));
        };
        let deps = plan.deps.get(&name).cloned().unwrap_or_default();

        let values = match self.staged.get(&name) {
            Some(values) => values.clone(),
            None => {
                let values = self.stage(&name)?;
                self.staged.insert(name.clone(), values.clone());
                values
            }
        };
        let parts = match self.pending.get(&name) {
            Some(parts) => parts.clone(),
            None => {
                return Err(PipewrightError::Build {
                    target: name,
                    message: "dispatched without an assessment".to_string(),
                });
            }
        };

        let cancel = CancelToken::new();
        self.running.insert(name.clone(), cancel.clone());
        if let Some(report) = self.report.targets.get_mut(&name) {
            report.state = RunState::Running;
            report.attempts = attempt;
            report.worker = Some(worker);
        }

        let job = BuildJob {
            target: name.clone(),
            command: def.command.clone(),
            attempt,
            worker,
            timeout: def.timeout,
            cpu: def.cpu,
            outputs: deps.file_out.iter().cloned().collect(),
            parts,
            previous_attempts: self.attempts.get(&name).cloned().unwrap_or_default(),
            resources: def.resources.clone(),
            ctx: self.ctx.clone(),
            token: self.lock.token(&name, def.lock_envir),
            deps: values,
            cancel,
            store: self.store.concurrent_writes().then(|| self.store.clone()),
        };
        tokio::spawn(worker::run_build(job, tx.clone()));
        Ok(())
    }

    fn on_result(&mut self, result: BuildResult) -> Result<SchedulerStep> {
        let target = result.target.clone();
        self.running.remove(&target);
        if self.scheduler.state_of(&target) != Some(RunState::Running) {
            debug!(target = %target, "result for a target no longer running; discarding");
            return Ok(SchedulerStep::default());
        }
        self.attempts
            .entry(target.clone())
            .or_default()
            .push(result.attempt.clone());

        match result.outcome {
            Ok(built) => {
                let mut entry = built.entry;
                if !built.committed {
                    worker::commit(self.store.as_ref(), &mut entry, &built.value)
                        .map_err(|message| PipewrightError::store(target.clone(), message))?;
                }
                self.store.clear_diagnostic(&target)?;
                for path in entry.parts.outputs.keys() {
                    self.files.invalidate(&self.ctx.root.join(path));
                }
                self.fingerprints.insert(target.clone(), entry.fingerprint.clone());
                self.strategy.on_built(&target, built.value);
                if let Some(report) = self.report.targets.get_mut(&target) {
                    report.built = true;
                    report.error = None;
                }
                let step = self.scheduler.complete(&target, TaskOutcome::Success);
                self.settle(&target);
                Ok(step)
            }
            Err(failure) => {
                let outcome = match failure.kind {
                    FailureKind::Store => {
                        return Err(PipewrightError::store(target, failure.message));
                    }
                    FailureKind::Error => TaskOutcome::Failed { retryable: true },
                    FailureKind::Timeout => TaskOutcome::TimedOut { retryable: true },
                    FailureKind::Integrity => TaskOutcome::Failed { retryable: false },
                    FailureKind::Cancelled => TaskOutcome::Cancelled,
                };
                let message = match (&failure.kind, &failure.binding) {
                    (FailureKind::Integrity, Some(binding)) => PipewrightError::EnvironmentIntegrity {
                        target: target.clone(),
                        binding: binding.clone(),
                    }
                    .to_string(),
                    (FailureKind::Timeout, _) => PipewrightError::Timeout {
                        target: target.clone(),
                        message: failure.message.clone(),
                    }
                    .to_string(),
                    _ => failure.message.clone(),
                };
                self.report_error(&target, message.clone());

                let step = self.scheduler.complete(&target, outcome);
                if step.retrying.is_some() {
                    return Ok(step);
                }
                if failure.kind != FailureKind::Cancelled {
                    let mut meta = result.meta;
                    meta.error = Some(message);
                    self.put_diagnostic(&target, meta)?;
                }
                self.settle(&target);
                Ok(step)
            }
        }
    }

    /// Fold a scheduler step into the worklist and report.
    fn absorb(&mut self, step: &SchedulerStep, worklist: &mut VecDeque<TargetName>) {
        worklist.extend(step.newly_ready.iter().cloned());
        for name in &step.cancelled {
            self.settle(name);
        }
    }

    fn put_diagnostic(&self, target: &str, meta: BuildMeta) -> Result<()> {
        self.store.put_diagnostic(&Diagnostic {
            target: target.to_string(),
            status: BuildStatus::Error,
            meta,
        })
    }

    fn report_error(&mut self, target: &str, message: String) {
        if let Some(report) = self.report.targets.get_mut(target) {
            report.error = Some(message);
        }
    }

    /// Drop per-target bookkeeping once the target is terminal.
    fn settle(&mut self, target: &str) {
        self.staged.remove(target);
        self.pending.remove(target);
        self.strategy.release(target);
    }

    fn abort(&mut self) {
        warn!("abort requested");
        self.scheduler.abort();
        self.cancel_running();
        self.report.aborted = true;
    }

    fn cancel_running(&mut self) {
        for (name, cancel) in &self.running {
            debug!(target = %name, "cancelling build");
            cancel.cancel();
        }
        self.running.clear();
    }

    fn finish(mut self) -> RunReport {
        for (name, state) in self.scheduler.states() {
            if let Some(report) = self.report.targets.get_mut(name) {
                report.state = state;
                if state == RunState::Cancelled && !report.built {
                    report.error.get_or_insert_with(|| "cancelled".to_string());
                }
            }
        }
        self.report.dep_loads = self.strategy.loads();

        let report = &self.report;
        info!(
            built = report.built().len(),
            up_to_date = report.skipped().len(),
            failed = report.failed().len(),
            cancelled = report.cancelled().len(),
            outstanding_tokens = self.lock.outstanding(),
            "run finished"
        );
        self.report
    }
}
