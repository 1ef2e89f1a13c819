// src/engine/worker.rs

//! Runs one build attempt of one target.
//!
//! The command is evaluated on its own thread with a large stack, since
//! evaluation recurses with the code it runs. The async side races it
//! against cancellation and a deadline backstop; the interpreter enforces
//! limits cooperatively at every step, and the backstop only fires when
//! an evaluation stops checking.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::engine::TargetName;
use crate::lang::{
    Budget, CancelToken, DepSource, EnvToken, EvalContext, EvalError, Expr, Interpreter, Value,
    EVAL_STACK_SIZE,
};
use crate::store::{
    hash_file, now_secs, save_value, Attempt, AttemptOutcome, BuildMeta, BuildStatus, CacheEntry,
    Fingerprint, FingerprintParts, FingerprintStore,
};
use crate::types::WorkerId;

/// Extra time granted past the deadline before a build is abandoned.
pub const BACKSTOP_GRACE: Duration = Duration::from_millis(250);

/// Everything a worker needs for one attempt.
pub struct BuildJob {
    pub target: TargetName,
    pub command: Expr,
    pub attempt: u32,
    pub worker: WorkerId,
    pub timeout: Option<Duration>,
    pub cpu: Option<Duration>,
    /// Declared output files, relative to the project root.
    pub outputs: Vec<String>,
    /// Fingerprint components computed when the target became Ready.
    pub parts: FingerprintParts,
    /// Attempts made before this one.
    pub previous_attempts: Vec<Attempt>,
    pub resources: Option<serde_json::Value>,
    pub ctx: Arc<EvalContext>,
    pub token: EnvToken,
    pub deps: Arc<dyn DepSource>,
    pub cancel: CancelToken,
    /// Set when the store accepts concurrent writers; the worker then
    /// commits its own entry.
    pub store: Option<Arc<dyn FingerprintStore>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The command raised an error.
    Error,
    Timeout,
    /// A `<<-` write through a locked token.
    Integrity,
    /// A dependency value or the result could not go through the store.
    Store,
    Cancelled,
}

impl FailureKind {
    pub fn retryable(self) -> bool {
        matches!(self, FailureKind::Error | FailureKind::Timeout)
    }
}

#[derive(Debug, Clone)]
pub struct BuildFailure {
    pub kind: FailureKind,
    pub message: String,
    /// The binding written, for integrity failures.
    pub binding: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BuiltValue {
    pub value: Arc<Value>,
    /// The entry to commit, with output hashes and this attempt filled in.
    pub entry: CacheEntry,
    /// Whether the worker already wrote the object and entry.
    pub committed: bool,
}

/// Sent back to the coordinator when an attempt ends.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub target: TargetName,
    pub attempt: Attempt,
    pub worker: WorkerId,
    pub meta: BuildMeta,
    pub outcome: Result<BuiltValue, BuildFailure>,
}

struct Evaluated {
    result: Result<Value, EvalError>,
    warnings: Vec<String>,
    messages: Vec<String>,
    traceback: Vec<String>,
    elapsed: Duration,
    cpu: Duration,
}

/// Run `job` and send its result to the coordinator.
pub async fn run_build(job: BuildJob, tx: mpsc::Sender<BuildResult>) {
    let target = job.target.clone();
    let result = run_build_inner(job).await;
    if let Err(e) = tx.send(result).await {
        debug!(target = %target, error = %e, "coordinator gone; dropping build result");
    }
}

async fn run_build_inner(job: BuildJob) -> BuildResult {
    info!(target = %job.target, attempt = job.attempt, worker = job.worker, "building");
    let started = Instant::now();
    let deadline = job.timeout.map(|t| tokio::time::Instant::now() + t + BACKSTOP_GRACE);
    let cancel = job.cancel.clone();

    let ctx = job.ctx.clone();
    let command = job.command.clone();
    let deps = job.deps.clone();
    let (timeout, cpu) = (job.timeout, job.cpu);
    let token = job.token;
    let budget_cancel = cancel.clone();
    let (done_tx, mut done_rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name(format!("pipewright-build-{}", job.target))
        .stack_size(EVAL_STACK_SIZE)
        .spawn(move || {
            let budget = Budget::new(budget_cancel, timeout, cpu);
            let mut interp = Interpreter::new(&ctx, &token, deps.as_ref(), &budget);
            let result = interp.eval(&command);
            let traceback = interp.traceback().to_vec();
            let cpu = budget.cpu_used();
            let elapsed = budget.elapsed();
            let diagnostics = interp.into_diagnostics();
            // The token is released here, when the build finishes.
            drop(token);
            let _ = done_tx.send(Evaluated {
                result,
                warnings: diagnostics.warnings,
                messages: diagnostics.messages,
                traceback,
                elapsed,
                cpu,
            });
        });
    if let Err(e) = spawned {
        error!(target = %job.target, error = %e, "cannot start build thread");
        return failure(&job.target, job.attempt, job.worker, started, job.previous_attempts, FailureKind::Error, format!("cannot start build thread: {e}"));
    }

    let backstop = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };

    let evaluated = tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            info!(target = %job.target, "build cancelled");
            return failure(&job.target, job.attempt, job.worker, started, job.previous_attempts, FailureKind::Cancelled, "build cancelled".to_string());
        }
        received = &mut done_rx => match received {
            Ok(evaluated) => evaluated,
            Err(_) => {
                error!(target = %job.target, "build thread panicked");
                return failure(&job.target, job.attempt, job.worker, started, job.previous_attempts, FailureKind::Error, "build panicked".to_string());
            }
        },
        _ = backstop => {
            // Stop the abandoned evaluation at its next step.
            cancel.cancel();
            let limit = job.timeout.unwrap_or_default();
            warn!(target = %job.target, ?limit, "build did not stop at its deadline; abandoning");
            return failure(&job.target, job.attempt, job.worker, started, job.previous_attempts, FailureKind::Timeout, format!("elapsed time limit of {limit:?} exceeded"));
        }
    };

    finish(job.target, job.attempt, job.worker, job.outputs, job.parts, job.previous_attempts, job.resources, &job.ctx, job.store, &cancel, evaluated)
}

#[allow(clippy::too_many_arguments)]
fn finish(
    target: TargetName,
    attempt: u32,
    worker: WorkerId,
    outputs: Vec<String>,
    mut parts: FingerprintParts,
    mut attempts: Vec<Attempt>,
    resources: Option<serde_json::Value>,
    ctx: &EvalContext,
    store: Option<Arc<dyn FingerprintStore>>,
    cancel: &CancelToken,
    evaluated: Evaluated,
) -> BuildResult {
    let Evaluated {
        result,
        warnings,
        messages,
        traceback,
        elapsed,
        cpu,
    } = evaluated;

    let mut meta = BuildMeta {
        elapsed_secs: elapsed.as_secs_f64(),
        cpu_secs: cpu.as_secs_f64(),
        worker: Some(worker.to_string()),
        attempts: Vec::new(),
        warnings,
        messages,
        error: None,
        traceback,
        resources,
        finished_at: now_secs(),
    };

    let value = match result.map_err(classify) {
        Ok(value) => hash_outputs(ctx, &outputs, &mut parts).map(|()| value),
        Err(failure) => Err(failure),
    };

    let value = match value {
        Ok(value) => value,
        Err(failure) => {
            let outcome = if failure.kind == FailureKind::Timeout {
                AttemptOutcome::TimedOut
            } else {
                AttemptOutcome::Failed
            };
            let this = Attempt {
                number: attempt,
                outcome,
                elapsed_secs: elapsed.as_secs_f64(),
                error: Some(failure.message.clone()),
            };
            attempts.push(this.clone());
            meta.attempts = attempts;
            meta.error = Some(failure.message.clone());
            warn!(target = %target, attempt, kind = ?failure.kind, error = %failure.message, "build failed");
            return BuildResult {
                target,
                attempt: this,
                worker,
                meta,
                outcome: Err(failure),
            };
        }
    };

    let this = Attempt {
        number: attempt,
        outcome: AttemptOutcome::Success,
        elapsed_secs: elapsed.as_secs_f64(),
        error: None,
    };
    attempts.push(this.clone());
    meta.attempts = attempts;

    let mut entry = CacheEntry {
        target: target.clone(),
        fingerprint: parts.fingerprint(),
        parts,
        status: BuildStatus::Success,
        value: Fingerprint::missing(),
        meta: meta.clone(),
    };

    // Nothing is committed once the build has been cancelled.
    if store.is_some() && cancel.is_cancelled() {
        info!(target = %target, "build cancelled before commit");
        let message = "build cancelled".to_string();
        let this = Attempt {
            outcome: AttemptOutcome::Failed,
            error: Some(message.clone()),
            ..this
        };
        meta.attempts.pop();
        meta.attempts.push(this.clone());
        meta.error = Some(message.clone());
        return BuildResult {
            target,
            attempt: this,
            worker,
            meta,
            outcome: Err(BuildFailure {
                kind: FailureKind::Cancelled,
                message,
                binding: None,
            }),
        };
    }

    let committed = match &store {
        Some(store) => match commit(store.as_ref(), &mut entry, &value) {
            Ok(()) => true,
            Err(message) => {
                meta.error = Some(message.clone());
                return BuildResult {
                    target,
                    attempt: this,
                    worker,
                    meta,
                    outcome: Err(BuildFailure {
                        kind: FailureKind::Store,
                        message,
                        binding: None,
                    }),
                };
            }
        },
        None => false,
    };

    info!(target = %target, elapsed = ?elapsed, committed, "built");
    BuildResult {
        target,
        attempt: this,
        worker,
        meta,
        outcome: Ok(BuiltValue {
            value: Arc::new(value),
            entry,
            committed,
        }),
    }
}

/// Save the value object and the entry.
pub fn commit(store: &dyn FingerprintStore, entry: &mut CacheEntry, value: &Value) -> Result<(), String> {
    entry.value = save_value(store, value).map_err(|e| e.to_string())?;
    store.put_entry(entry).map_err(|e| e.to_string())
}

fn classify(e: EvalError) -> BuildFailure {
    let (kind, binding) = match &e {
        EvalError::Runtime(_) => (FailureKind::Error, None),
        EvalError::Limit { .. } => (FailureKind::Timeout, None),
        EvalError::Cancelled => (FailureKind::Cancelled, None),
        EvalError::Integrity { binding } => (FailureKind::Integrity, Some(binding.clone())),
        EvalError::Store(_) => (FailureKind::Store, None),
    };
    BuildFailure {
        kind,
        message: e.to_string(),
        binding,
    }
}

/// Hash every declared output; a missing one fails the build.
fn hash_outputs(ctx: &EvalContext, outputs: &[String], parts: &mut FingerprintParts) -> Result<(), BuildFailure> {
    let mut hashes = BTreeMap::new();
    for path in outputs {
        let hashed = hash_file(&ctx.root.join(path)).map_err(|e| BuildFailure {
            kind: FailureKind::Error,
            message: format!("cannot hash output file '{path}': {e}"),
            binding: None,
        })?;
        match hashed {
            Some(hash) => {
                hashes.insert(path.clone(), hash);
            }
            None => {
                return Err(BuildFailure {
                    kind: FailureKind::Error,
                    message: format!("declared output file '{path}' was not created"),
                    binding: None,
                });
            }
        }
    }
    parts.outputs = hashes;
    Ok(())
}

fn failure(
    target: &str,
    attempt: u32,
    worker: WorkerId,
    started: Instant,
    mut attempts: Vec<Attempt>,
    kind: FailureKind,
    message: String,
) -> BuildResult {
    let elapsed = started.elapsed();
    let this = Attempt {
        number: attempt,
        outcome: if kind == FailureKind::Timeout {
            AttemptOutcome::TimedOut
        } else {
            AttemptOutcome::Failed
        },
        elapsed_secs: elapsed.as_secs_f64(),
        error: Some(message.clone()),
    };
    attempts.push(this.clone());
    BuildResult {
        target: target.to_string(),
        attempt: this,
        worker,
        meta: BuildMeta {
            elapsed_secs: elapsed.as_secs_f64(),
            worker: Some(worker.to_string()),
            attempts,
            error: Some(message.clone()),
            finished_at: now_secs(),
            ..BuildMeta::default()
        },
        outcome: Err(BuildFailure {
            kind,
            message,
            binding: None,
        }),
    }
}
