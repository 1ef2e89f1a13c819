// src/lang/budget.rs

//! Cooperative cancellation and time budgets for evaluation.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::lang::interp::{EvalError, LimitKind};

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Shared flag a coordinator flips to stop an evaluation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Limits checked at every evaluation step.
///
/// The compute budget counts wall time spent evaluating, minus time spent
/// sleeping or loading dependency values.
#[derive(Debug)]
pub struct Budget {
    cancel: CancelToken,
    started: Instant,
    timeout: Option<Duration>,
    cpu: Option<Duration>,
    excluded: Cell<Duration>,
}

impl Budget {
    pub fn new(cancel: CancelToken, timeout: Option<Duration>, cpu: Option<Duration>) -> Self {
        Self {
            cancel,
            started: Instant::now(),
            timeout,
            cpu,
            excluded: Cell::new(Duration::ZERO),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(CancelToken::new(), None, None)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn cpu_used(&self) -> Duration {
        self.elapsed().saturating_sub(self.excluded.get())
    }

    /// Do not count `spent` against the compute budget.
    pub fn exclude(&self, spent: Duration) {
        self.excluded.set(self.excluded.get() + spent);
    }

    pub fn check(&self) -> Result<(), EvalError> {
        if self.cancel.is_cancelled() {
            return Err(EvalError::Cancelled);
        }
        if let Some(limit) = self.timeout {
            if self.elapsed() > limit {
                return Err(EvalError::Limit {
                    kind: LimitKind::Elapsed,
                    limit,
                });
            }
        }
        if let Some(limit) = self.cpu {
            if self.cpu_used() > limit {
                return Err(EvalError::Limit {
                    kind: LimitKind::Compute,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Sleep for `total`, waking regularly to honour cancellation and the
    /// elapsed-time limit. Sleeping does not consume compute budget.
    pub fn sleep(&self, total: Duration) -> Result<(), EvalError> {
        const SLICE: Duration = Duration::from_millis(10);
        let start = Instant::now();
        loop {
            self.check()?;
            let done = start.elapsed();
            if done >= total {
                return Ok(());
            }
            let slice_start = Instant::now();
            std::thread::sleep(SLICE.min(total - done));
            self.exclude(slice_start.elapsed());
        }
    }
}
