// src/lang/env.rs

//! The shared environment and the lock that protects it during a run.
//!
//! Environment scripts populate a [`SharedEnv`] before anything is built.
//! Once a run starts, an [`EnvLock`] is held and every build receives an
//! [`EnvToken`]; a locked token refuses `<<-` writes, which is how targets
//! are kept from changing the state other targets read.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::lang::interp::EvalError;
use crate::lang::value::Value;

/// Global bindings visible to every command.
#[derive(Debug, Clone, Default)]
pub struct SharedEnv {
    inner: Arc<RwLock<BTreeMap<String, Value>>>,
}

impl SharedEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Bind `name`. Only used while sourcing environment scripts and through
    /// an unlocked [`EnvToken`].
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value);
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

/// Held by the coordinator for the duration of a run.
#[derive(Debug)]
pub struct EnvLock {
    env: SharedEnv,
    outstanding: Arc<AtomicUsize>,
    lock_by_default: bool,
}

impl EnvLock {
    pub fn acquire(env: SharedEnv, lock_by_default: bool) -> Self {
        debug!(lock_by_default, "environment lock acquired");
        Self {
            env,
            outstanding: Arc::new(AtomicUsize::new(0)),
            lock_by_default,
        }
    }

    /// Issue a token for one build of `target`.
    ///
    /// `override_lock` carries the target's own `lock_envir` setting.
    pub fn token(&self, target: &str, override_lock: Option<bool>) -> EnvToken {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        EnvToken {
            target: target.to_string(),
            locked: override_lock.unwrap_or(self.lock_by_default),
            env: self.env.clone(),
            outstanding: Some(self.outstanding.clone()),
        }
    }

    /// Tokens issued and not yet dropped.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl Drop for EnvLock {
    fn drop(&mut self) {
        let outstanding = self.outstanding();
        debug!(outstanding, "environment lock released");
    }
}

/// Per-build capability for writing to the shared environment.
#[derive(Debug)]
pub struct EnvToken {
    target: String,
    locked: bool,
    env: SharedEnv,
    outstanding: Option<Arc<AtomicUsize>>,
}

impl EnvToken {
    /// Unlocked token used while sourcing environment scripts and evaluating
    /// outside of a run.
    pub fn setup(env: SharedEnv) -> Self {
        Self {
            target: "<environment>".to_string(),
            locked: false,
            env,
            outstanding: None,
        }
    }

    /// Read-only token for evaluations that must never write (trigger
    /// conditions, queries).
    pub fn read_only(env: SharedEnv, target: &str) -> Self {
        Self {
            target: target.to_string(),
            locked: true,
            env,
            outstanding: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn env(&self) -> &SharedEnv {
        &self.env
    }

    /// Perform a `<<-` assignment.
    pub fn assign(&self, name: &str, value: Value) -> Result<(), EvalError> {
        if self.locked {
            return Err(EvalError::Integrity {
                binding: name.to_string(),
            });
        }
        self.env.define(name, value);
        Ok(())
    }
}

impl Drop for EnvToken {
    fn drop(&mut self) {
        if let Some(counter) = &self.outstanding {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
