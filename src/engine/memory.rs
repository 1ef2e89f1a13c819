// src/engine/memory.rs

//! Staging of dependency values for builds.
//!
//! Two strategies, selected per run:
//!
//! - [`EagerPrune`] loads a target's dependencies into a resident set before
//!   the target is dispatched and evicts each value as soon as every target
//!   that reads it has finished. Peak memory is bounded by the values the
//!   in-flight builds need.
//! - [`Lazy`] loads a dependency inside the worker the first time the
//!   command references it. Nothing is kept between builds, so two workers
//!   reading the same dependency both load it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use crate::engine::TargetName;
use crate::errors::{PipewrightError, Result};
use crate::lang::{DepSource, EvalError, Value};
use crate::store::{load_value, FingerprintStore};
use crate::types::MemoryStrategyKind;

/// Load the latest value of `target` from the store.
pub fn load_target_value(store: &dyn FingerprintStore, target: &str) -> Result<Value> {
    let entry = store
        .get_entry(target)?
        .ok_or_else(|| PipewrightError::store(target, "no cache entry"))?;
    load_value(store, &entry.value)
}

pub trait MemoryStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> MemoryStrategyKind;

    /// Make the values of `deps` available to a build of `target`.
    fn stage(&self, target: &str, deps: &[TargetName]) -> Result<Arc<dyn DepSource>>;

    /// `target` was just built and produced `value`.
    fn on_built(&self, target: &str, value: Arc<Value>);

    /// `target` reached a terminal state; its inputs may be released.
    fn release(&self, target: &str);

    /// Values loaded from the store so far.
    fn loads(&self) -> usize;

    /// Values currently held by the strategy.
    fn resident(&self) -> Vec<TargetName>;
}

pub fn strategy_for(
    kind: MemoryStrategyKind,
    store: Arc<dyn FingerprintStore>,
    consumers: BTreeMap<TargetName, Vec<TargetName>>,
) -> Arc<dyn MemoryStrategy> {
    match kind {
        MemoryStrategyKind::Eager => Arc::new(EagerPrune::new(store, consumers)),
        MemoryStrategyKind::Lazy => Arc::new(Lazy::new(store)),
    }
}

/// A fixed set of already-loaded values.
#[derive(Debug, Default)]
pub struct StagedDeps {
    values: BTreeMap<String, Arc<Value>>,
}

impl DepSource for StagedDeps {
    fn lookup(&self, name: &str) -> Option<std::result::Result<Arc<Value>, EvalError>> {
        self.values.get(name).map(|v| Ok(v.clone()))
    }
}

#[derive(Debug, Default)]
struct Residency {
    values: BTreeMap<TargetName, Arc<Value>>,
    finished: BTreeSet<TargetName>,
}

pub struct EagerPrune {
    store: Arc<dyn FingerprintStore>,
    /// For each target, the targets in this run that read it.
    consumers: BTreeMap<TargetName, Vec<TargetName>>,
    /// Reverse of `consumers`.
    inputs: BTreeMap<TargetName, Vec<TargetName>>,
    state: Mutex<Residency>,
    loads: AtomicUsize,
}

impl fmt::Debug for EagerPrune {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EagerPrune")
            .field("resident", &self.resident())
            .field("loads", &self.loads())
            .finish_non_exhaustive()
    }
}

impl EagerPrune {
    pub fn new(
        store: Arc<dyn FingerprintStore>,
        consumers: BTreeMap<TargetName, Vec<TargetName>>,
    ) -> Self {
        let mut inputs: BTreeMap<TargetName, Vec<TargetName>> = BTreeMap::new();
        for (dep, readers) in &consumers {
            for reader in readers {
                inputs.entry(reader.clone()).or_default().push(dep.clone());
            }
        }
        Self {
            store,
            consumers,
            inputs,
            state: Mutex::new(Residency::default()),
            loads: AtomicUsize::new(0),
        }
    }

    fn has_pending_consumer(&self, state: &Residency, target: &str) -> bool {
        self.consumers
            .get(target)
            .is_some_and(|readers| readers.iter().any(|r| !state.finished.contains(r)))
    }
}

impl MemoryStrategy for EagerPrune {
    fn kind(&self) -> MemoryStrategyKind {
        MemoryStrategyKind::Eager
    }

    fn stage(&self, target: &str, deps: &[TargetName]) -> Result<Arc<dyn DepSource>> {
        let mut staged = StagedDeps::default();
        for dep in deps {
            let resident = self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .values
                .get(dep)
                .cloned();
            let value = match resident {
                Some(value) => value,
                None => {
                    let value = Arc::new(load_target_value(self.store.as_ref(), dep)?);
                    self.loads.fetch_add(1, Ordering::SeqCst);
                    trace!(target = %target, dep = %dep, "loaded dependency value");
                    self.state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .values
                        .insert(dep.clone(), value.clone());
                    value
                }
            };
            staged.values.insert(dep.clone(), value);
        }
        Ok(Arc::new(staged))
    }

    fn on_built(&self, target: &str, value: Arc<Value>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.has_pending_consumer(&state, target) {
            state.values.insert(target.to_string(), value);
        }
    }

    fn release(&self, target: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.finished.insert(target.to_string());

        let candidates = self.inputs.get(target).cloned().unwrap_or_default();
        for dep in candidates {
            if !self.has_pending_consumer(&state, &dep) && state.values.remove(&dep).is_some() {
                debug!(dep = %dep, "evicted dependency value");
            }
        }
        if !self.has_pending_consumer(&state, target) {
            state.values.remove(target);
        }
    }

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn resident(&self) -> Vec<TargetName> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values
            .keys()
            .cloned()
            .collect()
    }
}

pub struct Lazy {
    store: Arc<dyn FingerprintStore>,
    loads: Arc<AtomicUsize>,
}

impl fmt::Debug for Lazy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy").field("loads", &self.loads()).finish_non_exhaustive()
    }
}

impl Lazy {
    pub fn new(store: Arc<dyn FingerprintStore>) -> Self {
        Self {
            store,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MemoryStrategy for Lazy {
    fn kind(&self) -> MemoryStrategyKind {
        MemoryStrategyKind::Lazy
    }

    fn stage(&self, _target: &str, deps: &[TargetName]) -> Result<Arc<dyn DepSource>> {
        Ok(Arc::new(LazyDeps {
            store: self.store.clone(),
            names: deps.iter().cloned().collect(),
            memo: Mutex::new(BTreeMap::new()),
            loads: self.loads.clone(),
        }))
    }

    fn on_built(&self, _target: &str, _value: Arc<Value>) {}

    fn release(&self, _target: &str) {}

    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn resident(&self) -> Vec<TargetName> {
        Vec::new()
    }
}

/// Dependency values read from the store on first reference.
pub struct LazyDeps {
    store: Arc<dyn FingerprintStore>,
    names: BTreeSet<String>,
    memo: Mutex<BTreeMap<String, Arc<Value>>>,
    loads: Arc<AtomicUsize>,
}

impl LazyDeps {
    pub fn new(store: Arc<dyn FingerprintStore>, names: BTreeSet<String>) -> Self {
        Self {
            store,
            names,
            memo: Mutex::new(BTreeMap::new()),
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl DepSource for LazyDeps {
    fn lookup(&self, name: &str) -> Option<std::result::Result<Arc<Value>, EvalError>> {
        if !self.names.contains(name) {
            return None;
        }
        let mut memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = memo.get(name) {
            return Some(Ok(value.clone()));
        }
        let loaded = load_target_value(self.store.as_ref(), name)
            .map(Arc::new)
            .map_err(|e| EvalError::Store(e.to_string()));
        if let Ok(value) = &loaded {
            self.loads.fetch_add(1, Ordering::SeqCst);
            trace!(dep = %name, "lazily loaded dependency value");
            memo.insert(name.to_string(), value.clone());
        }
        Some(loaded)
    }
}
