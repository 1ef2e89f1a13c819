// src/engine/assess.rs

//! Compute the current fingerprint components of a target and compare them
//! with its cache entry.
//!
//! Shared by the coordinator (when a target becomes Ready) and by the
//! read-only `outdated` query.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::TargetDef;
use crate::dag::DependencyGraph;
use crate::errors::{PipewrightError, Result};
use crate::extract::Deps;
use crate::lang::{
    on_eval_stack, Budget, DepSource, EnvToken, EvalContext, EvalError, Expr, Interpreter, Value,
};
use crate::stale::{evaluate, CurrentState, Staleness};
use crate::store::{encode_value, CacheEntry, FileHashCache, Fingerprint, FingerprintParts, FingerprintStore};

#[derive(Debug, Clone)]
pub struct Assessment {
    pub state: CurrentState,
    pub staleness: Staleness,
    pub entry: Option<CacheEntry>,
}

/// Hash of the canonical command text. Whitespace and comments never reach it.
pub fn command_fingerprint(command: &Expr) -> Fingerprint {
    Fingerprint::of_str(&command.deparse())
}

/// Hash over the sorted `(dependency, fingerprint)` pairs of `name`.
///
/// Dependencies without a known fingerprint count as missing.
pub fn depend_fingerprint(
    graph: &DependencyGraph,
    name: &str,
    fingerprints: &BTreeMap<String, Fingerprint>,
) -> Fingerprint {
    let missing = Fingerprint::missing();
    // dependencies_of is sorted.
    let pairs: Vec<(&str, &str)> = graph
        .dependencies_of(name)
        .iter()
        .map(|dep| {
            let fp = fingerprints.get(dep).unwrap_or(&missing);
            (dep.as_str(), fp.as_str())
        })
        .collect();
    Fingerprint::combine(pairs)
}

pub struct Assessor<'a> {
    pub graph: &'a DependencyGraph,
    pub ctx: &'a EvalContext,
    pub store: &'a dyn FingerprintStore,
}

impl Assessor<'_> {
    /// Decide whether `def` needs building.
    ///
    /// `fingerprints` must already hold the final fingerprint of every
    /// dependency; `values` supplies dependency values to trigger
    /// expressions.
    pub fn assess(
        &self,
        def: &TargetDef,
        deps: &Deps,
        fingerprints: &BTreeMap<String, Fingerprint>,
        files: &mut FileHashCache,
        values: &dyn DepSource,
    ) -> Result<Assessment> {
        let entry = self.store.get_entry(&def.name)?;
        let parts = self.parts(def, deps, fingerprints, files, values)?;

        let condition = match &def.trigger.condition {
            Some(expr) => Some(self.eval_condition(def, expr, values)?),
            None => None,
        };
        let value_present = match &entry {
            Some(entry) => self.store.has_object(&entry.value)?,
            None => false,
        };

        let state = CurrentState {
            parts,
            condition,
            value_present,
        };
        let staleness = evaluate(&def.trigger, &state, entry.as_ref());
        debug!(target = %def.name, ?staleness, "assessed");
        Ok(Assessment {
            state,
            staleness,
            entry,
        })
    }

    /// Fingerprint components as they are right now.
    pub fn parts(
        &self,
        def: &TargetDef,
        deps: &Deps,
        fingerprints: &BTreeMap<String, Fingerprint>,
        files: &mut FileHashCache,
        values: &dyn DepSource,
    ) -> Result<FingerprintParts> {
        let mut inputs = BTreeMap::new();
        for path in deps.input_files() {
            let hash = files.get_or_compute(&self.ctx.root.join(&path))?;
            inputs.insert(path, hash);
        }
        let mut outputs = BTreeMap::new();
        for path in &deps.file_out {
            let hash = files.get_or_compute(&self.ctx.root.join(path))?;
            outputs.insert(path.clone(), hash);
        }

        let change = match &def.trigger.change {
            Some(expr) => {
                let value = self.eval_trigger(def, expr, values)?;
                Some(Fingerprint::of_bytes(&encode_value(&value)?))
            }
            None => None,
        };

        Ok(FingerprintParts {
            command: command_fingerprint(&def.command),
            depend: depend_fingerprint(self.graph, &def.name, fingerprints),
            inputs,
            outputs,
            trigger: def.trigger.fingerprint(),
            change,
        })
    }

    fn eval_condition(&self, def: &TargetDef, expr: &Expr, values: &dyn DepSource) -> Result<bool> {
        let value = self.eval_trigger(def, expr, values)?;
        value.truthy().ok_or_else(|| PipewrightError::Build {
            target: def.name.clone(),
            message: format!("trigger condition `{expr}` is not a single logical value"),
        })
    }

    /// Evaluate a trigger expression without write access to the environment.
    fn eval_trigger(&self, def: &TargetDef, expr: &Expr, values: &dyn DepSource) -> Result<Value> {
        let ctx = self.ctx;
        let evaluated = on_eval_stack(&format!("pipewright-trigger-{}", def.name), || {
            let token = EnvToken::read_only(ctx.shared.clone(), &def.name);
            let budget = Budget::unlimited();
            Interpreter::new(ctx, &token, values, &budget).eval(expr)
        })?;
        evaluated.map_err(|e| match e {
            EvalError::Store(message) => PipewrightError::store(def.name.clone(), message),
            other => PipewrightError::Build {
                target: def.name.clone(),
                message: format!("evaluating trigger `{expr}`: {other}"),
            },
        })
    }
}
