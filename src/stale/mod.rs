// src/stale/mod.rs

//! Staleness decisions.
//!
//! [`evaluate`] is a pure function of the freshly computed state of a target
//! and its recorded cache entry, so it is safe to call speculatively.

pub mod trigger;

use std::fmt;

use serde::Serialize;

use crate::store::{CacheEntry, FingerprintParts};

pub use trigger::{Trigger, TriggerPreset};

/// What the engine knows about a target right now.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentState {
    /// Fingerprint components computed from the current plan and files.
    /// `outputs` holds the hashes of the declared output files as they are
    /// on disk now.
    pub parts: FingerprintParts,
    /// Value of the trigger's `condition`, when it has one.
    pub condition: Option<bool>,
    /// Whether the recorded value object is still in the store.
    pub value_present: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Reason {
    /// No cache entry exists.
    Missing,
    Condition,
    Command,
    Depend,
    InputFile(String),
    OutputMissing(String),
    OutputModified(String),
    Change,
    ValueMissing,
    TriggerChanged,
    /// An upstream target is itself outdated (speculative evaluation only).
    Upstream(String),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::Missing => f.write_str("no previous build"),
            Reason::Condition => f.write_str("trigger condition is TRUE"),
            Reason::Command => f.write_str("command changed"),
            Reason::Depend => f.write_str("dependencies changed"),
            Reason::InputFile(p) => write!(f, "input file '{p}' changed"),
            Reason::OutputMissing(p) => write!(f, "output file '{p}' is missing"),
            Reason::OutputModified(p) => write!(f, "output file '{p}' was modified"),
            Reason::Change => f.write_str("trigger change value changed"),
            Reason::ValueMissing => f.write_str("stored value is missing"),
            Reason::TriggerChanged => f.write_str("trigger changed"),
            Reason::Upstream(t) => write!(f, "upstream target '{t}' is outdated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Staleness {
    UpToDate,
    Outdated(Vec<Reason>),
    /// No cache entry: always rebuilt.
    Missing,
}

impl Staleness {
    pub fn needs_build(&self) -> bool {
        !matches!(self, Staleness::UpToDate)
    }

    pub fn reasons(&self) -> Vec<Reason> {
        match self {
            Staleness::UpToDate => Vec::new(),
            Staleness::Outdated(reasons) => reasons.clone(),
            Staleness::Missing => vec![Reason::Missing],
        }
    }
}

/// Decide whether a target must be rebuilt.
pub fn evaluate(trigger: &Trigger, state: &CurrentState, entry: Option<&CacheEntry>) -> Staleness {
    let Some(entry) = entry else {
        return Staleness::Missing;
    };
    let now = &state.parts;
    let then = &entry.parts;
    let mut reasons = Vec::new();

    if state.condition == Some(true) {
        reasons.push(Reason::Condition);
    }

    if trigger.missing {
        if !state.value_present {
            reasons.push(Reason::ValueMissing);
        }
        for (path, hash) in &now.outputs {
            if hash.is_missing() {
                reasons.push(Reason::OutputMissing(path.clone()));
            }
        }
    }

    if trigger.command && now.command != then.command {
        reasons.push(Reason::Command);
    }

    if trigger.depend && now.depend != then.depend {
        reasons.push(Reason::Depend);
    }

    if trigger.file {
        let paths = now.inputs.keys().chain(then.inputs.keys());
        let mut seen = std::collections::BTreeSet::new();
        for path in paths {
            if seen.insert(path) && now.inputs.get(path) != then.inputs.get(path) {
                reasons.push(Reason::InputFile(path.clone()));
            }
        }
        for (path, hash) in &now.outputs {
            let already = reasons.contains(&Reason::OutputMissing(path.clone()));
            if !already && then.outputs.get(path) != Some(hash) {
                reasons.push(if hash.is_missing() {
                    Reason::OutputMissing(path.clone())
                } else {
                    Reason::OutputModified(path.clone())
                });
            }
        }
    }

    if trigger.change.is_some() && now.change != then.change {
        reasons.push(Reason::Change);
    }

    let any_flag = trigger.command || trigger.depend || trigger.file || trigger.missing;
    if any_flag && now.trigger != then.trigger {
        reasons.push(Reason::TriggerChanged);
    }

    if reasons.is_empty() {
        Staleness::UpToDate
    } else {
        Staleness::Outdated(reasons)
    }
}
