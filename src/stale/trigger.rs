// src/stale/trigger.rs

//! Per-target rebuild policy.

use std::fmt;
use std::str::FromStr;

use crate::lang::Expr;
use crate::store::Fingerprint;

/// Which kinds of change force a rebuild.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    /// Rebuild when the command text changes.
    pub command: bool,
    /// Rebuild when a dependency's fingerprint changes.
    pub depend: bool,
    /// Rebuild when a declared input or output file changes.
    pub file: bool,
    /// Rebuild when the stored value or a declared output file is missing.
    pub missing: bool,
    /// Rebuild whenever this evaluates to `TRUE`.
    pub condition: Option<Expr>,
    /// Rebuild whenever the value of this expression changes.
    pub change: Option<Expr>,
}

/// Named trigger presets accepted in plan files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPreset {
    Default,
    Command,
    Always,
    Never,
    Missing,
}

impl FromStr for TriggerPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(TriggerPreset::Default),
            "command" => Ok(TriggerPreset::Command),
            "always" => Ok(TriggerPreset::Always),
            "never" => Ok(TriggerPreset::Never),
            "missing" => Ok(TriggerPreset::Missing),
            other => Err(format!(
                "invalid trigger: {other} (expected \"default\", \"command\", \"always\", \"never\" or \"missing\")"
            )),
        }
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::preset(TriggerPreset::Default)
    }
}

impl Trigger {
    pub fn preset(preset: TriggerPreset) -> Self {
        let flags = |command, depend, file, missing| Trigger {
            command,
            depend,
            file,
            missing,
            condition: None,
            change: None,
        };
        match preset {
            TriggerPreset::Default => flags(true, true, true, true),
            TriggerPreset::Command => flags(true, false, false, false),
            TriggerPreset::Missing => flags(false, false, false, true),
            TriggerPreset::Never => flags(false, false, false, false),
            TriggerPreset::Always => Trigger {
                condition: Some(Expr::Bool(true)),
                ..flags(true, true, true, true)
            },
        }
    }

    pub fn always() -> Self {
        Self::preset(TriggerPreset::Always)
    }

    pub fn never() -> Self {
        Self::preset(TriggerPreset::Never)
    }

    /// Hash of the mode, recorded in every cache entry.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_str(&self.to_string())
    }

    /// Expressions whose dependencies join the target's own.
    pub fn expressions(&self) -> impl Iterator<Item = &Expr> {
        self.condition.iter().chain(self.change.iter())
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |b: bool| if b { "TRUE" } else { "FALSE" };
        write!(
            f,
            "trigger(command = {}, depend = {}, file = {}, missing = {}",
            flag(self.command),
            flag(self.depend),
            flag(self.file),
            flag(self.missing)
        )?;
        if let Some(condition) = &self.condition {
            write!(f, ", condition = {condition}")?;
        }
        if let Some(change) = &self.change {
            write!(f, ", change = {change}")?;
        }
        f.write_str(")")
    }
}
