// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{PlanFile, RawPlanFile};
use crate::errors::{PipewrightError, Result};

/// Read a plan file and return the raw `RawPlanFile`.
///
/// This only performs TOML deserialization. Use [`load_and_validate`] to
/// also check names, commands, durations and outputs.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawPlanFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| {
        PipewrightError::ConfigError(format!("cannot read plan file '{}': {e}", path.display()))
    })?;

    load_from_str(&contents)
}

pub fn load_from_str(contents: &str) -> Result<RawPlanFile> {
    let plan: RawPlanFile = toml::from_str(contents)?;
    Ok(plan)
}

/// Read and validate a plan file.
///
/// The dependency graph is checked later, once environment scripts have
/// been sourced.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<PlanFile> {
    let raw = load_from_path(&path)?;
    PlanFile::try_from(raw)
}

/// `Pipewright.toml` in the current directory.
pub fn default_plan_path() -> PathBuf {
    PathBuf::from("Pipewright.toml")
}
