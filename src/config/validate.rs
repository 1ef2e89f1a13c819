// src/config/validate.rs

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::config::duration::parse_duration;
use crate::config::model::{
    PlanFile, RawPlanFile, TargetConfig, TargetDef, TriggerConfig, WorkerConfig,
};
use crate::errors::{PipewrightError, Result};
use crate::extract::{extract, Role, Wrappers};
use crate::lang::{parse_expr, Expr};
use crate::stale::{Trigger, TriggerPreset};

static TARGET_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z.][A-Za-z0-9_.]*$").expect("valid regex"));

/// Whether `name` is usable as a target name (a plain symbol).
pub fn is_valid_target_name(name: &str) -> bool {
    TARGET_NAME.is_match(name)
}

impl TryFrom<RawPlanFile> for PlanFile {
    type Error = PipewrightError;

    fn try_from(raw: RawPlanFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_plan(&raw)?;
        let targets = raw
            .target
            .iter()
            .map(|t| target_def(t, raw.config.jobs))
            .collect::<Result<Vec<_>>>()?;
        validate_outputs(&targets)?;
        Ok(PlanFile::new_unchecked(raw.config, targets))
    }
}

fn validate_raw_plan(plan: &RawPlanFile) -> Result<()> {
    ensure_has_targets(plan)?;
    validate_global_config(plan)?;
    validate_target_names(plan)?;
    Ok(())
}

fn ensure_has_targets(plan: &RawPlanFile) -> Result<()> {
    if plan.target.is_empty() {
        return Err(PipewrightError::ConfigError(
            "plan must contain at least one [[target]]".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(plan: &RawPlanFile) -> Result<()> {
    if plan.config.jobs == 0 {
        return Err(PipewrightError::ConfigError(
            "[config].jobs must be >= 1 (got 0)".to_string(),
        ));
    }
    if plan.config.store.trim().is_empty() {
        return Err(PipewrightError::ConfigError(
            "[config].store must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_target_names(plan: &RawPlanFile) -> Result<()> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for (row, target) in plan.target.iter().enumerate() {
        if !is_valid_target_name(&target.name) {
            return Err(PipewrightError::ConfigError(format!(
                "invalid target name '{}' (row {})",
                target.name,
                row + 1
            )));
        }
        if let Some(first) = seen.insert(&target.name, row) {
            return Err(PipewrightError::ConfigError(format!(
                "duplicate target name '{}' (rows {} and {})",
                target.name,
                first + 1,
                row + 1
            )));
        }
    }
    Ok(())
}

fn target_def(cfg: &TargetConfig, jobs: usize) -> Result<TargetDef> {
    let command = parse_expr(&cfg.command)
        .map_err(|e| PipewrightError::parse(format!("command of target '{}'", cfg.name), e))?;

    if !cfg.priority.is_finite() {
        return Err(PipewrightError::ConfigError(format!(
            "target '{}': priority must be a finite number",
            cfg.name
        )));
    }

    Ok(TargetDef {
        name: cfg.name.clone(),
        command,
        priority: cfg.priority,
        retries: cfg.retries,
        trigger: trigger(cfg)?,
        timeout: duration(cfg, "timeout", cfg.timeout.as_deref())?,
        cpu: duration(cfg, "cpu", cfg.cpu.as_deref())?,
        worker: worker(cfg, jobs),
        lock_envir: cfg.lock_envir,
        resources: cfg
            .resources
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?,
    })
}

fn duration(
    cfg: &TargetConfig,
    field: &str,
    value: Option<&str>,
) -> Result<Option<std::time::Duration>> {
    value
        .map(|s| {
            parse_duration(s).map_err(|e| {
                PipewrightError::ConfigError(format!("target '{}': invalid {field}: {e}", cfg.name))
            })
        })
        .transpose()
}

fn trigger(cfg: &TargetConfig) -> Result<Trigger> {
    let expr = |field: &str, src: &Option<String>| -> Result<Option<Expr>> {
        src.as_deref()
            .map(|s| {
                parse_expr(s).map_err(|e| {
                    PipewrightError::parse(format!("trigger {field} of target '{}'", cfg.name), e)
                })
            })
            .transpose()
    };

    match &cfg.trigger {
        None => Ok(Trigger::default()),
        Some(TriggerConfig::Preset(name)) => TriggerPreset::from_str(name)
            .map(Trigger::preset)
            .map_err(|e| PipewrightError::ConfigError(format!("target '{}': {e}", cfg.name))),
        Some(TriggerConfig::Table(table)) => Ok(Trigger {
            command: table.command,
            depend: table.depend,
            file: table.file,
            missing: table.missing,
            condition: expr("condition", &table.condition)?,
            change: expr("change", &table.change)?,
        }),
    }
}

/// Out-of-range or non-numeric workers are ignored with a warning.
fn worker(cfg: &TargetConfig, jobs: usize) -> Option<usize> {
    let id = match &cfg.worker {
        None => return None,
        Some(WorkerConfig::Id(id)) => Some(*id),
        Some(WorkerConfig::Name(name)) => name.trim().parse::<usize>().ok(),
    };
    match id {
        Some(id) if (1..=jobs).contains(&id) => Some(id),
        _ => {
            warn!(
                target = %cfg.name,
                worker = ?cfg.worker,
                jobs,
                "preferred worker is not in 1..=jobs; ignoring"
            );
            None
        }
    }
}

/// No two targets may declare the same output file.
fn validate_outputs(targets: &[TargetDef]) -> Result<()> {
    let wrappers = Wrappers::new();
    let mut producers: BTreeMap<String, &str> = BTreeMap::new();
    for target in targets {
        let deps = extract(&target.command, Role::Target, &wrappers);
        for path in deps.file_out {
            if let Some(other) = producers.insert(path.clone(), &target.name) {
                return Err(PipewrightError::ConfigError(format!(
                    "output file '{path}' is declared by both '{other}' and '{}'",
                    target.name
                )));
            }
        }
    }
    Ok(())
}
