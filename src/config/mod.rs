// src/config/mod.rs

//! Plan files: model, loading and validation.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a plan file from disk (`loader.rs`).
//! - Validate it into a [`PlanFile`] (`validate.rs`).
//! - Build plans in code (`builder.rs`).

pub mod builder;
pub mod duration;
pub mod loader;
pub mod model;
pub mod validate;

pub use builder::{PlanBuilder, TargetBuilder};
pub use duration::parse_duration;
pub use loader::{default_plan_path, load_and_validate, load_from_path, load_from_str};
pub use model::{
    ConfigSection, PlanFile, RawPlanFile, TargetConfig, TargetDef, TriggerConfig, TriggerTable,
    WorkerConfig,
};
