// src/errors.rs

//! Crate-wide error type and result alias.

use thiserror::Error;

use crate::lang::ParseError;

#[derive(Error, Debug)]
pub enum PipewrightError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parse error in {context}: {source}")]
    Parse {
        context: String,
        #[source]
        source: ParseError,
    },

    #[error("Cycle detected in dependency graph: {}", .0.join(", "))]
    DagCycle(Vec<String>),

    #[error("Target not found: {0}")]
    TargetNotFound(String),

    #[error("Target '{target}' failed: {message}")]
    Build { target: String, message: String },

    #[error("Target '{target}' timed out: {message}")]
    Timeout { target: String, message: String },

    #[error("Target '{target}' attempted to assign '{binding}' in the locked environment (set `lock_envir = false` on the target to allow it)")]
    EnvironmentIntegrity { target: String, binding: String },

    #[error("Store error ({key}): {message}")]
    Store { key: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipewrightError {
    pub fn parse(context: impl Into<String>, source: ParseError) -> Self {
        PipewrightError::Parse {
            context: context.into(),
            source,
        }
    }

    pub fn store(key: impl Into<String>, message: impl ToString) -> Self {
        PipewrightError::Store {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Errors detected before anything is built.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipewrightError::ConfigError(_)
                | PipewrightError::Parse { .. }
                | PipewrightError::DagCycle(_)
                | PipewrightError::TomlError(_)
        )
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, PipewrightError>;
