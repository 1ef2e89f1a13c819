// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, Subcommand, ValueEnum};

use crate::types::MemoryStrategyKind;

/// Command-line arguments for `pipewright`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "pipewright",
    version,
    about = "Build pipeline targets incrementally, skipping what is up to date.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the plan file (TOML).
    ///
    /// Default: `Pipewright.toml` in the current working directory.
    #[arg(long, global = true, value_name = "PATH", default_value = "Pipewright.toml")]
    pub plan: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `PIPEWRIGHT_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Build outdated targets.
    Make(MakeArgs),

    /// List outdated targets without building anything.
    Outdated {
        /// Print why each target is outdated.
        #[arg(long)]
        explain: bool,
    },

    /// Print the dependency graph as JSON, with node statuses.
    Graph,

    /// Print the recorded build metadata of a target as JSON.
    Show { target: String },

    /// Print the cached value of a target.
    Load { target: String },

    /// Print the dependencies detected in a target's command, or in `--code`.
    Deps {
        #[arg(required_unless_present = "code")]
        target: Option<String>,

        /// Analyze this expression instead of a target.
        #[arg(long, value_name = "EXPR", conflicts_with = "target")]
        code: Option<String>,
    },

    /// List cached and failed targets with their build times.
    Status,

    /// Remove build records (all of them when no target is given).
    Clean { targets: Vec<String> },

    /// Drop records of targets no longer in the plan and unreferenced values.
    Gc {
        /// Also forget superseded builds of current targets.
        #[arg(long)]
        prune_history: bool,
    },

    /// Parse and validate the plan, print the graph, but build nothing.
    Check,
}

#[derive(Debug, Clone, clap::Args)]
pub struct MakeArgs {
    /// Build only these targets and what they depend on.
    pub targets: Vec<String>,

    /// Number of concurrent builds. Overrides `[config].jobs`.
    #[arg(long, short = 'j', value_name = "N")]
    pub jobs: Option<usize>,

    /// Keep building independent targets after a failure.
    #[arg(long)]
    pub keep_going: bool,

    /// How dependency values are loaded (eager, lazy).
    #[arg(long, value_name = "STRATEGY")]
    pub memory_strategy: Option<MemoryStrategyKind>,

    /// Shorthand for `--memory-strategy lazy`.
    #[arg(long, conflicts_with = "memory_strategy")]
    pub lazy: bool,

    /// Allow every target to assign into the shared environment.
    #[arg(long)]
    pub no_lock_envir: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
