// src/lib.rs

pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod extract;
pub mod imports;
pub mod lang;
pub mod logging;
pub mod project;
pub mod stale;
pub mod store;
pub mod types;

use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::cli::{CliArgs, Command, MakeArgs};
use crate::engine::AbortHandle;
use crate::errors::PipewrightError;
use crate::extract::deps_code;
use crate::project::Project;
use crate::types::MemoryStrategyKind;

pub use crate::project::TargetMeta;

/// High-level entry point used by `main.rs`.
///
/// Opens the project named by `--plan` and runs one subcommand. A `make`
/// that leaves any target unbuilt exits with status 1.
pub async fn run(args: CliArgs) -> Result<ExitCode> {
    if let Command::Deps {
        code: Some(code), ..
    } = &args.command
    {
        println!("{}", serde_json::to_string_pretty(&deps_code(code)?)?);
        return Ok(ExitCode::SUCCESS);
    }

    let project = Project::open(&args.plan)
        .with_context(|| format!("failed to open plan '{}'", args.plan))?;

    match args.command {
        Command::Make(make) => return run_make(&project, make).await,
        Command::Outdated { explain } => {
            for (name, reasons) in project.outdated()? {
                if explain {
                    let reasons: Vec<String> = reasons.iter().map(ToString::to_string).collect();
                    println!("{name}: {}", reasons.join("; "));
                } else {
                    println!("{name}");
                }
            }
        }
        Command::Graph => println!("{}", project.graph_export()?.to_json()?),
        Command::Show { target } => {
            let meta = project
                .meta(&target)?
                .ok_or(PipewrightError::TargetNotFound(target))?;
            println!("{}", serde_json::to_string_pretty(&meta)?);
        }
        Command::Load { target } => println!("{}", project.load(&target)?),
        Command::Deps { target, .. } => {
            let name = target.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(project.deps_target(&name)?)?);
        }
        Command::Status => print_status(&project)?,
        Command::Clean { targets } => {
            for name in project.clean(&targets)? {
                println!("removed {name}");
            }
        }
        Command::Gc { prune_history } => {
            let report = project.gc(prune_history)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Check => print_check(&project),
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_make(project: &Project, args: MakeArgs) -> Result<ExitCode> {
    let mut options = project.run_options();
    if let Some(jobs) = args.jobs {
        options.jobs = jobs.max(1);
    }
    options.keep_going |= args.keep_going;
    if let Some(memory) = args.memory_strategy {
        options.memory = memory;
    }
    if args.lazy {
        options.memory = MemoryStrategyKind::Lazy;
    }
    if args.no_lock_envir {
        options.lock_envir = false;
    }
    if !args.targets.is_empty() {
        options.targets = Some(args.targets);
    }

    // Ctrl-C aborts the run; running builds are cancelled.
    let abort = AbortHandle::new();
    {
        let abort = abort.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            warn!("interrupted; aborting run");
            abort.abort();
        });
    }

    let report = project.make_with_abort(options, abort).await?;
    print!("{report}");
    Ok(if report.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_status(project: &Project) -> Result<()> {
    let times = project.build_times()?;
    println!("cached ({}):", times.len());
    for (name, secs) in &times {
        println!("  {name}  {secs:.3}s");
    }
    let failed = project.failed()?;
    if !failed.is_empty() {
        println!("failed ({}):", failed.len());
        for name in failed {
            println!("  {name}");
        }
    }
    Ok(())
}

/// Plan summary: targets in build order with their dependencies.
fn print_check(project: &Project) {
    let plan = project.plan();
    let graph = project.graph();
    println!("pipewright check");
    println!("  config.jobs = {}", plan.config.jobs);
    println!("  config.memory_strategy = {}", plan.config.memory_strategy);
    println!("  config.store = {}", plan.config.store);
    println!("  imports = {}", project.imports().len());
    println!();

    println!("targets ({}):", plan.targets.len());
    for name in graph.topological_order() {
        let Some(target) = plan.target(name) else {
            continue;
        };
        println!("  - {name}");
        println!("      command: {}", target.command.deparse());
        let deps = graph.dependencies_of(name);
        if !deps.is_empty() {
            println!("      depends on: {}", deps.join(", "));
        }
        if target.retries > 0 {
            println!("      retries: {}", target.retries);
        }
        if let Some(timeout) = target.timeout {
            println!("      timeout: {timeout:?}");
        }
    }

    debug!("check complete (nothing built)");
}
