// tests/config.rs

use std::time::Duration;

use clap::Parser;
use pipewright::cli::{CliArgs, Command, LogLevel};
use pipewright::config::{load_from_str, parse_duration, PlanBuilder, PlanFile, TargetBuilder};
use pipewright::errors::{PipewrightError, Result};
use pipewright::logging::log_filter;
use pipewright::stale::{Trigger, TriggerPreset};
use pipewright::types::MemoryStrategyKind;

fn validate(toml: &str) -> Result<PlanFile> {
    PlanFile::try_from(load_from_str(toml)?)
}

fn config_error(toml: &str) -> String {
    match validate(toml) {
        Err(PipewrightError::ConfigError(msg)) => msg,
        Err(e) => panic!("Expected ConfigError, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn empty_plan_is_rejected() {
    let msg = config_error("[config]\njobs = 2\n");
    assert!(msg.contains("at least one [[target]]"));
}

#[test]
fn zero_jobs_is_rejected() {
    let msg = config_error(
        r#"
[config]
jobs = 0

[[target]]
name = "a"
command = "1"
"#,
    );
    assert!(msg.contains("jobs must be >= 1"));
}

#[test]
fn target_names_must_be_symbols() {
    let msg = config_error(
        r#"
[[target]]
name = "2fast"
command = "1"
"#,
    );
    assert!(msg.contains("invalid target name '2fast'"));
}

#[test]
fn duplicate_target_names_report_both_rows() {
    let msg = config_error(
        r#"
[[target]]
name = "a"
command = "1"

[[target]]
name = "b"
command = "2"

[[target]]
name = "a"
command = "3"
"#,
    );
    assert!(msg.contains("duplicate target name 'a' (rows 1 and 3)"), "{msg}");
}

#[test]
fn unparsable_commands_name_the_target() {
    let err = validate(
        r#"
[[target]]
name = "broken"
command = "f(1,"
"#,
    )
    .unwrap_err();
    match &err {
        PipewrightError::Parse { context, .. } => assert!(context.contains("'broken'")),
        other => panic!("Expected Parse error, got: {:?}", other),
    }
    assert!(err.is_configuration());
}

#[test]
fn bad_durations_and_presets_are_config_errors() {
    let msg = config_error(
        r#"
[[target]]
name = "slow"
command = "1"
timeout = "10 parsecs"
"#,
    );
    assert!(msg.contains("invalid timeout"), "{msg}");

    let msg = config_error(
        r#"
[[target]]
name = "odd"
command = "1"
trigger = "sometimes"
"#,
    );
    assert!(msg.contains("invalid trigger: sometimes"), "{msg}");
}

#[test]
fn malformed_toml_is_a_configuration_error() {
    let err = validate("[[target]\nname = ").unwrap_err();
    assert!(matches!(err, PipewrightError::TomlError(_)));
    assert!(err.is_configuration());
}

#[test]
fn plan_fields_are_validated_into_definitions() {
    let plan = validate(
        r#"
[config]
jobs = 4
keep_going = true
memory_strategy = "lazy"
environment = ["R/packages.pw", "R/functions.pw"]

[[target]]
name = "report"
command = "summarise( data )"
priority = 2.5
retries = 1
timeout = "1.5m"
cpu = "250ms"
worker = "4"
lock_envir = false
resources = { memory = "2G", cores = 2 }

[target.trigger]
command = false
condition = "file_exists('go')"

[[target]]
name = "data"
command = "c(1, 2)"
trigger = "missing"
worker = 0
"#,
    )
    .unwrap();

    assert_eq!(plan.config.jobs, 4);
    assert!(plan.config.keep_going);
    assert_eq!(plan.config.memory_strategy, MemoryStrategyKind::Lazy);
    assert_eq!(plan.config.store, ".pipewright");
    assert_eq!(plan.config.environment.len(), 2);

    let report = plan.target("report").unwrap();
    assert_eq!(report.command.deparse(), "summarise(data)");
    assert_eq!(report.priority, 2.5);
    assert_eq!(report.retries, 1);
    assert_eq!(report.timeout, Some(Duration::from_secs(90)));
    assert_eq!(report.cpu, Some(Duration::from_millis(250)));
    assert_eq!(report.worker, Some(4));
    assert_eq!(report.lock_envir, Some(false));
    assert!(!report.trigger.command);
    assert!(report.trigger.depend);
    assert!(report.trigger.condition.is_some());
    let resources = report.resources.as_ref().unwrap();
    assert_eq!(resources["cores"], 2);

    let data = plan.target("data").unwrap();
    assert_eq!(data.trigger, Trigger::preset(TriggerPreset::Missing));
    assert_eq!(data.worker, None);
    assert_eq!(
        plan.target_names().collect::<Vec<_>>(),
        ["report", "data"]
    );
}

#[test]
fn builders_go_through_the_same_validation() {
    let plan = PlanBuilder::new()
        .jobs(2)
        .keep_going(true)
        .target("raw", "c(3, 1, 2)")
        .with_target(
            TargetBuilder::new("sorted", "sort(raw)")
                .priority(1.0)
                .retries(2)
                .trigger("command")
                .timeout("5s")
                .worker(2)
                .build(),
        )
        .build()
        .unwrap();

    let sorted = plan.target("sorted").unwrap();
    assert_eq!(sorted.trigger, Trigger::preset(TriggerPreset::Command));
    assert_eq!(sorted.timeout, Some(Duration::from_secs(5)));
    assert_eq!(sorted.worker, Some(2));
    assert_eq!(sorted.retries, 2);

    let err = PlanBuilder::new()
        .target("a", "1")
        .target("a", "2")
        .build()
        .unwrap_err();
    assert!(matches!(err, PipewrightError::ConfigError(_)));
}

#[test]
fn durations_accept_the_usual_suffixes() {
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration(" 30s "), Ok(Duration::from_secs(30)));
    assert_eq!(parse_duration("1.5m"), Ok(Duration::from_secs(90)));
    assert_eq!(parse_duration("2h"), Ok(Duration::from_secs(7200)));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("10").unwrap_err().contains("missing unit"));
    assert!(parse_duration("3d").unwrap_err().contains("unsupported duration unit"));
}

#[test]
fn make_flags_parse() {
    let args = CliArgs::try_parse_from([
        "pipewright",
        "--plan",
        "other.toml",
        "make",
        "-j",
        "4",
        "--keep-going",
        "--memory-strategy",
        "lazy",
        "report",
        "fit",
    ])
    .unwrap();
    assert_eq!(args.plan, "other.toml");
    let Command::Make(make) = args.command else {
        panic!("expected make");
    };
    assert_eq!(make.jobs, Some(4));
    assert!(make.keep_going);
    assert_eq!(make.memory_strategy, Some(MemoryStrategyKind::Lazy));
    assert_eq!(make.targets, ["report", "fit"]);
}

#[test]
fn conflicting_flags_are_rejected() {
    assert!(CliArgs::try_parse_from([
        "pipewright",
        "make",
        "--lazy",
        "--memory-strategy",
        "eager"
    ])
    .is_err());
    assert!(CliArgs::try_parse_from(["pipewright", "deps"]).is_err());
    assert!(CliArgs::try_parse_from(["pipewright", "deps", "x", "--code", "f(y)"]).is_err());

    let args = CliArgs::try_parse_from(["pipewright", "deps", "--code", "f(y)"]).unwrap();
    assert!(matches!(
        args.command,
        Command::Deps { target: None, code: Some(_) }
    ));
}

#[test]
fn log_filter_prefers_the_cli_level() {
    assert_eq!(log_filter(Some(LogLevel::Debug), Some("warn")).to_string(), "debug");
    assert_eq!(log_filter(None, None).to_string(), "info");
    assert_eq!(log_filter(None, Some("  ")).to_string(), "info");
    assert_eq!(log_filter(None, Some("WARNING")).to_string(), "warn");
    assert_eq!(log_filter(None, Some("pipewright=bogus")).to_string(), "info");

    let directives = log_filter(None, Some("warn,pipewright::engine=debug")).to_string();
    assert!(directives.contains("pipewright::engine=debug"), "{directives}");
}
