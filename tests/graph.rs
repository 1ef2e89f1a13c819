// tests/graph.rs

use std::error::Error;

use pipewright::dag::{NodeKind, NodeStatus};
use pipewright::errors::PipewrightError;
use pipewright::lang::Value;
use pipewright_test_utils::{init_tracing, with_timeout, TestProject};

type TestResult = Result<(), Box<dyn Error>>;

#[test]
fn cycles_between_targets_are_rejected() {
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "a"
command = "b + 1"

[[target]]
name = "b"
command = "c + 1"

[[target]]
name = "c"
command = "a + 1"
"#,
    );
    match project.try_open() {
        Err(PipewrightError::DagCycle(members)) => {
            assert!(members.contains(&"a".to_string()));
            assert!(members.contains(&"c".to_string()));
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
}

#[test]
fn duplicate_outputs_are_a_configuration_error() {
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "one"
command = 'write_file("x", file_out("shared.txt"))'

[[target]]
name = "two"
command = 'write_file("y", file_out("shared.txt"))'
"#,
    );
    let err = project.try_open().unwrap_err();
    assert!(matches!(err, PipewrightError::ConfigError(_)), "{err}");
    assert!(err.is_configuration());
    assert!(err.to_string().contains("shared.txt"));
}

#[tokio::test]
async fn recursive_functions_are_self_loops_not_cycles() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[config]
environment = ["R/functions.pw"]

[[target]]
name = "fib10"
command = "fib(10)"
"#,
    );
    project.write(
        "R/functions.pw",
        "# naive on purpose\nfib <- function(n) if (n < 2) n else fib(n - 1) + fib(n - 2)\n",
    );

    let opened = project.open();
    let graph = opened.graph();
    assert!(graph.self_loops().contains("fib"));
    assert_eq!(graph.dependencies_of("fib10"), ["fib".to_string()]);
    assert!(graph.dependencies_of("fib").is_empty());

    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert!(report.success(), "{report}");
    assert_eq!(opened.load("fib10")?, Value::Num(55.0));
    Ok(())
}

#[test]
fn imports_only_pull_in_what_targets_reference() {
    let project = TestProject::with_plan(
        r#"
[config]
environment = ["env.pw"]

[[target]]
name = "scaled"
command = "scale(10)"
"#,
    );
    project.write(
        "env.pw",
        "factor <- 3\nhelper <- function(x) x * factor\nscale <- function(x) helper(x) + 1\nunused <- function() 0\n",
    );

    let opened = project.open();
    let graph = opened.graph();
    assert_eq!(graph.kind_of("scale"), Some(NodeKind::Function));
    assert_eq!(graph.kind_of("helper"), Some(NodeKind::Function));
    assert_eq!(graph.kind_of("factor"), Some(NodeKind::Object));
    assert!(!graph.contains("unused"));
    assert_eq!(graph.dependencies_of("helper"), ["factor".to_string()]);
    assert_eq!(opened.imports().len(), 4);
}

#[test]
fn targets_shadow_imports_of_the_same_name() {
    let project = TestProject::with_plan(
        r#"
[config]
environment = ["env.pw"]

[[target]]
name = "data"
command = "c(1, 2, 3)"

[[target]]
name = "total"
command = "sum(data)"
"#,
    );
    project.write("env.pw", "data <- c(9, 9)\n");

    let opened = project.open();
    assert_eq!(opened.graph().kind_of("data"), Some(NodeKind::Target));
    assert_eq!(opened.graph().dependencies_of("total"), ["data".to_string()]);
}

const FORWARD: &str = r#"
[[target]]
name = "raw"
command = "c(3, 1, 2)"

[[target]]
name = "sorted"
command = "sort(raw)"

[[target]]
name = "top"
command = "sorted[[3]]"
"#;

const REVERSED: &str = r#"
[[target]]
name = "top"
command = "sorted[[3]]"

[[target]]
name = "sorted"
command = "sort(raw)"

[[target]]
name = "raw"
command = "c(3, 1, 2)"
"#;

#[tokio::test]
async fn plan_row_order_does_not_matter() -> TestResult {
    init_tracing();
    let forward = TestProject::with_plan(FORWARD);
    let reversed = TestProject::with_plan(REVERSED);
    let (a, b) = (forward.open(), reversed.open());

    assert_eq!(a.graph().edges(), b.graph().edges());
    assert_eq!(a.graph().topological_order(), b.graph().topological_order());

    with_timeout(a.make(a.run_options())).await?;
    with_timeout(b.make(b.run_options())).await?;
    for name in ["raw", "sorted", "top"] {
        let fa = a.meta(name)?.and_then(|m| m.fingerprint);
        let fb = b.meta(name)?.and_then(|m| m.fingerprint);
        assert!(fa.is_some());
        assert_eq!(fa, fb, "fingerprint of {name} depends on row order");
    }
    assert_eq!(a.load("top")?, Value::Num(3.0));
    Ok(())
}

#[tokio::test]
async fn graph_export_reports_target_status() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[config]
keep_going = true

[[target]]
name = "ok"
command = "1"

[[target]]
name = "later"
command = "ok + 1"

[[target]]
name = "bad"
command = 'stop("nope")'

[[target]]
name = "input"
command = 'read_lines(file_in("in.txt"))'
"#,
    );
    project.write("in.txt", "hello\n");

    let before = project.open().graph_export()?;
    assert_eq!(before.node("ok").map(|n| n.status), Some(NodeStatus::Missing));
    assert_eq!(before.node("\"in.txt\"").map(|n| n.status), Some(NodeStatus::Import));

    let opened = project.open();
    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert_eq!(report.failed(), vec!["bad"]);

    project.write("in.txt", "changed\n");
    let export = project.open().graph_export()?;
    let status = |name: &str| export.node(name).map(|n| n.status);
    assert_eq!(status("ok"), Some(NodeStatus::UpToDate));
    assert_eq!(status("later"), Some(NodeStatus::UpToDate));
    assert_eq!(status("bad"), Some(NodeStatus::Failed));
    assert_eq!(status("input"), Some(NodeStatus::Outdated));
    assert!(export
        .edges
        .iter()
        .any(|e| e.from == "ok" && e.to == "later"));

    let json: serde_json::Value = serde_json::from_str(&export.to_json()?)?;
    assert_eq!(json["nodes"].as_array().map(Vec::len), Some(export.nodes.len()));
    Ok(())
}

#[tokio::test]
async fn a_target_may_refer_to_itself() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "countdown"
command = "function(n) if (n == 0) 0 else countdown(n - 1)"

[[target]]
name = "result"
command = "countdown(3)"
"#,
    );
    let opened = project.open();
    let graph = opened.graph();
    assert!(graph.self_loops().contains("countdown"));
    assert!(graph.dependencies_of("countdown").is_empty());
    assert_eq!(graph.target_dependencies_of("result"), ["countdown"]);

    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert!(report.success(), "{report}");
    assert_eq!(report.built(), vec!["countdown", "result"]);
    assert_eq!(opened.load("result")?, Value::Num(0.0));

    let again = with_timeout(opened.make(opened.run_options())).await?;
    assert!(again.built().is_empty());
    Ok(())
}
