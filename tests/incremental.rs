// tests/incremental.rs

use std::error::Error;

use pipewright::engine::{RunReport, RunState};
use pipewright::lang::Value;
use pipewright::stale::Reason;
use pipewright::types::MemoryStrategyKind;
use pipewright_test_utils::{init_tracing, with_timeout, CallCounter, TestProject};

type TestResult = Result<(), Box<dyn Error>>;

async fn make(project: &TestProject, counter: &CallCounter) -> RunReport {
    let opened = project.open_with(counter.builtins());
    with_timeout(opened.make(opened.run_options()))
        .await
        .expect("make")
}

fn load(project: &TestProject, name: &str) -> Value {
    project.open().load(name).expect("load")
}

fn reasons<'a>(report: &'a RunReport, name: &str) -> &'a [Reason] {
    report
        .targets
        .get(name)
        .map(|t| t.reasons.as_slice())
        .unwrap_or(&[])
}

#[tokio::test]
async fn second_make_builds_nothing() {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "a"
command = 'count("a")'

[[target]]
name = "b"
command = 'a + count("b")'
"#,
    );

    let first = make(&project, &counter).await;
    assert!(first.success(), "{first}");
    assert_eq!(first.built(), vec!["a", "b"]);
    assert_eq!(reasons(&first, "a"), [Reason::Missing]);

    let second = make(&project, &counter).await;
    assert!(second.built().is_empty(), "{second}");
    assert_eq!(second.skipped(), vec!["a", "b"]);
    assert_eq!(counter.get("a"), 1);
    assert_eq!(counter.get("b"), 1);
    assert_eq!(load(&project, "b"), Value::Num(2.0));
}

const CHAIN: &str = r#"
[[target]]
name = "raw"
command = 'count("raw")'

[[target]]
name = "mid"
command = "raw + 1"

[[target]]
name = "top"
command = "mid * 2"

[[target]]
name = "other"
command = 'count("other")'
"#;

#[tokio::test]
async fn command_change_rebuilds_the_target_and_its_dependents() {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(CHAIN);
    make(&project, &counter).await;

    project.plan(&CHAIN.replace("raw + 1", "raw + 10"));
    let report = make(&project, &counter).await;
    assert_eq!(report.built(), vec!["mid", "top"]);
    assert_eq!(reasons(&report, "mid"), [Reason::Command]);
    assert_eq!(reasons(&report, "top"), [Reason::Depend]);
    assert_eq!(counter.get("raw"), 1);
    assert_eq!(counter.get("other"), 1);
    assert_eq!(load(&project, "top"), Value::Num(22.0));
}

#[tokio::test]
async fn formatting_and_comments_do_not_rebuild() {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(CHAIN);
    make(&project, &counter).await;

    project.plan(&CHAIN.replace("raw + 1", "raw+1   # plus one").replace("mid * 2", "(mid)*2"));
    let report = make(&project, &counter).await;
    assert!(report.built().is_empty(), "{report}");
}

#[tokio::test]
async fn restricted_runs_build_only_what_is_requested() {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(CHAIN);
    let opened = project.open_with(counter.builtins());
    let mut options = opened.run_options();
    options.targets = Some(vec!["mid".to_string()]);

    let report = with_timeout(opened.make(options)).await.unwrap();
    assert_eq!(report.built(), vec!["mid", "raw"]);
    assert!(report.state_of("top").is_none());
    assert_eq!(counter.get("other"), 0);

    let mut options = opened.run_options();
    options.targets = Some(vec!["nope".to_string()]);
    assert!(with_timeout(opened.make(options)).await.is_err());
}

#[tokio::test]
async fn environment_changes_rebuild_users() {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(
        r#"
[config]
environment = ["env.pw"]

[[target]]
name = "y"
command = "f(2)"

[[target]]
name = "z"
command = 'count("z")'
"#,
    );
    project.write("env.pw", "helper <- function(x) x * 2\nf <- function(x) helper(x) + 1\n");
    make(&project, &counter).await;
    assert_eq!(load(&project, "y"), Value::Num(5.0));

    // Same definitions, different layout.
    project.write(
        "env.pw",
        "# helpers\nhelper <- function(x)   x*2\n\nf <- function(x) helper(x)+1 # add one\n",
    );
    assert!(make(&project, &counter).await.built().is_empty());

    // A change two imports upstream still reaches the target.
    project.write("env.pw", "helper <- function(x) x * 3\nf <- function(x) helper(x) + 1\n");
    let report = make(&project, &counter).await;
    assert_eq!(report.built(), vec!["y"]);
    assert_eq!(reasons(&report, "y"), [Reason::Depend]);
    assert_eq!(load(&project, "y"), Value::Num(7.0));
    assert_eq!(counter.get("z"), 1);
}

const FILES: &str = r#"
[[target]]
name = "copy"
command = 'write_lines(read_lines(file_in("in.txt")), file_out("mid.txt"))'

[[target]]
name = "lines"
command = 'length(read_lines(file_in("mid.txt")))'
"#;

#[tokio::test]
async fn file_changes_propagate_through_produced_files() -> TestResult {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(FILES);
    project.write("in.txt", "a\nb\n");

    let first = make(&project, &counter).await;
    assert_eq!(first.built(), vec!["copy", "lines"]);
    assert_eq!(project.open().graph().dependencies_of("lines"), ["copy".to_string()]);
    assert_eq!(load(&project, "lines"), Value::Num(2.0));

    project.write("in.txt", "a\nb\nc\n");
    let second = make(&project, &counter).await;
    assert_eq!(second.built(), vec!["copy", "lines"]);
    // The input is also a file node, so the dependency hash moves too.
    assert_eq!(
        reasons(&second, "copy"),
        [Reason::Depend, Reason::InputFile("in.txt".into())]
    );
    assert_eq!(load(&project, "lines"), Value::Num(3.0));

    assert!(make(&project, &counter).await.built().is_empty());
    Ok(())
}

#[tokio::test]
async fn restoring_a_tampered_output_does_not_cascade() {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(FILES);
    project.write("in.txt", "a\nb\n");
    make(&project, &counter).await;

    project.write("mid.txt", "tampered\n");
    let report = make(&project, &counter).await;
    assert_eq!(report.built(), vec!["copy"]);
    assert_eq!(reasons(&report, "copy"), [Reason::OutputModified("mid.txt".into())]);
    assert_eq!(project.read("mid.txt"), "a\nb\n");
}

#[tokio::test]
async fn deleted_outputs_are_rebuilt() {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "out"
command = 'write_file("hello", file_out("out/hello.txt"))'
"#,
    );
    make(&project, &counter).await;
    assert_eq!(project.read("out/hello.txt"), "hello");

    project.remove("out/hello.txt");
    let report = make(&project, &counter).await;
    assert_eq!(report.built(), vec!["out"]);
    assert_eq!(reasons(&report, "out"), [Reason::OutputMissing("out/hello.txt".into())]);
    assert!(project.exists("out/hello.txt"));
}

#[tokio::test]
async fn missing_value_objects_are_rebuilt() {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "v"
command = 'count("v")'
"#,
    );
    make(&project, &counter).await;

    let entry = project.open().store().get_entry("v").unwrap().expect("entry");
    project.remove(&format!(".pipewright/objects/{}", entry.value));

    let report = make(&project, &counter).await;
    assert_eq!(reasons(&report, "v"), [Reason::ValueMissing]);
    assert_eq!(counter.get("v"), 2);
}

#[tokio::test]
async fn never_and_always_triggers() {
    init_tracing();
    let counter = CallCounter::new();
    let plan = r#"
[[target]]
name = "frozen"
command = 'count("frozen")'
trigger = "never"

[[target]]
name = "hot"
command = 'count("hot")'
trigger = "always"
"#;
    let project = TestProject::with_plan(plan);
    make(&project, &counter).await;

    project.plan(&plan.replace(r#"count("frozen")"#, r#"count("frozen") + 100"#));
    let report = make(&project, &counter).await;
    assert_eq!(report.built(), vec!["hot"]);
    assert_eq!(reasons(&report, "hot"), [Reason::Condition]);

    make(&project, &counter).await;
    assert_eq!(counter.get("frozen"), 1);
    assert_eq!(counter.get("hot"), 3);
}

#[tokio::test]
async fn condition_trigger_rebuilds_while_true() {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "c"
command = 'count("c")'
trigger = { condition = 'file_exists("go")' }
"#,
    );
    make(&project, &counter).await;
    assert!(make(&project, &counter).await.built().is_empty());

    project.write("go", "");
    let report = make(&project, &counter).await;
    assert_eq!(reasons(&report, "c"), [Reason::Condition]);
    assert_eq!(counter.get("c"), 2);
}

#[tokio::test]
async fn change_trigger_follows_the_expression_value() {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "v"
command = 'count("v")'
trigger = { change = 'read_file("version.txt")' }
"#,
    );
    project.write("version.txt", "1");
    make(&project, &counter).await;
    assert!(make(&project, &counter).await.built().is_empty());

    project.write("version.txt", "2");
    let report = make(&project, &counter).await;
    assert_eq!(reasons(&report, "v"), [Reason::Change]);
    assert_eq!(counter.get("v"), 2);
}

#[tokio::test]
async fn command_trigger_ignores_dependency_changes() {
    init_tracing();
    let counter = CallCounter::new();
    let plan = r#"
[[target]]
name = "src"
command = 'read_lines(file_in("x.txt"))'

[[target]]
name = "cmd"
command = 'length(src) + count("cmd")'
trigger = "command"
"#;
    let project = TestProject::with_plan(plan);
    project.write("x.txt", "1\n");
    make(&project, &counter).await;

    project.write("x.txt", "1\n2\n");
    let report = make(&project, &counter).await;
    assert_eq!(report.built(), vec!["src"]);
    assert_eq!(counter.get("cmd"), 1);

    project.plan(&plan.replace("length(src)", "length(src) * 1"));
    let report = make(&project, &counter).await;
    assert_eq!(report.built(), vec!["cmd"]);
    assert_eq!(load(&project, "cmd"), Value::Num(4.0));
}

#[tokio::test]
async fn switching_trigger_mode_rebuilds_once() {
    init_tracing();
    let counter = CallCounter::new();
    let plan = r#"
[[target]]
name = "t"
command = 'count("t")'
"#;
    let project = TestProject::with_plan(plan);
    make(&project, &counter).await;

    project.plan(&format!("{plan}trigger = \"command\"\n"));
    let report = make(&project, &counter).await;
    assert_eq!(reasons(&report, "t"), [Reason::TriggerChanged]);
    assert!(make(&project, &counter).await.built().is_empty());
}

#[tokio::test]
async fn outdated_explains_without_building() -> TestResult {
    init_tracing();
    let plan = r#"
[[target]]
name = "raw"
command = "c(1, 2)"

[[target]]
name = "mid"
command = "sum(raw)"

[[target]]
name = "top"
command = "mid + 1"

[[target]]
name = "frozen"
command = "mid * 0"
trigger = "missing"
"#;
    let project = TestProject::with_plan(plan);

    let before = project.open().outdated()?;
    assert_eq!(before.len(), 4);
    assert_eq!(before["mid"], [Reason::Missing, Reason::Upstream("raw".into())]);
    assert_eq!(before["frozen"], [Reason::Missing]);

    let opened = project.open();
    with_timeout(opened.make(opened.run_options())).await?;
    assert!(project.open().outdated()?.is_empty());

    project.plan(&plan.replace("sum(raw)", "sum(raw) * 2"));
    let after = project.open().outdated()?;
    assert_eq!(after.keys().collect::<Vec<_>>(), ["mid", "top"]);
    assert_eq!(after["mid"], [Reason::Command]);
    assert_eq!(after["top"], [Reason::Upstream("mid".into())]);
    assert_eq!(Reason::Command.to_string(), "command changed");

    // Nothing was built by asking.
    assert_eq!(project.open().load("mid")?, Value::Num(3.0));
    Ok(())
}

#[tokio::test]
async fn lazy_and_eager_strategies_agree() -> TestResult {
    init_tracing();
    let plan = r#"
[config]
jobs = 3

[[target]]
name = "a"
command = "seq(1, 10)"

[[target]]
name = "b"
command = "sum(a)"

[[target]]
name = "c"
command = "max(a) + b"

[[target]]
name = "d"
command = "c - b"
"#;
    let eager = TestProject::with_plan(plan);
    let lazy = TestProject::with_plan(plan);

    let opened = eager.open();
    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert!(report.success());

    let opened = lazy.open();
    let mut options = opened.run_options();
    options.memory = MemoryStrategyKind::Lazy;
    let report = with_timeout(opened.make(options)).await?;
    assert!(report.success());
    assert!(report.targets.values().all(|t| t.state == RunState::Done));

    for name in ["a", "b", "c", "d"] {
        assert_eq!(eager.open().load(name)?, lazy.open().load(name)?);
    }
    assert_eq!(lazy.open().load("c")?, Value::Num(65.0));
    Ok(())
}
