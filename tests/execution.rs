// tests/execution.rs

use std::error::Error;
use std::time::{Duration, Instant};

use pipewright::engine::{AbortHandle, RunState};
use pipewright::lang::{Builtins, Value};
use pipewright::store::{AttemptOutcome, BuildStatus, FingerprintStore};
use pipewright_test_utils::{init_tracing, with_timeout, CallCounter, TestProject};

type TestResult = Result<(), Box<dyn Error>>;

const THREE_INDEPENDENT: &str = r#"
[[target]]
name = "a"
command = 'stop("a is broken")'

[[target]]
name = "b"
command = 'count("b")'

[[target]]
name = "c"
command = 'count("c")'

[[target]]
name = "after_a"
command = "a + 1"
"#;

#[tokio::test]
async fn first_failure_stops_the_run() -> TestResult {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(THREE_INDEPENDENT);
    let opened = project.open_with(counter.builtins());

    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert!(!report.success());
    assert_eq!(report.failed(), vec!["a"]);
    assert_eq!(report.cancelled(), vec!["after_a", "b", "c"]);
    assert_eq!(counter.get("b") + counter.get("c"), 0);
    assert!(report.to_string().contains("a is broken"));
    Ok(())
}

#[tokio::test]
async fn keep_going_builds_independent_targets() -> TestResult {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(THREE_INDEPENDENT);
    let opened = project.open_with(counter.builtins());
    let mut options = opened.run_options();
    options.keep_going = true;

    let report = with_timeout(opened.make(options)).await?;
    assert_eq!(report.failed(), vec!["a"]);
    assert_eq!(report.built(), vec!["b", "c"]);
    assert_eq!(report.state_of("after_a"), Some(RunState::Cancelled));
    assert!(!report.success());
    assert_eq!(opened.failed()?, vec!["a".to_string()]);
    Ok(())
}

#[tokio::test]
async fn retries_until_success_and_records_every_attempt() -> TestResult {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "x"
command = 'flaky("x", 2)'
retries = 2
"#,
    );
    let opened = project.open_with(counter.builtins());

    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert_eq!(report.state_of("x"), Some(RunState::Done));
    assert_eq!(report.attempts_of("x"), 3);
    assert_eq!(opened.load("x")?, Value::Num(3.0));

    let meta = opened.meta("x")?.expect("meta");
    assert_eq!(meta.status, BuildStatus::Success);
    let outcomes: Vec<AttemptOutcome> = meta.meta.attempts.iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        [AttemptOutcome::Failed, AttemptOutcome::Failed, AttemptOutcome::Success]
    );
    assert_eq!(meta.meta.attempts[0].number, 1);
    assert!(opened.failed()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_leave_a_diagnostic() -> TestResult {
    init_tracing();
    let counter = CallCounter::new();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "y"
command = 'flaky("y", 5)'
retries = 1
"#,
    );
    let opened = project.open_with(counter.builtins());

    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert_eq!(report.state_of("y"), Some(RunState::Failed));
    assert_eq!(report.attempts_of("y"), 2);
    assert_eq!(counter.get("y"), 2);

    let meta = opened.meta("y")?.expect("meta");
    assert_eq!(meta.status, BuildStatus::Error);
    assert_eq!(meta.meta.attempts.len(), 2);
    assert!(meta.last_success.is_none());
    assert!(meta.meta.error.as_deref().unwrap_or_default().contains("flaky 'y'"));
    Ok(())
}

#[tokio::test]
async fn elapsed_limit_times_out_a_build() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "slow"
command = "{ sleep(5); 1 }"
timeout = "50ms"
retries = 1
"#,
    );
    let opened = project.open();

    let started = Instant::now();
    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.state_of("slow"), Some(RunState::Failed));
    assert_eq!(report.attempts_of("slow"), 2);
    assert_eq!(report.failed(), vec!["slow"]);
    let error = report.targets["slow"].error.clone().unwrap_or_default();
    assert!(error.contains("timed out"), "{error}");

    let meta = opened.meta("slow")?.expect("meta");
    assert!(meta
        .meta
        .attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::TimedOut));
    assert_eq!(meta.status, BuildStatus::Error);
    Ok(())
}

#[tokio::test]
async fn compute_limit_times_out_a_build() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[config]
environment = ["env.pw"]

[[target]]
name = "busy"
command = "fib(24)"
cpu = "1ms"
"#,
    );
    project.write("env.pw", "fib <- function(n) if (n < 2) n else fib(n - 1) + fib(n - 2)\n");
    let opened = project.open();

    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert_eq!(report.state_of("busy"), Some(RunState::Failed));
    let error = report.targets["busy"].error.clone().unwrap_or_default();
    assert!(error.contains("timed out"), "{error}");
    assert!(error.contains("compute time limit"), "{error}");
    assert_eq!(report.failed(), vec!["busy"]);
    Ok(())
}

#[tokio::test]
async fn locked_environment_rejects_shared_writes() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[config]
keep_going = true

[[target]]
name = "sneaky"
command = "{ counter <<- 1; 2 }"
retries = 3

[[target]]
name = "allowed"
command = "{ seen <<- 1; 2 }"
lock_envir = false
"#,
    );
    let opened = project.open();

    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert_eq!(report.state_of("sneaky"), Some(RunState::Failed));
    assert_eq!(report.attempts_of("sneaky"), 1);
    let error = report.targets["sneaky"].error.clone().unwrap_or_default();
    assert!(error.contains("'counter'"), "{error}");
    assert!(error.contains("lock_envir"), "{error}");

    assert_eq!(report.state_of("allowed"), Some(RunState::Done));
    assert_eq!(opened.context().shared.get("seen"), Some(Value::Num(1.0)));
    assert!(opened.context().shared.get("counter").is_none());
    Ok(())
}

#[tokio::test]
async fn unlocking_the_whole_run() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[config]
lock_envir = false

[[target]]
name = "writer"
command = "{ total <<- 10; total }"
"#,
    );
    let opened = project.open();
    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert!(report.success(), "{report}");
    assert_eq!(opened.load("writer")?, Value::Num(10.0));
    Ok(())
}

#[tokio::test]
async fn abort_cancels_running_and_pending_builds() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "slow"
command = "{ sleep(5); 1 }"

[[target]]
name = "next"
command = "slow + 1"
"#,
    );
    let opened = project.open();
    let abort = AbortHandle::new();
    let trigger = abort.clone();

    let started = Instant::now();
    let (report, ()) = with_timeout(async {
        tokio::join!(opened.make_with_abort(opened.run_options(), abort), async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.abort();
        })
    })
    .await;
    let report = report?;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(report.aborted);
    assert!(!report.success());
    assert_eq!(report.cancelled(), vec!["next", "slow"]);
    assert!(opened.store().get_entry("slow")?.is_none());
    assert!(opened.failed()?.is_empty());
    Ok(())
}

#[tokio::test]
async fn failure_keeps_the_previous_value() -> TestResult {
    init_tracing();
    let counter = CallCounter::new();
    let plan = r#"
[[target]]
name = "v"
command = 'count("v")'
"#;
    let project = TestProject::with_plan(plan);
    let opened = project.open_with(counter.builtins());
    with_timeout(opened.make(opened.run_options())).await?;

    project.plan(&plan.replace(r#"count("v")"#, r#"stop("broken")"#));
    let broken = project.open_with(counter.builtins());
    let report = with_timeout(broken.make(broken.run_options())).await?;
    assert_eq!(report.failed(), vec!["v"]);

    assert_eq!(broken.load("v")?, Value::Num(1.0));
    let meta = broken.meta("v")?.expect("meta");
    assert_eq!(meta.status, BuildStatus::Error);
    assert!(meta.meta.error.as_deref().unwrap_or_default().contains("broken"));
    assert_eq!(meta.meta.traceback, ["stop"]);
    assert!(meta.last_success.is_some());
    assert!(meta.fingerprint.is_some());

    // Going back to the cached command makes the target current again.
    project.plan(plan);
    let fixed = project.open_with(counter.builtins());
    let report = with_timeout(fixed.make(fixed.run_options())).await?;
    assert!(report.built().is_empty());
    assert!(fixed.failed()?.is_empty());
    assert_eq!(counter.get("v"), 1);
    Ok(())
}

#[tokio::test]
async fn preferred_workers_are_honoured() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[config]
jobs = 3

[[target]]
name = "pinned"
command = "1"
worker = 3

[[target]]
name = "named"
command = "2"
worker = "2"

[[target]]
name = "nowhere"
command = "3"
worker = 9
"#,
    );
    let opened = project.open();
    assert_eq!(opened.plan().target("nowhere").and_then(|t| t.worker), None);

    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert!(report.success());
    assert_eq!(report.targets["pinned"].worker, Some(3));
    assert_eq!(report.targets["named"].worker, Some(2));
    let meta = opened.meta("pinned")?.expect("meta");
    assert_eq!(meta.meta.worker.as_deref(), Some("3"));
    Ok(())
}

const RECURSIVE_SUM: &str = "sum_to <- function(n) if (n == 0) 0 else n + sum_to(n - 1)\n";

#[tokio::test]
async fn deep_recursion_builds_on_worker_threads() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[config]
environment = ["env.pw"]

[[target]]
name = "deep"
command = "sum_to(400)"
"#,
    );
    project.write("env.pw", &format!("{RECURSIVE_SUM}warm <- sum_to(450)\n"));
    let opened = project.open();
    assert_eq!(opened.context().shared.get("warm"), Some(Value::Num(101475.0)));

    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert_eq!(report.state_of("deep"), Some(RunState::Done), "{report}");
    assert_eq!(opened.load("deep")?, Value::Num(80200.0));
    Ok(())
}

#[tokio::test]
async fn runaway_recursion_fails_the_target() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[config]
keep_going = true
environment = ["env.pw"]

[[target]]
name = "runaway"
command = "sum_to(5000)"

[[target]]
name = "fine"
command = "sum_to(10)"
"#,
    );
    project.write("env.pw", RECURSIVE_SUM);
    let opened = project.open();

    let report = with_timeout(opened.make(opened.run_options())).await?;
    assert_eq!(report.state_of("runaway"), Some(RunState::Failed));
    let error = report.targets["runaway"].error.clone().unwrap_or_default();
    assert!(error.contains("nested too deeply"), "{error}");
    assert_eq!(opened.load("fine")?, Value::Num(55.0));
    assert_eq!(opened.failed()?, vec!["runaway".to_string()]);
    Ok(())
}

#[tokio::test]
async fn abort_after_evaluation_commits_nothing() -> TestResult {
    init_tracing();
    let project = TestProject::with_plan(
        r#"
[[target]]
name = "quick"
command = "finish_after_abort()"
"#,
    );
    let abort = AbortHandle::new();
    let trigger = abort.clone();
    let mut builtins = Builtins::standard();
    builtins.register("finish_after_abort", move |_, _| {
        trigger.abort();
        // Return only after the coordinator has seen the abort.
        std::thread::sleep(Duration::from_millis(300));
        Ok(Value::Num(1.0))
    });
    let (opened, store) = project.open_in_memory(builtins);
    assert!(store.concurrent_writes());

    let report = with_timeout(opened.make_with_abort(opened.run_options(), abort)).await?;
    assert!(report.aborted);
    assert_eq!(report.cancelled(), vec!["quick"]);
    assert!(store.get_entry("quick")?.is_none());
    assert_eq!(store.object_count(), 0);
    Ok(())
}
