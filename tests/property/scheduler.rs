use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use pipewright::engine::{RunState, Scheduler, TaskOutcome, TaskSpec};

/// A random DAG: task N may only depend on tasks 0..N-1.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<TaskSpec>> {
    (1..=max_tasks).prop_flat_map(|num_tasks| {
        (
            proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), num_tasks),
            proptest::collection::vec(-2i32..3, num_tasks),
        )
            .prop_map(move |(raw_deps, priorities)| {
                raw_deps
                    .into_iter()
                    .zip(priorities)
                    .enumerate()
                    .map(|(i, (potential, priority))| {
                        let mut spec = TaskSpec::new(format!("t{i:02}"));
                        spec.priority = priority as f64;
                        if i > 0 {
                            let deps: BTreeSet<usize> = potential.into_iter().map(|d| d % i).collect();
                            spec.deps = deps.into_iter().map(|d| format!("t{d:02}")).collect();
                        }
                        spec
                    })
                    .collect()
            })
    })
}

struct Simulation {
    final_states: BTreeMap<String, RunState>,
    dispatched: Vec<String>,
    /// Dispatches made after the first terminal failure.
    dispatched_after_failure: usize,
    max_running: usize,
}

/// Drive the scheduler to completion, completing the oldest running build
/// first. Targets in `failing` always fail; everything else succeeds.
fn simulate(specs: &[TaskSpec], jobs: usize, keep_going: bool, failing: &BTreeSet<String>) -> Simulation {
    let deps: BTreeMap<String, Vec<String>> =
        specs.iter().map(|s| (s.name.clone(), s.deps.clone())).collect();
    let mut scheduler = Scheduler::new(specs.to_vec(), jobs, keep_going);
    let mut dispatched = Vec::new();
    let mut running: Vec<String> = Vec::new();
    let mut max_running = 0;
    let mut failed_once = false;
    let mut dispatched_after_failure = 0;

    for name in scheduler.start() {
        scheduler.queue_for_build(&name);
    }

    for _ in 0..10_000 {
        while let Some(dispatch) = scheduler.next_dispatch() {
            for dep in &deps[&dispatch.name] {
                assert_eq!(
                    scheduler.state_of(dep),
                    Some(RunState::Done),
                    "{} dispatched before its dependency {dep} was done",
                    dispatch.name
                );
            }
            if failed_once {
                dispatched_after_failure += 1;
            }
            dispatched.push(dispatch.name.clone());
            running.push(dispatch.name);
        }
        max_running = max_running.max(running.len());

        if running.is_empty() {
            break;
        }
        let name = running.remove(0);
        let outcome = if failing.contains(&name) {
            TaskOutcome::Failed { retryable: true }
        } else {
            TaskOutcome::Success
        };
        failed_once |= outcome != TaskOutcome::Success;
        let step = scheduler.complete(&name, outcome);
        for ready in step.newly_ready {
            scheduler.queue_for_build(&ready);
        }
    }

    assert!(scheduler.all_terminal(), "scheduler left targets unsettled");
    Simulation {
        final_states: scheduler.states().map(|(n, s)| (n.to_string(), s)).collect(),
        dispatched,
        dispatched_after_failure,
        max_running,
    }
}

/// Names with a failing target among themselves or their ancestors.
fn tainted(specs: &[TaskSpec], failing: &BTreeSet<String>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for spec in specs {
        if failing.contains(&spec.name) || spec.deps.iter().any(|d| out.contains(d)) {
            out.insert(spec.name.clone());
        }
    }
    out
}

proptest! {
    #[test]
    fn keep_going_builds_every_untainted_target(
        specs in dag_strategy(12),
        jobs in 1usize..4,
        failing_idx in proptest::collection::vec(0usize..12, 0..3),
    ) {
        let failing: BTreeSet<String> = failing_idx
            .iter()
            .filter(|&&i| i < specs.len())
            .map(|i| format!("t{i:02}"))
            .collect();
        let sim = simulate(&specs, jobs, true, &failing);
        let tainted = tainted(&specs, &failing);

        prop_assert!(sim.max_running <= jobs);
        for spec in &specs {
            let state = sim.final_states[&spec.name];
            if spec.deps.iter().any(|d| tainted.contains(d)) {
                prop_assert_eq!(state, RunState::Cancelled);
            } else if failing.contains(&spec.name) {
                prop_assert_eq!(state, RunState::Failed);
            } else {
                prop_assert_eq!(state, RunState::Done);
            }
        }
    }

    #[test]
    fn without_keep_going_nothing_starts_after_a_failure(
        specs in dag_strategy(12),
        jobs in 1usize..4,
        failing_idx in proptest::collection::vec(0usize..12, 1..3),
    ) {
        let failing: BTreeSet<String> = failing_idx
            .iter()
            .filter(|&&i| i < specs.len())
            .map(|i| format!("t{i:02}"))
            .collect();
        let sim = simulate(&specs, jobs, false, &failing);

        prop_assert_eq!(sim.dispatched_after_failure, 0);
        let failed = sim
            .final_states
            .values()
            .filter(|s| **s == RunState::Failed)
            .count();
        // Only builds already running when the first one failed can fail too.
        prop_assert!(failed <= jobs);
        for (name, state) in &sim.final_states {
            prop_assert!(state.is_terminal());
            if !sim.dispatched.contains(name) {
                prop_assert_eq!(*state, RunState::Cancelled);
            }
        }
    }

    #[test]
    fn every_target_runs_exactly_once_without_failures(
        specs in dag_strategy(15),
        jobs in 1usize..5,
    ) {
        let sim = simulate(&specs, jobs, false, &BTreeSet::new());
        prop_assert_eq!(sim.dispatched.len(), specs.len());
        let unique: BTreeSet<&String> = sim.dispatched.iter().collect();
        prop_assert_eq!(unique.len(), specs.len());
        prop_assert!(sim.final_states.values().all(|s| *s == RunState::Done));
    }
}

#[test]
fn ready_queue_orders_by_priority_then_name() {
    let mut specs = vec![TaskSpec::new("b"), TaskSpec::new("a"), TaskSpec::new("c")];
    specs[2].priority = 5.0;
    let mut scheduler = Scheduler::new(specs, 1, false);
    for name in scheduler.start() {
        scheduler.queue_for_build(&name);
    }
    assert_eq!(scheduler.queued(), vec!["c", "a", "b"]);
    assert_eq!(scheduler.next_dispatch().map(|d| d.name), Some("c".to_string()));
}

#[test]
fn preferred_worker_waits_for_its_slot() {
    let mut pinned = TaskSpec::new("pinned");
    pinned.worker = Some(1);
    pinned.priority = 10.0;
    let mut scheduler = Scheduler::new(vec![TaskSpec::new("free"), pinned], 2, false);
    for name in scheduler.start() {
        scheduler.queue_for_build(&name);
    }

    let first = scheduler.next_dispatch().expect("dispatch");
    assert_eq!((first.name.as_str(), first.worker), ("pinned", 1));
    let second = scheduler.next_dispatch().expect("dispatch");
    assert_eq!((second.name.as_str(), second.worker), ("free", 2));
    assert!(scheduler.next_dispatch().is_none());
}

#[test]
fn out_of_range_worker_is_ignored() {
    let mut spec = TaskSpec::new("a");
    spec.worker = Some(7);
    let mut scheduler = Scheduler::new(vec![spec], 2, false);
    for name in scheduler.start() {
        scheduler.queue_for_build(&name);
    }
    assert_eq!(scheduler.next_dispatch().map(|d| d.worker), Some(1));
}

#[test]
fn retries_requeue_until_exhausted() {
    let mut spec = TaskSpec::new("flaky");
    spec.retries = 2;
    let mut scheduler = Scheduler::new(vec![spec], 1, false);
    for name in scheduler.start() {
        scheduler.queue_for_build(&name);
    }

    for attempt in 1..=2 {
        let dispatch = scheduler.next_dispatch().expect("dispatch");
        assert_eq!(dispatch.attempt, attempt);
        let step = scheduler.complete("flaky", TaskOutcome::TimedOut { retryable: true });
        assert_eq!(step.retrying.as_deref(), Some("flaky"));
        assert_eq!(scheduler.state_of("flaky"), Some(RunState::Ready));
    }

    let dispatch = scheduler.next_dispatch().expect("dispatch");
    assert_eq!(dispatch.attempt, 3);
    let step = scheduler.complete("flaky", TaskOutcome::TimedOut { retryable: true });
    assert!(step.retrying.is_none());
    assert_eq!(scheduler.state_of("flaky"), Some(RunState::Failed));
    assert_eq!(scheduler.attempts_of("flaky"), 3);
}

#[test]
fn non_retryable_failure_is_final() {
    let mut spec = TaskSpec::new("locked");
    spec.retries = 3;
    let mut scheduler = Scheduler::new(vec![spec], 1, true);
    for name in scheduler.start() {
        scheduler.queue_for_build(&name);
    }
    scheduler.next_dispatch().expect("dispatch");
    let step = scheduler.complete("locked", TaskOutcome::Failed { retryable: false });
    assert!(step.retrying.is_none());
    assert_eq!(scheduler.state_of("locked"), Some(RunState::Failed));
}

#[test]
fn abort_cancels_everything_unsettled() {
    let mut downstream = TaskSpec::new("b");
    downstream.deps = vec!["a".to_string()];
    let mut scheduler = Scheduler::new(vec![TaskSpec::new("a"), downstream], 1, false);
    for name in scheduler.start() {
        scheduler.queue_for_build(&name);
    }
    scheduler.next_dispatch().expect("dispatch");

    let running = scheduler.abort();
    assert_eq!(running, vec!["a"]);
    assert_eq!(scheduler.state_of("a"), Some(RunState::Cancelled));
    assert_eq!(scheduler.state_of("b"), Some(RunState::Cancelled));
    assert!(scheduler.is_halted());
    assert!(scheduler.next_dispatch().is_none());

    // A late result for an aborted build changes nothing.
    scheduler.complete("a", TaskOutcome::Success);
    assert_eq!(scheduler.state_of("a"), Some(RunState::Cancelled));
}

#[test]
fn up_to_date_targets_release_dependents_without_a_worker() {
    let mut downstream = TaskSpec::new("b");
    downstream.deps = vec!["a".to_string()];
    let mut scheduler = Scheduler::new(vec![TaskSpec::new("a"), downstream], 1, false);
    assert_eq!(scheduler.start(), vec!["a"]);
    let step = scheduler.complete("a", TaskOutcome::UpToDate);
    assert_eq!(step.newly_ready, vec!["b"]);
    assert_eq!(scheduler.state_of("b"), Some(RunState::Ready));
}
