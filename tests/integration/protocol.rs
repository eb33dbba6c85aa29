//! Completion signals, timeouts, concurrency limits and fail-fast runs.

use std::time::{Duration, Instant};

use gantry::core::{parallel, series, Task, TaskStatus, ViolationKind};
use gantry::orchestration::{run, RunOptions};
use gantry::{Orchestrator, TaskError};

use crate::fixtures::{delayed, failing, Gauge, Journal};

/// Test: Only the first signal counts
/// Given a callback task that signals success and then an error
/// When it is run
/// Then the task succeeds and the second signal is recorded as a violation
#[tokio::test]
async fn test_duplicate_signal_ignored() {
    let task = Task::callback("page", |_, done| {
        assert!(done.done());
        assert!(!done.fail("too late"));
    });

    let report = run(&task).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].task, "page");
    assert_eq!(
        report.violations[0].kind,
        ViolationKind::DuplicateSignal {
            ignored: Some(TaskError::msg("too late"))
        }
    );
}

/// Test: A duplicate signal from another thread does not restart anything
/// Given a callback task whose clones race to signal from threads
/// When it is run inside a series
/// Then the next task runs once and the task has a single terminal record
#[tokio::test]
async fn test_racing_signals_settle_once() {
    let journal = Journal::new();
    let racer = Task::callback("racer", |_, done| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let done = done.clone();
                std::thread::spawn(move || done.done())
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    });
    let task = series([racer, delayed("next", 20, &journal)]);

    let report = run(&task).await.unwrap();

    assert!(report.is_success());
    assert_eq!(journal.entries(), vec!["next:start", "next:end"]);
    assert_eq!(report.records_named("racer").count(), 1);
    assert_eq!(
        report.violations.len(),
        3,
        "three of four signals should be rejected"
    );
}

/// Test: A duplicate signal inside a parallel group counts once
/// Given parallel(callback that signals success then an error, slow sibling)
/// When the group is run
/// Then the group waits for the sibling, succeeds, and records one violation
#[tokio::test]
async fn test_duplicate_signal_in_parallel_group() {
    let journal = Journal::new();
    let chatty = Task::callback("chatty", |_, done| {
        done.done();
        done.fail("late");
    });
    let task = parallel([chatty, delayed("slow", 30, &journal)]).named("assets");

    let report = run(&task).await.unwrap();

    assert!(report.is_success());
    assert_eq!(journal.entries(), vec!["slow:start", "slow:end"]);
    assert_eq!(report.record_named("slow").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(report.record_named("chatty").unwrap().status, TaskStatus::Succeeded);

    // The group finishes only after the sibling it was still waiting on.
    let group = report.record_named("assets").unwrap();
    assert!(group.finished_seq > report.record_named("slow").unwrap().finished_seq);

    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].task, "chatty");
    assert!(matches!(
        report.violations[0].kind,
        ViolationKind::DuplicateSignal { .. }
    ));
}

/// Test: Dropping the completion handle fails the task
/// Given a callback task that returns without signaling
/// When it is run
/// Then the task fails with NeverSignaled and a violation is recorded
#[tokio::test]
async fn test_never_signaled() {
    let task = series([Task::callback("forgetful", |_, _done| {}), Task::noop("after")]);

    let report = run(&task).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.error(), Some(TaskError::NeverSignaled));
    assert_eq!(report.record_named("after").unwrap().status, TaskStatus::Pending);
    assert_eq!(report.violations.len(), 1);
    assert_eq!(report.violations[0].kind, ViolationKind::NeverSignaled);
}

/// Test: Per-task timeout
/// Given a callback task that holds its handle but never signals
/// When it is run with a 50ms timeout
/// Then it fails with a timeout instead of hanging
#[tokio::test]
async fn test_task_timeout() {
    let task = Task::callback("stuck", |_, done| {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            done.done();
        });
    })
    .with_timeout(Duration::from_millis(50));

    let started = Instant::now();
    let report = run(&task).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        report.error(),
        Some(TaskError::Timeout {
            after: Duration::from_millis(50)
        })
    );
}

/// Test: Default timeout from run options
/// Given a slow future task without its own timeout
/// When it is run with task_timeout = 30ms
/// Then it fails with a timeout
#[tokio::test]
async fn test_default_timeout() {
    let journal = Journal::new();
    let options = RunOptions {
        task_timeout: Some(Duration::from_millis(30)),
        ..RunOptions::default()
    };

    let report = Orchestrator::new(options)
        .run(&delayed("slow", 2_000, &journal))
        .await
        .unwrap();

    assert_eq!(
        report.error(),
        Some(TaskError::Timeout {
            after: Duration::from_millis(30)
        })
    );
    assert!(!journal.entries().contains(&"slow:end".to_string()));
}

/// Test: Unbounded parallelism by default
/// Given six tasks in parallel
/// When they are run without a limit
/// Then all six are running at once
#[tokio::test]
async fn test_parallel_unbounded_by_default() {
    let gauge = Gauge::default();
    let task = parallel((0..6).map(|i| gauge.task(&format!("t{}", i), 60)));

    assert!(run(&task).await.unwrap().is_success());
    assert_eq!(gauge.peak(), 6);
}

/// Test: max_parallel bounds running atomics
/// Given six tasks in parallel and max_parallel = 2
/// When they are run
/// Then no more than two run at once, and all six finish
#[tokio::test]
async fn test_max_parallel_bound() {
    let gauge = Gauge::default();
    let task = parallel((0..6).map(|i| gauge.task(&format!("t{}", i), 30)));
    let options = RunOptions {
        max_parallel: Some(2),
        ..RunOptions::default()
    };

    let report = Orchestrator::new(options).run(&task).await.unwrap();

    assert!(report.is_success());
    assert_eq!(gauge.peak(), 2);
    assert_eq!(report.count(&TaskStatus::Succeeded), 7);
}

/// Test: Nested composites do not hold slots
/// Given parallel(series(A, B), C) and max_parallel = 1
/// When it is run
/// Then it completes instead of deadlocking
#[tokio::test]
async fn test_max_parallel_one_with_nesting() {
    let journal = Journal::new();
    let task = parallel([
        series([delayed("a", 10, &journal), delayed("b", 10, &journal)]),
        delayed("c", 10, &journal),
    ]);
    let options = RunOptions {
        max_parallel: Some(1),
        ..RunOptions::default()
    };

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        Orchestrator::new(options).run(&task),
    )
    .await
    .expect("run should not deadlock")
    .unwrap();

    assert!(report.is_success());
    assert_eq!(journal.entries().len(), 6);
}

/// Test: Without fail_fast a failure cancels nothing
/// Given parallel(fail, slow) and default options
/// When it is run
/// Then the slow sibling still runs to completion
#[tokio::test]
async fn test_no_cancellation_by_default() {
    let journal = Journal::new();
    let task = parallel([failing("fail", 0, "boom"), delayed("slow", 100, &journal)]);

    let report = run(&task).await.unwrap();

    assert!(!report.is_success());
    assert!(journal.entries().contains(&"slow:end".to_string()));
    assert_eq!(report.record_named("slow").unwrap().status, TaskStatus::Succeeded);
}

/// Test: fail_fast cancels running and pending work
/// Given series(parallel(fail, slow), after) and fail_fast
/// When it is run
/// Then slow is cancelled, after never starts, and the real error is reported
#[tokio::test]
async fn test_fail_fast_cancels() {
    let journal = Journal::new();
    let task = series([
        parallel([failing("fail", 10, "boom"), delayed("slow", 5_000, &journal)]),
        delayed("after", 10, &journal),
    ]);
    let options = RunOptions {
        fail_fast: true,
        ..RunOptions::default()
    };

    let started = Instant::now();
    let report = Orchestrator::new(options).run(&task).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.error(), Some(TaskError::msg("boom")));
    assert_eq!(
        report.record_named("slow").unwrap().status,
        TaskStatus::Failed {
            error: TaskError::Cancelled
        }
    );
    assert_eq!(report.record_named("after").unwrap().status, TaskStatus::Pending);
    assert!(!journal.entries().contains(&"slow:end".to_string()));
}
