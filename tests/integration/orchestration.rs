//! Ordering, failure propagation and run independence.

use gantry::core::{parallel, series, InstancePath, Task, TaskStatus};
use gantry::orchestration::{run, Failure, RunEvent, RunStatus};
use gantry::{Orchestrator, TaskError};
use tokio::sync::mpsc;

use crate::fixtures::{delayed, failing, recording, Journal};

/// Test: Every atomic instance runs exactly once
/// Given a tree where one task value appears twice
/// When the tree is run
/// Then each occurrence runs once and has its own record
#[tokio::test]
async fn test_each_instance_runs_once() {
    let journal = Journal::new();
    let shared = recording("shared", &journal);
    let task = series([
        shared.clone(),
        parallel([recording("a", &journal), shared.clone()]),
        recording("b", &journal),
    ]);

    let report = run(&task).await.unwrap();

    assert!(report.is_success());
    assert_eq!(journal.count("shared"), 2);
    assert_eq!(journal.count("a"), 1);
    assert_eq!(journal.count("b"), 1);
    assert_eq!(report.records_named("shared").count(), 2);
    assert_eq!(report.atomic_started(), 4);
    assert_eq!(report.count(&TaskStatus::Succeeded), report.records.len());
}

/// Test: Series stops at the first failure
/// Given series(A, B, C) where B fails
/// When the series is run
/// Then A succeeds, C is never started, and the series fails with B's error
#[tokio::test]
async fn test_series_stops_at_failure() {
    let journal = Journal::new();
    let task = series([
        recording("a", &journal),
        failing("b", 0, "lint errors"),
        recording("c", &journal),
    ])
    .named("lint");

    let report = run(&task).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(journal.entries(), vec!["a"]);
    assert_eq!(report.record_named("a").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(report.record_named("c").unwrap().status, TaskStatus::Pending);
    assert!(!report.record_named("c").unwrap().was_started());
    assert_eq!(
        report.record_named("lint").unwrap().status,
        TaskStatus::Failed {
            error: TaskError::msg("lint errors")
        }
    );
    assert_eq!(report.failed_task(), Some("b"));

    match report.failure.as_ref().unwrap() {
        Failure::Composite { task, child, .. } => {
            assert_eq!(task, "lint");
            assert_eq!(*child, 1);
        }
        other => panic!("Expected composite failure, got {:?}", other),
    }
}

/// Test: Parallel waits for every child even when one fails
/// Given parallel(A, B, C) where B fails quickly
/// When the group is run
/// Then A and C still finish, and the group fails with B's error
#[tokio::test]
async fn test_parallel_failure_lets_siblings_finish() {
    let journal = Journal::new();
    let task = parallel([
        delayed("a", 50, &journal),
        failing("b", 5, "bad pixels"),
        delayed("c", 80, &journal),
    ])
    .named("assets");

    let report = run(&task).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(journal.entries().contains(&"a:end".to_string()));
    assert!(journal.entries().contains(&"c:end".to_string()));
    assert_eq!(report.record_named("a").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(report.record_named("c").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(report.error(), Some(TaskError::msg("bad pixels")));

    // The group finishes only after its slowest child.
    let group = report.record_named("assets").unwrap();
    let c = report.record_named("c").unwrap();
    assert!(group.finished_seq > c.finished_seq);
}

/// Test: The first failure to arrive represents the group
/// Given parallel(A, B) where both fail, B sooner than A
/// When the group is run
/// Then the group reports B's error
#[tokio::test]
async fn test_parallel_keeps_first_failure() {
    let task = parallel([failing("a", 80, "late"), failing("b", 5, "early")]);

    let report = run(&task).await.unwrap();

    assert_eq!(report.failed_task(), Some("b"));
    assert_eq!(report.error(), Some(TaskError::msg("early")));
    assert_eq!(
        report.record_named("a").unwrap().status,
        TaskStatus::Failed {
            error: TaskError::msg("late")
        }
    );
}

/// Test: Nested ordering
/// Given series(A, parallel(B, C), D)
/// When the tree is run
/// Then A finishes before B and C start, B and C overlap, and D starts after both
#[tokio::test]
async fn test_nested_ordering() {
    let journal = Journal::new();
    let task = series([
        delayed("a", 10, &journal),
        parallel([delayed("b", 60, &journal), delayed("c", 60, &journal)]),
        delayed("d", 10, &journal),
    ]);

    let report = run(&task).await.unwrap();
    assert!(report.is_success());

    let seq = |name: &str| {
        let record = report.record_named(name).unwrap();
        (record.started_seq.unwrap(), record.finished_seq.unwrap())
    };
    let (_, a_end) = seq("a");
    let (b_start, b_end) = seq("b");
    let (c_start, c_end) = seq("c");
    let (d_start, _) = seq("d");

    assert!(a_end < b_start && a_end < c_start);
    assert!(b_start < c_end && c_start < b_end, "b and c should overlap");
    assert!(d_start > b_end && d_start > c_end);

    let pos = |entry: &str| journal.position(entry).unwrap();
    assert!(pos("a:end") < pos("b:start"));
    assert!(pos("b:start") < pos("c:end"));
    assert!(pos("c:start") < pos("b:end"));
    assert!(pos("d:start") > pos("b:end").max(pos("c:end")));
}

/// Test: Failure chain names every level
/// Given build = series(clean, parallel(style, script)) where script fails
/// When build is run
/// Then the failure chain leads from build down to script
#[tokio::test]
async fn test_failure_chain() {
    let journal = Journal::new();
    let build = series([
        recording("clean", &journal),
        parallel([recording("style", &journal), failing("script", 0, "syntax")]),
    ])
    .named("build");

    let report = run(&build).await.unwrap();
    let failure = report.failure.as_ref().unwrap();

    assert_eq!(failure.chain(), vec!["build", "parallel", "script"]);
    assert_eq!(failure.root().path(), &InstancePath::from(vec![1, 1]));
}

/// Test: Runs are independent
/// Given a task that has already been run
/// When it is run again
/// Then the second run starts from scratch with its own records
#[tokio::test]
async fn test_runs_are_independent() {
    let journal = Journal::new();
    let task = series([recording("a", &journal), recording("b", &journal)]);

    let first = run(&task).await.unwrap();
    let second = run(&task).await.unwrap();

    assert!(first.is_success() && second.is_success());
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(journal.entries(), vec!["a", "b", "a", "b"]);
    assert_eq!(second.records.len(), 3);
    assert_eq!(second.record_named("a").unwrap().started_seq, Some(1));
}

/// Test: A failed run does not poison the next
/// Given a task whose first run fails
/// When it is run again with a working child
/// Then the second run is unaffected
#[tokio::test]
async fn test_failure_does_not_leak_between_runs() {
    let attempts = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = attempts.clone();
    let flaky = Task::sync("flaky", move |_| {
        if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
            Err(TaskError::msg("first time"))
        } else {
            Ok(())
        }
    });
    let task = series([flaky, Task::noop("after")]);

    assert!(!run(&task).await.unwrap().is_success());
    let report = run(&task).await.unwrap();
    assert!(report.is_success());
    assert!(report.violations.is_empty());
}

/// Test: Events follow the run
/// Given a series of two tasks and an event channel
/// When the series is run
/// Then starts and finishes arrive in order and the run announces its end
#[tokio::test]
async fn test_events_follow_run() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = series([Task::noop("a"), Task::noop("b")]).named("both");

    let report = Orchestrator::default()
        .with_events(tx)
        .run(&task)
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(match event {
            RunEvent::TaskStarted { task, .. } => format!("start {}", task),
            RunEvent::TaskSucceeded { task, .. } => format!("ok {}", task),
            RunEvent::TaskFailed { task, .. } => format!("fail {}", task),
            RunEvent::RunFinished { run_id, status } => {
                assert_eq!(run_id, report.run_id);
                format!("finished {}", status)
            }
        });
    }

    assert_eq!(
        seen,
        vec![
            "start both",
            "start a",
            "ok a",
            "start b",
            "ok b",
            "ok both",
            "finished succeeded"
        ]
    );
}

/// Test: Report serializes
/// Given a failed run
/// When the report is serialized
/// Then the JSON carries the status and the failing task
#[tokio::test]
async fn test_report_serializes() {
    let task = series([failing("style", 0, "missing semicolon")]).named("compile");
    let report = run(&task).await.unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "failed");
    assert_eq!(json["task"], "compile");
    assert_eq!(json["records"][1]["task"], "style");
    assert_eq!(json["records"][1]["status"]["state"], "failed");
    assert_eq!(
        json["records"][1]["status"]["error"]["message"],
        "missing semicolon"
    );
}
