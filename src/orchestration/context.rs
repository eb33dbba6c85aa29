//! Per-run state: instance records, violation log, limits and events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::completion::ViolationLog;
use crate::core::{InstancePath, Task, TaskContext, TaskKind};
use crate::error::TaskError;
use crate::orchestration::report::{ExecutionReport, Failure, RunStatus, TaskRecord};
use crate::orchestration::runner::RunOptions;

/// Events emitted while a run progresses.
///
/// These let a caller (the CLI) render progress without polling the run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// A task instance moved to Running.
    TaskStarted {
        path: InstancePath,
        task: String,
        kind: TaskKind,
    },
    /// A task instance succeeded.
    TaskSucceeded {
        path: InstancePath,
        task: String,
        kind: TaskKind,
        elapsed: Duration,
    },
    /// A task instance failed.
    TaskFailed {
        path: InstancePath,
        task: String,
        kind: TaskKind,
        error: TaskError,
        elapsed: Duration,
    },
    /// The run produced its report.
    RunFinished { run_id: Uuid, status: RunStatus },
}

/// Ephemeral state for one invocation of `run`.
///
/// Records are created Pending for every instance up front and mutated under
/// a single lock; nothing here outlives the report.
pub(crate) struct RunContext {
    pub(crate) run_id: Uuid,
    started_at: DateTime<Utc>,
    records: Mutex<Vec<TaskRecord>>,
    index: HashMap<InstancePath, usize>,
    violations: ViolationLog,
    seq: AtomicU64,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    fail_fast: bool,
    default_timeout: Option<Duration>,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl RunContext {
    pub(crate) fn new(
        root: &Task,
        options: &RunOptions,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> Self {
        let mut records = Vec::with_capacity(root.instance_count());
        collect_records(root, InstancePath::root(), &mut records);
        let index = records
            .iter()
            .enumerate()
            .map(|(i, record)| (record.path.clone(), i))
            .collect();

        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            records: Mutex::new(records),
            index,
            violations: ViolationLog::default(),
            seq: AtomicU64::new(0),
            limit: options.max_parallel.map(|n| Arc::new(Semaphore::new(n))),
            cancel: CancellationToken::new(),
            fail_fast: options.fail_fast,
            default_timeout: options.task_timeout,
            events,
        }
    }

    pub(crate) fn violations(&self) -> ViolationLog {
        self.violations.clone()
    }

    pub(crate) fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_run(&self) {
        self.cancel.cancel();
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Wait for a slot when `max_parallel` is set.
    pub(crate) async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        let limit = self.limit.as_ref()?;
        // The semaphore is never closed, so acquiring only fails on a bug.
        Arc::clone(limit).acquire_owned().await.ok()
    }

    pub(crate) fn task_context(&self, task: &Task, path: &InstancePath) -> TaskContext {
        TaskContext {
            run_id: self.run_id,
            task_id: task.id(),
            label: task.label(),
            path: path.clone(),
            cancel: self.cancel.clone(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            // Receiver may have gone away; progress is best effort.
            let _ = tx.send(event);
        }
    }

    fn with_record<T>(&self, path: &InstancePath, f: impl FnOnce(&mut TaskRecord) -> T) -> Option<T> {
        let index = *self.index.get(path)?;
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.get_mut(index).map(f)
    }

    pub(crate) fn mark_started(&self, task: &Task, path: &InstancePath) {
        let seq = self.next_seq();
        let started = self.with_record(path, |r| r.start(seq)).unwrap_or(false);
        if !started {
            crate::glog_warn!("Ignoring restart of {} at {}", task.label(), path);
            return;
        }
        self.emit(RunEvent::TaskStarted {
            path: path.clone(),
            task: task.label(),
            kind: task.kind(),
        });
    }

    pub(crate) fn mark_finished(
        &self,
        task: &Task,
        path: &InstancePath,
        outcome: &std::result::Result<(), Failure>,
    ) {
        let seq = self.next_seq();
        let elapsed = |r: &TaskRecord| {
            r.elapsed()
                .and_then(|d| d.to_std().ok())
                .unwrap_or_default()
        };

        match outcome {
            Ok(()) => {
                let finished = self.with_record(path, |r| r.succeed(seq).then(|| elapsed(r)));
                if let Some(Some(elapsed)) = finished {
                    self.emit(RunEvent::TaskSucceeded {
                        path: path.clone(),
                        task: task.label(),
                        kind: task.kind(),
                        elapsed,
                    });
                }
            }
            Err(failure) => {
                let error = failure.error();
                let finished =
                    self.with_record(path, |r| r.fail(error.clone(), seq).then(|| elapsed(r)));
                if let Some(Some(elapsed)) = finished {
                    self.emit(RunEvent::TaskFailed {
                        path: path.clone(),
                        task: task.label(),
                        kind: task.kind(),
                        error,
                        elapsed,
                    });
                }
            }
        }
    }

    /// Produce the report and announce the end of the run.
    pub(crate) fn to_report(
        &self,
        root: &Task,
        outcome: std::result::Result<(), Failure>,
    ) -> ExecutionReport {
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let (status, failure) = match outcome {
            Ok(()) => (RunStatus::Succeeded, None),
            Err(failure) => (RunStatus::Failed, Some(failure)),
        };

        self.emit(RunEvent::RunFinished {
            run_id: self.run_id,
            status,
        });

        ExecutionReport {
            run_id: self.run_id,
            task: root.label(),
            status,
            failure,
            started_at: self.started_at,
            finished_at: Utc::now(),
            records,
            violations: self.violations.snapshot(),
        }
    }
}

fn collect_records(task: &Task, path: InstancePath, out: &mut Vec<TaskRecord>) {
    out.push(TaskRecord::new(path.clone(), task.label(), task.kind()));
    for (i, child) in task.children().iter().enumerate() {
        collect_records(child, path.child(i), out);
    }
}
