//! Execution reports produced by a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{InstancePath, ProtocolViolation, TaskKind, TaskStatus};
use crate::error::TaskError;

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a task instance failed.
///
/// Composite failures wrap the failure of the child that caused them, so the
/// chain always ends at the atomic task that signaled the error (or at the
/// point a fail-fast run was cancelled).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Failure {
    #[error("`{task}` failed: {error}")]
    Atomic {
        task: String,
        path: InstancePath,
        error: TaskError,
    },
    #[error("`{task}` failed in child {child}: {source}")]
    Composite {
        task: String,
        path: InstancePath,
        child: usize,
        source: Box<Failure>,
    },
    #[error("`{task}` was cancelled before it started")]
    Cancelled { task: String, path: InstancePath },
}

impl Failure {
    /// The innermost failure of the chain.
    pub fn root(&self) -> &Failure {
        match self {
            Failure::Composite { source, .. } => source.root(),
            other => other,
        }
    }

    /// Name of the task this failure is attached to.
    pub fn task(&self) -> &str {
        match self {
            Failure::Atomic { task, .. }
            | Failure::Composite { task, .. }
            | Failure::Cancelled { task, .. } => task,
        }
    }

    pub fn path(&self) -> &InstancePath {
        match self {
            Failure::Atomic { path, .. }
            | Failure::Composite { path, .. }
            | Failure::Cancelled { path, .. } => path,
        }
    }

    /// The error at the root of the chain.
    pub fn error(&self) -> TaskError {
        match self.root() {
            Failure::Atomic { error, .. } => error.clone(),
            _ => TaskError::Cancelled,
        }
    }

    /// True when the chain ends in a cancellation rather than a real error.
    pub fn is_cancelled(&self) -> bool {
        match self.root() {
            Failure::Atomic { error, .. } => *error == TaskError::Cancelled,
            Failure::Cancelled { .. } => true,
            Failure::Composite { .. } => false,
        }
    }

    /// Task names from this failure down to its root.
    pub fn chain(&self) -> Vec<&str> {
        let mut names = vec![self.task()];
        let mut current = self;
        while let Failure::Composite { source, .. } = current {
            names.push(source.task());
            current = source.as_ref();
        }
        names
    }
}

/// What happened to one task instance during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub path: InstancePath,
    pub task: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Position of this start among all starts and finishes of the run.
    pub started_seq: Option<u64>,
    /// Position of this finish among all starts and finishes of the run.
    pub finished_seq: Option<u64>,
}

impl TaskRecord {
    pub fn new(path: InstancePath, task: String, kind: TaskKind) -> Self {
        Self {
            path,
            task,
            kind,
            status: TaskStatus::Pending,
            started_at: None,
            finished_at: None,
            started_seq: None,
            finished_seq: None,
        }
    }

    /// Pending -> Running. Returns false for any other starting state.
    pub fn start(&mut self, seq: u64) -> bool {
        if self.status != TaskStatus::Pending {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.started_seq = Some(seq);
        true
    }

    /// Running -> Succeeded.
    pub fn succeed(&mut self, seq: u64) -> bool {
        self.finish(TaskStatus::Succeeded, seq)
    }

    /// Running -> Failed.
    pub fn fail(&mut self, error: TaskError, seq: u64) -> bool {
        self.finish(TaskStatus::Failed { error }, seq)
    }

    fn finish(&mut self, status: TaskStatus, seq: u64) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.finished_seq = Some(seq);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn was_started(&self) -> bool {
        self.status != TaskStatus::Pending
    }

    /// Wall time between start and finish.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Terminal outcome of running one task tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: Uuid,
    /// Label of the root task.
    pub task: String,
    pub status: RunStatus,
    /// Set when `status` is Failed.
    pub failure: Option<Failure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One record per task instance, in tree pre-order.
    pub records: Vec<TaskRecord>,
    pub violations: Vec<ProtocolViolation>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Name of the first atomic task that failed, if any.
    pub fn failed_task(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.root().task())
    }

    /// Error of the first failing atomic task, if any.
    pub fn error(&self) -> Option<TaskError> {
        self.failure.as_ref().map(Failure::error)
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn record(&self, path: &InstancePath) -> Option<&TaskRecord> {
        self.records.iter().find(|r| &r.path == path)
    }

    /// Records for every instance of the task named `name`.
    pub fn records_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TaskRecord> + 'a {
        self.records.iter().filter(move |r| r.task == name)
    }

    /// First record for `name` in pre-order.
    pub fn record_named(&self, name: &str) -> Option<&TaskRecord> {
        self.records.iter().find(|r| r.task == name)
    }

    /// Number of atomic instances that were started.
    pub fn atomic_started(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.kind == TaskKind::Atomic && r.was_started())
            .count()
    }

    pub fn count(&self, status: &TaskStatus) -> usize {
        self.records.iter().filter(|r| &r.status == status).count()
    }
}
