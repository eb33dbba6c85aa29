//! Task model for the build orchestrator.
//!
//! A [`Task`] is an immutable, cheaply cloneable value: either an atomic
//! unit of work wrapping a function, or a `series`/`parallel` composite of
//! child tasks fixed at construction. Because children are captured by value
//! when a composite is built, a task can never contain itself.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::completion::Completion;
use crate::error::{Error, Result, TaskError};

/// Outcome signaled by an atomic task.
pub type TaskResult = std::result::Result<(), TaskError>;

type SyncFn = dyn Fn(&TaskContext) -> TaskResult + Send + Sync;
type FutureFn = dyn Fn(TaskContext) -> BoxFuture<'static, TaskResult> + Send + Sync;
type CallbackFn = dyn Fn(TaskContext, Completion) + Send + Sync;

/// Unique identifier for a task value.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Atomic,
    Series,
    Parallel,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Atomic => write!(f, "atomic"),
            TaskKind::Series => write!(f, "series"),
            TaskKind::Parallel => write!(f, "parallel"),
        }
    }
}

/// Position of one task instance inside the tree being run.
///
/// The same `Task` value may appear several times in a tree (for example a
/// shared `build` under both `start` and `deploy`); each occurrence is a
/// separate instance with its own path. The root is `/`, its second child
/// `/1`, that child's first child `/1/0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstancePath(Vec<usize>);

impl InstancePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, index: usize) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_ancestor_of(&self, other: &InstancePath) -> bool {
        other.0.len() > self.0.len() && other.0.starts_with(&self.0)
    }
}

impl From<Vec<usize>> for InstancePath {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

impl fmt::Display for InstancePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for index in &self.0 {
            write!(f, "/{}", index)?;
        }
        Ok(())
    }
}

/// Status of a task instance within one run.
///
/// Instances move Pending -> Running -> {Succeeded | Failed} and never
/// re-enter Running within the same run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Not started (yet, or ever).
    #[default]
    Pending,
    /// Started and not yet terminal.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed. Composites carry the error of the atomic task that failed them.
    Failed { error: TaskError },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed { .. })
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// What an atomic task receives when invoked.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub(crate) run_id: Uuid,
    pub(crate) task_id: TaskId,
    pub(crate) label: String,
    pub(crate) path: InstancePath,
    pub(crate) cancel: CancellationToken,
}

impl TaskContext {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Task name, or its kind for anonymous tasks.
    pub fn name(&self) -> &str {
        &self.label
    }

    pub fn path(&self) -> &InstancePath {
        &self.path
    }

    /// True once a fail-fast run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[derive(Clone)]
pub(crate) enum Action {
    Sync(Arc<SyncFn>),
    Future(Arc<FutureFn>),
    Callback(Arc<CallbackFn>),
}

#[derive(Clone)]
pub(crate) enum Body {
    Atomic {
        action: Action,
        timeout: Option<Duration>,
    },
    Series(Vec<Task>),
    Parallel(Vec<Task>),
}

struct Node {
    id: TaskId,
    name: Option<String>,
    body: Body,
}

/// A named or anonymous unit of work.
#[derive(Clone)]
pub struct Task {
    node: Arc<Node>,
}

impl Task {
    fn from_body(name: Option<String>, body: Body) -> Self {
        Self {
            node: Arc::new(Node {
                id: TaskId::new(),
                name,
                body,
            }),
        }
    }

    fn atomic(name: impl Into<String>, action: Action) -> Self {
        Self::from_body(
            Some(name.into()),
            Body::Atomic {
                action,
                timeout: None,
            },
        )
    }

    /// Atomic task whose function returns when it is done.
    ///
    /// The function runs on the blocking thread pool.
    pub fn sync<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        Self::atomic(name, Action::Sync(Arc::new(f)))
    }

    /// Atomic task whose function returns an awaitable.
    pub fn future<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self::atomic(name, Action::Future(Arc::new(move |ctx| f(ctx).boxed())))
    }

    /// Atomic task that signals through a [`Completion`] handle.
    ///
    /// The function is called on the orchestrator's thread and must not
    /// block; hand long work to a thread or a spawned future and signal from
    /// there. Only the first signal counts.
    pub fn callback<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext, Completion) + Send + Sync + 'static,
    {
        Self::atomic(name, Action::Callback(Arc::new(f)))
    }

    /// Atomic task that does nothing.
    pub fn noop(name: impl Into<String>) -> Self {
        Self::sync(name, |_| Ok(()))
    }

    /// Anonymous composite running `tasks` one after another.
    pub fn series<I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = Task>,
    {
        Self::from_body(None, Body::Series(tasks.into_iter().collect()))
    }

    /// Anonymous composite running `tasks` concurrently.
    pub fn parallel<I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = Task>,
    {
        Self::from_body(None, Body::Parallel(tasks.into_iter().collect()))
    }

    /// Same work under a new name.
    pub fn named(self, name: impl Into<String>) -> Self {
        Self::from_body(Some(name.into()), self.node.body.clone())
    }

    /// Bound an atomic task's running time. Composites are returned as is.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match &self.node.body {
            Body::Atomic { action, .. } => Self::from_body(
                self.node.name.clone(),
                Body::Atomic {
                    action: action.clone(),
                    timeout: Some(timeout),
                },
            ),
            _ => self,
        }
    }

    pub fn id(&self) -> TaskId {
        self.node.id
    }

    pub fn name(&self) -> Option<&str> {
        self.node.name.as_deref()
    }

    /// Name for display: the task name, or its kind when anonymous.
    pub fn label(&self) -> String {
        match &self.node.name {
            Some(name) => name.clone(),
            None => self.kind().to_string(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match &self.node.body {
            Body::Atomic { .. } => TaskKind::Atomic,
            Body::Series(_) => TaskKind::Series,
            Body::Parallel(_) => TaskKind::Parallel,
        }
    }

    pub fn is_atomic(&self) -> bool {
        self.kind() == TaskKind::Atomic
    }

    pub fn children(&self) -> &[Task] {
        match &self.node.body {
            Body::Atomic { .. } => &[],
            Body::Series(children) | Body::Parallel(children) => children,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        match &self.node.body {
            Body::Atomic { timeout, .. } => *timeout,
            _ => None,
        }
    }

    /// True if both handles point at the same task value.
    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    pub(crate) fn body(&self) -> &Body {
        &self.node.body
    }

    /// Check the tree before running it: every composite needs children.
    pub fn validate(&self) -> Result<()> {
        if !self.is_atomic() && self.children().is_empty() {
            return Err(Error::EmptyComposite(self.label()));
        }
        self.children().iter().try_for_each(Task::validate)
    }

    /// Number of task instances in the tree, the root included.
    pub fn instance_count(&self) -> usize {
        1 + self
            .children()
            .iter()
            .map(Task::instance_count)
            .sum::<usize>()
    }

    /// Number of atomic task instances in the tree.
    pub fn atomic_count(&self) -> usize {
        if self.is_atomic() {
            return 1;
        }
        self.children().iter().map(Task::atomic_count).sum()
    }

    /// Render the tree, one instance per line.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out, 0);
        out
    }

    fn describe_into(&self, out: &mut String, depth: usize) {
        out.push_str(&"  ".repeat(depth));
        match self.name() {
            Some(name) => out.push_str(&format!("{} [{}]\n", name, self.kind())),
            None => out.push_str(&format!("[{}]\n", self.kind())),
        }
        for child in self.children() {
            child.describe_into(out, depth + 1);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.node.id)
            .field("name", &self.node.name)
            .field("kind", &self.kind())
            .field("children", &self.children().len())
            .finish()
    }
}

/// Composite running `tasks` strictly one after another.
pub fn series<I>(tasks: I) -> Task
where
    I: IntoIterator<Item = Task>,
{
    Task::series(tasks)
}

/// Composite running `tasks` concurrently.
pub fn parallel<I>(tasks: I) -> Task
where
    I: IntoIterator<Item = Task>,
{
    Task::parallel(tasks)
}
