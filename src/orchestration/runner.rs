//! Task tree executor.
//!
//! The Orchestrator walks a task tree: atomic tasks are dispatched to the
//! runtime (blocking pool, spawned futures, or the task's own callback) and
//! awaited through a single-resolution channel; `series` advances child by
//! child and stops at the first failure; `parallel` starts every child, waits
//! for all of them and keeps the first failure as its representative.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::config::OrchestratorConfig;
use crate::core::completion::{Completion, ProtocolViolation, ViolationKind};
use crate::core::task::{Action, Body};
use crate::core::{InstancePath, Task, TaskResult};
use crate::error::{Error, Result, TaskError};
use crate::orchestration::context::{RunContext, RunEvent};
use crate::orchestration::report::{ExecutionReport, Failure};
use crate::util::{maybe_timeout, AbortOnDrop};
use crate::{glog, glog_debug};

type Outcome = std::result::Result<(), Failure>;

/// Knobs for one run. All off by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Default bound on each atomic task's running time.
    pub task_timeout: Option<Duration>,
    /// Maximum number of atomic tasks running at once.
    pub max_parallel: Option<usize>,
    /// Cancel the run on the first failure inside a `parallel` group.
    pub fail_fast: bool,
}

impl From<&OrchestratorConfig> for RunOptions {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            task_timeout: config.task_timeout_secs.map(Duration::from_secs),
            max_parallel: config.max_parallel,
            fail_fast: config.fail_fast,
        }
    }
}

/// Runs task trees and produces execution reports.
///
/// # Example
///
/// ```ignore
/// use gantry::core::{parallel, series, Task};
/// use gantry::orchestration::Orchestrator;
///
/// let build = series([
///     Task::noop("clean"),
///     parallel([Task::noop("style"), Task::noop("script")]),
/// ])
/// .named("build");
///
/// let report = Orchestrator::default().run(&build).await?;
/// assert!(report.is_success());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    options: RunOptions,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl Orchestrator {
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            events: None,
        }
    }

    /// Send run events to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run `task` to completion.
    ///
    /// # Errors
    /// Only for trees or options rejected before anything runs
    /// (`EmptyComposite`, a zero `max_parallel`). Task failures are reported
    /// in the returned [`ExecutionReport`].
    pub async fn run(&self, task: &Task) -> Result<ExecutionReport> {
        task.validate()?;
        if self.options.max_parallel == Some(0) {
            return Err(Error::Validation(
                "max_parallel must be at least 1".to_string(),
            ));
        }

        let ctx = Arc::new(RunContext::new(task, &self.options, self.events.clone()));
        glog!(
            "Run {} started: {} ({} atomic tasks)",
            &ctx.run_id.to_string()[..8],
            task.label(),
            task.atomic_count()
        );

        let outcome = execute(Arc::clone(&ctx), task.clone(), InstancePath::root()).await;
        let report = ctx.to_report(task, outcome);

        match &report.failure {
            None => glog!("Run {} succeeded: {}", &report.run_id.to_string()[..8], report.task),
            Some(failure) => glog!("Run {} failed: {}", &report.run_id.to_string()[..8], failure),
        }
        Ok(report)
    }
}

/// Run `task` with default options.
pub async fn run(task: &Task) -> Result<ExecutionReport> {
    Orchestrator::default().run(task).await
}

fn execute(ctx: Arc<RunContext>, task: Task, path: InstancePath) -> BoxFuture<'static, Outcome> {
    async move {
        let outcome = match task.body() {
            Body::Atomic { action, timeout } => {
                let _slot = ctx.acquire_slot().await;
                if ctx.is_cancelled() {
                    return Err(cancelled(&task, &path));
                }
                ctx.mark_started(&task, &path);
                run_atomic(&ctx, &task, &path, action, *timeout)
                    .await
                    .map_err(|error| Failure::Atomic {
                        task: task.label(),
                        path: path.clone(),
                        error,
                    })
            }
            Body::Series(children) => {
                if ctx.is_cancelled() {
                    return Err(cancelled(&task, &path));
                }
                ctx.mark_started(&task, &path);
                run_series(&ctx, &task, &path, children).await
            }
            Body::Parallel(children) => {
                if ctx.is_cancelled() {
                    return Err(cancelled(&task, &path));
                }
                ctx.mark_started(&task, &path);
                run_parallel(&ctx, &task, &path, children).await
            }
        };

        ctx.mark_finished(&task, &path, &outcome);
        outcome
    }
    .boxed()
}

fn cancelled(task: &Task, path: &InstancePath) -> Failure {
    Failure::Cancelled {
        task: task.label(),
        path: path.clone(),
    }
}

async fn run_series(
    ctx: &Arc<RunContext>,
    task: &Task,
    path: &InstancePath,
    children: &[Task],
) -> Outcome {
    for (i, child) in children.iter().enumerate() {
        glog_debug!(
            "{} {}: child {}/{} ({})",
            task.label(),
            path,
            i + 1,
            children.len(),
            child.label()
        );
        if let Err(failure) = execute(Arc::clone(ctx), child.clone(), path.child(i)).await {
            return Err(Failure::Composite {
                task: task.label(),
                path: path.clone(),
                child: i,
                source: Box::new(failure),
            });
        }
    }
    Ok(())
}

async fn run_parallel(
    ctx: &Arc<RunContext>,
    task: &Task,
    path: &InstancePath,
    children: &[Task],
) -> Outcome {
    let mut running: FuturesUnordered<_> = children
        .iter()
        .enumerate()
        .map(|(i, child)| {
            let fut = execute(Arc::clone(ctx), child.clone(), path.child(i));
            async move { (i, fut.await) }
        })
        .collect();

    // Counter and error slot are only touched by this future.
    let mut outstanding = children.len();
    let mut first: Option<Failure> = None;

    while let Some((i, outcome)) = running.next().await {
        outstanding -= 1;
        glog_debug!(
            "{} {}: child {} finished, {} outstanding",
            task.label(),
            path,
            i,
            outstanding
        );

        if let Err(failure) = outcome {
            let failure = Failure::Composite {
                task: task.label(),
                path: path.clone(),
                child: i,
                source: Box::new(failure),
            };
            let replace = match &first {
                None => true,
                Some(current) => current.is_cancelled() && !failure.is_cancelled(),
            };
            if replace {
                first = Some(failure);
            }
            if ctx.fail_fast() && !ctx.is_cancelled() {
                glog!("Cancelling run after failure in {} {}", task.label(), path);
                ctx.cancel_run();
            }
        }
    }

    match first {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

async fn run_atomic(
    ctx: &Arc<RunContext>,
    task: &Task,
    path: &InstancePath,
    action: &Action,
    timeout: Option<Duration>,
) -> TaskResult {
    let (tx, rx) = oneshot::channel();
    let completion = Completion::new(tx, task.label(), path.clone(), ctx.violations());
    let task_ctx = ctx.task_context(task, path);

    let _spawned = match action {
        Action::Sync(f) => {
            let f = Arc::clone(f);
            let completion = completion.clone();
            tokio::task::spawn_blocking(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| f(&task_ctx)))
                    .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));
                completion.signal(result);
            });
            None
        }
        Action::Future(f) => match panic::catch_unwind(AssertUnwindSafe(|| f(task_ctx))) {
            Ok(fut) => {
                let completion = completion.clone();
                let handle = tokio::spawn(async move {
                    let result = AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)));
                    completion.signal(result);
                });
                Some(AbortOnDrop(handle))
            }
            Err(payload) => {
                completion.signal(Err(TaskError::from_panic(payload)));
                None
            }
        },
        Action::Callback(f) => {
            let handle = completion.clone();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(task_ctx, handle))) {
                completion.signal(Err(TaskError::from_panic(payload)));
            }
            None
        }
    };
    // Only the task's own handles may keep the channel open now.
    drop(completion);

    let violations = ctx.violations();
    let label = task.label();
    let signaled = async move {
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                violations.record(ProtocolViolation {
                    task: label,
                    path: path.clone(),
                    kind: ViolationKind::NeverSignaled,
                });
                Err(TaskError::NeverSignaled)
            }
        }
    };

    let limit = timeout.or(ctx.default_timeout());
    let bounded = async move {
        match maybe_timeout(limit, signaled).await {
            Ok(result) => result,
            Err(Error::Timeout(after)) => Err(TaskError::Timeout { after }),
            Err(other) => Err(other.into()),
        }
    };

    if ctx.fail_fast() {
        tokio::select! {
            result = bounded => result,
            _ = ctx.cancelled() => Err(TaskError::Cancelled),
        }
    } else {
        bounded.await
    }
}
