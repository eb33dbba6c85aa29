//! Single-resolution completion signal for callback-style atomic tasks.
//!
//! A [`Completion`] wraps the sending half of a oneshot channel. The first
//! `done`/`fail`/`signal` call resolves it; every later call is a no-op that
//! gets logged and recorded as a [`ProtocolViolation`]. Dropping every clone
//! without signaling closes the channel, which the orchestrator reports as
//! [`TaskError::NeverSignaled`].

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::core::task::{InstancePath, TaskResult};
use crate::error::TaskError;
use crate::glog_warn;

/// How an atomic task broke the single-signal contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ViolationKind {
    /// A signal arrived after the first one and was ignored.
    DuplicateSignal {
        /// The error carried by the ignored signal, if it was an error.
        ignored: Option<TaskError>,
    },
    /// Every completion handle was dropped without a signal.
    NeverSignaled,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::DuplicateSignal { ignored: None } => {
                write!(f, "ignored duplicate success signal")
            }
            ViolationKind::DuplicateSignal {
                ignored: Some(error),
            } => write!(f, "ignored duplicate error signal ({})", error),
            ViolationKind::NeverSignaled => write!(f, "completion was never signaled"),
        }
    }
}

/// A recorded breach of the completion contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("task `{task}` at {path}: {kind}")]
pub struct ProtocolViolation {
    pub task: String,
    pub path: InstancePath,
    pub kind: ViolationKind,
}

/// Shared, append-only log of violations for one run.
#[derive(Debug, Clone, Default)]
pub(crate) struct ViolationLog(Arc<Mutex<Vec<ProtocolViolation>>>);

impl ViolationLog {
    pub(crate) fn record(&self, violation: ProtocolViolation) {
        glog_warn!("Protocol violation: {}", violation);
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(violation);
    }

    pub(crate) fn snapshot(&self) -> Vec<ProtocolViolation> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

struct Inner {
    sender: Mutex<Option<oneshot::Sender<TaskResult>>>,
    task: String,
    path: InstancePath,
    violations: ViolationLog,
}

/// Handle through which a callback-style task reports completion.
///
/// Cloneable and `Send`, so it can be moved into threads or callbacks.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    pub(crate) fn new(
        sender: oneshot::Sender<TaskResult>,
        task: String,
        path: InstancePath,
        violations: ViolationLog,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                task,
                path,
                violations,
            }),
        }
    }

    /// Signal success. Returns false if a signal was already delivered.
    pub fn done(&self) -> bool {
        self.signal(Ok(()))
    }

    /// Signal failure. Returns false if a signal was already delivered.
    pub fn fail(&self, error: impl Into<TaskError>) -> bool {
        self.signal(Err(error.into()))
    }

    /// Deliver `result` if this is the first signal.
    pub fn signal(&self, result: TaskResult) -> bool {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match sender {
            Some(sender) => {
                // The receiver is gone once the task timed out or the run was
                // cancelled; the late result has nowhere to go.
                let _ = sender.send(result);
                true
            }
            None => {
                self.inner.violations.record(ProtocolViolation {
                    task: self.inner.task.clone(),
                    path: self.inner.path.clone(),
                    kind: ViolationKind::DuplicateSignal {
                        ignored: result.err(),
                    },
                });
                false
            }
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("task", &self.inner.task)
            .field("path", &self.inner.path)
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
