use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task `{task}` would depend on itself through `{via}`")]
    Cycle { task: String, via: String },

    #[error("Task not found: {0}")]
    UnknownTask(String),

    #[error("Task already defined: {0}")]
    DuplicateTask(String),

    #[error("Composite task `{0}` has no children")]
    EmptyComposite(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error signaled by an atomic task.
///
/// Cloneable so the same failure can sit in the report, the run events and
/// every composite annotation above it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TaskError {
    #[error("{message}")]
    Message { message: String },

    #[error("command `{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("completion was never signaled")]
    NeverSignaled,

    #[error("cancelled")]
    Cancelled,

    #[error("panicked: {message}")]
    Panicked { message: String },
}

impl TaskError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked { message }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self::Message { message }
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}
