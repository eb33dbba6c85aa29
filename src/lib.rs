pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod pipeline;
pub mod util;

pub use crate::core::{parallel, series, Completion, Compose, Registry, Task, TaskContext};
pub use error::{Error, Result, TaskError};
pub use orchestration::{run, ExecutionReport, Orchestrator, RunEvent, RunOptions, RunStatus};
pub use pipeline::{Pipeline, Step, StepJob};
