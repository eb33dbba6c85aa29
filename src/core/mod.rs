//! Core task model for the build orchestrator.
//!
//! This module contains the task values that describe a pipeline, the
//! completion signal handed to callback-style tasks, and the named registry
//! used to compose pipelines declaratively.

pub mod completion;
pub mod registry;
pub mod task;

pub use completion::{Completion, ProtocolViolation, ViolationKind};
pub use registry::{Compose, Registry};
pub use task::{
    parallel, series, InstancePath, Task, TaskContext, TaskId, TaskKind, TaskResult, TaskStatus,
};
