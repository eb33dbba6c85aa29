//! Orchestration layer: runs task trees and reports their outcome.
//!
//! This module provides the executor that walks series/parallel trees,
//! the per-run context that tracks every task instance, and the
//! execution report handed back to callers.

mod context;
mod report;
mod runner;

pub use context::RunEvent;
pub use report::{ExecutionReport, Failure, RunStatus, TaskRecord};
pub use runner::{run, Orchestrator, RunOptions};
