use std::time::Duration;

use thiserror::Error;

use crate::task::TaskId;

/// Submission-time validation failures. These are surfaced synchronously to
/// the caller and never enter the queue.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("no processor registered for task kind '{0}'")]
    UnknownProcessor(String),

    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("unknown dependency: task '{task}' depends on '{missing}'")]
    UnknownDependency { task: TaskId, missing: TaskId },

    #[error("circular dependency detected: {0}")]
    CircularDependency(String),

    #[error("queue full: no capacity freed within {0:?}")]
    QueueFull(Duration),
}

/// Engine-level errors.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("scheduler is not running")]
    NotRunning,

    #[error("queue closed")]
    QueueClosed,

    #[error("timed out after {timeout:?} waiting for task {task}")]
    WaitTimeout { task: TaskId, timeout: Duration },

    #[error("execution failed: {0}")]
    Execution(String),
}
