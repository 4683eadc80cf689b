use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier.
pub type TaskId = Uuid;

/// Invoked by the worker after a task reaches a terminal state.
pub type TaskCallback = Arc<dyn Fn(&TaskResult) + Send + Sync>;

/// Task execution priority. Lower rank is served first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// System-critical tasks.
    Critical,
    /// User-facing interactions.
    High,
    /// Background processing.
    #[default]
    Normal,
    /// Analytics, cleanup.
    Low,
    /// Bulk/batch work.
    Batch,
}

impl Priority {
    /// Numeric rank used for queue ordering (0 = most urgent).
    pub fn rank(self) -> u8 {
        self as u8
    }
}

/// Task lifecycle states.
///
/// `Pending → Running → {Completed | Failed | Timeout | Cancelled}`, with
/// `Failed → Pending` while the retry budget lasts. `Cancelled` is reachable
/// from `Pending` or `Running` and, like the other three outcomes, is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    /// Whether this state ends the task's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of schedulable work.
///
/// Built through [`Task::builder`]; owned by the task manager once
/// submitted. Workers operate on cloned snapshots and report outcomes back
/// through the manager rather than mutating shared state.
#[derive(Clone)]
pub struct Task {
    pub id: TaskId,
    /// Task-type key resolved against the processor registry.
    pub kind: String,
    /// Opaque payload handed to the processor.
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Per-task execution deadline. `None` means no limit.
    pub timeout: Option<Duration>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Tasks that must complete successfully before this one may run.
    pub depends_on: HashSet<TaskId>,
    pub cpu_intensive: bool,
    pub io_bound: bool,
    pub memory_intensive: bool,
    /// Informational labels, not interpreted by the engine.
    pub tags: HashSet<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Name of the worker loop currently (or last) executing this task.
    pub worker: Option<String>,
    pub callback: Option<TaskCallback>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .field("depends_on", &self.depends_on)
            .field("callback", &self.callback.as_ref().map(|_| "<fn>"))
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Start building a task of the given kind with library defaults
    /// (normal priority, no timeout, 3 retries).
    pub fn builder(kind: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(kind)
    }

    /// Which execution backend this task's resource hints select.
    pub fn backend(&self) -> Backend {
        if self.cpu_intensive && !self.io_bound {
            Backend::Compute
        } else if self.io_bound || self.memory_intensive {
            Backend::Io
        } else {
            Backend::Inline
        }
    }
}

/// Execution context a task runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Directly on the worker's own async context.
    Inline,
    /// Offloaded to the io pool (thread-style executor).
    Io,
    /// Offloaded to the compute pool (process-style executor).
    Compute,
}

/// Fluent builder for [`Task`].
///
/// # Example
/// ```
/// use dagpool_core::task::{Priority, Task};
///
/// let task = Task::builder("transcription")
///     .payload(serde_json::json!({ "audio": "a.wav" }))
///     .priority(Priority::High)
///     .timeout(std::time::Duration::from_secs(10))
///     .build();
/// assert_eq!(task.kind, "transcription");
/// ```
pub struct TaskBuilder {
    kind: String,
    payload: serde_json::Value,
    priority: Priority,
    timeout: Option<Duration>,
    max_retries: u32,
    depends_on: HashSet<TaskId>,
    cpu_intensive: bool,
    io_bound: bool,
    memory_intensive: bool,
    tags: HashSet<String>,
    callback: Option<TaskCallback>,
}

impl TaskBuilder {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
            timeout: None,
            max_retries: 3,
            depends_on: HashSet::new(),
            cpu_intensive: false,
            io_bound: false,
            memory_intensive: false,
            tags: HashSet::new(),
            callback: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Add a single dependency edge.
    pub fn depends_on(mut self, dep: TaskId) -> Self {
        self.depends_on.insert(dep);
        self
    }

    /// Add several dependency edges at once.
    pub fn depends_on_all(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.depends_on.extend(deps);
        self
    }

    pub fn cpu_intensive(mut self) -> Self {
        self.cpu_intensive = true;
        self
    }

    pub fn io_bound(mut self) -> Self {
        self.io_bound = true;
        self
    }

    pub fn memory_intensive(mut self) -> Self {
        self.memory_intensive = true;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Register a completion callback, invoked once after the task reaches a
    /// terminal state.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskResult) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> Task {
        Task {
            id: Uuid::new_v4(),
            kind: self.kind,
            payload: self.payload,
            priority: self.priority,
            timeout: self.timeout,
            retry_count: 0,
            max_retries: self.max_retries,
            depends_on: self.depends_on,
            cpu_intensive: self.cpu_intensive,
            io_bound: self.io_bound,
            memory_intensive: self.memory_intensive,
            tags: self.tags,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker: None,
            callback: self.callback,
        }
    }
}

/// Terminal outcome of a task execution.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// Processor output on success.
    pub value: Option<serde_json::Value>,
    /// Error description on failure/timeout/cancellation.
    pub error: Option<String>,
    pub execution_time: Duration,
    /// Best-effort process memory observed at completion, in bytes.
    pub memory_bytes: u64,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn completed(task_id: TaskId, value: serde_json::Value) -> Self {
        Self::terminal(task_id, TaskStatus::Completed, Some(value), None)
    }

    pub fn failed(task_id: TaskId, error: impl Into<String>) -> Self {
        Self::terminal(task_id, TaskStatus::Failed, None, Some(error.into()))
    }

    pub fn timed_out(task_id: TaskId, timeout: Duration) -> Self {
        Self::terminal(
            task_id,
            TaskStatus::Timeout,
            None,
            Some(format!("task timed out after {timeout:?}")),
        )
    }

    pub fn cancelled(task_id: TaskId, reason: impl Into<String>) -> Self {
        Self::terminal(task_id, TaskStatus::Cancelled, None, Some(reason.into()))
    }

    fn terminal(
        task_id: TaskId,
        status: TaskStatus,
        value: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Self {
        Self {
            task_id,
            status,
            value,
            error,
            execution_time: Duration::ZERO,
            memory_bytes: 0,
            completed_at: Utc::now(),
        }
    }

    pub fn with_execution_time(mut self, execution_time: Duration) -> Self {
        self.execution_time = execution_time;
        self
    }

    pub fn with_memory_bytes(mut self, memory_bytes: u64) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }
}
