//! dagpool — an in-process asynchronous task scheduling engine.
//!
//! Tasks carry a priority, a dependency list, resource-affinity hints, a
//! timeout, and a retry policy. The engine executes them across a bounded
//! pool of concurrent workers, respecting dependency ordering, enforcing
//! timeouts, retrying failures, cascading cancellation downstream, and
//! reporting throughput/latency metrics.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dagpool_core::config::SchedulerConfig;
//! use dagpool_core::engine::Scheduler;
//! use dagpool_core::task::Priority;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
//! scheduler.register_processor_fn("echo", |payload| async move { Ok(payload) });
//! scheduler.start();
//!
//! let task = scheduler
//!     .task("echo")
//!     .payload(serde_json::json!({ "hello": "world" }))
//!     .priority(Priority::High)
//!     .build();
//! let id = scheduler.submit_task(task).await?;
//!
//! let result = scheduler.wait_for_task(id, Some(Duration::from_secs(5))).await?;
//! println!("{:?}", result.value);
//!
//! scheduler.shutdown(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```
//!
//! # Cancellation semantics
//!
//! Cancelling a task cancels its full transitive-dependent closure and
//! never touches its dependencies. In-place executions are cancelled
//! cooperatively at their next suspension point; work already dispatched
//! to the io or compute pool cannot be preempted — the engine stops
//! waiting and marks the task, while the native work runs to completion
//! unobserved.

pub mod config;
pub mod engine;
pub mod error;
pub(crate) mod graph;
pub mod manager;
pub mod monitor;
pub(crate) mod pool;
pub(crate) mod queue;
pub mod registry;
pub mod task;

pub use config::SchedulerConfig;
pub use engine::Scheduler;
pub use error::{SchedulerError, ValidationError};
pub use monitor::MetricsSnapshot;
pub use registry::Processor;
pub use task::{Priority, Task, TaskBuilder, TaskId, TaskResult, TaskStatus};
