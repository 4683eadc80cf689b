//! The scheduler core.
//!
//! Composes the task manager, processor registry, priority queue, offload
//! pools, and performance monitor into one engine instance:
//!
//! ```text
//! submit_task
//!   ↓
//! TaskManager::register (validation, dependency edges)
//!   ↓ ready?
//! TaskQueue (priority + submission order)
//!   ↓
//! worker loop — claim → route backend → race timeout/cancel → TaskResult
//!   ↓
//! TaskManager::complete → newly-ready dependents re-enqueued
//!   ↓
//! PerformanceMonitor
//! ```
//!
//! There is no global state: an engine owns all of its parts and is
//! constructed explicitly, once, and shared by handle.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, ValidationError};
use crate::manager::TaskManager;
use crate::monitor::{MetricsSnapshot, PerformanceMonitor};
use crate::pool::BlockingPool;
use crate::queue::{QueueItem, TaskQueue};
use crate::registry::{Processor, ProcessorRegistry};
use crate::task::{Backend, Task, TaskBuilder, TaskId, TaskResult, TaskStatus};

/// Shared internals handed to the worker loops.
struct Core {
    manager: TaskManager,
    registry: ProcessorRegistry,
    queue: TaskQueue,
    monitor: PerformanceMonitor,
    io_pool: BlockingPool,
    compute_pool: BlockingPool,
    running: AtomicBool,
    /// Cancellation signals for executions currently in flight.
    active: StdMutex<HashMap<TaskId, Arc<Notify>>>,
    /// Stops the monitoring loop.
    stop_monitor: Notify,
    submit_wait: Option<Duration>,
    monitor_interval: Duration,
}

impl Core {
    fn active_count(&self) -> usize {
        self.active.lock().expect("active map lock poisoned").len()
    }

    fn cancel_signal(&self, id: TaskId) -> Option<Arc<Notify>> {
        self.active
            .lock()
            .expect("active map lock poisoned")
            .get(&id)
            .cloned()
    }
}

/// In-process task scheduling engine.
///
/// Construct with a [`SchedulerConfig`], register processors, call
/// [`Scheduler::start`], submit tasks, and eventually
/// [`Scheduler::shutdown`].
pub struct Scheduler {
    config: SchedulerConfig,
    core: Arc<Core>,
    loops: StdMutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let core = Core {
            manager: TaskManager::new(config.history_limit),
            registry: ProcessorRegistry::new(),
            queue: TaskQueue::new(config.queue_capacity),
            monitor: PerformanceMonitor::new(),
            io_pool: BlockingPool::new("io", config.executors.io_threads),
            compute_pool: BlockingPool::new("compute", config.executors.compute_threads),
            running: AtomicBool::new(false),
            active: StdMutex::new(HashMap::new()),
            stop_monitor: Notify::new(),
            submit_wait: config.submit_wait(),
            monitor_interval: config.monitor.interval(),
        };
        Self {
            config,
            core: Arc::new(core),
            loops: StdMutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a handler for a task kind, replacing any existing mapping.
    pub fn register_processor(&self, kind: impl Into<String>, processor: Arc<dyn Processor>) {
        self.core.registry.register(kind, processor);
    }

    /// Register an async closure as the handler for a task kind.
    pub fn register_processor_fn<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.core.registry.register_fn(kind, handler);
    }

    /// Builder seeded with this engine's configured retry/timeout defaults.
    pub fn task(&self, kind: impl Into<String>) -> TaskBuilder {
        let mut builder = TaskBuilder::new(kind).max_retries(self.config.default_max_retries);
        if let Some(timeout) = self.config.default_timeout() {
            builder = builder.timeout(timeout);
        }
        builder
    }

    /// Launch the worker loops and the monitoring loop. Idempotent.
    ///
    /// Must be called from within a tokio runtime. An engine that has been
    /// shut down stays down; build a new one instead of restarting.
    pub fn start(&self) {
        if self.core.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let workers = self.config.resolved_workers();
        let mut loops = self.loops.lock().expect("loop handles lock poisoned");
        for i in 0..workers {
            let core = Arc::clone(&self.core);
            let name = format!("worker-{i}");
            loops.push(tokio::spawn(worker_loop(core, name)));
        }
        if self.config.monitor.enabled {
            loops.push(tokio::spawn(monitor_loop(Arc::clone(&self.core))));
        }
        info!(workers, "scheduler started");
    }

    /// Validate and register a task; enqueue it immediately when it has no
    /// unmet dependencies. Returns the task id.
    pub async fn submit_task(&self, task: Task) -> Result<TaskId, SchedulerError> {
        if !self.core.running.load(Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }
        if !self.core.registry.contains(&task.kind) {
            return Err(ValidationError::UnknownProcessor(task.kind.clone()).into());
        }

        let id = task.id;
        let priority = task.priority;
        let kind = task.kind.clone();
        self.core.manager.register(task).await?;

        if self.core.manager.is_ready(id).await {
            if let Err(e) = self
                .core
                .queue
                .push(id, priority, self.core.submit_wait)
                .await
            {
                // Roll the registration back so the caller can resubmit.
                self.core.manager.cancel(id).await;
                return Err(e);
            }
        }
        debug!(task = %id, kind = %kind, "submitted task");
        Ok(id)
    }

    /// Cancel a task and its transitive dependents. Executions already in
    /// flight are signalled: cooperative for in-place work, stop-waiting
    /// only for pool-backed work. Returns whether anything changed.
    pub async fn cancel_task(&self, id: TaskId) -> bool {
        let changed = self.core.manager.cancel(id).await;
        for cancelled in &changed {
            if let Some(signal) = self.core.cancel_signal(*cancelled) {
                // notify_one stores a permit, so a signal that fires before
                // the execution reaches its select is not lost.
                signal.notify_one();
            }
        }
        !changed.is_empty()
    }

    pub async fn get_task_status(&self, id: TaskId) -> Result<TaskStatus, SchedulerError> {
        self.core
            .manager
            .status(id)
            .await
            .ok_or(SchedulerError::NotFound(id))
    }

    pub async fn get_task_result(&self, id: TaskId) -> Option<TaskResult> {
        self.core.manager.get_result(id).await
    }

    /// Await a task's terminal result, bounded by `timeout` when given.
    pub async fn wait_for_task(
        &self,
        id: TaskId,
        timeout: Option<Duration>,
    ) -> Result<TaskResult, SchedulerError> {
        self.core.manager.wait_for(id, timeout).await
    }

    /// Snapshot of throughput/latency/memory counters. Purely
    /// observational.
    pub fn get_performance_metrics(&self) -> MetricsSnapshot {
        self.core
            .monitor
            .snapshot(self.core.queue.len(), self.core.active_count())
    }

    /// Graceful shutdown: stop accepting submissions, cancel in-flight
    /// executions, unblock every worker with a sentinel, join the loops
    /// bounded by `timeout`, abort stragglers, then close the queue and
    /// shut both offload pools down (waiting for in-flight native work —
    /// pool-backed handlers cannot be preempted).
    pub async fn shutdown(&self, timeout: Duration) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(?timeout, "initiating graceful shutdown");

        let active: Vec<TaskId> = {
            let map = self.core.active.lock().expect("active map lock poisoned");
            map.keys().copied().collect()
        };
        for id in active {
            self.cancel_task(id).await;
        }

        let mut loops = {
            let mut guard = self.loops.lock().expect("loop handles lock poisoned");
            std::mem::take(&mut *guard)
        };
        for _ in 0..loops.len() {
            self.core.queue.push_sentinel();
        }
        self.core.stop_monitor.notify_waiters();

        let deadline = tokio::time::Instant::now() + timeout;
        for handle in &mut loops {
            if tokio::time::timeout_at(deadline, &mut *handle).await.is_err() {
                warn!("worker did not stop within the shutdown timeout; aborting");
                handle.abort();
            }
        }

        // Release anything still blocked on queue capacity or an empty
        // queue, then drain the pools.
        self.core.queue.close();
        self.core.io_pool.shutdown();
        self.core.compute_pool.shutdown();

        info!("scheduler shutdown complete");
    }

    /// Whether both offload pools have fully terminated.
    pub fn executors_terminated(&self) -> bool {
        self.core.io_pool.is_terminated() && self.core.compute_pool.is_terminated()
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }
}

/// Outcome of one execution attempt, before retry handling.
enum Outcome {
    Completed(serde_json::Value),
    Failed(String),
    TimedOut(Duration),
    Cancelled,
}

async fn worker_loop(core: Arc<Core>, worker: String) {
    debug!(worker = %worker, "worker started");
    loop {
        let Some(item) = core.queue.pop().await else {
            // Queue closed during shutdown.
            break;
        };
        let id = match item {
            QueueItem::Shutdown => break,
            QueueItem::Task { id, .. } => id,
        };
        // A fault in one worker must not take its siblings down.
        if let Err(e) = run_one(&core, &worker, id).await {
            error!(worker = %worker, task = %id, error = %e, "worker fault; continuing");
        }
    }
    debug!(worker = %worker, "worker stopped");
}

/// Claim, execute, and report one task.
async fn run_one(core: &Arc<Core>, worker: &str, id: TaskId) -> Result<(), SchedulerError> {
    let Some(task) = core.manager.start(id, worker).await else {
        // Cancelled while queued, double-enqueued, or evicted.
        debug!(task = %id, "skipping task that is no longer pending");
        return Ok(());
    };

    let cancel = Arc::new(Notify::new());
    core.active
        .lock()
        .expect("active map lock poisoned")
        .insert(id, Arc::clone(&cancel));

    let started = Instant::now();
    let outcome = execute(core, &task, cancel).await;
    let elapsed = started.elapsed();

    core.active
        .lock()
        .expect("active map lock poisoned")
        .remove(&id);

    // Failures re-enter the queue at the original priority while the
    // budget lasts. Timeouts are terminal by design.
    if let Outcome::Failed(err) = &outcome {
        if let Some(attempt) = core.manager.retry(id).await {
            warn!(
                task = %id,
                attempt,
                max_retries = task.max_retries,
                error = %err,
                "task failed; requeueing"
            );
            core.queue.push(id, task.priority, None).await?;
            return Ok(());
        }
    }

    let result = match outcome {
        Outcome::Completed(value) => TaskResult::completed(id, value),
        Outcome::Failed(err) => TaskResult::failed(id, err),
        Outcome::TimedOut(timeout) => TaskResult::timed_out(id, timeout),
        Outcome::Cancelled => TaskResult::cancelled(id, "cancelled during execution"),
    }
    .with_execution_time(elapsed)
    .with_memory_bytes(core.monitor.probe_memory());

    let newly_ready = core.manager.complete(id, result.clone()).await;

    // A cancellation may have raced us; report whatever the manager kept.
    let stored = core.manager.get_result(id).await.unwrap_or(result);
    if let Some(callback) = task.callback.as_ref() {
        let hook = AssertUnwindSafe(|| callback(&stored));
        if std::panic::catch_unwind(hook).is_err() {
            warn!(task = %id, "completion callback panicked");
        }
    }
    core.monitor.record_completion(worker, &stored);
    debug!(task = %id, status = %stored.status, elapsed_ms = elapsed.as_millis() as u64, "task finished");

    for (dep_id, priority) in newly_ready {
        debug!(task = %dep_id, "dependencies satisfied; enqueueing");
        core.queue.push(dep_id, priority, None).await?;
    }
    Ok(())
}

/// Route to a backend and race the execution against its timeout and the
/// cancellation signal.
async fn execute(core: &Arc<Core>, task: &Task, cancel: Arc<Notify>) -> Outcome {
    let Some(processor) = core.registry.get(&task.kind) else {
        // Validated at submission; only reachable if the registry was
        // swapped out from under a queued task.
        return Outcome::Failed(format!(
            "no processor registered for task kind '{}'",
            task.kind
        ));
    };

    match task.backend() {
        Backend::Inline => run_inline(processor, task, cancel).await,
        Backend::Io => run_offloaded(&core.io_pool, processor, task, cancel).await,
        Backend::Compute => run_offloaded(&core.compute_pool, processor, task, cancel).await,
    }
}

/// Cheapest path: execute on the worker's own async context. Cancellation
/// is cooperative — dropping the future at the next suspension point.
async fn run_inline(
    processor: Arc<dyn Processor>,
    task: &Task,
    cancel: Arc<Notify>,
) -> Outcome {
    let work = AssertUnwindSafe(processor.process(task.payload.clone())).catch_unwind();
    tokio::select! {
        biased;
        _ = cancel.notified() => Outcome::Cancelled,
        _ = deadline(task.timeout) => Outcome::TimedOut(task.timeout.unwrap_or_default()),
        result = work => match result {
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(err)) => Outcome::Failed(format!("{err:#}")),
            Err(_) => Outcome::Failed("handler panicked".to_string()),
        },
    }
}

/// Offloaded path: the handler future is driven on a pool thread.
/// Cancellation and timeout are best-effort — they stop the engine from
/// waiting, but cannot interrupt native work already on the pool thread.
async fn run_offloaded(
    pool: &BlockingPool,
    processor: Arc<dyn Processor>,
    task: &Task,
    cancel: Arc<Notify>,
) -> Outcome {
    let payload = task.payload.clone();
    let rx = match pool.submit(move || futures::executor::block_on(processor.process(payload))) {
        Ok(rx) => rx,
        Err(_) => return Outcome::Failed("offload executor is shut down".to_string()),
    };

    tokio::select! {
        biased;
        _ = cancel.notified() => Outcome::Cancelled,
        _ = deadline(task.timeout) => Outcome::TimedOut(task.timeout.unwrap_or_default()),
        received = rx => match received {
            Ok(Ok(Ok(value))) => Outcome::Completed(value),
            Ok(Ok(Err(err))) => Outcome::Failed(format!("{err:#}")),
            Ok(Err(_panic)) => Outcome::Failed("handler panicked".to_string()),
            Err(_) => Outcome::Failed("offload executor dropped the result".to_string()),
        },
    }
}

/// Pending forever when the task carries no timeout.
async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Samples queue depth and throughput, and refreshes worker idle flags.
async fn monitor_loop(core: Arc<Core>) {
    let mut ticker = tokio::time::interval(core.monitor_interval);
    // The first tick fires immediately; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // Catch a stop signal that landed while we were sampling.
                if !core.running.load(Ordering::SeqCst) {
                    break;
                }
                core.monitor.tick(core.queue.len());
            }
            _ = core.stop_monitor.notified() => break,
        }
    }
    debug!("monitoring loop stopped");
}
