//! End-to-end scheduler behavior: dependency ordering, priorities, retry,
//! timeout, cascade cancellation, backend routing, and shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dagpool_core::config::{ExecutorConfig, MonitorConfig, SchedulerConfig};
use dagpool_core::engine::Scheduler;
use dagpool_core::error::{SchedulerError, ValidationError};
use dagpool_core::task::{Priority, TaskStatus};

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers,
        queue_capacity: 64,
        executors: ExecutorConfig {
            io_threads: 1,
            compute_threads: 1,
        },
        monitor: MonitorConfig {
            enabled: true,
            interval_ms: 20,
        },
        ..Default::default()
    }
}

fn started_scheduler(workers: usize) -> Arc<Scheduler> {
    let scheduler = Arc::new(Scheduler::new(config(workers)));
    scheduler.start();
    scheduler
}

/// Records the order handlers actually ran in.
fn recording_handler(
    scheduler: &Scheduler,
    kind: &str,
    log: Arc<Mutex<Vec<String>>>,
    delay: Duration,
) {
    scheduler.register_processor_fn(kind, move |payload| {
        let log = Arc::clone(&log);
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let label = payload
                .get("label")
                .and_then(|v| v.as_str())
                .unwrap_or("?")
                .to_string();
            log.lock().unwrap().push(label.clone());
            Ok(serde_json::json!({ "label": label }))
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_without_dependencies_runs_immediately() {
    let scheduler = started_scheduler(2);
    scheduler.register_processor_fn("echo", |p| async move { Ok(p) });

    let task = scheduler
        .task("echo")
        .payload(serde_json::json!({ "n": 1 }))
        .build();
    let id = scheduler.submit_task(task).await.unwrap();

    let result = scheduler
        .wait_for_task(id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.value, Some(serde_json::json!({ "n": 1 })));

    // Idempotent read: asking again yields identical content.
    let again = scheduler
        .wait_for_task(id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(again.status, result.status);
    assert_eq!(again.value, result.value);
    assert_eq!(again.completed_at, result.completed_at);

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependent_runs_only_after_dependency_completes() {
    let scheduler = started_scheduler(4);
    let log = Arc::new(Mutex::new(Vec::new()));
    recording_handler(&scheduler, "step", Arc::clone(&log), Duration::from_millis(50));

    let a = scheduler
        .task("step")
        .payload(serde_json::json!({ "label": "a" }))
        .priority(Priority::High)
        .build();
    let a_id = scheduler.submit_task(a).await.unwrap();

    // Higher nominal priority, but gated behind a.
    let b = scheduler
        .task("step")
        .payload(serde_json::json!({ "label": "b" }))
        .priority(Priority::Critical)
        .depends_on(a_id)
        .build();
    let b_id = scheduler.submit_task(b).await.unwrap();

    // While a is still executing, b must not have started.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        scheduler.get_task_status(b_id).await.unwrap(),
        TaskStatus::Pending
    );

    let b_result = scheduler
        .wait_for_task(b_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(b_result.status, TaskStatus::Completed);
    assert_eq!(*log.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn high_priority_dequeues_before_low() {
    // One worker: occupy it, queue LOW then HIGH, and watch the order.
    let scheduler = started_scheduler(1);
    let log = Arc::new(Mutex::new(Vec::new()));
    recording_handler(&scheduler, "plug", Arc::clone(&log), Duration::from_millis(150));
    recording_handler(&scheduler, "step", Arc::clone(&log), Duration::ZERO);

    let plug = scheduler
        .task("plug")
        .payload(serde_json::json!({ "label": "plug" }))
        .build();
    scheduler.submit_task(plug).await.unwrap();
    // Let the worker claim the plug before queueing the contenders.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let low = scheduler
        .task("step")
        .payload(serde_json::json!({ "label": "low" }))
        .priority(Priority::Low)
        .build();
    let high = scheduler
        .task("step")
        .payload(serde_json::json!({ "label": "high" }))
        .priority(Priority::High)
        .build();
    scheduler.submit_task(low).await.unwrap();
    let high_id = scheduler.submit_task(high).await.unwrap();

    scheduler
        .wait_for_task(high_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let order = log.lock().unwrap().clone();
    let high_pos = order.iter().position(|l| l == "high").unwrap();
    let low_pos = order.iter().position(|l| l == "low");
    if let Some(low_pos) = low_pos {
        assert!(high_pos < low_pos, "high must run before low: {order:?}");
    }

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equal_priority_is_fifo() {
    let scheduler = started_scheduler(1);
    let log = Arc::new(Mutex::new(Vec::new()));
    recording_handler(&scheduler, "plug", Arc::clone(&log), Duration::from_millis(100));
    recording_handler(&scheduler, "step", Arc::clone(&log), Duration::ZERO);

    let plug = scheduler
        .task("plug")
        .payload(serde_json::json!({ "label": "plug" }))
        .build();
    scheduler.submit_task(plug).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let mut last = None;
    for label in ["first", "second", "third"] {
        let task = scheduler
            .task("step")
            .payload(serde_json::json!({ "label": label }))
            .build();
        last = Some(scheduler.submit_task(task).await.unwrap());
    }

    scheduler
        .wait_for_task(last.unwrap(), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec!["plug", "first", "second", "third"]
    );

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_handler_is_retried_then_failed() {
    let scheduler = started_scheduler(2);
    let attempts = Arc::new(AtomicU32::new(0));
    {
        let attempts = Arc::clone(&attempts);
        scheduler.register_processor_fn("flaky", move |_| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("synthetic failure x")
            }
        });
    }

    let task = scheduler.task("flaky").max_retries(2).build();
    let id = scheduler.submit_task(task).await.unwrap();

    let result = scheduler
        .wait_for_task(id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.error.as_deref().unwrap_or("").contains("x"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "initial + 2 retries");

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hung_handler_times_out() {
    let scheduler = started_scheduler(2);
    scheduler.register_processor_fn("hang", |_| async {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(serde_json::Value::Null)
    });

    let task = scheduler
        .task("hang")
        .timeout(Duration::from_millis(100))
        .build();
    let started = Instant::now();
    let id = scheduler.submit_task(task).await.unwrap();

    let result = scheduler
        .wait_for_task(id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Timeout);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "timeout must fire near the 100ms mark, took {:?}",
        started.elapsed()
    );

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_cascades_to_dependents_only() {
    let scheduler = started_scheduler(2);
    let log = Arc::new(Mutex::new(Vec::new()));
    recording_handler(&scheduler, "step", Arc::clone(&log), Duration::from_millis(100));

    // a <- b <- c, d unrelated.
    let a = scheduler
        .task("step")
        .payload(serde_json::json!({ "label": "a" }))
        .build();
    let a_id = scheduler.submit_task(a).await.unwrap();
    let b = scheduler
        .task("step")
        .payload(serde_json::json!({ "label": "b" }))
        .depends_on(a_id)
        .build();
    let b_id = scheduler.submit_task(b).await.unwrap();
    let c = scheduler
        .task("step")
        .payload(serde_json::json!({ "label": "c" }))
        .depends_on(b_id)
        .build();
    let c_id = scheduler.submit_task(c).await.unwrap();
    let d = scheduler
        .task("step")
        .payload(serde_json::json!({ "label": "d" }))
        .build();
    let d_id = scheduler.submit_task(d).await.unwrap();

    assert!(scheduler.cancel_task(b_id).await);

    let a_result = scheduler
        .wait_for_task(a_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(a_result.status, TaskStatus::Completed, "dependency untouched");

    let b_result = scheduler.wait_for_task(b_id, None).await.unwrap();
    assert_eq!(b_result.status, TaskStatus::Cancelled);
    let c_result = scheduler.wait_for_task(c_id, None).await.unwrap();
    assert_eq!(c_result.status, TaskStatus::Cancelled);

    let d_result = scheduler
        .wait_for_task(d_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(d_result.status, TaskStatus::Completed, "unrelated untouched");

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cpu_intensive_runs_on_compute_pool() {
    let scheduler = started_scheduler(2);
    scheduler.register_processor_fn("where-am-i", |_| async {
        let name = std::thread::current()
            .name()
            .map(str::to_string)
            .unwrap_or_default();
        Ok(serde_json::json!({ "thread": name }))
    });

    let cpu = scheduler.task("where-am-i").cpu_intensive().build();
    let id = scheduler.submit_task(cpu).await.unwrap();
    let result = scheduler
        .wait_for_task(id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let thread = result.value.unwrap()["thread"].as_str().unwrap().to_string();
    assert!(
        thread.starts_with("compute-"),
        "cpu task must run on the compute pool, ran on {thread:?}"
    );

    let io = scheduler.task("where-am-i").io_bound().build();
    let id = scheduler.submit_task(io).await.unwrap();
    let result = scheduler
        .wait_for_task(id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let thread = result.value.unwrap()["thread"].as_str().unwrap().to_string();
    assert!(
        thread.starts_with("io-"),
        "io task must run on the io pool, ran on {thread:?}"
    );

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn validation_failures_are_synchronous() {
    let scheduler = started_scheduler(2);
    scheduler.register_processor_fn("echo", |p| async move { Ok(p) });

    // Unknown dependency.
    let ghost = uuid::Uuid::new_v4();
    let task = scheduler.task("echo").depends_on(ghost).build();
    assert!(matches!(
        scheduler.submit_task(task).await,
        Err(SchedulerError::Validation(
            ValidationError::UnknownDependency { .. }
        ))
    ));

    // Duplicate id.
    let task = scheduler.task("echo").build();
    let dup = task.clone();
    scheduler.submit_task(task).await.unwrap();
    assert!(matches!(
        scheduler.submit_task(dup).await,
        Err(SchedulerError::Validation(ValidationError::DuplicateTask(_)))
    ));

    // Self-cycle.
    let mut task = scheduler.task("echo").build();
    task.depends_on.insert(task.id);
    assert!(matches!(
        scheduler.submit_task(task).await,
        Err(SchedulerError::Validation(
            ValidationError::CircularDependency(_)
        ))
    ));

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completion_callback_fires_once() {
    let scheduler = started_scheduler(2);
    scheduler.register_processor_fn("echo", |p| async move { Ok(p) });

    let fired = Arc::new(AtomicU32::new(0));
    let seen_status = Arc::new(Mutex::new(None));
    let task = {
        let fired = Arc::clone(&fired);
        let seen_status = Arc::clone(&seen_status);
        scheduler
            .task("echo")
            .on_complete(move |result| {
                fired.fetch_add(1, Ordering::SeqCst);
                *seen_status.lock().unwrap() = Some(result.status);
            })
            .build()
    };
    let id = scheduler.submit_task(task).await.unwrap();
    scheduler
        .wait_for_task(id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(*seen_status.lock().unwrap(), Some(TaskStatus::Completed));

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_for_task_times_out_while_unresolved() {
    let scheduler = started_scheduler(1);
    scheduler.register_processor_fn("slow", |_| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(serde_json::Value::Null)
    });

    let task = scheduler.task("slow").build();
    let id = scheduler.submit_task(task).await.unwrap();
    let err = scheduler
        .wait_for_task(id, Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::WaitTimeout { .. }));

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metrics_reflect_completions() {
    let scheduler = started_scheduler(2);
    scheduler.register_processor_fn("echo", |p| async move { Ok(p) });
    scheduler.register_processor_fn("boom", |_| async { anyhow::bail!("nope") });

    for _ in 0..3 {
        let task = scheduler.task("echo").build();
        let id = scheduler.submit_task(task).await.unwrap();
        scheduler
            .wait_for_task(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
    }
    let task = scheduler.task("boom").max_retries(0).build();
    let id = scheduler.submit_task(task).await.unwrap();
    scheduler
        .wait_for_task(id, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let snapshot = scheduler.get_performance_metrics();
    assert_eq!(snapshot.tasks_processed, 4);
    assert_eq!(snapshot.tasks_completed, 3);
    assert_eq!(snapshot.tasks_failed, 1);
    assert_eq!(snapshot.success_rate, 75.0);
    assert!(!snapshot.workers.is_empty());

    scheduler.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_is_bounded_and_stops_the_long_task() {
    let scheduler = started_scheduler(2);
    scheduler.register_processor_fn("quick", |p| async move { Ok(p) });
    scheduler.register_processor_fn("sleeper", |_| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(serde_json::Value::Null)
    });

    for _ in 0..5 {
        let task = scheduler.task("quick").build();
        scheduler.submit_task(task).await.unwrap();
    }
    let long = scheduler.task("sleeper").build();
    let long_id = scheduler.submit_task(long).await.unwrap();

    // Let the sleeper get claimed.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    scheduler.shutdown(Duration::from_secs(1)).await;
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "shutdown must respect its bound, took {:?}",
        started.elapsed()
    );

    assert!(!scheduler.is_running());
    assert!(scheduler.executors_terminated());
    let status = scheduler.get_task_status(long_id).await.unwrap();
    assert_ne!(status, TaskStatus::Running, "long task forcibly stopped");

    // New submissions are refused after shutdown.
    let task = scheduler.task("quick").build();
    assert!(matches!(
        scheduler.submit_task(task).await,
        Err(SchedulerError::NotRunning)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_queue_rejects_after_configured_wait() {
    let mut cfg = config(1);
    cfg.queue_capacity = 1;
    cfg.submit_wait_ms = Some(100);
    let scheduler = Arc::new(Scheduler::new(cfg));
    scheduler.start();
    scheduler.register_processor_fn("slow", |_| async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(serde_json::Value::Null)
    });

    // First task occupies the single worker, second fills the queue.
    scheduler
        .submit_task(scheduler.task("slow").build())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    scheduler
        .submit_task(scheduler.task("slow").build())
        .await
        .unwrap();

    let err = scheduler
        .submit_task(scheduler.task("slow").build())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Validation(ValidationError::QueueFull(_))
    ));

    scheduler.shutdown(Duration::from_millis(200)).await;
}
