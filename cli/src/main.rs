//! Demo driver for the dagpool engine: registers a handful of processors,
//! submits a batch of interaction pipelines (transcribe → analyze →
//! respond → notify), and prints a metrics snapshot when the DAG drains.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dagpool_core::config::{self, LoggingConfig};
use dagpool_core::engine::Scheduler;
use dagpool_core::task::{Priority, TaskId, TaskStatus};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "dagpool", version, about = "Priority/DAG task scheduling engine demo")]
struct Args {
    /// TOML config file. Defaults to ./dagpool.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured worker count.
    #[arg(long)]
    workers: Option<usize>,

    /// Number of interaction pipelines to simulate.
    #[arg(long, default_value_t = 4)]
    pipelines: usize,

    /// Print the final metrics snapshot as pretty JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = real_main().await {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

async fn real_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => config::load_from_path(path)?,
        None => config::load_default()?,
    };
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    init_tracing(&cfg.logging)?;

    let scheduler = Arc::new(Scheduler::new(cfg));
    register_demo_processors(&scheduler);
    scheduler.start();

    let pipelines = submit_pipelines(&scheduler, args.pipelines).await?;

    tokio::select! {
        outcome = wait_pipelines(&scheduler, &pipelines) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupt received, cancelling outstanding work");
            for (_, final_id) in &pipelines {
                scheduler.cancel_task(*final_id).await;
            }
        }
    }

    let snapshot = scheduler.get_performance_metrics();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!(
            "processed {} tasks in {:.1}s ({:.1}/s, {:.1}% success, avg {:.1}ms, queue depth {})",
            snapshot.tasks_processed,
            snapshot.uptime_seconds,
            snapshot.tasks_per_second,
            snapshot.success_rate,
            snapshot.average_execution_ms,
            snapshot.queue_depth,
        );
    }

    scheduler.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

/// The demo stand-ins for the real handlers a host application would
/// register: the engine only ever sees them through the registry.
fn register_demo_processors(scheduler: &Scheduler) {
    scheduler.register_processor_fn("transcribe", |payload| async move {
        // io-bound path: may run on an io pool thread, so block instead of
        // awaiting a runtime timer.
        std::thread::sleep(Duration::from_millis(30));
        Ok(serde_json::json!({
            "transcript": "hello there",
            "source": payload.get("audio").cloned().unwrap_or_default(),
        }))
    });

    scheduler.register_processor_fn("analyze", |_| async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(serde_json::json!({ "sentiment": "positive", "confidence": 0.87 }))
    });

    scheduler.register_processor_fn("respond", |_| async {
        tokio::time::sleep(Duration::from_millis(40)).await;
        Ok(serde_json::json!({ "reply": "hi! ready to play?" }))
    });

    scheduler.register_processor_fn("render-audio", |_| async {
        // cpu-heavy path: runs on the compute pool.
        std::thread::sleep(Duration::from_millis(25));
        Ok(serde_json::json!({ "samples": 48_000 }))
    });

    scheduler.register_processor_fn("notify", |_| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(serde_json::json!({ "delivered": true }))
    });
}

/// Build one transcribe → analyze → respond → {render, notify} DAG per
/// pipeline. Returns (pipeline index, final task id) pairs.
async fn submit_pipelines(
    scheduler: &Scheduler,
    count: usize,
) -> anyhow::Result<Vec<(usize, TaskId)>> {
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let transcribe = scheduler
            .task("transcribe")
            .payload(serde_json::json!({ "audio": format!("session-{i}.wav") }))
            .priority(Priority::High)
            .io_bound()
            .tag("demo")
            .build();
        let transcribe_id = scheduler.submit_task(transcribe).await?;

        let analyze = scheduler
            .task("analyze")
            .priority(Priority::Normal)
            .depends_on(transcribe_id)
            .build();
        let analyze_id = scheduler.submit_task(analyze).await?;

        let respond = scheduler
            .task("respond")
            .priority(Priority::High)
            .timeout(Duration::from_secs(5))
            .depends_on(analyze_id)
            .build();
        let respond_id = scheduler.submit_task(respond).await?;

        let render = scheduler
            .task("render-audio")
            .priority(Priority::Normal)
            .cpu_intensive()
            .depends_on(respond_id)
            .build();
        let render_id = scheduler.submit_task(render).await?;

        let notify = scheduler
            .task("notify")
            .priority(Priority::Low)
            .depends_on(render_id)
            .on_complete(|result| {
                tracing::info!(task = %result.task_id, status = %result.status, "pipeline finished");
            })
            .build();
        let notify_id = scheduler.submit_task(notify).await?;

        out.push((i, notify_id));
    }
    tracing::info!(pipelines = count, "submitted demo workload");
    Ok(out)
}

async fn wait_pipelines(
    scheduler: &Scheduler,
    pipelines: &[(usize, TaskId)],
) -> anyhow::Result<()> {
    for (i, final_id) in pipelines {
        let result = scheduler
            .wait_for_task(*final_id, Some(Duration::from_secs(30)))
            .await?;
        if result.status != TaskStatus::Completed {
            tracing::warn!(
                pipeline = i,
                status = %result.status,
                error = result.error.as_deref().unwrap_or(""),
                "pipeline did not complete"
            );
        }
    }
    Ok(())
}

fn init_tracing(cfg: &LoggingConfig) -> anyhow::Result<()> {
    if !cfg.enabled {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    let console_layer = cfg.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let file_layer = if cfg.file {
        let directory = cfg
            .directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().to_string_lossy().to_string());
        let appender = tracing_appender::rolling::daily(directory, "dagpool.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = LOG_GUARD.set(guard);
        Some(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise tracing: {e}"))?;
    Ok(())
}
