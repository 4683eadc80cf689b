//! Scheduling-neutral performance accounting.
//!
//! The monitor aggregates completed-task statistics and exposes a snapshot
//! for dashboards and the CLI. It never influences scheduling decisions.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::System;
use tracing::trace;

use crate::task::{TaskResult, TaskStatus};

/// Rolling-history sample cap for queue depth and throughput.
const HISTORY_SAMPLES: usize = 100;

/// A worker with no completions for this long is marked idle.
const IDLE_AFTER: Duration = Duration::from_secs(300);

/// Memory probe refresh throttle.
const PROBE_REFRESH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub tasks_processed: u64,
    pub busy_ms: u64,
    pub active: bool,
    #[serde(skip)]
    last_active: Option<Instant>,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            tasks_processed: 0,
            busy_ms: 0,
            active: true,
            last_active: None,
        }
    }
}

/// Point-in-time view of the monitor's counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: f64,
    pub tasks_processed: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_timed_out: u64,
    /// Completed / processed, percent.
    pub success_rate: f64,
    /// Processed / uptime.
    pub tasks_per_second: f64,
    /// Tasks/second over the most recent sampling window.
    pub current_throughput: f64,
    pub average_execution_ms: f64,
    pub peak_memory_bytes: u64,
    pub queue_depth: usize,
    pub running_tasks: usize,
    pub workers: HashMap<String, WorkerStats>,
}

#[derive(Debug, Default)]
struct MonitorState {
    tasks_processed: u64,
    tasks_completed: u64,
    tasks_failed: u64,
    tasks_cancelled: u64,
    tasks_timed_out: u64,
    total_execution: Duration,
    peak_memory_bytes: u64,
    workers: HashMap<String, WorkerStats>,
    queue_depth_history: VecDeque<(Instant, usize)>,
    throughput_history: VecDeque<(Instant, f64)>,
    last_tick: Option<Instant>,
    last_tick_count: u64,
}

struct MemoryProbe {
    sys: System,
    pid: Option<sysinfo::Pid>,
    last_refresh: Option<Instant>,
    cached: u64,
}

impl MemoryProbe {
    fn new() -> Self {
        Self {
            sys: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            last_refresh: None,
            cached: 0,
        }
    }

    /// Current process RSS in bytes, refreshed at most once per second.
    /// Best effort: returns the last reading (or 0) when the platform
    /// refuses to cooperate.
    fn sample(&mut self) -> u64 {
        let Some(pid) = self.pid else { return 0 };
        let stale = self
            .last_refresh
            .map_or(true, |t| t.elapsed() >= PROBE_REFRESH);
        if stale && self.sys.refresh_process(pid) {
            if let Some(process) = self.sys.process(pid) {
                self.cached = process.memory();
            }
            self.last_refresh = Some(Instant::now());
        }
        self.cached
    }
}

/// Aggregates throughput/latency/memory statistics for the engine.
pub struct PerformanceMonitor {
    started_at: Instant,
    state: Mutex<MonitorState>,
    probe: Mutex<MemoryProbe>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            state: Mutex::new(MonitorState::default()),
            probe: Mutex::new(MemoryProbe::new()),
        }
    }

    /// Best-effort process memory reading, used to stamp task results.
    pub fn probe_memory(&self) -> u64 {
        self.probe.lock().expect("memory probe lock poisoned").sample()
    }

    /// Record one terminal task result attributed to `worker`.
    pub fn record_completion(&self, worker: &str, result: &TaskResult) {
        let mut state = self.state.lock().expect("monitor lock poisoned");
        state.tasks_processed += 1;
        match result.status {
            TaskStatus::Completed => state.tasks_completed += 1,
            TaskStatus::Failed => state.tasks_failed += 1,
            TaskStatus::Cancelled => state.tasks_cancelled += 1,
            TaskStatus::Timeout => state.tasks_timed_out += 1,
            TaskStatus::Pending | TaskStatus::Running => {}
        }
        state.total_execution += result.execution_time;
        if result.memory_bytes > state.peak_memory_bytes {
            state.peak_memory_bytes = result.memory_bytes;
        }

        let stats = state.workers.entry(worker.to_string()).or_default();
        stats.tasks_processed += 1;
        stats.busy_ms += result.execution_time.as_millis() as u64;
        stats.last_active = Some(Instant::now());
        stats.active = true;
    }

    /// Periodic sample from the monitoring loop: queue depth, throughput
    /// over the window since the last tick, and worker idle marking.
    pub fn tick(&self, queue_depth: usize) {
        let now = Instant::now();
        let mut state = self.state.lock().expect("monitor lock poisoned");

        state.queue_depth_history.push_back((now, queue_depth));
        if state.queue_depth_history.len() > HISTORY_SAMPLES {
            state.queue_depth_history.pop_front();
        }

        if let Some(last) = state.last_tick {
            let elapsed = now.duration_since(last).as_secs_f64();
            if elapsed > 0.0 {
                let delta = state.tasks_processed - state.last_tick_count;
                let throughput = delta as f64 / elapsed;
                state.throughput_history.push_back((now, throughput));
                if state.throughput_history.len() > HISTORY_SAMPLES {
                    state.throughput_history.pop_front();
                }
                trace!(throughput, queue_depth, "monitor tick");
            }
        }
        state.last_tick = Some(now);
        state.last_tick_count = state.tasks_processed;

        for stats in state.workers.values_mut() {
            stats.active = stats
                .last_active
                .map_or(true, |t| now.duration_since(t) < IDLE_AFTER);
        }
    }

    /// Build a snapshot. Queue depth and running-task count are owned by
    /// the engine and passed in.
    pub fn snapshot(&self, queue_depth: usize, running_tasks: usize) -> MetricsSnapshot {
        let state = self.state.lock().expect("monitor lock poisoned");
        let uptime = self.started_at.elapsed().as_secs_f64();
        let processed = state.tasks_processed;

        let success_rate = if processed > 0 {
            state.tasks_completed as f64 / processed as f64 * 100.0
        } else {
            0.0
        };
        let average_execution_ms = if processed > 0 {
            state.total_execution.as_secs_f64() * 1000.0 / processed as f64
        } else {
            0.0
        };
        let current_throughput = state
            .throughput_history
            .back()
            .map_or(0.0, |(_, tps)| *tps);

        MetricsSnapshot {
            uptime_seconds: uptime,
            tasks_processed: processed,
            tasks_completed: state.tasks_completed,
            tasks_failed: state.tasks_failed,
            tasks_cancelled: state.tasks_cancelled,
            tasks_timed_out: state.tasks_timed_out,
            success_rate,
            tasks_per_second: processed as f64 / uptime.max(f64::EPSILON),
            current_throughput,
            average_execution_ms,
            peak_memory_bytes: state.peak_memory_bytes,
            queue_depth,
            running_tasks,
            workers: state.workers.clone(),
        }
    }
}
