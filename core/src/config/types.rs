use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration. Every recognized field has an explicit default so
/// a partial TOML file (or none at all) yields a working engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of concurrent worker loops. 0 = number of logical CPUs.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bounded capacity of the ready-task priority queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long `submit_task` may block waiting for queue capacity before
    /// failing. Unset = block until space frees up.
    #[serde(default)]
    pub submit_wait_ms: Option<u64>,

    /// How many terminal tasks to retain before the oldest are evicted.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Retry budget applied by `Scheduler::task` builders.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Timeout applied by `Scheduler::task` builders. Unset = no timeout.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,

    #[serde(default)]
    pub executors: ExecutorConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_workers() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_history_limit() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            submit_wait_ms: None,
            history_limit: default_history_limit(),
            default_max_retries: default_max_retries(),
            default_timeout_ms: None,
            executors: ExecutorConfig::default(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve worker loop count (0 means use the logical CPU count).
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn submit_wait(&self) -> Option<Duration> {
        self.submit_wait_ms.map(Duration::from_millis)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

/// Sizing for the two offload executors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Threads in the io pool (io-bound / memory-intensive tasks).
    #[serde(default = "default_io_threads")]
    pub io_threads: usize,

    /// Threads in the compute pool (cpu-intensive tasks).
    #[serde(default = "default_compute_threads")]
    pub compute_threads: usize,
}

fn default_io_threads() -> usize {
    5
}

fn default_compute_threads() -> usize {
    2
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            io_threads: default_io_threads(),
            compute_threads: default_compute_threads(),
        }
    }
}

/// Performance-monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_enabled")]
    pub enabled: bool,

    /// Sampling interval of the monitoring loop.
    #[serde(default = "default_monitor_interval_ms")]
    pub interval_ms: u64,
}

fn default_monitor_enabled() -> bool {
    true
}

fn default_monitor_interval_ms() -> u64 {
    5000
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitor_enabled(),
            interval_ms: default_monitor_interval_ms(),
        }
    }
}

impl MonitorConfig {
    /// Sampling interval, clamped away from zero (a zero-period ticker is
    /// never what anyone meant).
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Logging configuration, consumed by the binary's tracing setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,

    /// If true, log to stderr.
    #[serde(default = "default_logging_console")]
    pub console: bool,

    /// If true, log to a file under `directory`.
    #[serde(default)]
    pub file: bool,

    /// EnvFilter string, e.g. "info" or "dagpool_core=debug".
    #[serde(default = "default_logging_level")]
    pub level: String,

    /// Directory for log files. If unset, uses the OS temp dir.
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_logging_enabled() -> bool {
    true
}

fn default_logging_console() -> bool {
    true
}

fn default_logging_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            console: default_logging_console(),
            file: false,
            level: default_logging_level(),
            directory: None,
        }
    }
}
