pub mod load;
pub mod types;

pub use load::{load_default, load_from_path};
pub use types::{ExecutorConfig, LoggingConfig, MonitorConfig, SchedulerConfig};
