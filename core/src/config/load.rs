use std::path::Path;

use super::types::SchedulerConfig;

/// Load configuration from an explicit TOML file.
pub fn load_from_path(path: impl AsRef<Path>) -> anyhow::Result<SchedulerConfig> {
    let s = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<SchedulerConfig>(&s)?;
    Ok(cfg)
}

/// Load configuration with the default precedence:
/// `./dagpool.toml` if present, otherwise built-in defaults.
pub fn load_default() -> anyhow::Result<SchedulerConfig> {
    let local = Path::new("dagpool.toml");
    if local.exists() {
        load_from_path(local)
    } else {
        Ok(SchedulerConfig::default())
    }
}
