use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.ini";

const ENGINE_ENABLED_MODE: &str = "1";

/// Daemon configuration, read from the `key=value` file the installer writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// `1` runs the backup engine; any other value keeps the daemon idle.
    pub mode: String,

    /// Root of the backup tree.
    pub destination: PathBuf,

    /// The game's `savedgames` directory.
    pub source: PathBuf,

    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,

    #[serde(default = "default_watch_events")]
    pub watch_events: bool,
}

impl Config {
    pub fn engine_enabled(&self) -> bool {
        self.mode == ENGINE_ENABLED_MODE
    }
}

fn default_tick_seconds() -> u64 {
    10
}

fn default_log_retention_days() -> i64 {
    30
}

fn default_watch_events() -> bool {
    true
}

pub fn load(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        anyhow::bail!(
            "Config not found at {}. Run the DomFrog installer first.",
            config_path.display()
        );
    }

    let contents = fs::read_to_string(config_path).context("Failed to read config file")?;
    parse(&contents).with_context(|| format!("Invalid config in {}", config_path.display()))
}

/// Parse INI-style `key=value` text. Section headers and comments are skipped,
/// keys are case-sensitive and the value is everything after the first `=`.
pub fn parse(contents: &str) -> Result<Config> {
    let mut values: BTreeMap<&str, &str> = BTreeMap::new();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('[') || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim(), value.trim());
        }
    }

    let required = |key: &str| -> Result<String> {
        values
            .get(key)
            .map(|v| v.to_string())
            .with_context(|| format!("Missing required key '{}'", key))
    };

    let mode = required("Mode")?;
    let destination = PathBuf::from(required("Destination")?);
    let source = PathBuf::from(required("Source")?);

    let tick_seconds = values
        .get("TickSeconds")
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs >= 1)
        .unwrap_or_else(default_tick_seconds);

    let log_retention_days = values
        .get("LogRetentionDays")
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|days| (0..=36_500).contains(days))
        .unwrap_or_else(default_log_retention_days);

    let watch_events = match values.get("WatchEvents") {
        Some(&"0") => false,
        Some(&"1") => true,
        _ => default_watch_events(),
    };

    Ok(Config {
        mode,
        destination,
        source,
        tick_seconds,
        log_retention_days,
        watch_events,
    })
}

/// Resolve the per-user data directory holding config, state, log and lock.
pub fn resolve_data_dir(override_dir: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match override_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("Failed to find the user data directory")?
            .join("DomFrog"),
    };

    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create data directory {}", dir.display()))?;

    Ok(dir)
}
