//! Process-wide handles, built once at startup and passed by reference.

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cfg::{self, Config, CONFIG_FILE};
use crate::daemon::lock::LOCK_FILE;
use crate::logger::{Logger, LOG_FILE};
use crate::state::HASH_FILE;

const DEFAULT_DEBOUNCE_MS: u64 = 1500;
const RETENTION_CHECK_HOURS: u64 = 24;

/// Well-known files inside the data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
    pub config: PathBuf,
    pub hash_state: PathBuf,
    pub log: PathBuf,
    pub lock: PathBuf,
}

impl DataPaths {
    pub fn new(root: &Path) -> Self {
        DataPaths {
            root: root.to_path_buf(),
            config: root.join(CONFIG_FILE),
            hash_state: root.join(HASH_FILE),
            log: root.join(LOG_FILE),
            lock: root.join(LOCK_FILE),
        }
    }
}

/// Daemon timing, derived from the config or its defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub tick: Duration,
    pub retention_check: Duration,
    pub retention_age: ChronoDuration,
    pub debounce: Duration,
    pub watch_events: bool,
}

impl Settings {
    pub fn from_config(config: Option<&Config>) -> Self {
        let mut settings = Settings::default();
        if let Some(config) = config {
            settings.tick = Duration::from_secs(config.tick_seconds);
            settings.retention_age = ChronoDuration::days(config.log_retention_days);
            settings.watch_events = config.watch_events;
        }
        settings
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            tick: Duration::from_secs(10),
            retention_check: Duration::from_secs(RETENTION_CHECK_HOURS * 60 * 60),
            retention_age: ChronoDuration::days(30),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            watch_events: true,
        }
    }
}

pub struct AppContext {
    pub paths: DataPaths,
    /// `None` when the config could not be loaded; the daemon then only
    /// heartbeats.
    pub config: Option<Config>,
    pub logger: Logger,
    pub settings: Settings,
}

impl AppContext {
    /// Open the log and load the config. Only the log is fatal: a bad config
    /// is logged and leaves the engine off.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let paths = DataPaths::new(data_dir);
        let logger = Logger::open(&paths.log)?;

        let config = match cfg::load(&paths.config) {
            Ok(config) => {
                logger.log(&format!(
                    "Config loaded: Mode={}, Destination={}, Source={}",
                    config.mode,
                    config.destination.display(),
                    config.source.display()
                ));
                Some(config)
            }
            Err(e) => {
                logger.log(&format!("Failed to read config: {:#}", e));
                None
            }
        };

        let settings = Settings::from_config(config.as_ref());

        Ok(AppContext {
            paths,
            config,
            logger,
            settings,
        })
    }

    pub fn engine_enabled(&self) -> bool {
        self.config.as_ref().map(Config::engine_enabled).unwrap_or(false)
    }
}
