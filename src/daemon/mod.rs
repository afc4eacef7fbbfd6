//! Backup daemon
//!
//! This module handles:
//! - Claiming the single-instance lock before anything else runs
//! - Ticking the snapshot pass on a fixed interval
//! - Early passes when the filesystem reports a turn or order file change
//! - Daily log retention
//! - Stopping at the next loop boundary once the shutdown future resolves
pub mod lock;

use anyhow::Result;
use notify::{Event as NotifyEvent, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::{interval, MissedTickBehavior};

use crate::context::{AppContext, DataPaths};
use crate::hash::{FileSet, RESERVED_FOLDER};
use crate::snapshots::{self, PassReport};
use crate::state::HashStore;
use lock::{InstanceLock, LockError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Running,
    Stopping,
}

/// Result of trying to become the running daemon.
#[derive(Debug)]
pub enum Claim {
    Acquired(InstanceLock),
    /// Another instance holds the lock. A normal exit, not an error.
    AlreadyRunning { pid: Option<u32> },
}

pub fn claim(paths: &DataPaths) -> Result<Claim> {
    match InstanceLock::acquire(&paths.lock) {
        Ok(lock) => Ok(Claim::Acquired(lock)),
        Err(LockError::AlreadyRunning { pid }) => Ok(Claim::AlreadyRunning { pid }),
        Err(e) => Err(e.into()),
    }
}

pub struct Daemon<'a> {
    ctx: &'a AppContext,
    store: HashStore,
    state: DaemonState,
    _lock: InstanceLock,
}

impl<'a> Daemon<'a> {
    pub fn new(ctx: &'a AppContext, lock: InstanceLock) -> Self {
        let store = HashStore::load(&ctx.paths.hash_state, &ctx.logger);
        Daemon {
            ctx,
            store,
            state: DaemonState::Starting,
            _lock: lock,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn store(&self) -> &HashStore {
        &self.store
    }

    /// Run until `shutdown` resolves. The first pass and the first log trim
    /// happen immediately.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let settings = self.ctx.settings.clone();
        self.state = DaemonState::Running;
        self.ctx.logger.log("DomFrog daemon started.");
        if !self.ctx.engine_enabled() {
            self.ctx.logger.log("Backup engine disabled, running heartbeat only");
        }

        let mut ticker = interval(settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention = interval(settings.retention_check);
        retention.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (tx, mut events) = unbounded_channel();
        let watcher = if settings.watch_events && self.ctx.engine_enabled() {
            self.watch_source(tx)
        } else {
            None
        };

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.tick(),
                _ = retention.tick() => self.trim_log(),
                Some(path) = events.recv(), if watcher.is_some() => {
                    tokio::time::sleep(settings.debounce).await;
                    while events.try_recv().is_ok() {}
                    self.ctx.logger.log(&format!("Change detected: {}", path.display()));
                    self.pass();
                    ticker.reset();
                }
            }
        }

        drop(watcher);
        self.state = DaemonState::Stopping;
        self.ctx.logger.log("DomFrog daemon stopping.");
        Ok(())
    }

    fn tick(&mut self) {
        self.ctx.logger.log("Daemon heartbeat...");
        if self.ctx.engine_enabled() {
            self.pass();
        }
    }

    fn pass(&mut self) -> Option<PassReport> {
        let config = self.ctx.config.as_ref()?;
        let report = snapshots::run_pass(self.ctx, config, &mut self.store);
        log_report(self.ctx, &report);
        Some(report)
    }

    fn trim_log(&self) {
        match self.ctx.logger.trim(self.ctx.settings.retention_age) {
            Ok(report) if report.dropped > 0 => self.ctx.logger.log(&format!(
                "Log trimmed: dropped {} entries, kept {}",
                report.dropped, report.kept
            )),
            Ok(_) => {}
            Err(e) => self.ctx.logger.log(&format!("Failed to trim log: {:#}", e)),
        }
    }

    // Events only wake the loop early; the pass still decides by fingerprint.
    fn watch_source(&self, tx: UnboundedSender<PathBuf>) -> Option<RecommendedWatcher> {
        let config = self.ctx.config.as_ref()?;

        let watcher = notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                if event.kind.is_access() {
                    return;
                }
                for path in event.paths {
                    if is_tracked_path(&path) {
                        let _ = tx.send(path);
                    }
                }
            }
        });

        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(e) => {
                self.ctx.logger.log(&format!("File watching unavailable, polling only: {}", e));
                return None;
            }
        };

        if let Err(e) = watcher.watch(&config.source, RecursiveMode::Recursive) {
            self.ctx.logger.log(&format!(
                "Failed to watch {}, polling only: {}",
                config.source.display(),
                e
            ));
            return None;
        }

        Some(watcher)
    }
}

/// Single pass outside the loop. `None` when the engine is off.
pub fn run_once(ctx: &AppContext) -> Option<PassReport> {
    if !ctx.engine_enabled() {
        ctx.logger.log("Backup engine disabled (Mode is not 1), nothing to do");
        return None;
    }
    let config = ctx.config.as_ref()?;
    let mut store = HashStore::load(&ctx.paths.hash_state, &ctx.logger);
    let report = snapshots::run_pass(ctx, config, &mut store);
    log_report(ctx, &report);
    Some(report)
}

fn log_report(ctx: &AppContext, report: &PassReport) {
    if report.skipped || (report.folders_changed == 0 && report.folders_failed == 0 && report.files_failed == 0) {
        return;
    }
    ctx.logger.log(&format!(
        "Pass complete: {} folders, {} changed, {} snapshots, {} folders failed, {} files failed",
        report.folders_scanned,
        report.folders_changed,
        report.snapshots_created,
        report.folders_failed,
        report.files_failed
    ));
}

/// A turn or order file inside a game folder.
fn is_tracked_path(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let in_reserved = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|p| p == RESERVED_FOLDER)
        .unwrap_or(false);

    !in_reserved && (FileSet::turn_files().matches_name(name) || FileSet::pending_files().matches_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp_dir: TempDir,
        data: PathBuf,
        source: PathBuf,
        destination: PathBuf,
    }

    fn fixture(mode: &str) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let data = temp_dir.path().join("data");
        let source = temp_dir.path().join("savedgames");
        let destination = temp_dir.path().join("backup");
        fs::create_dir_all(&data).unwrap();
        fs::create_dir_all(source.join("Arco")).unwrap();
        fs::create_dir_all(&destination).unwrap();
        fs::write(source.join("Arco").join("game.trn"), b"A").unwrap();
        fs::write(source.join("Arco").join("game.2h"), b"B").unwrap();
        fs::write(
            data.join(crate::cfg::CONFIG_FILE),
            format!(
                "[BackupConfig]\nMode={}\nDestination={}\nSource={}\nWatchEvents=0\n",
                mode,
                destination.display(),
                source.display()
            ),
        )
        .unwrap();

        Fixture {
            _temp_dir: temp_dir,
            data,
            source,
            destination,
        }
    }

    fn context(fx: &Fixture) -> AppContext {
        let mut ctx = AppContext::open(&fx.data).unwrap();
        ctx.settings.tick = Duration::from_millis(50);
        ctx
    }

    fn acquire(ctx: &AppContext) -> InstanceLock {
        match claim(&ctx.paths).unwrap() {
            Claim::Acquired(lock) => lock,
            Claim::AlreadyRunning { .. } => panic!("lock unexpectedly held"),
        }
    }

    #[tokio::test]
    async fn test_loop_snapshots_and_stops() {
        let fx = fixture("1");
        let ctx = context(&fx);
        let mut daemon = Daemon::new(&ctx, acquire(&ctx));
        assert_eq!(daemon.state(), DaemonState::Starting);

        daemon
            .run(tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();

        assert_eq!(daemon.state(), DaemonState::Stopping);
        assert!(fx.destination.join("Arco").join("Turn1_0").join("game.trn").exists());
        assert!(!fx.destination.join("Arco").join("Turn1_1").exists());
        assert_eq!(daemon.store().get("Arco").unwrap().turn_number, 1);

        let log = fs::read_to_string(&ctx.paths.log).unwrap();
        assert!(log.contains("DomFrog daemon started."));
        assert!(log.contains("Daemon heartbeat..."));
        assert!(log.contains("DomFrog daemon stopping."));
    }

    #[tokio::test]
    async fn test_file_change_triggers_early_pass() {
        let fx = fixture("1");
        let mut ctx = context(&fx);
        ctx.settings.tick = Duration::from_secs(60);
        ctx.settings.debounce = Duration::from_millis(100);
        ctx.settings.watch_events = true;
        let mut daemon = Daemon::new(&ctx, acquire(&ctx));

        let orders = fx.source.join("Arco").join("game.2h");
        let edit_then_wait = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            fs::write(&orders, b"B'").unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
        };
        daemon.run(edit_then_wait).await.unwrap();

        let arco = fx.destination.join("Arco");
        assert!(arco.join("Turn1_0").exists());
        assert_eq!(fs::read(arco.join("Turn1_1").join("game.2h")).unwrap(), b"B'");
        assert_eq!(daemon.store().get("Arco").unwrap().save_count, 1);

        // Only the startup tick fired; the second pass came from the event
        let log = fs::read_to_string(&ctx.paths.log).unwrap();
        assert_eq!(log.matches("Daemon heartbeat...").count(), 1);
        assert!(log.contains("Change detected:"));
    }

    #[tokio::test]
    async fn test_disabled_mode_only_heartbeats() {
        let fx = fixture("3");
        let ctx = context(&fx);
        let mut daemon = Daemon::new(&ctx, acquire(&ctx));

        daemon
            .run(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        assert!(!fx.destination.join("Arco").exists());
        assert!(!ctx.paths.hash_state.exists());
        let log = fs::read_to_string(&ctx.paths.log).unwrap();
        assert!(log.contains("Daemon heartbeat..."));
        assert!(log.contains("Backup engine disabled"));
    }

    #[tokio::test]
    async fn test_second_claim_refused_while_running() {
        let fx = fixture("1");
        let ctx = context(&fx);
        let _lock = acquire(&ctx);

        match claim(&ctx.paths).unwrap() {
            Claim::AlreadyRunning { pid } => assert_eq!(pid, Some(std::process::id())),
            Claim::Acquired(_) => panic!("second instance must not start"),
        }
    }

    #[test]
    fn test_run_once_respects_mode() {
        let fx = fixture("3");
        let ctx = context(&fx);
        assert!(run_once(&ctx).is_none());

        let fx = fixture("1");
        let ctx = context(&fx);
        let report = run_once(&ctx).unwrap();
        assert_eq!(report.snapshots_created, 1);
        assert!(report.persisted);
        assert!(fx.source.join("Arco").exists());
    }

    #[test]
    fn test_is_tracked_path() {
        assert!(is_tracked_path(Path::new("/games/Arco/early_arco.trn")));
        assert!(is_tracked_path(Path::new("/games/Arco/early_arco.2h")));
        assert!(!is_tracked_path(Path::new("/games/Arco/ftherlnd")));
        assert!(!is_tracked_path(Path::new("/games/newlords/god.trn")));
    }
}
