//! Versioned snapshots of game folders.
//!
//! A pass fingerprints every watched folder, decides whether it moved to a new
//! turn or a new save, and copies the turn and order files into
//! `<Destination>/<Folder>/Turn<turn>_<save>/`. Snapshots are never touched
//! again once written.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cfg::Config;
use crate::context::AppContext;
use crate::hash::{self, FileSet, Fingerprints, WatchedFolder};
use crate::state::{FingerprintState, HashStore};

/// Result of comparing stored and fresh fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    /// The turn file changed. Always wins over a save change.
    NewTurn(FingerprintState),
    /// Only the pending orders changed.
    NewSave(FingerprintState),
}

impl Transition {
    pub fn next_state(&self) -> Option<FingerprintState> {
        match self {
            Transition::Unchanged => None,
            Transition::NewTurn(state) | Transition::NewSave(state) => Some(*state),
        }
    }
}

/// What happened to one folder during a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderOutcome {
    /// The stored state moved to a new turn or save.
    pub changed: bool,
    pub snapshot: Option<PathBuf>,
    pub files_copied: usize,
    pub static_copied: usize,
    pub files_failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// The pass did not run because Source or Destination was unusable.
    pub skipped: bool,
    pub folders_scanned: usize,
    pub snapshots_created: usize,
    pub folders_changed: usize,
    pub folders_failed: usize,
    pub files_failed: usize,
    pub persisted: bool,
}

/// Counters that would overflow restart numbering from a first observation.
pub fn decide(stored: &FingerprintState, fresh: &Fingerprints) -> Transition {
    if fresh.trn != stored.trn_fingerprint {
        match stored.turn_number.checked_add(1) {
            Some(turn_number) => Transition::NewTurn(FingerprintState {
                turn_number,
                save_count: 0,
                trn_fingerprint: fresh.trn,
                two_h_fingerprint: fresh.two_h,
            }),
            None => first_observation(fresh),
        }
    } else if fresh.two_h != stored.two_h_fingerprint {
        match stored.save_count.checked_add(1) {
            Some(save_count) => Transition::NewSave(FingerprintState {
                save_count,
                two_h_fingerprint: fresh.two_h,
                ..*stored
            }),
            None => first_observation(fresh),
        }
    } else {
        Transition::Unchanged
    }
}

fn first_observation(fresh: &Fingerprints) -> Transition {
    Transition::NewTurn(FingerprintState {
        turn_number: 1,
        save_count: 0,
        trn_fingerprint: fresh.trn,
        two_h_fingerprint: fresh.two_h,
    })
}

pub fn snapshot_dir_name(state: &FingerprintState) -> String {
    format!("Turn{}_{}", state.turn_number, state.save_count)
}

/// Run one pass over every watched folder and persist the store if any
/// folder changed. Errors are logged here and never returned.
pub fn run_pass(ctx: &AppContext, config: &Config, store: &mut HashStore) -> PassReport {
    let mut report = PassReport::default();
    let logger = &ctx.logger;

    if !config.destination.is_dir() {
        logger.log(&format!(
            "Destination folder does not exist: {}",
            config.destination.display()
        ));
        report.skipped = true;
        return report;
    }

    let folders = match hash::list_watched_folders(&config.source) {
        Ok(folders) => folders,
        Err(e) => {
            logger.log(&format!("Failed to read source folder: {:#}", e));
            report.skipped = true;
            return report;
        }
    };

    for folder in &folders {
        report.folders_scanned += 1;
        match process_folder(ctx, config, folder, store) {
            Ok(outcome) => {
                if outcome.changed {
                    report.folders_changed += 1;
                }
                if outcome.snapshot.is_some() {
                    report.snapshots_created += 1;
                }
                report.files_failed += outcome.files_failed;
            }
            Err(e) => {
                report.folders_failed += 1;
                logger.log(&format!("Skipping {}: {:#}", folder.name, e));
            }
        }
    }

    if report.folders_changed > 0 {
        match store.save(&ctx.paths.hash_state) {
            Ok(()) => report.persisted = true,
            Err(e) => logger.log(&format!("Failed to save hash state: {:#}", e)),
        }
    }

    report
}

/// Fingerprint one folder, snapshot it on change and refresh static assets.
/// Returns an error, leaving the stored state alone, when the folder could not
/// be fingerprinted or its backup folders could not be created.
pub fn process_folder(
    ctx: &AppContext,
    config: &Config,
    folder: &WatchedFolder,
    store: &mut HashStore,
) -> Result<FolderOutcome> {
    let logger = &ctx.logger;
    let fresh = hash::fingerprint_folder(folder)?;
    let stored = store.get(&folder.name).copied().unwrap_or_default();

    let backup_root = config.destination.join(&folder.name);
    fs::create_dir_all(&backup_root)
        .with_context(|| format!("Failed to create {}", backup_root.display()))?;

    let mut outcome = FolderOutcome::default();
    let transition = decide(&stored, &fresh);

    if let Some(next) = transition.next_state() {
        if (next.turn_number, next.save_count) < (stored.turn_number, stored.save_count) {
            logger.log(&format!(
                "{}: stored Turn{}_{} is out of range, restarting numbering",
                folder.name, stored.turn_number, stored.save_count
            ));
        }
        let files = snapshot_files(&folder.path)?;
        let snapshot_dir = backup_root.join(snapshot_dir_name(&next));
        let kind = match transition {
            Transition::NewTurn(_) => "new turn",
            _ => "new save",
        };

        if snapshot_dir.exists() {
            logger.log(&format!(
                "{}: {} but {} already exists, leaving it untouched",
                folder.name,
                kind,
                snapshot_dir.display()
            ));
        } else {
            fs::create_dir_all(&snapshot_dir)
                .with_context(|| format!("Failed to create {}", snapshot_dir.display()))?;
            let (copied, failed) = copy_files(ctx, &files, &snapshot_dir);
            outcome.files_copied = copied;
            outcome.files_failed += failed;
            logger.log(&format!(
                "{}: {} → {} ({} files)",
                folder.name,
                kind,
                snapshot_dir.display(),
                copied
            ));
            outcome.snapshot = Some(snapshot_dir);
        }

        store.insert(&folder.name, next);
        outcome.changed = true;
    }

    match FileSet::static_files().matching_files(&folder.path) {
        Ok(static_files) => {
            let (copied, failed) = copy_files(ctx, &static_files, &backup_root);
            outcome.static_copied = copied;
            outcome.files_failed += failed;
        }
        Err(e) => {
            outcome.files_failed += 1;
            logger.log(&format!("{}: failed to list static files: {:#}", folder.name, e));
        }
    }

    Ok(outcome)
}

fn snapshot_files(folder: &Path) -> Result<Vec<PathBuf>> {
    let mut files = FileSet::turn_files().matching_files(folder)?;
    files.extend(FileSet::pending_files().matching_files(folder)?);
    Ok(files)
}

/// Copy each file into `target_dir`, logging failures. Returns
/// `(copied, failed)`.
fn copy_files(ctx: &AppContext, files: &[PathBuf], target_dir: &Path) -> (usize, usize) {
    let mut copied = 0;
    let mut failed = 0;

    for source in files {
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = target_dir.join(name);
        match copy_file_with_mtime(source, &target) {
            Ok(()) => copied += 1,
            Err(e) => {
                failed += 1;
                ctx.logger.log(&format!("Failed to copy {}: {:#}", source.display(), e));
            }
        }
    }

    (copied, failed)
}

fn copy_file_with_mtime(source: &Path, target: &Path) -> Result<()> {
    fs::copy(source, target)
        .with_context(|| format!("Failed to copy {} to {}", source.display(), target.display()))?;

    // Best effort, the content is what matters.
    if let Ok(metadata) = source.metadata() {
        let mtime = filetime::FileTime::from_last_modification_time(&metadata);
        let _ = filetime::set_file_mtime(target, mtime);
    }

    Ok(())
}

/// An existing `Turn<t>_<s>` folder in the backup tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub turn_number: u32,
    pub save_count: u32,
    pub path: PathBuf,
    pub file_count: usize,
    pub size_bytes: u64,
}

pub fn parse_snapshot_dir_name(name: &str) -> Option<(u32, u32)> {
    let (turn, save) = name.strip_prefix("Turn")?.split_once('_')?;
    Some((turn.parse().ok()?, save.parse().ok()?))
}

/// Snapshots of one folder, oldest first. A missing backup folder is empty.
pub fn list(backup_root: &Path) -> Result<Vec<SnapshotInfo>> {
    if !backup_root.exists() {
        return Ok(Vec::new());
    }

    let mut snapshots = Vec::new();

    for entry in fs::read_dir(backup_root)
        .with_context(|| format!("Failed to read {}", backup_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some((turn_number, save_count)) = name.to_str().and_then(parse_snapshot_dir_name) else {
            continue;
        };

        let mut file_count = 0;
        let mut size_bytes = 0u64;
        for file in fs::read_dir(entry.path())? {
            let file = file?;
            let metadata = file.metadata()?;
            if metadata.is_file() {
                file_count += 1;
                size_bytes += metadata.len();
            }
        }

        snapshots.push(SnapshotInfo {
            turn_number,
            save_count,
            path: entry.path(),
            file_count,
            size_bytes,
        });
    }

    snapshots.sort_by_key(|s| (s.turn_number, s.save_count));
    Ok(snapshots)
}
