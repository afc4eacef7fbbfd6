//! Content fingerprints for watched game folders.
//!
//! A folder has two fingerprints: one over its turn files (`*.trn`) and one
//! over its pending orders (`*.2h`). Both are computed from file bytes, never
//! from size or mtime, so an edit that keeps both intact is still seen.

use anyhow::{Context, Result};
use blake3::Hasher;
use glob::Pattern;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// Folder under `savedgames` holding designed pretenders, not a game.
pub const RESERVED_FOLDER: &str = "newlords";

pub const TURN_PATTERNS: &[&str] = &["*.trn"];
pub const PENDING_PATTERNS: &[&str] = &["*.2h"];
/// Maps, map images and mods: copied as-is, never fingerprinted.
pub const STATIC_PATTERNS: &[&str] = &["*.map", "*.tga", "*.d6m", "*.rgb", "*.dm"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFolder {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprints {
    pub trn: u64,
    pub two_h: u64,
}

/// Compiled set of file-name globs.
#[derive(Debug, Clone)]
pub struct FileSet {
    patterns: Vec<Pattern>,
}

impl FileSet {
    pub fn new(patterns: &[&str]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p).with_context(|| format!("Invalid glob pattern: {}", p)))
            .collect::<Result<Vec<_>>>()?;
        Ok(FileSet { patterns })
    }

    pub fn turn_files() -> Self {
        Self::new(TURN_PATTERNS).expect("built-in turn patterns are valid")
    }

    pub fn pending_files() -> Self {
        Self::new(PENDING_PATTERNS).expect("built-in pending patterns are valid")
    }

    pub fn static_files() -> Self {
        Self::new(STATIC_PATTERNS).expect("built-in static patterns are valid")
    }

    pub fn matches_name(&self, file_name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(file_name))
    }

    /// Top-level regular files in `dir` whose name matches, sorted by name.
    pub fn matching_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in fs::read_dir(dir)
            .with_context(|| format!("Failed to read folder {}", dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(name) = name.to_str() {
                if self.matches_name(name) {
                    files.push(entry.path());
                }
            }
        }

        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }
}

/// Game folders under `source`, sorted by name, without the reserved folder.
pub fn list_watched_folders(source: &Path) -> Result<Vec<WatchedFolder>> {
    let mut folders = Vec::new();

    for entry in fs::read_dir(source)
        .with_context(|| format!("Failed to read source folder {}", source.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == RESERVED_FOLDER {
            continue;
        }
        folders.push(WatchedFolder {
            name,
            path: entry.path(),
        });
    }

    folders.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(folders)
}

pub fn fingerprint_folder(folder: &WatchedFolder) -> Result<Fingerprints> {
    let turn_files = FileSet::turn_files().matching_files(&folder.path)?;
    let pending_files = FileSet::pending_files().matching_files(&folder.path)?;

    Ok(Fingerprints {
        trn: fingerprint_files(&turn_files)?,
        two_h: fingerprint_files(&pending_files)?,
    })
}

/// Fold name, length and bytes of each file into one digest, in the given
/// order. Callers pass name-sorted paths.
pub fn fingerprint_files(paths: &[PathBuf]) -> Result<u64> {
    let mut hasher = Hasher::new();

    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        hasher.update(name.as_bytes());
        hasher.update(&[0]);

        let file = File::open(path)
            .with_context(|| format!("Failed to open file: {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("Failed to get metadata for: {}", path.display()))?
            .len();
        hasher.update(&len.to_le_bytes());

        let mut reader = BufReader::new(file);
        let mut buffer = [0; 8192];
        loop {
            let bytes_read = reader
                .read(&mut buffer)
                .with_context(|| format!("Failed to read file: {}", path.display()))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
    }

    Ok(digest_to_u64(hasher.finalize()))
}

/// Fingerprint of a folder with no matching files.
pub fn empty_fingerprint() -> u64 {
    digest_to_u64(Hasher::new().finalize())
}

fn digest_to_u64(hash: blake3::Hash) -> u64 {
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(head)
}
