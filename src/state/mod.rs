use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::logger::Logger;

pub const HASH_FILE: &str = "hash.json";

/// Last observed version of one watched folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintState {
    #[serde(default)]
    pub turn_number: u32,
    #[serde(default)]
    pub save_count: u32,
    #[serde(default)]
    pub trn_fingerprint: u64,
    #[serde(default)]
    pub two_h_fingerprint: u64,
}

/// Folder name to [`FingerprintState`], kept sorted so the file is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashStore {
    entries: BTreeMap<String, FingerprintState>,
}

impl HashStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the store, never failing: a missing or unreadable file gives an
    /// empty store, and entries that do not decode are dropped individually.
    pub fn load(path: &Path, logger: &Logger) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                logger.log(&format!("No hash state at {}, starting fresh", path.display()));
                return Self::new();
            }
            Err(e) => {
                logger.log(&format!("Failed to read hash state {}: {}", path.display(), e));
                return Self::new();
            }
        };

        let raw: BTreeMap<String, serde_json::Value> = match serde_json::from_str(&content) {
            Ok(raw) => raw,
            Err(e) => {
                logger.log(&format!(
                    "Hash state {} is corrupt ({}), treating all folders as new",
                    path.display(),
                    e
                ));
                return Self::new();
            }
        };

        let mut store = Self::new();
        for (name, value) in raw {
            match serde_json::from_value::<FingerprintState>(value) {
                Ok(state) => {
                    store.entries.insert(name, state);
                }
                Err(e) => {
                    logger.log(&format!("Dropping unreadable hash entry '{}': {}", name, e));
                }
            }
        }

        store
    }

    /// Strict read for reporting: a missing file is empty, anything that does
    /// not parse is an error.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read hash state from {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse hash state JSON")
    }

    /// Write through a temporary file in the same directory and rename it
    /// into place, so readers never see a half-written file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_json()?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory {}", dir.display()))?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .context("Failed to create temporary hash state file")?;
        temp.write_all(content.as_bytes())?;
        temp.flush()?;
        temp.as_file().sync_all()?;
        temp.persist(path)
            .with_context(|| format!("Failed to write hash state to {}", path.display()))?;

        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize hash state")
    }

    pub fn get(&self, name: &str) -> Option<&FingerprintState> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, name: &str, state: FingerprintState) {
        self.entries.insert(name.to_string(), state);
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &FingerprintState)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn logger(temp_dir: &TempDir) -> Logger {
        Logger::open(&temp_dir.path().join("test.log")).unwrap()
    }

    fn sample() -> FingerprintState {
        FingerprintState {
            turn_number: 2,
            save_count: 1,
            trn_fingerprint: u64::MAX,
            two_h_fingerprint: 42,
        }
    }

    #[test]
    fn test_save_then_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HASH_FILE);

        let mut store = HashStore::new();
        store.insert("Ulm", sample());
        store.insert("Arco", FingerprintState::default());
        store.save(&path).unwrap();

        let loaded = HashStore::load(&path, &logger(&temp_dir));
        assert_eq!(loaded, store);
        assert_eq!(loaded.get("Ulm"), Some(&sample()));
    }

    #[test]
    fn test_file_uses_camel_case_keys_in_name_order() {
        let mut store = HashStore::new();
        store.insert("Ulm", sample());
        store.insert("Arco", sample());

        let json = store.to_json().unwrap();
        assert!(json.contains("\"turnNumber\": 2"));
        assert!(json.contains("\"twoHFingerprint\": 42"));
        assert!(json.contains("\"trnFingerprint\": 18446744073709551615"));
        assert!(json.find("Arco").unwrap() < json.find("Ulm").unwrap());
    }

    #[test]
    fn test_strict_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HASH_FILE);
        assert!(HashStore::read(&path).unwrap().is_empty());

        fs::write(&path, "[]").unwrap();
        assert!(HashStore::read(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = HashStore::load(&temp_dir.path().join(HASH_FILE), &logger(&temp_dir));
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_empty_and_logged() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HASH_FILE);
        fs::write(&path, "{ not json").unwrap();

        let log = logger(&temp_dir);
        let store = HashStore::load(&path, &log);

        assert!(store.is_empty());
        let log_content = fs::read_to_string(log.path()).unwrap();
        assert!(log_content.contains("corrupt"));
    }

    #[test]
    fn test_bad_entries_dropped_individually() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HASH_FILE);
        fs::write(
            &path,
            r#"{
  "Arco": {"turnNumber": 3, "saveCount": 2, "trnFingerprint": 7, "twoHFingerprint": 8},
  "Legacy": 1234567,
  "Partial": {"turnNumber": 5}
}"#,
        )
        .unwrap();

        let store = HashStore::load(&path, &logger(&temp_dir));

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("Arco").unwrap().save_count, 2);
        assert!(store.get("Legacy").is_none());
        assert_eq!(
            store.get("Partial"),
            Some(&FingerprintState {
                turn_number: 5,
                ..Default::default()
            })
        );
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HASH_FILE);
        let mut store = HashStore::new();
        store.insert("Arco", sample());
        store.save(&path).unwrap();
        store.save(&path).unwrap();

        let names: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![HASH_FILE.to_string()]);
    }
}
