//! Append-only daemon log with age-based retention.
//!
//! Every entry is one `[YYYY-MM-DD HH:MM:SS] message` line in local time,
//! mirrored to stdout. The file is opened in append mode per entry rather than
//! held open, so trimming can replace it with a rename without stranding a
//! handle on the old file.

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDateTime};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOG_FILE: &str = "daemon.log";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// `[` + 19 timestamp characters + `]`.
const STAMP_LEN: usize = 21;

#[derive(Debug)]
pub struct Logger {
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimReport {
    pub kept: usize,
    pub dropped: usize,
}

impl Logger {
    /// Create the log file if needed. Failing here is a fatal startup error.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }

        append_handle(path)?;

        Ok(Logger {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, message: &str) {
        let line = format_line(Local::now().naive_local(), message);
        println!("{}", line);

        if let Err(e) = self.append(&line) {
            eprintln!("Failed to write {}: {:#}", self.path.display(), e);
        }
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut file = append_handle(&self.path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        // Best effort.
        let _ = file.sync_data();
        Ok(())
    }

    /// Drop entries older than `max_age`. See [`trim_lines`] for the rules.
    pub fn trim(&self, max_age: Duration) -> Result<TrimReport> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TrimReport { kept: 0, dropped: 0 });
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()));
            }
        };

        let (trimmed, report) = trim_lines(&content, Local::now().naive_local(), max_age);
        if report.dropped == 0 {
            return Ok(report);
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .context("Failed to create temporary log file")?;
        temp.write_all(trimmed.as_bytes())?;
        temp.flush()?;
        temp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(report)
    }
}

fn append_handle(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

pub fn format_line(at: NaiveDateTime, message: &str) -> String {
    format!("[{}] {}", at.format(TIMESTAMP_FORMAT), message)
}

/// Timestamp embedded at the start of a log line, if it has one.
pub fn parse_timestamp(line: &str) -> Option<NaiveDateTime> {
    if line.len() < STAMP_LEN || !line.starts_with('[') || line.as_bytes()[STAMP_LEN - 1] != b']' {
        return None;
    }
    let stamp = line.get(1..STAMP_LEN - 1)?;
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
}

/// Keep a line when `now - timestamp <= max_age`, so an entry exactly at the
/// cutoff survives. Lines without a parseable timestamp are kept; blank lines
/// are dropped without being counted.
pub fn trim_lines(content: &str, now: NaiveDateTime, max_age: Duration) -> (String, TrimReport) {
    let mut kept = Vec::new();
    let mut dropped = 0;

    for line in content.lines().filter(|l| !l.is_empty()) {
        match parse_timestamp(line) {
            Some(ts) if now - ts > max_age => dropped += 1,
            _ => kept.push(line),
        }
    }

    let report = TrimReport {
        kept: kept.len(),
        dropped,
    };

    let mut out = kept.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    (out, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(day: u32, hour: u32, min: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(hour, min, sec)
            .unwrap()
    }

    #[test]
    fn test_format_and_parse_round_trip() {
        let line = format_line(at(5, 7, 8, 9), "Daemon heartbeat...");
        assert_eq!(line, "[2026-03-05 07:08:09] Daemon heartbeat...");
        assert_eq!(parse_timestamp(&line), Some(at(5, 7, 8, 9)));
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert_eq!(parse_timestamp("no stamp here at all, really"), None);
        assert_eq!(parse_timestamp("[2026-13-45 99:00:00] bad date"), None);
        assert_eq!(parse_timestamp("[short]"), None);
        assert_eq!(parse_timestamp("[ééééééééééééééééééé] wide"), None);
    }

    #[test]
    fn test_trim_boundary_is_inclusive() {
        let now = at(31, 12, 0, 0);
        let content = [
            format_line(at(1, 11, 59, 59), "one second too old"),
            format_line(at(1, 12, 0, 0), "exactly at cutoff"),
            format_line(at(20, 0, 0, 0), "recent"),
        ]
        .join("\n");

        let (out, report) = trim_lines(&content, now, Duration::days(30));

        assert_eq!(report, TrimReport { kept: 2, dropped: 1 });
        assert!(!out.contains("one second too old"));
        assert!(out.contains("exactly at cutoff"));
        assert!(out.contains("recent"));
    }

    #[test]
    fn test_trim_keeps_unparseable_lines() {
        let now = at(31, 0, 0, 0);
        let content = format!(
            "{}\ncontinuation without stamp\n\n{}\n",
            format_line(at(1, 0, 0, 0), "old"),
            format_line(at(30, 0, 0, 0), "new"),
        );

        let (out, report) = trim_lines(&content, now, Duration::days(7));

        assert_eq!(report.dropped, 1);
        assert_eq!(out, "continuation without stamp\n[2026-03-30 00:00:00] new\n");
    }

    #[test]
    fn test_log_appends_and_trim_rewrites_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(LOG_FILE);
        fs::write(&path, "[2001-01-01 00:00:00] ancient\n").unwrap();

        let logger = Logger::open(&path).unwrap();
        logger.log("first");
        logger.log("second");

        let report = logger.trim(Duration::days(30)).unwrap();
        assert_eq!(report, TrimReport { kept: 2, dropped: 1 });

        logger.log("after trim");
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("ancient"));
        assert!(content.contains("] first"));
        assert!(content.contains("] after trim"));
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_open_fails_when_path_is_a_directory() {
        let temp_dir = TempDir::new().unwrap();
        assert!(Logger::open(temp_dir.path()).is_err());
    }
}
