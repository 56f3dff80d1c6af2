//! Append-only JSONL writer for the activity journal.
//!
//! Each line is one self-contained JSON object, assembled in memory and
//! written with a single `write_all` so a tailing reader never sees a
//! partial line.
//!
//! Degradation chain when writes fail:
//! 1. Primary file path
//! 2. Fallback path (if configured)
//! 3. stderr with `[BRT-JOURNAL]` prefix
//! 4. Silent discard (rule mutations never fail because of the journal)

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::core::config::JournalConfig;
use crate::core::errors::{BrtError, Result};

const WRITE_BUFFER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EngineStart,
    TreeLoaded,
    TreeReplaced,
    RuleAdded,
    RulesImported,
    RuleRemoved,
    RuleUpdated,
    DirectoryClaimed,
    DirectoryUpdated,
    ClaimRevoked,
    RebuildFailed,
}

/// One journal line. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp with millisecond precision.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    /// Claimed directory or snapshot root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Snapshot file the tree was loaded from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    /// Snapshots rebuilt by the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuilt: Option<Vec<String>>,
    /// Directories walked, assigned and reused across the rebuild.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reused: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Claimed directories and rules loaded at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directories: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<u64>,
}

impl LogEntry {
    /// An entry stamped with the current UTC time.
    #[must_use]
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            path: None,
            source: None,
            rule_id: None,
            pattern: None,
            backup_type: None,
            claimed_by: None,
            rebuilt: None,
            processed: None,
            assigned: None,
            reused: None,
            duration_ms: None,
            ok: None,
            error_code: None,
            error_message: None,
            config_hash: None,
            version: None,
            directories: None,
            rules: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Normal,
    Fallback,
    Stderr,
    Discard,
}

/// Writer settings; derived from [`JournalConfig`].
#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would grow past this.
    pub max_size_bytes: u64,
    /// Rotated files kept as `<path>.1` … `<path>.N`.
    pub max_rotated_files: u32,
    pub fsync_interval: Duration,
}

impl From<&JournalConfig> for JsonlConfig {
    fn from(config: &JournalConfig) -> Self {
        Self {
            path: config.path.clone(),
            fallback_path: config.fallback_path.clone(),
            max_size_bytes: config.max_size_bytes,
            max_rotated_files: config.max_rotated_files,
            fsync_interval: Duration::from_secs(config.fsync_interval_seconds),
        }
    }
}

/// Append-only JSONL writer with rotation and fallback.
#[derive(Debug)]
pub struct JsonlWriter {
    config: JsonlConfig,
    writer: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
    last_fsync: SystemTime,
}

impl JsonlWriter {
    /// Open the journal, falling through the degradation chain on failure.
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
            last_fsync: SystemTime::now(),
        };
        match open_append(&writer.config.path) {
            Ok((file, size)) => writer.install(file, size, WriterState::Normal),
            Err(_) => writer.open_fallback(),
        }
        writer
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(err) => {
                let _ = writeln!(io::stderr(), "[BRT-JOURNAL] serialize error: {err}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }

    /// Flush and sync file data to disk.
    pub fn fsync(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
            let _ = w.get_ref().sync_data();
        }
        self.last_fsync = SystemTime::now();
    }

    #[must_use]
    pub const fn state(&self) -> &'static str {
        match self.state {
            WriterState::Normal => "normal",
            WriterState::Fallback => "fallback",
            WriterState::Stderr => "stderr",
            WriterState::Discard => "discard",
        }
    }

    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Return to the primary path after a degradation, if it is writable again.
    pub fn try_recover(&mut self) {
        if self.state == WriterState::Normal {
            return;
        }
        if let Ok((file, size)) = open_append(&self.config.path) {
            self.flush();
            self.install(file, size, WriterState::Normal);
            let _ = writeln!(
                io::stderr(),
                "[BRT-JOURNAL] recovered to primary path: {}",
                self.config.path.display()
            );
        }
    }

    // ──────────────────── internals ────────────────────

    fn install(&mut self, file: File, size: u64, state: WriterState) {
        self.writer = Some(BufWriter::with_capacity(WRITE_BUFFER, file));
        self.state = state;
        self.bytes_written = size;
    }

    fn active_path(&self) -> Option<&Path> {
        match self.state {
            WriterState::Normal => Some(&self.config.path),
            WriterState::Fallback => self.config.fallback_path.as_deref(),
            WriterState::Stderr | WriterState::Discard => None,
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.writer.is_some() && self.bytes_written + len > self.config.max_size_bytes {
            self.rotate();
        }

        match self.state {
            WriterState::Normal | WriterState::Fallback => {
                let written = self
                    .writer
                    .as_mut()
                    .is_some_and(|w| w.write_all(line.as_bytes()).is_ok());
                if !written {
                    self.degrade();
                    self.write_line(line);
                    return;
                }
                self.bytes_written += len;
                if elapsed_since(self.last_fsync) >= self.config.fsync_interval {
                    self.fsync();
                }
            }
            WriterState::Stderr => {
                let _ = write!(io::stderr(), "[BRT-JOURNAL] {line}");
            }
            WriterState::Discard => {}
        }
    }

    fn open_fallback(&mut self) {
        let opened = self
            .config
            .fallback_path
            .as_deref()
            .map(|path| (path, open_append(path)));
        match opened {
            Some((path, Ok((file, size)))) => {
                let _ = writeln!(
                    io::stderr(),
                    "[BRT-JOURNAL] primary path failed, using fallback: {}",
                    path.display()
                );
                self.install(file, size, WriterState::Fallback);
            }
            Some((_, Err(_))) | None => {
                let _ = writeln!(
                    io::stderr(),
                    "[BRT-JOURNAL] no writable journal path, using stderr"
                );
                self.writer = None;
                self.state = WriterState::Stderr;
            }
        }
    }

    fn degrade(&mut self) {
        self.writer = None;
        match self.state {
            WriterState::Normal => self.open_fallback(),
            WriterState::Fallback => {
                let _ = writeln!(io::stderr(), "[BRT-JOURNAL] fallback write failed, using stderr");
                self.state = WriterState::Stderr;
            }
            WriterState::Stderr | WriterState::Discard => self.state = WriterState::Discard,
        }
    }

    fn rotate(&mut self) {
        self.flush();
        self.writer = None;
        let Some(base) = self.active_path().map(Path::to_path_buf) else {
            return;
        };

        let keep = self.config.max_rotated_files;
        let _ = fs::remove_file(rotated_name(&base, keep));
        for index in (1..keep).rev() {
            let _ = fs::rename(rotated_name(&base, index), rotated_name(&base, index + 1));
        }
        if keep > 0 {
            let _ = fs::rename(&base, rotated_name(&base, 1));
        } else {
            let _ = fs::remove_file(&base);
        }

        match open_append(&base) {
            Ok((file, _)) => self.install(file, 0, self.state),
            Err(_) => self.degrade(),
        }
    }
}

impl Drop for JsonlWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

// ──────────────────── helpers ────────────────────

/// Open or create `path` for appending; returns the file and its current size.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| BrtError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| BrtError::io(path, source))?;
    let size = file.metadata().map_or(0, |m| m.len());
    Ok((file, size))
}

/// `activity.jsonl` → `activity.jsonl.3`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn elapsed_since(then: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(then)
        .unwrap_or(Duration::ZERO)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: PathBuf) -> JsonlConfig {
        JsonlConfig {
            path,
            fallback_path: None,
            max_size_bytes: 1024 * 1024,
            max_rotated_files: 3,
            fsync_interval: Duration::from_secs(60),
        }
    }

    #[test]
    fn entries_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let mut writer = JsonlWriter::open(config(path.clone()));
        assert_eq!(writer.state(), "normal");

        let mut entry = LogEntry::new(EventType::RuleAdded, Severity::Info);
        entry.path = Some("/a/b/".to_string());
        entry.rule_id = Some(4);
        writer.write_entry(&entry);
        writer.write_entry(&LogEntry::new(EventType::ClaimRevoked, Severity::Info));
        writer.flush();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "rule_added");
        assert_eq!(lines[0]["rule_id"], 4);
        assert_eq!(lines[1]["event"], "claim_revoked");
        assert!(lines[1].get("path").is_none());
    }

    #[test]
    fn rotation_keeps_numbered_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rot.jsonl");
        let mut writer = JsonlWriter::open(JsonlConfig {
            max_size_bytes: 120,
            ..config(path.clone())
        });

        for _ in 0..12 {
            writer.write_entry(&LogEntry::new(EventType::TreeLoaded, Severity::Info));
        }
        writer.flush();

        assert!(path.exists());
        assert!(rotated_name(&path, 1).exists());
        assert!(!rotated_name(&path, 4).exists());
    }

    #[test]
    fn unwritable_primary_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let fallback = dir.path().join("fallback.jsonl");

        let mut writer = JsonlWriter::open(JsonlConfig {
            fallback_path: Some(fallback.clone()),
            ..config(blocker.join("primary.jsonl"))
        });
        assert_eq!(writer.state(), "fallback");
        writer.write_entry(&LogEntry::new(EventType::RebuildFailed, Severity::Error));
        writer.flush();
        assert!(!fs::read_to_string(&fallback).unwrap().is_empty());
    }

    #[test]
    fn no_writable_path_degrades_to_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();
        let writer = JsonlWriter::open(config(blocker.join("journal.jsonl")));
        assert_eq!(writer.state(), "stderr");
    }
}
