//! Typed engine events on top of the JSONL writer.

#![allow(missing_docs)]

use std::time::Duration;

use parking_lot::Mutex;

use crate::core::config::JournalConfig;
use crate::core::errors::BrtError;
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use crate::rules::model::{Directory, Rule};
use crate::ruletree::mount::MountBuild;

/// Something worth a journal line.
#[derive(Debug, Clone, Copy)]
pub enum JournalEvent<'a> {
    EngineStarted {
        config_hash: &'a str,
        directories: usize,
        rules: usize,
    },
    TreeLoaded {
        source: &'a str,
        mount: &'a MountBuild,
    },
    DirectoryClaimed(&'a Directory),
    DirectoryUpdated(&'a Directory),
    ClaimRevoked(&'a Directory),
    RuleAdded {
        dir: &'a str,
        rule: &'a Rule,
        builds: &'a [MountBuild],
        elapsed: Duration,
    },
    /// A batch of rules applied with one rebuild per snapshot.
    RulesImported {
        rules: usize,
        builds: &'a [MountBuild],
        elapsed: Duration,
    },
    RuleRemoved {
        dir: &'a str,
        rule: &'a Rule,
        builds: &'a [MountBuild],
        elapsed: Duration,
    },
    RuleUpdated {
        dir: &'a str,
        rule: &'a Rule,
        builds: &'a [MountBuild],
        elapsed: Duration,
    },
    RebuildFailed {
        dir: &'a str,
        pattern: &'a str,
        error: &'a BrtError,
    },
}

/// Shared handle to the activity journal. A disabled journal accepts and
/// drops every event.
#[derive(Debug)]
pub struct Journal {
    writer: Option<Mutex<JsonlWriter>>,
}

impl Journal {
    #[must_use]
    pub fn open(config: &JournalConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        Self {
            writer: Some(Mutex::new(JsonlWriter::open(JsonlConfig::from(config)))),
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self { writer: None }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn record(&self, event: JournalEvent<'_>) {
        if let Some(writer) = &self.writer {
            writer.lock().write_entry(&entry_for(event));
        }
    }

    pub fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.lock().fsync();
        }
    }
}

fn entry_for(event: JournalEvent<'_>) -> LogEntry {
    match event {
        JournalEvent::EngineStarted {
            config_hash,
            directories,
            rules,
        } => {
            let mut entry = LogEntry::new(EventType::EngineStart, Severity::Info);
            entry.config_hash = Some(config_hash.to_string());
            entry.version = Some(env!("CARGO_PKG_VERSION").to_string());
            entry.directories = Some(directories as u64);
            entry.rules = Some(rules as u64);
            entry
        }
        JournalEvent::TreeLoaded { source, mount } => {
            let kind = if mount.replaced {
                EventType::TreeReplaced
            } else {
                EventType::TreeLoaded
            };
            let mut entry = LogEntry::new(kind, Severity::Info);
            entry.path = Some(mount.root.clone());
            entry.source = Some(source.to_string());
            with_builds(&mut entry, std::slice::from_ref(mount), mount.build.elapsed);
            entry
        }
        JournalEvent::DirectoryClaimed(directory) => {
            directory_entry(EventType::DirectoryClaimed, directory)
        }
        JournalEvent::DirectoryUpdated(directory) => {
            directory_entry(EventType::DirectoryUpdated, directory)
        }
        JournalEvent::ClaimRevoked(directory) => directory_entry(EventType::ClaimRevoked, directory),
        JournalEvent::RuleAdded {
            dir,
            rule,
            builds,
            elapsed,
        } => rule_entry(EventType::RuleAdded, dir, rule, builds, elapsed),
        JournalEvent::RulesImported {
            rules,
            builds,
            elapsed,
        } => {
            let mut entry = LogEntry::new(EventType::RulesImported, Severity::Info);
            entry.rules = Some(rules as u64);
            with_builds(&mut entry, builds, elapsed);
            entry
        }
        JournalEvent::RuleRemoved {
            dir,
            rule,
            builds,
            elapsed,
        } => rule_entry(EventType::RuleRemoved, dir, rule, builds, elapsed),
        JournalEvent::RuleUpdated {
            dir,
            rule,
            builds,
            elapsed,
        } => rule_entry(EventType::RuleUpdated, dir, rule, builds, elapsed),
        JournalEvent::RebuildFailed {
            dir,
            pattern,
            error,
        } => {
            let mut entry = LogEntry::new(EventType::RebuildFailed, Severity::Error);
            entry.path = Some(dir.to_string());
            entry.pattern = Some(pattern.to_string());
            entry.ok = Some(false);
            entry.error_code = Some(error.code().to_string());
            entry.error_message = Some(error.to_string());
            entry
        }
    }
}

fn directory_entry(kind: EventType, directory: &Directory) -> LogEntry {
    let mut entry = LogEntry::new(kind, Severity::Info);
    entry.path = Some(directory.path.clone());
    entry.claimed_by = Some(directory.claimed_by.clone());
    entry.ok = Some(true);
    entry
}

fn rule_entry(
    kind: EventType,
    dir: &str,
    rule: &Rule,
    builds: &[MountBuild],
    elapsed: Duration,
) -> LogEntry {
    let mut entry = LogEntry::new(kind, Severity::Info);
    entry.path = Some(dir.to_string());
    entry.rule_id = Some(rule.id);
    entry.pattern = Some(rule.pattern.clone());
    entry.backup_type = Some(rule.backup_type.as_str().to_string());
    with_builds(&mut entry, builds, elapsed);
    entry
}

fn with_builds(entry: &mut LogEntry, builds: &[MountBuild], elapsed: Duration) {
    entry.rebuilt = Some(builds.iter().map(|b| b.root.clone()).collect());
    entry.processed = Some(builds.iter().map(|b| b.build.processed).sum());
    entry.assigned = Some(builds.iter().map(|b| b.build.assigned).sum());
    entry.reused = Some(builds.iter().map(|b| b.build.reused).sum());
    entry.duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
    entry.ok = Some(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::BackupType;
    use crate::ruletree::builder::BuildReport;

    fn lines(path: &std::path::Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn journal(path: std::path::PathBuf) -> Journal {
        Journal::open(&JournalConfig {
            path,
            ..JournalConfig::default()
        })
    }

    #[test]
    fn rule_events_carry_rebuild_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = journal(path.clone());

        let rule = Rule::new(7, "*.txt", BackupType::IBackup);
        let builds = [MountBuild {
            root: "/s/".to_string(),
            replaced: true,
            build: BuildReport {
                processed: 3,
                assigned: 1,
                reused: 2,
                ..BuildReport::default()
            },
        }];
        journal.record(JournalEvent::RuleAdded {
            dir: "/s/a/",
            rule: &rule,
            builds: &builds,
            elapsed: Duration::from_millis(12),
        });
        journal.record(JournalEvent::RulesImported {
            rules: 4,
            builds: &builds,
            elapsed: Duration::from_millis(5),
        });
        journal.flush();

        let lines = lines(&path);
        assert_eq!(lines[0]["event"], "rule_added");
        assert_eq!(lines[0]["pattern"], "*.txt");
        assert_eq!(lines[0]["backup_type"], "ibackup");
        assert_eq!(lines[0]["rebuilt"][0], "/s/");
        assert_eq!(lines[0]["reused"], 2);
        assert_eq!(lines[0]["duration_ms"], 12);
        assert_eq!(lines[1]["event"], "rules_imported");
        assert_eq!(lines[1]["rules"], 4);
        assert_eq!(lines[1]["processed"], 3);
        assert!(lines[1].get("pattern").is_none());
    }

    #[test]
    fn failures_record_error_code() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = journal(path.clone());

        let error = BrtError::decode("upper tree", "truncated");
        journal.record(JournalEvent::RebuildFailed {
            dir: "/s/",
            pattern: "*",
            error: &error,
        });
        journal.flush();

        let lines = lines(&path);
        assert_eq!(lines[0]["severity"], "error");
        assert_eq!(lines[0]["error_code"], "BRT-2301");
        assert_eq!(lines[0]["ok"], false);
    }

    #[test]
    fn disabled_journal_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = Journal::open(&JournalConfig {
            enabled: false,
            path: path.clone(),
            ..JournalConfig::default()
        });
        assert!(!journal.is_enabled());
        journal.record(JournalEvent::ClaimRevoked(&Directory::new("/s/", "bob")));
        assert!(!path.exists());
    }
}
