//! Persistence for claimed directories and their rules.
//!
//! The engine only talks to [`RuleStore`]. [`SqliteRuleStore`] keeps records
//! in a WAL-mode database; [`MemoryRuleStore`] backs tests and deployments
//! that seed rules some other way.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use crate::core::errors::{BrtError, Result};
use crate::rules::model::{Directory, Rule};
use crate::ruletree::stats::RuleId;

/// Durable record of claims and rules.
///
/// `create_*` assign the record id and timestamps in place.
/// `restore_rule` re-inserts a removed record exactly as given, so a failed
/// rebuild can undo a removal without renumbering the rule.
pub trait RuleStore: Send {
    fn read_directories(&mut self) -> Result<Vec<Directory>>;
    fn read_rules(&mut self) -> Result<Vec<Rule>>;
    fn create_directory(&mut self, directory: &mut Directory) -> Result<()>;
    fn update_directory(&mut self, directory: &mut Directory) -> Result<()>;
    fn remove_directory(&mut self, id: i64) -> Result<()>;
    fn create_rule(&mut self, rule: &mut Rule) -> Result<()>;
    fn update_rule(&mut self, rule: &mut Rule) -> Result<()>;
    fn remove_rule(&mut self, id: RuleId) -> Result<()>;
    fn restore_rule(&mut self, rule: &Rule) -> Result<()>;
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ──────────────────── memory ────────────────────

/// Volatile store; ids count up from 1 like SQLite rowids.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    directories: BTreeMap<i64, Directory>,
    rules: BTreeMap<RuleId, Rule>,
    next_directory: i64,
    next_rule: RuleId,
}

impl MemoryRuleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RuleStore for MemoryRuleStore {
    fn read_directories(&mut self) -> Result<Vec<Directory>> {
        Ok(self.directories.values().cloned().collect())
    }

    fn read_rules(&mut self) -> Result<Vec<Rule>> {
        Ok(self.rules.values().cloned().collect())
    }

    fn create_directory(&mut self, directory: &mut Directory) -> Result<()> {
        if self.directories.values().any(|d| d.path == directory.path) {
            return Err(BrtError::DirectoryClaimed {
                path: directory.path.clone(),
            });
        }
        self.next_directory += 1;
        directory.id = self.next_directory;
        directory.created = now();
        directory.modified = directory.created;
        self.directories.insert(directory.id, directory.clone());
        Ok(())
    }

    fn update_directory(&mut self, directory: &mut Directory) -> Result<()> {
        let Some(stored) = self.directories.get_mut(&directory.id) else {
            return Err(BrtError::NotClaimed {
                path: directory.path.clone(),
            });
        };
        directory.modified = now();
        *stored = directory.clone();
        Ok(())
    }

    fn remove_directory(&mut self, id: i64) -> Result<()> {
        self.directories.remove(&id);
        self.rules.retain(|_, rule| rule.directory_id != id);
        Ok(())
    }

    fn create_rule(&mut self, rule: &mut Rule) -> Result<()> {
        if !self.directories.contains_key(&rule.directory_id) {
            return Err(BrtError::OrphanedRule {
                rule_id: rule.id,
                directory_id: rule.directory_id,
            });
        }
        self.next_rule += 1;
        rule.id = self.next_rule;
        rule.created = now();
        rule.modified = rule.created;
        self.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    fn update_rule(&mut self, rule: &mut Rule) -> Result<()> {
        let Some(stored) = self.rules.get_mut(&rule.id) else {
            return Err(BrtError::RuleNotFound {
                directory: rule.directory_id.to_string(),
                pattern: rule.pattern.clone(),
            });
        };
        rule.modified = now();
        *stored = rule.clone();
        Ok(())
    }

    fn remove_rule(&mut self, id: RuleId) -> Result<()> {
        self.rules.remove(&id);
        Ok(())
    }

    fn restore_rule(&mut self, rule: &Rule) -> Result<()> {
        if !self.directories.contains_key(&rule.directory_id) {
            return Err(BrtError::OrphanedRule {
                rule_id: rule.id,
                directory_id: rule.directory_id,
            });
        }
        self.next_rule = self.next_rule.max(rule.id);
        self.rules.insert(rule.id, rule.clone());
        Ok(())
    }
}

// ──────────────────── sqlite ────────────────────

#[cfg(feature = "sqlite")]
pub use self::sqlite::SqliteRuleStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use std::path::{Path, PathBuf};

    use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

    use super::{RuleStore, now};
    use crate::core::errors::{BrtError, Result};
    use crate::rules::model::{BackupType, Directory, Rule};
    use crate::ruletree::stats::RuleId;

    /// Rule store in a WAL-mode SQLite database.
    pub struct SqliteRuleStore {
        conn: Connection,
        path: PathBuf,
    }

    impl SqliteRuleStore {
        /// Open (or create) the database at `path`, applying schema and PRAGMAs.
        pub fn open(path: &Path) -> Result<Self> {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(|source| BrtError::io(parent, source))?;
            }

            let conn = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            apply_pragmas(&conn)?;
            apply_schema(&conn)?;

            Ok(Self {
                conn,
                path: path.to_path_buf(),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Check that WAL mode is active (for diagnostics).
        pub fn is_wal_mode(&self) -> bool {
            self.conn
                .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
                .map(|mode| mode.eq_ignore_ascii_case("wal"))
                .unwrap_or(false)
        }

        fn directory_path(&self, id: i64) -> Result<Option<String>> {
            Ok(self
                .conn
                .prepare_cached("SELECT path FROM directories WHERE id = ?1")?
                .query_row(params![id], |row| row.get(0))
                .optional()?)
        }
    }

    fn sql_id(id: RuleId) -> Result<i64> {
        i64::try_from(id).map_err(|_| BrtError::Sql {
            context: "rule id",
            details: format!("{id} out of range"),
        })
    }

    fn rule_id(raw: i64) -> Result<RuleId> {
        RuleId::try_from(raw).map_err(|_| BrtError::decode("rule id", format!("negative id {raw}")))
    }

    impl RuleStore for SqliteRuleStore {
        fn read_directories(&mut self) -> Result<Vec<Directory>> {
            let mut stmt = self.conn.prepare_cached(
                "SELECT id, path, claimed_by, created, modified
                 FROM directories ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Directory {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        claimed_by: row.get(2)?,
                        created: row.get(3)?,
                        modified: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        }

        fn read_rules(&mut self) -> Result<Vec<Rule>> {
            let mut stmt = self.conn.prepare_cached(
                "SELECT id, directory_id, backup_type, metadata, review_date,
                        remove_date, pattern, frequency, created, modified
                 FROM rules ORDER BY id ASC",
            )?;
            let raw = stmt
                .query_map([], |row| {
                    let rule = Rule {
                        id: 0,
                        directory_id: row.get(1)?,
                        backup_type: BackupType::None,
                        metadata: row.get(3)?,
                        review_date: row.get(4)?,
                        remove_date: row.get(5)?,
                        pattern: row.get(6)?,
                        frequency: row.get(7)?,
                        created: row.get(8)?,
                        modified: row.get(9)?,
                    };
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(2)?, rule))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            raw.into_iter()
                .map(|(id, backup_type, mut rule)| {
                    rule.id = rule_id(id)?;
                    rule.backup_type = BackupType::parse(&backup_type)?;
                    Ok(rule)
                })
                .collect()
        }

        fn create_directory(&mut self, directory: &mut Directory) -> Result<()> {
            let stamp = now();
            let inserted = self
                .conn
                .prepare_cached(
                    "INSERT OR IGNORE INTO directories (path, claimed_by, created, modified)
                     VALUES (?1, ?2, ?3, ?3)",
                )?
                .execute(params![directory.path, directory.claimed_by, stamp])?;
            if inserted == 0 {
                return Err(BrtError::DirectoryClaimed {
                    path: directory.path.clone(),
                });
            }
            directory.id = self.conn.last_insert_rowid();
            directory.created = stamp;
            directory.modified = stamp;
            Ok(())
        }

        fn update_directory(&mut self, directory: &mut Directory) -> Result<()> {
            let stamp = now();
            let updated = self
                .conn
                .prepare_cached(
                    "UPDATE directories SET claimed_by = ?2, modified = ?3 WHERE id = ?1",
                )?
                .execute(params![directory.id, directory.claimed_by, stamp])?;
            if updated == 0 {
                return Err(BrtError::NotClaimed {
                    path: directory.path.clone(),
                });
            }
            directory.modified = stamp;
            Ok(())
        }

        fn remove_directory(&mut self, id: i64) -> Result<()> {
            self.conn
                .prepare_cached("DELETE FROM directories WHERE id = ?1")?
                .execute(params![id])?;
            Ok(())
        }

        fn create_rule(&mut self, rule: &mut Rule) -> Result<()> {
            if self.directory_path(rule.directory_id)?.is_none() {
                return Err(BrtError::OrphanedRule {
                    rule_id: rule.id,
                    directory_id: rule.directory_id,
                });
            }
            let stamp = now();
            self.conn
                .prepare_cached(
                    "INSERT INTO rules (
                    directory_id, backup_type, metadata, review_date, remove_date,
                    pattern, frequency, created, modified
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?8)",
                )?
                .execute(params![
                    rule.directory_id,
                    rule.backup_type.as_str(),
                    rule.metadata,
                    rule.review_date,
                    rule.remove_date,
                    rule.pattern,
                    rule.frequency,
                    stamp,
                ])?;
            rule.id = rule_id(self.conn.last_insert_rowid())?;
            rule.created = stamp;
            rule.modified = stamp;
            Ok(())
        }

        fn update_rule(&mut self, rule: &mut Rule) -> Result<()> {
            let stamp = now();
            let updated = self
                .conn
                .prepare_cached(
                    "UPDATE rules SET backup_type = ?2, metadata = ?3, review_date = ?4,
                        remove_date = ?5, pattern = ?6, frequency = ?7, modified = ?8
                     WHERE id = ?1",
                )?
                .execute(params![
                    sql_id(rule.id)?,
                    rule.backup_type.as_str(),
                    rule.metadata,
                    rule.review_date,
                    rule.remove_date,
                    rule.pattern,
                    rule.frequency,
                    stamp,
                ])?;
            if updated == 0 {
                return Err(BrtError::RuleNotFound {
                    directory: rule.directory_id.to_string(),
                    pattern: rule.pattern.clone(),
                });
            }
            rule.modified = stamp;
            Ok(())
        }

        fn remove_rule(&mut self, id: RuleId) -> Result<()> {
            self.conn
                .prepare_cached("DELETE FROM rules WHERE id = ?1")?
                .execute(params![sql_id(id)?])?;
            Ok(())
        }

        fn restore_rule(&mut self, rule: &Rule) -> Result<()> {
            if self.directory_path(rule.directory_id)?.is_none() {
                return Err(BrtError::OrphanedRule {
                    rule_id: rule.id,
                    directory_id: rule.directory_id,
                });
            }
            self.conn
                .prepare_cached(
                    "INSERT INTO rules (
                    id, directory_id, backup_type, metadata, review_date, remove_date,
                    pattern, frequency, created, modified
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                )?
                .execute(params![
                    sql_id(rule.id)?,
                    rule.directory_id,
                    rule.backup_type.as_str(),
                    rule.metadata,
                    rule.review_date,
                    rule.remove_date,
                    rule.pattern,
                    rule.frequency,
                    rule.created,
                    rule.modified,
                ])?;
            Ok(())
        }
    }

    fn apply_pragmas(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )?;
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            eprintln!("[BRT-SQLITE] WARNING: requested WAL mode but got '{mode}'");
        }
        Ok(())
    }

    fn apply_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS directories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL UNIQUE,
                claimed_by TEXT NOT NULL,
                created INTEGER NOT NULL,
                modified INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                directory_id INTEGER NOT NULL
                    REFERENCES directories(id) ON DELETE CASCADE,
                backup_type TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '',
                review_date INTEGER NOT NULL DEFAULT 0,
                remove_date INTEGER NOT NULL DEFAULT 0,
                pattern TEXT NOT NULL,
                frequency INTEGER NOT NULL DEFAULT 0,
                created INTEGER NOT NULL,
                modified INTEGER NOT NULL,
                UNIQUE (directory_id, pattern)
            );

            CREATE INDEX IF NOT EXISTS idx_rules_directory ON rules(directory_id);",
        )?;
        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn temp_store() -> (tempfile::TempDir, SqliteRuleStore) {
            let dir = tempfile::tempdir().unwrap();
            let store = SqliteRuleStore::open(&dir.path().join("rules.db")).unwrap();
            (dir, store)
        }

        #[test]
        fn schema_created_and_wal_active() {
            let (_dir, store) = temp_store();
            assert!(store.is_wal_mode());
        }

        #[test]
        fn directories_and_rules_persist_across_reopen() {
            let dir = tempfile::tempdir().unwrap();
            let db = dir.path().join("nested/rules.db");
            {
                let mut store = SqliteRuleStore::open(&db).unwrap();
                let mut claimed = Directory::new("/lustre/proj/", "alice");
                store.create_directory(&mut claimed).unwrap();
                assert!(claimed.id > 0);

                let mut rule = Rule::new(0, "*.cram", BackupType::IBackup);
                rule.directory_id = claimed.id;
                rule.frequency = 7;
                store.create_rule(&mut rule).unwrap();
                assert_eq!(rule.id, 1);
            }

            let mut store = SqliteRuleStore::open(&db).unwrap();
            let directories = store.read_directories().unwrap();
            assert_eq!(directories.len(), 1);
            assert_eq!(directories[0].claimed_by, "alice");
            let rules = store.read_rules().unwrap();
            assert_eq!(rules.len(), 1);
            assert_eq!(rules[0].pattern, "*.cram");
            assert_eq!(rules[0].backup_type, BackupType::IBackup);
            assert_eq!(rules[0].frequency, 7);
        }

        #[test]
        fn duplicate_claim_and_duplicate_match_are_rejected() {
            let (_dir, mut store) = temp_store();
            let mut claimed = Directory::new("/a/", "alice");
            store.create_directory(&mut claimed).unwrap();
            let err = store
                .create_directory(&mut Directory::new("/a/", "bob"))
                .unwrap_err();
            assert!(matches!(err, BrtError::DirectoryClaimed { .. }));

            let mut rule = Rule::new(0, "*", BackupType::None);
            rule.directory_id = claimed.id;
            store.create_rule(&mut rule.clone()).unwrap();
            assert!(store.create_rule(&mut rule).is_err());
        }

        #[test]
        fn removing_directory_cascades_to_rules() {
            let (_dir, mut store) = temp_store();
            let mut claimed = Directory::new("/a/", "alice");
            store.create_directory(&mut claimed).unwrap();
            let mut rule = Rule::new(0, "*", BackupType::Manual);
            rule.directory_id = claimed.id;
            store.create_rule(&mut rule).unwrap();

            store.remove_directory(claimed.id).unwrap();
            assert!(store.read_directories().unwrap().is_empty());
            assert!(store.read_rules().unwrap().is_empty());
        }

        #[test]
        fn update_rule_rewrites_match_and_type() {
            let (_dir, mut store) = temp_store();
            let mut claimed = Directory::new("/a/", "alice");
            store.create_directory(&mut claimed).unwrap();
            let mut rule = Rule::new(0, "*.txt", BackupType::Manual);
            rule.directory_id = claimed.id;
            store.create_rule(&mut rule).unwrap();

            rule.pattern = "*.tsv".to_string();
            rule.backup_type = BackupType::None;
            store.update_rule(&mut rule).unwrap();

            let rules = store.read_rules().unwrap();
            assert_eq!(rules[0].pattern, "*.tsv");
            assert_eq!(rules[0].backup_type, BackupType::None);

            let mut missing = Rule::new(99, "x", BackupType::None);
            assert!(matches!(
                store.update_rule(&mut missing),
                Err(BrtError::RuleNotFound { .. })
            ));
        }

        #[test]
        fn restored_rule_keeps_its_id() {
            let (_dir, mut store) = temp_store();
            let mut claimed = Directory::new("/a/", "alice");
            store.create_directory(&mut claimed).unwrap();
            let mut rule = Rule::new(0, "*.bam", BackupType::IBackup);
            rule.directory_id = claimed.id;
            store.create_rule(&mut rule).unwrap();

            store.remove_rule(rule.id).unwrap();
            store.restore_rule(&rule).unwrap();
            let rules = store.read_rules().unwrap();
            assert_eq!(rules, vec![rule]);
        }

        #[test]
        fn rule_for_unknown_directory_is_orphaned() {
            let (_dir, mut store) = temp_store();
            let mut rule = Rule::new(0, "*", BackupType::None);
            rule.directory_id = 42;
            assert!(matches!(
                store.create_rule(&mut rule),
                Err(BrtError::OrphanedRule { .. })
            ));
        }
    }
}
