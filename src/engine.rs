//! Engine facade: rule store, mount tree and activity journal wired together.
//!
//! Persisting operations write through the [`RuleStore`] and apply to the
//! [`RuleTree`] under the store lock. If either side fails, the write that
//! already happened is undone so the two never disagree.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::config::Config;
use crate::core::errors::{BrtError, Result};
use crate::logger::journal::{Journal, JournalEvent};
use crate::rules::model::{DirRules, Directory, Rule, validate_pattern};
use crate::rules::store::RuleStore;
use crate::ruletree::mount::{MountBuild, RuleTree};
use crate::ruletree::names::{NameCache, PrincipalNames, SystemNames};
use crate::ruletree::overlay::DirSummary;
use crate::ruletree::stats::{PrincipalId, RuleId};

/// A rule change and the snapshots it rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleChange {
    pub rule: Rule,
    pub builds: Vec<MountBuild>,
}

/// Rules created together and the snapshots their single rebuild touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleImport {
    pub rules: Vec<(String, Rule)>,
    pub builds: Vec<MountBuild>,
}

pub struct Engine {
    config: Config,
    store: Mutex<Box<dyn RuleStore>>,
    tree: RuleTree,
    journal: Journal,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tree", &self.tree)
            .field("journal", &self.journal)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the configured rule database, load its rules and mount every
    /// configured snapshot.
    pub fn open(config: Config) -> Result<Self> {
        let store = open_store(&config)?;
        let names = Arc::new(NameCache::new(
            SystemNames,
            Duration::from_secs(config.names.cache_ttl_seconds),
        ));
        Self::with_parts(config, store, names)
    }

    /// Assemble an engine from an already opened store and name resolver.
    pub fn with_parts(
        config: Config,
        mut store: Box<dyn RuleStore>,
        names: Arc<dyn PrincipalNames>,
    ) -> Result<Self> {
        let journal = Journal::open(&config.journal);
        let tree = RuleTree::load(store.as_mut(), names)?;
        let (directories, rules) = tree.rule_counts();
        let config_hash = config.stable_hash().unwrap_or_default();
        journal.record(JournalEvent::EngineStarted {
            config_hash: &config_hash,
            directories,
            rules,
        });

        let engine = Self {
            config,
            store: Mutex::new(store),
            tree,
            journal,
        };
        for file in &engine.config.snapshots.files {
            engine.add_tree(file)?;
        }
        Ok(engine)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn tree(&self) -> &RuleTree {
        &self.tree
    }

    #[must_use]
    pub const fn journal(&self) -> &Journal {
        &self.journal
    }

    // ──────────────────── snapshots ────────────────────

    /// Mount or replace the snapshot in `path`.
    pub fn add_tree(&self, path: &Path) -> Result<MountBuild> {
        let mount = self.tree.add_tree(path)?;
        self.journal.record(JournalEvent::TreeLoaded {
            source: &path.display().to_string(),
            mount: &mount,
        });
        Ok(mount)
    }

    // ──────────────────── claims ────────────────────

    /// Claim a directory for `claimed_by`.
    pub fn claim(&self, path: &str, claimed_by: &str) -> Result<Directory> {
        let mut directory = Directory::new(path, claimed_by);
        let mut store = self.store.lock();
        store.create_directory(&mut directory)?;
        if let Err(err) = self.tree.claim_directory(directory.clone()) {
            undo(store.remove_directory(directory.id), "claim");
            return Err(err);
        }
        drop(store);
        self.journal.record(JournalEvent::DirectoryClaimed(&directory));
        Ok(directory)
    }

    /// Hand a claim to someone else.
    pub fn pass_claim(&self, path: &str, claimed_by: &str) -> Result<Directory> {
        let previous = self.claimed(path)?.directory;
        let mut directory = previous.clone();
        directory.claimed_by = claimed_by.to_string();

        let mut store = self.store.lock();
        store.update_directory(&mut directory)?;
        if let Err(err) = self.tree.update_directory(directory.clone()) {
            undo(store.update_directory(&mut previous.clone()), "claim update");
            return Err(err);
        }
        drop(store);
        self.journal.record(JournalEvent::DirectoryUpdated(&directory));
        Ok(directory)
    }

    /// Drop a claim. Fails while the directory still has rules.
    pub fn revoke(&self, path: &str) -> Result<Directory> {
        let mut store = self.store.lock();
        // Tree first: re-claiming there keeps the directory id.
        let directory = self.tree.revoke_claim(path)?;
        if let Err(err) = store.remove_directory(directory.id) {
            undo(self.tree.claim_directory(directory), "revoke");
            return Err(err);
        }
        drop(store);
        self.journal.record(JournalEvent::ClaimRevoked(&directory));
        Ok(directory)
    }

    // ──────────────────── rules ────────────────────

    /// Attach a new rule to a claimed directory. The store assigns its id.
    pub fn create_rule(&self, dir: &str, mut rule: Rule) -> Result<RuleChange> {
        validate_pattern(&rule.pattern)?;
        let claimed = self.claimed(dir)?;
        if claimed.rules.contains_key(&rule.pattern) {
            return Err(BrtError::RuleExists {
                directory: dir.to_string(),
                pattern: rule.pattern,
            });
        }
        rule.directory_id = claimed.directory.id;

        let started = Instant::now();
        let mut store = self.store.lock();
        store.create_rule(&mut rule)?;
        let builds = match self.tree.add_rule(dir, rule.clone()) {
            Ok(builds) => builds,
            Err(err) => {
                undo(store.remove_rule(rule.id), "rule create");
                self.rebuild_failed(dir, &rule.pattern, &err);
                return Err(err);
            }
        };
        drop(store);
        self.journal.record(JournalEvent::RuleAdded {
            dir,
            rule: &rule,
            builds: &builds,
            elapsed: started.elapsed(),
        });
        Ok(RuleChange { rule, builds })
    }

    /// Create many rules at once, each in its already claimed directory.
    /// Either every rule is stored and applied or none is.
    pub fn create_rules(&self, batch: Vec<(String, Rule)>) -> Result<RuleImport> {
        let mut claims: HashMap<String, DirRules> = HashMap::new();
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(batch.len());
        for (dir, mut rule) in batch {
            validate_pattern(&rule.pattern)?;
            if !claims.contains_key(&dir) {
                let claimed = self.claimed(&dir)?;
                claims.insert(dir.clone(), claimed);
            }
            let claimed = &claims[&dir];
            if claimed.rules.contains_key(&rule.pattern)
                || !seen.insert((dir.clone(), rule.pattern.clone()))
            {
                return Err(BrtError::RuleExists {
                    directory: dir,
                    pattern: rule.pattern,
                });
            }
            rule.directory_id = claimed.directory.id;
            rules.push((dir, rule));
        }

        let started = Instant::now();
        let mut store = self.store.lock();
        let mut stored = 0;
        let mut failure = None;
        for (_, rule) in &mut rules {
            if let Err(err) = store.create_rule(rule) {
                failure = Some(err);
                break;
            }
            stored += 1;
        }
        if let Some(err) = failure {
            for (_, rule) in &rules[..stored] {
                undo(store.remove_rule(rule.id), "rule import");
            }
            return Err(err);
        }
        let builds = match self.tree.add_rules(&rules) {
            Ok(builds) => builds,
            Err(err) => {
                for (dir, rule) in &rules {
                    undo(store.remove_rule(rule.id), "rule import");
                    self.rebuild_failed(dir, &rule.pattern, &err);
                }
                return Err(err);
            }
        };
        drop(store);
        self.journal.record(JournalEvent::RulesImported {
            rules: rules.len(),
            builds: &builds,
            elapsed: started.elapsed(),
        });
        Ok(RuleImport { rules, builds })
    }

    /// Remove the rule with match string `pattern` from `dir`.
    pub fn remove_rule(&self, dir: &str, pattern: &str) -> Result<RuleChange> {
        let claimed = self.claimed(dir)?;
        let Some(rule) = claimed.rules.get(pattern).cloned() else {
            return Err(BrtError::RuleNotFound {
                directory: dir.to_string(),
                pattern: pattern.to_string(),
            });
        };

        let started = Instant::now();
        let mut store = self.store.lock();
        store.remove_rule(rule.id)?;
        let builds = match self.tree.remove_rule(dir, pattern) {
            Ok((_, builds)) => builds,
            Err(err) => {
                undo(store.restore_rule(&rule), "rule remove");
                self.rebuild_failed(dir, pattern, &err);
                return Err(err);
            }
        };
        drop(store);
        self.journal.record(JournalEvent::RuleRemoved {
            dir,
            rule: &rule,
            builds: &builds,
            elapsed: started.elapsed(),
        });
        Ok(RuleChange { rule, builds })
    }

    /// Replace the rule with `rule.id` in `dir`. Only a changed match string
    /// rebuilds anything.
    pub fn update_rule(&self, dir: &str, mut rule: Rule) -> Result<RuleChange> {
        validate_pattern(&rule.pattern)?;
        let claimed = self.claimed(dir)?;
        let Some(previous) = claimed.rules.values().find(|r| r.id == rule.id).cloned() else {
            return Err(BrtError::RuleNotFound {
                directory: dir.to_string(),
                pattern: rule.pattern,
            });
        };
        if rule.pattern != previous.pattern && claimed.rules.contains_key(&rule.pattern) {
            return Err(BrtError::RuleExists {
                directory: dir.to_string(),
                pattern: rule.pattern,
            });
        }
        rule.directory_id = previous.directory_id;
        rule.created = previous.created;

        let started = Instant::now();
        let mut store = self.store.lock();
        store.update_rule(&mut rule)?;
        let builds = match self.tree.update_rule(dir, rule.clone()) {
            Ok(builds) => builds,
            Err(err) => {
                undo(store.update_rule(&mut previous.clone()), "rule update");
                self.rebuild_failed(dir, &rule.pattern, &err);
                return Err(err);
            }
        };
        drop(store);
        self.journal.record(JournalEvent::RuleUpdated {
            dir,
            rule: &rule,
            builds: &builds,
            elapsed: started.elapsed(),
        });
        Ok(RuleChange { rule, builds })
    }

    fn claimed(&self, path: &str) -> Result<DirRules> {
        self.tree.directory(path).ok_or_else(|| BrtError::NotClaimed {
            path: path.to_string(),
        })
    }

    fn rebuild_failed(&self, dir: &str, pattern: &str, error: &BrtError) {
        if !error.is_recoverable() {
            self.journal.record(JournalEvent::RebuildFailed {
                dir,
                pattern,
                error,
            });
        }
    }

    // ──────────────────── queries ────────────────────

    pub fn summary(&self, path: &str) -> Result<DirSummary> {
        self.tree.summary(path)
    }

    pub fn get_owner(&self, path: &str) -> Result<(PrincipalId, PrincipalId)> {
        self.tree.get_owner(path)
    }

    pub fn is_directory(&self, path: &str) -> Result<bool> {
        self.tree.is_directory(path)
    }

    pub fn glob_paths<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Vec<String>> {
        self.tree.glob_paths(patterns)
    }

    pub fn rule_for(&self, path: &str) -> RuleId {
        self.tree.rule_for(path)
    }

    pub fn directory(&self, path: &str) -> Option<DirRules> {
        self.tree.directory(path)
    }

    pub fn mounts(&self) -> Vec<String> {
        self.tree.mounts()
    }
}

/// Report a failed compensating write; the original error is what the
/// caller sees.
fn undo(result: Result<()>, action: &str) {
    if let Err(err) = result {
        eprintln!("[BRT-STORE] rollback of {action} failed: {err}");
    }
}

#[cfg(feature = "sqlite")]
fn open_store(config: &Config) -> Result<Box<dyn RuleStore>> {
    let store = crate::rules::store::SqliteRuleStore::open(&config.rules.database)?;
    Ok(Box::new(store))
}

#[cfg(not(feature = "sqlite"))]
fn open_store(_config: &Config) -> Result<Box<dyn RuleStore>> {
    eprintln!("[BRT-STORE] built without sqlite; rules are kept in memory only");
    Ok(Box::new(crate::rules::store::MemoryRuleStore::new()))
}
