//! Claimed directories and the rules attached to them.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::errors::{BrtError, Result};
use crate::core::paths::is_absolute_dir;
use crate::ruletree::stats::RuleId;

/// How files matched by a rule are to be backed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Explicitly excluded from backup.
    #[default]
    None,
    /// Managed by the institutional backup service.
    IBackup,
    /// The claimant backs these files up themselves.
    Manual,
}

impl BackupType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::IBackup => "ibackup",
            Self::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "none" => Ok(Self::None),
            "ibackup" => Ok(Self::IBackup),
            "manual" => Ok(Self::Manual),
            other => Err(BrtError::Decode {
                context: "backup type",
                details: format!("unknown backup type {other:?}"),
            }),
        }
    }
}

/// A claimed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub id: i64,
    /// Absolute tree path ending in `/`.
    pub path: String,
    pub claimed_by: String,
    pub created: i64,
    pub modified: i64,
}

impl Directory {
    /// A not-yet-persisted claim on `path`.
    #[must_use]
    pub fn new(path: impl Into<String>, claimed_by: impl Into<String>) -> Self {
        Self {
            id: 0,
            path: path.into(),
            claimed_by: claimed_by.into(),
            created: 0,
            modified: 0,
        }
    }
}

/// A backup rule scoped to one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub directory_id: i64,
    pub backup_type: BackupType,
    pub metadata: String,
    pub review_date: i64,
    pub remove_date: i64,
    /// Match string: a literal name, `*`, or a name containing `*`.
    pub pattern: String,
    pub frequency: u32,
    pub created: i64,
    pub modified: i64,
}

impl Rule {
    /// A rule with only the fields that drive classification set.
    #[must_use]
    pub fn new(id: RuleId, pattern: impl Into<String>, backup_type: BackupType) -> Self {
        Self {
            id,
            directory_id: 0,
            backup_type,
            metadata: String::new(),
            review_date: 0,
            remove_date: 0,
            pattern: pattern.into(),
            frequency: 0,
            created: 0,
            modified: 0,
        }
    }
}

/// Reject match strings the compiler cannot express.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    let reason = if pattern.is_empty() {
        "must not be empty"
    } else if pattern.contains('/') {
        "must not contain '/'"
    } else if pattern.contains("**") {
        "must not contain consecutive '*'"
    } else {
        return Ok(());
    };
    Err(BrtError::InvalidMatch {
        pattern: pattern.to_string(),
        reason,
    })
}

/// A claimed directory and its rules, keyed by match string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRules {
    pub directory: Directory,
    pub rules: BTreeMap<String, Rule>,
}

impl DirRules {
    #[must_use]
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            rules: BTreeMap::new(),
        }
    }
}

/// Every claimed directory, keyed by path. Cloned before a mutation so a
/// failed rebuild leaves the committed set untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirRuleSet {
    dirs: BTreeMap<String, DirRules>,
}

impl DirRuleSet {
    /// Seed from persisted records. Every rule must reference a known directory.
    pub fn from_records(directories: Vec<Directory>, rules: Vec<Rule>) -> Result<Self> {
        let mut set = Self::default();
        let mut by_id = BTreeMap::new();
        for directory in directories {
            by_id.insert(directory.id, directory.path.clone());
            set.claim(directory)?;
        }
        for rule in rules {
            let Some(path) = by_id.get(&rule.directory_id) else {
                return Err(BrtError::OrphanedRule {
                    rule_id: rule.id,
                    directory_id: rule.directory_id,
                });
            };
            let path = path.clone();
            set.add_rule(&path, rule)?;
        }
        Ok(set)
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&DirRules> {
        self.dirs.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DirRules)> {
        self.dirs.iter().map(|(path, rules)| (path.as_str(), rules))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Total number of rules across all directories.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.dirs.values().map(|d| d.rules.len()).sum()
    }

    pub fn claim(&mut self, directory: Directory) -> Result<()> {
        if !is_absolute_dir(&directory.path) {
            return Err(BrtError::InvalidRoot {
                name: directory.path,
            });
        }
        if self.dirs.contains_key(&directory.path) {
            return Err(BrtError::DirectoryClaimed {
                path: directory.path,
            });
        }
        self.dirs
            .insert(directory.path.clone(), DirRules::new(directory));
        Ok(())
    }

    /// Replace the directory record (e.g. pass the claim to someone else).
    pub fn update_directory(&mut self, directory: Directory) -> Result<()> {
        let entry = self.claimed_mut(&directory.path)?;
        entry.directory = directory;
        Ok(())
    }

    /// Drop a claim. Only permitted once every rule has been removed.
    pub fn revoke(&mut self, path: &str) -> Result<Directory> {
        let entry = self.claimed_mut(path)?;
        if !entry.rules.is_empty() {
            return Err(BrtError::ClaimHasRules {
                path: path.to_string(),
                rules: entry.rules.len(),
            });
        }
        self.dirs
            .remove(path)
            .map(|entry| entry.directory)
            .ok_or_else(|| BrtError::NotClaimed {
                path: path.to_string(),
            })
    }

    pub fn add_rule(&mut self, path: &str, mut rule: Rule) -> Result<()> {
        validate_pattern(&rule.pattern)?;
        let entry = self.claimed_mut(path)?;
        if entry.rules.contains_key(&rule.pattern) {
            return Err(BrtError::RuleExists {
                directory: path.to_string(),
                pattern: rule.pattern,
            });
        }
        rule.directory_id = entry.directory.id;
        entry.rules.insert(rule.pattern.clone(), rule);
        Ok(())
    }

    pub fn remove_rule(&mut self, path: &str, pattern: &str) -> Result<Rule> {
        let entry = self.claimed_mut(path)?;
        entry
            .rules
            .remove(pattern)
            .ok_or_else(|| BrtError::RuleNotFound {
                directory: path.to_string(),
                pattern: pattern.to_string(),
            })
    }

    /// Replace the rule with the same id. Returns the previous version.
    pub fn update_rule(&mut self, path: &str, mut rule: Rule) -> Result<Rule> {
        validate_pattern(&rule.pattern)?;
        let entry = self.claimed_mut(path)?;
        let Some(old_pattern) = entry
            .rules
            .values()
            .find(|existing| existing.id == rule.id)
            .map(|existing| existing.pattern.clone())
        else {
            return Err(BrtError::RuleNotFound {
                directory: path.to_string(),
                pattern: rule.pattern,
            });
        };
        if old_pattern != rule.pattern && entry.rules.contains_key(&rule.pattern) {
            return Err(BrtError::RuleExists {
                directory: path.to_string(),
                pattern: rule.pattern,
            });
        }
        let previous = entry
            .rules
            .remove(&old_pattern)
            .ok_or_else(|| BrtError::not_found(path))?;
        rule.directory_id = entry.directory.id;
        entry.rules.insert(rule.pattern.clone(), rule);
        Ok(previous)
    }

    fn claimed_mut(&mut self, path: &str) -> Result<&mut DirRules> {
        self.dirs.get_mut(path).ok_or_else(|| BrtError::NotClaimed {
            path: path.to_string(),
        })
    }
}
