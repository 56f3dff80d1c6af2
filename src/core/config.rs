//! Configuration system: TOML file + env var overrides + defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{BrtError, Result};
use crate::core::paths::resolve_absolute_path;

/// Full engine configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub rules: RulesConfig,
    pub snapshots: SnapshotsConfig,
    pub names: NamesConfig,
    pub journal: JournalConfig,
    pub paths: PathsConfig,
}

/// Where claimed directories and their rules are persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RulesConfig {
    pub database: PathBuf,
}

/// Statistics tree files mounted when the engine starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct SnapshotsConfig {
    pub files: Vec<PathBuf>,
}

/// Principal (user/group) name resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NamesConfig {
    /// How long a resolved name is trusted before it is looked up again.
    pub cache_ttl_seconds: u64,
}

/// Activity journal (JSONL) settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    pub fsync_interval_seconds: u64,
}

/// Bookkeeping for where configuration and data live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            database: PathsConfig::default().data_dir.join("rules.sqlite3"),
        }
    }
}

impl Default for NamesConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 60 * 60,
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathsConfig::default().data_dir.join("activity.jsonl"),
            fallback_path: None,
            max_size_bytes: 64 * 1024 * 1024,
            max_rotated_files: 5,
            fsync_interval_seconds: 30,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!(
                    "[BRT-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths"
                );
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        Self {
            config_file: home_dir.join(".config").join("ruletree").join("config.toml"),
            data_dir: home_dir.join(".local").join("share").join("ruletree"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| BrtError::io(&path_buf, source))?;
            toml::from_str::<Self>(&raw)?
        } else if path.is_some() {
            return Err(BrtError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the activity journal.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes and
    /// toolchain releases.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("BRT_RULES_DATABASE") {
            self.rules.database = PathBuf::from(raw);
        }

        // Colon-separated, like PATH.
        if let Some(raw) = lookup("BRT_SNAPSHOT_FILES") {
            self.snapshots.files = env::split_paths(&raw).filter(|p| !p.as_os_str().is_empty()).collect();
        }

        if let Some(raw) = lookup("BRT_NAMES_CACHE_TTL_SECONDS") {
            self.names.cache_ttl_seconds = parse_env_u64("BRT_NAMES_CACHE_TTL_SECONDS", &raw)?;
        }

        if let Some(raw) = lookup("BRT_JOURNAL_ENABLED") {
            self.journal.enabled = parse_env_bool("BRT_JOURNAL_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("BRT_JOURNAL_PATH") {
            self.journal.path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("BRT_JOURNAL_FALLBACK_PATH") {
            self.journal.fallback_path = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("BRT_JOURNAL_MAX_SIZE_BYTES") {
            self.journal.max_size_bytes = parse_env_u64("BRT_JOURNAL_MAX_SIZE_BYTES", &raw)?;
        }

        Ok(())
    }

    /// Make every configured file path absolute so later comparisons and
    /// journal records are unambiguous.
    fn normalize_paths(&mut self) {
        self.rules.database = resolve_absolute_path(&self.rules.database);
        self.journal.path = resolve_absolute_path(&self.journal.path);
        if let Some(fallback) = &mut self.journal.fallback_path {
            *fallback = resolve_absolute_path(fallback);
        }
        for file in &mut self.snapshots.files {
            *file = resolve_absolute_path(file);
        }
    }

    fn validate(&self) -> Result<()> {
        if self.names.cache_ttl_seconds == 0 {
            return Err(BrtError::InvalidConfig {
                details: "names.cache_ttl_seconds must be > 0".to_string(),
            });
        }

        if self.journal.enabled {
            if self.journal.max_size_bytes < 4096 {
                return Err(BrtError::InvalidConfig {
                    details: format!(
                        "journal.max_size_bytes must be at least 4096, got {}",
                        self.journal.max_size_bytes
                    ),
                });
            }
            if self.journal.max_rotated_files == 0 {
                return Err(BrtError::InvalidConfig {
                    details: "journal.max_rotated_files must be >= 1".to_string(),
                });
            }
            if self.journal.fallback_path.as_ref() == Some(&self.journal.path) {
                return Err(BrtError::InvalidConfig {
                    details: "journal.fallback_path must differ from journal.path".to_string(),
                });
            }
        }

        let mut seen = std::collections::HashSet::new();
        for file in &self.snapshots.files {
            if !seen.insert(file) {
                return Err(BrtError::InvalidConfig {
                    details: format!("snapshots.files lists {} twice", file.display()),
                });
            }
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|error| BrtError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BrtError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: expected a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{BrtError, Config};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_name_ttl_rejected() {
        let mut cfg = Config::default();
        cfg.names.cache_ttl_seconds = 0;
        let err = cfg.validate().expect_err("expected invalid ttl");
        assert!(matches!(err, BrtError::InvalidConfig { .. }));
        assert!(err.to_string().contains("cache_ttl_seconds"));
    }

    #[test]
    fn tiny_journal_rejected_only_when_enabled() {
        let mut cfg = Config::default();
        cfg.journal.max_size_bytes = 100;
        assert!(cfg.validate().is_err());
        cfg.journal.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duplicate_snapshot_files_rejected() {
        let mut cfg = Config::default();
        cfg.snapshots.files = vec![PathBuf::from("/data/a.db"), PathBuf::from("/data/a.db")];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut cfg = Config::default();
        let env = vars(&[
            ("BRT_RULES_DATABASE", "/srv/rules.db"),
            ("BRT_SNAPSHOT_FILES", "/srv/a.tree:/srv/b.tree"),
            ("BRT_NAMES_CACHE_TTL_SECONDS", "90"),
            ("BRT_JOURNAL_ENABLED", "off"),
        ]);
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())
            .expect("overrides apply");

        assert_eq!(cfg.rules.database, PathBuf::from("/srv/rules.db"));
        assert_eq!(
            cfg.snapshots.files,
            vec![PathBuf::from("/srv/a.tree"), PathBuf::from("/srv/b.tree")]
        );
        assert_eq!(cfg.names.cache_ttl_seconds, 90);
        assert!(!cfg.journal.enabled);
    }

    #[test]
    fn env_invalid_number_rejected() {
        let mut cfg = Config::default();
        let env = vars(&[("BRT_NAMES_CACHE_TTL_SECONDS", "soon")]);
        let err = cfg
            .apply_env_overrides_from(|name| env.get(name).cloned())
            .unwrap_err();
        assert!(matches!(err, BrtError::ConfigParse { context: "env", .. }));
    }

    #[test]
    fn load_reads_toml_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[names]\ncache_ttl_seconds = 5\n\n[snapshots]\nfiles = [\"/data/scan.tree\"]\n",
        )
        .expect("write config");

        let cfg = Config::load(Some(&path)).expect("load config");
        assert_eq!(cfg.names.cache_ttl_seconds, 5);
        assert_eq!(cfg.snapshots.files, vec![PathBuf::from("/data/scan.tree")]);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load(Some(Path::new("/nonexistent/ruletree/config.toml")));
        assert!(matches!(result, Err(BrtError::MissingConfig { .. })));
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let cfg = Config::default();
        let before = cfg.stable_hash().expect("hash");
        let mut changed = cfg.clone();
        changed.names.cache_ttl_seconds += 1;
        assert_ne!(before, changed.stable_hash().expect("hash"));
        assert_eq!(before, cfg.stable_hash().expect("hash"));
    }
}
