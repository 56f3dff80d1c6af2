//! BRT-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, BrtError>;

/// Broad failure classes, used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed snapshot or illegal mount layout. Fatal to the load.
    Structural,
    /// Missing path, missing rule, duplicate rule. Recoverable.
    Lookup,
    /// Corrupt payload or pattern set. Fatal to the rebuild in progress.
    Decode,
    /// Bad or missing configuration.
    Config,
    /// Persistence or filesystem failure.
    Storage,
}

/// Top-level error type for the rule-tree engine.
#[derive(Debug, Error)]
pub enum BrtError {
    #[error("[BRT-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[BRT-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[BRT-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[BRT-2001] invalid snapshot {path}: {details}")]
    InvalidSnapshot { path: PathBuf, details: String },

    #[error("[BRT-2002] snapshot root {name:?} is not an absolute directory path")]
    InvalidRoot { name: String },

    #[error("[BRT-2003] cannot mount {path}: snapshot roots may not nest")]
    DeepTree { path: String },

    #[error("[BRT-2101] path not found: {path}")]
    NotFound { path: String },

    #[error("[BRT-2102] no rule {pattern:?} in directory {directory}")]
    RuleNotFound { directory: String, pattern: String },

    #[error("[BRT-2103] rule {pattern:?} already exists in directory {directory}")]
    RuleExists { directory: String, pattern: String },

    #[error("[BRT-2104] directory already claimed: {path}")]
    DirectoryClaimed { path: String },

    #[error("[BRT-2105] directory not claimed: {path}")]
    NotClaimed { path: String },

    #[error("[BRT-2106] directory {path} still has {rules} rule(s)")]
    ClaimHasRules { path: String, rules: usize },

    #[error("[BRT-2107] rule {rule_id} refers to unknown directory {directory_id}")]
    OrphanedRule { rule_id: u64, directory_id: i64 },

    #[error("[BRT-2108] invalid match {pattern:?}: {reason}")]
    InvalidMatch { pattern: String, reason: &'static str },

    #[error("[BRT-2201] conflicting pattern {pattern:?}")]
    PatternConflict { pattern: String },

    #[error("[BRT-2301] corrupt {context}: {details}")]
    Decode {
        context: &'static str,
        details: String,
    },

    #[error("[BRT-2302] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[BRT-3001] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[BRT-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BrtError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "BRT-1001",
            Self::MissingConfig { .. } => "BRT-1002",
            Self::ConfigParse { .. } => "BRT-1003",
            Self::InvalidSnapshot { .. } => "BRT-2001",
            Self::InvalidRoot { .. } => "BRT-2002",
            Self::DeepTree { .. } => "BRT-2003",
            Self::NotFound { .. } => "BRT-2101",
            Self::RuleNotFound { .. } => "BRT-2102",
            Self::RuleExists { .. } => "BRT-2103",
            Self::DirectoryClaimed { .. } => "BRT-2104",
            Self::NotClaimed { .. } => "BRT-2105",
            Self::ClaimHasRules { .. } => "BRT-2106",
            Self::OrphanedRule { .. } => "BRT-2107",
            Self::InvalidMatch { .. } => "BRT-2108",
            Self::PatternConflict { .. } => "BRT-2201",
            Self::Decode { .. } => "BRT-2301",
            Self::Serialization { .. } => "BRT-2302",
            Self::Sql { .. } => "BRT-3001",
            Self::Io { .. } => "BRT-3002",
        }
    }

    /// Failure class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig { .. } | Self::MissingConfig { .. } | Self::ConfigParse { .. } => {
                ErrorKind::Config
            }
            Self::InvalidSnapshot { .. } | Self::InvalidRoot { .. } | Self::DeepTree { .. } => {
                ErrorKind::Structural
            }
            Self::NotFound { .. }
            | Self::RuleNotFound { .. }
            | Self::RuleExists { .. }
            | Self::DirectoryClaimed { .. }
            | Self::NotClaimed { .. }
            | Self::ClaimHasRules { .. }
            | Self::InvalidMatch { .. } => ErrorKind::Lookup,
            Self::OrphanedRule { .. }
            | Self::PatternConflict { .. }
            | Self::Decode { .. }
            | Self::Serialization { .. } => ErrorKind::Decode,
            Self::Sql { .. } | Self::Io { .. } => ErrorKind::Storage,
        }
    }

    /// Whether the caller can correct the request and try again.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Lookup)
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn decode(context: &'static str, details: impl Into<String>) -> Self {
        Self::Decode {
            context,
            details: details.into(),
        }
    }

    pub(crate) fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for BrtError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for BrtError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for BrtError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<BrtError> {
        vec![
            BrtError::InvalidConfig {
                details: String::new(),
            },
            BrtError::MissingConfig {
                path: PathBuf::new(),
            },
            BrtError::ConfigParse {
                context: "",
                details: String::new(),
            },
            BrtError::InvalidSnapshot {
                path: PathBuf::new(),
                details: String::new(),
            },
            BrtError::InvalidRoot {
                name: String::new(),
            },
            BrtError::DeepTree {
                path: String::new(),
            },
            BrtError::NotFound {
                path: String::new(),
            },
            BrtError::RuleNotFound {
                directory: String::new(),
                pattern: String::new(),
            },
            BrtError::RuleExists {
                directory: String::new(),
                pattern: String::new(),
            },
            BrtError::DirectoryClaimed {
                path: String::new(),
            },
            BrtError::NotClaimed {
                path: String::new(),
            },
            BrtError::ClaimHasRules {
                path: String::new(),
                rules: 1,
            },
            BrtError::OrphanedRule {
                rule_id: 1,
                directory_id: 2,
            },
            BrtError::InvalidMatch {
                pattern: String::new(),
                reason: "",
            },
            BrtError::PatternConflict {
                pattern: String::new(),
            },
            BrtError::Decode {
                context: "",
                details: String::new(),
            },
            BrtError::Serialization {
                context: "",
                details: String::new(),
            },
            BrtError::Sql {
                context: "",
                details: String::new(),
            },
            BrtError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(BrtError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn display_starts_with_code() {
        for err in all_variants() {
            let text = err.to_string();
            assert!(
                text.starts_with(&format!("[{}]", err.code())),
                "display {text:?} does not lead with {}",
                err.code()
            );
        }
    }

    #[test]
    fn only_lookup_errors_are_recoverable() {
        let exists = BrtError::RuleExists {
            directory: "/a/".to_string(),
            pattern: "*".to_string(),
        };
        assert!(exists.is_recoverable());
        assert_eq!(exists.kind(), ErrorKind::Lookup);

        let deep = BrtError::DeepTree {
            path: "/a/b/".to_string(),
        };
        assert!(!deep.is_recoverable());
        assert_eq!(deep.kind(), ErrorKind::Structural);

        let corrupt = BrtError::decode("payload", "truncated varint");
        assert_eq!(corrupt.kind(), ErrorKind::Decode);
        assert!(!corrupt.is_recoverable());
    }
}
