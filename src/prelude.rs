//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use backup_ruletree::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{BrtError, ErrorKind, Result};

// Engine
pub use crate::engine::{Engine, RuleChange, RuleImport};

// Rules
pub use crate::rules::model::{BackupType, DirRules, Directory, Rule};
pub use crate::rules::store::{MemoryRuleStore, RuleStore};
#[cfg(feature = "sqlite")]
pub use crate::rules::store::SqliteRuleStore;

// Rule trees
pub use crate::ruletree::builder::BuildReport;
pub use crate::ruletree::mount::{MountBuild, RuleTree};
pub use crate::ruletree::names::{NameCache, PrincipalNames, StaticNames, SystemNames};
pub use crate::ruletree::overlay::DirSummary;
pub use crate::ruletree::stats::{PrincipalId, RuleId, RuleSummary, Stats};

// Storage
pub use crate::tree::snapshot::SnapshotBuilder;
pub use crate::tree::store::SegmentTree;
