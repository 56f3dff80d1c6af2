//! Rule records, their persistence, and compilation into path matchers.

pub mod compiler;
pub mod matcher;
pub mod model;
pub mod store;

pub use compiler::{CompiledRules, Directive, compile};
pub use matcher::PathMatcher;
pub use model::{BackupType, DirRuleSet, DirRules, Directory, Rule};
pub use store::{MemoryRuleStore, RuleStore};
#[cfg(feature = "sqlite")]
pub use store::SqliteRuleStore;
