#![deny(unsafe_code)]

//! Backup rule-tree engine.
//!
//! Filesystem statistics snapshots (per-directory, per-user and per-group
//! file counts and sizes) are classified by backup rules that users attach to
//! directories they claim. For every mounted snapshot the engine keeps a
//! rule-tagged tree holding per-rule aggregates, and patches it incrementally
//! when a rule changes: only the parts of the tree the change can affect are
//! walked again, everything else is copied from the previous build.
//!
//! Pieces, bottom-up:
//! 1. **Segment trees** ([`tree`]): immutable, memory-mappable node stores
//! 2. **Rules** ([`rules`]): claims, rules, persistence and compilation into
//!    path matchers
//! 3. **Rule trees** ([`ruletree`]): builder, overlay reads and the mount tree
//! 4. **Engine** ([`engine`]): store, tree and activity journal together
//!
//! ```rust,no_run
//! use backup_ruletree::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let engine = Engine::open(Config::load(None)?)?;
//! engine.claim("/lustre/proj/", "alice")?;
//! engine.create_rule("/lustre/proj/", Rule::new(0, "*.cram", BackupType::IBackup))?;
//! let summary = engine.summary("/lustre/")?;
//! # let _ = summary;
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod core;
pub mod engine;
pub mod logger;
pub mod rules;
pub mod ruletree;
pub mod tree;
