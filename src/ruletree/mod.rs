//! Rule-tagged trees: building them from snapshots, reading them back
//! through the overlay, and the mount tree that ties snapshots together.

pub mod builder;
pub mod glob;
pub mod mount;
pub mod names;
pub mod overlay;
pub mod stats;

pub use builder::{BuildReport, build};
pub use self::glob::PathGlob;
pub use mount::{MountBuild, RuleTree};
pub use names::{NameCache, PrincipalKind, PrincipalNames, StaticNames, SystemNames};
pub use overlay::{DirSummary, Entry, Overlay, OverlayDir};
pub use stats::{PrincipalId, RuleId, RuleSummary, Stats};
