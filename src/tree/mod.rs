//! Segment tree storage: the physical substrate for snapshots and the
//! rule-tagged trees derived from them.

pub mod codec;
pub mod snapshot;
pub mod store;

pub use snapshot::SnapshotBuilder;
pub use store::{NodeRef, SegmentTree, TreeWriter};
