//! Activity journal: append-only JSONL with rotation and graceful degradation.

pub mod journal;
pub mod jsonl;

pub use journal::{Journal, JournalEvent};
pub use jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
