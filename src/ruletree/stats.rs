//! Per-rule, per-principal aggregates and the payload formats that carry them.
//!
//! Lower (statistics tree) payloads:
//!
//! ```text
//! directory: uid, gid, users[], groups[]     entry = id, mtime, files, size
//! file:      uid, gid, mtime, size
//! ```
//!
//! Upper (rule-tagged tree) directory payloads:
//!
//! ```text
//! uid, gid, KIND_TAGGED,  rule_count, rule_count × (rule_id, users[], groups[])
//! uid, gid, KIND_UNIFORM, rule_id
//! ```
//!
//! A uniform node has no children: every file below it belongs to `rule_id`,
//! so its aggregates are the lower directory's, relabelled.

#![allow(missing_docs)]

use serde::Serialize;

use crate::core::errors::{BrtError, Result};
use crate::tree::codec::{ByteReader, put_uvarint};

/// Rule identity. 0 means "no rule applies".
pub type RuleId = u64;

/// User or group id.
pub type PrincipalId = u32;

const KIND_TAGGED: u8 = 0;
const KIND_UNIFORM: u8 = 1;

// ──────────────────── aggregates ────────────────────

/// Aggregate for one principal under one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub id: PrincipalId,
    /// Display name, filled in only when a summary is produced.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Latest modification time seen, seconds since the epoch.
    pub mtime: u64,
    pub files: u64,
    pub size: u64,
}

impl Stats {
    fn absorb(&mut self, other: &Self) {
        self.mtime = self.mtime.max(other.mtime);
        self.files += other.files;
        self.size += other.size;
    }
}

/// Fold `entry` into a principal-sorted list.
pub fn add_stats(list: &mut Vec<Stats>, entry: &Stats) {
    match list.binary_search_by_key(&entry.id, |s| s.id) {
        Ok(pos) => list[pos].absorb(entry),
        Err(pos) => list.insert(
            pos,
            Stats {
                name: String::new(),
                ..entry.clone()
            },
        ),
    }
}

/// Fold every entry of `from` into `into`.
pub fn merge_stats(into: &mut Vec<Stats>, from: &[Stats]) {
    for entry in from {
        add_stats(into, entry);
    }
}

/// Aggregates for one rule within a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleSummary {
    pub id: RuleId,
    pub users: Vec<Stats>,
    pub groups: Vec<Stats>,
}

impl RuleSummary {
    /// Total `(files, size)` counted under this rule.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        self.users
            .iter()
            .fold((0, 0), |(files, size), s| (files + s.files, size + s.size))
    }
}

fn rule_slot(list: &mut Vec<RuleSummary>, id: RuleId) -> &mut RuleSummary {
    let pos = match list.binary_search_by_key(&id, |r| r.id) {
        Ok(pos) => pos,
        Err(pos) => {
            list.insert(
                pos,
                RuleSummary {
                    id,
                    ..RuleSummary::default()
                },
            );
            pos
        }
    };
    &mut list[pos]
}

/// Account one file to `rule` in a rule-sorted list.
pub fn add_file(list: &mut Vec<RuleSummary>, rule: RuleId, file: &LowerFile) {
    let slot = rule_slot(list, rule);
    for (stats, id) in [(&mut slot.users, file.uid), (&mut slot.groups, file.gid)] {
        add_stats(
            stats,
            &Stats {
                id,
                name: String::new(),
                mtime: file.mtime,
                files: 1,
                size: file.size,
            },
        );
    }
}

/// Account a whole lower directory's unclassified aggregate to `rule`.
/// Empty directories contribute nothing.
pub fn add_relabelled(list: &mut Vec<RuleSummary>, rule: RuleId, lower: &LowerDir) {
    if lower.users.is_empty() && lower.groups.is_empty() {
        return;
    }
    let slot = rule_slot(list, rule);
    merge_stats(&mut slot.users, &lower.users);
    merge_stats(&mut slot.groups, &lower.groups);
}

/// Union two rule-sorted lists, merging per-rule stats.
pub fn merge_rules(into: &mut Vec<RuleSummary>, from: &[RuleSummary]) {
    for rule in from {
        let slot = rule_slot(into, rule.id);
        merge_stats(&mut slot.users, &rule.users);
        merge_stats(&mut slot.groups, &rule.groups);
    }
}

// ──────────────────── lower payloads ────────────────────

/// Decoded statistics-tree directory payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LowerDir {
    pub uid: PrincipalId,
    pub gid: PrincipalId,
    pub users: Vec<Stats>,
    pub groups: Vec<Stats>,
}

/// Decoded statistics-tree file payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LowerFile {
    pub uid: PrincipalId,
    pub gid: PrincipalId,
    pub mtime: u64,
    pub size: u64,
}

impl LowerDir {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data, "snapshot directory payload");
        let uid = reader.read_u32()?;
        let gid = reader.read_u32()?;
        let users = read_stats(&mut reader)?;
        let groups = read_stats(&mut reader)?;
        Ok(Self {
            uid,
            gid,
            users,
            groups,
        })
    }

    /// Owner ids only; skips the aggregates.
    pub fn decode_owner(data: &[u8]) -> Result<(PrincipalId, PrincipalId)> {
        let mut reader = ByteReader::new(data, "snapshot directory payload");
        Ok((reader.read_u32()?, reader.read_u32()?))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_uvarint(out, u64::from(self.uid));
        put_uvarint(out, u64::from(self.gid));
        write_stats(out, &self.users);
        write_stats(out, &self.groups);
    }

    /// Total `(files, size)` across all users.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        self.users
            .iter()
            .fold((0, 0), |(files, size), s| (files + s.files, size + s.size))
    }
}

impl LowerFile {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data, "snapshot file payload");
        Ok(Self {
            uid: reader.read_u32()?,
            gid: reader.read_u32()?,
            mtime: reader.read_uvarint()?,
            size: reader.read_uvarint()?,
        })
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_uvarint(out, u64::from(self.uid));
        put_uvarint(out, u64::from(self.gid));
        put_uvarint(out, self.mtime);
        put_uvarint(out, self.size);
    }
}

fn read_stats(reader: &mut ByteReader<'_>) -> Result<Vec<Stats>> {
    let count = reader.read_len()?;
    let mut list = Vec::with_capacity(count);
    for _ in 0..count {
        list.push(Stats {
            id: reader.read_u32()?,
            name: String::new(),
            mtime: reader.read_uvarint()?,
            files: reader.read_uvarint()?,
            size: reader.read_uvarint()?,
        });
    }
    Ok(list)
}

fn write_stats(out: &mut Vec<u8>, list: &[Stats]) {
    put_uvarint(out, list.len() as u64);
    for s in list {
        put_uvarint(out, u64::from(s.id));
        put_uvarint(out, s.mtime);
        put_uvarint(out, s.files);
        put_uvarint(out, s.size);
    }
}

// ──────────────────── upper payloads ────────────────────

/// Aggregates carried by a rule-tagged directory node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpperBody {
    /// Explicit per-rule aggregates; children follow in the tree.
    Tagged(Vec<RuleSummary>),
    /// Everything below belongs to one rule; no children.
    Uniform(RuleId),
}

/// Decoded rule-tagged directory payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpperDir {
    pub uid: PrincipalId,
    pub gid: PrincipalId,
    pub body: UpperBody,
}

impl UpperDir {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data, "rule-tagged directory payload");
        let uid = reader.read_u32()?;
        let gid = reader.read_u32()?;
        let body = match reader.read_u8()? {
            KIND_TAGGED => {
                let count = reader.read_len()?;
                let mut rules = Vec::with_capacity(count);
                for _ in 0..count {
                    rules.push(RuleSummary {
                        id: reader.read_uvarint()?,
                        users: read_stats(&mut reader)?,
                        groups: read_stats(&mut reader)?,
                    });
                }
                UpperBody::Tagged(rules)
            }
            KIND_UNIFORM => UpperBody::Uniform(reader.read_uvarint()?),
            other => {
                return Err(BrtError::decode(
                    "rule-tagged directory payload",
                    format!("unknown node kind {other}"),
                ));
            }
        };
        Ok(Self { uid, gid, body })
    }

    /// Rule id of a uniform payload without decoding anything else.
    pub fn peek_uniform(data: &[u8]) -> Result<Option<RuleId>> {
        let mut reader = ByteReader::new(data, "rule-tagged directory payload");
        reader.read_u32()?;
        reader.read_u32()?;
        if reader.read_u8()? == KIND_UNIFORM {
            Ok(Some(reader.read_uvarint()?))
        } else {
            Ok(None)
        }
    }
}

/// Encode a tagged upper payload.
pub fn encode_tagged(out: &mut Vec<u8>, uid: PrincipalId, gid: PrincipalId, rules: &[RuleSummary]) {
    put_uvarint(out, u64::from(uid));
    put_uvarint(out, u64::from(gid));
    out.push(KIND_TAGGED);
    put_uvarint(out, rules.len() as u64);
    for rule in rules {
        put_uvarint(out, rule.id);
        write_stats(out, &rule.users);
        write_stats(out, &rule.groups);
    }
}

/// Encode a uniform upper payload.
pub fn encode_uniform(out: &mut Vec<u8>, uid: PrincipalId, gid: PrincipalId, rule: RuleId) {
    put_uvarint(out, u64::from(uid));
    put_uvarint(out, u64::from(gid));
    out.push(KIND_UNIFORM);
    put_uvarint(out, rule);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(id: PrincipalId, mtime: u64, files: u64, size: u64) -> Stats {
        Stats {
            id,
            name: String::new(),
            mtime,
            files,
            size,
        }
    }

    #[test]
    fn add_stats_keeps_principal_order_and_merges() {
        let mut list = Vec::new();
        add_stats(&mut list, &stats(7, 10, 1, 100));
        add_stats(&mut list, &stats(2, 50, 1, 5));
        add_stats(&mut list, &stats(7, 4, 2, 1));

        assert_eq!(list, vec![stats(2, 50, 1, 5), stats(7, 10, 3, 101)]);
    }

    #[test]
    fn add_file_counts_user_and_group() {
        let mut rules = Vec::new();
        let file = LowerFile {
            uid: 1,
            gid: 2,
            mtime: 4,
            size: 3,
        };
        add_file(&mut rules, 9, &file);
        add_file(&mut rules, 0, &file);

        assert_eq!(rules.iter().map(|r| r.id).collect::<Vec<_>>(), vec![0, 9]);
        assert_eq!(rules[1].users, vec![stats(1, 4, 1, 3)]);
        assert_eq!(rules[1].groups, vec![stats(2, 4, 1, 3)]);
    }

    #[test]
    fn relabelling_an_empty_directory_adds_no_rule() {
        let mut rules = Vec::new();
        add_relabelled(&mut rules, 5, &LowerDir::default());
        assert!(rules.is_empty());
    }

    #[test]
    fn merge_rules_unions_ids() {
        let mut left = vec![RuleSummary {
            id: 1,
            users: vec![stats(1, 5, 1, 10)],
            groups: vec![stats(1, 5, 1, 10)],
        }];
        let right = vec![
            RuleSummary {
                id: 1,
                users: vec![stats(1, 9, 2, 1)],
                groups: vec![stats(3, 9, 2, 1)],
            },
            RuleSummary {
                id: 4,
                users: vec![stats(2, 1, 1, 1)],
                groups: vec![stats(2, 1, 1, 1)],
            },
        ];
        merge_rules(&mut left, &right);

        assert_eq!(left.len(), 2);
        assert_eq!(left[0].users, vec![stats(1, 9, 3, 11)]);
        assert_eq!(left[0].groups, vec![stats(1, 5, 1, 10), stats(3, 9, 2, 1)]);
        assert_eq!(left[1].totals(), (1, 1));
    }

    #[test]
    fn lower_payloads_decode_what_they_encode() {
        let dir = LowerDir {
            uid: 1000,
            gid: 100,
            users: vec![stats(1000, 1_700_000_000, 3, 4096)],
            groups: vec![stats(100, 1_700_000_000, 3, 4096)],
        };
        let mut buf = Vec::new();
        dir.encode(&mut buf);
        assert_eq!(LowerDir::decode(&buf).unwrap(), dir);
        assert_eq!(LowerDir::decode_owner(&buf).unwrap(), (1000, 100));

        assert!(LowerDir::decode(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn upper_kinds_are_distinguished() {
        let mut tagged = Vec::new();
        encode_tagged(&mut tagged, 1, 2, &[]);
        let mut uniform = Vec::new();
        encode_uniform(&mut uniform, 1, 2, 42);

        assert_eq!(UpperDir::peek_uniform(&tagged).unwrap(), None);
        assert_eq!(UpperDir::peek_uniform(&uniform).unwrap(), Some(42));
        assert_eq!(
            UpperDir::decode(&uniform).unwrap().body,
            UpperBody::Uniform(42)
        );

        let mut bad = uniform.clone();
        bad[2] = 9;
        assert_eq!(UpperDir::decode(&bad).unwrap_err().code(), "BRT-2301");
    }
}
