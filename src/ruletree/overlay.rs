//! Read-side view of one mounted snapshot: the statistics tree ("lower")
//! paired with its rule-tagged tree ("upper").
//!
//! The lower tree is authoritative for structure and ownership, the upper
//! tree for per-rule aggregates. Where the upper tree has no node (no build
//! yet) the lower aggregate is reported under rule 0; where it has a uniform
//! node, the lower aggregate of every directory below is relabelled with that
//! node's rule.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::core::errors::{BrtError, Result};
use crate::core::paths::{is_absolute_dir, is_dir_name, segments};
use crate::ruletree::stats::{
    LowerDir, LowerFile, PrincipalId, RuleId, RuleSummary, UpperBody, UpperDir, add_relabelled,
    merge_rules,
};
use crate::tree::store::{NodeRef, SegmentTree};

/// Recursive directory summary, built on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirSummary {
    pub uid: PrincipalId,
    pub gid: PrincipalId,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub claimed_by: String,
    /// Sorted by rule id.
    pub rules: Vec<RuleSummary>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, DirSummary>,
}

impl DirSummary {
    /// Fold another subtree's rule aggregates into this one.
    pub fn merge(&mut self, other: &Self) {
        merge_rules(&mut self.rules, &other.rules);
    }

    /// Total `(files, size)` across all rules.
    #[must_use]
    pub fn totals(&self) -> (u64, u64) {
        self.rules.iter().fold((0, 0), |(files, size), rule| {
            let (f, s) = rule.totals();
            (files + f, size + s)
        })
    }

    /// Aggregates for one rule, if any file below is governed by it.
    #[must_use]
    pub fn rule(&self, id: RuleId) -> Option<&RuleSummary> {
        self.rules
            .binary_search_by_key(&id, |rule| rule.id)
            .ok()
            .map(|pos| &self.rules[pos])
    }
}

// ──────────────────── overlay directories ────────────────────

/// Upper-tree counterpart of a directory.
#[derive(Debug, Clone)]
enum Upper {
    Node(NodeRef),
    Uniform(RuleId),
    Absent,
}

impl Upper {
    fn from_node(node: Option<NodeRef>) -> Result<Self> {
        let Some(node) = node else {
            return Ok(Self::Absent);
        };
        Ok(match UpperDir::peek_uniform(node.data()?)? {
            Some(id) => Self::Uniform(id),
            None => Self::Node(node),
        })
    }

    fn child(&self, name: &str) -> Result<Self> {
        match self {
            Self::Node(node) => Self::from_node(node.child(name)?),
            Self::Uniform(id) => Ok(Self::Uniform(*id)),
            Self::Absent => Ok(Self::Absent),
        }
    }
}

/// A directory inside an overlay.
#[derive(Debug, Clone)]
pub struct OverlayDir {
    lower: NodeRef,
    upper: Upper,
}

/// What a path inside an overlay names.
#[derive(Debug, Clone)]
pub enum Entry {
    Dir(OverlayDir),
    File(LowerFile),
}

impl OverlayDir {
    pub fn owner(&self) -> Result<(PrincipalId, PrincipalId)> {
        LowerDir::decode_owner(self.lower.data()?)
    }

    /// Per-rule aggregates of everything below this directory.
    pub fn rules(&self) -> Result<Vec<RuleSummary>> {
        let id = match &self.upper {
            Upper::Node(node) => match UpperDir::decode(node.data()?)?.body {
                UpperBody::Tagged(rules) => return Ok(rules),
                UpperBody::Uniform(id) => id,
            },
            Upper::Uniform(id) => *id,
            Upper::Absent => 0,
        };
        let mut rules = Vec::new();
        add_relabelled(&mut rules, id, &LowerDir::decode(self.lower.data()?)?);
        Ok(rules)
    }

    /// Subdirectory by segment name (ending in `/`).
    pub fn child(&self, name: &str) -> Result<Option<Self>> {
        if !is_dir_name(name) {
            return Ok(None);
        }
        let Some(lower) = self.lower.child(name)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            lower,
            upper: self.upper.child(name)?,
        }))
    }

    /// Subdirectories in name order.
    pub fn children(&self) -> Result<Vec<(String, Self)>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|(name, dir)| dir.map(|dir| (name, dir)))
            .collect())
    }

    /// Every direct child in name order; subdirectories carry their view,
    /// files `None`. The upper children are walked in step with the lower
    /// ones, so this costs one pass over each.
    pub fn entries(&self) -> Result<Vec<(String, Option<Self>)>> {
        let mut upper_children = match &self.upper {
            Upper::Node(node) => Some(node.children()?.peekable()),
            Upper::Uniform(_) | Upper::Absent => None,
        };
        let mut out = Vec::with_capacity(self.lower.child_count()?);
        for entry in self.lower.children()? {
            let (name, lower) = entry?;
            if !is_dir_name(name) {
                out.push((name.to_string(), None));
                continue;
            }
            let upper = match upper_children.as_mut() {
                Some(upper_children) => {
                    let mut found = None;
                    while let Some(next) = upper_children.next_if(|next| {
                        next.as_ref().map_or(true, |(upper_name, _)| *upper_name <= name)
                    }) {
                        let (upper_name, node) = next?;
                        if upper_name == name {
                            found = Some(node);
                            break;
                        }
                    }
                    Upper::from_node(found)?
                }
                None => self.upper.child(name)?,
            };
            out.push((name.to_string(), Some(Self { lower, upper })));
        }
        Ok(out)
    }

    /// Summary of this directory; with `with_children`, also a one-level
    /// summary of every subdirectory.
    pub fn summary(&self, with_children: bool) -> Result<DirSummary> {
        let (uid, gid) = self.owner()?;
        let mut summary = DirSummary {
            uid,
            gid,
            rules: self.rules()?,
            ..DirSummary::default()
        };
        if with_children {
            for (name, child) in self.children()? {
                summary.children.insert(name, child.summary(false)?);
            }
        }
        Ok(summary)
    }
}

// ──────────────────── overlay ────────────────────

/// One mounted snapshot and its current rule-tagged tree.
#[derive(Debug, Clone)]
pub struct Overlay {
    root_path: String,
    lower: SegmentTree,
    upper: Option<SegmentTree>,
}

impl Overlay {
    /// Wrap a statistics tree, which must hold exactly one top-level entry
    /// named by an absolute directory path.
    pub fn new(lower: SegmentTree, source: &Path) -> Result<Self> {
        let root = lower.root();
        let mut children = root.children()?;
        let first = children.next().transpose()?;
        let extra = children.next().is_some();
        let name = match first {
            Some((name, _)) if !extra => name.to_string(),
            _ => {
                return Err(BrtError::InvalidSnapshot {
                    path: source.to_path_buf(),
                    details: format!(
                        "expected exactly one top-level entry, found {}",
                        root.child_count()?
                    ),
                });
            }
        };
        if !is_absolute_dir(&name) {
            return Err(BrtError::InvalidRoot { name });
        }
        Ok(Self {
            root_path: name,
            lower,
            upper: None,
        })
    }

    /// Absolute path of the snapshot root, e.g. `/lustre/scratch/`.
    #[must_use]
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    #[must_use]
    pub fn lower(&self) -> &SegmentTree {
        &self.lower
    }

    #[must_use]
    pub fn upper(&self) -> Option<&SegmentTree> {
        self.upper.as_ref()
    }

    /// Same snapshot, different rule-tagged tree.
    #[must_use]
    pub fn with_upper(&self, upper: SegmentTree) -> Self {
        Self {
            root_path: self.root_path.clone(),
            lower: self.lower.clone(),
            upper: Some(upper),
        }
    }

    /// The statistics node of the snapshot root.
    pub fn top(&self) -> Result<NodeRef> {
        self.lower
            .root()
            .child(&self.root_path)?
            .ok_or_else(|| BrtError::decode("snapshot", "top-level entry vanished"))
    }

    pub fn root(&self) -> Result<OverlayDir> {
        let upper = match &self.upper {
            Some(tree) => Upper::Node(tree.root()),
            None => Upper::Absent,
        };
        Ok(OverlayDir {
            lower: self.top()?,
            upper,
        })
    }

    /// Resolve a path relative to the snapshot root (`""` is the root).
    pub fn lookup(&self, relative: &str) -> Result<Option<Entry>> {
        let mut dir = self.root()?;
        let mut rest = segments(relative).peekable();
        while let Some(segment) = rest.next() {
            let Some(lower) = dir.lower.child(segment)? else {
                return Ok(None);
            };
            if is_dir_name(segment) {
                dir = OverlayDir {
                    upper: dir.upper.child(segment)?,
                    lower,
                };
            } else if rest.peek().is_none() {
                return Ok(Some(Entry::File(LowerFile::decode(lower.data()?)?)));
            } else {
                return Ok(None);
            }
        }
        Ok(Some(Entry::Dir(dir)))
    }
}
