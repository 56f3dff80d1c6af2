//! Rule-tagged tree builder.
//!
//! Walks a statistics tree under the guidance of [`CompiledRules`] and writes
//! a tree holding one node per directory, whose payload groups the
//! directory's aggregates by rule id. Directives decide how much work each
//! directory costs:
//!
//! - `Process`: every file is looked up individually, subdirectories recurse;
//! - `Assign`: the snapshot's unclassified aggregate is relabelled and the
//!   directory is written as a single uniform node;
//! - `Reuse`: the node from the previous tagged tree is copied verbatim
//!   (falling back to relabelling when there is no previous node).
//!
//! A full build passes no previous tree; a patch passes the tree it replaces,
//! and only directories on the path to a rule change get walked again.

#![allow(missing_docs)]

use std::cmp::Ordering;
use std::io::Write;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::errors::Result;
use crate::core::paths::is_dir_name;
use crate::rules::compiler::{CompiledRules, Directive};
use crate::ruletree::stats::{
    LowerDir, LowerFile, RuleId, RuleSummary, UpperBody, UpperDir, add_file, add_relabelled,
    encode_tagged, encode_uniform, merge_rules,
};
use crate::tree::store::{Children, NodeRef, SegmentTree, TreeWriter};

/// What a build did, for the journal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub processed: u64,
    pub assigned: u64,
    pub reused: u64,
    /// Entries of the previous tree read while pairing directories with
    /// their earlier counterparts.
    pub prior_visited: u64,
    pub files: u64,
    pub bytes: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// The counterpart of a directory in the previous tagged tree.
#[derive(Debug, Clone)]
enum Prior {
    Node(NodeRef),
    Uniform(RuleId),
    Absent,
}

impl Prior {
    fn of(node: NodeRef) -> Result<Self> {
        Ok(match UpperDir::peek_uniform(node.data()?)? {
            Some(id) => Self::Uniform(id),
            None => Self::Node(node),
        })
    }
}

/// The children of a [`Prior`], consumed in name order alongside the lower
/// directory's children. Every prior entry is read at most once per parent.
enum PriorChildren<'p> {
    Node {
        children: Children<'p>,
        pending: Option<(&'p str, NodeRef)>,
    },
    Uniform(RuleId),
    Absent,
}

impl<'p> PriorChildren<'p> {
    fn new(prior: &'p Prior) -> Result<Self> {
        Ok(match prior {
            Prior::Node(node) => Self::Node {
                children: node.children()?,
                pending: None,
            },
            Prior::Uniform(id) => Self::Uniform(*id),
            Prior::Absent => Self::Absent,
        })
    }

    /// Counterpart of the child `name`. Names must come in increasing order.
    fn seek(&mut self, name: &str, visited: &mut u64) -> Result<Prior> {
        let (children, pending) = match self {
            Self::Node { children, pending } => (children, pending),
            Self::Uniform(id) => return Ok(Prior::Uniform(*id)),
            Self::Absent => return Ok(Prior::Absent),
        };
        loop {
            let (child_name, node) = match pending.take() {
                Some(entry) => entry,
                None => match children.next() {
                    Some(entry) => {
                        *visited += 1;
                        entry?
                    }
                    None => return Ok(Prior::Absent),
                },
            };
            match child_name.cmp(name) {
                Ordering::Less => {}
                Ordering::Equal => return Prior::of(node),
                Ordering::Greater => {
                    *pending = Some((child_name, node));
                    return Ok(Prior::Absent);
                }
            }
        }
    }
}

struct Builder<'r, W: Write> {
    rules: &'r CompiledRules,
    writer: TreeWriter<W>,
    path: String,
    /// Scratch rule lists, one per depth, reused across sibling directories.
    frames: Vec<Vec<RuleSummary>>,
    payload: Vec<u8>,
    report: BuildReport,
}

/// Build the tagged tree for the snapshot directory `top` at `root_path`.
///
/// `top` is the single top-level entry of a statistics tree. The returned
/// tree's root stands for that directory. With `prior`, unchanged regions
/// are copied from it.
pub fn build(
    top: &NodeRef,
    root_path: &str,
    rules: &CompiledRules,
    prior: Option<&SegmentTree>,
) -> Result<(SegmentTree, BuildReport)> {
    let started = Instant::now();
    let mut builder = Builder {
        rules,
        writer: TreeWriter::new(Vec::with_capacity(4096))?,
        path: root_path.to_string(),
        frames: Vec::new(),
        payload: Vec::with_capacity(256),
        report: BuildReport::default(),
    };
    let prior = prior.map_or(Prior::Absent, |tree| Prior::Node(tree.root()));

    let (uid, gid) = LowerDir::decode_owner(top.data()?)?;
    let summaries = builder.process(top, &prior, 0)?;
    builder.payload.clear();
    encode_tagged(&mut builder.payload, uid, gid, &summaries);

    let Builder {
        writer,
        payload,
        mut report,
        ..
    } = builder;
    let bytes = writer.finish(&payload)?;
    report.bytes = bytes.len() as u64;
    report.elapsed = started.elapsed();
    Ok((SegmentTree::from_bytes(bytes)?, report))
}

impl<W: Write> Builder<'_, W> {
    fn take_frame(&mut self, depth: usize) -> Vec<RuleSummary> {
        if self.frames.len() <= depth {
            self.frames.resize_with(depth + 1, Vec::new);
        }
        let mut frame = std::mem::take(&mut self.frames[depth]);
        frame.clear();
        frame
    }

    fn put_frame(&mut self, depth: usize, frame: Vec<RuleSummary>) {
        self.frames[depth] = frame;
    }

    /// Dispatch every child of `lower`; returns the directory's rule list.
    /// `self.path` names `lower` on entry and on return.
    fn process(&mut self, lower: &NodeRef, prior: &Prior, depth: usize) -> Result<Vec<RuleSummary>> {
        self.report.processed += 1;
        let mut summaries = self.take_frame(depth);
        let mut prior_children = PriorChildren::new(prior)?;
        for entry in lower.children()? {
            let (name, child) = entry?;
            let len = self.path.len();
            self.path.push_str(name);
            if is_dir_name(name) {
                self.directory(name, &child, &mut prior_children, depth, &mut summaries)?;
            } else {
                let file = LowerFile::decode(child.data()?)?;
                add_file(&mut summaries, self.rules.rule_for(&self.path), &file);
                self.report.files += 1;
            }
            self.path.truncate(len);
        }
        Ok(summaries)
    }

    fn directory(
        &mut self,
        name: &str,
        lower: &NodeRef,
        prior_children: &mut PriorChildren<'_>,
        depth: usize,
        into: &mut Vec<RuleSummary>,
    ) -> Result<()> {
        match self.rules.directive_for(&self.path) {
            Directive::Process => {
                let prior = prior_children.seek(name, &mut self.report.prior_visited)?;
                let (uid, gid) = LowerDir::decode_owner(lower.data()?)?;
                self.writer.open_dir();
                let summaries = self.process(lower, &prior, depth + 1)?;
                self.payload.clear();
                encode_tagged(&mut self.payload, uid, gid, &summaries);
                self.writer.close_dir(name, &self.payload)?;
                merge_rules(into, &summaries);
                self.put_frame(depth + 1, summaries);
                Ok(())
            }
            Directive::Assign(id) => {
                self.report.assigned += 1;
                self.uniform(name, lower, id, into)
            }
            Directive::Reuse(id) => self.reuse(name, lower, prior_children, id, into),
            Directive::Unmatched => self.reuse(name, lower, prior_children, 0, into),
        }
    }

    fn uniform(&mut self, name: &str, lower: &NodeRef, id: RuleId, into: &mut Vec<RuleSummary>) -> Result<()> {
        let aggregate = LowerDir::decode(lower.data()?)?;
        self.payload.clear();
        encode_uniform(&mut self.payload, aggregate.uid, aggregate.gid, id);
        self.writer.leaf(name, &self.payload)?;
        add_relabelled(into, id, &aggregate);
        Ok(())
    }

    fn reuse(
        &mut self,
        name: &str,
        lower: &NodeRef,
        prior_children: &mut PriorChildren<'_>,
        id: RuleId,
        into: &mut Vec<RuleSummary>,
    ) -> Result<()> {
        self.report.reused += 1;
        match prior_children.seek(name, &mut self.report.prior_visited)? {
            Prior::Node(node) => {
                if let UpperBody::Tagged(summaries) = UpperDir::decode(node.data()?)?.body {
                    merge_rules(into, &summaries);
                }
                self.writer.copy_subtree(name, &node)
            }
            Prior::Uniform(previous) => self.uniform(name, lower, previous, into),
            Prior::Absent => self.uniform(name, lower, id, into),
        }
    }
}
