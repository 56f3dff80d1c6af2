#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use backup_ruletree::prelude::*;
use backup_ruletree::rules::DirRuleSet;
use backup_ruletree::ruletree::PrincipalKind;
use backup_ruletree::ruletree::stats::LowerFile;

/// One file in a fixture snapshot.
#[derive(Debug, Clone)]
pub struct FixtureFile {
    pub path: String,
    pub uid: PrincipalId,
    pub gid: PrincipalId,
    pub mtime: u64,
    pub size: u64,
}

pub fn file(path: &str, uid: PrincipalId, gid: PrincipalId, size: u64) -> FixtureFile {
    FixtureFile {
        path: path.to_string(),
        uid,
        gid,
        mtime: 1_700_000_000 + size,
        size,
    }
}

pub fn builder(root: &str, files: &[FixtureFile]) -> SnapshotBuilder {
    let mut snap = SnapshotBuilder::new(root, 0, 0).expect("snapshot root");
    for f in files {
        snap.add_file(
            &f.path,
            LowerFile {
                uid: f.uid,
                gid: f.gid,
                mtime: f.mtime,
                size: f.size,
            },
        )
        .expect("fixture file");
    }
    snap
}

pub fn snapshot(root: &str, files: &[FixtureFile]) -> SegmentTree {
    builder(root, files).to_tree().expect("serialize snapshot")
}

pub fn write_snapshot(dir: &Path, name: &str, root: &str, files: &[FixtureFile]) -> PathBuf {
    let path = dir.join(name);
    builder(root, files)
        .write_file(&path)
        .expect("write snapshot");
    path
}

pub fn names() -> StaticNames {
    StaticNames::default()
        .with(PrincipalKind::User, 1, "alice")
        .with(PrincipalKind::User, 2, "bob")
        .with(PrincipalKind::Group, 10, "lab")
}

pub fn rule_tree() -> RuleTree {
    RuleTree::new(DirRuleSet::default(), Arc::new(names())).expect("empty rule tree")
}

pub fn mount(tree: &RuleTree, root: &str, files: &[FixtureFile]) -> MountBuild {
    tree.add_tree_from(snapshot(root, files), Path::new("fixture"))
        .expect("mount fixture")
}

/// Every directory path (ending in `/`) from `root` down to each file's parent.
pub fn directories(root: &str, files: &[FixtureFile]) -> BTreeSet<String> {
    let mut dirs = BTreeSet::from([root.to_string()]);
    for f in files {
        let mut end = root.len();
        while let Some(pos) = f.path[end..].find('/') {
            end += pos + 1;
            dirs.insert(f.path[..end].to_string());
        }
    }
    dirs
}

/// Summary of every listed directory, keyed by path.
pub fn summaries(tree: &RuleTree, dirs: &BTreeSet<String>) -> BTreeMap<String, DirSummary> {
    dirs.iter()
        .map(|dir| (dir.clone(), tree.summary(dir).expect("summary")))
        .collect()
}
