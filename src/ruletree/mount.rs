//! The mount tree: every loaded snapshot stitched under one namespace, plus
//! the claimed directories and rules that classify them.
//!
//! Virtual directories route a path prefix to the snapshot mounted below
//! it; a snapshot root may not sit inside another. All mutation happens
//! under one exclusive lock and ends with a single commit, so readers see
//! either the old state or the new one. A failed rebuild leaves the
//! committed state untouched.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::core::errors::{BrtError, Result};
use crate::core::paths::{is_dir_name, segments};
use crate::rules::compiler::{CompiledRules, compile};
use crate::rules::model::{DirRuleSet, DirRules, Directory, Rule};
use crate::rules::store::RuleStore;
use crate::ruletree::builder::{BuildReport, build};
use crate::ruletree::glob::PathGlob;
use crate::ruletree::names::{PrincipalNames, label_summary};
use crate::ruletree::overlay::{DirSummary, Entry, Overlay, OverlayDir};
use crate::ruletree::stats::{PrincipalId, RuleId};
use crate::tree::store::SegmentTree;

/// One rebuilt snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountBuild {
    pub root: String,
    /// A snapshot was already mounted at `root` and has been released.
    pub replaced: bool,
    pub build: BuildReport,
}

#[derive(Debug, Clone, Default)]
struct VirtualDir {
    children: BTreeMap<String, MountEntry>,
}

#[derive(Debug, Clone)]
enum MountEntry {
    Dir(VirtualDir),
    Overlay(Box<Overlay>),
}

enum Located<'a> {
    Virtual(&'a VirtualDir),
    Inside(&'a Overlay, &'a str),
}

impl VirtualDir {
    fn locate<'a>(&'a self, path: &'a str) -> Option<Located<'a>> {
        let mut dir = self;
        for segment in segments(path) {
            match dir.children.get(segment)? {
                MountEntry::Dir(next) => dir = next,
                MountEntry::Overlay(overlay) => {
                    let relative = &path[overlay.root_path().len()..];
                    return Some(Located::Inside(overlay, relative));
                }
            }
        }
        Some(Located::Virtual(dir))
    }

    /// Fail unless a snapshot can be mounted at `root` (free, or holding a
    /// snapshot that will be replaced).
    fn check_placement(&self, root: &str) -> Result<()> {
        let deep = || BrtError::DeepTree {
            path: root.to_string(),
        };
        let mut dir = self;
        let mut rest = segments(root).peekable();
        while let Some(segment) = rest.next() {
            let last = rest.peek().is_none();
            match dir.children.get(segment) {
                None => return Ok(()),
                Some(MountEntry::Overlay(_)) if last => return Ok(()),
                Some(MountEntry::Overlay(_)) => return Err(deep()),
                Some(MountEntry::Dir(_)) if last => return Err(deep()),
                Some(MountEntry::Dir(next)) => dir = next,
            }
        }
        Err(deep())
    }

    /// Install `overlay` at its root path, returning what it displaced.
    fn place(&mut self, overlay: Overlay) -> Option<Overlay> {
        let root = overlay.root_path().to_string();
        let mut all: Vec<&str> = segments(&root).collect();
        let last = all.pop()?;
        let mut dir = self;
        for segment in all {
            let entry = dir
                .children
                .entry(segment.to_string())
                .or_insert_with(|| MountEntry::Dir(VirtualDir::default()));
            dir = match entry {
                MountEntry::Dir(next) => next,
                MountEntry::Overlay(_) => return None,
            };
        }
        match dir
            .children
            .insert(last.to_string(), MountEntry::Overlay(Box::new(overlay)))
        {
            Some(MountEntry::Overlay(old)) => Some(*old),
            _ => None,
        }
    }

    fn overlays<'a>(&'a self, out: &mut Vec<&'a Overlay>) {
        for entry in self.children.values() {
            match entry {
                MountEntry::Dir(dir) => dir.overlays(out),
                MountEntry::Overlay(overlay) => out.push(overlay),
            }
        }
    }

    fn summary(&self, with_children: bool) -> Result<DirSummary> {
        let mut summary = DirSummary::default();
        for (name, entry) in &self.children {
            let child = match entry {
                MountEntry::Dir(dir) => dir.summary(false)?,
                MountEntry::Overlay(overlay) => overlay.root()?.summary(false)?,
            };
            summary.merge(&child);
            if with_children {
                summary.children.insert(name.clone(), child);
            }
        }
        Ok(summary)
    }
}

struct MountState {
    root: VirtualDir,
    rules: DirRuleSet,
    /// Every claimed directory compiled, for `rule_for`.
    compiled: CompiledRules,
}

/// Mounted snapshots and the rules classifying them.
pub struct RuleTree {
    state: RwLock<MountState>,
    names: Arc<dyn PrincipalNames>,
}

impl std::fmt::Debug for RuleTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RuleTree")
            .field("directories", &state.rules.len())
            .field("rules", &state.rules.rule_count())
            .finish_non_exhaustive()
    }
}

/// Cursor for glob expansion.
enum GlobAt<'a> {
    Virtual(&'a VirtualDir),
    Dir(OverlayDir),
}

impl RuleTree {
    /// Empty mount tree over an existing rule set.
    pub fn new(rules: DirRuleSet, names: Arc<dyn PrincipalNames>) -> Result<Self> {
        let compiled = CompiledRules::all(&rules)?;
        Ok(Self {
            state: RwLock::new(MountState {
                root: VirtualDir::default(),
                rules,
                compiled,
            }),
            names,
        })
    }

    /// Seed the rule set from a store.
    pub fn load(store: &mut dyn RuleStore, names: Arc<dyn PrincipalNames>) -> Result<Self> {
        let rules = DirRuleSet::from_records(store.read_directories()?, store.read_rules()?)?;
        Self::new(rules, names)
    }

    // ──────────────────── snapshots ────────────────────

    /// Mount (or replace) the snapshot in the statistics tree file at `path`.
    pub fn add_tree(&self, path: &Path) -> Result<MountBuild> {
        self.add_tree_from(SegmentTree::open_file(path)?, path)
    }

    /// Mount (or replace) an already opened statistics tree.
    pub fn add_tree_from(&self, lower: SegmentTree, source: &Path) -> Result<MountBuild> {
        let overlay = Overlay::new(lower, source)?;
        let root = overlay.root_path().to_string();
        if root == "/" {
            return Err(BrtError::InvalidRoot { name: root });
        }

        let mut state = self.state.write();
        state.root.check_placement(&root)?;
        let compiled = compile(&state.rules, &root, None).into_matchers()?;
        let (upper, report) = build(&overlay.top()?, &root, &compiled, None)?;
        let previous = state.root.place(overlay.with_upper(upper));
        let replaced = previous.is_some();
        drop(previous);

        Ok(MountBuild {
            root,
            replaced,
            build: report,
        })
    }

    /// Root paths of every mounted snapshot, sorted.
    pub fn mounts(&self) -> Vec<String> {
        let state = self.state.read();
        let mut overlays = Vec::new();
        state.root.overlays(&mut overlays);
        overlays
            .iter()
            .map(|overlay| overlay.root_path().to_string())
            .collect()
    }

    // ──────────────────── claims ────────────────────

    pub fn claim_directory(&self, directory: Directory) -> Result<()> {
        self.state.write().rules.claim(directory)
    }

    pub fn update_directory(&self, directory: Directory) -> Result<()> {
        self.state.write().rules.update_directory(directory)
    }

    /// Drop a claim that has no rules left.
    pub fn revoke_claim(&self, path: &str) -> Result<Directory> {
        self.state.write().rules.revoke(path)
    }

    /// Number of claimed directories and of rules across them.
    pub fn rule_counts(&self) -> (usize, usize) {
        let state = self.state.read();
        (state.rules.len(), state.rules.rule_count())
    }

    /// Current record for a claimed directory.
    pub fn directory(&self, path: &str) -> Option<DirRules> {
        self.state.read().rules.get(path).cloned()
    }

    // ──────────────────── rules ────────────────────

    /// Add a rule to a claimed directory and patch every affected snapshot.
    pub fn add_rule(&self, dir: &str, rule: Rule) -> Result<Vec<MountBuild>> {
        let mut state = self.state.write();
        let mut rules = state.rules.clone();
        rules.add_rule(dir, rule)?;
        Self::commit(&mut state, rules, &[dir])
    }

    /// Add many `(directory, rule)` pairs at once. Either all are applied,
    /// with one rebuild of each affected snapshot, or none are.
    pub fn add_rules(&self, batch: &[(String, Rule)]) -> Result<Vec<MountBuild>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.state.write();
        let mut rules = state.rules.clone();
        for (dir, rule) in batch {
            rules.add_rule(dir, rule.clone())?;
        }
        let mut changed: Vec<&str> = batch.iter().map(|(dir, _)| dir.as_str()).collect();
        changed.sort_unstable();
        changed.dedup();
        Self::commit(&mut state, rules, &changed)
    }

    /// Remove the rule for `pattern` from a claimed directory.
    pub fn remove_rule(&self, dir: &str, pattern: &str) -> Result<(Rule, Vec<MountBuild>)> {
        let mut state = self.state.write();
        let mut rules = state.rules.clone();
        let removed = rules.remove_rule(dir, pattern)?;
        let builds = Self::commit(&mut state, rules, &[dir])?;
        Ok((removed, builds))
    }

    /// Replace a rule (matched by id). Only a changed match string triggers
    /// a rebuild.
    pub fn update_rule(&self, dir: &str, rule: Rule) -> Result<Vec<MountBuild>> {
        let mut state = self.state.write();
        let mut rules = state.rules.clone();
        let pattern = rule.pattern.clone();
        let previous = rules.update_rule(dir, rule)?;
        if previous.pattern == pattern {
            state.rules = rules;
            return Ok(Vec::new());
        }
        Self::commit(&mut state, rules, &[dir])
    }

    /// Rebuild every snapshot containing or contained by a `changed`
    /// directory against `rules`, then swap everything in at once.
    fn commit(
        state: &mut MountState,
        rules: DirRuleSet,
        changed: &[&str],
    ) -> Result<Vec<MountBuild>> {
        let compiled = CompiledRules::all(&rules)?;

        let mut overlays = Vec::new();
        state.root.overlays(&mut overlays);
        let mut rebuilt = Vec::new();
        for overlay in overlays {
            let root = overlay.root_path();
            if !changed
                .iter()
                .any(|&dir| root.starts_with(dir) || dir.starts_with(root))
            {
                continue;
            }
            let prior = overlay.upper();
            let scoped = compile(&rules, root, prior.map(|_| changed)).into_matchers()?;
            let (upper, report) = build(&overlay.top()?, root, &scoped, prior)?;
            rebuilt.push((overlay.with_upper(upper), report));
        }

        let mut builds = Vec::with_capacity(rebuilt.len());
        for (overlay, report) in rebuilt {
            let root = overlay.root_path().to_string();
            state.root.place(overlay);
            builds.push(MountBuild {
                root,
                replaced: true,
                build: report,
            });
        }
        state.rules = rules;
        state.compiled = compiled;
        Ok(builds)
    }

    /// Rule governing the file at `path`; 0 when none does.
    pub fn rule_for(&self, path: &str) -> RuleId {
        self.state.read().compiled.rule_for(path)
    }

    // ──────────────────── queries ────────────────────

    /// Summary of the directory at `path` and one level of its children,
    /// with names and claimants filled in.
    pub fn summary(&self, path: &str) -> Result<DirSummary> {
        let state = self.state.read();
        let mut summary = match state.root.locate(path) {
            Some(Located::Virtual(dir)) if is_dir_name(path) => dir.summary(true)?,
            Some(Located::Inside(overlay, relative)) => match overlay.lookup(relative)? {
                Some(Entry::Dir(dir)) => dir.summary(true)?,
                Some(Entry::File(_)) | None => return Err(BrtError::not_found(path)),
            },
            _ => return Err(BrtError::not_found(path)),
        };

        let claimant = |dir: &str| {
            state
                .rules
                .get(dir)
                .map(|claimed| claimed.directory.claimed_by.clone())
                .unwrap_or_default()
        };
        summary.claimed_by = claimant(path);
        let mut child_path = path.to_string();
        for (name, child) in &mut summary.children {
            child_path.truncate(path.len());
            child_path.push_str(name);
            child.claimed_by = claimant(&child_path);
        }
        drop(state);

        label_summary(&mut summary, self.names.as_ref());
        Ok(summary)
    }

    /// Owning user and group of a file or directory. Virtual directories
    /// are owned by root.
    pub fn get_owner(&self, path: &str) -> Result<(PrincipalId, PrincipalId)> {
        let state = self.state.read();
        match state.root.locate(path) {
            Some(Located::Virtual(_)) if is_dir_name(path) => Ok((0, 0)),
            Some(Located::Inside(overlay, relative)) => match overlay.lookup(relative)? {
                Some(Entry::Dir(dir)) => dir.owner(),
                Some(Entry::File(file)) => Ok((file.uid, file.gid)),
                None => Err(BrtError::not_found(path)),
            },
            _ => Err(BrtError::not_found(path)),
        }
    }

    pub fn is_directory(&self, path: &str) -> Result<bool> {
        let state = self.state.read();
        match state.root.locate(path) {
            Some(Located::Virtual(_)) => Ok(is_dir_name(path)),
            Some(Located::Inside(overlay, relative)) => match overlay.lookup(relative)? {
                Some(Entry::Dir(_)) => Ok(true),
                Some(Entry::File(_)) => Ok(false),
                None => Err(BrtError::not_found(path)),
            },
            None => Err(BrtError::not_found(path)),
        }
    }

    /// Sorted, duplicate-free paths matching any of `patterns`.
    pub fn glob_paths<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Vec<String>> {
        let globs = patterns
            .iter()
            .map(|pattern| PathGlob::parse(pattern.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let state = self.state.read();
        let mut found = BTreeSet::new();
        for glob in &globs {
            let mut prefix = String::from("/");
            expand(&GlobAt::Virtual(&state.root), glob, 0, &mut prefix, &mut found)?;
        }
        Ok(found.into_iter().collect())
    }
}

fn expand(
    at: &GlobAt<'_>,
    glob: &PathGlob,
    depth: usize,
    prefix: &mut String,
    found: &mut BTreeSet<String>,
) -> Result<()> {
    if depth == glob.depth() {
        found.insert(prefix.clone());
        return Ok(());
    }
    let mut visit = |name: &str, next: Option<GlobAt<'_>>| -> Result<()> {
        if !glob.matches_at(depth, name) {
            return Ok(());
        }
        let len = prefix.len();
        prefix.push_str(name);
        let result = match next {
            _ if depth + 1 == glob.depth() => {
                found.insert(prefix.clone());
                Ok(())
            }
            Some(next) => expand(&next, glob, depth + 1, prefix, found),
            None => Ok(()),
        };
        prefix.truncate(len);
        result
    };
    match at {
        GlobAt::Virtual(dir) => {
            for (name, entry) in &dir.children {
                let next = match entry {
                    MountEntry::Dir(child) => GlobAt::Virtual(child),
                    MountEntry::Overlay(overlay) => GlobAt::Dir(overlay.root()?),
                };
                visit(name, Some(next))?;
            }
        }
        GlobAt::Dir(dir) => {
            for (name, child) in dir.entries()? {
                visit(&name, child.map(GlobAt::Dir))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::BackupType;
    use crate::ruletree::names::StaticNames;
    use crate::ruletree::stats::{LowerDir, LowerFile, Stats};
    use crate::tree::snapshot::SnapshotBuilder;
    use crate::tree::store::TreeWriter;

    fn snapshot(root: &str, files: &[(&str, u64)]) -> SegmentTree {
        let mut snap = SnapshotBuilder::new(root, 0, 0).unwrap();
        for (path, size) in files {
            let file = LowerFile {
                uid: 1,
                gid: 2,
                mtime: 3,
                size: *size,
            };
            snap.add_file(path, file).unwrap();
        }
        snap.to_tree().unwrap()
    }

    fn tree() -> RuleTree {
        RuleTree::new(DirRuleSet::default(), Arc::new(StaticNames::default())).unwrap()
    }

    fn mount(tree: &RuleTree, root: &str, files: &[(&str, u64)]) -> MountBuild {
        tree.add_tree_from(snapshot(root, files), Path::new("test"))
            .unwrap()
    }

    #[test]
    fn snapshots_may_not_nest() {
        let tree = tree();
        mount(&tree, "/a/b/", &[("/a/b/x", 1)]);

        let inner = tree.add_tree_from(snapshot("/a/b/c/", &[]), Path::new("inner"));
        assert!(matches!(inner, Err(BrtError::DeepTree { .. })));
        let outer = tree.add_tree_from(snapshot("/a/", &[]), Path::new("outer"));
        assert!(matches!(outer, Err(BrtError::DeepTree { .. })));

        mount(&tree, "/a/d/", &[]);
        assert_eq!(tree.mounts(), vec!["/a/b/", "/a/d/"]);
    }

    #[test]
    fn replacing_a_snapshot_swaps_its_contents() {
        let tree = tree();
        assert!(!mount(&tree, "/s/", &[("/s/old.txt", 5)]).replaced);
        assert!(mount(&tree, "/s/", &[("/s/new.txt", 7)]).replaced);

        assert_eq!(tree.summary("/s/").unwrap().totals(), (1, 7));
        assert!(tree.is_directory("/s/").unwrap());
        assert!(!tree.is_directory("/s/new.txt").unwrap());
        assert!(tree.is_directory("/s/old.txt").is_err());
    }

    #[test]
    fn virtual_directories_merge_their_mounts() {
        let tree = tree();
        mount(&tree, "/l/one/", &[("/l/one/a", 1)]);
        mount(&tree, "/l/two/", &[("/l/two/b", 2), ("/l/two/c/d", 3)]);

        let root = tree.summary("/").unwrap();
        assert_eq!(root.totals(), (3, 6));
        assert_eq!(root.children["l/"].totals(), (3, 6));

        let l = tree.summary("/l/").unwrap();
        assert_eq!(l.children["one/"].totals(), (1, 1));
        assert_eq!(l.children["two/"].totals(), (2, 5));
        assert_eq!(tree.get_owner("/l/").unwrap(), (0, 0));
        assert_eq!(tree.get_owner("/l/two/c/d").unwrap(), (1, 2));
    }

    #[test]
    fn rule_changes_patch_mounted_snapshots() {
        let tree = tree();
        mount(&tree, "/p/", &[("/p/x/a.txt", 1), ("/p/x/b.csv", 2), ("/p/y/c.txt", 4)]);
        tree.claim_directory(Directory::new("/p/x/", "alice")).unwrap();

        let builds = tree
            .add_rule("/p/x/", Rule::new(3, "*.txt", BackupType::IBackup))
            .unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].root, "/p/");

        let summary = tree.summary("/p/").unwrap();
        assert_eq!(summary.rule(3).unwrap().totals(), (1, 1));
        assert_eq!(summary.rule(0).unwrap().totals(), (2, 6));
        assert_eq!(summary.children["x/"].claimed_by, "alice");
        assert_eq!(tree.rule_for("/p/x/deep/er.txt"), 3);

        let (removed, _) = tree.remove_rule("/p/x/", "*.txt").unwrap();
        assert_eq!(removed.id, 3);
        let summary = tree.summary("/p/").unwrap();
        assert!(summary.rule(3).is_none());
        assert_eq!(summary.rule(0).unwrap().totals(), (3, 7));
    }

    /// `/s/d/` holds a good file and one whose payload cannot be decoded.
    fn corrupt_snapshot() -> SegmentTree {
        let stats = |id| Stats {
            id,
            name: String::new(),
            mtime: 3,
            files: 1,
            size: 5,
        };
        let dir = LowerDir {
            uid: 0,
            gid: 0,
            users: vec![stats(1)],
            groups: vec![stats(2)],
        };
        let file = LowerFile {
            uid: 1,
            gid: 2,
            mtime: 3,
            size: 5,
        };

        let mut writer = TreeWriter::new(Vec::new()).unwrap();
        let mut payload = Vec::new();
        writer.open_dir();
        writer.open_dir();
        file.encode(&mut payload);
        writer.leaf("x.txt", &payload).unwrap();
        writer.leaf("bad", &[0xff]).unwrap();
        payload.clear();
        dir.encode(&mut payload);
        writer.close_dir("d/", &payload).unwrap();
        writer.close_dir("/s/", &payload).unwrap();
        SegmentTree::from_bytes(writer.finish(&[]).unwrap()).unwrap()
    }

    #[test]
    fn failed_rebuild_keeps_committed_state() {
        let tree = tree();
        tree.add_tree_from(corrupt_snapshot(), Path::new("corrupt"))
            .unwrap();
        tree.claim_directory(Directory::new("/s/d/", "alice")).unwrap();
        let before = (tree.summary("/s/").unwrap(), tree.summary("/s/d/").unwrap());

        let err = tree
            .add_rule("/s/d/", Rule::new(1, "*.txt", BackupType::Manual))
            .unwrap_err();
        assert_eq!(err.code(), "BRT-2301");
        assert!(!err.is_recoverable());

        assert!(tree.directory("/s/d/").unwrap().rules.is_empty());
        assert_eq!(tree.rule_counts(), (1, 0));
        assert_eq!(tree.rule_for("/s/d/x.txt"), 0);
        assert_eq!(
            (tree.summary("/s/").unwrap(), tree.summary("/s/d/").unwrap()),
            before
        );
    }

    #[test]
    fn rejected_duplicate_keeps_committed_state() {
        let tree = tree();
        mount(&tree, "/p/", &[("/p/x/a.txt", 1)]);
        tree.claim_directory(Directory::new("/p/x/", "alice")).unwrap();
        tree.add_rule("/p/x/", Rule::new(1, "*", BackupType::None))
            .unwrap();

        let duplicate = tree.add_rule("/p/x/", Rule::new(2, "*", BackupType::Manual));
        assert!(matches!(duplicate, Err(BrtError::RuleExists { .. })));
        assert_eq!(tree.directory("/p/x/").unwrap().rules["*"].id, 1);
        assert_eq!(tree.summary("/p/").unwrap().rule(1).unwrap().totals(), (1, 1));
    }

    #[test]
    fn metadata_only_update_skips_rebuild() {
        let tree = tree();
        mount(&tree, "/p/", &[("/p/a.txt", 1)]);
        tree.claim_directory(Directory::new("/p/", "alice")).unwrap();
        tree.add_rule("/p/", Rule::new(1, "*.txt", BackupType::None))
            .unwrap();

        let mut edited = Rule::new(1, "*.txt", BackupType::Manual);
        edited.metadata = "weekly".to_string();
        assert!(tree.update_rule("/p/", edited).unwrap().is_empty());
        assert_eq!(
            tree.directory("/p/").unwrap().rules["*.txt"].backup_type,
            BackupType::Manual
        );

        let renamed = Rule::new(1, "*.csv", BackupType::Manual);
        assert_eq!(tree.update_rule("/p/", renamed).unwrap().len(), 1);
        assert_eq!(tree.rule_for("/p/a.txt"), 0);
    }

    #[test]
    fn glob_matches_files_and_directories_separately() {
        let tree = tree();
        mount(
            &tree,
            "/a/",
            &[("/a/MyDir/x.txt", 1), ("/a/MyDir/y.csv", 1), ("/a/YourDir/z.tsv", 1)],
        );
        assert_eq!(tree.glob_paths(&["/a/*/*.tsv"]).unwrap(), vec!["/a/YourDir/z.tsv"]);
        assert_eq!(
            tree.glob_paths(&["/a/*/"]).unwrap(),
            vec!["/a/MyDir/", "/a/YourDir/"]
        );
        assert_eq!(
            tree.glob_paths(&["/a/My*/*", "/a/*/x.txt"]).unwrap(),
            vec!["/a/MyDir/x.txt", "/a/MyDir/y.csv"]
        );
        assert!(tree.glob_paths(&["/a/*"]).unwrap().is_empty());
    }
}
