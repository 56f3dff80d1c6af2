//! Rule compiler: claimed directories → path patterns.
//!
//! Two pattern sets come out of a compilation:
//!
//! - file rules, `<dir><match>` → rule id, answering "which rule governs this
//!   file";
//! - directory directives, `<dir>` and `<dir>*/` → [`Directive`], telling the
//!   tree builder how much of each directory it has to look at.
//!
//! Directives are derived from a scratch tree of every claimed directory in
//! scope. Each scratch node carries its [`RuleState`] and change flags; the
//! flags decide whether the subtree below a pattern can be reused from the
//! previous build, must be recomputed from the snapshot's unclassified
//! aggregates, or has to be walked file by file.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::BitOr;

use crate::core::errors::Result;
use crate::core::paths::segments;
use crate::rules::matcher::PathMatcher;
use crate::rules::model::{DirRuleSet, DirRules, Rule};
use crate::ruletree::stats::RuleId;

/// What the builder should do with a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Directive {
    /// Walk it: dispatch every file to its rule, apply directives to
    /// subdirectories.
    Process,
    /// Everything below belongs to this rule, newly established: relabel the
    /// unclassified aggregate without walking.
    Assign(RuleId),
    /// Everything below is unchanged since the previous build: reuse the
    /// previous result, or relabel with this rule when there is none.
    Reuse(RuleId),
    /// No pattern applies; rule 0, treated like `Reuse(0)`.
    Unmatched,
}

/// Shapes of the rules present in one directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleState(u8);

impl RuleState {
    pub const NONE: Self = Self(0);
    /// `*`
    pub const SIMPLE_WILDCARD: Self = Self(1);
    /// Literal names.
    pub const SIMPLE_PATHS: Self = Self(1 << 1);
    /// `abc*`, `a*c`
    pub const PREFIX_WILDCARD: Self = Self(1 << 2);
    /// `*abc`, `*a*`
    pub const SUFFIX_WILDCARD: Self = Self(1 << 3);

    /// Shape of a single match string.
    #[must_use]
    pub fn of_pattern(pattern: &str) -> Self {
        if pattern == "*" {
            Self::SIMPLE_WILDCARD
        } else if pattern.starts_with('*') {
            Self::SUFFIX_WILDCARD
        } else if pattern.contains('*') {
            Self::PREFIX_WILDCARD
        } else {
            Self::SIMPLE_PATHS
        }
    }

    #[must_use]
    pub fn classify<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Self {
        patterns
            .into_iter()
            .fold(Self::NONE, |state, pattern| state | Self::of_pattern(pattern))
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Any prefix or suffix wildcard present.
    #[must_use]
    pub const fn is_complex(self) -> bool {
        self.intersects(Self(Self::PREFIX_WILDCARD.0 | Self::SUFFIX_WILDCARD.0))
    }
}

impl BitOr for RuleState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-node flags of the scratch tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirFlags(u8);

impl DirFlags {
    pub const RULES_CHANGED: Self = Self(1);
    pub const HAS_CHILD_WITH_RULES: Self = Self(1 << 1);
    /// An ancestor changed and no local `*` shields this directory from it.
    pub const PARENT_RULES_CHANGED: Self = Self(1 << 2);
    pub const HAS_CHILD_WITH_CHANGED_RULES: Self = Self(1 << 3);
    /// On the path from `/` to the compilation scope; never short-cut.
    pub const STRUCTURAL: Self = Self(1 << 4);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Rules governing this directory's subtree may differ from last time.
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        self.0 & (Self::RULES_CHANGED.0 | Self::PARENT_RULES_CHANGED.0) != 0
    }
}

/// Default for an unspecified subdirectory before change flags are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fallback {
    Process,
    Rule(RuleId),
}

impl Fallback {
    const fn directive(self, dirty: bool) -> Directive {
        match self {
            Self::Process => Directive::Process,
            Self::Rule(id) if dirty => Directive::Assign(id),
            Self::Rule(id) => Directive::Reuse(id),
        }
    }
}

// ──────────────────── scratch tree ────────────────────

#[derive(Debug, Default)]
struct ScratchDir<'a> {
    rules: Option<&'a DirRules>,
    flags: DirFlags,
    children: BTreeMap<String, ScratchDir<'a>>,
}

impl<'a> ScratchDir<'a> {
    fn ensure(&mut self, path: &str) -> &mut Self {
        let mut node = self;
        for segment in segments(path) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node
    }

    fn mark_path(&mut self, path: &str, flag: DirFlags) {
        let mut node = self;
        node.flags.insert(flag);
        for segment in segments(path) {
            node = node.children.entry(segment.to_string()).or_default();
            node.flags.insert(flag);
        }
    }

    fn rules(&self) -> impl Iterator<Item = &'a Rule> + use<'a> {
        self.rules.into_iter().flat_map(|dir| dir.rules.values())
    }

    fn has_rules(&self) -> bool {
        self.rules.is_some_and(|dir| !dir.rules.is_empty())
    }

    fn wildcard(&self) -> Option<RuleId> {
        self.rules
            .and_then(|dir| dir.rules.get("*"))
            .map(|rule| rule.id)
    }

    fn state(&self) -> RuleState {
        RuleState::classify(self.rules().map(|rule| rule.pattern.as_str()))
    }

    /// Propagate change and rule presence; returns `(has_rules, has_changed)`
    /// for this subtree.
    fn finalize(&mut self, parent_dirty: bool) -> (bool, bool) {
        if parent_dirty && self.wildcard().is_none() {
            self.flags.insert(DirFlags::PARENT_RULES_CHANGED);
        }
        let dirty = self.flags.is_dirty();
        let (mut rules_below, mut changed_below) = (false, false);
        for child in self.children.values_mut() {
            let (rules, changed) = child.finalize(dirty);
            rules_below |= rules;
            changed_below |= changed;
        }
        if rules_below {
            self.flags.insert(DirFlags::HAS_CHILD_WITH_RULES);
        }
        if changed_below {
            self.flags.insert(DirFlags::HAS_CHILD_WITH_CHANGED_RULES);
        }
        (
            rules_below || self.has_rules(),
            changed_below || self.flags.contains(DirFlags::RULES_CHANGED),
        )
    }

    /// One entry per distinct literal run before the first `*` of a prefix
    /// rule. Authoritative when the rule is exactly `prefix*`.
    fn prefixes(&self) -> BTreeMap<&'a str, Fallback> {
        let mut todo = BTreeMap::new();
        for rule in self.rules() {
            let pattern = rule.pattern.as_str();
            let Some(star) = pattern.find('*').filter(|pos| *pos > 0) else {
                continue;
            };
            let prefix = &pattern[..star];
            let fallback = if star + 1 < pattern.len() || todo.contains_key(prefix) {
                Fallback::Process
            } else {
                Fallback::Rule(rule.id)
            };
            todo.insert(prefix, fallback);
        }
        todo
    }

    fn emit_rules(&self, path: &mut String, out: &mut Compilation) {
        for rule in self.rules() {
            out.rules.push((format!("{path}{}", rule.pattern), rule.id));
        }
        for (name, child) in &self.children {
            let len = path.len();
            path.push_str(name);
            child.emit_rules(path, out);
            path.truncate(len);
        }
    }

    fn emit_directives(&self, path: &mut String, inherited: Fallback, out: &mut Compilation) {
        let state = self.state();
        let dirty = self.flags.is_dirty();
        let default = if state.contains(RuleState::SUFFIX_WILDCARD) {
            Fallback::Process
        } else {
            self.wildcard().map_or(inherited, Fallback::Rule)
        };

        if !self.flags.contains(DirFlags::STRUCTURAL) {
            if !dirty && !self.flags.contains(DirFlags::HAS_CHILD_WITH_CHANGED_RULES) {
                // A clean directory always has a node in the previous build;
                // the id is only the relabelling fallback.
                let id = match default {
                    Fallback::Rule(id) => id,
                    Fallback::Process => 0,
                };
                out.directive(path.clone(), Directive::Reuse(id));
                return;
            }
            let local = state.intersects(RuleState::SIMPLE_PATHS) || state.is_complex();
            if let Fallback::Rule(id) = default
                && !local
                && !self.flags.contains(DirFlags::HAS_CHILD_WITH_RULES)
            {
                out.directive(path.clone(), Directive::Assign(id));
                return;
            }
        }

        out.directive(path.clone(), Directive::Process);
        out.directive(format!("{path}*/"), default.directive(dirty));
        let prefixes = self.prefixes();
        for (prefix, fallback) in &prefixes {
            out.directive(format!("{path}{prefix}*/"), fallback.directive(dirty));
        }

        for (name, child) in &self.children {
            let inherited = prefixes
                .iter()
                .filter(|(prefix, _)| name.starts_with(**prefix))
                .max_by_key(|(prefix, _)| prefix.len())
                .map_or(default, |(_, fallback)| *fallback);
            let len = path.len();
            path.push_str(name);
            child.emit_directives(path, inherited, out);
            path.truncate(len);
        }
    }
}

// ──────────────────── compilation ────────────────────

/// Raw output of [`compile`], in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compilation {
    pub rules: Vec<(String, RuleId)>,
    pub directives: Vec<(String, Directive)>,
}

impl Compilation {
    fn directive(&mut self, pattern: String, directive: Directive) {
        self.directives.push((pattern, directive));
    }

    /// Directive emitted for exactly `pattern`, if any.
    #[must_use]
    pub fn directive_at(&self, pattern: &str) -> Option<Directive> {
        self.directives
            .iter()
            .find(|(p, _)| p == pattern)
            .map(|(_, d)| *d)
    }

    pub fn into_matchers(self) -> Result<CompiledRules> {
        Ok(CompiledRules {
            files: PathMatcher::compile(self.rules)?,
            dirs: PathMatcher::compile(self.directives)?,
        })
    }
}

/// Compile the claimed directories relevant to `scope` (those at or below it,
/// and its ancestors).
///
/// `changed` lists directories whose rules changed since the previous
/// compilation; `None` is a full compile, in which everything counts as
/// changed and no directive permits reuse.
#[must_use]
pub fn compile(set: &DirRuleSet, scope: &str, changed: Option<&[&str]>) -> Compilation {
    let relevant = |path: &str| path.starts_with(scope) || scope.starts_with(path);

    let mut root = ScratchDir::default();
    root.mark_path(scope, DirFlags::STRUCTURAL);
    for (path, dir_rules) in set.iter() {
        if !relevant(path) {
            continue;
        }
        let node = root.ensure(path);
        node.rules = Some(dir_rules);
        if changed.is_none() {
            node.flags.insert(DirFlags::RULES_CHANGED);
        }
    }
    match changed {
        None => root.flags.insert(DirFlags::RULES_CHANGED),
        Some(paths) => {
            for &path in paths {
                if relevant(path) {
                    root.ensure(path).flags.insert(DirFlags::RULES_CHANGED);
                }
            }
        }
    }
    root.finalize(false);

    let mut out = Compilation::default();
    let mut path = String::from("/");
    root.emit_rules(&mut path, &mut out);
    root.emit_directives(&mut path, Fallback::Rule(0), &mut out);
    out
}

/// Matchers produced from a [`Compilation`].
#[derive(Debug, Clone)]
pub struct CompiledRules {
    files: PathMatcher<RuleId>,
    dirs: PathMatcher<Directive>,
}

impl CompiledRules {
    /// Full compile of every claimed directory.
    pub fn all(set: &DirRuleSet) -> Result<Self> {
        compile(set, "/", None).into_matchers()
    }

    /// Rule governing the file at `path`; 0 when none does.
    #[must_use]
    pub fn rule_for(&self, path: &str) -> RuleId {
        self.files.lookup(path).copied().unwrap_or(0)
    }

    /// Directive for the directory at `path` (ending in `/`).
    #[must_use]
    pub fn directive_for(&self, path: &str) -> Directive {
        self.dirs
            .lookup(path)
            .copied()
            .unwrap_or(Directive::Unmatched)
    }
}
