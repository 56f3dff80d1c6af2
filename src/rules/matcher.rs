//! Most-specific-match path pattern matcher.
//!
//! Patterns are literal bytes plus `*`, which matches any run of bytes
//! including `/`. A lookup follows literal bytes in preference to `*` at every
//! step and backtracks only when the literal route dead-ends, so the pattern
//! sharing the longest literal prefix with the path wins:
//!
//! ```text
//! /a/*          5
//! /a/b/*.txt    7
//!
//! /a/b/c/x.txt  → 7
//! /a/b/c/x.csv  → 5
//! ```
//!
//! A lookup remembers which `(node, offset)` states have already failed, so
//! many-star patterns cost at most one visit per state instead of
//! backtracking exponentially.

#![allow(missing_docs)]

use std::collections::{HashMap, HashSet};

use crate::core::errors::{BrtError, Result};

#[derive(Debug, Clone)]
struct Node<T> {
    /// Sorted by byte.
    edges: Vec<(u8, u32)>,
    star: Option<u32>,
    value: Option<T>,
}

impl<T> Node<T> {
    const fn new() -> Self {
        Self {
            edges: Vec::new(),
            star: None,
            value: None,
        }
    }

    fn edge(&self, byte: u8) -> Option<u32> {
        self.edges
            .binary_search_by_key(&byte, |(b, _)| *b)
            .ok()
            .map(|pos| self.edges[pos].1)
    }
}

/// Compiled pattern set.
#[derive(Debug, Clone)]
pub struct PathMatcher<T> {
    nodes: Vec<Node<T>>,
    patterns: usize,
}

impl<T> PathMatcher<T> {
    /// Compile `(pattern, value)` pairs. The same pattern twice is an error.
    pub fn compile<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, T)>,
        S: AsRef<str>,
    {
        let mut matcher = Self {
            nodes: vec![Node::new()],
            patterns: 0,
        };
        for (pattern, value) in patterns {
            matcher.insert(pattern.as_ref(), value)?;
        }
        Ok(matcher)
    }

    fn insert(&mut self, pattern: &str, value: T) -> Result<()> {
        let mut at = 0_usize;
        for &byte in pattern.as_bytes() {
            let next = if byte == b'*' {
                self.nodes[at].star
            } else {
                self.nodes[at].edge(byte)
            };
            at = match next {
                Some(next) => next as usize,
                None => {
                    let id = u32::try_from(self.nodes.len()).map_err(|_| BrtError::PatternConflict {
                        pattern: pattern.to_string(),
                    })?;
                    self.nodes.push(Node::new());
                    let node = &mut self.nodes[at];
                    if byte == b'*' {
                        node.star = Some(id);
                    } else {
                        let pos = node.edges.partition_point(|(b, _)| *b < byte);
                        node.edges.insert(pos, (byte, id));
                    }
                    id as usize
                }
            };
        }
        let slot = &mut self.nodes[at].value;
        if slot.is_some() {
            return Err(BrtError::PatternConflict {
                pattern: pattern.to_string(),
            });
        }
        *slot = Some(value);
        self.patterns += 1;
        Ok(())
    }

    /// Value of the most specific pattern matching all of `path`.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&T> {
        Search {
            matcher: self,
            path: path.as_bytes(),
            failed: HashSet::new(),
            star_failed_from: HashMap::new(),
        }
        .find(0, 0)
    }

    /// Number of compiled patterns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns == 0
    }
}

/// State of one lookup.
struct Search<'m, 'p, T> {
    matcher: &'m PathMatcher<T>,
    path: &'p [u8],
    /// `(node, offset)` pairs known not to match.
    failed: HashSet<(u32, usize)>,
    /// Per star node, the lowest offset from which no continuation matches.
    star_failed_from: HashMap<u32, usize>,
}

impl<'m, T> Search<'m, '_, T> {
    fn find(&mut self, at: u32, offset: usize) -> Option<&'m T> {
        if self.failed.contains(&(at, offset)) {
            return None;
        }
        let matcher = self.matcher;
        let node = &matcher.nodes[at as usize];
        match self.path.get(offset) {
            None => {
                if let Some(value) = &node.value {
                    return Some(value);
                }
            }
            Some(&byte) => {
                if let Some(next) = node.edge(byte)
                    && let Some(value) = self.find(next, offset + 1)
                {
                    return Some(value);
                }
            }
        }
        if let Some(star) = node.star
            && let Some(value) = self.scan(star, offset)
        {
            return Some(value);
        }
        self.failed.insert((at, offset));
        None
    }

    /// Let the `*` leading to `star` swallow `from..` bytes, shortest first.
    fn scan(&mut self, star: u32, from: usize) -> Option<&'m T> {
        let stop = self
            .star_failed_from
            .get(&star)
            .map_or(self.path.len() + 1, |floor| (*floor).min(self.path.len() + 1));
        for offset in from..stop {
            if let Some(value) = self.find(star, offset) {
                return Some(value);
            }
        }
        let floor = self.star_failed_from.entry(star).or_insert(from);
        *floor = (*floor).min(from);
        None
    }
}
