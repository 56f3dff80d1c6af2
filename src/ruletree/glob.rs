//! Segment-wise shell-glob patterns over tree paths.
//!
//! `/a/*/*.tsv` is three segments: `a/`, `*/`, `*.tsv`. Each segment body is
//! a shell glob; a trailing `/` on a pattern segment restricts it to
//! directories, its absence to files.

#![allow(missing_docs)]

use crate::core::errors::{BrtError, Result};
use crate::core::paths::{is_dir_name, segments};

#[derive(Debug, Clone)]
struct Segment {
    body: glob::Pattern,
    directory: bool,
}

/// A compiled path glob.
#[derive(Debug, Clone)]
pub struct PathGlob {
    raw: String,
    segments: Vec<Segment>,
}

impl PathGlob {
    pub fn parse(pattern: &str) -> Result<Self> {
        if !pattern.starts_with('/') {
            return Err(BrtError::InvalidMatch {
                pattern: pattern.to_string(),
                reason: "glob must be an absolute path",
            });
        }
        let segments = segments(pattern)
            .map(|segment| {
                let directory = is_dir_name(segment);
                let body = segment.strip_suffix('/').unwrap_or(segment);
                if body.is_empty() {
                    return Err(BrtError::InvalidMatch {
                        pattern: pattern.to_string(),
                        reason: "empty path segment",
                    });
                }
                glob::Pattern::new(body)
                    .map(|body| Segment { body, directory })
                    .map_err(|_| BrtError::InvalidMatch {
                        pattern: pattern.to_string(),
                        reason: "invalid glob syntax",
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of segments; a path matches only at exactly this depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether entry `name` (directories end in `/`) matches segment `depth`.
    #[must_use]
    pub fn matches_at(&self, depth: usize, name: &str) -> bool {
        let Some(segment) = self.segments.get(depth) else {
            return false;
        };
        let directory = is_dir_name(name);
        if directory != segment.directory {
            return false;
        }
        segment
            .body
            .matches(name.strip_suffix('/').unwrap_or(name))
    }
}
