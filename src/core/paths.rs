//! Shared path manipulation utilities.
//!
//! Two kinds of path live in this crate. Filesystem paths (`Path`) name
//! configuration, snapshot and database files. Tree paths (`&str`) address
//! nodes inside a snapshot: they are absolute, `/`-separated, and a directory
//! path always ends in `/` while a file path never does. Segment names follow
//! the same convention (`"MyDir/"` vs `"a.txt"`).

use std::env;
use std::path::{Component, Path, PathBuf};

use memchr::memchr;

/// Resolve a path to an absolute, normalized path.
///
/// If `fs::canonicalize` succeeds (path exists), it is used to resolve symlinks
/// and normalize components.
///
/// If it fails (e.g. path does not exist), the path is made absolute relative
/// to CWD and `..`/`.` components are resolved syntactically.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    normalize_syntactic(&absolute)
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

/// Whether a segment name (or tree path) denotes a directory.
#[must_use]
pub fn is_dir_name(name: &str) -> bool {
    name.ends_with('/')
}

/// Whether `path` is an absolute tree directory path such as `/a/b/`.
#[must_use]
pub fn is_absolute_dir(path: &str) -> bool {
    path.starts_with('/') && path.ends_with('/')
}

/// Iterator over the segments of a relative tree path.
///
/// `"a/b/c.txt"` yields `"a/"`, `"b/"`, `"c.txt"`; directory segments keep
/// their trailing slash.
#[derive(Debug, Clone)]
pub struct Segments<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        let end = memchr(b'/', self.rest.as_bytes()).map_or(self.rest.len(), |pos| pos + 1);
        let (segment, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(segment)
    }
}

/// Split a relative tree path into segments. A leading `/` is ignored.
#[must_use]
pub fn segments(path: &str) -> Segments<'_> {
    Segments {
        rest: path.strip_prefix('/').unwrap_or(path),
    }
}

/// Parent directory of a tree path: `/a/b/` → `/a/`, `/a/b.txt` → `/a/`.
/// The root `/` has no parent.
#[must_use]
pub fn parent_dir(path: &str) -> Option<&str> {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed.rfind('/').map(|pos| &path[..=pos])
}

/// Whether tree path `path` lies at or below directory `dir`.
#[must_use]
pub fn is_within(path: &str, dir: &str) -> bool {
    path.starts_with(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_existing_path_canonically() {
        let cwd = env::current_dir().unwrap();
        let resolved = resolve_absolute_path(Path::new("."));
        assert_eq!(resolved, std::fs::canonicalize(&cwd).unwrap());
    }

    #[test]
    fn normalizes_nonexistent_path_syntactically() {
        let input = Path::new("/nonexistent-ruletree/foo/../bar");
        assert!(std::fs::canonicalize(input).is_err());
        assert_eq!(
            resolve_absolute_path(input),
            Path::new("/nonexistent-ruletree/bar")
        );
    }

    #[test]
    fn segments_keep_directory_slashes() {
        let parts: Vec<&str> = segments("/a/MyDir/x.txt").collect();
        assert_eq!(parts, vec!["a/", "MyDir/", "x.txt"]);

        let dirs: Vec<&str> = segments("a/b/").collect();
        assert_eq!(dirs, vec!["a/", "b/"]);

        assert_eq!(segments("").count(), 0);
        assert_eq!(segments("/").count(), 0);
    }

    #[test]
    fn parent_dir_walks_up_one_level() {
        assert_eq!(parent_dir("/a/b/"), Some("/a/"));
        assert_eq!(parent_dir("/a/b.txt"), Some("/a/"));
        assert_eq!(parent_dir("/a/"), Some("/"));
        assert_eq!(parent_dir("/"), None);
    }

    #[test]
    fn absolute_dir_requires_both_slashes() {
        assert!(is_absolute_dir("/"));
        assert!(is_absolute_dir("/a/b/"));
        assert!(!is_absolute_dir("a/b/"));
        assert!(!is_absolute_dir("/a/b"));
        assert!(is_dir_name("MyDir/"));
        assert!(!is_dir_name("x.txt"));
        assert!(is_within("/a/b/c.txt", "/a/"));
        assert!(!is_within("/ab/c.txt", "/a/"));
    }
}
