//! Statistics tree producer.
//!
//! A statistics tree has a single top-level entry named by the absolute path
//! of the scanned directory (e.g. `/lustre/scratch/`). Below it, every
//! directory node carries its owner and per-principal rollups of all files
//! beneath it, and every file node carries its owner, mtime and size.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::core::errors::{BrtError, Result};
use crate::core::paths::{is_absolute_dir, is_dir_name, segments};
use crate::ruletree::stats::{LowerDir, LowerFile, PrincipalId, Stats, add_stats};
use crate::tree::store::{SegmentTree, TreeWriter};

#[derive(Debug, Default)]
struct DirEntry {
    uid: PrincipalId,
    gid: PrincipalId,
    dirs: BTreeMap<String, DirEntry>,
    files: BTreeMap<String, LowerFile>,
}

/// In-memory statistics tree, serialized on demand.
#[derive(Debug)]
pub struct SnapshotBuilder {
    root_path: String,
    root: DirEntry,
}

impl SnapshotBuilder {
    /// Start a snapshot of `root_path`, which must look like `/a/b/`.
    pub fn new(root_path: &str, uid: PrincipalId, gid: PrincipalId) -> Result<Self> {
        if !is_absolute_dir(root_path) {
            return Err(BrtError::InvalidRoot {
                name: root_path.to_string(),
            });
        }
        Ok(Self {
            root_path: root_path.to_string(),
            root: DirEntry {
                uid,
                gid,
                ..DirEntry::default()
            },
        })
    }

    /// Absolute path of the scanned directory.
    #[must_use]
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Record a directory (and any missing ancestors) with the given owner.
    pub fn add_dir(&mut self, path: &str, uid: PrincipalId, gid: PrincipalId) -> Result<()> {
        if !is_dir_name(path) {
            return Err(BrtError::InvalidSnapshot {
                path: path.into(),
                details: "directory paths must end in '/'".to_string(),
            });
        }
        let dir = self.dir_mut(path, path)?;
        dir.uid = uid;
        dir.gid = gid;
        Ok(())
    }

    /// Record a file. Missing ancestor directories inherit their parent's owner.
    pub fn add_file(&mut self, path: &str, file: LowerFile) -> Result<()> {
        let Some(split) = path.rfind('/').map(|pos| pos + 1) else {
            return Err(self.outside(path));
        };
        let (dir_path, name) = path.split_at(split);
        if name.is_empty() {
            return Err(BrtError::InvalidSnapshot {
                path: path.into(),
                details: "file paths must not end in '/'".to_string(),
            });
        }
        self.dir_mut(dir_path, path)?.files.insert(name.to_string(), file);
        Ok(())
    }

    fn dir_mut(&mut self, dir_path: &str, full: &str) -> Result<&mut DirEntry> {
        let Some(relative) = dir_path.strip_prefix(self.root_path.as_str()) else {
            return Err(self.outside(full));
        };
        let mut dir = &mut self.root;
        for segment in segments(relative) {
            let (uid, gid) = (dir.uid, dir.gid);
            dir = dir.dirs.entry(segment.to_string()).or_insert_with(|| DirEntry {
                uid,
                gid,
                ..DirEntry::default()
            });
        }
        Ok(dir)
    }

    fn outside(&self, path: &str) -> BrtError {
        BrtError::InvalidSnapshot {
            path: path.into(),
            details: format!("not below snapshot root {}", self.root_path),
        }
    }

    /// Serialize into `out`.
    pub fn write_to<W: Write>(&self, out: W) -> Result<W> {
        let mut writer = TreeWriter::new(out)?;
        let mut payload = Vec::with_capacity(128);
        writer.open_dir();
        let top = write_dir(&self.root, &mut writer, &mut payload)?;
        payload.clear();
        top.encode(&mut payload);
        writer.close_dir(&self.root_path, &payload)?;
        writer.finish(&[])
    }

    /// Serialize into an in-memory tree.
    pub fn to_tree(&self) -> Result<SegmentTree> {
        SegmentTree::from_bytes(self.write_to(Vec::new())?)
    }

    /// Serialize into a file at `path`.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|source| BrtError::io(path, source))?;
        self.write_to(BufWriter::new(file))?
            .flush()
            .map_err(|source| BrtError::io(path, source))
    }
}

fn write_dir<W: Write>(
    entry: &DirEntry,
    writer: &mut TreeWriter<W>,
    payload: &mut Vec<u8>,
) -> Result<LowerDir> {
    let mut rollup = LowerDir {
        uid: entry.uid,
        gid: entry.gid,
        ..LowerDir::default()
    };

    for (name, file) in &entry.files {
        payload.clear();
        file.encode(payload);
        writer.leaf(name, payload)?;
        for (list, id) in [(&mut rollup.users, file.uid), (&mut rollup.groups, file.gid)] {
            add_stats(
                list,
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

    for (name, dir) in &entry.dirs {
        writer.open_dir();
        let child = write_dir(dir, writer, payload)?;
        payload.clear();
        child.encode(payload);
        writer.close_dir(name, payload)?;
        for stats in &child.users {
            add_stats(&mut rollup.users, stats);
        }
        for stats in &child.groups {
            add_stats(&mut rollup.groups, stats);
        }
    }

    Ok(rollup)
}
