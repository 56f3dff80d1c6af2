//! Immutable, segment-keyed node store.
//!
//! Layout of a serialized tree:
//!
//! ```text
//! "BRTREE\x00\x01"                      8-byte magic
//! node records, post-order              descendants always precede their parent
//! root offset                           u64 little-endian footer
//! ```
//!
//! A node record at offset `start` is
//!
//! ```text
//! varint subtree_len     bytes of descendants, ending exactly at `start`
//! varint data_len, data
//! varint child_count
//! child_count × (varint name_len, name, varint start - child_start)
//! ```
//!
//! Children are sorted by name. Child references are relative, so the
//! `[start - subtree_len, record_end)` range of any node is a self-contained
//! subtree that can be copied byte-for-byte into another tree.

#![allow(missing_docs)]

use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use crate::core::errors::{BrtError, Result};
use crate::tree::codec::{ByteReader, put_uvarint};

const MAGIC: &[u8; 8] = b"BRTREE\x00\x01";
const FOOTER_LEN: usize = 8;

// ──────────────────── backing storage ────────────────────

#[derive(Debug)]
enum Backing {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Owned(bytes) => bytes,
        }
    }
}

/// An opened tree. Cheap to clone; the backing bytes are shared and released
/// when the last clone (including every [`NodeRef`] into it) is dropped.
#[derive(Debug, Clone)]
pub struct SegmentTree {
    bytes: Arc<Backing>,
    root: usize,
}

impl SegmentTree {
    /// Memory-map a tree file.
    pub fn open_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| BrtError::io(path, source))?;
        // SAFETY: snapshot files are written once by their producer and
        // never modified in place; replacements arrive as new files.
        #[allow(unsafe_code)]
        let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|source| BrtError::io(path, source))?;
        Self::from_backing(Backing::Mapped(map))
    }

    /// Wrap an in-memory serialized tree.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_backing(Backing::Owned(bytes))
    }

    fn from_backing(backing: Backing) -> Result<Self> {
        let len = backing.len();
        if len < MAGIC.len() + FOOTER_LEN || &backing[..MAGIC.len()] != MAGIC {
            return Err(BrtError::decode("tree header", "missing segment tree magic"));
        }
        let mut footer = [0_u8; FOOTER_LEN];
        footer.copy_from_slice(&backing[len - FOOTER_LEN..]);
        let root = usize::try_from(u64::from_le_bytes(footer))
            .ok()
            .filter(|root| (MAGIC.len()..len - FOOTER_LEN).contains(root))
            .ok_or_else(|| BrtError::decode("tree footer", "root offset out of range"))?;
        Ok(Self {
            bytes: Arc::new(backing),
            root,
        })
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> NodeRef {
        NodeRef {
            tree: self.clone(),
            start: self.root,
        }
    }

    /// Size of the serialized tree in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether two handles share the same backing bytes.
    #[must_use]
    pub fn same_backing(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    fn body(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - FOOTER_LEN]
    }
}

// ──────────────────── node navigation ────────────────────

/// A node inside a [`SegmentTree`]. Decoding is lazy: nothing is parsed until
/// the payload or children are requested.
#[derive(Debug, Clone)]
pub struct NodeRef {
    tree: SegmentTree,
    start: usize,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    subtree_len: usize,
    data: (usize, usize),
    child_count: usize,
    entries_at: usize,
}

impl NodeRef {
    fn record(&self) -> Result<Record> {
        let body = self.tree.body();
        let mut reader = ByteReader::new(body, "tree node");
        reader.read_bytes(self.start)?;
        let subtree_len = usize::try_from(reader.read_uvarint()?)
            .ok()
            .filter(|len| *len <= self.start - MAGIC.len())
            .ok_or_else(|| BrtError::decode("tree node", format!("bad subtree length at {}", self.start)))?;
        let data_len = reader.read_len()?;
        let data_start = reader.position();
        reader.read_bytes(data_len)?;
        let child_count = reader.read_len()?;
        Ok(Record {
            subtree_len,
            data: (data_start, data_start + data_len),
            child_count,
            entries_at: reader.position(),
        })
    }

    /// Opaque payload written by the producer of this node.
    pub fn data(&self) -> Result<&[u8]> {
        let record = self.record()?;
        Ok(&self.tree.body()[record.data.0..record.data.1])
    }

    /// Number of direct children.
    pub fn child_count(&self) -> Result<usize> {
        Ok(self.record()?.child_count)
    }

    /// Iterate direct children in name order.
    pub fn children(&self) -> Result<Children<'_>> {
        let record = self.record()?;
        let mut reader = ByteReader::new(self.tree.body(), "tree children");
        reader.read_bytes(record.entries_at)?;
        Ok(Children {
            node: self,
            reader,
            remaining: record.child_count,
        })
    }

    /// Look up a direct child by segment name.
    pub fn child(&self, name: &str) -> Result<Option<Self>> {
        for entry in self.children()? {
            let (child_name, node) = entry?;
            match child_name.cmp(name) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => return Ok(Some(node)),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Byte range `[first, end)` covering this node and all its descendants.
    fn subtree_range(&self) -> Result<(usize, usize)> {
        let record = self.record()?;
        let mut children = self.children()?;
        for entry in children.by_ref() {
            entry?;
        }
        Ok((self.start - record.subtree_len, children.reader.position()))
    }
}

/// Iterator over `(name, child)` pairs of a node.
#[derive(Debug)]
pub struct Children<'a> {
    node: &'a NodeRef,
    reader: ByteReader<'a>,
    remaining: usize,
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<(&'a str, NodeRef)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.read_entry())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> Children<'a> {
    fn read_entry(&mut self) -> Result<(&'a str, NodeRef)> {
        let name_len = self.reader.read_len()?;
        let name = std::str::from_utf8(self.reader.read_bytes(name_len)?)
            .map_err(|err| BrtError::decode("tree children", format!("child name is not UTF-8: {err}")))?;
        let back = usize::try_from(self.reader.read_uvarint()?).unwrap_or(usize::MAX);
        let start = self
            .node
            .start
            .checked_sub(back)
            .filter(|start| *start >= MAGIC.len() && back > 0)
            .ok_or_else(|| BrtError::decode("tree children", format!("child {name:?} offset out of range")))?;
        Ok((
            name,
            NodeRef {
                tree: self.node.tree.clone(),
                start,
            },
        ))
    }
}

// ──────────────────── writer ────────────────────

struct PendingDir {
    subtree_start: u64,
    children: Vec<(String, u64)>,
}

/// Post-order tree serializer.
///
/// Producers call [`TreeWriter::open_dir`] before emitting a directory's
/// descendants and [`TreeWriter::close_dir`] with its payload afterwards.
/// The implicit root is closed by [`TreeWriter::finish`].
pub struct TreeWriter<W: Write> {
    out: W,
    pos: u64,
    stack: Vec<PendingDir>,
    record: Vec<u8>,
}

impl<W: Write> TreeWriter<W> {
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(MAGIC).map_err(write_error)?;
        let pos = MAGIC.len() as u64;
        Ok(Self {
            out,
            pos,
            stack: vec![PendingDir {
                subtree_start: pos,
                children: Vec::new(),
            }],
            record: Vec::with_capacity(256),
        })
    }

    /// Start a directory whose descendants follow.
    pub fn open_dir(&mut self) {
        self.stack.push(PendingDir {
            subtree_start: self.pos,
            children: Vec::new(),
        });
    }

    /// Finish the most recently opened directory, naming it in its parent.
    pub fn close_dir(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if self.stack.len() < 2 {
            return Err(BrtError::Serialization {
                context: "tree writer",
                details: format!("close_dir({name:?}) without matching open_dir"),
            });
        }
        let start = self.write_pending(data)?;
        self.attach(name, start);
        Ok(())
    }

    /// Emit a node without children.
    pub fn leaf(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.open_dir();
        self.close_dir(name, data)
    }

    /// Copy `node` and its whole subtree verbatim from another tree.
    pub fn copy_subtree(&mut self, name: &str, node: &NodeRef) -> Result<()> {
        let (first, end) = node.subtree_range()?;
        let bytes = &node.tree.body()[first..end];
        self.out.write_all(bytes).map_err(write_error)?;
        let start = self.pos + (node.start - first) as u64;
        self.pos += bytes.len() as u64;
        self.attach(name, start);
        Ok(())
    }

    /// Close the root with `data`, write the footer and return the sink.
    pub fn finish(mut self, data: &[u8]) -> Result<W> {
        if self.stack.len() != 1 {
            return Err(BrtError::Serialization {
                context: "tree writer",
                details: format!("{} directories left open", self.stack.len() - 1),
            });
        }
        let root = self.write_pending(data)?;
        self.out.write_all(&root.to_le_bytes()).map_err(write_error)?;
        self.out.flush().map_err(write_error)?;
        Ok(self.out)
    }

    fn attach(&mut self, name: &str, start: u64) {
        if let Some(parent) = self.stack.last_mut() {
            parent.children.push((name.to_string(), start));
        }
    }

    fn write_pending(&mut self, data: &[u8]) -> Result<u64> {
        let Some(mut dir) = self.stack.pop() else {
            return Err(BrtError::Serialization {
                context: "tree writer",
                details: "writer stack is empty".to_string(),
            });
        };
        dir.children.sort_by(|a, b| a.0.cmp(&b.0));

        let start = self.pos;
        self.record.clear();
        put_uvarint(&mut self.record, start - dir.subtree_start);
        put_uvarint(&mut self.record, data.len() as u64);
        self.record.extend_from_slice(data);
        put_uvarint(&mut self.record, dir.children.len() as u64);
        for (name, child_start) in &dir.children {
            put_uvarint(&mut self.record, name.len() as u64);
            self.record.extend_from_slice(name.as_bytes());
            put_uvarint(&mut self.record, start - child_start);
        }
        self.out.write_all(&self.record).map_err(write_error)?;
        self.pos += self.record.len() as u64;
        Ok(start)
    }
}

fn write_error(err: std::io::Error) -> BrtError {
    BrtError::Serialization {
        context: "tree writer",
        details: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(node: &NodeRef) -> Vec<String> {
        node.children()
            .unwrap()
            .map(|entry| entry.unwrap().0.to_string())
            .collect()
    }

    /// /
    /// ├── b/ ("B")
    /// │   └── x ("X")
    /// └── a ("A")
    fn sample() -> SegmentTree {
        let mut writer = TreeWriter::new(Vec::new()).unwrap();
        writer.open_dir();
        writer.leaf("x", b"X").unwrap();
        writer.close_dir("b/", b"B").unwrap();
        writer.leaf("a", b"A").unwrap();
        SegmentTree::from_bytes(writer.finish(b"ROOT").unwrap()).unwrap()
    }

    #[test]
    fn navigates_written_tree() {
        let tree = sample();
        let root = tree.root();
        assert_eq!(root.data().unwrap(), b"ROOT");
        assert_eq!(names(&root), vec!["a", "b/"]);

        let b = root.child("b/").unwrap().expect("b/ exists");
        assert_eq!(b.data().unwrap(), b"B");
        let x = b.child("x").unwrap().expect("x exists");
        assert_eq!(x.data().unwrap(), b"X");
        assert_eq!(x.child_count().unwrap(), 0);
        assert!(root.child("zzz").unwrap().is_none());
    }

    #[test]
    fn copied_subtree_is_byte_identical_and_navigable() {
        let source = sample();
        let b = source.root().child("b/").unwrap().unwrap();

        let mut writer = TreeWriter::new(Vec::new()).unwrap();
        writer.leaf("first", b"1").unwrap();
        writer.copy_subtree("copy/", &b).unwrap();
        let copied = SegmentTree::from_bytes(writer.finish(b"NEW").unwrap()).unwrap();

        let copy = copied.root().child("copy/").unwrap().unwrap();
        assert_eq!(copy.data().unwrap(), b"B");
        assert_eq!(
            copy.child("x").unwrap().unwrap().data().unwrap(),
            b"X"
        );

        let (a0, a1) = b.subtree_range().unwrap();
        let (b0, b1) = copy.subtree_range().unwrap();
        assert_eq!(source.body()[a0..a1], copied.body()[b0..b1]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(SegmentTree::from_bytes(b"not a tree at all".to_vec()).is_err());

        let mut bytes = sample().bytes.to_vec();
        let len = bytes.len();
        bytes[len - 8..].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(SegmentTree::from_bytes(bytes).is_err());
    }

    #[test]
    fn unbalanced_writer_is_an_error() {
        let mut writer = TreeWriter::new(Vec::new()).unwrap();
        assert!(writer.close_dir("x/", b"").is_err());
        writer.open_dir();
        assert!(writer.finish(b"").is_err());
    }

    #[test]
    fn opens_memory_mapped_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.db");
        let mut writer = TreeWriter::new(std::fs::File::create(&path).unwrap()).unwrap();
        writer.leaf("only", b"payload").unwrap();
        writer.finish(b"").unwrap();

        let tree = SegmentTree::open_file(&path).unwrap();
        let only = tree.root().child("only").unwrap().unwrap();
        assert_eq!(only.data().unwrap(), b"payload");
    }
}
