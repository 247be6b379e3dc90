//! The in-memory directory tree served to the filesystem transport.
//!
//! The tree is built exactly once from archive entry metadata and is
//! immutable afterwards, so it can be read concurrently without locks.
//! Nodes live in an arena and refer to each other by [`NodeId`]; a
//! directory owns the insertion-ordered list of its children. Lookups go
//! through two indexes: absolute pathname -> node, and archive entry index
//! -> node.

use std::{collections::HashMap, fmt};

use bstr::{BStr, BString, ByteSlice};

/// File-type bits of a node's mode, matching the Unix `S_IFMT` encoding.
pub const TYPE_MASK: u32 = 0o170000;
pub const TYPE_DIR: u32 = 0o040000;
pub const TYPE_REG: u32 = 0o100000;
pub const TYPE_LNK: u32 = 0o120000;

/// Permission bits a mount ever grants: read and execute, never write.
pub const RX_MASK: u32 = 0o555;

/// A stable handle to a node in a [`Tree`]'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    /// The root directory. Every tree has one.
    pub const ROOT: NodeId = NodeId(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    RegularFile,
    Symlink,
}

/// One entry in the virtual filesystem.
#[derive(Debug)]
pub struct Node {
    /// Path segment relative to the parent. Empty for the root.
    pub rel_name: BString,
    pub kind: NodeKind,
    /// Present iff `kind` is [`NodeKind::Symlink`].
    pub symlink_target: Option<BString>,
    /// The entry's sequential position in the archive. `None` for the root
    /// and for implicit directories that have no archive entry of their own.
    pub index_within_archive: Option<u64>,
    /// Decompressed byte length. Zero for directories.
    pub size: u64,
    /// Seconds since the epoch. A directory reports the minimum of its
    /// descendants' mtimes (the oldest leaf), not the maximum.
    pub mtime: i64,
    /// Read/execute permission bits plus the file-type bits.
    pub mode: u32,
    children: Vec<NodeId>,
}

impl Node {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// The immutable directory tree of one mounted archive.
pub struct Tree {
    nodes: Vec<Node>,
    by_name: HashMap<BString, NodeId>,
    by_index: Vec<Option<NodeId>>,
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tree")
            .field("nodes", &self.nodes.len())
            .field("leaves", &self.by_index.len())
            .finish_non_exhaustive()
    }
}

impl Tree {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    /// Look up a node by absolute pathname (`"/"`, `"/dir/file"`). O(1)
    /// amortized.
    pub fn get(&self, pathname: impl AsRef<[u8]>) -> Option<NodeId> {
        self.by_name.get(BStr::new(pathname.as_ref())).copied()
    }

    /// Look up the leaf node for the given archive entry index. O(1).
    pub fn get_by_index(&self, index: u64) -> Option<NodeId> {
        *usize::try_from(index).ok().and_then(|i| self.by_index.get(i))?
    }

    /// A directory's children, in archive insertion order.
    pub fn children(&self, id: NodeId) -> impl ExactSizeIterator<Item = (NodeId, &Node)> + '_ {
        self.nodes[id.0 as usize]
            .children
            .iter()
            .map(|&c| (c, self.node(c)))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// A fatal defect found while building the tree. Any of these makes the
/// whole mount fail; a partial tree is never served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Two entries resolved to the same absolute pathname.
    DuplicatePathname(BString),
    /// An entry's archive index was not greater than all previously
    /// inserted ones. Decoders iterate in order; a decrease means the
    /// archive is malformed or adversarial.
    IndexOutOfOrder(BString),
    /// The same pathname is used both as a file and as a directory.
    FileDirectoryConflict(BString),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::DuplicatePathname(p) => write!(f, "duplicate pathname: {p}"),
            BuildError::IndexOutOfOrder(p) => {
                write!(f, "archive entry index out of order at: {p}")
            }
            BuildError::FileDirectoryConflict(p) => {
                write!(f, "simultaneous directory and regular file: {p}")
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// Builds a [`Tree`] from one pass of archive entry metadata.
///
/// The builder only sees normalized absolute pathnames; rejecting invalid
/// ones (and deciding to skip rather than fail) is the scanner's job, via
/// [`normalize_pathname`].
pub(crate) struct TreeBuilder {
    tree: Tree,
}

// Sentinel for "no leaf has touched this directory yet", so that the first
// leaf always wins the minimum-mtime comparison.
const MTIME_UNSET: i64 = i64::MAX;

impl TreeBuilder {
    pub fn new() -> Self {
        let root = Node {
            rel_name: BString::default(),
            kind: NodeKind::Directory,
            symlink_target: None,
            index_within_archive: None,
            size: 0,
            mtime: MTIME_UNSET,
            mode: TYPE_DIR,
            children: Vec::new(),
        };
        let mut by_name = HashMap::new();
        by_name.insert(BString::from("/"), NodeId::ROOT);
        Self {
            tree: Tree {
                nodes: vec![root],
                by_name,
                by_index: Vec::new(),
            },
        }
    }

    /// Insert one leaf (regular file or symlink) at a normalized absolute
    /// pathname, creating implicit directories along the way.
    pub fn insert_leaf(
        &mut self,
        pathname: &BStr,
        symlink_target: Option<BString>,
        index_within_archive: u64,
        size: u64,
        mtime: i64,
        mode: u32,
    ) -> Result<(), BuildError> {
        debug_assert!(pathname.first() == Some(&b'/'));
        if self.tree.by_name.contains_key(pathname) {
            return Err(BuildError::DuplicatePathname(pathname.to_owned()));
        }

        let rx_bits = mode & RX_MASK;
        let r_bits = rx_bits & 0o444;
        // A directory is traversable whenever any of its content is
        // readable: mirror read bits into the execute (search) bits.
        let branch_mode = rx_bits | (r_bits >> 2) | TYPE_DIR;
        let (kind, leaf_mode) = match symlink_target {
            Some(_) => (NodeKind::Symlink, rx_bits | TYPE_LNK),
            None => (NodeKind::RegularFile, rx_bits | TYPE_REG),
        };

        let mut parent = NodeId::ROOT;
        // Fragment offsets: `frag_start..frag_end` brackets each path
        // segment, `..frag_end` is the absolute name of the node it forms.
        let mut frag_start = 1usize;
        loop {
            let parent_node = &mut self.tree.nodes[parent.0 as usize];
            if parent_node.mtime > mtime {
                parent_node.mtime = mtime;
            }
            parent_node.mode |= branch_mode;

            let frag_end = pathname[frag_start..]
                .find_byte(b'/')
                .map_or(pathname.len(), |i| frag_start + i);
            let abs_name = pathname[..frag_end].as_bstr();
            let rel_name = pathname[frag_start..frag_end].as_bstr();

            if frag_end == pathname.len() {
                // The final fragment: insert the explicit leaf.
                let id = self.push_node(
                    parent,
                    Node {
                        rel_name: rel_name.to_owned(),
                        kind,
                        symlink_target,
                        index_within_archive: Some(index_within_archive),
                        size,
                        mtime,
                        mode: leaf_mode,
                        children: Vec::new(),
                    },
                );
                self.tree.by_name.insert(abs_name.to_owned(), id);

                let by_index = &mut self.tree.by_index;
                let index = usize::try_from(index_within_archive)
                    .map_err(|_| BuildError::IndexOutOfOrder(pathname.to_owned()))?;
                while by_index.len() < index {
                    by_index.push(None);
                }
                if by_index.len() > index {
                    return Err(BuildError::IndexOutOfOrder(pathname.to_owned()));
                }
                by_index.push(Some(id));
                return Ok(());
            }
            frag_start = frag_end + 1;

            // An intermediate fragment: find or create the implicit
            // directory.
            match self.tree.by_name.get(abs_name) {
                None => {
                    let id = self.push_node(
                        parent,
                        Node {
                            rel_name: rel_name.to_owned(),
                            kind: NodeKind::Directory,
                            symlink_target: None,
                            index_within_archive: None,
                            size: 0,
                            mtime,
                            mode: branch_mode,
                            children: Vec::new(),
                        },
                    );
                    self.tree.by_name.insert(abs_name.to_owned(), id);
                    parent = id;
                }
                Some(&id) if self.tree.nodes[id.0 as usize].is_dir() => parent = id,
                Some(_) => {
                    return Err(BuildError::FileDirectoryConflict(abs_name.to_owned()));
                }
            }
        }
    }

    fn push_node(&mut self, parent: NodeId, node: Node) -> NodeId {
        let id = NodeId(self.tree.nodes.len() as u32);
        self.tree.nodes.push(node);
        self.tree.nodes[parent.0 as usize].children.push(id);
        id
    }

    pub fn finish(mut self) -> Tree {
        for node in &mut self.tree.nodes {
            if node.mtime == MTIME_UNSET {
                node.mtime = 0;
            }
        }
        self.tree
    }
}

/// Whether `p` is a well-formed pathname: non-empty and, splitting on `/`,
/// no fragment is empty, `"."` or `".."`, ignoring one leading `"/"` or
/// `"./"`. With `allow_slashes` unset, `p` must be a single fragment.
pub fn valid_pathname(p: &BStr, allow_slashes: bool) -> bool {
    let mut rest: &[u8] = p;
    if let Some(stripped) = rest.strip_prefix(b"./").or_else(|| rest.strip_prefix(b"/")) {
        if !allow_slashes {
            return false;
        }
        rest = stripped;
    }
    if rest.is_empty() {
        return false;
    }
    for fragment in rest.split(|&b| b == b'/') {
        if !allow_slashes && fragment.len() != rest.len() {
            return false;
        }
        if fragment.is_empty() || fragment == b"." || fragment == b".." {
            return false;
        }
    }
    true
}

/// Validate an archive entry's pathname and return its absolute form with a
/// leading `/`. Returns `None` for pathnames that must be skipped.
pub fn normalize_pathname(p: &BStr) -> Option<BString> {
    if !valid_pathname(p, true) {
        return None;
    }
    if let Some(stripped) = p.strip_prefix(b"./") {
        let mut out = BString::from("/");
        out.extend_from_slice(stripped);
        Some(out)
    } else if p.first() == Some(&b'/') {
        Some(p.to_owned())
    } else {
        let mut out = BString::from("/");
        out.extend_from_slice(p);
        Some(out)
    }
}
