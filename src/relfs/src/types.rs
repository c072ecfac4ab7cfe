use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Backing-store assigned node identifier (the `inode` column).
pub type NodeId = u64;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const PERMISSION_MASK: u32 = 0o7777;

pub const DEFAULT_DIR_MODE: u32 = 0o755;
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Name of the root edge, stored with a NULL parent.
pub const ROOT_NAME: &str = "/";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Dir,
    File,
    Other,
}

impl NodeKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => NodeKind::Dir,
            S_IFREG => NodeKind::File,
            _ => NodeKind::Other,
        }
    }

    /// Combine permission bits with the type bits of this kind.
    pub fn mode_with(&self, permissions: u32) -> u32 {
        let type_bits = match self {
            NodeKind::Dir => S_IFDIR,
            NodeKind::File => S_IFREG,
            NodeKind::Other => 0,
        };
        type_bits | (permissions & PERMISSION_MASK)
    }
}

/// Attributes of one node, a row of the inodes table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub size: u64,
    pub in_use: u32,
    pub deleted: bool,
}

impl NodeRecord {
    pub fn kind(&self) -> NodeKind {
        NodeKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind() == NodeKind::File
    }

    pub fn permissions(&self) -> u32 {
        self.mode & PERMISSION_MASK
    }
}

/// One directory entry: `name` under `parent` points at `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub name: String,
    pub parent: Option<NodeId>,
    pub node_id: NodeId,
}

impl EdgeRecord {
    pub fn is_root(&self) -> bool {
        self.parent.is_none() && self.name == ROOT_NAME
    }
}

/// A listed directory entry with the attributes of the node it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub node: NodeRecord,
}

pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Validate a single edge name. The root name is only legal without a parent.
pub(crate) fn check_edge_name(name: &str, parent: Option<NodeId>) -> bool {
    if parent.is_none() {
        return name == ROOT_NAME;
    }
    !name.is_empty() && !name.contains('/')
}
