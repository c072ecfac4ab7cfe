use crate::backing_store::{in_transaction, BackingStore, SqlValue, StoreExecutor};
use crate::block_store::BlockStore;
use crate::config::RelFsConfig;
use crate::metadata_store::MetadataStore;
use crate::namespace_store::NamespaceStore;
use crate::path::{resolve, PathResolver, Resolution};
use crate::schema::{create_schema, TableNames};
use crate::sqlite_store::SqliteBackingStore;
use crate::types::{DirEntry, EdgeRecord, NodeId, NodeKind, NodeRecord, ROOT_NAME};
use crate::{RelFsError, RelFsResult};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Affected rows per consistency-check stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsckReport {
    pub purged_nodes: u64,
    pub orphan_edges: u64,
    pub reset_in_use: u64,
    pub orphan_blocks: u64,
    pub resized_nodes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub block_size: u64,
    /// Total bytes rounded up to whole blocks.
    pub blocks: u64,
    pub nodes: u64,
    pub total_bytes: u64,
    /// Rows in the data block table.
    pub stored_blocks: u64,
}

/// Filesystem operations on paths, the surface a driver calls into.
pub struct NamespaceService {
    config: RelFsConfig,
    store: Arc<dyn BackingStore>,
    tables: Arc<TableNames>,
    metadata: MetadataStore,
    namespace: NamespaceStore,
    blocks: BlockStore,
    resolver: PathResolver,
    root_id: NodeId,
}

impl NamespaceService {
    /// Open the store named by `config.store` and bootstrap the namespace.
    pub fn open(config: RelFsConfig) -> RelFsResult<Self> {
        config.validate()?;
        let store = SqliteBackingStore::open(&config.store)?;
        Self::with_store(Arc::new(store), config)
    }

    pub fn with_store(store: Arc<dyn BackingStore>, config: RelFsConfig) -> RelFsResult<Self> {
        config.validate()?;
        let tables = Arc::new(TableNames::with_prefix(&config.store.table_prefix));
        create_schema(store.executor(), &tables)?;

        let metadata = MetadataStore::new(store.clone(), tables.clone());
        let namespace = NamespaceStore::new(
            store.clone(),
            tables.clone(),
            metadata.clone(),
            config.owner_uid,
            config.owner_gid,
        );
        let blocks = BlockStore::new(
            store.clone(),
            tables.clone(),
            metadata.clone(),
            config.max_chunk_size,
        );
        let resolver = PathResolver::new(namespace.clone());

        let root = namespace.create_edge(ROOT_NAME, None, NodeKind::Dir.mode_with(config.dir_mode))?;
        if root.created {
            info!("NamespaceService: created root node {}", root.node_id);
        } else {
            info!("NamespaceService: root node {}", root.node_id);
        }

        Ok(Self {
            config,
            store,
            tables,
            metadata,
            namespace,
            blocks,
            resolver,
            root_id: root.node_id,
        })
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub fn config(&self) -> &RelFsConfig {
        &self.config
    }

    pub fn backing_store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn namespace(&self) -> &NamespaceStore {
        &self.namespace
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    fn dir_mode(&self) -> u32 {
        NodeKind::Dir.mode_with(self.config.dir_mode)
    }

    fn file_mode(&self) -> u32 {
        NodeKind::File.mode_with(self.config.file_mode)
    }

    fn lookup(&self, path: &str) -> RelFsResult<EdgeRecord> {
        self.resolver.lookup(path)
    }

    fn require_dir(&self, node_id: NodeId, what: &str) -> RelFsResult<NodeRecord> {
        let node = self.metadata.get(node_id)?;
        if !node.is_dir() {
            return Err(RelFsError::NotADirectory(what.to_string()));
        }
        Ok(node)
    }

    /// Create `name` under `parent`. Concurrent creators of the same name all
    /// get the same node id.
    pub fn create_item(&self, name: &str, parent: NodeId, mode: u32) -> RelFsResult<NodeId> {
        self.require_dir(parent, &format!("node {}", parent))?;
        Ok(self.namespace.create_edge(name, Some(parent), mode)?.node_id)
    }

    /// Create every missing directory along `path`; returns the last one.
    pub fn create_path(&self, path: &str) -> RelFsResult<NodeId> {
        let mut parent = self.root_id;
        for segment in resolve(path).skip(1) {
            // existing segments are only read, the write lock is taken for misses
            let (node_id, created) = match self.namespace.find_edge(segment, Some(parent))? {
                Some(edge) => (edge.node_id, false),
                None => {
                    let creation = self
                        .namespace
                        .create_edge(segment, Some(parent), self.dir_mode())?;
                    (creation.node_id, creation.created)
                }
            };
            if !created {
                self.require_dir(node_id, path)?;
            }
            parent = node_id;
        }
        Ok(parent)
    }

    pub fn create_directory(&self, path: &str) -> RelFsResult<NodeId> {
        debug!("NamespaceService: create_directory {}", path);
        self.create_path(path)
    }

    /// The directory itself as `"."`, then its children by name.
    pub fn list_directory(&self, path: &str) -> RelFsResult<Vec<DirEntry>> {
        let edge = self.lookup(path)?;
        let node = self.require_dir(edge.node_id, path)?;
        let children = self.namespace.list_entries(edge.node_id)?;

        let mut entries = Vec::with_capacity(children.len() + 1);
        entries.push(DirEntry {
            name: ".".to_string(),
            node,
        });
        entries.extend(children);
        Ok(entries)
    }

    pub fn read_file(&self, path: &str) -> RelFsResult<Vec<u8>> {
        let edge = self.lookup(path)?;
        let node = self.metadata.get(edge.node_id)?;
        if node.is_dir() {
            return Err(RelFsError::IsADirectory(path.to_string()));
        }
        self.blocks.read_all(edge.node_id)
    }

    /// Up to `size` bytes of the file at `path` starting at `offset`; short at
    /// end of content.
    pub fn read_file_range(&self, path: &str, offset: u64, size: usize) -> RelFsResult<Vec<u8>> {
        let edge = self.lookup(path)?;
        let node = self.metadata.get(edge.node_id)?;
        if node.is_dir() {
            return Err(RelFsError::IsADirectory(path.to_string()));
        }
        self.blocks.read_range(edge.node_id, offset, size)
    }

    /// Create a new file at `path` holding `content`. Existing paths are
    /// never overwritten. Either the file and all of its blocks are stored
    /// or nothing is.
    pub fn write_file(&self, path: &str, content: &[u8]) -> RelFsResult<NodeId> {
        let (parent, name) = match self.resolver.walk(resolve(path))? {
            Resolution::Found(_) => {
                return Err(RelFsError::AlreadyExists(path.to_string()));
            }
            Resolution::Missing {
                parent: Some(parent),
                segment,
                terminal: true,
                ..
            } => (parent, segment),
            Resolution::Missing { segment, .. } => {
                return Err(RelFsError::NotFound(format!(
                    "parent directory of {} ({} missing)",
                    path, segment
                )));
            }
        };
        self.require_dir(parent, path)?;

        let mode = self.file_mode();
        let chunk_size = self.blocks.max_chunk_size();
        let node_id = in_transaction(self.store.as_ref(), |tx: &dyn StoreExecutor| {
            let node_id = self
                .namespace
                .create_edge_in(tx, &name, Some(parent), mode)?
                .ok_or_else(|| RelFsError::AlreadyExists(path.to_string()))?;
            for chunk in content.chunks(chunk_size) {
                self.blocks.append_block_in(tx, node_id, chunk)?;
            }
            Ok(node_id)
        })?;

        debug!(
            "NamespaceService: wrote {} ({} bytes) as node {}",
            path,
            content.len(),
            node_id
        );
        Ok(node_id)
    }

    pub fn stat(&self, path: &str) -> RelFsResult<NodeRecord> {
        let edge = self.lookup(path)?;
        self.metadata.get(edge.node_id)
    }

    /// Change permission bits; the node keeps its kind.
    pub fn chmod(&self, path: &str, mode: u32) -> RelFsResult<()> {
        let edge = self.lookup(path)?;
        self.metadata.set_mode(edge.node_id, mode)
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> RelFsResult<()> {
        let edge = self.lookup(path)?;
        self.metadata.set_owner(edge.node_id, uid, gid)
    }

    pub fn utime(&self, path: &str, atime: u64, mtime: u64) -> RelFsResult<()> {
        let edge = self.lookup(path)?;
        self.metadata.set_times(edge.node_id, atime, mtime)
    }

    pub fn open_handle(&self, path: &str) -> RelFsResult<NodeId> {
        let edge = self.lookup(path)?;
        self.metadata.adjust_in_use(edge.node_id, 1)?;
        Ok(edge.node_id)
    }

    pub fn release_handle(&self, node_id: NodeId) -> RelFsResult<()> {
        self.metadata.adjust_in_use(node_id, -1)
    }

    /// Repair the tables: purge nodes flagged deleted, drop edges and blocks
    /// left without a node, clear open-handle counters and recompute sizes.
    /// Run with no open handles.
    pub fn fsck(&self) -> RelFsResult<FsckReport> {
        let tables = &self.tables;
        let report = in_transaction(self.store.as_ref(), |tx: &dyn StoreExecutor| {
            let mut report = FsckReport::default();

            let sql = format!(
                "DELETE FROM {} WHERE deleted = 1 AND inode != ?1",
                tables.inodes
            );
            report.purged_nodes = tx.execute(&sql, &[SqlValue::try_from(self.root_id)?])? as u64;
            info!("fsck stage 1: purged {} deleted nodes", report.purged_nodes);

            let sql = format!(
                "DELETE FROM {} WHERE inode NOT IN (SELECT inode FROM {}) AND inode != ?1",
                tables.tree, tables.inodes
            );
            report.orphan_edges = tx.execute(&sql, &[SqlValue::try_from(self.root_id)?])? as u64;
            info!("fsck stage 2: removed {} orphan edges", report.orphan_edges);

            let sql = format!("UPDATE {} SET inuse = 0 WHERE inuse != 0", tables.inodes);
            report.reset_in_use = tx.execute(&sql, &[])? as u64;
            info!("fsck stage 3: reset {} open-handle counters", report.reset_in_use);

            let sql = format!(
                "DELETE FROM {} WHERE inode NOT IN (SELECT inode FROM {})",
                tables.data_blocks, tables.inodes
            );
            report.orphan_blocks = tx.execute(&sql, &[])? as u64;
            info!("fsck stage 4: removed {} orphan blocks", report.orphan_blocks);

            let stored = format!(
                "(SELECT IFNULL(SUM(d.datalength), 0) FROM {} d WHERE d.inode = {}.inode)",
                tables.data_blocks, tables.inodes
            );
            let sql = format!(
                "UPDATE {} SET size = {} WHERE size != {}",
                tables.inodes, stored, stored
            );
            report.resized_nodes = tx.execute(&sql, &[])? as u64;
            info!("fsck stage 5: resized {} nodes", report.resized_nodes);

            Ok(report)
        })
        .map_err(|e| {
            warn!("NamespaceService: fsck failed: {}", e);
            e
        })?;
        Ok(report)
    }

    pub fn statfs(&self) -> RelFsResult<FsStats> {
        let block_size = self.config.max_chunk_size as u64;
        let nodes = self.metadata.count_nodes()?;
        let total_bytes = self.metadata.total_size()?;
        Ok(FsStats {
            block_size,
            blocks: total_bytes.div_ceil(block_size),
            nodes,
            total_bytes,
            stored_blocks: self.blocks.count_blocks()?,
        })
    }
}
