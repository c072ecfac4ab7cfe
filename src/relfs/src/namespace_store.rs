use crate::backing_store::{in_transaction, BackingStore, SqlRow, SqlValue, StoreExecutor};
use crate::metadata_store::{node_columns, parse_node, MetadataStore};
use crate::schema::TableNames;
use crate::types::{check_edge_name, DirEntry, EdgeRecord, NodeId};
use crate::{RelFsError, RelFsResult};
use log::{debug, warn};
use std::sync::Arc;

/// Result of `create_edge`. `created` is false when another creator won the
/// race (or the edge already existed) and `node_id` is the existing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeCreation {
    pub node_id: NodeId,
    pub created: bool,
}

/// `(name, parent) -> node` edges of the tree table.
#[derive(Clone)]
pub struct NamespaceStore {
    store: Arc<dyn BackingStore>,
    tables: Arc<TableNames>,
    metadata: MetadataStore,
    owner_uid: u32,
    owner_gid: u32,
}

fn parse_edge(row: &SqlRow) -> RelFsResult<EdgeRecord> {
    let parent = match row.get_opt_i64(2)? {
        Some(v) => Some(u64::try_from(v).map_err(|_| {
            RelFsError::StoreError(format!("negative parent id {}", v))
        })?),
        None => None,
    };
    Ok(EdgeRecord {
        node_id: row.get_u64(0)?,
        name: row.get_text(1)?,
        parent,
    })
}

impl NamespaceStore {
    pub fn new(
        store: Arc<dyn BackingStore>,
        tables: Arc<TableNames>,
        metadata: MetadataStore,
        owner_uid: u32,
        owner_gid: u32,
    ) -> Self {
        Self {
            store,
            tables,
            metadata,
            owner_uid,
            owner_gid,
        }
    }

    pub fn find_edge(&self, name: &str, parent: Option<NodeId>) -> RelFsResult<Option<EdgeRecord>> {
        self.find_edge_in(self.store.executor(), name, parent)
    }

    pub(crate) fn find_edge_in(
        &self,
        exec: &dyn StoreExecutor,
        name: &str,
        parent: Option<NodeId>,
    ) -> RelFsResult<Option<EdgeRecord>> {
        let row = match parent {
            Some(parent) => {
                let sql = format!(
                    "SELECT inode, name, parent FROM {} WHERE name = ?1 AND parent = ?2",
                    self.tables.tree
                );
                exec.query_one(&sql, &[name.into(), SqlValue::try_from(parent)?])?
            }
            None => {
                let sql = format!(
                    "SELECT inode, name, parent FROM {} WHERE name = ?1 AND parent IS NULL",
                    self.tables.tree
                );
                exec.query_one(&sql, &[name.into()])?
            }
        };
        row.as_ref().map(parse_edge).transpose()
    }

    /// Create `name` under `parent` together with its node, or return the
    /// node that already holds that name.
    pub fn create_edge(
        &self,
        name: &str,
        parent: Option<NodeId>,
        mode: u32,
    ) -> RelFsResult<EdgeCreation> {
        let result = in_transaction(self.store.as_ref(), |tx: &dyn StoreExecutor| {
            match self.create_edge_in(tx, name, parent, mode)? {
                Some(node_id) => Ok(node_id),
                None => Err(RelFsError::ConflictOnCreate(format!(
                    "{} under {:?}",
                    name, parent
                ))),
            }
        });

        match result {
            Ok(node_id) => Ok(EdgeCreation {
                node_id,
                created: true,
            }),
            Err(RelFsError::ConflictOnCreate(msg)) => {
                debug!("NamespaceStore: edge exists, re-reading: {}", msg);
                match self.find_edge(name, parent)? {
                    Some(edge) => Ok(EdgeCreation {
                        node_id: edge.node_id,
                        created: false,
                    }),
                    None => {
                        warn!("NamespaceStore: conflicting edge vanished: {}", msg);
                        Err(RelFsError::ConflictOnCreate(msg))
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Insert edge and node on an open transaction. None means the name is
    /// already taken and nothing was written.
    pub(crate) fn create_edge_in(
        &self,
        exec: &dyn StoreExecutor,
        name: &str,
        parent: Option<NodeId>,
        mode: u32,
    ) -> RelFsResult<Option<NodeId>> {
        if !check_edge_name(name, parent) {
            return Err(RelFsError::InvalidPath(format!(
                "bad entry name {:?} under {:?}",
                name, parent
            )));
        }

        let sql = format!(
            "INSERT OR IGNORE INTO {} (name, parent) VALUES (?1, ?2)",
            self.tables.tree
        );
        let inserted = exec.insert(&sql, &[name.into(), SqlValue::from_opt_u64(parent)?])?;
        let node_id = match inserted {
            Some(id) => u64::try_from(id)
                .map_err(|_| RelFsError::StoreError(format!("negative node id {}", id)))?,
            None => return Ok(None),
        };

        self.metadata
            .insert_in(exec, node_id, mode, self.owner_uid, self.owner_gid)?;
        debug!(
            "NamespaceStore: created edge {} under {:?} -> {}",
            name, parent, node_id
        );
        Ok(Some(node_id))
    }

    pub fn list_children(&self, parent: NodeId) -> RelFsResult<Vec<EdgeRecord>> {
        let sql = format!(
            "SELECT inode, name, parent FROM {} WHERE parent = ?1 ORDER BY name",
            self.tables.tree
        );
        let rows = self.store.query_all(&sql, &[SqlValue::try_from(parent)?])?;
        rows.iter().map(parse_edge).collect()
    }

    /// Children of `parent` with their attributes, ordered by name. Edges
    /// whose node row is missing are skipped.
    pub fn list_entries(&self, parent: NodeId) -> RelFsResult<Vec<DirEntry>> {
        let sql = format!(
            "SELECT t.name, {} FROM {} t JOIN {} i ON i.inode = t.inode
             WHERE t.parent = ?1 ORDER BY t.name",
            node_columns("i"),
            self.tables.tree,
            self.tables.inodes
        );
        let rows = self.store.query_all(&sql, &[SqlValue::try_from(parent)?])?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            entries.push(DirEntry {
                name: row.get_text(0)?,
                node: parse_node(row, 1)?,
            });
        }
        Ok(entries)
    }
}
