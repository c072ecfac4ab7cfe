use crate::backing_store::{BackingStore, SqlRow, SqlValue, StoreExecutor};
use crate::schema::TableNames;
use crate::types::{unix_timestamp, NodeId, NodeRecord, PERMISSION_MASK};
use crate::{RelFsError, RelFsResult};
use log::debug;
use std::sync::Arc;

const NODE_COLUMN_NAMES: [&str; 10] = [
    "inode", "mode", "uid", "gid", "atime", "ctime", "mtime", "size", "inuse", "deleted",
];

/// Select list for a node record, optionally qualified by a table alias.
pub(crate) fn node_columns(alias: &str) -> String {
    NODE_COLUMN_NAMES
        .iter()
        .map(|c| {
            if alias.is_empty() {
                c.to_string()
            } else {
                format!("{}.{}", alias, c)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Parse the ten node columns starting at `offset`.
pub(crate) fn parse_node(row: &SqlRow, offset: usize) -> RelFsResult<NodeRecord> {
    let as_u32 = |idx: usize| -> RelFsResult<u32> {
        let v = row.get_u64(offset + idx)?;
        u32::try_from(v)
            .map_err(|_| RelFsError::StoreError(format!("column value {} overflows u32", v)))
    };
    Ok(NodeRecord {
        node_id: row.get_u64(offset)?,
        mode: as_u32(1)?,
        uid: as_u32(2)?,
        gid: as_u32(3)?,
        atime: row.get_u64(offset + 4)?,
        ctime: row.get_u64(offset + 5)?,
        mtime: row.get_u64(offset + 6)?,
        size: row.get_u64(offset + 7)?,
        in_use: as_u32(8)?,
        deleted: row.get_i64(offset + 9)? != 0,
    })
}

/// Per-node attributes stored in the inodes table.
#[derive(Clone)]
pub struct MetadataStore {
    store: Arc<dyn BackingStore>,
    tables: Arc<TableNames>,
}

impl MetadataStore {
    pub fn new(store: Arc<dyn BackingStore>, tables: Arc<TableNames>) -> Self {
        Self { store, tables }
    }

    pub fn get(&self, node_id: NodeId) -> RelFsResult<NodeRecord> {
        self.get_in(self.store.executor(), node_id)
    }

    pub fn set_size(&self, node_id: NodeId, size: u64) -> RelFsResult<()> {
        self.set_size_in(self.store.executor(), node_id, size)
    }

    pub fn touch_modify_time(&self, node_id: NodeId) -> RelFsResult<()> {
        self.touch_modify_time_in(self.store.executor(), node_id)
    }

    /// Replace the permission bits, keeping the type bits already stored.
    pub fn set_mode(&self, node_id: NodeId, mode: u32) -> RelFsResult<()> {
        let sql = format!(
            "UPDATE {} SET mode = ((mode & ?1) | ?2), ctime = ?3 WHERE inode = ?4",
            self.tables.inodes
        );
        let changed = self.store.execute(
            &sql,
            &[
                (!PERMISSION_MASK).into(),
                (mode & PERMISSION_MASK).into(),
                SqlValue::try_from(unix_timestamp())?,
                SqlValue::try_from(node_id)?,
            ],
        )?;
        expect_one(changed, node_id)
    }

    pub fn set_owner(&self, node_id: NodeId, uid: u32, gid: u32) -> RelFsResult<()> {
        let sql = format!(
            "UPDATE {} SET uid = ?1, gid = ?2, ctime = ?3 WHERE inode = ?4",
            self.tables.inodes
        );
        let changed = self.store.execute(
            &sql,
            &[
                uid.into(),
                gid.into(),
                SqlValue::try_from(unix_timestamp())?,
                SqlValue::try_from(node_id)?,
            ],
        )?;
        expect_one(changed, node_id)
    }

    pub fn set_times(&self, node_id: NodeId, atime: u64, mtime: u64) -> RelFsResult<()> {
        let sql = format!(
            "UPDATE {} SET atime = ?1, mtime = ?2 WHERE inode = ?3",
            self.tables.inodes
        );
        let params = [
            SqlValue::try_from(atime)?,
            SqlValue::try_from(mtime)?,
            SqlValue::try_from(node_id)?,
        ];
        let changed = self.store.execute(&sql, &params)?;
        expect_one(changed, node_id)
    }

    /// Add `delta` to the open-handle counter, clamped at zero.
    pub fn adjust_in_use(&self, node_id: NodeId, delta: i64) -> RelFsResult<()> {
        let sql = format!(
            "UPDATE {} SET inuse = MAX(inuse + ?1, 0) WHERE inode = ?2",
            self.tables.inodes
        );
        let changed = self
            .store
            .execute(&sql, &[delta.into(), SqlValue::try_from(node_id)?])?;
        expect_one(changed, node_id)
    }

    pub(crate) fn insert_in(
        &self,
        exec: &dyn StoreExecutor,
        node_id: NodeId,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> RelFsResult<()> {
        let now = unix_timestamp();
        let sql = format!(
            "INSERT INTO {} (inode, inuse, deleted, mode, uid, gid, atime, ctime, mtime, size)
             VALUES (?1, 0, 0, ?2, ?3, ?4, ?5, ?5, ?5, 0)",
            self.tables.inodes
        );
        exec.execute(
            &sql,
            &[
                SqlValue::try_from(node_id)?,
                mode.into(),
                uid.into(),
                gid.into(),
                SqlValue::try_from(now)?,
            ],
        )?;
        debug!("MetadataStore: new node {} mode {:o}", node_id, mode);
        Ok(())
    }

    pub(crate) fn get_in(&self, exec: &dyn StoreExecutor, node_id: NodeId) -> RelFsResult<NodeRecord> {
        let sql = format!(
            "SELECT {} FROM {} WHERE inode = ?1",
            node_columns(""),
            self.tables.inodes
        );
        let row = exec
            .query_one(&sql, &[SqlValue::try_from(node_id)?])?
            .ok_or_else(|| RelFsError::NotFound(format!("node {}", node_id)))?;
        parse_node(&row, 0)
    }

    pub(crate) fn set_size_in(
        &self,
        exec: &dyn StoreExecutor,
        node_id: NodeId,
        size: u64,
    ) -> RelFsResult<()> {
        let sql = format!("UPDATE {} SET size = ?1 WHERE inode = ?2", self.tables.inodes);
        let changed = exec.execute(
            &sql,
            &[SqlValue::try_from(size)?, SqlValue::try_from(node_id)?],
        )?;
        expect_one(changed, node_id)
    }

    pub(crate) fn touch_modify_time_in(
        &self,
        exec: &dyn StoreExecutor,
        node_id: NodeId,
    ) -> RelFsResult<()> {
        let sql = format!("UPDATE {} SET mtime = ?1 WHERE inode = ?2", self.tables.inodes);
        let changed = exec.execute(
            &sql,
            &[SqlValue::try_from(unix_timestamp())?, SqlValue::try_from(node_id)?],
        )?;
        expect_one(changed, node_id)
    }

    pub(crate) fn count_nodes(&self) -> RelFsResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.tables.inodes);
        let row = self.store.query_one(&sql, &[])?;
        match row {
            Some(row) => row.get_u64(0),
            None => Ok(0),
        }
    }

    pub(crate) fn total_size(&self) -> RelFsResult<u64> {
        let sql = format!("SELECT SUM(size) FROM {}", self.tables.inodes);
        let row = self.store.query_one(&sql, &[])?;
        match row {
            Some(row) => row.get_u64(0),
            None => Ok(0),
        }
    }
}

fn expect_one(changed: usize, node_id: NodeId) -> RelFsResult<()> {
    if changed == 0 {
        return Err(RelFsError::NotFound(format!("node {}", node_id)));
    }
    Ok(())
}
