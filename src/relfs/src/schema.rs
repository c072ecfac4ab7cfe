use crate::backing_store::StoreExecutor;
use crate::RelFsResult;
use log::info;

/// Physical table names, all sharing the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub tree: String,
    pub inodes: String,
    pub data_blocks: String,
}

impl TableNames {
    /// `prefix` must already be validated as an identifier fragment.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            tree: format!("{}tree", prefix),
            inodes: format!("{}inodes", prefix),
            data_blocks: format!("{}data_blocks", prefix),
        }
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self::with_prefix("")
    }
}

pub(crate) fn create_schema(exec: &dyn StoreExecutor, tables: &TableNames) -> RelFsResult<()> {
    info!(
        "relfs schema: tree={} inodes={} data_blocks={}",
        tables.tree, tables.inodes, tables.data_blocks
    );
    // the tree row owns the node id, so a node can never get a second edge;
    // the unique index folds the NULL root parent to 0 so it is covered too
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {tree} (
            inode INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            parent INTEGER
        );

        CREATE UNIQUE INDEX IF NOT EXISTS {tree}_name_parent
            ON {tree}(IFNULL(parent, 0), name);
        CREATE INDEX IF NOT EXISTS {tree}_parent ON {tree}(parent);

        CREATE TABLE IF NOT EXISTS {inodes} (
            inode INTEGER PRIMARY KEY,
            inuse INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            mode INTEGER NOT NULL DEFAULT 0,
            uid INTEGER NOT NULL DEFAULT 0,
            gid INTEGER NOT NULL DEFAULT 0,
            atime INTEGER NOT NULL DEFAULT 0,
            ctime INTEGER NOT NULL DEFAULT 0,
            mtime INTEGER NOT NULL DEFAULT 0,
            size INTEGER NOT NULL DEFAULT 0,
            CHECK (inuse >= 0)
        );

        CREATE TABLE IF NOT EXISTS {data_blocks} (
            inode INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            data BLOB,
            datalength INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (inode, seq)
        );",
        tree = tables.tree,
        inodes = tables.inodes,
        data_blocks = tables.data_blocks,
    );
    exec.execute_batch(&ddl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteBackingStore;

    #[test]
    fn test_prefixed_names() {
        let tables = TableNames::with_prefix("fs_");
        assert_eq!(tables.tree, "fs_tree");
        assert_eq!(tables.inodes, "fs_inodes");
        assert_eq!(tables.data_blocks, "fs_data_blocks");
    }

    #[test]
    fn test_create_schema_twice() {
        let store = SqliteBackingStore::open_in_memory().unwrap();
        let tables = TableNames::with_prefix("t_");
        create_schema(&store, &tables).unwrap();
        create_schema(&store, &tables).unwrap();

        // root uniqueness covers the NULL parent
        let sql = "INSERT OR IGNORE INTO t_tree (name, parent) VALUES ('/', NULL)";
        assert!(store.insert(sql, &[]).unwrap().is_some());
        assert!(store.insert(sql, &[]).unwrap().is_none());
    }
}
