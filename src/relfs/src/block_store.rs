use crate::backing_store::{in_transaction, BackingStore, SqlValue, StoreExecutor};
use crate::metadata_store::MetadataStore;
use crate::node_lock::{lock_node, NodeLockManager};
use crate::schema::TableNames;
use crate::types::NodeId;
use crate::{RelFsError, RelFsResult};
use log::debug;
use std::sync::Arc;

/// File content as an ordered run of bounded chunks per node.
#[derive(Clone)]
pub struct BlockStore {
    store: Arc<dyn BackingStore>,
    tables: Arc<TableNames>,
    metadata: MetadataStore,
    locks: Arc<NodeLockManager>,
    max_chunk_size: usize,
}

impl BlockStore {
    pub fn new(
        store: Arc<dyn BackingStore>,
        tables: Arc<TableNames>,
        metadata: MetadataStore,
        max_chunk_size: usize,
    ) -> Self {
        Self {
            store,
            tables,
            metadata,
            locks: Arc::new(NodeLockManager::new()),
            max_chunk_size,
        }
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    fn check_payload(&self, node_id: NodeId, payload: &[u8]) -> RelFsResult<()> {
        if payload.len() > self.max_chunk_size {
            return Err(RelFsError::PayloadTooLarge(format!(
                "block of {} bytes for node {} exceeds {}",
                payload.len(),
                node_id,
                self.max_chunk_size
            )));
        }
        Ok(())
    }

    /// Append one chunk and return its sequence number.
    pub fn append_block(&self, node_id: NodeId, payload: &[u8]) -> RelFsResult<u64> {
        self.check_payload(node_id, payload)?;
        let lock = self.locks.get_lock(node_id)?;
        let _guard = lock_node(&lock)?;
        in_transaction(self.store.as_ref(), |tx: &dyn StoreExecutor| {
            self.append_block_in(tx, node_id, payload)
        })
    }

    /// Append on an open transaction. Count, insert and resize must not
    /// interleave with another appender of the same node.
    pub(crate) fn append_block_in(
        &self,
        exec: &dyn StoreExecutor,
        node_id: NodeId,
        payload: &[u8],
    ) -> RelFsResult<u64> {
        self.check_payload(node_id, payload)?;
        let node = self.metadata.get_in(exec, node_id)?;
        if node.is_dir() {
            return Err(RelFsError::IsADirectory(format!("node {}", node_id)));
        }

        let seq = self.block_count_in(exec, node_id)?;
        let sql = format!(
            "INSERT INTO {} (inode, seq, data, datalength) VALUES (?1, ?2, ?3, ?4)",
            self.tables.data_blocks
        );
        exec.execute(
            &sql,
            &[
                SqlValue::try_from(node_id)?,
                SqlValue::try_from(seq)?,
                payload.into(),
                SqlValue::try_from(payload.len() as u64)?,
            ],
        )?;

        let size = self.stored_size_in(exec, node_id)?;
        self.metadata.set_size_in(exec, node_id, size)?;
        self.metadata.touch_modify_time_in(exec, node_id)?;
        debug!(
            "BlockStore: node {} block {} len {} size {}",
            node_id,
            seq,
            payload.len(),
            size
        );
        Ok(seq)
    }

    pub fn read_block(&self, node_id: NodeId, seq: u64) -> RelFsResult<Vec<u8>> {
        let sql = format!(
            "SELECT data FROM {} WHERE inode = ?1 AND seq = ?2",
            self.tables.data_blocks
        );
        let row = self
            .store
            .query_one(&sql, &[SqlValue::try_from(node_id)?, SqlValue::try_from(seq)?])?
            .ok_or_else(|| RelFsError::NotFound(format!("block {} of node {}", seq, node_id)))?;
        row.get_blob(0)
    }

    /// Concatenate blocks from sequence 0 until the first missing one.
    pub fn read_all(&self, node_id: NodeId) -> RelFsResult<Vec<u8>> {
        let mut content = Vec::new();
        let mut seq = 0;
        loop {
            match self.read_block(node_id, seq) {
                Ok(data) => content.extend_from_slice(&data),
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            }
            seq += 1;
        }
        Ok(content)
    }

    /// Read up to `size` bytes starting at byte `offset`. Only the blocks
    /// covering the range are fetched. The read ends at the first missing
    /// sequence number, so a short or empty result means end of content.
    pub fn read_range(&self, node_id: NodeId, offset: u64, size: usize) -> RelFsResult<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(size as u64);
        let node = SqlValue::try_from(node_id)?;

        // block lengths may differ, so map byte offsets to sequence numbers
        let sql = format!(
            "SELECT seq, datalength FROM {} WHERE inode = ?1 ORDER BY seq",
            self.tables.data_blocks
        );
        let rows = self.store.query_all(&sql, &[node.clone()])?;

        let mut block_start = 0u64;
        let mut range: Option<(u64, u64, u64)> = None;
        for (expected, row) in rows.iter().enumerate() {
            let seq = row.get_u64(0)?;
            if seq != expected as u64 {
                break;
            }
            let block_end = block_start + row.get_u64(1)?;
            if block_end > offset && block_start < end {
                range = Some(match range {
                    None => (seq, seq, offset - block_start),
                    Some((first, _, skip)) => (first, seq, skip),
                });
            }
            block_start = block_end;
            if block_start >= end {
                break;
            }
        }

        let (first, last, skip) = match range {
            Some(range) => range,
            None => return Ok(Vec::new()),
        };
        let sql = format!(
            "SELECT data FROM {} WHERE inode = ?1 AND seq BETWEEN ?2 AND ?3 ORDER BY seq",
            self.tables.data_blocks
        );
        let rows = self.store.query_all(
            &sql,
            &[node, SqlValue::try_from(first)?, SqlValue::try_from(last)?],
        )?;

        let mut content = Vec::with_capacity(size);
        for row in rows.iter() {
            content.extend_from_slice(&row.get_blob(0)?);
        }
        let skip = usize::try_from(skip)
            .map_err(|_| RelFsError::Internal(format!("block offset {} overflows", skip)))?;
        let mut content = content.split_off(skip.min(content.len()));
        content.truncate(size);
        debug!(
            "BlockStore: node {} read {} bytes at {} from blocks {}..={}",
            node_id,
            content.len(),
            offset,
            first,
            last
        );
        Ok(content)
    }

    pub fn block_count(&self, node_id: NodeId) -> RelFsResult<u64> {
        self.block_count_in(self.store.executor(), node_id)
    }

    fn block_count_in(&self, exec: &dyn StoreExecutor, node_id: NodeId) -> RelFsResult<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE inode = ?1",
            self.tables.data_blocks
        );
        match exec.query_one(&sql, &[SqlValue::try_from(node_id)?])? {
            Some(row) => row.get_u64(0),
            None => Ok(0),
        }
    }

    pub fn block_length(&self, node_id: NodeId, seq: u64) -> RelFsResult<u64> {
        let sql = format!(
            "SELECT datalength FROM {} WHERE inode = ?1 AND seq = ?2",
            self.tables.data_blocks
        );
        let row = self
            .store
            .query_one(&sql, &[SqlValue::try_from(node_id)?, SqlValue::try_from(seq)?])?
            .ok_or_else(|| RelFsError::NotFound(format!("block {} of node {}", seq, node_id)))?;
        row.get_u64(0)
    }

    /// Sum of block lengths, independent of the size attribute.
    pub fn stored_size(&self, node_id: NodeId) -> RelFsResult<u64> {
        self.stored_size_in(self.store.executor(), node_id)
    }

    fn stored_size_in(&self, exec: &dyn StoreExecutor, node_id: NodeId) -> RelFsResult<u64> {
        let sql = format!(
            "SELECT SUM(datalength) FROM {} WHERE inode = ?1",
            self.tables.data_blocks
        );
        match exec.query_one(&sql, &[SqlValue::try_from(node_id)?])? {
            Some(row) => row.get_u64(0),
            None => Ok(0),
        }
    }

    pub(crate) fn count_blocks(&self) -> RelFsResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.tables.data_blocks);
        match self.store.query_one(&sql, &[])? {
            Some(row) => row.get_u64(0),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::create_schema;
    use crate::types::{S_IFDIR, S_IFREG};
    use crate::SqliteBackingStore;
    use std::thread;
    use tempfile::TempDir;

    fn create_test_blocks(max_chunk_size: usize) -> BlockStore {
        let store: Arc<dyn BackingStore> = Arc::new(SqliteBackingStore::open_in_memory().unwrap());
        create_blocks_on(store, max_chunk_size)
    }

    fn create_blocks_on(store: Arc<dyn BackingStore>, max_chunk_size: usize) -> BlockStore {
        let tables = Arc::new(TableNames::default());
        create_schema(store.executor(), &tables).unwrap();
        let metadata = MetadataStore::new(store.clone(), tables.clone());
        BlockStore::new(store, tables, metadata, max_chunk_size)
    }

    fn add_node(blocks: &BlockStore, node_id: NodeId, mode: u32) {
        blocks
            .metadata
            .insert_in(blocks.store.executor(), node_id, mode, 0, 0)
            .unwrap();
    }

    #[test]
    fn test_append_sequence_and_size() {
        let blocks = create_test_blocks(4);
        add_node(&blocks, 1, S_IFREG | 0o644);

        assert_eq!(blocks.append_block(1, b"AAAA").unwrap(), 0);
        assert_eq!(blocks.append_block(1, b"BBBB").unwrap(), 1);
        assert_eq!(blocks.append_block(1, b"CC").unwrap(), 2);

        assert_eq!(blocks.read_all(1).unwrap(), b"AAAABBBBCC".to_vec());
        assert_eq!(blocks.read_block(1, 2).unwrap(), b"CC".to_vec());
        assert!(blocks.read_block(1, 3).unwrap_err().is_not_found());
        assert_eq!(blocks.block_count(1).unwrap(), 3);
        assert_eq!(blocks.block_length(1, 1).unwrap(), 4);
        assert_eq!(blocks.stored_size(1).unwrap(), 10);
        assert_eq!(blocks.metadata.get(1).unwrap().size, 10);
    }

    #[test]
    fn test_payload_too_large() {
        let blocks = create_test_blocks(4);
        add_node(&blocks, 1, S_IFREG | 0o644);
        let err = blocks.append_block(1, b"12345").unwrap_err();
        assert!(matches!(err, RelFsError::PayloadTooLarge(_)));
        assert_eq!(blocks.block_count(1).unwrap(), 0);
        assert_eq!(blocks.metadata.get(1).unwrap().size, 0);

        // exactly the limit is fine
        assert_eq!(blocks.append_block(1, b"1234").unwrap(), 0);
    }

    #[test]
    fn test_empty_payload_is_a_block() {
        let blocks = create_test_blocks(4);
        add_node(&blocks, 1, S_IFREG | 0o644);
        assert_eq!(blocks.append_block(1, b"").unwrap(), 0);
        assert_eq!(blocks.block_count(1).unwrap(), 1);
        assert_eq!(blocks.read_all(1).unwrap(), Vec::<u8>::new());
        assert_eq!(blocks.metadata.get(1).unwrap().size, 0);
    }

    #[test]
    fn test_append_rejects_dir_and_missing() {
        let blocks = create_test_blocks(4);
        add_node(&blocks, 1, S_IFDIR | 0o755);
        assert!(matches!(
            blocks.append_block(1, b"x"),
            Err(RelFsError::IsADirectory(_))
        ));
        assert!(blocks.append_block(99, b"x").unwrap_err().is_not_found());
        assert_eq!(blocks.count_blocks().unwrap(), 0);
    }

    #[test]
    fn test_read_all_of_empty_node() {
        let blocks = create_test_blocks(4);
        add_node(&blocks, 1, S_IFREG | 0o644);
        assert!(blocks.read_all(1).unwrap().is_empty());
        assert_eq!(blocks.stored_size(1).unwrap(), 0);
    }

    fn insert_raw_block(blocks: &BlockStore, node_id: NodeId, seq: i64, data: &[u8]) {
        blocks
            .store
            .execute(
                "INSERT INTO data_blocks (inode, seq, data, datalength) VALUES (?1, ?2, ?3, ?4)",
                &[
                    SqlValue::Integer(node_id as i64),
                    SqlValue::Integer(seq),
                    data.into(),
                    SqlValue::Integer(data.len() as i64),
                ],
            )
            .unwrap();
    }

    #[test]
    fn test_read_all_stops_at_gap() {
        let blocks = create_test_blocks(4);
        add_node(&blocks, 1, S_IFREG | 0o644);
        insert_raw_block(&blocks, 1, 0, b"head");
        insert_raw_block(&blocks, 1, 2, b"tail");

        assert_eq!(blocks.read_all(1).unwrap(), b"head".to_vec());
        assert!(blocks.read_block(1, 1).unwrap_err().is_not_found());
        // no zero fill for the hole either
        assert_eq!(blocks.read_range(1, 2, 10).unwrap(), b"ad".to_vec());
        assert!(blocks.read_range(1, 4, 4).unwrap().is_empty());
    }

    #[test]
    fn test_read_range() {
        let blocks = create_test_blocks(4);
        add_node(&blocks, 1, S_IFREG | 0o644);
        for chunk in [&b"AAAA"[..], b"BBBB", b"CC"] {
            blocks.append_block(1, chunk).unwrap();
        }

        // inside one block
        assert_eq!(blocks.read_range(1, 1, 2).unwrap(), b"AA".to_vec());
        assert_eq!(blocks.read_range(1, 4, 4).unwrap(), b"BBBB".to_vec());
        // across block boundaries
        assert_eq!(blocks.read_range(1, 3, 2).unwrap(), b"AB".to_vec());
        assert_eq!(blocks.read_range(1, 2, 7).unwrap(), b"AABBBBC".to_vec());
        // past the end
        assert_eq!(blocks.read_range(1, 7, 100).unwrap(), b"BCC".to_vec());
        assert!(blocks.read_range(1, 10, 4).unwrap().is_empty());
        assert!(blocks.read_range(1, u64::MAX, 4).unwrap().is_empty());
        assert!(blocks.read_range(1, 0, 0).unwrap().is_empty());
        assert_eq!(blocks.read_range(1, 0, 100).unwrap(), b"AAAABBBBCC".to_vec());
    }

    #[test]
    fn test_read_range_uneven_blocks() {
        let blocks = create_test_blocks(4);
        add_node(&blocks, 1, S_IFREG | 0o644);
        for chunk in [&b"ab"[..], b"", b"cdef", b"g"] {
            blocks.append_block(1, chunk).unwrap();
        }
        assert_eq!(blocks.read_range(1, 1, 3).unwrap(), b"bcd".to_vec());
        assert_eq!(blocks.read_range(1, 5, 2).unwrap(), b"fg".to_vec());
    }

    #[test]
    fn test_concurrent_appends_have_unique_sequence() {
        let blocks = create_test_blocks(8);
        add_node(&blocks, 1, S_IFREG | 0o644);

        let mut handles = vec![];
        for i in 0..4u8 {
            let blocks = blocks.clone();
            handles.push(thread::spawn(move || {
                let mut seqs = vec![];
                for _ in 0..10 {
                    seqs.push(blocks.append_block(1, &[b'a' + i; 2]).unwrap());
                }
                seqs
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        assert_eq!(all, (0..40).collect::<Vec<u64>>());
        assert_eq!(blocks.metadata.get(1).unwrap().size, 80);
    }

    #[test]
    fn test_appends_from_two_connections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blocks.db");
        let path = path.to_str().unwrap().to_string();

        let first = create_blocks_on(Arc::new(SqliteBackingStore::open_path(&path).unwrap()), 8);
        add_node(&first, 1, S_IFREG | 0o644);

        let mut handles = vec![];
        for _ in 0..2 {
            let path = path.clone();
            handles.push(thread::spawn(move || {
                let store: Arc<dyn BackingStore> =
                    Arc::new(SqliteBackingStore::open_path(&path).unwrap());
                let blocks = create_blocks_on(store, 8);
                for _ in 0..10 {
                    blocks.append_block(1, b"xyz").unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(first.block_count(1).unwrap(), 20);
        for seq in 0..20 {
            assert_eq!(first.block_length(1, seq).unwrap(), 3);
        }
        assert_eq!(first.metadata.get(1).unwrap().size, 60);
    }
}
