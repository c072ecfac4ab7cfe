use crate::backing_store::{BackingStore, SqlRow, SqlValue, StoreExecutor};
use crate::config::{StoreConfig, MEMORY_DATABASE};
use crate::{RelFsError, RelFsResult};
use log::{debug, warn};
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let out = match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v.as_slice())),
        };
        Ok(out)
    }
}

/// SQLite implementation of the backing store: one connection shared behind a
/// mutex, transactions hold the mutex from BEGIN to COMMIT.
pub struct SqliteBackingStore {
    db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteBackingStore {
    pub fn open(config: &StoreConfig) -> RelFsResult<Self> {
        if config.host.is_some() || config.user.is_some() {
            debug!(
                "SqliteBackingStore: host/credentials are ignored for sqlite database {}",
                config.database
            );
        }
        if config.is_memory() {
            return Self::open_in_memory();
        }
        Self::open_path(&config.database)
    }

    pub fn open_path(db_path: &str) -> RelFsResult<Self> {
        debug!("SqliteBackingStore: open db path: {}", db_path);
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| {
            warn!("SqliteBackingStore: open db failed! {}", e);
            RelFsError::StoreError(format!("open db {} failed: {}", db_path, e))
        })?;
        Self::init_connection(&conn, true)?;
        Ok(Self {
            db_path: db_path.to_string(),
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> RelFsResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RelFsError::StoreError(format!("open memory db failed: {}", e)))?;
        Self::init_connection(&conn, false)?;
        Ok(Self {
            db_path: MEMORY_DATABASE.to_string(),
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn init_connection(conn: &Connection, file_backed: bool) -> RelFsResult<()> {
        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .map_err(|e| RelFsError::StoreError(format!("pragma failed: {}", e)))?;
        if file_backed {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;",
            )
            .map_err(|e| RelFsError::StoreError(format!("pragma failed: {}", e)))?;
        }
        Ok(())
    }

    fn lock_conn(&self) -> RelFsResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RelFsError::StoreError(format!("conn lock poisoned: {}", e)))
    }
}

impl StoreExecutor for SqliteBackingStore {
    fn query_one(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<Option<SqlRow>> {
        let conn = self.lock_conn()?;
        ConnExecutor { conn: &conn }.query_one(sql, params)
    }

    fn query_all(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<Vec<SqlRow>> {
        let conn = self.lock_conn()?;
        ConnExecutor { conn: &conn }.query_all(sql, params)
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<usize> {
        let conn = self.lock_conn()?;
        ConnExecutor { conn: &conn }.execute(sql, params)
    }

    fn insert(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<Option<i64>> {
        let conn = self.lock_conn()?;
        ConnExecutor { conn: &conn }.insert(sql, params)
    }

    fn execute_batch(&self, sql: &str) -> RelFsResult<()> {
        let conn = self.lock_conn()?;
        ConnExecutor { conn: &conn }.execute_batch(sql)
    }
}

impl BackingStore for SqliteBackingStore {
    fn executor(&self) -> &dyn StoreExecutor {
        self
    }

    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn StoreExecutor) -> RelFsResult<()>,
    ) -> RelFsResult<()> {
        let conn = self.lock_conn()?;
        // IMMEDIATE takes the write lock up front so concurrent writers queue
        // on busy_timeout instead of failing mid transaction
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| RelFsError::StoreError(format!("begin txn failed: {}", e)))?;

        let result = work(&ConnExecutor { conn: &conn });
        match result {
            Ok(()) => {
                if let Err(e) = conn.execute_batch("COMMIT") {
                    warn!("SqliteBackingStore: commit failed, rolling back: {}", e);
                    if let Err(e) = conn.execute_batch("ROLLBACK") {
                        warn!("SqliteBackingStore: rollback after failed commit failed: {}", e);
                    }
                    return Err(RelFsError::StoreError(format!("commit failed: {}", e)));
                }
                Ok(())
            }
            Err(err) => {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    warn!("SqliteBackingStore: rollback failed: {}", e);
                }
                Err(err)
            }
        }
    }
}

/// Statement execution on an already locked connection.
struct ConnExecutor<'a> {
    conn: &'a Connection,
}

impl StoreExecutor for ConnExecutor<'_> {
    fn query_one(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<Option<SqlRow>> {
        debug!("sql={}", sql);
        let mut stmt = self.conn.prepare_cached(sql).map_err(map_db_err)?;
        let columns = stmt.column_count();
        stmt.query_row(params_from_iter(params.iter()), |row| {
            read_row(row, columns)
        })
        .optional()
        .map_err(map_db_err)
    }

    fn query_all(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<Vec<SqlRow>> {
        debug!("sql={}", sql);
        let mut stmt = self.conn.prepare_cached(sql).map_err(map_db_err)?;
        let columns = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| read_row(row, columns))
            .map_err(map_db_err)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(map_db_err)?);
        }
        Ok(out)
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<usize> {
        debug!("sql={}", sql);
        let mut stmt = self.conn.prepare_cached(sql).map_err(map_db_err)?;
        stmt.execute(params_from_iter(params.iter()))
            .map_err(map_db_err)
    }

    fn insert(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<Option<i64>> {
        let changed = self.execute(sql, params)?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    fn execute_batch(&self, sql: &str) -> RelFsResult<()> {
        debug!("sql={}", sql);
        self.conn.execute_batch(sql).map_err(map_db_err)
    }
}

fn read_row(row: &rusqlite::Row<'_>, columns: usize) -> rusqlite::Result<SqlRow> {
    let mut values = Vec::with_capacity(columns);
    for idx in 0..columns {
        let value = match row.get_ref(idx)? {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(v) => SqlValue::Integer(v),
            ValueRef::Real(v) => SqlValue::Real(v),
            ValueRef::Text(v) => SqlValue::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => SqlValue::Blob(v.to_vec()),
        };
        values.push(value);
    }
    Ok(SqlRow(values))
}

fn map_db_err(err: rusqlite::Error) -> RelFsError {
    RelFsError::StoreError(format!("db error: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing_store::in_transaction;
    use tempfile::TempDir;

    fn create_kv(store: &SqliteBackingStore) {
        store
            .execute_batch("CREATE TABLE kv (k TEXT PRIMARY KEY, v BLOB, n INTEGER)")
            .unwrap();
    }

    #[test]
    fn test_bound_params_roundtrip() {
        let store = SqliteBackingStore::open_in_memory().unwrap();
        create_kv(&store);

        // quotes in values must not break the statement
        let key = "it's a 'key'";
        let id = store
            .insert(
                "INSERT INTO kv (k, v, n) VALUES (?1, ?2, ?3)",
                &[key.into(), SqlValue::Blob(vec![0, 1, 2]), SqlValue::Null],
            )
            .unwrap();
        assert_eq!(id, Some(1));

        let row = store
            .query_one("SELECT k, v, n FROM kv WHERE k = ?1", &[key.into()])
            .unwrap()
            .unwrap();
        assert_eq!(row.get_text(0).unwrap(), key);
        assert_eq!(row.get_blob(1).unwrap(), vec![0, 1, 2]);
        assert_eq!(row.get_opt_i64(2).unwrap(), None);

        let missing = store
            .query_one("SELECT k FROM kv WHERE k = ?1", &["nope".into()])
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_insert_or_ignore_reports_none() {
        let store = SqliteBackingStore::open_in_memory().unwrap();
        create_kv(&store);
        let sql = "INSERT OR IGNORE INTO kv (k, n) VALUES (?1, ?2)";
        assert!(store.insert(sql, &["a".into(), 1i64.into()]).unwrap().is_some());
        assert!(store.insert(sql, &["a".into(), 2i64.into()]).unwrap().is_none());
    }

    #[test]
    fn test_query_all_keeps_order() {
        let store = SqliteBackingStore::open_in_memory().unwrap();
        create_kv(&store);
        for k in ["c", "a", "b"] {
            store
                .execute("INSERT INTO kv (k) VALUES (?1)", &[k.into()])
                .unwrap();
        }
        let rows = store
            .query_all("SELECT k FROM kv ORDER BY k DESC", &[])
            .unwrap();
        let keys: Vec<String> = rows.iter().map(|r| r.get_text(0).unwrap()).collect();
        assert_eq!(keys, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_transaction_rollback_on_error() {
        let store = SqliteBackingStore::open_in_memory().unwrap();
        create_kv(&store);

        let result: RelFsResult<()> = in_transaction(&store, |tx| {
            tx.execute("INSERT INTO kv (k) VALUES (?1)", &["x".into()])?;
            Err(RelFsError::Internal("abort".to_string()))
        });
        assert!(result.is_err());

        let count = store
            .query_one("SELECT COUNT(*) FROM kv", &[])
            .unwrap()
            .unwrap()
            .get_i64(0)
            .unwrap();
        assert_eq!(count, 0);

        let n = in_transaction(&store, |tx| {
            tx.execute("INSERT INTO kv (k) VALUES (?1)", &["y".into()])
        })
        .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_open_file_backed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.db");
        let config = StoreConfig::with_database(path.to_str().unwrap());
        {
            let store = SqliteBackingStore::open(&config).unwrap();
            create_kv(&store);
            store
                .execute("INSERT INTO kv (k) VALUES (?1)", &["persisted".into()])
                .unwrap();
        }
        let store = SqliteBackingStore::open(&config).unwrap();
        let row = store
            .query_one("SELECT k FROM kv", &[])
            .unwrap()
            .unwrap();
        assert_eq!(row.get_text(0).unwrap(), "persisted");
    }
}
