use crate::{RelFsError, RelFsResult};

/// A value bound to a statement parameter or read back from a column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

/// SQLite integers are signed; values above `i64::MAX` are refused rather
/// than stored wrapped.
impl TryFrom<u64> for SqlValue {
    type Error = RelFsError;

    fn try_from(v: u64) -> RelFsResult<Self> {
        i64::try_from(v)
            .map(SqlValue::Integer)
            .map_err(|_| RelFsError::InvalidArgument(format!("{} exceeds the storable range", v)))
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&[u8]> for SqlValue {
    fn from(v: &[u8]) -> Self {
        SqlValue::Blob(v.to_vec())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => SqlValue::Null,
        }
    }
}

impl SqlValue {
    pub fn from_opt_u64(v: Option<u64>) -> RelFsResult<Self> {
        match v {
            Some(v) => SqlValue::try_from(v),
            None => Ok(SqlValue::Null),
        }
    }
}

/// One result row, columns in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow(pub Vec<SqlValue>);

impl SqlRow {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn column(&self, idx: usize) -> RelFsResult<&SqlValue> {
        self.0
            .get(idx)
            .ok_or_else(|| RelFsError::StoreError(format!("column {} out of range", idx)))
    }

    pub fn get_opt_i64(&self, idx: usize) -> RelFsResult<Option<i64>> {
        match self.column(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(v) => Ok(Some(*v)),
            other => Err(RelFsError::StoreError(format!(
                "column {} is not an integer: {:?}",
                idx, other
            ))),
        }
    }

    pub fn get_i64(&self, idx: usize) -> RelFsResult<i64> {
        self.get_opt_i64(idx)?
            .ok_or_else(|| RelFsError::StoreError(format!("column {} is NULL", idx)))
    }

    /// Non-negative integer column; NULL reads as zero (aggregates over no rows).
    pub fn get_u64(&self, idx: usize) -> RelFsResult<u64> {
        let v = self.get_opt_i64(idx)?.unwrap_or(0);
        u64::try_from(v)
            .map_err(|_| RelFsError::StoreError(format!("column {} is negative: {}", idx, v)))
    }

    pub fn get_text(&self, idx: usize) -> RelFsResult<String> {
        match self.column(idx)? {
            SqlValue::Text(v) => Ok(v.clone()),
            other => Err(RelFsError::StoreError(format!(
                "column {} is not text: {:?}",
                idx, other
            ))),
        }
    }

    pub fn get_blob(&self, idx: usize) -> RelFsResult<Vec<u8>> {
        match self.column(idx)? {
            SqlValue::Blob(v) => Ok(v.clone()),
            SqlValue::Text(v) => Ok(v.as_bytes().to_vec()),
            SqlValue::Null => Ok(Vec::new()),
            other => Err(RelFsError::StoreError(format!(
                "column {} is not a blob: {:?}",
                idx, other
            ))),
        }
    }
}

/// Statement execution against the backing store. Every value is passed as a
/// bound parameter, statement text only ever carries validated table names.
pub trait StoreExecutor {
    /// Point query returning zero or one row.
    fn query_one(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<Option<SqlRow>>;

    /// All matching rows, in the order the statement specifies.
    fn query_all(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<Vec<SqlRow>>;

    /// Returns the affected-row count.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<usize>;

    /// Runs an insert and returns the new row id, or None if the statement
    /// inserted nothing (an `INSERT OR IGNORE` that hit a unique constraint).
    fn insert(&self, sql: &str, params: &[SqlValue]) -> RelFsResult<Option<i64>>;

    /// Several statements without parameters, used for DDL.
    fn execute_batch(&self, sql: &str) -> RelFsResult<()>;
}

pub trait BackingStore: StoreExecutor + Send + Sync {
    fn executor(&self) -> &dyn StoreExecutor;

    /// Run `work` in a transaction that is committed when it returns Ok and
    /// rolled back otherwise. Writers must be serialized against each other
    /// for the duration of the transaction.
    fn transaction(
        &self,
        work: &mut dyn FnMut(&dyn StoreExecutor) -> RelFsResult<()>,
    ) -> RelFsResult<()>;
}

/// Typed wrapper around `BackingStore::transaction`.
pub fn in_transaction<T, F>(store: &dyn BackingStore, f: F) -> RelFsResult<T>
where
    F: FnOnce(&dyn StoreExecutor) -> RelFsResult<T>,
{
    let mut f = Some(f);
    let mut out = None;
    store.transaction(&mut |tx: &dyn StoreExecutor| {
        let f = f
            .take()
            .ok_or_else(|| RelFsError::Internal("transaction body ran twice".to_string()))?;
        out = Some(f(tx)?);
        Ok(())
    })?;
    out.ok_or_else(|| RelFsError::Internal("transaction produced no result".to_string()))
}
