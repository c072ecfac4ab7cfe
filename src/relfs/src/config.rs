use crate::types::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, PERMISSION_MASK};
use crate::{RelFsError, RelFsResult};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Largest payload a single data block may carry.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 131072;
pub const MEMORY_DATABASE: &str = ":memory:";

/// Connection parameters of the backing store.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: Option<String>,
    #[serde(alias = "db_path", alias = "dbname")]
    pub database: String,
    #[serde(alias = "username")]
    pub user: Option<String>,
    pub password: Option<String>,
    /// Prepended to every table name (`fs_` -> `fs_tree`).
    pub table_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: None,
            database: MEMORY_DATABASE.to_string(),
            user: None,
            password: None,
            table_prefix: String::new(),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("table_prefix", &self.table_prefix)
            .finish()
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_database(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn is_memory(&self) -> bool {
        self.database == MEMORY_DATABASE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelFsConfig {
    pub store: StoreConfig,
    #[serde(alias = "block_size", alias = "data_block_size")]
    pub max_chunk_size: usize,
    #[serde(alias = "uid")]
    pub owner_uid: u32,
    #[serde(alias = "gid")]
    pub owner_gid: u32,
    pub dir_mode: u32,
    pub file_mode: u32,
}

impl Default for RelFsConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            owner_uid: 0,
            owner_gid: 0,
            dir_mode: DEFAULT_DIR_MODE,
            file_mode: DEFAULT_FILE_MODE,
        }
    }
}

impl RelFsConfig {
    pub fn new(store: StoreConfig) -> Self {
        Self {
            store,
            ..Self::default()
        }
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn from_json_str(content: &str) -> RelFsResult<Self> {
        let config: RelFsConfig = serde_json::from_str(content)
            .map_err(|e| RelFsError::InvalidConfig(format!("parse config failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> RelFsResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            warn!("RelFsConfig: read {} failed! {}", path.display(), e);
            RelFsError::InvalidConfig(format!("read config {} failed: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> RelFsResult<()> {
        if self.max_chunk_size == 0 {
            return Err(RelFsError::InvalidConfig(
                "max_chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.store.database.is_empty() {
            return Err(RelFsError::InvalidConfig(
                "store.database must not be empty".to_string(),
            ));
        }
        // table names are the only identifiers spliced into statements
        if !self
            .store
            .table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(RelFsError::InvalidConfig(format!(
                "table_prefix {:?} may only contain [A-Za-z0-9_]",
                self.store.table_prefix
            )));
        }
        if self.dir_mode & !PERMISSION_MASK != 0 || self.file_mode & !PERMISSION_MASK != 0 {
            return Err(RelFsError::InvalidConfig(
                "dir_mode/file_mode must only carry permission bits".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = RelFsConfig::default();
        assert_eq!(config.max_chunk_size, 131072);
        assert!(config.store.is_memory());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_with_aliases() {
        let config = RelFsConfig::from_json_str(
            r#"{
                "store": { "host": "db.local", "dbname": "fs", "username": "fs", "table_prefix": "fs_" },
                "block_size": 4096,
                "uid": 1000
            }"#,
        )
        .unwrap();
        assert_eq!(config.store.host.as_deref(), Some("db.local"));
        assert_eq!(config.store.database, "fs");
        assert_eq!(config.store.user.as_deref(), Some("fs"));
        assert_eq!(config.store.table_prefix, "fs_");
        assert_eq!(config.max_chunk_size, 4096);
        assert_eq!(config.owner_uid, 1000);
        assert_eq!(config.file_mode, DEFAULT_FILE_MODE);
    }

    #[test]
    fn test_debug_hides_password() {
        let mut config = RelFsConfig::new(StoreConfig::with_database("/tmp/relfs.db"));
        config.store.user = Some("fs".to_string());
        config.store.password = Some("s3cret".to_string());
        let out = format!("{:?}", config);
        assert!(!out.contains("s3cret"));
        assert!(out.contains("***"));
        assert!(out.contains("/tmp/relfs.db"));

        config.store.password = None;
        assert!(!format!("{:?}", config.store).contains("***"));
    }

    #[test]
    fn test_reject_unsafe_prefix() {
        let err = RelFsConfig::from_json_str(r#"{ "store": { "table_prefix": "x; DROP" } }"#)
            .unwrap_err();
        assert!(matches!(err, RelFsError::InvalidConfig(_)));
    }

    #[test]
    fn test_reject_zero_chunk_size() {
        let config = RelFsConfig::default().with_max_chunk_size(0);
        assert!(matches!(
            config.validate(),
            Err(RelFsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "store": {{ "db_path": "/tmp/relfs.db" }}, "max_chunk_size": 10 }}"#)
            .unwrap();
        let config = RelFsConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.store.database, "/tmp/relfs.db");
        assert_eq!(config.max_chunk_size, 10);
    }
}
