// relfs keeps a filesystem namespace (tree edges, inode attributes and data
// blocks) inside relational tables. A filesystem driver resolves paths and
// streams file content through NamespaceService.

mod backing_store;
mod block_store;
mod config;
mod metadata_store;
mod namespace_service;
mod namespace_store;
mod node_lock;
mod path;
mod schema;
mod sqlite_store;
mod types;


pub use backing_store::{in_transaction, BackingStore, SqlRow, SqlValue, StoreExecutor};
pub use block_store::BlockStore;
pub use config::{RelFsConfig, StoreConfig, DEFAULT_MAX_CHUNK_SIZE};
pub use metadata_store::MetadataStore;
pub use namespace_service::{FsStats, FsckReport, NamespaceService};
pub use namespace_store::{EdgeCreation, NamespaceStore};
pub use node_lock::NodeLockManager;
pub use path::{resolve, PathResolver, PathSegments, Resolution};
pub use schema::TableNames;
pub use sqlite_store::SqliteBackingStore;
pub use types::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelFsError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("conflict on create: {0}")]
    ConflictOnCreate(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("store error: {0}")]
    StoreError(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelFsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RelFsError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RelFsError::ConflictOnCreate(_))
    }
}

pub type RelFsResult<T> = std::result::Result<T, RelFsError>;
