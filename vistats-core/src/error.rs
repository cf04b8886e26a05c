//! Error types for vistats

use thiserror::Error;

/// Result type alias for vistats operations
pub type Result<T> = std::result::Result<T, VistatsError>;

/// vistats error types
#[derive(Error, Debug)]
pub enum VistatsError {
    /// No entry exists for the key
    #[error("key not exists")]
    KeyNotExists,

    /// An entry already exists for the key
    #[error("key exists")]
    KeyExists,

    /// No shard covers the key, or the shard id is unknown
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    /// A stored key or value could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// A composite key is too short or otherwise malformed
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Caller supplied an unusable value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Write attempted through a read-only multi-shard transaction
    #[error("transaction is read-only")]
    ReadOnlyTransaction,

    /// The shard store was closed
    #[error("store is closed")]
    StoreClosed,

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Embedded engine failure
    #[error("Storage error: {0}")]
    Storage(#[from] redb::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VistatsError {
    /// Check if the error means the addressed entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            VistatsError::KeyNotExists | VistatsError::ShardNotFound(_)
        )
    }

    /// Check if the error is an existence conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, VistatsError::KeyExists)
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, VistatsError::Decode(_) | VistatsError::InvalidKey(_))
    }
}

macro_rules! impl_from_redb {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for VistatsError {
                fn from(e: $err) -> Self {
                    VistatsError::Storage(e.into())
                }
            }
        )*
    };
}

impl_from_redb!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

impl From<bincode::Error> for VistatsError {
    fn from(e: bincode::Error) -> Self {
        VistatsError::Decode(e.to_string())
    }
}
