//! Storage engine - collection registry and per-collection stores

mod collection;
mod engine;

pub use collection::{
    ClientInfo, CollectionStore, CreatePageviewInput, CreateSessionInput, ShardInfo,
};
pub use engine::{EngineStats, StorageEngine};

pub(crate) use collection::split_path;

use std::path::PathBuf;

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory
    pub data_dir: PathBuf,
    /// Permission bits for new shard files
    pub file_mode: u32,
    /// Maximum entries per background write transaction
    pub batch_size: usize,
    /// Lifetime of issued auth tokens, seconds
    pub auth_token_ttl: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            file_mode: crate::config::DEFAULT_FILE_MODE,
            batch_size: crate::config::MAX_BATCH_SIZE,
            auth_token_ttl: crate::config::AUTH_TOKEN_TTL,
        }
    }
}
