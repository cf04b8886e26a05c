//! vistats Core - Time-Sharded Analytics Storage Engine
//!
//! Stores web-analytics sessions and pageviews in embedded B-tree files
//! split by calendar month, and answers windowed statistics queries over them.
//!
//! # Architecture
//!
//! - **Record store**: typed key/value buckets in one file (users, collections, tokens)
//! - **Sharded store**: one file per month, created lazily, scanned in key order
//! - **Multi-shard transactions**: writes spanning month boundaries
//! - **Key codec**: time-prefixed composite keys whose byte order is time order
//! - **Analytics**: bucket grids, filters and aggregate statistics
//! - **Storage engine**: collection registry and per-collection ingestion

pub mod analytics;
pub mod keys;
pub mod seed;
pub mod shard;
pub mod storage;
pub mod store;

mod error;
mod types;

pub use error::{Result, VistatsError};
pub use types::*;

/// vistats version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Extension of shard files
    pub const SHARD_FILE_SUFFIX: &str = ".redb";

    /// Record store file under the data directory
    pub const ROOT_FILE: &str = "vistats.redb";

    /// Permission bits for newly created shard files
    pub const DEFAULT_FILE_MODE: u32 = 0o600;

    /// How far before a query window sessions are scanned, so that
    /// pageviews of sessions begun earlier are still counted (1 day)
    pub const SESSION_LOOKBACK: i64 = 24 * 60 * 60 * 1_000_000_000;

    /// Auth token lifetime in seconds (14 days)
    pub const AUTH_TOKEN_TTL: i32 = 14 * 24 * 60 * 60;

    /// Upper bound of entries written per batch transaction
    pub const MAX_BATCH_SIZE: usize = 1000;
}
