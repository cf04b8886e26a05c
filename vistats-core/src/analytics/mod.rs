//! Analytics queries over sharded session data

mod bucket;
mod filter;
mod join;
mod stats;

pub use bucket::{resolve_timezone, BucketGen, BucketSum, BucketType};
pub use filter::{Filter, PageviewField, SessionField};
pub use join::{JoinedSession, SessionJoin};
pub use stats::{
    get_bucket_sums, get_pageviews, get_session, get_sessions, get_statistics, growth,
    BucketSums, PageviewData, QueryInput, Ratio, SessionData, Statistics, Sum, Total,
};
