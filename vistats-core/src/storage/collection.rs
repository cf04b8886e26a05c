//! Per-collection sharded store with ingestion and queries

use crate::analytics::{
    self, BucketSums, PageviewData, QueryInput, SessionData, Statistics,
};
use crate::keys::{
    decode_session_key, decode_time, encode_session_key, month_shard_id, pageview_key,
    session_key, to_nanos,
};
use crate::shard::{BatchWriter, ShardOptions, ShardedStore};
use crate::store::Record;
use crate::{Pageview, Result, Session, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const NANOS_PER_DAY: i64 = 86_400_000_000_000;

/// Client attributes resolved by the ingestion front end
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientInfo {
    pub user_agent: String,
    pub user_ip: String,
    pub user_hostname: String,
    pub browser_name: String,
    pub browser_version: String,
    pub device_os: String,
    pub country_code: String,
    pub city: String,
    pub as_number: i32,
    pub as_name: String,
}

/// Attributes reported by the tracking script when a visit starts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateSessionInput {
    pub collection_id: String,
    pub hostname: String,
    pub browser_language: String,
    pub screen_resolution: String,
    pub window_resolution: String,
    pub device_type: String,
    pub referrer: String,
}

/// A page load within a session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreatePageviewInput {
    pub collection_id: String,
    /// Text form of the session key
    pub session_key: String,
    /// Path with optional `?query` or `;params`
    pub path: String,
}

/// Size of one shard file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: String,
    pub size: u64,
}

/// Split `path?query` or `path;params` at the first separator
pub(crate) fn split_path(url: &str) -> (&str, &str) {
    match url.find(|c: char| c == '?' || c == ';') {
        Some(idx) => (&url[..idx], &url[idx + 1..]),
        None => (url, ""),
    }
}

/// The sharded store of one collection
pub struct CollectionStore {
    id: String,
    shards: Arc<ShardedStore>,
    writer: BatchWriter,
}

impl std::fmt::Debug for CollectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionStore")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl CollectionStore {
    pub(crate) fn open(id: &str, dir: &Path, file_mode: u32, batch_size: usize) -> Result<Self> {
        let shards = Arc::new(ShardedStore::open(
            dir,
            Arc::new(month_shard_id),
            ShardOptions { file_mode },
        )?);
        let writer = BatchWriter::spawn(shards.clone(), batch_size)?;
        info!("Opened collection store: {}", id);
        Ok(Self {
            id: id.to_string(),
            shards,
            writer,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Underlying sharded store
    pub fn shards(&self) -> &ShardedStore {
        &self.shards
    }

    /// Record a new session; returns the text form of its key
    pub fn create_session(&self, client: &ClientInfo, input: &CreateSessionInput) -> Result<String> {
        self.create_session_at(client, input, to_nanos(Utc::now()))
    }

    pub fn create_session_at(
        &self,
        client: &ClientInfo,
        input: &CreateSessionInput,
        now: Timestamp,
    ) -> Result<String> {
        let session = Session {
            duration: 0,
            hostname: input.hostname.clone(),
            device_os: client.device_os.clone(),
            browser_name: client.browser_name.clone(),
            browser_version: client.browser_version.clone(),
            browser_language: input.browser_language.clone(),
            screen_resolution: input.screen_resolution.clone(),
            window_resolution: input.window_resolution.clone(),
            device_type: input.device_type.clone(),
            country_code: client.country_code.clone(),
            city: client.city.clone(),
            user_agent: client.user_agent.clone(),
            user_ip: client.user_ip.clone(),
            user_hostname: client.user_hostname.clone(),
            referrer: input.referrer.clone(),
            as_number: client.as_number,
            as_name: client.as_name.clone(),
        };
        let key = session_key(now, rand::random::<u32>());
        self.shards
            .batch_upsert(Session::BUCKET, &key, &session.encode()?)?;
        debug!("Created session in {}", self.id);
        Ok(encode_session_key(&key))
    }

    /// Set a session's duration to the time elapsed since it began
    ///
    /// The write is queued; call [`flush`](Self::flush) to wait for it.
    pub fn update_session(&self, session_key: &str) -> Result<()> {
        self.update_session_at(session_key, to_nanos(Utc::now()))
    }

    pub fn update_session_at(&self, session_key: &str, now: Timestamp) -> Result<()> {
        let key = decode_session_key(session_key)?;
        let mut session = analytics::get_session(&self.shards, &key)?;
        let begin = decode_time(&key)?;
        let seconds = (now - begin).max(0) / 1_000_000_000;
        session.duration = i32::try_from(seconds).unwrap_or(i32::MAX);
        self.writer.submit(Session::BUCKET, key, session.encode()?)
    }

    /// Record a pageview of an existing session
    pub fn create_pageview(&self, session_key: &str, path: &str) -> Result<()> {
        self.create_pageview_at(session_key, path, to_nanos(Utc::now()))
    }

    pub fn create_pageview_at(&self, session_key: &str, path: &str, now: Timestamp) -> Result<()> {
        let key = decode_session_key(session_key)?;
        analytics::get_session(&self.shards, &key)?;

        let (path, query_string) = split_path(path);
        let pageview = Pageview {
            path: path.to_string(),
            query_string: query_string.to_string(),
        };
        self.shards
            .batch_upsert(Pageview::BUCKET, &pageview_key(&key, now), &pageview.encode()?)
    }

    /// Wait for queued session updates
    pub fn flush(&self) -> Result<()> {
        self.writer.flush()
    }

    pub fn get_bucket_sums(&self, input: &QueryInput) -> Result<BucketSums> {
        analytics::get_bucket_sums(&self.shards, input)
    }

    pub fn get_statistics(&self, input: &QueryInput) -> Result<Statistics> {
        analytics::get_statistics(&self.shards, input)
    }

    pub fn get_sessions(&self, input: &QueryInput) -> Result<Vec<SessionData>> {
        analytics::get_sessions(&self.shards, input)
    }

    pub fn get_session(&self, session_key: &str) -> Result<Session> {
        analytics::get_session(&self.shards, &decode_session_key(session_key)?)
    }

    pub fn get_pageviews(&self, session_key: &str) -> Result<Vec<PageviewData>> {
        analytics::get_pageviews(&self.shards, &decode_session_key(session_key)?)
    }

    /// Pageviews of the last `days` days against the `days` before them
    pub fn pageview_growth(&self, days: i64, now: Timestamp) -> Result<f64> {
        let span = days.max(1) * NANOS_PER_DAY;
        let mid = now - span;
        let start = (mid - span).max(0);
        let mut previous = 0u64;
        let mut recent = 0u64;
        for entry in self
            .shards
            .scan(Pageview::BUCKET, &start.to_be_bytes(), &now.to_be_bytes())?
        {
            let (key, _) = entry?;
            match decode_time(&key) {
                Ok(t) if t < mid => previous += 1,
                Ok(_) => recent += 1,
                Err(_) => continue,
            }
        }
        Ok(if previous == 0 {
            0.0
        } else {
            recent as f64 / previous as f64 - 1.0
        })
    }

    /// Shard ids with file sizes
    pub fn shard_infos(&self) -> Result<Vec<ShardInfo>> {
        Ok(self
            .shards
            .sizes()?
            .into_iter()
            .map(|(id, size)| ShardInfo { id, size })
            .collect())
    }

    pub fn delete_shard(&self, shard_id: &str) -> Result<()> {
        self.shards.delete_shard(shard_id)
    }

    pub(crate) fn close(&self) {
        if let Err(e) = self.writer.flush() {
            debug!("Flush on close of {} failed: {}", self.id, e);
        }
        self.shards.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::from_nanos;
    use crate::VistatsError;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const SEC: i64 = 1_000_000_000;

    fn open(dir: &TempDir) -> CollectionStore {
        CollectionStore::open("c1", &dir.path().join("c1"), 0o600, 16).unwrap()
    }

    fn client() -> ClientInfo {
        ClientInfo {
            user_agent: "Mozilla/5.0".into(),
            user_ip: "95.85.1.2".into(),
            browser_name: "Firefox".into(),
            browser_version: "56.0".into(),
            device_os: "Linux".into(),
            country_code: "HU".into(),
            ..Default::default()
        }
    }

    fn session_input() -> CreateSessionInput {
        CreateSessionInput {
            collection_id: "c1".into(),
            hostname: "example.org".into(),
            device_type: "desktop".into(),
            referrer: "https://wikipedia.org".into(),
            ..Default::default()
        }
    }

    fn at(h: u32, m: u32) -> Timestamp {
        to_nanos(Utc.with_ymd_and_hms(2024, 4, 10, h, m, 0).unwrap())
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/dl"), ("/dl", ""));
        assert_eq!(split_path("ld?q=22222"), ("ld", "q=22222"));
        assert_eq!(split_path("ndl;matrixnotation=true"), ("ndl", "matrixnotation=true"));
        assert_eq!(split_path("a?b;c"), ("a", "b;c"));
    }

    #[test]
    fn test_session_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let key = store.create_session_at(&client(), &session_input(), at(10, 0)).unwrap();
        let session = store.get_session(&key).unwrap();
        assert_eq!(session.duration, 0);
        assert_eq!(session.hostname, "example.org");
        assert_eq!(session.browser_name, "Firefox");
        assert_eq!(store.shards().shard_ids(), vec!["2024-04"]);

        store.create_pageview_at(&key, "/docs?page=2", at(10, 1)).unwrap();
        store.create_pageview_at(&key, "/about", at(10, 3)).unwrap();
        store.update_session_at(&key, at(10, 5)).unwrap();
        store.flush().unwrap();

        assert_eq!(store.get_session(&key).unwrap().duration, 300);
        let pageviews = store.get_pageviews(&key).unwrap();
        assert_eq!(pageviews.len(), 2);
        assert_eq!(pageviews[0].path, "/docs");
        assert_eq!(pageviews[0].query_string, "page=2");
        assert_eq!(pageviews[0].time, at(10, 1));
        assert_eq!(from_nanos(pageviews[1].time), from_nanos(at(10, 3)));
    }

    #[test]
    fn test_pageview_requires_session() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let key = store.create_session_at(&client(), &session_input(), at(9, 0)).unwrap();

        let unknown = encode_session_key(&session_key(at(9, 0), 12345));
        let err = store.create_pageview_at(&unknown, "/", at(9, 1)).unwrap_err();
        assert!(err.is_not_found());

        let err = store.create_pageview_at("garbage", "/", at(9, 1)).unwrap_err();
        assert!(matches!(err, VistatsError::InvalidKey(_)));

        store.create_pageview_at(&key, "/", at(9, 1)).unwrap();
    }

    #[test]
    fn test_pageview_growth() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let now = at(12, 0);
        let day = 86_400 * SEC;

        let old = store.create_session_at(&client(), &session_input(), now - 10 * day).unwrap();
        store.create_pageview_at(&old, "/", now - 10 * day).unwrap();
        store.create_pageview_at(&old, "/a", now - 10 * day + SEC).unwrap();
        let recent = store.create_session_at(&client(), &session_input(), now - day).unwrap();
        for i in 0..3 {
            store.create_pageview_at(&recent, "/", now - day + i * SEC).unwrap();
        }

        assert_eq!(store.pageview_growth(7, now).unwrap(), 0.5);
        assert_eq!(store.pageview_growth(1, now - 20 * day).unwrap(), 0.0);
    }

    #[test]
    fn test_shard_infos_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        store.create_session_at(&client(), &session_input(), at(8, 0)).unwrap();

        let infos = store.shard_infos().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, "2024-04");
        store.delete_shard("2024-04").unwrap();
        assert!(store.shard_infos().unwrap().is_empty());
    }
}
