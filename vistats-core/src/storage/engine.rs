//! Storage engine - top-level coordinator

use super::{ClientInfo, CollectionStore, CreatePageviewInput, CreateSessionInput, ShardInfo, StorageConfig};
use crate::analytics::{BucketSums, PageviewData, QueryInput, SessionData, Statistics};
use crate::config::ROOT_FILE;
use crate::keys::to_nanos;
use crate::store::RecordStore;
use crate::{AuthToken, Collection, Result, Teammate, Timestamp, User, VistatsError};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// vistats storage engine
pub struct StorageEngine {
    config: StorageConfig,
    records: RecordStore,
    collections: RwLock<HashMap<String, Arc<CollectionStore>>>,
}

impl StorageEngine {
    /// Open the data directory, creating it when missing
    pub fn new(config: StorageConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let records = RecordStore::open(config.data_dir.join(ROOT_FILE))?;

        let engine = Self {
            config,
            records,
            collections: RwLock::new(HashMap::new()),
        };

        // Open stores of registered collections
        engine.load_collections()?;

        Ok(engine)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Register a new collection owned by `owner_id`
    pub fn create_collection(&self, owner_id: u64, name: &str) -> Result<Collection> {
        if name.trim().is_empty() {
            return Err(VistatsError::InvalidInput("collection name is empty".into()));
        }
        let collection = Collection {
            id: uuid::Uuid::new_v4().simple().to_string(),
            owner_id,
            name: name.to_string(),
            created: now(),
            teammates: Vec::new(),
        };
        self.records.insert(&collection.id, &collection)?;
        self.collection_store(&collection.id)?;

        info!("Created collection: {} ({})", collection.name, collection.id);

        Ok(collection)
    }

    pub fn get_collection(&self, id: &str) -> Result<Collection> {
        self.records.get(&id.to_string())
    }

    pub fn update_collection(&self, collection: &Collection) -> Result<()> {
        self.records.update(&collection.id, collection)
    }

    /// Unregister a collection and remove its shard directory
    pub fn delete_collection(&self, id: &str) -> Result<()> {
        let mut collections = self.collections.write();
        self.records.delete::<String, Collection>(&id.to_string())?;
        self.drop_collection_store(&mut collections, id)
    }

    /// Collections owned by the user or shared with them
    pub fn collections_by_owner(&self, user_id: u64) -> Result<Vec<Collection>> {
        let mut out = Vec::new();
        self.records.iterate(|_: String, c: Collection| {
            if c.owner_id == user_id || c.has_teammate(user_id) {
                out.push(c);
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Share a collection with an existing user
    pub fn add_teammate(&self, collection_id: &str, user_id: u64) -> Result<Collection> {
        self.get_user(user_id)?;
        let mut collection = self.get_collection(collection_id)?;
        if collection.has_teammate(user_id) {
            return Err(VistatsError::KeyExists);
        }
        collection.teammates.push(Teammate { user_id });
        self.update_collection(&collection)?;
        Ok(collection)
    }

    pub fn remove_teammate(&self, collection_id: &str, user_id: u64) -> Result<Collection> {
        let mut collection = self.get_collection(collection_id)?;
        let before = collection.teammates.len();
        collection.teammates.retain(|t| t.user_id != user_id);
        if collection.teammates.len() == before {
            return Err(VistatsError::KeyNotExists);
        }
        self.update_collection(&collection)?;
        Ok(collection)
    }

    /// Store a new user; assigns and returns its id
    pub fn insert_user(&self, user: &mut User) -> Result<u64> {
        if user.created == 0 {
            user.created = now();
        }
        // email lookup and insert share one write transaction
        self.records.write(|tx| {
            let mut taken = false;
            tx.iterate_prefix(&[], |_: u64, u: User| {
                taken |= u.email == user.email;
                Ok(())
            })?;
            if taken {
                return Err(VistatsError::KeyExists);
            }
            tx.insert_auto(user)
        })
    }

    pub fn get_user(&self, id: u64) -> Result<User> {
        self.records.get(&id)
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let mut found = None;
        self.records.iterate(|_: u64, u: User| {
            if found.is_none() && u.email == email {
                found = Some(u);
            }
            Ok(())
        })?;
        Ok(found)
    }

    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.records.upsert(&user.id, user)
    }

    /// Delete a user with their tokens, owned collections and memberships
    pub fn delete_user(&self, id: u64) -> Result<()> {
        let mut collections = self.collections.write();
        let owned = self.records.write(|tx| {
            tx.delete::<u64, User>(&id)?;

            for (key, token) in tx.entries::<String, AuthToken>()? {
                if token.owner_id == id {
                    tx.delete::<String, AuthToken>(&key)?;
                }
            }

            let mut owned = Vec::new();
            for (key, mut collection) in tx.entries::<String, Collection>()? {
                if collection.owner_id == id {
                    tx.delete::<String, Collection>(&key)?;
                    owned.push(key);
                } else if collection.has_teammate(id) {
                    collection.teammates.retain(|t| t.user_id != id);
                    tx.update(&key, &collection)?;
                }
            }
            Ok(owned)
        })?;

        for collection_id in &owned {
            self.drop_collection_store(&mut collections, collection_id)?;
        }
        drop(collections);

        info!("Deleted user {} with {} collections", id, owned.len());
        Ok(())
    }

    /// Issue a token for `owner_id`
    pub fn insert_auth_token(&self, owner_id: u64) -> Result<AuthToken> {
        let token = AuthToken {
            id: uuid::Uuid::new_v4().simple().to_string(),
            owner_id,
            ttl: self.config.auth_token_ttl,
            created: now(),
        };
        self.records.insert(&token.id, &token)?;
        Ok(token)
    }

    /// Look up a live token; expired tokens are removed and reported missing
    pub fn get_auth_token(&self, id: &str) -> Result<AuthToken> {
        let token: AuthToken = self.records.get(&id.to_string())?;
        if token.is_expired(now()) {
            self.records.delete::<String, AuthToken>(&token.id)?;
            return Err(VistatsError::KeyNotExists);
        }
        Ok(token)
    }

    pub fn delete_auth_token(&self, id: &str) -> Result<()> {
        self.records.delete::<String, AuthToken>(&id.to_string())
    }

    /// Store of a registered collection, opened on first use
    pub fn collection_store(&self, id: &str) -> Result<Arc<CollectionStore>> {
        {
            let collections = self.collections.read();
            if let Some(store) = collections.get(id) {
                return Ok(store.clone());
            }
        }

        let mut collections = self.collections.write();
        if let Some(store) = collections.get(id) {
            return Ok(store.clone());
        }
        // registry deletes hold the map lock, so the record cannot vanish
        // between this check and the open below
        self.get_collection(id)?;
        let store = Arc::new(self.open_collection_store(id)?);
        collections.insert(id.to_string(), store.clone());
        Ok(store)
    }

    pub fn create_session(&self, client: &ClientInfo, input: &CreateSessionInput) -> Result<String> {
        self.collection_store(&input.collection_id)?
            .create_session(client, input)
    }

    pub fn update_session(&self, collection_id: &str, session_key: &str) -> Result<()> {
        self.collection_store(collection_id)?
            .update_session(session_key)
    }

    pub fn create_pageview(&self, input: &CreatePageviewInput) -> Result<()> {
        self.collection_store(&input.collection_id)?
            .create_pageview(&input.session_key, &input.path)
    }

    pub fn get_bucket_sums(&self, collection_id: &str, input: &QueryInput) -> Result<BucketSums> {
        self.collection_store(collection_id)?.get_bucket_sums(input)
    }

    pub fn get_statistics(&self, collection_id: &str, input: &QueryInput) -> Result<Statistics> {
        self.collection_store(collection_id)?.get_statistics(input)
    }

    pub fn get_sessions(&self, collection_id: &str, input: &QueryInput) -> Result<Vec<SessionData>> {
        self.collection_store(collection_id)?.get_sessions(input)
    }

    pub fn get_pageviews(&self, collection_id: &str, session_key: &str) -> Result<Vec<PageviewData>> {
        self.collection_store(collection_id)?.get_pageviews(session_key)
    }

    pub fn collection_shards(&self, collection_id: &str) -> Result<Vec<ShardInfo>> {
        self.collection_store(collection_id)?.shard_infos()
    }

    pub fn delete_collection_shard(&self, collection_id: &str, shard_id: &str) -> Result<()> {
        self.collection_store(collection_id)?.delete_shard(shard_id)
    }

    /// Fill a collection with `n` synthetic sessions over `[from, to)`
    pub fn seed(&self, collection_id: &str, from: Timestamp, to: Timestamp, n: usize) -> Result<usize> {
        let collection = self.get_collection(collection_id)?;
        let store = self.collection_store(collection_id)?;
        crate::seed::seed(store.shards(), &collection, from, to, n)
    }

    /// Wait for queued writes of every open collection
    pub fn flush_all(&self) -> Result<()> {
        let collections = self.collections.read();
        for store in collections.values() {
            store.flush()?;
        }
        Ok(())
    }

    /// Get engine statistics
    pub fn stats(&self) -> Result<EngineStats> {
        let collections = self.collections.read();
        let mut stats = EngineStats {
            collection_count: collections.len(),
            ..Default::default()
        };
        for store in collections.values() {
            for info in store.shard_infos()? {
                stats.shard_count += 1;
                stats.total_size_bytes += info.size;
            }
        }
        Ok(stats)
    }

    fn collection_dir(&self, id: &str) -> PathBuf {
        self.config.data_dir.join(id)
    }

    fn open_collection_store(&self, id: &str) -> Result<CollectionStore> {
        if id.is_empty() || id.contains(|c: char| c == '/' || c == '\\' || c == '.') {
            return Err(VistatsError::InvalidInput(format!("bad collection id: {:?}", id)));
        }
        CollectionStore::open(
            id,
            &self.collection_dir(id),
            self.config.file_mode,
            self.config.batch_size,
        )
    }

    /// Close and remove a collection's store; the caller holds the map lock
    fn drop_collection_store(
        &self,
        collections: &mut HashMap<String, Arc<CollectionStore>>,
        id: &str,
    ) -> Result<()> {
        if let Some(store) = collections.remove(id) {
            store.close();
        }
        let dir = self.collection_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        info!("Dropped collection store: {}", id);
        Ok(())
    }

    fn load_collections(&self) -> Result<()> {
        let mut ids = Vec::new();
        self.records.iterate(|id: String, _: Collection| {
            ids.push(id);
            Ok(())
        })?;

        for id in ids {
            match self.open_collection_store(&id) {
                Ok(store) => {
                    self.collections.write().insert(id.clone(), Arc::new(store));
                    info!("Loaded collection: {}", id);
                }
                Err(e) => {
                    warn!("Failed to load collection {}: {}", id, e);
                }
            }
        }

        Ok(())
    }
}

fn now() -> Timestamp {
    to_nanos(Utc::now())
}

/// Storage engine statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineStats {
    pub collection_count: usize,
    pub shard_count: usize,
    pub total_size_bytes: u64,
}
