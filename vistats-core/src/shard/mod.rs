//! Time-sharded store
//!
//! A directory of independent redb files, one per shard id. The shard id of
//! a key is computed by a caller-supplied function (for analytics data, the
//! calendar month of the key's leading timestamp). Shards are created lazily
//! on the write path.
//!
//! Reads take a lock-free snapshot of the sorted shard array; a single mutex
//! serializes shard creation and deletion, which publish a new array copy.

mod batch;
mod tx;

pub use batch::BatchWriter;
pub use tx::MultiTx;

use crate::config::{DEFAULT_FILE_MODE, SHARD_FILE_SUFFIX};
use crate::store::raw_table;
use crate::{Result, VistatsError};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use redb::{Database, Durability, ReadableTable, TableError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maps a key to the id of the shard holding it
pub type ShardIdFn = Arc<dyn Fn(&[u8]) -> Result<String> + Send + Sync>;

/// Options for opening a sharded store
#[derive(Debug, Clone)]
pub struct ShardOptions {
    /// Unix permission bits for newly created shard files
    pub file_mode: u32,
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            file_mode: DEFAULT_FILE_MODE,
        }
    }
}

/// One shard file
pub(crate) struct Shard {
    pub(crate) id: String,
    pub(crate) path: PathBuf,
    pub(crate) db: Database,
}

/// A set of shard files addressed by key
pub struct ShardedStore {
    dir: PathBuf,
    shard_id: ShardIdFn,
    options: ShardOptions,
    /// Sorted by id
    shards: ArcSwap<Vec<Arc<Shard>>>,
    create_lock: Mutex<()>,
    closed: AtomicBool,
}

impl ShardedStore {
    /// Open a shard directory, creating it when missing
    pub fn open(dir: impl AsRef<Path>, shard_id: ShardIdFn, options: ShardOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut shards = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let id = match shard_id_from_path(&path) {
                Some(id) => id,
                None => {
                    debug!("Ignoring non-shard file: {:?}", path);
                    continue;
                }
            };
            match Database::open(&path) {
                Ok(db) => shards.push(Arc::new(Shard { id, path, db })),
                Err(e) => warn!("Failed to open shard {:?}: {}", path, e),
            }
        }
        shards.sort_by(|a, b| a.id.cmp(&b.id));

        info!("Opened shard store {:?} with {} shards", dir, shards.len());

        Ok(Self {
            dir,
            shard_id,
            options,
            shards: ArcSwap::from_pointee(shards),
            create_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Directory holding the shard files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Shard id of a key
    pub fn shard_id_of(&self, key: &[u8]) -> Result<String> {
        (self.shard_id)(key)
    }

    /// Ids of the open shards in ascending order
    pub fn shard_ids(&self) -> Vec<String> {
        self.shards.load().iter().map(|s| s.id.clone()).collect()
    }

    /// File size of every open shard
    pub fn sizes(&self) -> Result<Vec<(String, u64)>> {
        let shards = self.shards.load();
        let mut out = Vec::with_capacity(shards.len());
        for shard in shards.iter() {
            out.push((shard.id.clone(), std::fs::metadata(&shard.path)?.len()));
        }
        Ok(out)
    }

    /// Get the value stored under `key` in `bucket`
    pub fn get(&self, bucket: &str, key: &[u8]) -> Result<Vec<u8>> {
        let id = self.shard_id_of(key)?;
        let shard = self.find(&id).ok_or(VistatsError::ShardNotFound(id))?;
        let tx = shard.db.begin_read()?;
        let table = match tx.open_table(raw_table(bucket)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Err(VistatsError::KeyNotExists),
            Err(e) => return Err(e.into()),
        };
        let value = table.get(key)?.map(|v| v.value().to_vec());
        value.ok_or(VistatsError::KeyNotExists)
    }

    /// Ordered entries of `bucket` with keys in `[from, to)`
    pub fn scan(&self, bucket: &str, from: &[u8], to: &[u8]) -> Result<ShardScan> {
        if from >= to {
            return Ok(ShardScan::empty(bucket));
        }
        let first = self.shard_id_of(from)?;
        let last = self.shard_id_of(to)?;
        let shards = self
            .shards
            .load()
            .iter()
            .filter(|s| s.id >= first && s.id <= last)
            .cloned()
            .collect();
        Ok(ShardScan {
            bucket: bucket.to_string(),
            shards,
            start: from.to_vec(),
            end: ScanEnd::Before(to.to_vec()),
            cursor: None,
            failed: false,
        })
    }

    /// Ordered entries of `bucket` whose key starts with `prefix`
    pub fn scan_prefix(&self, bucket: &str, prefix: &[u8]) -> ShardScan {
        let snapshot = self.shards.load();
        let shards = match self.shard_id_of(prefix) {
            Ok(id) => snapshot.iter().filter(|s| s.id == id).cloned().collect(),
            // prefix too short to name a shard
            Err(_) => snapshot.iter().cloned().collect(),
        };
        ShardScan {
            bucket: bucket.to_string(),
            shards,
            start: prefix.to_vec(),
            end: ScanEnd::Prefix,
            cursor: None,
            failed: false,
        }
    }

    /// Visit the entries of `bucket` with keys in `[from, to)`
    pub fn iterate<F>(&self, bucket: &str, from: &[u8], to: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        for entry in self.scan(bucket, from, to)? {
            let (k, v) = entry?;
            f(&k, &v)?;
        }
        Ok(())
    }

    /// Visit the entries of `bucket` whose key starts with `prefix`
    pub fn iterate_prefix<F>(&self, bucket: &str, prefix: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        for entry in self.scan_prefix(bucket, prefix) {
            let (k, v) = entry?;
            f(&k, &v)?;
        }
        Ok(())
    }

    /// Count the entries of `bucket` whose key starts with `prefix`
    pub fn count_prefix(&self, bucket: &str, prefix: &[u8]) -> Result<usize> {
        let mut count = 0;
        for entry in self.scan_prefix(bucket, prefix) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Begin a multi-shard transaction
    pub fn begin(&self, writeable: bool) -> MultiTx<'_> {
        MultiTx::new(self, writeable)
    }

    /// Run `f` in a writeable multi-shard transaction; commits on `Ok`,
    /// rolls back on `Err`
    pub fn update<T>(&self, f: impl FnOnce(&mut MultiTx<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(true);
        match f(&mut tx) {
            Ok(out) => {
                tx.commit()?;
                Ok(out)
            }
            Err(e) => {
                tx.rollback()?;
                Err(e)
            }
        }
    }

    /// Upsert one entry with relaxed durability
    ///
    /// The write is committed but not fsynced; a crash may lose it.
    pub fn batch_upsert(&self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let id = self.shard_id_of(key)?;
        let shard = self.ensure_shard(&id)?;
        let mut tx = shard.db.begin_write()?;
        tx.set_durability(Durability::Eventual);
        {
            let mut table = tx.open_table(raw_table(bucket))?;
            table.insert(key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove a shard and its file
    pub fn delete_shard(&self, id: &str) -> Result<()> {
        let _guard = self.create_lock.lock();
        let current = self.shards.load_full();
        let shard = current
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| VistatsError::ShardNotFound(id.to_string()))?;

        let remaining: Vec<Arc<Shard>> = current.iter().filter(|s| s.id != id).cloned().collect();
        self.shards.store(Arc::new(remaining));
        drop(current);

        let path = shard.path.clone();
        drop(shard);
        std::fs::remove_file(&path)?;

        info!("Deleted shard {} ({:?})", id, path);
        Ok(())
    }

    /// Close every shard; later writes fail with `StoreClosed`
    pub fn close(&self) {
        let _guard = self.create_lock.lock();
        self.closed.store(true, Ordering::SeqCst);
        self.shards.store(Arc::new(Vec::new()));
        info!("Closed shard store {:?}", self.dir);
    }

    pub(crate) fn find(&self, id: &str) -> Option<Arc<Shard>> {
        let shards = self.shards.load();
        shards
            .binary_search_by(|s| s.id.as_str().cmp(id))
            .ok()
            .map(|i| shards[i].clone())
    }

    /// Existing shard with `id`, creating it when missing
    pub(crate) fn ensure_shard(&self, id: &str) -> Result<Arc<Shard>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VistatsError::StoreClosed);
        }
        if let Some(shard) = self.find(id) {
            return Ok(shard);
        }

        let _guard = self.create_lock.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(VistatsError::StoreClosed);
        }
        if let Some(shard) = self.find(id) {
            return Ok(shard);
        }

        let path = self.dir.join(format!("{}{}", id, SHARD_FILE_SUFFIX));
        let db = Database::create(&path)?;
        set_file_mode(&path, self.options.file_mode)?;
        let shard = Arc::new(Shard {
            id: id.to_string(),
            path,
            db,
        });

        let mut next: Vec<Arc<Shard>> = self.shards.load().iter().cloned().collect();
        let pos = next.partition_point(|s| s.id.as_str() < id);
        next.insert(pos, shard.clone());
        self.shards.store(Arc::new(next));

        info!("Created shard {} in {:?}", id, self.dir);
        Ok(shard)
    }
}

fn shard_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_suffix(SHARD_FILE_SUFFIX)?;
    if id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

enum ScanEnd {
    /// Stop at the first key `>=` the bound
    Before(Vec<u8>),
    /// Stop at the first key not starting with the scan start
    Prefix,
}

/// Live cursor over one shard's bucket; keeps its read snapshot alive
type Cursor = redb::Range<'static, &'static [u8], &'static [u8]>;

/// Iterator over the entries of one bucket across consecutive shards
///
/// Shards are visited in ascending id order, each through a cursor on its
/// own read snapshot. Entries are decoded one at a time as the caller pulls.
pub struct ShardScan {
    bucket: String,
    shards: VecDeque<Arc<Shard>>,
    start: Vec<u8>,
    end: ScanEnd,
    /// Id of the shard being read and its cursor
    cursor: Option<(String, Cursor)>,
    failed: bool,
}

impl ShardScan {
    fn empty(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            shards: VecDeque::new(),
            start: Vec::new(),
            end: ScanEnd::Prefix,
            cursor: None,
            failed: false,
        }
    }

    fn open_cursor(&self, shard: &Shard) -> Result<Option<Cursor>> {
        let tx = shard.db.begin_read()?;
        let table = match tx.open_table(raw_table(&self.bucket)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(table.range::<&[u8]>(self.start.as_slice()..)?))
    }

    fn past_end(&self, key: &[u8]) -> bool {
        match &self.end {
            ScanEnd::Before(end) => key >= end.as_slice(),
            ScanEnd::Prefix => !key.starts_with(&self.start),
        }
    }

    fn fail(&mut self, shard_id: &str, e: VistatsError) -> Option<Result<(Vec<u8>, Vec<u8>)>> {
        warn!("Scan of shard {} failed: {}", shard_id, e);
        self.failed = true;
        self.cursor = None;
        Some(Err(e))
    }
}

impl Iterator for ShardScan {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.failed {
                return None;
            }
            if let Some((_, cursor)) = self.cursor.as_mut() {
                match cursor.next() {
                    Some(Ok((k, v))) => {
                        let key = k.value();
                        if !self.past_end(key) {
                            return Some(Ok((key.to_vec(), v.value().to_vec())));
                        }
                    }
                    Some(Err(e)) => {
                        let id = self.cursor.take().map(|(id, _)| id).unwrap_or_default();
                        return self.fail(&id, e.into());
                    }
                    None => {}
                }
                self.cursor = None;
                continue;
            }
            let shard = self.shards.pop_front()?;
            match self.open_cursor(&shard) {
                Ok(cursor) => self.cursor = cursor.map(|c| (shard.id.clone(), c)),
                Err(e) => return self.fail(&shard.id, e),
            }
        }
    }
}
