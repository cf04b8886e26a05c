//! Record store implementation

use super::{raw_table, Record, RecordKey};
use crate::{Result, VistatsError};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, TableError, WriteTransaction};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Per-bucket sequence counters
const SEQUENCE: TableDefinition<&str, u64> = TableDefinition::new("__sequence");

/// Typed record store backed by one redb file
pub struct RecordStore {
    db: Database,
    path: PathBuf,
}

impl RecordStore {
    /// Open or create the store file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;
        info!("Opened record store: {:?}", path);
        Ok(Self { db, path })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` in one read transaction
    pub fn read<T>(&self, f: impl FnOnce(&ReadTx) -> Result<T>) -> Result<T> {
        let tx = ReadTx {
            tx: self.db.begin_read()?,
        };
        f(&tx)
    }

    /// Run `f` in one write transaction; commits on `Ok`, aborts on `Err`
    pub fn write<T>(&self, f: impl FnOnce(&WriteTx) -> Result<T>) -> Result<T> {
        let tx = WriteTx {
            tx: self.db.begin_write()?,
        };
        match f(&tx) {
            Ok(out) => {
                tx.tx.commit()?;
                Ok(out)
            }
            Err(e) => {
                if let Err(abort_err) = tx.tx.abort() {
                    warn!("Failed to abort record transaction: {}", abort_err);
                }
                Err(e)
            }
        }
    }

    /// Get the value stored under `key`
    pub fn get<K: RecordKey, R: Record>(&self, key: &K) -> Result<R> {
        self.read(|tx| tx.get(key))
    }

    /// Insert under an explicit key; fails with `KeyExists`
    pub fn insert<K: RecordKey, R: Record>(&self, key: &K, value: &R) -> Result<()> {
        self.write(|tx| tx.insert(key, value))
    }

    /// Insert under the next sequence number of the bucket
    pub fn insert_auto<R: Record>(&self, value: &mut R) -> Result<u64> {
        self.write(|tx| tx.insert_auto(value))
    }

    /// Replace an existing value; fails with `KeyNotExists`
    pub fn update<K: RecordKey, R: Record>(&self, key: &K, value: &R) -> Result<()> {
        self.write(|tx| tx.update(key, value))
    }

    /// Insert or replace
    pub fn upsert<K: RecordKey, R: Record>(&self, key: &K, value: &R) -> Result<()> {
        self.write(|tx| tx.upsert(key, value))
    }

    /// Delete an existing value; fails with `KeyNotExists`
    pub fn delete<K: RecordKey, R: Record>(&self, key: &K) -> Result<()> {
        self.write(|tx| tx.delete::<K, R>(key))
    }

    /// Delete every entry whose key starts with `prefix`
    pub fn delete_prefix<R: Record>(&self, prefix: &[u8]) -> Result<usize> {
        self.write(|tx| tx.delete_prefix::<R>(prefix))
    }

    /// Visit every entry of the bucket in key order
    pub fn iterate<K, R, F>(&self, f: F) -> Result<()>
    where
        K: RecordKey,
        R: Record,
        F: FnMut(K, R) -> Result<()>,
    {
        self.read(|tx| tx.iterate_prefix(&[], f))
    }

    /// Visit the entries whose key starts with `prefix`
    pub fn iterate_prefix<K, R, F>(&self, prefix: &[u8], f: F) -> Result<()>
    where
        K: RecordKey,
        R: Record,
        F: FnMut(K, R) -> Result<()>,
    {
        self.read(|tx| tx.iterate_prefix(prefix, f))
    }

    /// Count the entries whose key starts with `prefix`
    pub fn count_prefix<R: Record>(&self, prefix: &[u8]) -> Result<usize> {
        self.read(|tx| tx.count_prefix::<R>(prefix))
    }
}

/// Read transaction over the record store
pub struct ReadTx {
    tx: ReadTransaction,
}

impl ReadTx {
    pub fn get<K: RecordKey, R: Record>(&self, key: &K) -> Result<R> {
        let table = match self.tx.open_table(raw_table(R::BUCKET)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Err(VistatsError::KeyNotExists),
            Err(e) => return Err(e.into()),
        };
        get_in(&table, &key.encode_key())
    }

    pub fn iterate_prefix<K, R, F>(&self, prefix: &[u8], f: F) -> Result<()>
    where
        K: RecordKey,
        R: Record,
        F: FnMut(K, R) -> Result<()>,
    {
        let table = match self.tx.open_table(raw_table(R::BUCKET)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        iterate_in(&table, R::BUCKET, prefix, f)
    }

    pub fn count_prefix<R: Record>(&self, prefix: &[u8]) -> Result<usize> {
        let table = match self.tx.open_table(raw_table(R::BUCKET)) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        count_in(&table, prefix)
    }
}

/// Write transaction over the record store
pub struct WriteTx {
    tx: WriteTransaction,
}

impl WriteTx {
    pub fn get<K: RecordKey, R: Record>(&self, key: &K) -> Result<R> {
        let table = self.tx.open_table(raw_table(R::BUCKET))?;
        get_in(&table, &key.encode_key())
    }

    pub fn insert<K: RecordKey, R: Record>(&self, key: &K, value: &R) -> Result<()> {
        let kb = key.encode_key();
        let vb = value.encode()?;
        let mut table = self.tx.open_table(raw_table(R::BUCKET))?;
        if table.get(kb.as_slice())?.is_some() {
            return Err(VistatsError::KeyExists);
        }
        table.insert(kb.as_slice(), vb.as_slice())?;
        Ok(())
    }

    pub fn insert_auto<R: Record>(&self, value: &mut R) -> Result<u64> {
        let id = self.next_sequence(R::BUCKET)?;
        value.set_id(id);
        let vb = value.encode()?;
        let kb = id.encode_key();
        let mut table = self.tx.open_table(raw_table(R::BUCKET))?;
        table.insert(kb.as_slice(), vb.as_slice())?;
        Ok(id)
    }

    pub fn update<K: RecordKey, R: Record>(&self, key: &K, value: &R) -> Result<()> {
        let kb = key.encode_key();
        let vb = value.encode()?;
        let mut table = self.tx.open_table(raw_table(R::BUCKET))?;
        if table.get(kb.as_slice())?.is_none() {
            return Err(VistatsError::KeyNotExists);
        }
        table.insert(kb.as_slice(), vb.as_slice())?;
        Ok(())
    }

    pub fn upsert<K: RecordKey, R: Record>(&self, key: &K, value: &R) -> Result<()> {
        let kb = key.encode_key();
        let vb = value.encode()?;
        let mut table = self.tx.open_table(raw_table(R::BUCKET))?;
        table.insert(kb.as_slice(), vb.as_slice())?;
        Ok(())
    }

    pub fn delete<K: RecordKey, R: Record>(&self, key: &K) -> Result<()> {
        let kb = key.encode_key();
        let mut table = self.tx.open_table(raw_table(R::BUCKET))?;
        if table.remove(kb.as_slice())?.is_none() {
            return Err(VistatsError::KeyNotExists);
        }
        Ok(())
    }

    pub fn delete_prefix<R: Record>(&self, prefix: &[u8]) -> Result<usize> {
        let mut table = self.tx.open_table(raw_table(R::BUCKET))?;
        let mut keys = Vec::new();
        for entry in table.range::<&[u8]>(prefix..)? {
            let (k, _) = entry?;
            if !k.value().starts_with(prefix) {
                break;
            }
            keys.push(k.value().to_vec());
        }
        for key in &keys {
            table.remove(key.as_slice())?;
        }
        Ok(keys.len())
    }

    pub fn iterate_prefix<K, R, F>(&self, prefix: &[u8], f: F) -> Result<()>
    where
        K: RecordKey,
        R: Record,
        F: FnMut(K, R) -> Result<()>,
    {
        let table = self.tx.open_table(raw_table(R::BUCKET))?;
        iterate_in(&table, R::BUCKET, prefix, f)
    }

    /// Collect a bucket so that entries can be modified afterwards in the
    /// same transaction
    pub fn entries<K: RecordKey, R: Record>(&self) -> Result<Vec<(K, R)>> {
        let mut out = Vec::new();
        self.iterate_prefix(&[], |k: K, v: R| {
            out.push((k, v));
            Ok(())
        })?;
        Ok(out)
    }

    pub fn count_prefix<R: Record>(&self, prefix: &[u8]) -> Result<usize> {
        let table = self.tx.open_table(raw_table(R::BUCKET))?;
        count_in(&table, prefix)
    }

    fn next_sequence(&self, bucket: &str) -> Result<u64> {
        let mut seq = self.tx.open_table(SEQUENCE)?;
        let next = seq.get(bucket)?.map(|v| v.value()).unwrap_or(0) + 1;
        seq.insert(bucket, next)?;
        Ok(next)
    }
}

fn get_in<T, R>(table: &T, key: &[u8]) -> Result<R>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
    R: Record,
{
    match table.get(key)? {
        Some(v) => R::decode(v.value()),
        None => Err(VistatsError::KeyNotExists),
    }
}

fn iterate_in<T, K, R, F>(table: &T, bucket: &str, prefix: &[u8], mut f: F) -> Result<()>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
    K: RecordKey,
    R: Record,
    F: FnMut(K, R) -> Result<()>,
{
    for entry in table.range::<&[u8]>(prefix..)? {
        let (k, v) = entry?;
        let kb = k.value();
        if !kb.starts_with(prefix) {
            break;
        }
        let key = match K::decode_key(kb) {
            Ok(key) => key,
            Err(e) => {
                warn!("Skipping bad key in {}: {:?} ({})", bucket, kb, e);
                continue;
            }
        };
        let value = match R::decode(v.value()) {
            Ok(value) => value,
            Err(e) => {
                warn!("Skipping bad value in {} at {:?}: {}", bucket, kb, e);
                continue;
            }
        };
        f(key, value)?;
    }
    Ok(())
}

fn count_in<T>(table: &T, prefix: &[u8]) -> Result<usize>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut count = 0;
    for entry in table.range::<&[u8]>(prefix..)? {
        let (k, _) = entry?;
        if !k.value().starts_with(prefix) {
            break;
        }
        count += 1;
    }
    Ok(count)
}
