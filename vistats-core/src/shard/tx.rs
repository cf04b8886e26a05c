//! Transactions spanning several shards

use super::{Shard, ShardedStore};
use crate::store::raw_table;
use crate::{Result, VistatsError};
use redb::{ReadTransaction, ReadableTable, TableError, WriteTransaction};
use std::sync::Arc;
use tracing::{debug, warn};

enum ShardTx {
    Read(ReadTransaction),
    Write(WriteTransaction),
}

struct Slot {
    id: String,
    tx: ShardTx,
    // keeps the shard open while its transaction lives
    _shard: Arc<Shard>,
}

/// A transaction over every shard it touches
///
/// The first access to a shard begins that shard's transaction, which is
/// kept until commit or rollback. Commit is **not atomic across shards**:
/// each shard commits in the order it was first touched, every commit is
/// attempted, and the last error is returned while shards that already
/// committed stay committed.
///
/// A writeable `MultiTx` holds each touched shard's single writer slot.
/// Other writes to those shards, including from the same thread, block until
/// it finishes. Dropping an unfinished `MultiTx` rolls it back.
pub struct MultiTx<'a> {
    store: &'a ShardedStore,
    writeable: bool,
    slots: Vec<Slot>,
}

impl<'a> MultiTx<'a> {
    pub(crate) fn new(store: &'a ShardedStore, writeable: bool) -> Self {
        Self {
            store,
            writeable,
            slots: Vec::new(),
        }
    }

    pub fn writeable(&self) -> bool {
        self.writeable
    }

    /// Ids of the shards touched so far, in touch order
    pub fn shard_ids(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.id.as_str()).collect()
    }

    /// Insert or replace an entry, creating its shard when missing
    pub fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.writeable {
            return Err(VistatsError::ReadOnlyTransaction);
        }
        match self.slot(key, true)? {
            ShardTx::Write(tx) => {
                let mut table = tx.open_table(raw_table(bucket))?;
                table.insert(key, value)?;
                Ok(())
            }
            ShardTx::Read(_) => Err(VistatsError::ReadOnlyTransaction),
        }
    }

    /// Get an entry; sees this transaction's own writes
    pub fn get(&mut self, bucket: &str, key: &[u8]) -> Result<Vec<u8>> {
        let value = match self.slot(key, false)? {
            ShardTx::Read(tx) => match tx.open_table(raw_table(bucket)) {
                Ok(table) => {
                    let value = table.get(key)?.map(|v| v.value().to_vec());
                    value
                }
                Err(TableError::TableDoesNotExist(_)) => None,
                Err(e) => return Err(e.into()),
            },
            ShardTx::Write(tx) => {
                let table = tx.open_table(raw_table(bucket))?;
                let value = table.get(key)?.map(|v| v.value().to_vec());
                value
            }
        };
        value.ok_or(VistatsError::KeyNotExists)
    }

    /// Delete an existing entry
    pub fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<()> {
        if !self.writeable {
            return Err(VistatsError::ReadOnlyTransaction);
        }
        let slot = match self.slot(key, false) {
            Ok(slot) => slot,
            Err(VistatsError::ShardNotFound(_)) => return Err(VistatsError::KeyNotExists),
            Err(e) => return Err(e),
        };
        match slot {
            ShardTx::Write(tx) => {
                let mut table = tx.open_table(raw_table(bucket))?;
                let removed = table.remove(key)?.is_some();
                if removed {
                    Ok(())
                } else {
                    Err(VistatsError::KeyNotExists)
                }
            }
            ShardTx::Read(_) => Err(VistatsError::ReadOnlyTransaction),
        }
    }

    /// Commit every shard transaction in touch order
    pub fn commit(mut self) -> Result<()> {
        let mut last_err: Option<VistatsError> = None;
        for slot in std::mem::take(&mut self.slots) {
            if let ShardTx::Write(tx) = slot.tx {
                if let Err(e) = tx.commit() {
                    warn!("Commit of shard {} failed: {}", slot.id, e);
                    last_err = Some(e.into());
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Abort every shard transaction
    pub fn rollback(mut self) -> Result<()> {
        abort_all(std::mem::take(&mut self.slots))
    }

    fn slot(&mut self, key: &[u8], create: bool) -> Result<&ShardTx> {
        let id = self.store.shard_id_of(key)?;
        if let Some(pos) = self.slots.iter().position(|s| s.id == id) {
            return Ok(&self.slots[pos].tx);
        }

        let shard = if create {
            self.store.ensure_shard(&id)?
        } else {
            self.store
                .find(&id)
                .ok_or_else(|| VistatsError::ShardNotFound(id.clone()))?
        };
        let tx = if self.writeable {
            ShardTx::Write(shard.db.begin_write()?)
        } else {
            ShardTx::Read(shard.db.begin_read()?)
        };
        debug!("Began shard transaction on {}", id);
        self.slots.push(Slot {
            id,
            tx,
            _shard: shard,
        });
        let last = self.slots.len() - 1;
        Ok(&self.slots[last].tx)
    }
}

impl Drop for MultiTx<'_> {
    fn drop(&mut self) {
        if self.slots.is_empty() {
            return;
        }
        debug!("Rolling back unfinished transaction on {} shards", self.slots.len());
        if let Err(e) = abort_all(std::mem::take(&mut self.slots)) {
            warn!("Rollback failed: {}", e);
        }
    }
}

fn abort_all(slots: Vec<Slot>) -> Result<()> {
    let mut last_err: Option<VistatsError> = None;
    for slot in slots {
        if let ShardTx::Write(tx) = slot.tx {
            if let Err(e) = tx.abort() {
                warn!("Rollback of shard {} failed: {}", slot.id, e);
                last_err = Some(e.into());
            }
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
