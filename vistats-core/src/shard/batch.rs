//! Background writer grouping upserts into multi-shard transactions

use super::ShardedStore;
use crate::{Result, VistatsError};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

enum BatchCommand {
    Upsert {
        bucket: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Flush(Sender<()>),
    Shutdown,
}

/// Fire-and-forget writer for ingestion traffic
///
/// Queued upserts are drained by a worker thread and written in groups of up
/// to `max_batch` entries, each group through one [`MultiTx`](super::MultiTx).
/// A failed group is logged and dropped.
pub struct BatchWriter {
    sender: Sender<BatchCommand>,
    handle: Option<JoinHandle<()>>,
}

impl BatchWriter {
    /// Start the worker thread for `store`
    pub fn spawn(store: Arc<ShardedStore>, max_batch: usize) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let max_batch = max_batch.max(1);
        let name = format!("vistats-batch-{}", store.dir().display());
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(store, receiver, max_batch))?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Queue an upsert
    pub fn submit(&self, bucket: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.sender
            .send(BatchCommand::Upsert {
                bucket: bucket.to_string(),
                key,
                value,
            })
            .map_err(|_| VistatsError::StoreClosed)
    }

    /// Wait until every upsert queued before this call has been written
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.sender
            .send(BatchCommand::Flush(tx))
            .map_err(|_| VistatsError::StoreClosed)?;
        rx.recv().map_err(|_| VistatsError::StoreClosed)
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        let _ = self.sender.send(BatchCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Batch writer thread panicked");
            }
        }
    }
}

fn run(store: Arc<ShardedStore>, receiver: Receiver<BatchCommand>, max_batch: usize) {
    let mut shutdown = false;
    while !shutdown {
        let first = match receiver.recv() {
            Ok(cmd) => cmd,
            Err(_) => break,
        };

        let mut upserts = Vec::new();
        let mut acks = Vec::new();
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                BatchCommand::Upsert { bucket, key, value } => upserts.push((bucket, key, value)),
                BatchCommand::Flush(ack) => acks.push(ack),
                BatchCommand::Shutdown => {
                    shutdown = true;
                    break;
                }
            }
            if upserts.len() < max_batch {
                next = receiver.try_recv().ok();
            }
        }

        if !upserts.is_empty() {
            // ascending keys take shard write locks in id order
            upserts.sort_by(|a, b| a.1.cmp(&b.1));
            let count = upserts.len();
            let written = store.update(|tx| {
                for (bucket, key, value) in &upserts {
                    tx.put(bucket, key, value)?;
                }
                Ok(())
            });
            match written {
                Ok(()) => debug!("Wrote batch of {} entries", count),
                Err(e) => warn!("Dropped batch of {} entries: {}", count, e),
            }
        }

        for ack in acks {
            let _ = ack.send(());
        }
    }
    info!("Batch writer for {:?} stopped", store.dir());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{month_shard_id, session_key, to_nanos};
    use crate::shard::ShardOptions;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    #[test]
    fn test_flush_persists_queued_writes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            ShardedStore::open(dir.path(), Arc::new(month_shard_id), ShardOptions::default())
                .unwrap(),
        );
        let writer = BatchWriter::spawn(store.clone(), 16).unwrap();

        let jan = to_nanos(Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap());
        let feb = to_nanos(Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap());
        for i in 0..50u32 {
            let t = if i % 2 == 0 { jan } else { feb };
            writer
                .submit("Session", session_key(t, i), vec![i as u8])
                .unwrap();
        }
        writer.flush().unwrap();

        assert_eq!(store.shard_ids(), vec!["2024-01", "2024-02"]);
        assert_eq!(store.get("Session", &session_key(feb, 49)).unwrap(), vec![49]);
        let total: usize = store
            .scan("Session", &session_key(jan, 0), &session_key(feb + 1, 0))
            .unwrap()
            .count();
        assert_eq!(total, 50);
    }

    #[test]
    fn test_drop_drains_queue() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            ShardedStore::open(dir.path(), Arc::new(month_shard_id), ShardOptions::default())
                .unwrap(),
        );
        let t = to_nanos(Utc.with_ymd_and_hms(2024, 3, 3, 3, 0, 0).unwrap());
        {
            let writer = BatchWriter::spawn(store.clone(), 4).unwrap();
            for i in 0..10u32 {
                writer.submit("Session", session_key(t, i), vec![1]).unwrap();
            }
        }
        assert_eq!(store.count_prefix("Session", &session_key(t, 0)[..8]).unwrap(), 10);
    }
}
