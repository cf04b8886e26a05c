//! Typed record store over a single embedded B-tree file
//!
//! Values are encoded with bincode and kept in one table ("bucket") per
//! record type. Keys are encoded by [`RecordKey`] so that byte order matches
//! the natural order of the key type.

mod record;

pub use record::{ReadTx, RecordStore, WriteTx};

use crate::{Result, VistatsError};
use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Raw byte table used for every bucket
pub(crate) type RawTable<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;

/// Table definition for a bucket name
pub(crate) fn raw_table(name: &str) -> RawTable<'_> {
    TableDefinition::new(name)
}

/// A value that can be persisted in its own bucket
pub trait Record: Serialize + DeserializeOwned {
    /// Bucket (table) name for this type
    const BUCKET: &'static str;

    /// Receive a store-assigned identity before encoding
    ///
    /// Types with a leading numeric identity field override this; others
    /// ignore the generated id.
    fn set_id(&mut self, _id: u64) {}

    /// Encode to bytes
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from bytes
    fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// A key type with an order-preserving byte encoding
pub trait RecordKey: Sized {
    fn encode_key(&self) -> Vec<u8>;
    fn decode_key(data: &[u8]) -> Result<Self>;
}

impl RecordKey for String {
    fn encode_key(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode_key(data: &[u8]) -> Result<Self> {
        String::from_utf8(data.to_vec()).map_err(|e| VistatsError::Decode(e.to_string()))
    }
}

impl RecordKey for u32 {
    fn encode_key(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_key(data: &[u8]) -> Result<Self> {
        let bytes: [u8; 4] = data
            .try_into()
            .map_err(|_| VistatsError::Decode(format!("u32 key invalid length {}", data.len())))?;
        Ok(u32::from_be_bytes(bytes))
    }
}

impl RecordKey for u64 {
    fn encode_key(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_key(data: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| VistatsError::Decode(format!("u64 key invalid length {}", data.len())))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

impl RecordKey for Vec<u8> {
    fn encode_key(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode_key(data: &[u8]) -> Result<Self> {
        Ok(data.to_vec())
    }
}
