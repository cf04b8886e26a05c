//! Composite key codec
//!
//! Every sharded key starts with an 8-byte big-endian nanosecond timestamp, so
//! byte order equals chronological order and the first 8 bytes always pick the
//! shard:
//!
//! ```text
//! session:  [ begin ns (8) | id (4) ]
//! pageview: [ begin ns (8) | id (4) | pageview ns (8) ]
//! ```
//!
//! Timestamps are expected to be non-negative; pre-epoch values do not sort
//! correctly under byte comparison.

use crate::{Result, Timestamp, VistatsError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

/// Length of an encoded timestamp
pub const TIME_KEY_LEN: usize = 8;

/// Length of a session key
pub const SESSION_KEY_LEN: usize = TIME_KEY_LEN + 4;

/// Length of a pageview key
pub const PAGEVIEW_KEY_LEN: usize = SESSION_KEY_LEN + TIME_KEY_LEN;

/// Encode a timestamp as 8 big-endian bytes
pub fn encode_time_key(t: Timestamp) -> Vec<u8> {
    t.to_be_bytes().to_vec()
}

/// Build a session key from its begin time and random id
pub fn session_key(t: Timestamp, id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(SESSION_KEY_LEN);
    buf.put_i64(t);
    buf.put_u32(id);
    buf.to_vec()
}

/// Build a pageview key under its owning session
pub fn pageview_key(session_key: &[u8], t: Timestamp) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(session_key.len() + TIME_KEY_LEN);
    buf.put_slice(session_key);
    buf.put_i64(t);
    buf.to_vec()
}

/// Decode the leading timestamp of any composite key
pub fn decode_time(key: &[u8]) -> Result<Timestamp> {
    if key.len() < TIME_KEY_LEN {
        return Err(VistatsError::InvalidKey(format!(
            "time key too short: {} < {}",
            key.len(),
            TIME_KEY_LEN
        )));
    }
    let mut head = &key[..TIME_KEY_LEN];
    Ok(head.get_i64())
}

/// Decode the trailing 4-byte id of a session key
pub fn decode_id(key: &[u8]) -> Result<u32> {
    if key.len() < 4 {
        return Err(VistatsError::InvalidKey(format!(
            "id key too short: {} < 4",
            key.len()
        )));
    }
    let mut tail = &key[key.len() - 4..];
    Ok(tail.get_u32())
}

/// Decode the trailing timestamp of a pageview key
pub fn decode_pageview_time(key: &[u8]) -> Result<Timestamp> {
    if key.len() < PAGEVIEW_KEY_LEN {
        return Err(VistatsError::InvalidKey(format!(
            "pageview key too short: {} < {}",
            key.len(),
            PAGEVIEW_KEY_LEN
        )));
    }
    let mut tail = &key[key.len() - TIME_KEY_LEN..];
    Ok(tail.get_i64())
}

/// The owning session key of a pageview key
pub fn session_key_of(pageview_key: &[u8]) -> Result<&[u8]> {
    if pageview_key.len() < PAGEVIEW_KEY_LEN {
        return Err(VistatsError::InvalidKey(format!(
            "pageview key too short: {}",
            pageview_key.len()
        )));
    }
    Ok(&pageview_key[..SESSION_KEY_LEN])
}

/// Shard id function used by collections: the UTC calendar month of the
/// key's leading timestamp, formatted `YYYY-MM`
pub fn month_shard_id(key: &[u8]) -> Result<String> {
    let t = decode_time(key)?;
    Ok(from_nanos(t).format("%Y-%m").to_string())
}

/// Text form of a session key handed to clients
pub fn encode_session_key(key: &[u8]) -> String {
    STANDARD.encode(key)
}

/// Parse the text form of a session key
pub fn decode_session_key(text: &str) -> Result<Vec<u8>> {
    let key = STANDARD
        .decode(text)
        .map_err(|e| VistatsError::InvalidKey(format!("{}: {}", text, e)))?;
    if key.len() != SESSION_KEY_LEN {
        return Err(VistatsError::InvalidKey(format!(
            "session key must be {} bytes, got {}",
            SESSION_KEY_LEN,
            key.len()
        )));
    }
    Ok(key)
}

/// Convert a UTC instant to nanoseconds since the epoch
pub fn to_nanos(t: DateTime<Utc>) -> Timestamp {
    t.timestamp_nanos_opt().unwrap_or(0)
}

/// Convert nanoseconds since the epoch to a UTC instant
pub fn from_nanos(t: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_nanos(t)
}
