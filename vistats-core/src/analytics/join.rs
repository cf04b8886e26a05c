//! Merge-join of sessions with their pageviews
//!
//! Session keys and pageview keys share the session key as prefix, so an
//! ordered scan of each bucket over the same key range visits both in
//! session-key order. Walking the two scans side by side yields every
//! session together with all of its pageviews in one pass.

use crate::keys::{decode_pageview_time, decode_time, PAGEVIEW_KEY_LEN, SESSION_KEY_LEN};
use crate::shard::{ShardScan, ShardedStore};
use crate::store::Record;
use crate::{Pageview, Result, Session, Timestamp};
use std::cmp::Ordering;
use std::iter::Peekable;
use tracing::{debug, warn};

/// A session with every pageview stored under it
#[derive(Debug, Clone)]
pub struct JoinedSession {
    pub key: Vec<u8>,
    pub begin: Timestamp,
    pub session: Session,
    /// Pageviews in time order with their own timestamps
    pub pageviews: Vec<(Timestamp, Pageview)>,
}

impl JoinedSession {
    pub fn pageview_count(&self) -> usize {
        self.pageviews.len()
    }
}

/// Iterator over the sessions begun in `[from, to)` joined with their pageviews
pub struct SessionJoin {
    sessions: ShardScan,
    pageviews: Peekable<ShardScan>,
}

impl SessionJoin {
    pub fn new(store: &ShardedStore, from: Timestamp, to: Timestamp) -> Result<Self> {
        let from_key = from.to_be_bytes();
        let to_key = to.to_be_bytes();
        Ok(Self {
            sessions: store.scan(Session::BUCKET, &from_key, &to_key)?,
            pageviews: store.scan(Pageview::BUCKET, &from_key, &to_key)?.peekable(),
        })
    }

    fn take_pageviews(&mut self, session_key: &[u8]) -> Result<Vec<(Timestamp, Pageview)>> {
        let mut out = Vec::new();
        loop {
            let ordering = match self.pageviews.peek() {
                None => break,
                Some(Ok((k, _))) => k[..k.len().min(SESSION_KEY_LEN)].cmp(session_key),
                // surfaced by next() below
                Some(Err(_)) => Ordering::Less,
            };
            if ordering == Ordering::Greater {
                break;
            }
            let (key, value) = match self.pageviews.next() {
                Some(Ok(entry)) => entry,
                Some(Err(e)) => return Err(e),
                None => break,
            };
            if ordering == Ordering::Less {
                debug!("Skipping pageview without session: {:?}", key);
                continue;
            }
            if key.len() != PAGEVIEW_KEY_LEN {
                warn!("Skipping pageview with bad key: {:?}", key);
                continue;
            }
            let t = match decode_pageview_time(&key) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Skipping pageview with bad key {:?}: {}", key, e);
                    continue;
                }
            };
            match Pageview::decode(&value) {
                Ok(pageview) => out.push((t, pageview)),
                Err(e) => warn!("Skipping undecodable pageview {:?}: {}", key, e),
            }
        }
        Ok(out)
    }
}

impl Iterator for SessionJoin {
    type Item = Result<JoinedSession>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, value) = match self.sessions.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let pageviews = match self.take_pageviews(&key) {
                Ok(pageviews) => pageviews,
                Err(e) => return Some(Err(e)),
            };
            if key.len() != SESSION_KEY_LEN {
                warn!("Skipping session with bad key: {:?}", key);
                continue;
            }
            let begin = match decode_time(&key) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Skipping session with bad key {:?}: {}", key, e);
                    continue;
                }
            };
            let session = match Session::decode(&value) {
                Ok(session) => session,
                Err(e) => {
                    warn!("Skipping undecodable session {:?}: {}", key, e);
                    continue;
                }
            };
            return Some(Ok(JoinedSession {
                key,
                begin,
                session,
                pageviews,
            }));
        }
    }
}
