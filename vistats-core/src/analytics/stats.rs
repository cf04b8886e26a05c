//! Windowed statistics over a collection's sessions and pageviews

use super::bucket::{BucketGen, BucketSum, BucketType};
use super::filter::{Filter, PageviewField, SessionField};
use super::join::{JoinedSession, SessionJoin};
use crate::config::SESSION_LOOKBACK;
use crate::keys::{decode_pageview_time, encode_session_key};
use crate::shard::ShardedStore;
use crate::store::Record;
use crate::{Pageview, Result, Session, Timestamp, VistatsError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Parameters of a statistics query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryInput {
    /// Window start, inclusive (ns)
    pub from: Timestamp,
    /// Window end, exclusive (ns)
    pub to: Timestamp,
    /// `hour`, `day`, `week` or `month`
    pub bucket: String,
    /// IANA zone name for bucket boundaries
    pub timezone: String,
    pub filter: HashMap<String, String>,
}

impl QueryInput {
    pub fn window(from: Timestamp, to: Timestamp) -> Self {
        Self {
            from,
            to,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.from < 0 {
            return Err(VistatsError::InvalidInput(format!(
                "window start {} is before the epoch",
                self.from
            )));
        }
        if self.from > self.to {
            return Err(VistatsError::InvalidInput(format!(
                "window start {} is after end {}",
                self.from, self.to
            )));
        }
        Ok(())
    }
}

/// Session and pageview time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSums {
    pub session_sums: Vec<BucketSum>,
    pub pageview_sums: Vec<BucketSum>,
}

/// A count with its change against the previous window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Total {
    pub count: u64,
    pub diff_percent: f64,
}

/// A ratio with its change against the previous window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ratio {
    pub value: f64,
    pub diff_percent: f64,
}

/// One row of a frequency breakdown
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sum {
    pub name: String,
    pub count: u64,
    pub percent: f64,
}

/// Headline metrics and breakdowns of a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub session_total: Total,
    pub pageview_total: Total,
    /// Mean session duration in seconds
    pub avg_session_length: Ratio,
    /// Share of sessions with exactly one pageview
    pub bounce_rate: Ratio,
    pub page_sums: Vec<Sum>,
    pub query_string_sums: Vec<Sum>,
    pub referrer_sums: Vec<Sum>,
    pub hostname_sums: Vec<Sum>,
    pub device_type_sums: Vec<Sum>,
    pub device_os_sums: Vec<Sum>,
    pub browser_name_sums: Vec<Sum>,
    pub browser_version_sums: Vec<Sum>,
    pub browser_language_sums: Vec<Sum>,
    pub pageview_count_sums: Vec<Sum>,
    pub screen_resolution_sums: Vec<Sum>,
    pub window_resolution_sums: Vec<Sum>,
    pub country_code_sums: Vec<Sum>,
    pub city_sums: Vec<Sum>,
    pub as_name_sums: Vec<Sum>,
}

/// A session as listed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    /// Text form of the session key
    pub key: String,
    /// Begin time (ns)
    pub start: Timestamp,
    pub pageview_count: usize,
    #[serde(flatten)]
    pub session: Session,
}

/// A pageview as listed to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageviewData {
    /// Time of the pageview (ns)
    pub time: Timestamp,
    pub path: String,
    pub query_string: String,
}

/// Relative change of `actual` over `previous`; a zero baseline counts as 100%
pub fn growth(actual: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        1.0
    } else {
        actual / previous - 1.0
    }
}

fn is_admitted(filter: Option<&Filter>, joined: &JoinedSession) -> bool {
    filter.map_or(true, |f| {
        f.admits(&joined.session, joined.pageviews.iter().map(|(_, p)| p))
    })
}

/// Session and pageview counts per time bucket
pub fn get_bucket_sums(store: &ShardedStore, input: &QueryInput) -> Result<BucketSums> {
    input.validate()?;
    let bucket = BucketType::parse(&input.bucket);
    let filter = Filter::from_map(&input.filter);

    let mut sessions = BucketGen::new(bucket, input.from, input.to, &input.timezone);
    let mut pageviews = BucketGen::new(bucket, input.from, input.to, &input.timezone);

    for joined in SessionJoin::new(store, scan_start(input.from), input.to)? {
        let joined = joined?;
        if !is_admitted(filter.as_ref(), &joined) {
            continue;
        }
        sessions.add(joined.begin);
        for (t, _) in &joined.pageviews {
            pageviews.add(*t);
        }
    }

    Ok(BucketSums {
        session_sums: sessions.close(),
        pageview_sums: pageviews.close(),
    })
}

#[derive(Debug, Default)]
struct Tally {
    sessions: u64,
    pageviews: u64,
    duration_sum: i64,
    bounces: u64,
}

impl Tally {
    fn avg_session_length(&self) -> f64 {
        if self.sessions == 0 {
            0.0
        } else {
            self.duration_sum as f64 / self.sessions as f64
        }
    }

    fn bounce_rate(&self) -> f64 {
        if self.sessions == 0 {
            0.0
        } else {
            self.bounces as f64 / self.sessions as f64
        }
    }
}

#[derive(Debug, Default)]
struct Breakdowns {
    session: HashMap<SessionField, HashMap<String, u64>>,
    pageview: HashMap<PageviewField, HashMap<String, u64>>,
    pageview_counts: HashMap<String, u64>,
}

impl Breakdowns {
    fn add_session(&mut self, session: &Session, pageview_count: usize) {
        for field in SessionField::ALL {
            *self
                .session
                .entry(field)
                .or_default()
                .entry(field.get(session).to_string())
                .or_default() += 1;
        }
        *self
            .pageview_counts
            .entry(pageview_count.to_string())
            .or_default() += 1;
    }

    fn add_pageview(&mut self, pageview: &Pageview) {
        for field in [PageviewField::Path, PageviewField::QueryString] {
            *self
                .pageview
                .entry(field)
                .or_default()
                .entry(field.get(pageview).to_string())
                .or_default() += 1;
        }
    }

    fn session_sums(&mut self, field: SessionField) -> Vec<Sum> {
        sums(self.session.remove(&field).unwrap_or_default())
    }

    fn pageview_sums(&mut self, field: PageviewField) -> Vec<Sum> {
        sums(self.pageview.remove(&field).unwrap_or_default())
    }
}

/// Breakdown rows sorted by count descending, then name
fn sums(counts: HashMap<String, u64>) -> Vec<Sum> {
    let total: u64 = counts.values().sum();
    let mut out: Vec<Sum> = counts
        .into_iter()
        .map(|(name, count)| Sum {
            name,
            count,
            percent: if total == 0 {
                0.0
            } else {
                count as f64 / total as f64
            },
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    out
}

/// First session begin that can own a pageview at or after `from`
fn scan_start(from: Timestamp) -> Timestamp {
    from.saturating_sub(SESSION_LOOKBACK).max(0)
}

fn in_window(t: Timestamp, from: Timestamp, to: Timestamp) -> bool {
    t >= from && t < to
}

/// Totals, growth against the preceding window, and breakdowns
pub fn get_statistics(store: &ShardedStore, input: &QueryInput) -> Result<Statistics> {
    input.validate()?;
    let filter = Filter::from_map(&input.filter);
    let (from, to) = (input.from, input.to);
    let prev_from = from.saturating_sub(to.saturating_sub(from));

    let mut current = Tally::default();
    let mut previous = Tally::default();
    let mut breakdowns = Breakdowns::default();

    // one walk covers the previous window, the current one and the lookback
    for joined in SessionJoin::new(store, scan_start(prev_from), to)? {
        let joined = joined?;
        if !is_admitted(filter.as_ref(), &joined) {
            continue;
        }

        let pageview_count = joined.pageview_count();
        if in_window(joined.begin, from, to) {
            current.sessions += 1;
            current.duration_sum += i64::from(joined.session.duration);
            if pageview_count == 1 {
                current.bounces += 1;
            }
            breakdowns.add_session(&joined.session, pageview_count);
        } else if in_window(joined.begin, prev_from, from) {
            previous.sessions += 1;
            previous.duration_sum += i64::from(joined.session.duration);
            if pageview_count == 1 {
                previous.bounces += 1;
            }
        }

        for (t, pageview) in &joined.pageviews {
            if in_window(*t, from, to) {
                current.pageviews += 1;
                breakdowns.add_pageview(pageview);
            } else if in_window(*t, prev_from, from) {
                previous.pageviews += 1;
            }
        }
    }

    debug!(
        "Statistics over [{}, {}): {} sessions, {} pageviews",
        from, to, current.sessions, current.pageviews
    );

    Ok(Statistics {
        session_total: Total {
            count: current.sessions,
            diff_percent: growth(current.sessions as f64, previous.sessions as f64),
        },
        pageview_total: Total {
            count: current.pageviews,
            diff_percent: growth(current.pageviews as f64, previous.pageviews as f64),
        },
        avg_session_length: Ratio {
            value: current.avg_session_length(),
            diff_percent: growth(current.avg_session_length(), previous.avg_session_length()),
        },
        bounce_rate: Ratio {
            value: current.bounce_rate(),
            diff_percent: growth(current.bounce_rate(), previous.bounce_rate()),
        },
        page_sums: breakdowns.pageview_sums(PageviewField::Path),
        query_string_sums: breakdowns.pageview_sums(PageviewField::QueryString),
        referrer_sums: breakdowns.session_sums(SessionField::Referrer),
        hostname_sums: breakdowns.session_sums(SessionField::Hostname),
        device_type_sums: breakdowns.session_sums(SessionField::DeviceType),
        device_os_sums: breakdowns.session_sums(SessionField::DeviceOs),
        browser_name_sums: breakdowns.session_sums(SessionField::BrowserName),
        browser_version_sums: breakdowns.session_sums(SessionField::BrowserVersion),
        browser_language_sums: breakdowns.session_sums(SessionField::BrowserLanguage),
        pageview_count_sums: sums(std::mem::take(&mut breakdowns.pageview_counts)),
        screen_resolution_sums: breakdowns.session_sums(SessionField::ScreenResolution),
        window_resolution_sums: breakdowns.session_sums(SessionField::WindowResolution),
        country_code_sums: breakdowns.session_sums(SessionField::CountryCode),
        city_sums: breakdowns.session_sums(SessionField::City),
        as_name_sums: breakdowns.session_sums(SessionField::AsName),
    })
}

/// Admitted sessions begun inside the window, in begin order
pub fn get_sessions(store: &ShardedStore, input: &QueryInput) -> Result<Vec<SessionData>> {
    input.validate()?;
    let filter = Filter::from_map(&input.filter);
    let mut out = Vec::new();
    for joined in SessionJoin::new(store, input.from, input.to)? {
        let joined = joined?;
        if !is_admitted(filter.as_ref(), &joined) {
            continue;
        }
        out.push(SessionData {
            key: encode_session_key(&joined.key),
            start: joined.begin,
            pageview_count: joined.pageview_count(),
            session: joined.session,
        });
    }
    Ok(out)
}

/// Every pageview of one session, in time order
pub fn get_pageviews(store: &ShardedStore, session_key: &[u8]) -> Result<Vec<PageviewData>> {
    let mut out = Vec::new();
    store.iterate_prefix(Pageview::BUCKET, session_key, |k, v| {
        let time = match decode_pageview_time(k) {
            Ok(t) => t,
            Err(e) => {
                warn!("Skipping pageview with bad key {:?}: {}", k, e);
                return Ok(());
            }
        };
        match Pageview::decode(v) {
            Ok(pageview) => out.push(PageviewData {
                time,
                path: pageview.path,
                query_string: pageview.query_string,
            }),
            Err(e) => warn!("Skipping undecodable pageview {:?}: {}", k, e),
        }
        Ok(())
    })?;
    Ok(out)
}

/// One stored session
pub fn get_session(store: &ShardedStore, session_key: &[u8]) -> Result<Session> {
    Session::decode(&store.get(Session::BUCKET, session_key)?)
}
