//! Synthetic data for demos and benchmarks

use crate::keys::{pageview_key, session_key};
use crate::shard::ShardedStore;
use crate::storage::split_path;
use crate::store::Record;
use crate::{Collection, Pageview, Result, Session, Timestamp, VistatsError};
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Instant;
use tracing::info;

const NANOS_PER_MINUTE: i64 = 60_000_000_000;

// (user agent, browser name, browser version, device os)
const AGENTS: &[(&str, &str, &str, &str)] = &[
    (
        "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:56.0) Gecko/20100101 Firefox/56.0",
        "Firefox",
        "56.0",
        "Linux x86_64",
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/61.0.3163.100 Safari/537.36",
        "Chrome",
        "61.0.3163.100",
        "Windows 10",
    ),
    (
        "Mozilla/5.0 (Windows NT 6.3; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/37.0.2049.0 Safari/537.36",
        "Chrome",
        "37.0.2049.0",
        "Windows 8.1",
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_12_3) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/56.0.2924.87 Safari/537.36",
        "Chrome",
        "56.0.2924.87",
        "Intel Mac OS X 10_12_3",
    ),
];

// (country code, city, AS number, AS name)
const LOCATIONS: &[(&str, &str, i32, &str)] = &[
    ("HU", "Budapest", 20845, "DIGI Tavkozlesi es Szolgaltato Kft."),
    ("HU", "Debrecen", 5483, "Magyar Telekom plc."),
    ("NL", "Amsterdam", 1136, "KPN B.V."),
    ("DE", "Berlin", 3320, "Deutsche Telekom AG"),
];

const DEVICE_TYPES: &[&str] = &["mobile", "desktop", "tablet"];

const BROWSER_LANGUAGES: &[&str] = &["en-US", "en-US", "nl-NL", "fr-FR", "de-DE", "es-ES", "hu-HU"];

const RESOLUTIONS: &[&str] = &["2560x1440", "1920x1080", "1920x1080", "360x640"];

const URLS: &[&str] = &["dl", "ld?q=22222", "ndl;matrixnotation=true", "hdl"];

const REFERRERS: &[&str] = &[
    "https://google.com",
    "https://google.com/?q=longlonglonglonglonglonglonglonglonglonglonglonglonglonglonglonglonglonglonglsearch",
    "https://yahoo.com",
    "https://bing.com",
    "https://wikipedia.org",
];

const USER_HOSTNAMES: &[&str] = &[
    "localhost",
    "catv-176-63-166-75.catv.broadband.hu.",
    "telekom.hu",
    "digi.hu",
];

fn pick<'a, R: Rng>(rng: &mut R, list: &[&'a str]) -> &'a str {
    list.choose(rng).copied().unwrap_or_default()
}

/// Write `n` synthetic sessions spread evenly over `[from, to)`
///
/// Session `i` gets `i % 10 + 1` pageviews one minute apart. Everything is
/// written in one multi-shard transaction. Returns the number of sessions.
pub fn seed(
    store: &ShardedStore,
    collection: &Collection,
    from: Timestamp,
    to: Timestamp,
    n: usize,
) -> Result<usize> {
    if from >= to {
        return Err(VistatsError::InvalidInput(format!(
            "seed window start {} is not before end {}",
            from, to
        )));
    }
    if n == 0 {
        return Ok(0);
    }

    info!("Seeding {} with {} sessions", collection.name, n);
    let started = Instant::now();
    let mut rng = rand::thread_rng();
    let span = i128::from(to - from);

    store.update(|tx| {
        for i in 0..n {
            let offset = (span * i as i128 / n as i128) as i64;
            let begin = from + offset;

            let (user_agent, browser_name, browser_version, device_os) =
                AGENTS[rng.gen_range(0..AGENTS.len())];
            let (country_code, city, as_number, as_name) =
                LOCATIONS[rng.gen_range(0..LOCATIONS.len())];
            let session = Session {
                duration: rng.gen_range(0..7200),
                hostname: collection.name.clone(),
                device_os: device_os.to_string(),
                browser_name: browser_name.to_string(),
                browser_version: browser_version.to_string(),
                browser_language: pick(&mut rng, BROWSER_LANGUAGES).to_string(),
                screen_resolution: pick(&mut rng, RESOLUTIONS).to_string(),
                window_resolution: pick(&mut rng, RESOLUTIONS).to_string(),
                device_type: pick(&mut rng, DEVICE_TYPES).to_string(),
                country_code: country_code.to_string(),
                city: city.to_string(),
                user_agent: user_agent.to_string(),
                user_ip: format!("95.85.{}.{}", rng.gen_range(1..254), rng.gen_range(1..254)),
                user_hostname: pick(&mut rng, USER_HOSTNAMES).to_string(),
                referrer: pick(&mut rng, REFERRERS).to_string(),
                as_number,
                as_name: as_name.to_string(),
            };
            let key = session_key(begin, rng.gen());
            tx.put(Session::BUCKET, &key, &session.encode()?)?;

            for j in 0..(i % 10 + 1) {
                let (path, query_string) = split_path(pick(&mut rng, URLS));
                let pageview = Pageview {
                    path: path.to_string(),
                    query_string: query_string.to_string(),
                };
                let at = begin + j as i64 * NANOS_PER_MINUTE;
                tx.put(Pageview::BUCKET, &pageview_key(&key, at), &pageview.encode()?)?;
            }
        }
        Ok(())
    })?;

    info!("Seeded {} sessions in {:?}", n, started.elapsed());
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{month_shard_id, to_nanos};
    use crate::shard::ShardOptions;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn collection() -> Collection {
        Collection {
            id: "c1".into(),
            name: "example.org".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_seed_spreads_sessions() {
        let dir = TempDir::new().unwrap();
        let store = ShardedStore::open(dir.path(), Arc::new(month_shard_id), ShardOptions::default()).unwrap();
        let from = to_nanos(Utc.with_ymd_and_hms(2024, 3, 20, 0, 0, 0).unwrap());
        let to = to_nanos(Utc.with_ymd_and_hms(2024, 4, 10, 0, 0, 0).unwrap());

        assert_eq!(seed(&store, &collection(), from, to, 20).unwrap(), 20);

        assert_eq!(store.shard_ids(), vec!["2024-03", "2024-04"]);
        assert_eq!(store.count_prefix(Session::BUCKET, &[]).unwrap(), 20);
        // two rounds of 1..=10 pageviews
        assert_eq!(store.count_prefix(Pageview::BUCKET, &[]).unwrap(), 110);

        let mut hosts = 0;
        store
            .iterate(Session::BUCKET, &from.to_be_bytes(), &to.to_be_bytes(), |_, v| {
                assert_eq!(Session::decode(v)?.hostname, "example.org");
                hosts += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(hosts, 20);
    }

    #[test]
    fn test_seed_rejects_empty_window() {
        let dir = TempDir::new().unwrap();
        let store = ShardedStore::open(dir.path(), Arc::new(month_shard_id), ShardOptions::default()).unwrap();
        assert!(seed(&store, &collection(), 10, 10, 5).is_err());
        assert_eq!(seed(&store, &collection(), 0, 10, 0).unwrap(), 0);
        assert!(store.shard_ids().is_empty());
    }
}
