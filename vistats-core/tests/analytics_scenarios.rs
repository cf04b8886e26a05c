use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use vistats_core::analytics::QueryInput;
use vistats_core::keys::to_nanos;
use vistats_core::storage::{
    ClientInfo, CollectionStore, CreatePageviewInput, CreateSessionInput, StorageConfig,
    StorageEngine,
};
use vistats_core::store::Record;
use vistats_core::{Session, Timestamp, VistatsError};

const MINUTE: i64 = 60_000_000_000;
const DAY: i64 = 24 * 60 * MINUTE;

fn engine(dir: &TempDir) -> StorageEngine {
    StorageEngine::new(StorageConfig {
        data_dir: dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap()
}

fn collection(engine: &StorageEngine) -> (String, Arc<CollectionStore>) {
    let collection = engine.create_collection(1, "example.org").unwrap();
    let store = engine.collection_store(&collection.id).unwrap();
    (collection.id, store)
}

fn day(d: u32) -> Timestamp {
    to_nanos(Utc.with_ymd_and_hms(2024, 5, d, 0, 0, 0).unwrap())
}

fn session_input(collection_id: &str, device_type: &str) -> CreateSessionInput {
    CreateSessionInput {
        collection_id: collection_id.to_string(),
        hostname: "example.org".into(),
        device_type: device_type.into(),
        ..Default::default()
    }
}

#[test]
fn page_filter_selects_matching_session() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let (id, store) = collection(&engine);
    let client = ClientInfo::default();

    let begin = day(6) + 10 * 60 * MINUTE;
    let matching = store
        .create_session_at(&client, &session_input(&id, "desktop"), begin)
        .unwrap();
    store.create_pageview_at(&matching, "dl", begin + MINUTE).unwrap();

    let other = store
        .create_session_at(&client, &session_input(&id, "mobile"), begin + 5 * MINUTE)
        .unwrap();
    store.create_pageview_at(&other, "hdl", begin + 6 * MINUTE).unwrap();
    store.create_pageview_at(&other, "ld?q=22222", begin + 7 * MINUTE).unwrap();

    let third = store
        .create_session_at(&client, &session_input(&id, "tablet"), begin + 10 * MINUTE)
        .unwrap();
    store
        .create_pageview_at(&third, "ndl;matrixnotation=true", begin + 11 * MINUTE)
        .unwrap();

    let mut filter = HashMap::new();
    filter.insert("page".to_string(), "dl".to_string());
    let input = QueryInput {
        from: day(6),
        to: day(7),
        filter,
        ..Default::default()
    };

    let sessions = engine.get_sessions(&id, &input).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].key, matching);
    assert_eq!(sessions[0].session.device_type, "desktop");
    assert_eq!(sessions[0].pageview_count, 1);

    let pageviews = engine.get_pageviews(&id, &sessions[0].key).unwrap();
    assert_eq!(pageviews.len(), 1);
    assert_eq!(pageviews[0].path, "dl");

    let stats = engine.get_statistics(&id, &input).unwrap();
    assert_eq!(stats.session_total.count, 1);
    assert_eq!(stats.pageview_total.count, 1);
    assert_eq!(stats.device_type_sums.len(), 1);
    assert_eq!(stats.device_type_sums[0].name, "desktop");

    let unfiltered = engine
        .get_statistics(&id, &QueryInput::window(day(6), day(7)))
        .unwrap();
    assert_eq!(unfiltered.session_total.count, 3);
    assert_eq!(unfiltered.pageview_total.count, 4);
}

#[test]
fn seeded_week_end_to_end() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let (id, _) = collection(&engine);

    let (from, to) = (day(1), day(8));
    assert_eq!(engine.seed(&id, from, to, 100).unwrap(), 100);

    let input = QueryInput {
        from,
        to,
        bucket: "day".into(),
        ..Default::default()
    };
    let sums = engine.get_bucket_sums(&id, &input).unwrap();
    assert_eq!(sums.session_sums.len(), 7);
    assert_eq!(sums.pageview_sums.len(), 7);
    assert_eq!(sums.session_sums.iter().map(|b| b.count).sum::<u64>(), 100);
    // ten rounds of 1..=10 pageviews
    assert_eq!(sums.pageview_sums.iter().map(|b| b.count).sum::<u64>(), 550);
    assert_eq!(sums.session_sums[0].bucket, from / 1_000_000_000);

    let stats = engine.get_statistics(&id, &input).unwrap();
    assert_eq!(stats.session_total.count, 100);
    assert_eq!(stats.pageview_total.count, 550);
    assert_eq!(stats.session_total.diff_percent, 1.0);
    assert!((stats.bounce_rate.value - 0.1).abs() < 1e-9);
    assert_eq!(stats.hostname_sums[0].name, "example.org");
    assert_eq!(stats.hostname_sums[0].count, 100);

    let sessions = engine.get_sessions(&id, &input).unwrap();
    assert_eq!(sessions.len(), 100);
    assert!(sessions.windows(2).all(|w| w[0].start <= w[1].start));
}

#[test]
fn lookback_pageviews_and_previous_window_growth() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let (id, store) = collection(&engine);
    let client = ClientInfo::default();
    let hour = 60 * MINUTE;
    let (prev_from, from, to) = (day(9), day(10), day(11));

    // previous window: one bounce, one session spilling over midnight
    let bounced = store
        .create_session_at(&client, &session_input(&id, "desktop"), prev_from + hour)
        .unwrap();
    store.create_pageview_at(&bounced, "dl", prev_from + hour + MINUTE).unwrap();
    let spilled = store
        .create_session_at(&client, &session_input(&id, "desktop"), from - 30 * MINUTE)
        .unwrap();
    store.create_pageview_at(&spilled, "dl", from - 29 * MINUTE).unwrap();
    store.create_pageview_at(&spilled, "hdl", from + 10 * MINUTE).unwrap();

    // current window: three bounces
    for i in 1..=3 {
        let key = store
            .create_session_at(&client, &session_input(&id, "mobile"), from + i * hour)
            .unwrap();
        store.create_pageview_at(&key, "dl", from + i * hour + MINUTE).unwrap();
    }

    let input = QueryInput {
        from,
        to,
        bucket: "hour".into(),
        ..Default::default()
    };
    let stats = engine.get_statistics(&id, &input).unwrap();
    assert_eq!(stats.session_total.count, 3);
    assert!((stats.session_total.diff_percent - 0.5).abs() < 1e-9);
    // the spilled session's second pageview lands in the current window
    assert_eq!(stats.pageview_total.count, 4);
    assert!((stats.pageview_total.diff_percent - 1.0).abs() < 1e-9);
    assert_eq!(stats.bounce_rate.value, 1.0);
    assert!((stats.bounce_rate.diff_percent - 1.0).abs() < 1e-9);
    let hdl = stats.page_sums.iter().find(|s| s.name == "hdl").unwrap();
    assert_eq!(hdl.count, 1);

    let sums = engine.get_bucket_sums(&id, &input).unwrap();
    assert_eq!(sums.session_sums.iter().map(|b| b.count).sum::<u64>(), 3);
    assert_eq!(sums.pageview_sums.iter().map(|b| b.count).sum::<u64>(), 4);

    // sessions are selected by begin time only
    let sessions = engine.get_sessions(&id, &input).unwrap();
    assert_eq!(sessions.len(), 3);
    assert!(sessions.iter().all(|s| s.key != spilled));
}

#[test]
fn query_window_bounds() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let (id, store) = collection(&engine);
    let t = day(6);
    store
        .create_session_at(&ClientInfo::default(), &session_input(&id, "desktop"), t)
        .unwrap();

    let err = engine
        .get_sessions(&id, &QueryInput::window(-1, t + MINUTE))
        .unwrap_err();
    assert!(matches!(err, VistatsError::InvalidInput(_)));
    assert!(matches!(
        engine.get_statistics(&id, &QueryInput::window(-5_000_000_000_000_000_000, t)),
        Err(VistatsError::InvalidInput(_))
    ));
    assert_eq!(
        engine
            .get_sessions(&id, &QueryInput::window(0, t + MINUTE))
            .unwrap()
            .len(),
        1
    );

    let widest = engine
        .get_statistics(&id, &QueryInput::window(0, Timestamp::MAX))
        .unwrap();
    assert_eq!(widest.session_total.count, 1);
    assert_eq!(widest.session_total.diff_percent, 1.0);
}

#[test]
fn concurrent_ingestion_creates_one_shard() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let (id, store) = collection(&engine);
    let begin = day(3);

    std::thread::scope(|s| {
        for i in 0..8 {
            let store = store.clone();
            let id = id.clone();
            s.spawn(move || {
                store
                    .create_session_at(&ClientInfo::default(), &session_input(&id, "desktop"), begin + i * MINUTE)
                    .unwrap();
            });
        }
    });

    let shards = engine.collection_shards(&id).unwrap();
    assert_eq!(shards.len(), 1);
    assert_eq!(shards[0].id, "2024-05");
    let files = std::fs::read_dir(dir.path().join(&id)).unwrap().count();
    assert_eq!(files, 1);
    assert_eq!(
        engine
            .get_sessions(&id, &QueryInput::window(day(3), day(4)))
            .unwrap()
            .len(),
        8
    );
}

#[test]
fn multi_shard_commit_and_rollback() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let (id, store) = collection(&engine);
    let april = to_nanos(Utc.with_ymd_and_hms(2024, 4, 30, 23, 0, 0).unwrap());
    let may = day(1) + 60 * MINUTE;
    let key_of = |t: Timestamp| vistats_core::keys::session_key(t, 7);

    let value = bincode_session();
    let mut tx = store.shards().begin(true);
    tx.put(Session::BUCKET, &key_of(april), &value).unwrap();
    tx.put(Session::BUCKET, &key_of(may), &value).unwrap();
    tx.rollback().unwrap();
    assert!(store
        .shards()
        .get(Session::BUCKET, &key_of(april))
        .unwrap_err()
        .is_not_found());

    store
        .shards()
        .update(|tx| {
            tx.put(Session::BUCKET, &key_of(april), &value)?;
            tx.put(Session::BUCKET, &key_of(may), &value)
        })
        .unwrap();

    let window = QueryInput::window(april - DAY, may + DAY);
    assert_eq!(engine.get_sessions(&id, &window).unwrap().len(), 2);
    let ids: Vec<String> = engine
        .collection_shards(&id)
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec!["2024-04", "2024-05"]);
}

fn bincode_session() -> Vec<u8> {
    Session {
        hostname: "example.org".into(),
        ..Default::default()
    }
    .encode()
    .unwrap()
}

#[test]
fn unknown_collection_is_not_found() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);

    let err = engine
        .create_pageview(&CreatePageviewInput {
            collection_id: "nope".into(),
            session_key: "AAAAAAAAAAAAAAAA".into(),
            path: "/".into(),
        })
        .unwrap_err();
    assert!(matches!(err, VistatsError::KeyNotExists));
    assert!(engine.collection_shards("nope").unwrap_err().is_not_found());
    assert!(engine.seed("nope", day(1), day(2), 1).unwrap_err().is_not_found());
    assert!(!dir.path().join("nope").exists());

    // unknown session in a known collection
    let (id, _) = collection(&engine);
    let stranger = vistats_core::keys::encode_session_key(&vistats_core::keys::session_key(day(1), 1));
    let err = engine
        .create_pageview(&CreatePageviewInput {
            collection_id: id,
            session_key: stranger,
            path: "/".into(),
        })
        .unwrap_err();
    assert!(err.is_not_found());
}
