use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tdb_store::hardcache::{COUNT_CATEGORY, profile_period};
use tdb_store::{
    AttrValue, ErrorKind, Expiration, FixedClock, HardCacheApi, HardCacheBackend,
    HardCacheConfig, NoopSink, SharedClock, TdbConfig, TdbResult, ThingStore, Timestamp,
};
use tempfile::tempdir;

const START: i64 = 1_700_000_000;

fn config(base: &Path) -> TdbConfig {
    let mut config = TdbConfig::default_sqlite(base.join("tdb.sqlite").to_string_lossy());
    config.hardcache = Some(HardCacheConfig {
        categories: vec!["*:main".to_string(), "ratelimit:main:!profile".to_string()],
    });
    config
}

async fn open(base: &Path) -> TdbResult<(HardCacheBackend, Arc<FixedClock>)> {
    let clock = Arc::new(FixedClock::new(Timestamp::from_seconds(START)));
    let shared: SharedClock = clock.clone();
    let config = config(base);
    let store = ThingStore::connect_with(&config, base, shared.clone()).await?;
    let cache = HardCacheBackend::build(&config, store.engines(), shared, Arc::new(NoopSink))?;
    Ok((cache, clock))
}

#[tokio::test]
async fn entries_expire_on_the_cache_clock() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let (cache, clock) = open(dir.path()).await?;

    HardCacheApi::set(&cache, "session-abc", AttrValue::from("alive"), 5).await?;
    clock.advance(Duration::from_secs(4));
    assert_eq!(
        HardCacheApi::get(&cache, "session-abc").await?,
        Some(AttrValue::from("alive"))
    );

    clock.set(Timestamp::from_seconds(START + 6));
    assert_eq!(HardCacheApi::get(&cache, "session-abc").await?, None);
    assert_eq!(HardCacheApi::get_master(&cache, "session-abc").await?, None);
    Ok(())
}

#[tokio::test]
async fn set_rejects_non_positive_ttl() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let (cache, _) = open(dir.path()).await?;
    let err = HardCacheApi::set(&cache, "session-abc", AttrValue::Int(1), 0)
        .await
        .expect_err("ttl");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = HardCacheApi::get(&cache, "nodash").await.expect_err("key");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    Ok(())
}

#[tokio::test]
async fn add_keeps_the_existing_value() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let (cache, clock) = open(dir.path()).await?;

    let first = HardCacheApi::add(&cache, "lock-job", AttrValue::from("worker-1"), 10).await?;
    assert_eq!(first, AttrValue::from("worker-1"));
    let second = HardCacheApi::add(&cache, "lock-job", AttrValue::from("worker-2"), 10).await?;
    assert_eq!(second, AttrValue::from("worker-1"));

    // Once the holder expires the next add wins.
    clock.advance(Duration::from_secs(11));
    let third = HardCacheApi::add(&cache, "lock-job", AttrValue::from("worker-3"), 10).await?;
    assert_eq!(third, AttrValue::from("worker-3"));
    Ok(())
}

#[tokio::test]
async fn incr_requires_an_integer_entry() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let (cache, clock) = open(dir.path()).await?;

    let err = HardCacheApi::incr(&cache, "hits-home", 1)
        .await
        .expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::CacheValue);

    HardCacheApi::set(&cache, "hits-home", AttrValue::Int(1), 60).await?;
    assert_eq!(HardCacheApi::incr(&cache, "hits-home", 2).await?, Some(3));
    assert_eq!(
        cache.incr("hits", "home", -1, Some(120)).await?,
        Some(2)
    );
    // The refreshed ttl keeps the entry alive past its original expiration.
    clock.advance(Duration::from_secs(90));
    assert_eq!(
        HardCacheApi::get(&cache, "hits-home").await?,
        Some(AttrValue::Int(2))
    );

    HardCacheApi::set(&cache, "hits-name", AttrValue::from("home"), 60).await?;
    let err = HardCacheApi::incr(&cache, "hits-name", 1)
        .await
        .expect_err("string");
    assert_eq!(err.kind(), ErrorKind::CacheValue);
    Ok(())
}

#[tokio::test]
async fn get_multi_spans_categories() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let (cache, _) = open(dir.path()).await?;

    HardCacheApi::set(&cache, "user-1", AttrValue::from("alice"), 60).await?;
    HardCacheApi::set(&cache, "user-2", AttrValue::from("bob"), 60).await?;
    HardCacheApi::set(&cache, "ratelimit-10.0.0.1", AttrValue::Int(4), 60).await?;

    let found =
        HardCacheApi::get_multi(&cache, &["user-1", "user-2", "user-3", "ratelimit-10.0.0.1"])
            .await?;
    assert_eq!(found.len(), 3);
    assert_eq!(found["user-2"], AttrValue::from("bob"));
    assert_eq!(found["ratelimit-10.0.0.1"], AttrValue::Int(4));
    assert!(!found.contains_key("user-3"));

    HardCacheApi::delete(&cache, "user-1").await?;
    assert_eq!(HardCacheApi::get(&cache, "user-1").await?, None);

    let mut ids = cache.ids_by_category("user", None).await?;
    ids.sort();
    assert_eq!(ids, vec!["2".to_string()]);
    Ok(())
}

#[tokio::test]
async fn sweeper_removes_expired_rows_in_batches() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let (cache, clock) = open(dir.path()).await?;

    for n in 0..5 {
        cache
            .set("temp", &n.to_string(), &AttrValue::Int(n), 5)
            .await?;
    }
    cache.set("keep", "x", &AttrValue::Int(1), 600).await?;

    assert_eq!(cache.delete_expired(Expiration::Now, 2).await?, 0);
    clock.advance(Duration::from_secs(10));

    let engine = cache_engine(dir.path()).await?;
    assert_eq!(cache.expired(&engine, Expiration::Now, 100).await?.len(), 5);
    assert_eq!(cache.delete_expired(Expiration::Now, 2).await?, 5);
    assert!(cache.expired(&engine, Expiration::Now, 100).await?.is_empty());
    assert_eq!(cache.get("keep", "x").await?, Some(AttrValue::Int(1)));

    let err = cache
        .delete_expired(Expiration::Now, 0)
        .await
        .expect_err("batch");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    Ok(())
}

async fn cache_engine(base: &Path) -> TdbResult<Arc<tdb_store::Engine>> {
    let store = ThingStore::connect(&config(base), base).await?;
    store.engines().get("main")
}

#[tokio::test]
async fn profiled_categories_record_counts() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let (cache, _) = open(dir.path()).await?;

    cache
        .set("ratelimit", "10.0.0.1", &AttrValue::Int(1), 60)
        .await?;
    cache.get("ratelimit", "10.0.0.1").await?;
    cache.get("ratelimit", "10.0.0.1").await?;
    cache.set("user", "1", &AttrValue::Int(1), 60).await?;

    let period = profile_period(Timestamp::from_seconds(START))?;
    let gets = cache
        .get_master(COUNT_CATEGORY, &format!("get-ratelimit-{period}"))
        .await?;
    assert_eq!(gets, Some(AttrValue::Int(2)));
    let sets = cache
        .get_master(COUNT_CATEGORY, &format!("set-ratelimit-{period}"))
        .await?;
    assert_eq!(sets, Some(AttrValue::Int(1)));
    let unprofiled = cache
        .get_master(COUNT_CATEGORY, &format!("set-user-{period}"))
        .await?;
    assert_eq!(unprofiled, None);
    Ok(())
}

#[tokio::test]
async fn reads_skip_dead_replicas() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let base = dir.path();
    let mut config = TdbConfig::default_sqlite(base.join("main.sqlite").to_string_lossy());
    config.engines.insert(
        "replica".to_string(),
        tdb_store::EngineConfig::sqlite(base.join("replica.sqlite").to_string_lossy()),
    );
    config.hardcache = Some(HardCacheConfig {
        categories: vec!["*:main:replica".to_string()],
    });
    config.read_seed = Some(11);
    let clock: SharedClock = Arc::new(FixedClock::new(Timestamp::from_seconds(START)));
    let store = ThingStore::connect_with(&config, base, clock.clone()).await?;
    let cache = HardCacheBackend::build(&config, store.engines(), clock, Arc::new(NoopSink))?;

    HardCacheApi::set(&cache, "session-abc", AttrValue::from("alive"), 60).await?;
    // Nothing replicates, so a replica read cannot see the entry.
    assert_eq!(HardCacheApi::get(&cache, "session-abc").await?, None);

    store.engines().mark_dead("replica");
    for _ in 0..8 {
        assert_eq!(
            HardCacheApi::get(&cache, "session-abc").await?,
            Some(AttrValue::from("alive"))
        );
    }
    Ok(())
}
