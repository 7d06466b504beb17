use std::path::Path;

use tdb_store::{
    AttrMap, AttrValue, NewThing, TdbConfig, TdbResult, ThingApi, ThingStore, ThingTypeConfig,
};
use tempfile::tempdir;

fn config(base: &Path) -> TdbConfig {
    let mut config = TdbConfig::default_sqlite(base.join("tdb.sqlite").to_string_lossy());
    config.things.push(ThingTypeConfig {
        name: "link".to_string(),
        engines: vec!["main".to_string()],
        avoid_master_reads: false,
    });
    config
}

#[tokio::test]
async fn rollback_discards_writes() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = ThingStore::connect(&config(dir.path()), dir.path()).await?;
    let link = store.thing_type_id("link")?;

    let mut ctx = store.new_context();
    ctx.begin();
    let id = store.make_thing(&mut ctx, link, NewThing::default()).await?;
    let mut data = AttrMap::new();
    data.insert("title".to_string(), AttrValue::from("draft"));
    store.set_thing_data(&mut ctx, link, id, true, &data).await?;
    assert_eq!(ctx.transaction().engines().collect::<Vec<_>>(), vec!["main"]);

    // Reads inside the transaction see its own writes.
    assert!(store.get_thing(&mut ctx, link, id).await?.is_some());
    ctx.rollback().await?;
    assert!(!ctx.transaction().is_active());

    let mut fresh = store.new_context();
    assert!(store.get_thing(&mut fresh, link, id).await?.is_none());
    assert!(store.get_thing_data(&mut fresh, link, id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn commit_persists_writes() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = ThingStore::connect(&config(dir.path()), dir.path()).await?;
    let link = store.thing_type_id("link")?;

    let mut ctx = store.new_context();
    ctx.begin();
    let id = store
        .make_thing(
            &mut ctx,
            link,
            NewThing {
                ups: 2,
                ..NewThing::default()
            },
        )
        .await?;
    ctx.commit().await?;
    assert_eq!(ctx.transaction().engines().count(), 0);

    let mut fresh = store.new_context();
    let row = store.get_thing(&mut fresh, link, id).await?.expect("committed");
    assert_eq!(row.ups, 2);
    Ok(())
}

#[tokio::test]
async fn writes_without_begin_autocommit() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = ThingStore::connect(&config(dir.path()), dir.path()).await?;
    let link = store.thing_type_id("link")?;

    let mut ctx = store.new_context();
    let id = store.make_thing(&mut ctx, link, NewThing::default()).await?;
    assert!(!ctx.transaction().is_active());
    ctx.rollback().await?;

    let mut fresh = store.new_context();
    assert!(store.get_thing(&mut fresh, link, id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn attribute_overwrites_keep_the_transaction_usable() -> TdbResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = ThingStore::connect(&config(dir.path()), dir.path()).await?;
    let link = store.thing_type_id("link")?;

    let mut other = store.new_context();
    let id = store.make_thing(&mut other, link, NewThing::default()).await?;
    let mut theirs = AttrMap::new();
    theirs.insert("title".to_string(), AttrValue::from("theirs"));
    store.set_thing_data(&mut other, link, id, false, &theirs).await?;

    let mut ctx = store.new_context();
    ctx.begin();
    let mut ours = AttrMap::new();
    ours.insert("title".to_string(), AttrValue::from("ours"));
    ours.insert("url".to_string(), AttrValue::from("https://example.com"));
    store.set_thing_data(&mut ctx, link, id, false, &ours).await?;
    store.incr_thing_data(&mut ctx, link, id, "clicks", 2.0).await?;
    store.incr_thing_data(&mut ctx, link, id, "clicks", 3.0).await?;
    ctx.commit().await?;

    let mut fresh = store.new_context();
    let data = store.get_thing_data(&mut fresh, link, id).await?;
    assert_eq!(data["title"], AttrValue::from("ours"));
    assert_eq!(data["url"], AttrValue::from("https://example.com"));
    assert_eq!(data.get("clicks").and_then(AttrValue::as_f64), Some(5.0));
    Ok(())
}
