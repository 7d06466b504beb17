use serde_json::json;
use tdb_store::{DatabaseConfig, ErrorKind, PoolConfig, TdbConfig, load_or_init_config};
use tempfile::tempdir;

#[test]
fn deserializes_engines_with_pool_settings() {
    let payload = json!({
        "app_name": "reddit",
        "engines": {
            "main": {
                "database": { "backend": "sqlite", "path": "data.sqlite" },
                "pool": {
                    "max_connections": 20,
                    "min_connections": 2,
                    "connect_timeout_ms": 1000,
                    "acquire_timeout_ms": 500,
                    "idle_timeout_ms": 60000
                }
            },
            "replica": {
                "database": { "backend": "postgres", "url": "postgres://r/db" }
            }
        },
        "type_db": "main",
        "rel_type_db": "main",
        "things": [{ "name": "link", "engines": ["main", "replica"], "avoid_master_reads": true }],
        "hardcache": { "categories": ["*:main", "ratelimit:main:replica:!profile"] }
    });
    let config: TdbConfig = serde_json::from_value(payload).expect("config");
    config.validate().expect("valid");
    assert_eq!(config.max_val_len, 1000);
    assert!(config.create_tables);
    assert!(!config.require_db);

    let main = config.engine("main").expect("main");
    match &main.database {
        DatabaseConfig::Sqlite { path } => assert_eq!(path.as_deref(), Some("data.sqlite")),
        _ => panic!("expected sqlite backend"),
    }
    let pool = main.pool.as_ref().expect("pool");
    assert_eq!(pool.max_connections, Some(20));
    assert_eq!(pool.min_connections, Some(2));
    assert_eq!(pool.connect_timeout_ms, Some(1000));
    assert_eq!(pool.acquire_timeout_ms, Some(500));
    assert_eq!(pool.idle_timeout_ms, Some(60000));
    assert!(config.engine("replica").expect("replica").pool.is_none());

    let categories = config.hardcache_categories().expect("parse").expect("categories");
    let ratelimit = categories
        .iter()
        .find(|spec| spec.category == "ratelimit")
        .expect("ratelimit");
    assert_eq!(ratelimit.engines, vec!["main", "replica"]);
    assert!(ratelimit.profile);
}

#[test]
fn default_sqlite_sets_no_pool() {
    let config = TdbConfig::default_sqlite("tdb.sqlite");
    let main = config.engine("main").expect("main");
    assert!(matches!(main.database, DatabaseConfig::Sqlite { .. }));
    assert!(main.pool.is_none());
    config.validate().expect("valid");
}

#[test]
fn pool_config_roundtrip() {
    let mut config = TdbConfig::default_sqlite("tdb.sqlite");
    if let Some(main) = config.engines.get_mut("main") {
        main.pool = Some(PoolConfig {
            max_connections: Some(5),
            acquire_timeout_ms: Some(2000),
            ..PoolConfig::default()
        });
    }
    let encoded = serde_json::to_string(&config).expect("encode");
    let decoded: TdbConfig = serde_json::from_str(&encoded).expect("decode");
    let pool = decoded.engines["main"].pool.clone().expect("pool");
    assert_eq!(pool.acquire_timeout_ms, Some(2000));
    assert_eq!(pool.max_connections, Some(5));
}

#[test]
fn relation_endpoints_must_be_declared() {
    let payload = json!({
        "engines": { "main": { "database": { "backend": "sqlite" } } },
        "type_db": "main",
        "rel_type_db": "main",
        "things": [{ "name": "account", "engines": ["main"] }],
        "relations": [{ "name": "vote", "type1": "account", "type2": "link", "engines": ["main"] }]
    });
    let config: TdbConfig = serde_json::from_value(payload).expect("config");
    let err = config.validate().expect_err("undeclared endpoint");
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn load_or_init_writes_default_file() {
    let dir = tempdir().expect("tempdir");
    let config = load_or_init_config(dir.path()).expect("config");
    assert!(dir.path().join("tdb.json").exists());
    let again = load_or_init_config(dir.path()).expect("reload");
    assert_eq!(config.app_name, again.app_name);
    assert_eq!(again.type_db, "main");
}
