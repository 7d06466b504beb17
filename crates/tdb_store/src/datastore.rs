use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{HardCacheBackend, NoopSink, SharedSink, TdbConfig, TdbResult, ThingStore};

const DEFAULT_DB_NAME: &str = "tdb.sqlite";

pub fn load_or_init_config(base: &Path) -> TdbResult<TdbConfig> {
    let default_sqlite = base.join(DEFAULT_DB_NAME);
    TdbConfig::load_or_init(base, &default_sqlite)
}

pub async fn open_store(base: &Path) -> TdbResult<ThingStore> {
    let config = load_or_init_config(base)?;
    ThingStore::connect(&config, base).await
}

/// A hard cache over an already booted store's engines.
pub fn open_hardcache(
    base: &Path,
    store: &ThingStore,
    sink: Option<SharedSink>,
) -> TdbResult<HardCacheBackend> {
    let config = load_or_init_config(base)?;
    HardCacheBackend::build(
        &config,
        store.engines(),
        store.clock().clone(),
        sink.unwrap_or_else(|| Arc::new(NoopSink)),
    )
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}

/// Where the default engine keeps its file, resolved against `base`.
pub fn datastore_path(base: &Path, config: &TdbConfig) -> TdbResult<PathBuf> {
    config.engine(crate::config::DEFAULT_ENGINE)?.sqlite_path(base)
}

#[cfg(test)]
mod tests {
    use super::{datastore_path, default_sqlite_path, load_or_init_config, open_hardcache, open_store};
    use tempfile::tempdir;

    #[tokio::test]
    async fn opens_store_with_default_config() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path();
        let config = load_or_init_config(base).expect("config");
        assert_eq!(config.engine("main").expect("engine").backend_name(), "sqlite");
        let store = open_store(base).await.expect("open store");
        let path = default_sqlite_path(base);
        assert!(path.exists());
        assert_eq!(datastore_path(base, &config).expect("path"), path);
        open_hardcache(base, &store, None).expect("hard cache");
    }
}
