//! sea-orm backed thing/relation store, query engine and hard cache.

mod compile;
pub mod config;
pub mod datastore;
mod db;
pub mod engine;
pub mod hardcache;
mod query;
pub mod registry;
pub mod router;
pub mod schema;
pub mod store;
pub mod transaction;

pub use tdb_core::*;

pub use config::{
    CategorySpec, DatabaseConfig, EngineConfig, HardCacheConfig, PoolConfig, RelationTypeConfig,
    TdbConfig, ThingTypeConfig,
};
pub use datastore::{datastore_path, default_sqlite_path, load_or_init_config, open_hardcache, open_store};
pub use engine::{Engine, EngineManager};
pub use hardcache::HardCacheBackend;
pub use registry::{RelType, ThingType, TypeRegistry};
pub use router::{Action, Router};
pub use store::ThingStore;
pub use transaction::{RequestContext, TransactionSet};
