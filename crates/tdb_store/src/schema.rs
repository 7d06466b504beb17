//! Idempotent creation of the physical table set. A table is created, and
//! its indexes with it, only when it does not exist yet.

use std::collections::HashSet;

use log::{info, warn};
use sea_orm::sea_query::{Alias, ColumnDef, Index, IndexCreateStatement, Table};
use sea_orm::{ConnectionTrait, DatabaseBackend, DbErr};
use sea_orm_migration::SchemaManager;
use sea_orm_migration::prelude::Iden;

use crate::config::TdbConfig;
use crate::db::{self, DataCol, HardCacheCol, RelCol, RelTypeCol, ThingCol, TypeCol};
use crate::engine::{Engine, EngineManager, is_connection_error};
use crate::registry::{RelTables, ThingTables, TypeRegistry};
use tdb_core::{TdbError, TdbResult};

/// Index prefix for the attribute value on MySQL, which caps key length.
const MYSQL_VALUE_PREFIX: usize = 255;

const PG_FUNCTIONS: &[&str] = &[
    "CREATE OR REPLACE FUNCTION score(ups bigint, downs bigint) RETURNS bigint AS $$ \
     SELECT $1 - $2 $$ LANGUAGE sql IMMUTABLE",
    "CREATE OR REPLACE FUNCTION hot(ups bigint, downs bigint, date bigint) RETURNS numeric AS $$ \
     SELECT round(cast(log(greatest(abs($1 - $2), 1)) * sign($1 - $2) \
     + ($3 / 1000000.0 - 1134028003) / 45000.0 AS numeric), 7) $$ LANGUAGE sql IMMUTABLE",
    "CREATE OR REPLACE FUNCTION controversy(ups bigint, downs bigint) RETURNS float AS $$ \
     SELECT CASE WHEN $1 <= 0 OR $2 <= 0 THEN 0 \
     ELSE power(($1 + $2)::float, greatest($1, $2)::float / least($1, $2)) END \
     $$ LANGUAGE sql IMMUTABLE",
    "CREATE OR REPLACE FUNCTION ip_network(ip text) RETURNS text AS $$ \
     SELECT substring($1 from E'[\\\\d]+\\\\.[\\\\d]+\\\\.[\\\\d]+') $$ LANGUAGE sql IMMUTABLE",
    "CREATE OR REPLACE FUNCTION base_url(url text) RETURNS text AS $$ \
     SELECT substring($1 from E'(?i)(?:.+?://)?(?:www[\\\\d]*\\\\.)?([^#]*[^#/])/?') \
     $$ LANGUAGE sql IMMUTABLE",
];

/// SQLite has no `log10`/`pow` in the build sqlx bundles, so its thing
/// tables keep `hot` and `controversy` as columns the writer maintains.
pub(crate) fn stores_ranks(backend: DatabaseBackend) -> bool {
    backend == DatabaseBackend::Sqlite
}

pub fn quote_ident(backend: DatabaseBackend, ident: &str) -> String {
    match backend {
        DatabaseBackend::MySql => format!("`{}`", ident.replace('`', "``")),
        _ => format!("\"{}\"", ident.replace('"', "\"\"")),
    }
}

pub struct SchemaBuilder<'a> {
    config: &'a TdbConfig,
    functions_installed: HashSet<String>,
}

impl<'a> SchemaBuilder<'a> {
    pub fn new(config: &'a TdbConfig) -> Self {
        Self {
            config,
            functions_installed: HashSet::new(),
        }
    }

    /// Create the type tables, then everything the registry names.
    pub async fn build(&mut self, engines: &EngineManager, registry: &TypeRegistry) -> TdbResult<()> {
        if !self.config.create_tables {
            return Ok(());
        }
        for thing in registry.thing_types() {
            for tables in &thing.tables {
                let engine = engines.get(&tables.engine)?;
                self.ensure_thing_tables(&engine, tables).await?;
            }
        }
        for rel in registry.rel_types() {
            for tables in &rel.tables {
                let engine = engines.get(&tables.engine)?;
                self.ensure_rel_tables(&engine, tables).await?;
            }
        }
        if let Some(categories) = self.config.hardcache_categories()? {
            let mut seen = HashSet::new();
            for spec in categories {
                for name in spec.engines {
                    if seen.insert(name.clone()) {
                        let engine = engines.get(&name)?;
                        self.ensure_hardcache_table(&engine).await?;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn ensure_type_tables(&mut self, engines: &EngineManager) -> TdbResult<()> {
        if !self.config.create_tables {
            return Ok(());
        }
        let app = self.config.app_name.as_str();
        let engine = engines.get(&self.config.type_db)?;
        let table = db::type_table(app);
        let result = self.create_type_table(&engine, &table, false).await;
        self.settle(&engine, &table, result)?;

        let engine = engines.get(&self.config.rel_type_db)?;
        let table = db::rel_type_table(app);
        let result = self.create_type_table(&engine, &table, true).await;
        self.settle(&engine, &table, result)
    }

    pub async fn ensure_thing_tables(&mut self, engine: &Engine, tables: &ThingTables) -> TdbResult<()> {
        let result = self.create_thing_table(engine, &tables.thing).await;
        self.settle(engine, &tables.thing, result)?;
        let result = self.create_data_table(engine, &tables.data).await;
        self.settle(engine, &tables.data, result)
    }

    pub async fn ensure_rel_tables(&mut self, engine: &Engine, tables: &RelTables) -> TdbResult<()> {
        let result = self.create_rel_table(engine, &tables.rel).await;
        self.settle(engine, &tables.rel, result)?;
        let result = self.create_data_table(engine, &tables.data).await;
        self.settle(engine, &tables.data, result)
    }

    pub async fn ensure_hardcache_table(&mut self, engine: &Engine) -> TdbResult<()> {
        let table = db::hardcache_table(&self.config.app_name);
        let result = self.create_hardcache_table(engine, &table).await;
        self.settle(engine, &table, result)
    }

    /// Unreachable databases are tolerated unless `require_db` is set.
    fn settle(&self, engine: &Engine, table: &str, result: Result<(), DbErr>) -> TdbResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err) if is_connection_error(&err) && !self.config.require_db => {
                warn!(
                    "engine {} unreachable, skipping creation of {table}: {err}",
                    engine.name()
                );
                engine.mark_dead();
                Ok(())
            }
            Err(err) if is_connection_error(&err) => Err(engine.unavailable(err)),
            Err(err) => Err(TdbError::storage(format!(
                "create {table} on {}: {err}",
                engine.name()
            ))),
        }
    }

    async fn create_type_table(&self, engine: &Engine, table: &str, rel: bool) -> Result<(), DbErr> {
        let manager = SchemaManager::new(engine.connection());
        if manager.has_table(table).await? {
            return Ok(());
        }
        let backend = engine.backend();
        let mut create = Table::create();
        create
            .table(Alias::new(table))
            .col(serial_col(backend, TypeCol::Id))
            .col(ColumnDef::new(TypeCol::Name).string_len(255).not_null());
        if rel {
            create
                .col(ColumnDef::new(RelTypeCol::Type1Id).big_integer().not_null())
                .col(ColumnDef::new(RelTypeCol::Type2Id).big_integer().not_null());
        }
        manager.create_table(create.to_owned()).await?;
        manager
            .create_index(index(table, "name").unique().col(TypeCol::Name).to_owned())
            .await?;
        info!("created {table} on {}", engine.name());
        Ok(())
    }

    async fn create_thing_table(&mut self, engine: &Engine, table: &str) -> Result<(), DbErr> {
        let manager = SchemaManager::new(engine.connection());
        if manager.has_table(table).await? {
            return Ok(());
        }
        let backend = engine.backend();
        let mut create = Table::create();
        create
            .table(Alias::new(table))
            .col(serial_col(backend, ThingCol::ThingId))
            .col(ColumnDef::new(ThingCol::Ups).big_integer().not_null().default(0))
            .col(ColumnDef::new(ThingCol::Downs).big_integer().not_null().default(0))
            .col(ColumnDef::new(ThingCol::Deleted).boolean().not_null().default(false))
            .col(ColumnDef::new(ThingCol::Spam).boolean().not_null().default(false))
            .col(ColumnDef::new(ThingCol::Date).big_integer().not_null());
        if stores_ranks(backend) {
            create
                .col(ColumnDef::new(ThingCol::Hot).double().not_null().default(0.0))
                .col(ColumnDef::new(ThingCol::Controversy).double().not_null().default(0.0));
        }
        manager.create_table(create.to_owned()).await?;
        manager
            .create_index(index(table, "date").col(ThingCol::Date).to_owned())
            .await?;
        manager
            .create_index(
                index(table, "deleted_spam")
                    .col(ThingCol::Deleted)
                    .col(ThingCol::Spam)
                    .to_owned(),
            )
            .await?;

        let conn = engine.connection();
        let t = quote_ident(backend, table);
        match backend {
            DatabaseBackend::Postgres => {
                self.install_functions(engine).await?;
                for (suffix, expr) in [
                    ("hot", "hot(ups, downs, date)"),
                    ("score", "score(ups, downs)"),
                    ("controversy", "controversy(ups, downs)"),
                ] {
                    let name = quote_ident(backend, &index_name(table, suffix));
                    conn.execute_unprepared(&format!(
                        "CREATE INDEX {name} ON {t} ({expr}, date)"
                    ))
                    .await?;
                }
            }
            DatabaseBackend::Sqlite => {
                let name = quote_ident(backend, &index_name(table, "score"));
                conn.execute_unprepared(&format!(
                    "CREATE INDEX {name} ON {t} ((ups - downs), date)"
                ))
                .await?;
                for (suffix, col) in [
                    ("hot", ThingCol::Hot),
                    ("controversy", ThingCol::Controversy),
                ] {
                    manager
                        .create_index(index(table, suffix).col(col).col(ThingCol::Date).to_owned())
                        .await?;
                }
            }
            _ => {
                manager
                    .create_index(
                        index(table, "votes")
                            .col(ThingCol::Ups)
                            .col(ThingCol::Downs)
                            .col(ThingCol::Date)
                            .to_owned(),
                    )
                    .await?;
            }
        }
        info!("created {table} on {}", engine.name());
        Ok(())
    }

    async fn create_data_table(&mut self, engine: &Engine, table: &str) -> Result<(), DbErr> {
        let manager = SchemaManager::new(engine.connection());
        if manager.has_table(table).await? {
            return Ok(());
        }
        let backend = engine.backend();
        manager
            .create_table(
                Table::create()
                    .table(Alias::new(table))
                    .col(ColumnDef::new(DataCol::ThingId).big_integer().not_null())
                    .col(ColumnDef::new(DataCol::Key).string_len(255).not_null())
                    .col(ColumnDef::new(DataCol::Value).text().null())
                    .col(ColumnDef::new(DataCol::Kind).string_len(16).not_null())
                    .primary_key(
                        Index::create()
                            .name(index_name(table, "pk"))
                            .col(DataCol::ThingId)
                            .col(DataCol::Key),
                    )
                    .to_owned(),
            )
            .await?;

        let conn = engine.connection();
        let t = quote_ident(backend, table);
        let key = quote_ident(backend, "key");
        let value = quote_ident(backend, "value");
        let max_val_len = self.config.max_val_len;
        let key_value = quote_ident(backend, &index_name(table, "key_value"));
        let name_idx = quote_ident(backend, &index_name(table, "value_name"));
        match backend {
            DatabaseBackend::MySql => {
                let prefix = max_val_len.min(MYSQL_VALUE_PREFIX);
                conn.execute_unprepared(&format!(
                    "CREATE INDEX {key_value} ON {t} ({key}, {value}({prefix}))"
                ))
                .await?;
            }
            DatabaseBackend::Postgres => {
                self.install_functions(engine).await?;
                let ip_idx = quote_ident(backend, &index_name(table, "value_ip"));
                let url_idx = quote_ident(backend, &index_name(table, "value_url"));
                for sql in [
                    format!(
                        "CREATE INDEX {key_value} ON {t} ({key}, substring({value}, 1, {max_val_len}))"
                    ),
                    format!("CREATE INDEX {name_idx} ON {t} (lower({value})) WHERE {key} = 'name'"),
                    format!("CREATE INDEX {ip_idx} ON {t} (ip_network({value})) WHERE {key} = 'ip'"),
                    format!(
                        "CREATE INDEX {url_idx} ON {t} (base_url(lower({value}))) WHERE {key} = 'url'"
                    ),
                ] {
                    conn.execute_unprepared(&sql).await?;
                }
            }
            _ => {
                for sql in [
                    format!("CREATE INDEX {key_value} ON {t} ({key}, substr({value}, 1, {max_val_len}))"),
                    format!("CREATE INDEX {name_idx} ON {t} (lower({value})) WHERE {key} = 'name'"),
                ] {
                    conn.execute_unprepared(&sql).await?;
                }
            }
        }
        info!("created {table} on {}", engine.name());
        Ok(())
    }

    async fn create_rel_table(&self, engine: &Engine, table: &str) -> Result<(), DbErr> {
        let manager = SchemaManager::new(engine.connection());
        if manager.has_table(table).await? {
            return Ok(());
        }
        let backend = engine.backend();
        manager
            .create_table(
                Table::create()
                    .table(Alias::new(table))
                    .col(serial_col(backend, RelCol::RelId))
                    .col(ColumnDef::new(RelCol::Thing1Id).big_integer().not_null())
                    .col(ColumnDef::new(RelCol::Thing2Id).big_integer().not_null())
                    .col(ColumnDef::new(RelCol::Name).string_len(255).not_null())
                    .col(ColumnDef::new(RelCol::Date).big_integer().not_null())
                    .to_owned(),
            )
            .await?;
        let indexes = [
            index(table, "unique")
                .unique()
                .col(RelCol::Thing1Id)
                .col(RelCol::Thing2Id)
                .col(RelCol::Name)
                .to_owned(),
            index(table, "thing1_name_date")
                .col(RelCol::Thing1Id)
                .col(RelCol::Name)
                .col(RelCol::Date)
                .to_owned(),
            index(table, "thing2_name_date")
                .col(RelCol::Thing2Id)
                .col(RelCol::Name)
                .col(RelCol::Date)
                .to_owned(),
            index(table, "thing1").col(RelCol::Thing1Id).to_owned(),
            index(table, "thing2").col(RelCol::Thing2Id).to_owned(),
            index(table, "name").col(RelCol::Name).to_owned(),
            index(table, "date").col(RelCol::Date).to_owned(),
        ];
        for statement in indexes {
            manager.create_index(statement).await?;
        }
        info!("created {table} on {}", engine.name());
        Ok(())
    }

    async fn create_hardcache_table(&self, engine: &Engine, table: &str) -> Result<(), DbErr> {
        let manager = SchemaManager::new(engine.connection());
        if manager.has_table(table).await? {
            return Ok(());
        }
        manager
            .create_table(
                Table::create()
                    .table(Alias::new(table))
                    .col(ColumnDef::new(HardCacheCol::Category).string_len(255).not_null())
                    .col(ColumnDef::new(HardCacheCol::Ids).string_len(255).not_null())
                    .col(ColumnDef::new(HardCacheCol::Value).text().null())
                    .col(ColumnDef::new(HardCacheCol::Kind).string_len(16).not_null())
                    .col(ColumnDef::new(HardCacheCol::Expiration).big_integer().not_null())
                    .primary_key(
                        Index::create()
                            .name(index_name(table, "pk"))
                            .col(HardCacheCol::Category)
                            .col(HardCacheCol::Ids),
                    )
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(index(table, "expiration").col(HardCacheCol::Expiration).to_owned())
            .await?;
        info!("created {table} on {}", engine.name());
        Ok(())
    }

    async fn install_functions(&mut self, engine: &Engine) -> Result<(), DbErr> {
        if self.functions_installed.contains(engine.name()) {
            return Ok(());
        }
        for sql in PG_FUNCTIONS {
            engine.connection().execute_unprepared(sql).await?;
        }
        self.functions_installed.insert(engine.name().to_string());
        Ok(())
    }
}

fn index_name(table: &str, suffix: &str) -> String {
    format!("{table}_{suffix}_idx")
}

fn index(table: &str, suffix: &str) -> IndexCreateStatement {
    Index::create()
        .name(index_name(table, suffix))
        .table(Alias::new(table))
        .to_owned()
}

/// Auto-increment primary key. SQLite only aliases rowid for `INTEGER`.
fn serial_col(backend: DatabaseBackend, col: impl Iden + 'static) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    match backend {
        DatabaseBackend::Sqlite => {
            col_def.integer();
        }
        _ => {
            col_def.big_integer();
        }
    }
    col_def.not_null().auto_increment().primary_key();
    col_def.to_owned()
}

#[cfg(test)]
mod tests {
    use super::{index_name, quote_ident};
    use sea_orm::DatabaseBackend;

    #[test]
    fn quotes_per_backend() {
        assert_eq!(quote_ident(DatabaseBackend::MySql, "key"), "`key`");
        assert_eq!(quote_ident(DatabaseBackend::Postgres, "key"), "\"key\"");
        assert_eq!(index_name("tdb_thing_link", "date"), "tdb_thing_link_date_idx");
    }
}
