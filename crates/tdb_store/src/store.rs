use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use sea_orm::sea_query::{Alias, Expr, ExprTrait, InsertStatement, OnConflict, Query};
use sea_orm::{DatabaseBackend, DbErr, QueryResult};

use crate::compile::Compiler;
use crate::config::TdbConfig;
use crate::db::{DataCol, RelCol, ThingCol};
use crate::engine::{Conn, Engine, EngineManager, col_name, is_unique_violation};
use crate::query;
use crate::registry::{RelTables, ThingTables, TypeRegistry};
use crate::router::{Router, rel_kind, thing_kind};
use crate::schema::{SchemaBuilder, stores_ranks};
use crate::transaction::RequestContext;
use tdb_core::sorts::{self, warm_confidence_cache};
use tdb_core::value::{decode, encode};
use tdb_core::{
    AttrKind, AttrMap, Counter, NewThing, Predicate, QueryApi, QueryWindow, RelField, RelFields,
    RelId, RelPropsUpdate, RelRow, RelationApi, Results, SharedClock, SystemClock, TdbError,
    TdbResult, ThingApi, ThingId, ThingPropsUpdate, ThingRow, Timestamp, TypeId,
};

/// The thing and relation store. Cloning shares engines, registry and
/// router; request state lives in [`RequestContext`].
#[derive(Clone)]
pub struct ThingStore {
    engines: EngineManager,
    registry: Arc<TypeRegistry>,
    router: Arc<Router>,
    clock: SharedClock,
    max_val_len: usize,
}

impl ThingStore {
    pub async fn connect(config: &TdbConfig, base_dir: &Path) -> TdbResult<Self> {
        Self::connect_with(config, base_dir, Arc::new(SystemClock)).await
    }

    /// Boot: connect engines, create type tables, resolve type ids, then
    /// create the per-type tables.
    pub async fn connect_with(
        config: &TdbConfig,
        base_dir: &Path,
        clock: SharedClock,
    ) -> TdbResult<Self> {
        config.validate()?;
        warm_confidence_cache();
        let engines = EngineManager::connect(config, base_dir).await?;
        let mut schema = SchemaBuilder::new(config);
        schema.ensure_type_tables(&engines).await?;
        let registry = TypeRegistry::resolve(config, &engines).await?;
        schema.build(&engines, &registry).await?;
        info!(
            "thing store '{}' ready: {} thing types, {} relation types",
            config.app_name,
            registry.thing_types().count(),
            registry.rel_types().count()
        );
        Ok(Self {
            engines,
            registry: Arc::new(registry),
            router: Arc::new(Router::new(config.read_seed, config.disallow_writes)),
            clock,
            max_val_len: config.max_val_len,
        })
    }

    pub fn new_context(&self) -> RequestContext {
        RequestContext::new()
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn engines(&self) -> &EngineManager {
        &self.engines
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn thing_type_id(&self, name: &str) -> TdbResult<TypeId> {
        Ok(self.registry.thing_type_by_name(name)?.id)
    }

    pub fn rel_type_id(&self, name: &str) -> TdbResult<TypeId> {
        Ok(self.registry.rel_type_by_name(name)?.id)
    }

    fn compiler(&self, engine: &Engine) -> Compiler {
        Compiler::new(engine.backend(), self.max_val_len)
    }

    fn thing_read(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
    ) -> TdbResult<(Arc<Engine>, &ThingTables)> {
        let thing = self.registry.thing_type(type_id)?;
        let tables = self.router.resolve_read(
            ctx,
            &self.engines,
            &thing_kind(type_id),
            &thing.tables,
            thing.avoid_master_reads,
        )?;
        Ok((self.engines.get(&tables.engine)?, tables))
    }

    async fn thing_write(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
    ) -> TdbResult<(Arc<Engine>, &ThingTables)> {
        let thing = self.registry.thing_type(type_id)?;
        let tables =
            self.router
                .resolve_write(ctx, &self.engines, &thing_kind(type_id), &thing.tables)?;
        let engine = self.engines.get(&tables.engine)?;
        ctx.tx.add_engine(&engine).await?;
        Ok((engine, tables))
    }

    fn rel_read(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
    ) -> TdbResult<(Arc<Engine>, &RelTables)> {
        let rel = self.registry.rel_type(rel_type_id)?;
        let tables = self.router.resolve_read(
            ctx,
            &self.engines,
            &rel_kind(rel_type_id),
            &rel.tables,
            rel.avoid_master_reads,
        )?;
        Ok((self.engines.get(&tables.engine)?, tables))
    }

    async fn rel_write(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
    ) -> TdbResult<(Arc<Engine>, &RelTables)> {
        let rel = self.registry.rel_type(rel_type_id)?;
        let tables =
            self.router
                .resolve_write(ctx, &self.engines, &rel_kind(rel_type_id), &rel.tables)?;
        let engine = self.engines.get(&tables.engine)?;
        ctx.tx.add_engine(&engine).await?;
        Ok((engine, tables))
    }
}

fn decode_thing(row: &QueryResult) -> Result<ThingRow, DbErr> {
    Ok(ThingRow {
        thing_id: ThingId(row.try_get("", &col_name(ThingCol::ThingId))?),
        ups: row.try_get("", &col_name(ThingCol::Ups))?,
        downs: row.try_get("", &col_name(ThingCol::Downs))?,
        deleted: row.try_get("", &col_name(ThingCol::Deleted))?,
        spam: row.try_get("", &col_name(ThingCol::Spam))?,
        date: Timestamp(row.try_get("", &col_name(ThingCol::Date))?),
    })
}

fn decode_rel(row: &QueryResult) -> Result<RelRow, DbErr> {
    Ok(RelRow {
        rel_id: RelId(row.try_get("", &col_name(RelCol::RelId))?),
        thing1_id: ThingId(row.try_get("", &col_name(RelCol::Thing1Id))?),
        thing2_id: ThingId(row.try_get("", &col_name(RelCol::Thing2Id))?),
        name: row.try_get("", &col_name(RelCol::Name))?,
        date: Timestamp(row.try_get("", &col_name(RelCol::Date))?),
    })
}

fn row_error(table: &str, err: DbErr) -> TdbError {
    TdbError::storage(format!("decode row from {table}: {err}"))
}

/// Rows keyed by id; an id nobody asked for means the table and the caller
/// disagree about what was fetched.
fn check_requested(table: &str, requested: &[i64], got: i64) -> TdbResult<()> {
    if requested.contains(&got) {
        return Ok(());
    }
    Err(TdbError::storage(format!(
        "{table} returned id {got} which was not requested"
    )))
}

/// The key names the explicit id, or the type when the id was allocated.
fn thing_exists(table: &str, type_name: &str, explicit: Option<ThingId>) -> TdbError {
    let key = match explicit {
        Some(id) => id.to_string(),
        None => type_name.to_string(),
    };
    TdbError::creation(format!("thing already exists in {table}"), key)
}

/// Recompute the stored rank columns of one thing from its current votes
/// and date. A no-op on backends that rank with SQL functions.
async fn refresh_ranks(
    conn: Conn<'_>,
    engine: &Engine,
    table: &str,
    thing_id: ThingId,
) -> TdbResult<()> {
    if !stores_ranks(conn.backend()) {
        return Ok(());
    }
    let select = Query::select()
        .columns([ThingCol::Ups, ThingCol::Downs, ThingCol::Date])
        .from(Alias::new(table))
        .and_where(Expr::col(ThingCol::ThingId).eq(thing_id.as_i64()))
        .to_owned();
    let Some(row) = conn
        .query_one(&select)
        .await
        .map_err(|err| engine.write_error(err))?
    else {
        return Ok(());
    };
    let ups: i64 = row
        .try_get("", &col_name(ThingCol::Ups))
        .map_err(|err| row_error(table, err))?;
    let downs: i64 = row
        .try_get("", &col_name(ThingCol::Downs))
        .map_err(|err| row_error(table, err))?;
    let date: i64 = row
        .try_get("", &col_name(ThingCol::Date))
        .map_err(|err| row_error(table, err))?;
    let update = Query::update()
        .table(Alias::new(table))
        .value(ThingCol::Hot, sorts::hot(ups, downs, Timestamp(date)))
        .value(ThingCol::Controversy, sorts::controversy(ups, downs))
        .and_where(Expr::col(ThingCol::ThingId).eq(thing_id.as_i64()))
        .to_owned();
    conn.exec(&update)
        .await
        .map_err(|err| engine.write_error(err))?;
    Ok(())
}

fn float_type(backend: DatabaseBackend) -> &'static str {
    match backend {
        DatabaseBackend::Postgres => "DOUBLE PRECISION",
        DatabaseBackend::MySql => "DOUBLE",
        _ => "REAL",
    }
}

fn text_type(backend: DatabaseBackend) -> &'static str {
    match backend {
        DatabaseBackend::MySql => "CHAR",
        _ => "TEXT",
    }
}

/// Attribute tables share one layout for things and relations; `owner` is
/// the thing id or relation id.
struct DataTable<'a> {
    engine: &'a Engine,
    table: &'a str,
}

impl DataTable<'_> {
    async fn write(
        &self,
        conn: Conn<'_>,
        owner: i64,
        brand_new: bool,
        data: &AttrMap,
    ) -> TdbResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if brand_new {
            let insert = self.insert(owner, data);
            return match conn.exec(&insert).await {
                Ok(_) => Ok(()),
                Err(err) if is_unique_violation(&err) => Err(TdbError::creation(
                    format!("attributes already exist in {}", self.table),
                    owner.to_string(),
                )),
                Err(err) => Err(self.engine.write_error(err)),
            };
        }
        let mut upsert = self.insert(owner, data);
        upsert.on_conflict(
            OnConflict::columns([DataCol::ThingId, DataCol::Key])
                .update_columns([DataCol::Value, DataCol::Kind])
                .to_owned(),
        );
        conn.exec(&upsert)
            .await
            .map_err(|err| self.engine.write_error(err))?;
        Ok(())
    }

    fn insert(&self, owner: i64, data: &AttrMap) -> InsertStatement {
        let mut insert = Query::insert();
        insert.into_table(Alias::new(self.table)).columns([
            DataCol::ThingId,
            DataCol::Key,
            DataCol::Value,
            DataCol::Kind,
        ]);
        for (key, value) in data {
            let (stored, kind) = encode(value);
            insert.values_panic([
                Expr::val(owner),
                Expr::val(key.as_str()),
                Expr::val(stored),
                Expr::val(kind.as_str()),
            ]);
        }
        insert
    }

    /// Add `amount` to a numeric attribute, creating it when absent.
    async fn incr(&self, conn: Conn<'_>, owner: i64, key: &str, amount: f64) -> TdbResult<()> {
        let backend = conn.backend();
        let mut initial = AttrMap::new();
        initial.insert(key.to_string(), amount.into());
        let mut upsert = self.insert(owner, &initial);
        upsert.on_conflict(
            OnConflict::columns([DataCol::ThingId, DataCol::Key])
                .value(
                    DataCol::Value,
                    Expr::col((Alias::new(self.table), DataCol::Value))
                        .cast_as(Alias::new(float_type(backend)))
                        .add(amount)
                        .cast_as(Alias::new(text_type(backend))),
                )
                .value(DataCol::Kind, AttrKind::Num.as_str())
                .to_owned(),
        );
        conn.exec(&upsert)
            .await
            .map_err(|err| self.engine.write_error(err))?;
        Ok(())
    }

    async fn read(&self, conn: Conn<'_>, owners: &[i64]) -> TdbResult<HashMap<i64, AttrMap>> {
        let mut out: HashMap<i64, AttrMap> = HashMap::new();
        if owners.is_empty() {
            return Ok(out);
        }
        let select = Query::select()
            .columns([DataCol::ThingId, DataCol::Key, DataCol::Value, DataCol::Kind])
            .from(Alias::new(self.table))
            .and_where(Expr::col(DataCol::ThingId).is_in(owners.iter().copied()))
            .to_owned();
        let rows = conn
            .query_all(&select)
            .await
            .map_err(|err| self.engine.unavailable(err))?;
        for row in rows {
            let owner: i64 = row
                .try_get("", &col_name(DataCol::ThingId))
                .map_err(|err| row_error(self.table, err))?;
            check_requested(self.table, owners, owner)?;
            let key: String = row
                .try_get("", &col_name(DataCol::Key))
                .map_err(|err| row_error(self.table, err))?;
            let value: Option<String> = row
                .try_get("", &col_name(DataCol::Value))
                .map_err(|err| row_error(self.table, err))?;
            let kind: String = row
                .try_get("", &col_name(DataCol::Kind))
                .map_err(|err| row_error(self.table, err))?;
            out.entry(owner)
                .or_default()
                .insert(key, decode(value.as_deref(), &kind)?);
        }
        Ok(out)
    }

    async fn delete_all(&self, conn: Conn<'_>, owner: i64) -> TdbResult<()> {
        let delete = Query::delete()
            .from_table(Alias::new(self.table))
            .and_where(Expr::col(DataCol::ThingId).eq(owner))
            .to_owned();
        conn.exec(&delete)
            .await
            .map_err(|err| self.engine.write_error(err))?;
        Ok(())
    }
}

#[async_trait]
impl ThingApi for ThingStore {
    type Ctx = RequestContext;

    async fn make_thing(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        thing: NewThing,
    ) -> TdbResult<ThingId> {
        let (engine, tables) = self.thing_write(ctx, type_id).await?;
        let date = thing.date.unwrap_or_else(|| self.clock.now());
        let mut insert = Query::insert();
        insert.into_table(Alias::new(&tables.thing));
        let mut columns = vec![
            ThingCol::Ups,
            ThingCol::Downs,
            ThingCol::Deleted,
            ThingCol::Spam,
            ThingCol::Date,
        ];
        let mut values = vec![
            Expr::val(thing.ups),
            Expr::val(thing.downs),
            Expr::val(thing.deleted),
            Expr::val(thing.spam),
            Expr::val(date.as_micros()),
        ];
        if stores_ranks(engine.backend()) {
            columns.extend([ThingCol::Hot, ThingCol::Controversy]);
            values.extend([
                Expr::val(sorts::hot(thing.ups, thing.downs, date)),
                Expr::val(sorts::controversy(thing.ups, thing.downs)),
            ]);
        }
        if let Some(id) = thing.thing_id {
            columns.insert(0, ThingCol::ThingId);
            values.insert(0, Expr::val(id.as_i64()));
        }
        insert.columns(columns).values_panic(values);

        let conn = ctx.conn(&engine);
        let result = match thing.thing_id {
            Some(id) => conn.exec(&insert).await.map(|_| id),
            None => conn
                .insert_returning_id(&mut insert, ThingCol::ThingId)
                .await
                .map(ThingId),
        };
        match result {
            Ok(id) => Ok(id),
            Err(err) if is_unique_violation(&err) => {
                let type_name = &self.registry.thing_type(type_id)?.name;
                Err(thing_exists(&tables.thing, type_name, thing.thing_id))
            }
            Err(err) => Err(engine.write_error(err)),
        }
    }

    async fn set_thing_props(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        thing_id: ThingId,
        props: ThingPropsUpdate,
    ) -> TdbResult<()> {
        if props.is_empty() {
            return Ok(());
        }
        let (engine, tables) = self.thing_write(ctx, type_id).await?;
        let mut update = Query::update();
        update.table(Alias::new(&tables.thing));
        if let Some(ups) = props.ups {
            update.value(ThingCol::Ups, ups);
        }
        if let Some(downs) = props.downs {
            update.value(ThingCol::Downs, downs);
        }
        if let Some(deleted) = props.deleted {
            update.value(ThingCol::Deleted, deleted);
        }
        if let Some(spam) = props.spam {
            update.value(ThingCol::Spam, spam);
        }
        if let Some(date) = props.date {
            update.value(ThingCol::Date, date.as_micros());
        }
        update.and_where(Expr::col(ThingCol::ThingId).eq(thing_id.as_i64()));
        let conn = ctx.conn(&engine);
        conn.exec(&update)
            .await
            .map_err(|err| engine.write_error(err))?;
        if props.ups.is_some() || props.downs.is_some() || props.date.is_some() {
            refresh_ranks(conn, &engine, &tables.thing, thing_id).await?;
        }
        Ok(())
    }

    async fn incr_thing_prop(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        thing_id: ThingId,
        counter: Counter,
        amount: i64,
    ) -> TdbResult<()> {
        let (engine, tables) = self.thing_write(ctx, type_id).await?;
        let column = match counter {
            Counter::Ups => ThingCol::Ups,
            Counter::Downs => ThingCol::Downs,
        };
        let update = Query::update()
            .table(Alias::new(&tables.thing))
            .value(column, Expr::col(column).add(amount))
            .and_where(Expr::col(ThingCol::ThingId).eq(thing_id.as_i64()))
            .to_owned();
        let conn = ctx.conn(&engine);
        conn.exec(&update)
            .await
            .map_err(|err| engine.write_error(err))?;
        refresh_ranks(conn, &engine, &tables.thing, thing_id).await
    }

    async fn get_thing(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        thing_id: ThingId,
    ) -> TdbResult<Option<ThingRow>> {
        let mut rows = self.get_things(ctx, type_id, &[thing_id]).await?;
        Ok(rows.remove(&thing_id))
    }

    async fn get_things(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        thing_ids: &[ThingId],
    ) -> TdbResult<HashMap<ThingId, ThingRow>> {
        if thing_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let (engine, tables) = self.thing_read(ctx, type_id)?;
        let requested: Vec<i64> = thing_ids.iter().map(|id| id.as_i64()).collect();
        let select = Query::select()
            .columns([
                ThingCol::ThingId,
                ThingCol::Ups,
                ThingCol::Downs,
                ThingCol::Deleted,
                ThingCol::Spam,
                ThingCol::Date,
            ])
            .from(Alias::new(&tables.thing))
            .and_where(Expr::col(ThingCol::ThingId).is_in(requested.iter().copied()))
            .to_owned();
        let rows = ctx
            .conn(&engine)
            .query_all(&select)
            .await
            .map_err(|err| engine.unavailable(err))?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let thing = decode_thing(&row).map_err(|err| row_error(&tables.thing, err))?;
            check_requested(&tables.thing, &requested, thing.thing_id.as_i64())?;
            out.insert(thing.thing_id, thing);
        }
        Ok(out)
    }

    async fn set_thing_data(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        thing_id: ThingId,
        brand_new: bool,
        data: &AttrMap,
    ) -> TdbResult<()> {
        let (engine, tables) = self.thing_write(ctx, type_id).await?;
        let data_table = DataTable {
            engine: &engine,
            table: &tables.data,
        };
        data_table
            .write(ctx.conn(&engine), thing_id.as_i64(), brand_new, data)
            .await
    }

    async fn incr_thing_data(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        thing_id: ThingId,
        key: &str,
        amount: f64,
    ) -> TdbResult<()> {
        let (engine, tables) = self.thing_write(ctx, type_id).await?;
        let data_table = DataTable {
            engine: &engine,
            table: &tables.data,
        };
        data_table
            .incr(ctx.conn(&engine), thing_id.as_i64(), key, amount)
            .await
    }

    async fn get_thing_data(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        thing_id: ThingId,
    ) -> TdbResult<AttrMap> {
        let mut data = self.get_things_data(ctx, type_id, &[thing_id]).await?;
        Ok(data.remove(&thing_id).unwrap_or_default())
    }

    async fn get_things_data(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        thing_ids: &[ThingId],
    ) -> TdbResult<HashMap<ThingId, AttrMap>> {
        if thing_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let (engine, tables) = self.thing_read(ctx, type_id)?;
        let data_table = DataTable {
            engine: &engine,
            table: &tables.data,
        };
        let owners: Vec<i64> = thing_ids.iter().map(|id| id.as_i64()).collect();
        let data = data_table.read(ctx.conn(&engine), &owners).await?;
        Ok(data
            .into_iter()
            .map(|(owner, attrs)| (ThingId(owner), attrs))
            .collect())
    }
}

#[async_trait]
impl RelationApi for ThingStore {
    type Ctx = RequestContext;

    async fn make_relation(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
        thing1_id: ThingId,
        thing2_id: ThingId,
        name: &str,
        date: Option<Timestamp>,
    ) -> TdbResult<RelId> {
        let (engine, tables) = self.rel_write(ctx, rel_type_id).await?;
        let date = date.unwrap_or_else(|| self.clock.now());
        let mut insert = Query::insert()
            .into_table(Alias::new(&tables.rel))
            .columns([RelCol::Thing1Id, RelCol::Thing2Id, RelCol::Name, RelCol::Date])
            .values_panic([
                Expr::val(thing1_id.as_i64()),
                Expr::val(thing2_id.as_i64()),
                Expr::val(name),
                Expr::val(date.as_micros()),
            ])
            .to_owned();
        match ctx
            .conn(&engine)
            .insert_returning_id(&mut insert, RelCol::RelId)
            .await
        {
            Ok(id) => Ok(RelId(id)),
            Err(err) if is_unique_violation(&err) => Err(TdbError::creation(
                format!("relation already exists in {}", tables.rel),
                format!("{thing1_id}_{thing2_id}_{name}"),
            )),
            Err(err) => Err(engine.write_error(err)),
        }
    }

    async fn set_rel_props(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
        rel_id: RelId,
        props: RelPropsUpdate,
    ) -> TdbResult<()> {
        if props.is_empty() {
            return Ok(());
        }
        let (engine, tables) = self.rel_write(ctx, rel_type_id).await?;
        let mut update = Query::update();
        update.table(Alias::new(&tables.rel));
        if let Some(thing1_id) = props.thing1_id {
            update.value(RelCol::Thing1Id, thing1_id.as_i64());
        }
        if let Some(thing2_id) = props.thing2_id {
            update.value(RelCol::Thing2Id, thing2_id.as_i64());
        }
        if let Some(name) = props.name {
            update.value(RelCol::Name, name);
        }
        if let Some(date) = props.date {
            update.value(RelCol::Date, date.as_micros());
        }
        update.and_where(Expr::col(RelCol::RelId).eq(rel_id.as_i64()));
        match ctx.conn(&engine).exec(&update).await {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(TdbError::creation(
                format!("relation update collides in {}", tables.rel),
                rel_id.to_string(),
            )),
            Err(err) => Err(engine.write_error(err)),
        }
    }

    async fn del_rel(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
        rel_id: RelId,
    ) -> TdbResult<()> {
        let (engine, tables) = self.rel_write(ctx, rel_type_id).await?;
        let delete = Query::delete()
            .from_table(Alias::new(&tables.rel))
            .and_where(Expr::col(RelCol::RelId).eq(rel_id.as_i64()))
            .to_owned();
        let conn = ctx.conn(&engine);
        conn.exec(&delete)
            .await
            .map_err(|err| engine.write_error(err))?;
        DataTable {
            engine: &engine,
            table: &tables.data,
        }
        .delete_all(conn, rel_id.as_i64())
        .await
    }

    async fn get_rel(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
        rel_id: RelId,
    ) -> TdbResult<Option<RelRow>> {
        let mut rows = self.get_rels(ctx, rel_type_id, &[rel_id]).await?;
        Ok(rows.remove(&rel_id))
    }

    async fn get_rels(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
        rel_ids: &[RelId],
    ) -> TdbResult<HashMap<RelId, RelRow>> {
        if rel_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let (engine, tables) = self.rel_read(ctx, rel_type_id)?;
        let requested: Vec<i64> = rel_ids.iter().map(|id| id.as_i64()).collect();
        let select = Query::select()
            .columns([
                RelCol::RelId,
                RelCol::Thing1Id,
                RelCol::Thing2Id,
                RelCol::Name,
                RelCol::Date,
            ])
            .from(Alias::new(&tables.rel))
            .and_where(Expr::col(RelCol::RelId).is_in(requested.iter().copied()))
            .to_owned();
        let rows = ctx
            .conn(&engine)
            .query_all(&select)
            .await
            .map_err(|err| engine.unavailable(err))?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let rel = decode_rel(&row).map_err(|err| row_error(&tables.rel, err))?;
            check_requested(&tables.rel, &requested, rel.rel_id.as_i64())?;
            out.insert(rel.rel_id, rel);
        }
        Ok(out)
    }

    async fn set_rel_data(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
        rel_id: RelId,
        brand_new: bool,
        data: &AttrMap,
    ) -> TdbResult<()> {
        let (engine, tables) = self.rel_write(ctx, rel_type_id).await?;
        let data_table = DataTable {
            engine: &engine,
            table: &tables.data,
        };
        data_table
            .write(ctx.conn(&engine), rel_id.as_i64(), brand_new, data)
            .await
    }

    async fn incr_rel_data(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
        rel_id: RelId,
        key: &str,
        amount: f64,
    ) -> TdbResult<()> {
        let (engine, tables) = self.rel_write(ctx, rel_type_id).await?;
        let data_table = DataTable {
            engine: &engine,
            table: &tables.data,
        };
        data_table
            .incr(ctx.conn(&engine), rel_id.as_i64(), key, amount)
            .await
    }

    async fn get_rel_data(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
        rel_id: RelId,
    ) -> TdbResult<AttrMap> {
        let mut data = self.get_rels_data(ctx, rel_type_id, &[rel_id]).await?;
        Ok(data.remove(&rel_id).unwrap_or_default())
    }

    async fn get_rels_data(
        &self,
        ctx: &mut RequestContext,
        rel_type_id: TypeId,
        rel_ids: &[RelId],
    ) -> TdbResult<HashMap<RelId, AttrMap>> {
        if rel_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let (engine, tables) = self.rel_read(ctx, rel_type_id)?;
        let data_table = DataTable {
            engine: &engine,
            table: &tables.data,
        };
        let owners: Vec<i64> = rel_ids.iter().map(|id| id.as_i64()).collect();
        let data = data_table.read(ctx.conn(&engine), &owners).await?;
        Ok(data
            .into_iter()
            .map(|(owner, attrs)| (RelId(owner), attrs))
            .collect())
    }
}

#[async_trait]
impl QueryApi for ThingStore {
    type Ctx = RequestContext;

    async fn find_things(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        window: QueryWindow,
        constraints: &[Predicate],
    ) -> TdbResult<Results<ThingId>> {
        let (engine, tables) = self.thing_read(ctx, type_id)?;
        let select = query::find_things(&self.compiler(&engine), tables, &window, constraints)?;
        let rows = ctx
            .conn(&engine)
            .query_all(&select)
            .await
            .map_err(|err| engine.unavailable(err))?;
        Ok(Results::new(
            rows.into_iter().map(|row| query::decode_thing_id(&row)),
        ))
    }

    async fn find_data(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        window: QueryWindow,
        constraints: &[Predicate],
    ) -> TdbResult<Results<ThingId>> {
        let (engine, tables) = self.thing_read(ctx, type_id)?;
        let select = query::find_data(&self.compiler(&engine), tables, &window, constraints)?;
        let rows = ctx
            .conn(&engine)
            .query_all(&select)
            .await
            .map_err(|err| engine.unavailable(err))?;
        Ok(Results::new(
            rows.into_iter().map(|row| query::decode_thing_id(&row)),
        ))
    }

    async fn find_rels(
        &self,
        ctx: &mut RequestContext,
        ret_props: &[&str],
        rel_type_id: TypeId,
        window: QueryWindow,
        constraints: &[Predicate],
    ) -> TdbResult<Results<RelFields>> {
        let fields = ret_props
            .iter()
            .map(|prop| RelField::parse(prop))
            .collect::<TdbResult<Vec<_>>>()?;
        let (engine, tables) = self.rel_read(ctx, rel_type_id)?;
        let select = query::find_rels(
            &self.compiler(&engine),
            tables,
            &fields,
            &window,
            constraints,
        )?;
        let rows = ctx
            .conn(&engine)
            .query_all(&select)
            .await
            .map_err(|err| engine.unavailable(err))?;
        Ok(Results::new(
            rows.into_iter()
                .map(move |row| query::decode_rel_fields(&row, &fields)),
        ))
    }

    async fn sort_thing_ids_by_data_value(
        &self,
        ctx: &mut RequestContext,
        type_id: TypeId,
        thing_ids: &[ThingId],
        key: &str,
        limit: Option<u64>,
        desc: bool,
    ) -> TdbResult<Vec<ThingId>> {
        if thing_ids.is_empty() {
            return Ok(Vec::new());
        }
        let (engine, tables) = self.thing_read(ctx, type_id)?;
        let select = query::sort_by_data_value(tables, thing_ids, key, limit, desc);
        let rows = ctx
            .conn(&engine)
            .query_all(&select)
            .await
            .map_err(|err| engine.unavailable(err))?;
        rows.iter().map(query::decode_thing_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::thing_exists;
    use tdb_core::{TdbError, ThingId};

    #[test]
    fn creation_errors_always_carry_a_key() {
        match thing_exists("app_thing_link", "link", None) {
            TdbError::Creation { key, .. } => assert_eq!(key, "link"),
            other => panic!("unexpected error {other:?}"),
        }
        match thing_exists("app_thing_link", "link", Some(ThingId(42))) {
            TdbError::Creation { key, .. } => assert_eq!(key, "42"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
