//! Type name to id resolution and the per-type table sets built from it.

use std::collections::{BTreeMap, HashMap};

use log::{info, warn};
use sea_orm::DbErr;
use sea_orm::sea_query::{Alias, Expr, ExprTrait, Query};

use crate::config::TdbConfig;
use crate::db::{self, RelTypeCol, TypeCol};
use crate::engine::{Conn, Engine, EngineManager, col_name, is_connection_error, is_unique_violation};
use crate::router::Routed;
use tdb_core::{TdbError, TdbResult, TypeId};

/// The thing and data tables of one thing type on one engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThingTables {
    pub engine: String,
    pub thing: String,
    pub data: String,
}

impl Routed for ThingTables {
    fn engine(&self) -> &str {
        &self.engine
    }
}

/// The relation tables of one relation type on one engine, plus the names
/// of the endpoint thing tables used for joins there.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelTables {
    pub engine: String,
    pub rel: String,
    pub data: String,
    pub thing1: String,
    pub thing2: String,
}

impl Routed for RelTables {
    fn engine(&self) -> &str {
        &self.engine
    }
}

#[derive(Clone, Debug)]
pub struct ThingType {
    pub id: TypeId,
    pub name: String,
    pub tables: Vec<ThingTables>,
    pub avoid_master_reads: bool,
}

#[derive(Clone, Debug)]
pub struct RelType {
    pub id: TypeId,
    pub name: String,
    pub type1_id: TypeId,
    pub type2_id: TypeId,
    pub tables: Vec<RelTables>,
    pub avoid_master_reads: bool,
}

/// Immutable after boot.
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    things: BTreeMap<TypeId, ThingType>,
    thing_names: HashMap<String, TypeId>,
    rels: BTreeMap<TypeId, RelType>,
    rel_names: HashMap<String, TypeId>,
}

impl TypeRegistry {
    /// Resolve every configured type to its id, creating type rows as
    /// needed.
    pub async fn resolve(config: &TdbConfig, engines: &EngineManager) -> TdbResult<Self> {
        let app = config.app_name.as_str();
        let mut registry = Self::default();

        let type_engine = engines.get(&config.type_db)?;
        for thing in &config.things {
            let id = get_or_create_type_id(
                config,
                &type_engine,
                &db::type_table(app),
                &thing.name,
                &[],
            )
            .await?;
            let tables = thing
                .engines
                .iter()
                .map(|engine| ThingTables {
                    engine: engine.clone(),
                    thing: db::thing_table(app, &thing.name),
                    data: db::data_table(app, &thing.name),
                })
                .collect();
            registry.thing_names.insert(thing.name.clone(), id);
            registry.things.insert(
                id,
                ThingType {
                    id,
                    name: thing.name.clone(),
                    tables,
                    avoid_master_reads: thing.avoid_master_reads,
                },
            );
        }

        let rel_engine = engines.get(&config.rel_type_db)?;
        for rel in &config.relations {
            let type1_id = registry.thing_type_by_name(&rel.type1)?.id;
            let type2_id = registry.thing_type_by_name(&rel.type2)?.id;
            let id = get_or_create_type_id(
                config,
                &rel_engine,
                &db::rel_type_table(app),
                &rel.name,
                &[
                    (RelTypeCol::Type1Id, type1_id.as_i64()),
                    (RelTypeCol::Type2Id, type2_id.as_i64()),
                ],
            )
            .await?;
            let tables = rel
                .engines
                .iter()
                .map(|engine| RelTables {
                    engine: engine.clone(),
                    rel: db::rel_table(app, &rel.name),
                    data: db::rel_data_table(app, &rel.name),
                    thing1: db::thing_table(app, &rel.type1),
                    thing2: db::thing_table(app, &rel.type2),
                })
                .collect();
            registry.rel_names.insert(rel.name.clone(), id);
            registry.rels.insert(
                id,
                RelType {
                    id,
                    name: rel.name.clone(),
                    type1_id,
                    type2_id,
                    tables,
                    avoid_master_reads: rel.avoid_master_reads,
                },
            );
        }
        Ok(registry)
    }

    pub fn thing_type(&self, id: TypeId) -> TdbResult<&ThingType> {
        self.things
            .get(&id)
            .ok_or_else(|| TdbError::not_found(format!("thing type id {id}")))
    }

    pub fn thing_type_by_name(&self, name: &str) -> TdbResult<&ThingType> {
        self.thing_names
            .get(name)
            .and_then(|id| self.things.get(id))
            .ok_or_else(|| TdbError::not_found(format!("thing type '{name}'")))
    }

    pub fn rel_type(&self, id: TypeId) -> TdbResult<&RelType> {
        self.rels
            .get(&id)
            .ok_or_else(|| TdbError::not_found(format!("relation type id {id}")))
    }

    pub fn rel_type_by_name(&self, name: &str) -> TdbResult<&RelType> {
        self.rel_names
            .get(name)
            .and_then(|id| self.rels.get(id))
            .ok_or_else(|| TdbError::not_found(format!("relation type '{name}'")))
    }

    pub fn thing_types(&self) -> impl Iterator<Item = &ThingType> {
        self.things.values()
    }

    pub fn rel_types(&self) -> impl Iterator<Item = &RelType> {
        self.rels.values()
    }
}

/// Look up `name` in a type table, inserting it when missing. Predefined
/// ids short-circuit the database entirely.
pub async fn get_or_create_type_id(
    config: &TdbConfig,
    engine: &Engine,
    table: &str,
    name: &str,
    extra_cols: &[(RelTypeCol, i64)],
) -> TdbResult<TypeId> {
    if let Some(id) = config.predefined_type_ids.get(name) {
        return Ok(TypeId(*id));
    }
    if !config.predefined_type_ids.is_empty() {
        return Err(TdbError::configuration(format!(
            "type '{name}' missing from predefined type ids"
        )));
    }
    match lookup_or_insert(engine, table, name, extra_cols).await {
        Ok(id) => Ok(id),
        Err(err) if is_connection_error(&err) && !config.require_db => {
            let id = placeholder_type_id(name);
            warn!("type table {table} unreachable, using placeholder id {id} for '{name}': {err}");
            Ok(id)
        }
        Err(err) => Err(engine.write_error(err)),
    }
}

async fn lookup_or_insert(
    engine: &Engine,
    table: &str,
    name: &str,
    extra_cols: &[(RelTypeCol, i64)],
) -> Result<TypeId, DbErr> {
    let conn = Conn::Pool(engine.connection());
    if let Some(id) = select_type_id(conn, table, name).await? {
        return Ok(id);
    }
    let mut insert = Query::insert();
    insert.into_table(Alias::new(table));
    let mut columns: Vec<Alias> = vec![Alias::new(col_name(TypeCol::Name))];
    let mut values: Vec<Expr> = vec![Expr::val(name)];
    for (col, value) in extra_cols {
        columns.push(Alias::new(col_name(*col)));
        values.push(Expr::val(*value));
    }
    insert.columns(columns).values_panic(values);
    match conn.insert_returning_id(&mut insert, TypeCol::Id).await {
        Ok(id) => {
            info!("created type '{name}' with id {id} in {table}");
            Ok(TypeId(id))
        }
        // Lost a race with another process; its row wins.
        Err(err) if is_unique_violation(&err) => select_type_id(conn, table, name)
            .await?
            .ok_or(err),
        Err(err) => Err(err),
    }
}

async fn select_type_id(conn: Conn<'_>, table: &str, name: &str) -> Result<Option<TypeId>, DbErr> {
    let select = Query::select()
        .from(Alias::new(table))
        .column(TypeCol::Id)
        .and_where(Expr::col(TypeCol::Name).eq(name))
        .limit(1)
        .to_owned();
    let row = conn.query_one(&select).await?;
    row.map(|row| row.try_get::<i64>("", &col_name(TypeCol::Id)).map(TypeId))
        .transpose()
}

/// Stable id for a type whose table cannot be reached. FNV-1a over the
/// name, kept positive.
pub fn placeholder_type_id(name: &str) -> TypeId {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    TypeId((hash >> 1) as i64)
}
