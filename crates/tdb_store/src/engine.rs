//! Named database engines, their liveness, and the statement helpers every
//! other module executes through.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};
use sea_orm::sea_query::{
    self, InsertStatement, MysqlQueryBuilder, PostgresQueryBuilder, QueryStatementWriter,
    SqliteQueryBuilder,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    DatabaseTransaction, DbErr, ExecResult, QueryResult, SqlErr, Statement,
};

use crate::config::{PoolConfig, TdbConfig};
use tdb_core::{TdbError, TdbResult};

pub struct Engine {
    name: String,
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    alive: AtomicBool,
}

impl Engine {
    pub fn new(name: impl Into<String>, conn: DatabaseConnection) -> Self {
        let backend = conn.get_database_backend();
        Self {
            name: name.into(),
            conn,
            backend,
            alive: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            warn!("engine {} marked dead", self.name);
        }
    }

    fn revive(&self) {
        if !self.alive.swap(true, Ordering::SeqCst) {
            info!("engine {} is answering again", self.name);
        }
    }

    /// Query-path failure: the engine is assumed gone until refreshed.
    pub(crate) fn unavailable(&self, err: DbErr) -> TdbError {
        self.mark_dead();
        TdbError::engine_unavailable(&self.name, err.to_string())
    }

    /// Write-path failure: only connection problems take the engine down.
    pub(crate) fn write_error(&self, err: DbErr) -> TdbError {
        if is_connection_error(&err) {
            return self.unavailable(err);
        }
        TdbError::storage(format!("{}: {err}", self.name))
    }
}

/// Owns every configured engine. Cheap to clone.
#[derive(Clone, Default)]
pub struct EngineManager {
    engines: Arc<BTreeMap<String, Arc<Engine>>>,
}

impl EngineManager {
    pub fn from_engines(engines: impl IntoIterator<Item = Engine>) -> Self {
        let engines = engines
            .into_iter()
            .map(|engine| (engine.name.clone(), Arc::new(engine)))
            .collect();
        Self {
            engines: Arc::new(engines),
        }
    }

    /// Connect every engine named in the config. Without `require_db` an
    /// unreachable engine is kept as a lazy pool and marked dead.
    pub async fn connect(config: &TdbConfig, base_dir: &Path) -> TdbResult<Self> {
        let mut engines = Vec::with_capacity(config.engines.len());
        for (name, engine_config) in &config.engines {
            let url = engine_config.connection_url(base_dir)?;
            let options = connect_options(&url, engine_config.pool.as_ref());
            match Database::connect(options).await {
                Ok(conn) => engines.push(Engine::new(name.clone(), conn)),
                Err(err) if config.require_db => {
                    return Err(TdbError::engine_unavailable(name, err.to_string()));
                }
                Err(err) => {
                    warn!("engine {name} unreachable at boot, continuing without it: {err}");
                    let mut options = connect_options(&url, engine_config.pool.as_ref());
                    options.connect_lazy(true);
                    let conn = Database::connect(options)
                        .await
                        .map_err(|err| TdbError::engine_unavailable(name, err.to_string()))?;
                    let engine = Engine::new(name.clone(), conn);
                    engine.mark_dead();
                    engines.push(engine);
                }
            }
        }
        Ok(Self::from_engines(engines))
    }

    pub fn get(&self, name: &str) -> TdbResult<Arc<Engine>> {
        self.engines
            .get(name)
            .cloned()
            .ok_or_else(|| TdbError::configuration(format!("unknown engine '{name}'")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.engines.keys().map(String::as_str)
    }

    pub fn is_alive(&self, name: &str) -> bool {
        self.engines.get(name).is_some_and(|engine| engine.is_alive())
    }

    pub fn mark_dead(&self, name: &str) {
        if let Some(engine) = self.engines.get(name) {
            engine.mark_dead();
        }
    }

    /// Distinct first entries of each engine list, in first-seen order.
    pub fn masters<'a, I>(&self, lists: I) -> TdbResult<Vec<Arc<Engine>>>
    where
        I: IntoIterator<Item = &'a [String]>,
    {
        let mut seen = Vec::new();
        for list in lists {
            let Some(first) = list.first() else {
                continue;
            };
            if !seen.contains(first) {
                seen.push(first.clone());
            }
        }
        seen.iter().map(|name| self.get(name)).collect()
    }

    /// Ping dead engines and revive the ones that answer. Returns the names
    /// brought back.
    pub async fn refresh(&self) -> Vec<String> {
        let mut revived = Vec::new();
        for engine in self.engines.values() {
            if engine.is_alive() {
                continue;
            }
            if engine.conn.ping().await.is_ok() {
                engine.revive();
                revived.push(engine.name.clone());
            }
        }
        revived
    }

    /// Ping every engine, updating liveness along the way.
    pub async fn health(&self) -> Vec<(String, bool)> {
        let mut report = Vec::with_capacity(self.engines.len());
        for engine in self.engines.values() {
            let ok = engine.conn.ping().await.is_ok();
            if ok {
                engine.revive();
            } else {
                engine.mark_dead();
            }
            report.push((engine.name.clone(), ok));
        }
        report
    }
}

fn connect_options(url: &str, pool: Option<&PoolConfig>) -> ConnectOptions {
    let mut options = ConnectOptions::new(url.to_string());
    options.sqlx_logging(false);
    if let Some(pool) = pool {
        if let Some(max) = pool.max_connections {
            options.max_connections(max);
        }
        if let Some(min) = pool.min_connections {
            options.min_connections(min);
        }
        if let Some(timeout_ms) = pool.connect_timeout_ms {
            options.connect_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(timeout_ms) = pool.acquire_timeout_ms {
            options.acquire_timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(timeout_ms) = pool.idle_timeout_ms {
            options.idle_timeout(Duration::from_millis(timeout_ms));
        }
    }
    options
}

pub(crate) fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

pub(crate) fn is_connection_error(err: &DbErr) -> bool {
    matches!(err, DbErr::Conn(_) | DbErr::ConnectionAcquire(_))
}

pub(crate) fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

pub(crate) fn build_stmt<S: QueryStatementWriter>(backend: DatabaseBackend, stmt: &S) -> Statement {
    let (sql, values) = match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    };
    Statement::from_sql_and_values(backend, sql, values)
}

/// Either the engine pool (autocommit) or the request's open transaction on
/// that engine.
#[derive(Clone, Copy)]
pub(crate) enum Conn<'a> {
    Pool(&'a DatabaseConnection),
    Tx(&'a DatabaseTransaction),
}

impl Conn<'_> {
    pub fn backend(&self) -> DatabaseBackend {
        match self {
            Conn::Pool(conn) => conn.get_database_backend(),
            Conn::Tx(tx) => tx.get_database_backend(),
        }
    }

    pub async fn exec<S: QueryStatementWriter>(&self, stmt: &S) -> Result<ExecResult, DbErr> {
        let statement = build_stmt(self.backend(), stmt);
        match self {
            Conn::Pool(conn) => conn.execute_raw(statement).await,
            Conn::Tx(tx) => tx.execute_raw(statement).await,
        }
    }

    pub async fn query_all<S: QueryStatementWriter>(
        &self,
        stmt: &S,
    ) -> Result<Vec<QueryResult>, DbErr> {
        let statement = build_stmt(self.backend(), stmt);
        match self {
            Conn::Pool(conn) => conn.query_all_raw(statement).await,
            Conn::Tx(tx) => tx.query_all_raw(statement).await,
        }
    }

    pub async fn query_one<S: QueryStatementWriter>(
        &self,
        stmt: &S,
    ) -> Result<Option<QueryResult>, DbErr> {
        let statement = build_stmt(self.backend(), stmt);
        match self {
            Conn::Pool(conn) => conn.query_one_raw(statement).await,
            Conn::Tx(tx) => tx.query_one_raw(statement).await,
        }
    }

    /// Run an insert and hand back the generated key.
    pub async fn insert_returning_id<I>(
        &self,
        insert: &mut InsertStatement,
        id_col: I,
    ) -> Result<i64, DbErr>
    where
        I: sea_query::Iden + Copy + 'static,
    {
        if self.backend() == DatabaseBackend::MySql {
            let result = self.exec(insert).await?;
            return Ok(result.last_insert_id() as i64);
        }
        insert.returning_col(id_col);
        let row = self
            .query_one(insert)
            .await?
            .ok_or(DbErr::RecordNotInserted)?;
        row.try_get::<i64>("", &col_name(id_col))
    }
}
