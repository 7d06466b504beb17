//! Category-partitioned expiring key/value store sharing the engines of the
//! thing store. Keys are `"<category>-<ids>"`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info};
use sea_orm::DatabaseBackend;
use sea_orm::sea_query::{Alias, Condition, Expr, ExprTrait, Order, Query};

use crate::config::TdbConfig;
use crate::db::{self, HardCacheCol};
use crate::engine::{Conn, Engine, EngineManager, col_name, is_unique_violation};
use crate::router::Router;
use tdb_core::value::{decode, encode};
use tdb_core::{
    AttrKind, AttrValue, Expiration, HardCacheApi, SharedClock, SharedSink, TdbError, TdbResult,
    Timestamp,
};

pub const COUNT_CATEGORY: &str = "hc_count";
pub const ELAPSED_CATEGORY: &str = "hc_elapsed";
pub const DEFAULT_CATEGORY: &str = "*";
const PROFILE_TTL_SECONDS: i64 = 86_400;
const DEFAULT_IDS_LIMIT: u64 = 1000;

/// Split `"category-ids"` at the first dash.
pub fn split_key(key: &str) -> TdbResult<(&str, &str)> {
    key.split_once('-')
        .filter(|(category, _)| !category.is_empty())
        .ok_or_else(|| TdbError::invalid(format!("hard cache key '{key}' has no category")))
}

/// Ten-minute bucket label, e.g. `2024/03/01_14:2x`.
pub fn profile_period(at: Timestamp) -> TdbResult<String> {
    let moment = at.to_offset_datetime()?;
    Ok(format!(
        "{:04}/{:02}/{:02}_{:02}:{}x",
        moment.year(),
        u8::from(moment.month()),
        moment.day(),
        moment.hour(),
        moment.minute() / 10
    ))
}

fn expiration_from_ttl(now: Timestamp, ttl_seconds: i64) -> TdbResult<Timestamp> {
    if ttl_seconds <= 0 {
        return Err(TdbError::invalid(
            "hard cache items must have a positive expiration time",
        ));
    }
    Ok(now.plus(Duration::from_secs(ttl_seconds as u64)))
}

fn integer_type(backend: DatabaseBackend) -> &'static str {
    match backend {
        DatabaseBackend::MySql => "SIGNED",
        DatabaseBackend::Postgres => "BIGINT",
        _ => "INTEGER",
    }
}

fn text_type(backend: DatabaseBackend) -> &'static str {
    match backend {
        DatabaseBackend::MySql => "CHAR",
        _ => "TEXT",
    }
}

struct Profile {
    started: Instant,
    operation: &'static str,
    category: String,
}

pub struct HardCacheBackend {
    table: String,
    engines: EngineManager,
    mapping: HashMap<String, Vec<String>>,
    profiled: HashSet<String>,
    router: Router,
    clock: SharedClock,
    sink: SharedSink,
}

impl HardCacheBackend {
    pub fn build(
        config: &TdbConfig,
        engines: &EngineManager,
        clock: SharedClock,
        sink: SharedSink,
    ) -> TdbResult<Self> {
        let categories = config
            .hardcache_categories()?
            .ok_or_else(|| TdbError::configuration("no hardcache categories configured"))?;
        let mut mapping = HashMap::with_capacity(categories.len());
        let mut profiled = HashSet::new();
        for spec in categories {
            for name in &spec.engines {
                engines.get(name)?;
            }
            if spec.profile {
                profiled.insert(spec.category.clone());
            }
            mapping.insert(spec.category, spec.engines);
        }
        Ok(Self {
            table: db::hardcache_table(&config.app_name),
            engines: engines.clone(),
            mapping,
            profiled,
            router: Router::new(config.read_seed, false),
            clock,
            sink,
        })
    }

    fn engines_for(&self, category: &str) -> TdbResult<&[String]> {
        self.mapping
            .get(category)
            .or_else(|| self.mapping.get(DEFAULT_CATEGORY))
            .map(Vec::as_slice)
            .ok_or_else(|| TdbError::configuration("hardcache mapping lacks '*'"))
    }

    fn master(&self, category: &str) -> TdbResult<Arc<Engine>> {
        let name = self.engines_for(category)?.first().ok_or_else(|| {
            TdbError::configuration(format!("category '{category}' has no engines"))
        })?;
        self.engines.get(name)
    }

    /// A random live replica, or the master when none is configured. With
    /// every replica dead any live engine of the category will do.
    fn replica(&self, category: &str) -> TdbResult<Arc<Engine>> {
        let names = self.engines_for(category)?;
        if names.len() <= 1 {
            return self.master(category);
        }
        let live = |pool: &[String]| -> Vec<String> {
            pool.iter()
                .filter(|name| self.engines.is_alive(name))
                .cloned()
                .collect()
        };
        let mut candidates = live(&names[1..]);
        if candidates.is_empty() {
            candidates = live(names);
        }
        if candidates.is_empty() {
            candidates = names[1..].to_vec();
        }
        self.engines
            .get(&candidates[self.router.choose_index(candidates.len())])
    }

    fn key_condition(category: &str, ids: &str) -> Condition {
        Condition::all()
            .add(Expr::col(HardCacheCol::Category).eq(category))
            .add(Expr::col(HardCacheCol::Ids).eq(ids))
    }

    fn expiration_condition(&self, expiration: Expiration) -> Condition {
        match expiration {
            Expiration::Now => Condition::all()
                .add(Expr::col(HardCacheCol::Expiration).lt(self.clock.now().as_micros())),
            Expiration::Before(at) => {
                Condition::all().add(Expr::col(HardCacheCol::Expiration).lt(at.as_micros()))
            }
            Expiration::Any => Condition::all(),
        }
    }

    fn profile_start(&self, operation: &'static str, category: &str) -> Option<Profile> {
        if category == COUNT_CATEGORY || category == ELAPSED_CATEGORY {
            return None;
        }
        let effective = if self.mapping.contains_key(category) {
            category
        } else {
            DEFAULT_CATEGORY
        };
        if !self.profiled.contains(effective) {
            return None;
        }
        Some(Profile {
            started: Instant::now(),
            operation,
            category: category.to_string(),
        })
    }

    /// Record count and elapsed milliseconds for a profiled operation.
    async fn profile_stop(&self, profile: Option<Profile>) -> TdbResult<()> {
        let Some(profile) = profile else {
            return Ok(());
        };
        let elapsed = profile.started.elapsed();
        self.sink
            .timing(&format!("hardcache.{}", profile.operation), elapsed);
        let period = profile_period(self.clock.now())?;
        let ids = format!("{}-{}-{period}", profile.operation, profile.category);
        let millis = elapsed.as_millis() as i64;
        for (category, delta) in [(COUNT_CATEGORY, 1), (ELAPSED_CATEGORY, millis)] {
            let master = self.master(category)?;
            let expiration = expiration_from_ttl(self.clock.now(), PROFILE_TTL_SECONDS)?;
            self.remove(&master, category, &ids, Some(Expiration::Now))
                .await?;
            self.insert(&master, category, &ids, &AttrValue::Int(0), expiration, true)
                .await?;
            self.bump(&master, category, &ids, delta, Some(expiration))
                .await?;
        }
        Ok(())
    }

    async fn insert(
        &self,
        master: &Engine,
        category: &str,
        ids: &str,
        value: &AttrValue,
        expiration: Timestamp,
        ignore_existing: bool,
    ) -> TdbResult<bool> {
        let (stored, kind) = encode(value);
        let insert = Query::insert()
            .into_table(Alias::new(&self.table))
            .columns([
                HardCacheCol::Category,
                HardCacheCol::Ids,
                HardCacheCol::Value,
                HardCacheCol::Kind,
                HardCacheCol::Expiration,
            ])
            .values_panic([
                Expr::val(category),
                Expr::val(ids),
                Expr::val(stored),
                Expr::val(kind.as_str()),
                Expr::val(expiration.as_micros()),
            ])
            .to_owned();
        match Conn::Pool(master.connection()).exec(&insert).await {
            Ok(_) => Ok(true),
            Err(err) if ignore_existing && is_unique_violation(&err) => Ok(false),
            Err(err) => Err(master.write_error(err)),
        }
    }

    async fn remove(
        &self,
        master: &Engine,
        category: &str,
        ids: &str,
        expiration: Option<Expiration>,
    ) -> TdbResult<()> {
        let mut condition = Self::key_condition(category, ids);
        if let Some(expiration) = expiration {
            condition = condition.add(self.expiration_condition(expiration));
        }
        let delete = Query::delete()
            .from_table(Alias::new(&self.table))
            .cond_where(condition)
            .to_owned();
        Conn::Pool(master.connection())
            .exec(&delete)
            .await
            .map_err(|err| master.write_error(err))?;
        Ok(())
    }

    /// Integer add on a numeric entry. Returns the number of rows changed.
    async fn bump(
        &self,
        master: &Engine,
        category: &str,
        ids: &str,
        delta: i64,
        expiration: Option<Timestamp>,
    ) -> TdbResult<u64> {
        let backend = master.backend();
        let mut update = Query::update();
        update.table(Alias::new(&self.table)).value(
            HardCacheCol::Value,
            Expr::col(HardCacheCol::Value)
                .cast_as(Alias::new(integer_type(backend)))
                .add(delta)
                .cast_as(Alias::new(text_type(backend))),
        );
        if let Some(expiration) = expiration {
            update.value(HardCacheCol::Expiration, expiration.as_micros());
        }
        update.cond_where(
            Self::key_condition(category, ids)
                .add(Expr::col(HardCacheCol::Kind).eq(AttrKind::Num.as_str())),
        );
        let result = Conn::Pool(master.connection())
            .exec(&update)
            .await
            .map_err(|err| master.write_error(err))?;
        Ok(result.rows_affected())
    }

    async fn fetch(&self, engine: &Engine, category: &str, ids: &str) -> TdbResult<Option<AttrValue>> {
        let select = Query::select()
            .columns([
                HardCacheCol::Value,
                HardCacheCol::Kind,
                HardCacheCol::Expiration,
            ])
            .from(Alias::new(&self.table))
            .cond_where(Self::key_condition(category, ids))
            .limit(1)
            .to_owned();
        let row = Conn::Pool(engine.connection())
            .query_one(&select)
            .await
            .map_err(|err| engine.unavailable(err))?;
        let value = match row {
            Some(row) => self.decode_live(&row)?.map(|(value, _)| value),
            None => None,
        };
        self.sink.incr(
            if value.is_some() {
                "hardcache.hit"
            } else {
                "hardcache.miss"
            },
            1,
        );
        Ok(value)
    }

    /// The row's value, or `None` once it has expired.
    fn decode_live(&self, row: &sea_orm::QueryResult) -> TdbResult<Option<(AttrValue, Timestamp)>> {
        let storage = |err: sea_orm::DbErr| TdbError::storage(format!("hard cache row: {err}"));
        let expiration = Timestamp(
            row.try_get::<i64>("", &col_name(HardCacheCol::Expiration))
                .map_err(storage)?,
        );
        if expiration < self.clock.now() {
            return Ok(None);
        }
        let value: Option<String> = row
            .try_get("", &col_name(HardCacheCol::Value))
            .map_err(storage)?;
        let kind: String = row
            .try_get("", &col_name(HardCacheCol::Kind))
            .map_err(storage)?;
        Ok(Some((decode(value.as_deref(), &kind)?, expiration)))
    }

    /// Replace any existing entry.
    pub async fn set(
        &self,
        category: &str,
        ids: &str,
        value: &AttrValue,
        ttl_seconds: i64,
    ) -> TdbResult<()> {
        let expiration = expiration_from_ttl(self.clock.now(), ttl_seconds)?;
        self.delete(category, ids).await?;
        let profile = self.profile_start("set", category);
        let master = self.master(category)?;
        self.insert(&master, category, ids, value, expiration, false)
            .await?;
        self.profile_stop(profile).await
    }

    /// Insert when absent and return what the cache now holds for the key.
    pub async fn add(
        &self,
        category: &str,
        ids: &str,
        value: &AttrValue,
        ttl_seconds: i64,
    ) -> TdbResult<AttrValue> {
        let expiration = expiration_from_ttl(self.clock.now(), ttl_seconds)?;
        self.delete_if_expired(category, ids, Expiration::Now).await?;
        let profile = self.profile_start("add", category);
        let master = self.master(category)?;
        let inserted = self
            .insert(&master, category, ids, value, expiration, true)
            .await?;
        self.profile_stop(profile).await?;
        if inserted {
            return Ok(value.clone());
        }
        // Someone else holds the key; their value wins.
        Ok(self
            .get_master(category, ids)
            .await?
            .unwrap_or_else(|| value.clone()))
    }

    /// Add `delta` to an integer entry, refreshing its expiration when
    /// `ttl_seconds` is given.
    pub async fn incr(
        &self,
        category: &str,
        ids: &str,
        delta: i64,
        ttl_seconds: Option<i64>,
    ) -> TdbResult<Option<i64>> {
        let expiration = ttl_seconds
            .map(|ttl| expiration_from_ttl(self.clock.now(), ttl))
            .transpose()?;
        self.delete_if_expired(category, ids, Expiration::Now).await?;
        let profile = self.profile_start("incr", category);
        let master = self.master(category)?;
        let changed = self.bump(&master, category, ids, delta, expiration).await?;
        self.profile_stop(profile).await?;
        match changed {
            1 => Ok(self.get_master(category, ids).await?.and_then(|value| value.as_i64())),
            0 => match self.get_master(category, ids).await? {
                None => Err(TdbError::cache_value(format!(
                    "[{category}][{ids}] can't be incremented, it is not set"
                ))),
                Some(existing) => Err(TdbError::cache_value(format!(
                    "[{category}][{ids}] has non-integer value {existing:?}"
                ))),
            },
            other => Err(TdbError::storage(format!(
                "incr of [{category}][{ids}] updated {other} rows"
            ))),
        }
    }

    pub async fn get(&self, category: &str, ids: &str) -> TdbResult<Option<AttrValue>> {
        let engine = self.replica(category)?;
        let profile = self.profile_start("get", category);
        let value = self.fetch(&engine, category, ids).await?;
        self.profile_stop(profile).await?;
        Ok(value)
    }

    /// Read from the write target, bypassing replica lag.
    pub async fn get_master(&self, category: &str, ids: &str) -> TdbResult<Option<AttrValue>> {
        let engine = self.master(category)?;
        let profile = self.profile_start("get", category);
        let value = self.fetch(&engine, category, ids).await?;
        self.profile_stop(profile).await?;
        Ok(value)
    }

    /// Live entries among `idses`, keyed `"<category>-<ids>"`.
    pub async fn get_multi(
        &self,
        category: &str,
        idses: &[&str],
    ) -> TdbResult<HashMap<String, AttrValue>> {
        let mut out = HashMap::new();
        if idses.is_empty() {
            return Ok(out);
        }
        let profile = self.profile_start("get_multi", category);
        let engine = self.replica(category)?;
        let select = Query::select()
            .columns([
                HardCacheCol::Ids,
                HardCacheCol::Value,
                HardCacheCol::Kind,
                HardCacheCol::Expiration,
            ])
            .from(Alias::new(&self.table))
            .cond_where(
                Condition::all()
                    .add(Expr::col(HardCacheCol::Category).eq(category))
                    .add(Expr::col(HardCacheCol::Ids).is_in(idses.iter().copied())),
            )
            .to_owned();
        let rows = Conn::Pool(engine.connection())
            .query_all(&select)
            .await
            .map_err(|err| engine.unavailable(err))?;
        for row in rows {
            let ids: String = row
                .try_get("", &col_name(HardCacheCol::Ids))
                .map_err(|err| TdbError::storage(format!("hard cache row: {err}")))?;
            if let Some((value, _)) = self.decode_live(&row)? {
                out.insert(format!("{category}-{ids}"), value);
            }
        }
        self.sink.incr("hardcache.hit", out.len() as u64);
        self.sink
            .incr("hardcache.miss", (idses.len().saturating_sub(out.len())) as u64);
        self.profile_stop(profile).await?;
        Ok(out)
    }

    pub async fn delete(&self, category: &str, ids: &str) -> TdbResult<()> {
        let profile = self.profile_start("delete", category);
        let master = self.master(category)?;
        self.remove(&master, category, ids, None).await?;
        self.profile_stop(profile).await
    }

    pub async fn delete_if_expired(
        &self,
        category: &str,
        ids: &str,
        expiration: Expiration,
    ) -> TdbResult<()> {
        let profile = self.profile_start("delete_if_expired", category);
        let master = self.master(category)?;
        self.remove(&master, category, ids, Some(expiration)).await?;
        self.profile_stop(profile).await
    }

    /// Live ids in `category`, at most `limit` (1000 when unset).
    pub async fn ids_by_category(
        &self,
        category: &str,
        limit: Option<u64>,
    ) -> TdbResult<Vec<String>> {
        let profile = self.profile_start("ids_by_category", category);
        let engine = self.replica(category)?;
        let select = Query::select()
            .column(HardCacheCol::Ids)
            .from(Alias::new(&self.table))
            .cond_where(
                Condition::all()
                    .add(Expr::col(HardCacheCol::Category).eq(category))
                    .add(Expr::col(HardCacheCol::Expiration).gt(self.clock.now().as_micros())),
            )
            .limit(limit.unwrap_or(DEFAULT_IDS_LIMIT))
            .to_owned();
        let rows = Conn::Pool(engine.connection())
            .query_all(&select)
            .await
            .map_err(|err| engine.unavailable(err))?;
        let ids = rows
            .iter()
            .map(|row| {
                row.try_get::<String>("", &col_name(HardCacheCol::Ids))
                    .map_err(|err| TdbError::storage(format!("hard cache row: {err}")))
            })
            .collect::<TdbResult<Vec<_>>>()?;
        self.profile_stop(profile).await?;
        Ok(ids)
    }

    /// Expired `(expiration, category, ids)` rows on `engine`, oldest first.
    pub async fn expired(
        &self,
        engine: &Engine,
        expiration: Expiration,
        limit: u64,
    ) -> TdbResult<Vec<(Timestamp, String, String)>> {
        let select = Query::select()
            .columns([
                HardCacheCol::Expiration,
                HardCacheCol::Category,
                HardCacheCol::Ids,
            ])
            .from(Alias::new(&self.table))
            .cond_where(self.expiration_condition(expiration))
            .order_by(HardCacheCol::Expiration, Order::Asc)
            .limit(limit)
            .to_owned();
        let rows = Conn::Pool(engine.connection())
            .query_all(&select)
            .await
            .map_err(|err| engine.unavailable(err))?;
        rows.iter()
            .map(|row| {
                let storage = |err: sea_orm::DbErr| TdbError::storage(format!("hard cache row: {err}"));
                Ok((
                    Timestamp(
                        row.try_get::<i64>("", &col_name(HardCacheCol::Expiration))
                            .map_err(storage)?,
                    ),
                    row.try_get::<String>("", &col_name(HardCacheCol::Category))
                        .map_err(storage)?,
                    row.try_get::<String>("", &col_name(HardCacheCol::Ids))
                        .map_err(storage)?,
                ))
            })
            .collect()
    }

    /// Sweep every distinct master engine, deleting expired rows `batch`
    /// keys at a time until none remain. Returns the number of rows removed.
    pub async fn delete_expired(&self, expiration: Expiration, batch: u64) -> TdbResult<u64> {
        if batch == 0 {
            return Err(TdbError::invalid("sweep batch size must be positive"));
        }
        let mut categories: Vec<&String> = self.mapping.keys().collect();
        categories.sort();
        let masters = self
            .engines
            .masters(categories.into_iter().map(|category| self.mapping[category].as_slice()))?;

        let mut removed = 0;
        for master in masters {
            loop {
                let rows = self.expired(&master, expiration, batch).await?;
                if rows.is_empty() {
                    break;
                }
                let keys = rows.iter().fold(Condition::any(), |acc, (_, category, ids)| {
                    acc.add(Self::key_condition(category, ids))
                });
                let delete = Query::delete()
                    .from_table(Alias::new(&self.table))
                    .cond_where(keys)
                    .to_owned();
                let result = Conn::Pool(master.connection())
                    .exec(&delete)
                    .await
                    .map_err(|err| master.write_error(err))?;
                removed += result.rows_affected();
                debug!(
                    "swept {} expired hard cache rows on {}",
                    rows.len(),
                    master.name()
                );
                if (rows.len() as u64) < batch {
                    break;
                }
            }
        }
        info!("hard cache sweep removed {removed} rows");
        Ok(removed)
    }
}

#[async_trait]
impl HardCacheApi for HardCacheBackend {
    async fn set(&self, key: &str, value: AttrValue, ttl_seconds: i64) -> TdbResult<()> {
        let (category, ids) = split_key(key)?;
        HardCacheBackend::set(self, category, ids, &value, ttl_seconds).await
    }

    async fn add(&self, key: &str, value: AttrValue, ttl_seconds: i64) -> TdbResult<AttrValue> {
        let (category, ids) = split_key(key)?;
        HardCacheBackend::add(self, category, ids, &value, ttl_seconds).await
    }

    async fn incr(&self, key: &str, delta: i64) -> TdbResult<Option<i64>> {
        let (category, ids) = split_key(key)?;
        HardCacheBackend::incr(self, category, ids, delta, None).await
    }

    async fn get(&self, key: &str) -> TdbResult<Option<AttrValue>> {
        let (category, ids) = split_key(key)?;
        HardCacheBackend::get(self, category, ids).await
    }

    async fn get_master(&self, key: &str) -> TdbResult<Option<AttrValue>> {
        let (category, ids) = split_key(key)?;
        HardCacheBackend::get_master(self, category, ids).await
    }

    /// Keys are grouped per category, one query each.
    async fn get_multi(&self, keys: &[&str]) -> TdbResult<HashMap<String, AttrValue>> {
        let mut by_category: HashMap<&str, Vec<&str>> = HashMap::new();
        for key in keys {
            let (category, ids) = split_key(key)?;
            by_category.entry(category).or_default().push(ids);
        }
        let mut out = HashMap::with_capacity(keys.len());
        for (category, idses) in by_category {
            out.extend(HardCacheBackend::get_multi(self, category, &idses).await?);
        }
        Ok(out)
    }

    async fn delete(&self, key: &str) -> TdbResult<()> {
        let (category, ids) = split_key(key)?;
        HardCacheBackend::delete(self, category, ids).await
    }
}

#[cfg(test)]
mod tests {
    use super::{profile_period, split_key};
    use tdb_core::{ErrorKind, Timestamp};

    #[test]
    fn keys_split_at_first_dash() {
        assert_eq!(split_key("ratelimit-1.2.3.4-x").expect("key"), ("ratelimit", "1.2.3.4-x"));
        let err = split_key("nodash").expect_err("no category");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(split_key("-ids").is_err());
    }

    #[test]
    fn profile_periods_bucket_by_ten_minutes() {
        // 2024-03-01T14:27:05Z
        let at = Timestamp::from_seconds(1_709_303_225);
        assert_eq!(profile_period(at).expect("period"), "2024/03/01_14:2x");
    }
}
