use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    AttrMap, AttrValue, Counter, NewThing, Predicate, RelFields, RelId, RelPropsUpdate, RelRow,
    Sort, TdbResult, ThingId, ThingPropsUpdate, ThingRow, Timestamp, TypeId,
};

/// Single-pass cursor over a fetched result set. Rows are decoded as the
/// caller advances; a decode failure surfaces as an `Err` item.
pub struct Results<T> {
    rows: Box<dyn Iterator<Item = TdbResult<T>> + Send>,
}

impl<T> Results<T> {
    pub fn new<I>(rows: I) -> Self
    where
        I: Iterator<Item = TdbResult<T>> + Send + 'static,
    {
        Self {
            rows: Box::new(rows),
        }
    }

    pub fn empty() -> Self
    where
        T: Send + 'static,
    {
        Self::new(std::iter::empty())
    }

    /// Drain the cursor, stopping at the first decode failure.
    pub fn fetch_all(self) -> TdbResult<Vec<T>> {
        self.rows.collect()
    }
}

impl<T> Iterator for Results<T> {
    type Item = TdbResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }
}

/// Paging and ordering shared by every query shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryWindow {
    pub sort: Vec<Sort>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryWindow {
    pub fn sorted(sort: impl IntoIterator<Item = Sort>) -> Self {
        Self {
            sort: sort.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[async_trait]
pub trait ThingApi {
    type Ctx: Send;

    async fn make_thing(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        thing: NewThing,
    ) -> TdbResult<ThingId>;

    async fn set_thing_props(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        thing_id: ThingId,
        props: ThingPropsUpdate,
    ) -> TdbResult<()>;

    async fn incr_thing_prop(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        thing_id: ThingId,
        counter: Counter,
        amount: i64,
    ) -> TdbResult<()>;

    async fn get_thing(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        thing_id: ThingId,
    ) -> TdbResult<Option<ThingRow>>;

    async fn get_things(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        thing_ids: &[ThingId],
    ) -> TdbResult<HashMap<ThingId, ThingRow>>;

    async fn set_thing_data(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        thing_id: ThingId,
        brand_new: bool,
        data: &AttrMap,
    ) -> TdbResult<()>;

    async fn incr_thing_data(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        thing_id: ThingId,
        key: &str,
        amount: f64,
    ) -> TdbResult<()>;

    async fn get_thing_data(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        thing_id: ThingId,
    ) -> TdbResult<AttrMap>;

    async fn get_things_data(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        thing_ids: &[ThingId],
    ) -> TdbResult<HashMap<ThingId, AttrMap>>;
}

#[async_trait]
pub trait RelationApi {
    type Ctx: Send;

    async fn make_relation(
        &self,
        ctx: &mut Self::Ctx,
        rel_type_id: TypeId,
        thing1_id: ThingId,
        thing2_id: ThingId,
        name: &str,
        date: Option<Timestamp>,
    ) -> TdbResult<RelId>;

    async fn set_rel_props(
        &self,
        ctx: &mut Self::Ctx,
        rel_type_id: TypeId,
        rel_id: RelId,
        props: RelPropsUpdate,
    ) -> TdbResult<()>;

    async fn del_rel(&self, ctx: &mut Self::Ctx, rel_type_id: TypeId, rel_id: RelId)
    -> TdbResult<()>;

    async fn get_rel(
        &self,
        ctx: &mut Self::Ctx,
        rel_type_id: TypeId,
        rel_id: RelId,
    ) -> TdbResult<Option<RelRow>>;

    async fn get_rels(
        &self,
        ctx: &mut Self::Ctx,
        rel_type_id: TypeId,
        rel_ids: &[RelId],
    ) -> TdbResult<HashMap<RelId, RelRow>>;

    async fn set_rel_data(
        &self,
        ctx: &mut Self::Ctx,
        rel_type_id: TypeId,
        rel_id: RelId,
        brand_new: bool,
        data: &AttrMap,
    ) -> TdbResult<()>;

    async fn incr_rel_data(
        &self,
        ctx: &mut Self::Ctx,
        rel_type_id: TypeId,
        rel_id: RelId,
        key: &str,
        amount: f64,
    ) -> TdbResult<()>;

    async fn get_rel_data(
        &self,
        ctx: &mut Self::Ctx,
        rel_type_id: TypeId,
        rel_id: RelId,
    ) -> TdbResult<AttrMap>;

    async fn get_rels_data(
        &self,
        ctx: &mut Self::Ctx,
        rel_type_id: TypeId,
        rel_ids: &[RelId],
    ) -> TdbResult<HashMap<RelId, AttrMap>>;
}

#[async_trait]
pub trait QueryApi {
    type Ctx: Send;

    async fn find_things(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        window: QueryWindow,
        constraints: &[Predicate],
    ) -> TdbResult<Results<ThingId>>;

    async fn find_data(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        window: QueryWindow,
        constraints: &[Predicate],
    ) -> TdbResult<Results<ThingId>>;

    async fn find_rels(
        &self,
        ctx: &mut Self::Ctx,
        ret_props: &[&str],
        rel_type_id: TypeId,
        window: QueryWindow,
        constraints: &[Predicate],
    ) -> TdbResult<Results<RelFields>>;

    async fn sort_thing_ids_by_data_value(
        &self,
        ctx: &mut Self::Ctx,
        type_id: TypeId,
        thing_ids: &[ThingId],
        key: &str,
        limit: Option<u64>,
        desc: bool,
    ) -> TdbResult<Vec<ThingId>>;
}

/// Which rows count as expired for hard cache scans.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expiration {
    /// Expired as of the cache clock.
    Now,
    Before(Timestamp),
    /// Every row regardless of expiration.
    Any,
}

#[async_trait]
pub trait HardCacheApi {
    async fn set(&self, key: &str, value: AttrValue, ttl_seconds: i64) -> TdbResult<()>;
    async fn add(&self, key: &str, value: AttrValue, ttl_seconds: i64) -> TdbResult<AttrValue>;
    async fn incr(&self, key: &str, delta: i64) -> TdbResult<Option<i64>>;
    async fn get(&self, key: &str) -> TdbResult<Option<AttrValue>>;
    async fn get_master(&self, key: &str) -> TdbResult<Option<AttrValue>>;
    async fn get_multi(&self, keys: &[&str]) -> TdbResult<HashMap<String, AttrValue>>;
    async fn delete(&self, key: &str) -> TdbResult<()>;
}

/// Everything a request handler needs from the thing store.
pub trait TdbStore: ThingApi + RelationApi + QueryApi + Send + Sync {}

impl<T> TdbStore for T where T: ThingApi + RelationApi + QueryApi + Send + Sync {}

#[cfg(test)]
mod tests {
    use super::{QueryWindow, Results};
    use crate::{TdbError, desc};

    #[test]
    fn results_decode_lazily_and_stop_on_error() {
        let rows = vec![Ok(1), Err(TdbError::storage("bad row")), Ok(3)];
        let mut results = Results::new(rows.into_iter());
        assert_eq!(results.next().and_then(Result::ok), Some(1));
        assert!(results.fetch_all().is_err());
    }

    #[test]
    fn window_builder() {
        let window = QueryWindow::sorted([desc("_hot")]).limit(25).offset(50);
        assert_eq!(window.limit, Some(25));
        assert_eq!(window.offset, Some(50));
        assert_eq!(window.sort.len(), 1);
    }
}
