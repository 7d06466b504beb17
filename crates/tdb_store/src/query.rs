//! Statement builders for the read-side query shapes. Each builder resolves
//! column names against its table set, decides which joins the constraints
//! need, and only then assembles the select.

use sea_orm::QueryResult;
use sea_orm::sea_query::{
    Alias, Condition, Expr, ExprTrait, Iden, Order, Query, SelectStatement,
};

use crate::compile::{ColKind, Compiler, apply_window, order};
use crate::db::{DataCol, RelCol, ThingCol};
use crate::registry::{RelTables, ThingTables};
use tdb_core::{
    Comparison, Predicate, QueryWindow, RelField, RelFields, RelId, TdbError, TdbResult, ThingId,
    Timestamp,
};

const THING: &str = "t";
const REL: &str = "r";

/// What a column name in a constraint or sort resolved to.
enum Target {
    Fixed(Expr, ColKind),
    Data(Expr),
}

/// Attribute keys referenced by a query, one table alias per distinct key.
#[derive(Default)]
struct DataKeys(Vec<String>);

impl DataKeys {
    fn alias_for(&mut self, key: &str) -> String {
        let index = match self.0.iter().position(|existing| existing == key) {
            Some(index) => index,
            None => {
                self.0.push(key.to_string());
                self.0.len() - 1
            }
        };
        data_alias(index)
    }

    fn value(&mut self, key: &str) -> Target {
        Target::Data(Expr::col((Alias::new(self.alias_for(key)), DataCol::Value)))
    }

    fn iter(&self) -> impl Iterator<Item = (String, &str)> {
        self.0
            .iter()
            .enumerate()
            .map(|(index, key)| (data_alias(index), key.as_str()))
    }
}

fn data_alias(index: usize) -> String {
    format!("d{index}")
}

fn compile(
    compiler: &Compiler,
    constraints: &[Predicate],
    window: &QueryWindow,
    resolve: &mut dyn FnMut(&str) -> TdbResult<Target>,
) -> TdbResult<(Condition, Vec<(Expr, Order)>)> {
    let mut leaf = |cmp: &Comparison| -> TdbResult<Condition> {
        match resolve(cmp.lval.name())? {
            Target::Fixed(expr, kind) => compiler.compare_fixed(cmp, kind, expr),
            Target::Data(expr) => compiler.compare_data(cmp, expr),
        }
    };
    let mut condition = Condition::all();
    for predicate in constraints {
        condition = condition.add(compiler.condition(predicate, &mut leaf)?);
    }
    let mut orders = Vec::with_capacity(window.sort.len());
    for sort in &window.sort {
        let expr = match resolve(sort.lval.name())? {
            Target::Fixed(expr, _) | Target::Data(expr) => expr,
        };
        orders.push((compiler.apply_funcs(&sort.lval, expr)?, order(sort.direction)));
    }
    Ok((condition, orders))
}

fn finish(
    mut select: SelectStatement,
    condition: Condition,
    orders: Vec<(Expr, Order)>,
    window: &QueryWindow,
) -> SelectStatement {
    select.cond_where(condition);
    for (expr, direction) in orders {
        select.order_by_expr(expr, direction);
    }
    apply_window(&mut select, window);
    select
}

fn col_eq<L, R>(left: (&str, L), right: (&str, R)) -> Expr
where
    L: Iden + 'static,
    R: Iden + 'static,
{
    Expr::col((Alias::new(left.0), left.1)).equals((Alias::new(right.0), right.1))
}

/// Thing ids filtered and sorted on fixed columns only.
pub(crate) fn find_things(
    compiler: &Compiler,
    tables: &ThingTables,
    window: &QueryWindow,
    constraints: &[Predicate],
) -> TdbResult<SelectStatement> {
    let mut resolve = |name: &str| -> TdbResult<Target> {
        let fixed = name.strip_prefix('_').ok_or_else(|| {
            TdbError::query(format!(
                "'{name}' is an attribute; find_things only filters fixed columns"
            ))
        })?;
        let (expr, kind) = compiler.thing_column(THING, fixed)?;
        Ok(Target::Fixed(expr, kind))
    };
    let (condition, orders) = compile(compiler, constraints, window, &mut resolve)?;

    let mut select = Query::select();
    select
        .expr_as(
            Expr::col((Alias::new(THING), ThingCol::ThingId)),
            Alias::new("thing_id"),
        )
        .from_as(Alias::new(&tables.thing), Alias::new(THING));
    Ok(finish(select, condition, orders, window))
}

/// Thing ids filtered on attribute values. Fixed columns pull in the thing
/// table; at least one attribute constraint is required.
pub(crate) fn find_data(
    compiler: &Compiler,
    tables: &ThingTables,
    window: &QueryWindow,
    constraints: &[Predicate],
) -> TdbResult<SelectStatement> {
    let has_data_rule = tdb_core::op_iter(constraints)
        .iter()
        .any(|cmp| !cmp.lval.name().starts_with('_'));
    if !has_data_rule {
        return Err(TdbError::query(
            "find_data needs at least one attribute constraint",
        ));
    }
    let mut keys = DataKeys::default();
    let mut join_thing = false;
    let (condition, orders) = {
        let mut resolve = |name: &str| -> TdbResult<Target> {
            if name == "_id" {
                return Ok(Target::Fixed(
                    Expr::col((Alias::new(data_alias(0)), DataCol::ThingId)),
                    ColKind::Int,
                ));
            }
            if let Some(fixed) = name.strip_prefix('_') {
                join_thing = true;
                let (expr, kind) = compiler.thing_column(THING, fixed)?;
                return Ok(Target::Fixed(expr, kind));
            }
            Ok(keys.value(name))
        };
        compile(compiler, constraints, window, &mut resolve)?
    };

    let anchor = data_alias(0);
    let mut select = Query::select();
    select.expr_as(
        Expr::col((Alias::new(&anchor), DataCol::ThingId)),
        Alias::new("thing_id"),
    );
    let mut joins = Condition::all();
    for (alias, key) in keys.iter() {
        select.from_as(Alias::new(&tables.data), Alias::new(&alias));
        joins = joins.add(Expr::col((Alias::new(&alias), DataCol::Key)).eq(key));
        if alias != anchor {
            joins = joins.add(col_eq(
                (&alias, DataCol::ThingId),
                (&anchor, DataCol::ThingId),
            ));
        }
    }
    if join_thing {
        select.from_as(Alias::new(&tables.thing), Alias::new(THING));
        joins = joins.add(col_eq((THING, ThingCol::ThingId), (&anchor, DataCol::ThingId)));
    }
    Ok(finish(select, joins.add(condition), orders, window))
}

/// Relation rows projected to `fields`. `_t1_`/`_t2_` columns join the
/// endpoint thing tables and bare names join the relation data table.
pub(crate) fn find_rels(
    compiler: &Compiler,
    tables: &RelTables,
    fields: &[RelField],
    window: &QueryWindow,
    constraints: &[Predicate],
) -> TdbResult<SelectStatement> {
    if fields.is_empty() {
        return Err(TdbError::query("find_rels needs at least one return prop"));
    }
    let mut keys = DataKeys::default();
    let (mut join_t1, mut join_t2) = (false, false);
    let (condition, orders) = {
        let mut resolve = |name: &str| -> TdbResult<Target> {
            if let Some(column) = name.strip_prefix("_t1_") {
                join_t1 = true;
                let (expr, kind) = compiler.thing_column("t1", column)?;
                return Ok(Target::Fixed(expr, kind));
            }
            if let Some(column) = name.strip_prefix("_t2_") {
                join_t2 = true;
                let (expr, kind) = compiler.thing_column("t2", column)?;
                return Ok(Target::Fixed(expr, kind));
            }
            if let Some(column) = name.strip_prefix('_') {
                let (expr, kind) = compiler.rel_column(REL, column)?;
                return Ok(Target::Fixed(expr, kind));
            }
            Ok(keys.value(name))
        };
        compile(compiler, constraints, window, &mut resolve)?
    };

    let mut select = Query::select();
    for field in fields {
        select.expr_as(
            Expr::col((Alias::new(REL), Alias::new(field.column()))),
            Alias::new(field.column()),
        );
    }
    select.from_as(Alias::new(&tables.rel), Alias::new(REL));
    let mut joins = Condition::all();
    if join_t1 {
        select.from_as(Alias::new(&tables.thing1), Alias::new("t1"));
        joins = joins.add(col_eq(("t1", ThingCol::ThingId), (REL, RelCol::Thing1Id)));
    }
    if join_t2 {
        select.from_as(Alias::new(&tables.thing2), Alias::new("t2"));
        joins = joins.add(col_eq(("t2", ThingCol::ThingId), (REL, RelCol::Thing2Id)));
    }
    for (alias, key) in keys.iter() {
        select.from_as(Alias::new(&tables.data), Alias::new(&alias));
        joins = joins
            .add(col_eq((&alias, DataCol::ThingId), (REL, RelCol::RelId)))
            .add(Expr::col((Alias::new(&alias), DataCol::Key)).eq(key));
    }
    Ok(finish(select, joins.add(condition), orders, window))
}

/// Live (not deleted, not spam) things among `ids` ordered by the raw value
/// of attribute `key`. Things without the attribute are left out.
pub(crate) fn sort_by_data_value(
    tables: &ThingTables,
    ids: &[ThingId],
    key: &str,
    limit: Option<u64>,
    desc: bool,
) -> SelectStatement {
    let data = "d";
    let mut select = Query::select();
    select
        .expr_as(
            Expr::col((Alias::new(THING), ThingCol::ThingId)),
            Alias::new("thing_id"),
        )
        .from_as(Alias::new(&tables.thing), Alias::new(THING))
        .from_as(Alias::new(&tables.data), Alias::new(data))
        .cond_where(
            Condition::all()
                .add(col_eq((data, DataCol::ThingId), (THING, ThingCol::ThingId)))
                .add(
                    Expr::col((Alias::new(THING), ThingCol::ThingId))
                        .is_in(ids.iter().map(|id| id.as_i64())),
                )
                .add(Expr::col((Alias::new(THING), ThingCol::Deleted)).eq(false))
                .add(Expr::col((Alias::new(THING), ThingCol::Spam)).eq(false))
                .add(Expr::col((Alias::new(data), DataCol::Key)).eq(key)),
        )
        .order_by_expr(
            Expr::col((Alias::new(data), DataCol::Value)),
            if desc { Order::Desc } else { Order::Asc },
        );
    if let Some(limit) = limit {
        select.limit(limit);
    }
    select
}

pub(crate) fn decode_thing_id(row: &QueryResult) -> TdbResult<ThingId> {
    row.try_get::<i64>("", "thing_id")
        .map(ThingId)
        .map_err(|err| TdbError::storage(format!("thing_id column: {err}")))
}

pub(crate) fn decode_rel_fields(row: &QueryResult, fields: &[RelField]) -> TdbResult<RelFields> {
    let storage = |err: sea_orm::DbErr| TdbError::storage(format!("relation row: {err}"));
    let mut out = RelFields::default();
    for field in fields {
        let column = field.column();
        match field {
            RelField::RelId => {
                out.rel_id = Some(RelId(row.try_get::<i64>("", column).map_err(storage)?));
            }
            RelField::Thing1Id => {
                out.thing1_id = Some(ThingId(row.try_get::<i64>("", column).map_err(storage)?));
            }
            RelField::Thing2Id => {
                out.thing2_id = Some(ThingId(row.try_get::<i64>("", column).map_err(storage)?));
            }
            RelField::Name => {
                out.name = Some(row.try_get::<String>("", column).map_err(storage)?);
            }
            RelField::Date => {
                out.date = Some(Timestamp(row.try_get::<i64>("", column).map_err(storage)?));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use sea_orm::DatabaseBackend;
    use sea_orm::sea_query::SqliteQueryBuilder;

    use super::{find_data, find_rels, find_things, sort_by_data_value};
    use crate::compile::Compiler;
    use crate::registry::{RelTables, ThingTables};
    use tdb_core::{
        ErrorKind, QueryWindow, RelField, ThingId, desc, eq, gt, lower, or_,
    };

    fn link_tables() -> ThingTables {
        ThingTables {
            engine: "main".to_string(),
            thing: "reddit_thing_link".to_string(),
            data: "reddit_data_link".to_string(),
        }
    }

    fn vote_tables() -> RelTables {
        RelTables {
            engine: "main".to_string(),
            rel: "reddit_rel_vote".to_string(),
            data: "reddit_data_rel_vote".to_string(),
            thing1: "reddit_thing_account".to_string(),
            thing2: "reddit_thing_link".to_string(),
        }
    }

    fn compiler() -> Compiler {
        Compiler::new(DatabaseBackend::Sqlite, 1000)
    }

    #[test]
    fn find_things_rejects_attribute_names() {
        let err = find_things(
            &compiler(),
            &link_tables(),
            &QueryWindow::default(),
            &[eq("url", "x")],
        )
        .expect_err("attribute");
        assert_eq!(err.kind(), ErrorKind::QueryConstraint);
    }

    #[test]
    fn find_things_orders_and_pages() {
        let select = find_things(
            &compiler(),
            &link_tables(),
            &QueryWindow::sorted([desc("_score")]).limit(10).offset(5),
            &[eq("_deleted", false)],
        )
        .expect("compile");
        let sql = select.to_string(SqliteQueryBuilder);
        assert!(sql.contains(r#"FROM "reddit_thing_link" AS "t""#), "{sql}");
        assert!(sql.contains("ORDER BY"), "{sql}");
        assert!(sql.contains("LIMIT 10"), "{sql}");
        assert!(sql.contains("OFFSET 5"), "{sql}");
    }

    #[test]
    fn find_data_aliases_each_key_once() {
        let select = find_data(
            &compiler(),
            &link_tables(),
            &QueryWindow::default(),
            &[
                or_([eq("url", "a"), eq("url", "b")]),
                eq(lower("domain"), "x.com"),
                gt("_ups", 2),
            ],
        )
        .expect("compile");
        let sql = select.to_string(SqliteQueryBuilder);
        assert!(sql.contains(r#""reddit_data_link" AS "d0""#), "{sql}");
        assert!(sql.contains(r#""reddit_data_link" AS "d1""#), "{sql}");
        assert!(!sql.contains(r#"AS "d2""#), "{sql}");
        assert!(sql.contains(r#""reddit_thing_link" AS "t""#), "{sql}");
        assert!(sql.contains("substr"), "{sql}");
    }

    #[test]
    fn find_data_requires_an_attribute_rule() {
        let err = find_data(
            &compiler(),
            &link_tables(),
            &QueryWindow::sorted([desc("url")]),
            &[eq("_ups", 1)],
        )
        .expect_err("no data rule");
        assert_eq!(err.kind(), ErrorKind::QueryConstraint);
    }

    #[test]
    fn find_rels_joins_endpoint_things() {
        let select = find_rels(
            &compiler(),
            &vote_tables(),
            &[RelField::Thing2Id, RelField::Name],
            &QueryWindow::sorted([desc("_t2_date")]),
            &[eq("_thing1_id", 7), eq("_t2_deleted", false)],
        )
        .expect("compile");
        let sql = select.to_string(SqliteQueryBuilder);
        assert!(sql.contains(r#""reddit_thing_link" AS "t2""#), "{sql}");
        assert!(!sql.contains(r#"AS "t1""#), "{sql}");
        assert!(sql.contains(r#""r"."name" AS "name""#), "{sql}");
    }

    #[test]
    fn find_rels_needs_props() {
        let err = find_rels(
            &compiler(),
            &vote_tables(),
            &[],
            &QueryWindow::default(),
            &[],
        )
        .expect_err("no props");
        assert_eq!(err.kind(), ErrorKind::QueryConstraint);
    }

    #[test]
    fn data_value_sort_filters_dead_things() {
        let sql = sort_by_data_value(&link_tables(), &[ThingId(1), ThingId(2)], "rank", Some(1), true)
            .to_string(SqliteQueryBuilder);
        assert!(sql.contains(r#""t"."deleted" = "#), "{sql}");
        assert!(sql.contains("DESC"), "{sql}");
        assert!(sql.contains("LIMIT 1"), "{sql}");
    }
}
