//! Lowering of predicate trees and sort specs to sea-query expressions.

use sea_orm::DatabaseBackend;
use sea_orm::sea_query::{Alias, Condition, Expr, ExprTrait, Func, Order, SelectStatement};

use crate::db::{RelCol, ThingCol};
use crate::schema::quote_ident;
use tdb_core::value::query_text;
use tdb_core::{
    AttrValue, CompareOp, Comparison, Lval, Predicate, QueryFunc, QueryWindow, Rval, SortDirection,
    TdbError, TdbResult, operators,
};

/// How right hand side values are bound against a column.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ColKind {
    Int,
    Bool,
    /// Microsecond timestamps; accepts `timeago`.
    Date,
    Float,
    Text,
}

pub(crate) struct Compiler {
    backend: DatabaseBackend,
    max_val_len: usize,
}

impl Compiler {
    pub fn new(backend: DatabaseBackend, max_val_len: usize) -> Self {
        Self {
            backend,
            max_val_len,
        }
    }

    fn qcol(&self, alias: &str, col: &str) -> String {
        format!(
            "{}.{}",
            quote_ident(self.backend, alias),
            quote_ident(self.backend, col)
        )
    }

    /// Fixed thing column, named without its leading underscore.
    pub fn thing_column(&self, alias: &str, name: &str) -> TdbResult<(Expr, ColKind)> {
        let col = |col: ThingCol| Expr::col((Alias::new(alias), col));
        Ok(match name {
            "id" | "thing_id" => (col(ThingCol::ThingId), ColKind::Int),
            "ups" => (col(ThingCol::Ups), ColKind::Int),
            "downs" => (col(ThingCol::Downs), ColKind::Int),
            "deleted" => (col(ThingCol::Deleted), ColKind::Bool),
            "spam" => (col(ThingCol::Spam), ColKind::Bool),
            "date" => (col(ThingCol::Date), ColKind::Date),
            "score" => (self.score(alias), ColKind::Int),
            "hot" => (self.hot(alias), ColKind::Float),
            "controversy" => (self.controversy(alias), ColKind::Float),
            other => {
                return Err(TdbError::query(format!("unknown thing column '_{other}'")));
            }
        })
    }

    /// Fixed relation column, named without its leading underscore.
    pub fn rel_column(&self, alias: &str, name: &str) -> TdbResult<(Expr, ColKind)> {
        let col = |col: RelCol| Expr::col((Alias::new(alias), col));
        Ok(match name {
            "id" | "rel_id" => (col(RelCol::RelId), ColKind::Int),
            "thing1_id" => (col(RelCol::Thing1Id), ColKind::Int),
            "thing2_id" => (col(RelCol::Thing2Id), ColKind::Int),
            "name" => (col(RelCol::Name), ColKind::Text),
            "date" => (col(RelCol::Date), ColKind::Date),
            other => {
                return Err(TdbError::query(format!(
                    "unknown relation column '_{other}'"
                )));
            }
        })
    }

    pub fn score(&self, alias: &str) -> Expr {
        let (ups, downs) = (self.qcol(alias, "ups"), self.qcol(alias, "downs"));
        match self.backend {
            DatabaseBackend::Postgres => Expr::cust(format!("score({ups}, {downs})")),
            _ => Expr::cust(format!("({ups} - {downs})")),
        }
    }

    pub fn hot(&self, alias: &str) -> Expr {
        let (ups, downs, date) = (
            self.qcol(alias, "ups"),
            self.qcol(alias, "downs"),
            self.qcol(alias, "date"),
        );
        match self.backend {
            DatabaseBackend::Postgres => Expr::cust(format!("hot({ups}, {downs}, {date})")),
            DatabaseBackend::MySql => Expr::cust(format!(
                "ROUND(SIGN({ups} - {downs}) * LOG10(GREATEST(ABS({ups} - {downs}), 1)) \
                 + ({date} / 1000000.0 - 1134028003) / 45000.0, 7)"
            )),
            _ => Expr::col((Alias::new(alias), ThingCol::Hot)),
        }
    }

    pub fn controversy(&self, alias: &str) -> Expr {
        let (ups, downs) = (self.qcol(alias, "ups"), self.qcol(alias, "downs"));
        match self.backend {
            DatabaseBackend::Postgres => Expr::cust(format!("controversy({ups}, {downs})")),
            DatabaseBackend::MySql => Expr::cust(format!(
                "(CASE WHEN {ups} <= 0 OR {downs} <= 0 THEN 0 \
                 ELSE POW({ups} + {downs}, GREATEST({ups}, {downs}) / LEAST({ups}, {downs})) END)"
            )),
            _ => Expr::col((Alias::new(alias), ThingCol::Controversy)),
        }
    }

    /// Current time in microseconds, evaluated by the database.
    pub fn now_micros(&self) -> Expr {
        Expr::cust(match self.backend {
            DatabaseBackend::Postgres => {
                "CAST(EXTRACT(EPOCH FROM CURRENT_TIMESTAMP) * 1000000 AS BIGINT)"
            }
            DatabaseBackend::MySql => {
                "CAST(UNIX_TIMESTAMP(CURRENT_TIMESTAMP(6)) * 1000000 AS SIGNED)"
            }
            _ => "(CAST(strftime('%s', 'now') AS INTEGER) * 1000000)",
        })
    }

    /// Wrap `expr` in the lval's functions, innermost first.
    pub fn apply_funcs(&self, lval: &Lval, expr: Expr) -> TdbResult<Expr> {
        let mut out = expr;
        for func in lval.funcs().into_iter().rev() {
            out = match func {
                QueryFunc::Lower => Func::lower(out).into(),
                QueryFunc::IpNetwork | QueryFunc::BaseUrl => {
                    if self.backend != DatabaseBackend::Postgres {
                        return Err(TdbError::query(format!(
                            "{} is only available on postgres",
                            func.sql_name()
                        )));
                    }
                    Func::cust(Alias::new(func.sql_name())).arg(out).into()
                }
            };
        }
        Ok(out)
    }

    /// Comparison against a typed fixed column.
    pub fn compare_fixed(&self, cmp: &Comparison, kind: ColKind, lhs: Expr) -> TdbResult<Condition> {
        let lhs = self.apply_funcs(&cmp.lval, lhs)?;
        match &cmp.rval {
            Rval::TimeAgo(interval) => {
                if !matches!(kind, ColKind::Date | ColKind::Int) {
                    return Err(TdbError::query(format!(
                        "timeago needs a date column, got '{}'",
                        cmp.lval.name()
                    )));
                }
                let rhs = self.now_micros().sub(interval.as_micros());
                Ok(Condition::all().add(binary(cmp.op, lhs, rhs)))
            }
            Rval::Values(values) => {
                let rhs = values
                    .iter()
                    .map(|value| fixed_value(kind, value, cmp.lval.name()))
                    .collect::<TdbResult<Vec<_>>>()?;
                Ok(compare_values(cmp.op, lhs, rhs))
            }
        }
    }

    /// Comparison against an attribute value column. Bare lvals compare the
    /// truncated value so the key/value prefix index applies.
    pub fn compare_data(&self, cmp: &Comparison, value_col: Expr) -> TdbResult<Condition> {
        let lhs = if cmp.lval.is_func() {
            self.apply_funcs(&cmp.lval, value_col)?
        } else {
            self.truncate(value_col)
        };
        let Rval::Values(values) = &cmp.rval else {
            return Err(TdbError::query(format!(
                "timeago is not supported on attribute '{}'",
                cmp.lval.name()
            )));
        };
        let rhs = values
            .iter()
            .map(|value| {
                query_text(value).map(|text| {
                    let truncated: String = text.chars().take(self.max_val_len).collect();
                    Expr::val(truncated)
                })
            })
            .map(|value| value.unwrap_or_else(null_text))
            .collect();
        Ok(compare_values(cmp.op, lhs, rhs))
    }

    fn truncate(&self, expr: Expr) -> Expr {
        Func::cust(Alias::new("substr"))
            .args([expr, Expr::val(1), Expr::val(self.max_val_len as i64)])
            .into()
    }

    /// Fold a predicate tree, lowering each leaf with `leaf`.
    pub fn condition(
        &self,
        predicate: &Predicate,
        leaf: &mut dyn FnMut(&Comparison) -> TdbResult<Condition>,
    ) -> TdbResult<Condition> {
        operators::fold(
            predicate,
            leaf,
            &|children| {
                children
                    .into_iter()
                    .fold(Condition::all(), |acc, child| acc.add(child))
            },
            &|children| {
                children
                    .into_iter()
                    .fold(Condition::any(), |acc, child| acc.add(child))
            },
            &|child| child.not(),
        )
    }
}

/// Marker used in place of `NULL` literals so `Eq`/`Ne` lower to null tests.
fn null_text() -> Expr {
    Expr::val(Option::<String>::None)
}

fn is_null_literal(expr: &Expr) -> bool {
    *expr == null_text()
}

fn binary(op: CompareOp, lhs: Expr, rhs: Expr) -> Expr {
    match op {
        CompareOp::Eq | CompareOp::In => lhs.eq(rhs),
        CompareOp::Ne => lhs.ne(rhs),
        CompareOp::Gt => lhs.gt(rhs),
        CompareOp::Lt => lhs.lt(rhs),
        CompareOp::Gte => lhs.gte(rhs),
        CompareOp::Lte => lhs.lte(rhs),
    }
}

/// Multi-value right hand sides become an OR of pairwise comparisons; an
/// empty one can never match.
fn compare_values(op: CompareOp, lhs: Expr, rhs: Vec<Expr>) -> Condition {
    if rhs.is_empty() {
        return Condition::all().add(Expr::val(1).eq(2));
    }
    if op == CompareOp::In && !rhs.iter().any(is_null_literal) {
        return Condition::all().add(lhs.is_in(rhs));
    }
    rhs.into_iter().fold(Condition::any(), |acc, value| {
        let leaf = if is_null_literal(&value) {
            match op {
                CompareOp::Ne => lhs.clone().is_not_null(),
                _ => lhs.clone().is_null(),
            }
        } else {
            binary(op, lhs.clone(), value)
        };
        acc.add(leaf)
    })
}

fn fixed_value(kind: ColKind, value: &AttrValue, column: &str) -> TdbResult<Expr> {
    let mismatch = || {
        TdbError::query(format!(
            "value {value:?} does not fit column '{column}'"
        ))
    };
    Ok(match (kind, value) {
        (_, AttrValue::None) => null_text(),
        (ColKind::Int | ColKind::Date, AttrValue::Int(number)) => Expr::val(*number),
        (ColKind::Int | ColKind::Date | ColKind::Float, AttrValue::Float(number)) => {
            Expr::val(*number)
        }
        (ColKind::Float, AttrValue::Int(number)) => Expr::val(*number as f64),
        (ColKind::Bool, AttrValue::Bool(flag)) => Expr::val(*flag),
        (ColKind::Bool, AttrValue::Int(number)) => Expr::val(*number != 0),
        (ColKind::Text, AttrValue::Str(text)) => Expr::val(text.clone()),
        (ColKind::Text, other) => Expr::val(query_text(other).ok_or_else(mismatch)?),
        _ => return Err(mismatch()),
    })
}

pub(crate) fn order(direction: SortDirection) -> Order {
    match direction {
        SortDirection::Asc => Order::Asc,
        SortDirection::Desc => Order::Desc,
    }
}

pub(crate) fn apply_window(select: &mut SelectStatement, window: &QueryWindow) {
    match (window.limit, window.offset) {
        (Some(limit), offset) => {
            select.limit(limit);
            if let Some(offset) = offset {
                select.offset(offset);
            }
        }
        (None, Some(offset)) => {
            select.limit(i64::MAX as u64);
            select.offset(offset);
        }
        (None, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use sea_orm::DatabaseBackend;
    use sea_orm::sea_query::{Alias, Query, SqliteQueryBuilder};

    use super::Compiler;
    use tdb_core::{ErrorKind, any_of, eq, gt, ip_network, lower, not_, or_, timeago};

    fn render(compiler: &Compiler, predicate: &tdb_core::Predicate) -> String {
        let mut leaf = |cmp: &tdb_core::Comparison| -> tdb_core::TdbResult<_> {
            let name = cmp.lval.name().trim_start_matches('_');
            let (expr, kind) = compiler.thing_column("t", name)?;
            compiler.compare_fixed(cmp, kind, expr)
        };
        let condition = compiler.condition(predicate, &mut leaf).expect("compile");
        Query::select()
            .column(Alias::new("x"))
            .from(Alias::new("tbl"))
            .cond_where(condition)
            .to_string(SqliteQueryBuilder)
    }

    #[test]
    fn multi_value_rvals_or_together() {
        let compiler = Compiler::new(DatabaseBackend::Sqlite, 1000);
        let sql = render(&compiler, &eq("_ups", any_of([1, 2])));
        assert!(sql.contains(r#""t"."ups" = 1 OR "t"."ups" = 2"#), "{sql}");
    }

    #[test]
    fn empty_rval_never_matches() {
        let compiler = Compiler::new(DatabaseBackend::Sqlite, 1000);
        let sql = render(&compiler, &eq("_ups", any_of(Vec::<i64>::new())));
        assert!(sql.contains("1 = 2"), "{sql}");
    }

    #[test]
    fn not_and_or_nest() {
        let compiler = Compiler::new(DatabaseBackend::Sqlite, 1000);
        let sql = render(
            &compiler,
            &or_([eq("_spam", true), not_(gt("_downs", 3))]),
        );
        assert!(sql.contains("NOT"), "{sql}");
        assert!(sql.contains(" OR "), "{sql}");
    }

    #[test]
    fn timeago_uses_database_clock() {
        let compiler = Compiler::new(DatabaseBackend::Sqlite, 1000);
        let sql = render(&compiler, &gt("_date", timeago("1 day").expect("interval")));
        assert!(sql.contains("strftime"), "{sql}");
        assert!(sql.contains("86400000000"), "{sql}");
    }

    #[test]
    fn sqlite_ranks_read_stored_columns() {
        let compiler = Compiler::new(DatabaseBackend::Sqlite, 1000);
        let sql = render(&compiler, &gt("_hot", 1));
        assert!(sql.contains(r#""t"."hot" > 1"#), "{sql}");
        let sql = render(&compiler, &gt("_controversy", 0));
        assert!(sql.contains(r#""t"."controversy" > 0"#), "{sql}");
        assert!(!sql.contains("POWER"), "{sql}");

        let compiler = Compiler::new(DatabaseBackend::Postgres, 1000);
        let (expr, _) = compiler.thing_column("t", "hot").expect("hot");
        let sql = Query::select()
            .expr(expr)
            .to_string(sea_orm::sea_query::PostgresQueryBuilder);
        assert!(sql.contains(r#"hot("t"."ups", "t"."downs", "t"."date")"#), "{sql}");
    }

    #[test]
    fn fixed_columns_reject_unknown_names() {
        let compiler = Compiler::new(DatabaseBackend::Sqlite, 1000);
        let err = compiler.thing_column("t", "karma").expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::QueryConstraint);
    }

    #[test]
    fn network_functions_need_postgres() {
        let compiler = Compiler::new(DatabaseBackend::Sqlite, 1000);
        let lval = ip_network("ip");
        assert!(compiler.apply_funcs(&lval, sea_orm::sea_query::Expr::val("x")).is_err());
        let lval = lower("name");
        assert!(compiler.apply_funcs(&lval, sea_orm::sea_query::Expr::val("x")).is_ok());
    }
}
