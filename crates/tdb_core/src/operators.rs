//! Constraint and sort expressions accepted by the query engine.
//!
//! Column names follow the thing store conventions: fixed columns carry a
//! leading underscore (`_ups`, `_date`, `_hot`), relation endpoint columns a
//! `_t1_` / `_t2_` prefix, and bare names refer to data attributes.

use crate::{AttrValue, Interval, TdbResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
}

/// SQL-side functions that may wrap a column reference.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum QueryFunc {
    Lower,
    IpNetwork,
    BaseUrl,
}

impl QueryFunc {
    pub fn sql_name(self) -> &'static str {
        match self {
            QueryFunc::Lower => "lower",
            QueryFunc::IpNetwork => "ip_network",
            QueryFunc::BaseUrl => "base_url",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Lval {
    Column(String),
    Func(QueryFunc, Box<Lval>),
}

impl Lval {
    /// The column name at the bottom of any function wrappers.
    pub fn name(&self) -> &str {
        match self {
            Lval::Column(name) => name,
            Lval::Func(_, inner) => inner.name(),
        }
    }

    pub fn is_func(&self) -> bool {
        matches!(self, Lval::Func(..))
    }

    /// Function wrappers from outermost to innermost.
    pub fn funcs(&self) -> Vec<QueryFunc> {
        let mut out = Vec::new();
        let mut current = self;
        while let Lval::Func(func, inner) = current {
            out.push(*func);
            current = inner;
        }
        out
    }
}

impl From<&str> for Lval {
    fn from(value: &str) -> Self {
        Lval::Column(value.to_string())
    }
}

impl From<String> for Lval {
    fn from(value: String) -> Self {
        Lval::Column(value)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Rval {
    Values(Vec<AttrValue>),
    /// "now minus interval", evaluated by the database.
    TimeAgo(Interval),
}

macro_rules! scalar_rval {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Rval {
                fn from(value: $ty) -> Self {
                    Rval::Values(vec![value.into()])
                }
            }
        )*
    };
}

scalar_rval!(AttrValue, bool, &str, String, i32, i64, f64, crate::Timestamp);

impl From<Vec<AttrValue>> for Rval {
    fn from(value: Vec<AttrValue>) -> Self {
        Rval::Values(value)
    }
}

/// Wrapper for multi-value right hand sides: `eq("_name", any_of(["a", "b"]))`.
pub fn any_of<I, T>(values: I) -> Rval
where
    I: IntoIterator<Item = T>,
    T: Into<AttrValue>,
{
    Rval::Values(values.into_iter().map(Into::into).collect())
}

#[derive(Clone, Debug, PartialEq)]
pub struct Comparison {
    pub op: CompareOp,
    pub lval: Lval,
    pub rval: Rval,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    Compare(Comparison),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// Depth-first walk over every leaf comparison.
    pub fn leaves(&self) -> Vec<&Comparison> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Comparison>) {
        match self {
            Predicate::Compare(cmp) => out.push(cmp),
            Predicate::And(children) | Predicate::Or(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
            Predicate::Not(child) => child.collect_leaves(out),
        }
    }
}

/// Compile a predicate tree bottom-up. `leaf` turns one comparison into the
/// target representation; the combinator closures join compiled children.
pub fn fold<T>(
    predicate: &Predicate,
    leaf: &mut dyn FnMut(&Comparison) -> TdbResult<T>,
    all: &dyn Fn(Vec<T>) -> T,
    any: &dyn Fn(Vec<T>) -> T,
    negate: &dyn Fn(T) -> T,
) -> TdbResult<T> {
    match predicate {
        Predicate::Compare(cmp) => leaf(cmp),
        Predicate::And(children) => {
            let compiled = children
                .iter()
                .map(|child| fold(child, leaf, all, any, negate))
                .collect::<TdbResult<Vec<_>>>()?;
            Ok(all(compiled))
        }
        Predicate::Or(children) => {
            let compiled = children
                .iter()
                .map(|child| fold(child, leaf, all, any, negate))
                .collect::<TdbResult<Vec<_>>>()?;
            Ok(any(compiled))
        }
        Predicate::Not(child) => Ok(negate(fold(child, leaf, all, any, negate)?)),
    }
}

/// Every leaf across a constraint list, in order.
pub fn op_iter(constraints: &[Predicate]) -> Vec<&Comparison> {
    constraints.iter().flat_map(Predicate::leaves).collect()
}

fn compare(op: CompareOp, lval: impl Into<Lval>, rval: impl Into<Rval>) -> Predicate {
    Predicate::Compare(Comparison {
        op,
        lval: lval.into(),
        rval: rval.into(),
    })
}

pub fn eq(lval: impl Into<Lval>, rval: impl Into<Rval>) -> Predicate {
    compare(CompareOp::Eq, lval, rval)
}

pub fn ne(lval: impl Into<Lval>, rval: impl Into<Rval>) -> Predicate {
    compare(CompareOp::Ne, lval, rval)
}

pub fn gt(lval: impl Into<Lval>, rval: impl Into<Rval>) -> Predicate {
    compare(CompareOp::Gt, lval, rval)
}

pub fn lt(lval: impl Into<Lval>, rval: impl Into<Rval>) -> Predicate {
    compare(CompareOp::Lt, lval, rval)
}

pub fn gte(lval: impl Into<Lval>, rval: impl Into<Rval>) -> Predicate {
    compare(CompareOp::Gte, lval, rval)
}

pub fn lte(lval: impl Into<Lval>, rval: impl Into<Rval>) -> Predicate {
    compare(CompareOp::Lte, lval, rval)
}

pub fn in_(lval: impl Into<Lval>, rval: impl Into<Rval>) -> Predicate {
    compare(CompareOp::In, lval, rval)
}

pub fn and_(children: impl IntoIterator<Item = Predicate>) -> Predicate {
    Predicate::And(children.into_iter().collect())
}

pub fn or_(children: impl IntoIterator<Item = Predicate>) -> Predicate {
    Predicate::Or(children.into_iter().collect())
}

pub fn not_(child: Predicate) -> Predicate {
    Predicate::Not(Box::new(child))
}

pub fn timeago(interval: &str) -> TdbResult<Rval> {
    Ok(Rval::TimeAgo(Interval::parse(interval)?))
}

pub fn lower(lval: impl Into<Lval>) -> Lval {
    Lval::Func(QueryFunc::Lower, Box::new(lval.into()))
}

pub fn ip_network(lval: impl Into<Lval>) -> Lval {
    Lval::Func(QueryFunc::IpNetwork, Box::new(lval.into()))
}

pub fn base_url(lval: impl Into<Lval>) -> Lval {
    Lval::Func(QueryFunc::BaseUrl, Box::new(lval.into()))
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sort {
    pub lval: Lval,
    pub direction: SortDirection,
}

impl From<&str> for Sort {
    fn from(value: &str) -> Self {
        asc(value)
    }
}

pub fn asc(lval: impl Into<Lval>) -> Sort {
    Sort {
        lval: lval.into(),
        direction: SortDirection::Asc,
    }
}

pub fn desc(lval: impl Into<Lval>) -> Sort {
    Sort {
        lval: lval.into(),
        direction: SortDirection::Desc,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CompareOp, Lval, Predicate, QueryFunc, Rval, SortDirection, and_, any_of, desc, eq, fold,
        gt, lower, not_, op_iter, or_, timeago,
    };
    use crate::AttrValue;

    #[test]
    fn scalar_rvals_become_single_tuples() {
        let Predicate::Compare(cmp) = eq("_ups", 3) else {
            panic!("expected comparison");
        };
        assert_eq!(cmp.rval, Rval::Values(vec![AttrValue::Int(3)]));
        assert_eq!(cmp.op, CompareOp::Eq);
    }

    #[test]
    fn lval_name_sees_through_functions() {
        let lval = lower("name");
        assert_eq!(lval.name(), "name");
        assert_eq!(lval.funcs(), vec![QueryFunc::Lower]);
        assert!(!Lval::from("name").is_func());
    }

    #[test]
    fn op_iter_walks_nested_combinators() {
        let constraints = vec![
            eq("_deleted", false),
            or_([gt("_ups", 10), not_(and_([eq("url", "x"), eq("_spam", true)]))]),
        ];
        let names: Vec<&str> = op_iter(&constraints)
            .iter()
            .map(|cmp| cmp.lval.name())
            .collect();
        assert_eq!(names, vec!["_deleted", "_ups", "url", "_spam"]);
    }

    #[test]
    fn fold_renders_tree_shape() {
        let predicate = or_([eq("a", any_of(["x", "y"])), not_(gt("_ups", 1))]);
        let rendered = fold(
            &predicate,
            &mut |cmp| Ok(cmp.lval.name().to_string()),
            &|children| format!("all({})", children.join(",")),
            &|children| format!("any({})", children.join(",")),
            &|child| format!("not({child})"),
        )
        .expect("fold");
        assert_eq!(rendered, "any(a,not(_ups))");
    }

    #[test]
    fn timeago_and_sort_builders() {
        assert!(matches!(timeago("1 day").expect("interval"), Rval::TimeAgo(_)));
        assert_eq!(desc("_hot").direction, SortDirection::Desc);
    }
}
