use sea_orm::sea_query;
use sea_orm_migration::prelude::Iden;

#[derive(Iden, Clone, Copy)]
pub enum TypeCol {
    Id,
    Name,
}

#[derive(Iden, Clone, Copy)]
pub enum RelTypeCol {
    Id,
    Type1Id,
    Type2Id,
    Name,
}

#[derive(Iden, Clone, Copy)]
pub enum ThingCol {
    ThingId,
    Ups,
    Downs,
    Deleted,
    Spam,
    Date,
    /// SQLite only: rank columns kept current by the writer.
    Hot,
    Controversy,
}

/// Attribute rows; relation data tables reuse the same layout keyed by
/// relation id.
#[derive(Iden, Clone, Copy)]
pub enum DataCol {
    ThingId,
    Key,
    Value,
    Kind,
}

#[derive(Iden, Clone, Copy)]
pub enum RelCol {
    RelId,
    Thing1Id,
    Thing2Id,
    Name,
    Date,
}

#[derive(Iden, Clone, Copy)]
pub enum HardCacheCol {
    Category,
    Ids,
    Value,
    Kind,
    Expiration,
}

pub fn type_table(app: &str) -> String {
    format!("{app}_type")
}

pub fn rel_type_table(app: &str) -> String {
    format!("{app}_type_rel")
}

pub fn thing_table(app: &str, type_name: &str) -> String {
    format!("{app}_thing_{type_name}")
}

pub fn data_table(app: &str, type_name: &str) -> String {
    format!("{app}_data_{type_name}")
}

pub fn rel_table(app: &str, rel_name: &str) -> String {
    format!("{app}_rel_{rel_name}")
}

pub fn rel_data_table(app: &str, rel_name: &str) -> String {
    format!("{app}_data_rel_{rel_name}")
}

pub fn hardcache_table(app: &str) -> String {
    format!("{app}_hardcache")
}
