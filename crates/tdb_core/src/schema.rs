use serde::{Deserialize, Serialize};

use crate::{RelId, TdbError, TdbResult, ThingId, Timestamp};

/// The fixed columns of one thing row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThingRow {
    pub thing_id: ThingId,
    pub ups: i64,
    pub downs: i64,
    pub deleted: bool,
    pub spam: bool,
    pub date: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelRow {
    pub rel_id: RelId,
    pub thing1_id: ThingId,
    pub thing2_id: ThingId,
    pub name: String,
    pub date: Timestamp,
}

/// Input for `make_thing`. A missing id is assigned by the database, a
/// missing date is stamped from the store clock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewThing {
    pub thing_id: Option<ThingId>,
    pub ups: i64,
    pub downs: i64,
    pub deleted: bool,
    pub spam: bool,
    pub date: Option<Timestamp>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThingPropsUpdate {
    pub ups: Option<i64>,
    pub downs: Option<i64>,
    pub deleted: Option<bool>,
    pub spam: Option<bool>,
    pub date: Option<Timestamp>,
}

impl ThingPropsUpdate {
    pub fn is_empty(&self) -> bool {
        self.ups.is_none()
            && self.downs.is_none()
            && self.deleted.is_none()
            && self.spam.is_none()
            && self.date.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelPropsUpdate {
    pub thing1_id: Option<ThingId>,
    pub thing2_id: Option<ThingId>,
    pub name: Option<String>,
    pub date: Option<Timestamp>,
}

impl RelPropsUpdate {
    pub fn is_empty(&self) -> bool {
        self.thing1_id.is_none() && self.thing2_id.is_none() && self.name.is_none() && self.date.is_none()
    }
}

/// Vote counters that may be incremented in place.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Counter {
    Ups,
    Downs,
}

impl Counter {
    pub fn column(self) -> &'static str {
        match self {
            Counter::Ups => "ups",
            Counter::Downs => "downs",
        }
    }
}

/// Relation columns a `find_rels` caller may ask for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RelField {
    RelId,
    Thing1Id,
    Thing2Id,
    Name,
    Date,
}

impl RelField {
    pub const ALL: [RelField; 5] = [
        RelField::RelId,
        RelField::Thing1Id,
        RelField::Thing2Id,
        RelField::Name,
        RelField::Date,
    ];

    pub fn parse(prop: &str) -> TdbResult<Self> {
        match prop {
            "_rel_id" => Ok(RelField::RelId),
            "_thing1_id" => Ok(RelField::Thing1Id),
            "_thing2_id" => Ok(RelField::Thing2Id),
            "_name" => Ok(RelField::Name),
            "_date" => Ok(RelField::Date),
            other => Err(TdbError::query(format!("unsupported relation prop '{other}'"))),
        }
    }

    pub fn prop(self) -> &'static str {
        match self {
            RelField::RelId => "_rel_id",
            RelField::Thing1Id => "_thing1_id",
            RelField::Thing2Id => "_thing2_id",
            RelField::Name => "_name",
            RelField::Date => "_date",
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            RelField::RelId => "rel_id",
            RelField::Thing1Id => "thing1_id",
            RelField::Thing2Id => "thing2_id",
            RelField::Name => "name",
            RelField::Date => "date",
        }
    }
}

/// One `find_rels` result; only the requested fields are populated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelFields {
    pub rel_id: Option<RelId>,
    pub thing1_id: Option<ThingId>,
    pub thing2_id: Option<ThingId>,
    pub name: Option<String>,
    pub date: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::{RelField, ThingPropsUpdate};
    use crate::ErrorKind;

    #[test]
    fn rel_fields_parse_known_props() {
        for field in RelField::ALL {
            assert_eq!(RelField::parse(field.prop()).expect("known"), field);
        }
        let err = RelField::parse("_bogus").expect_err("unknown prop");
        assert_eq!(err.kind(), ErrorKind::QueryConstraint);
    }

    #[test]
    fn empty_props_update() {
        assert!(ThingPropsUpdate::default().is_empty());
        let update = ThingPropsUpdate {
            spam: Some(true),
            ..ThingPropsUpdate::default()
        };
        assert!(!update.is_empty());
    }
}
