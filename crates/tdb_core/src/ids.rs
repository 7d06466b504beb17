use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{TdbError, TdbResult};

/// Largest id a BIGINT primary key can carry.
pub const MAX_THING_ID: i64 = i64::MAX;
pub const MIN_THING_ID: i64 = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TypeId(pub i64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThingId(pub i64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RelId(pub i64);

impl ThingId {
    pub fn new(value: i64) -> TdbResult<Self> {
        if value < MIN_THING_ID {
            return Err(TdbError::invalid(format!("thing id {value} out of range")));
        }
        Ok(Self(value))
    }
}

macro_rules! id_wrapper {
    ($name:ident) => {
        impl $name {
            pub fn as_i64(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_i64(self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                Ok(Self(i64::deserialize(deserializer)?))
            }
        }
    };
}

id_wrapper!(TypeId);
id_wrapper!(ThingId);
id_wrapper!(RelId);
