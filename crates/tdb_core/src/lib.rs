pub mod api;
pub mod error;
pub mod ids;
pub mod observe;
pub mod operators;
pub mod schema;
pub mod sorts;
pub mod time;
pub mod value;

pub use api::*;
pub use error::{ErrorKind, TdbError, TdbResult};
pub use ids::*;
pub use observe::*;
pub use operators::*;
pub use schema::*;
pub use self::time::*;
pub use value::{AttrKind, AttrMap, AttrValue, JsonOpaqueCodec, OpaqueCodec};
