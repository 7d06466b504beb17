use std::collections::BTreeMap;
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{TdbError, TdbResult, Timestamp};

/// A dynamically typed attribute value as stored in the data tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    Str(String),
    Int(i64),
    Float(f64),
    None,
    /// Caller-serialized payload; see [`OpaqueCodec`].
    Opaque(Vec<u8>),
}

pub type AttrMap = BTreeMap<String, AttrValue>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrKind {
    Bool,
    Str,
    Num,
    None,
    Pickle,
}

impl AttrKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttrKind::Bool => "bool",
            AttrKind::Str => "str",
            AttrKind::Num => "num",
            AttrKind::None => "none",
            AttrKind::Pickle => "pickle",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bool" => Some(AttrKind::Bool),
            "str" => Some(AttrKind::Str),
            "num" => Some(AttrKind::Num),
            "none" => Some(AttrKind::None),
            "pickle" => Some(AttrKind::Pickle),
            _ => None,
        }
    }
}

impl fmt::Display for AttrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AttrValue {
    pub fn kind(&self) -> AttrKind {
        match self {
            AttrValue::Bool(_) => AttrKind::Bool,
            AttrValue::Str(_) => AttrKind::Str,
            AttrValue::Int(_) | AttrValue::Float(_) => AttrKind::Num,
            AttrValue::None => AttrKind::None,
            AttrValue::Opaque(_) => AttrKind::Pickle,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(value) => Some(*value as f64),
            AttrValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn from_opaque<T: Serialize>(codec: &dyn OpaqueCodec, value: &T) -> TdbResult<Self> {
        let json = serde_json::to_value(value)
            .map_err(|err| TdbError::invalid(format!("opaque serialize: {err}")))?;
        Ok(AttrValue::Opaque(codec.encode(&json)?))
    }

    pub fn to_opaque<T: DeserializeOwned>(&self, codec: &dyn OpaqueCodec) -> TdbResult<T> {
        let AttrValue::Opaque(bytes) = self else {
            return Err(TdbError::invalid(format!(
                "expected opaque value, got {}",
                self.kind()
            )));
        };
        let json = codec.decode(bytes)?;
        serde_json::from_value(json)
            .map_err(|err| TdbError::storage(format!("opaque deserialize: {err}")))
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<i32> for AttrValue {
    fn from(value: i32) -> Self {
        AttrValue::Int(i64::from(value))
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<Timestamp> for AttrValue {
    fn from(value: Timestamp) -> Self {
        AttrValue::Int(value.0)
    }
}

impl From<Option<String>> for AttrValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(AttrValue::None, AttrValue::Str)
    }
}

/// Serializer/deserializer pair for [`AttrValue::Opaque`] payloads. Payloads
/// are only meaningful to readers using the same codec.
pub trait OpaqueCodec: Send + Sync {
    fn encode(&self, value: &serde_json::Value) -> TdbResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> TdbResult<serde_json::Value>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonOpaqueCodec;

impl OpaqueCodec for JsonOpaqueCodec {
    fn encode(&self, value: &serde_json::Value) -> TdbResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|err| TdbError::invalid(format!("json encode: {err}")))
    }

    fn decode(&self, bytes: &[u8]) -> TdbResult<serde_json::Value> {
        serde_json::from_slice(bytes).map_err(|err| TdbError::storage(format!("json decode: {err}")))
    }
}

/// Narrow a value to the `(value, kind)` column pair.
pub fn encode(value: &AttrValue) -> (Option<String>, AttrKind) {
    let stored = match value {
        AttrValue::Bool(flag) => Some(if *flag { "t" } else { "f" }.to_string()),
        AttrValue::Str(text) => Some(text.clone()),
        AttrValue::Int(number) => Some(number.to_string()),
        // Debug keeps a fractional part ("3.0") so floats never read back as ints.
        AttrValue::Float(number) => Some(format!("{number:?}")),
        AttrValue::None => None,
        AttrValue::Opaque(bytes) => Some(BASE64.encode(bytes)),
    };
    (stored, value.kind())
}

/// Inverse of [`encode`]. Unknown kinds pass the raw text through.
pub fn decode(stored: Option<&str>, kind: &str) -> TdbResult<AttrValue> {
    let Some(kind) = AttrKind::parse(kind) else {
        return Ok(stored.map_or(AttrValue::None, |raw| AttrValue::Str(raw.to_string())));
    };
    match kind {
        AttrKind::None => Ok(AttrValue::None),
        AttrKind::Bool => Ok(AttrValue::Bool(stored == Some("t"))),
        AttrKind::Str => Ok(AttrValue::Str(stored.unwrap_or_default().to_string())),
        AttrKind::Num => {
            let raw = stored.ok_or_else(|| TdbError::storage("numeric attribute without value"))?;
            if let Ok(number) = raw.parse::<i64>() {
                return Ok(AttrValue::Int(number));
            }
            raw.parse::<f64>()
                .map(AttrValue::Float)
                .map_err(|err| TdbError::storage(format!("numeric attribute '{raw}': {err}")))
        }
        AttrKind::Pickle => {
            let raw = stored.ok_or_else(|| TdbError::storage("opaque attribute without value"))?;
            BASE64
                .decode(raw)
                .map(AttrValue::Opaque)
                .map_err(|err| TdbError::storage(format!("opaque attribute: {err}")))
        }
    }
}

/// The text form used when an attribute value is compared inside a query.
pub fn query_text(value: &AttrValue) -> Option<String> {
    encode(value).0
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::{AttrKind, AttrValue, JsonOpaqueCodec, decode, encode};

    fn roundtrip(value: AttrValue) -> AttrValue {
        let (stored, kind) = encode(&value);
        decode(stored.as_deref(), kind.as_str()).expect("decode")
    }

    #[test]
    fn scalar_values_roundtrip() {
        for value in [
            AttrValue::Bool(true),
            AttrValue::Bool(false),
            AttrValue::Str("x".to_string()),
            AttrValue::Int(0),
            AttrValue::Int(-5),
            AttrValue::Float(3.5),
            AttrValue::Float(3.0),
            AttrValue::Float(1e300),
            AttrValue::None,
        ] {
            assert_eq!(roundtrip(value.clone()), value);
        }
    }

    #[test]
    fn booleans_store_as_t_and_f() {
        assert_eq!(
            encode(&AttrValue::Bool(true)),
            (Some("t".to_string()), AttrKind::Bool)
        );
        assert_eq!(
            encode(&AttrValue::Bool(false)),
            (Some("f".to_string()), AttrKind::Bool)
        );
    }

    #[test]
    fn numeric_text_prefers_integers() {
        assert_eq!(decode(Some("12"), "num").expect("int"), AttrValue::Int(12));
        assert_eq!(
            decode(Some("12.25"), "num").expect("float"),
            AttrValue::Float(12.25)
        );
        assert!(decode(Some("twelve"), "num").is_err());
    }

    #[test]
    fn unknown_kind_passes_text_through() {
        assert_eq!(
            decode(Some("raw"), "mystery").expect("raw"),
            AttrValue::Str("raw".to_string())
        );
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Flair {
        text: String,
        css: Option<String>,
    }

    #[test]
    fn opaque_values_roundtrip_through_codec() {
        let codec = JsonOpaqueCodec;
        let flair = Flair {
            text: "mod".to_string(),
            css: None,
        };
        let value = AttrValue::from_opaque(&codec, &flair).expect("encode");
        assert_eq!(value.kind(), AttrKind::Pickle);
        let restored: Flair = roundtrip(value).to_opaque(&codec).expect("decode");
        assert_eq!(restored, flair);
    }
}
