//! JSON-like primitive values stored inside the block store
//!
//! [`Any`] is the payload of scalar writes (null, undefined, booleans,
//! numbers, strings, binary blobs and JSON-like arrays/maps). It converts to
//! and from `serde_json::Value` so hosts can project documents to JSON.

use crate::encoding::{Decode, Decoder, Encode, Encoder};
use crate::error::{Result, SyncError};
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;

const TAG_UNDEFINED: u8 = 127;
const TAG_NULL: u8 = 126;
const TAG_INTEGER: u8 = 125;
const TAG_FLOAT64: u8 = 123;
const TAG_FALSE: u8 = 121;
const TAG_TRUE: u8 = 120;
const TAG_STRING: u8 = 119;
const TAG_MAP: u8 = 118;
const TAG_ARRAY: u8 = 117;
const TAG_BUFFER: u8 = 116;

/// A JSON-like value
#[derive(Debug, Clone, PartialEq)]
pub enum Any {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    BigInt(i64),
    String(Arc<str>),
    Buffer(Arc<[u8]>),
    Array(Arc<[Any]>),
    Map(Arc<HashMap<String, Any>>),
}

impl Any {
    /// Project this value to JSON
    ///
    /// Undefined becomes `null` and buffers become base64 strings.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as JsonValue;

        match self {
            Any::Null | Any::Undefined => JsonValue::Null,
            Any::Bool(b) => JsonValue::Bool(*b),
            Any::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Any::BigInt(i) => JsonValue::Number((*i).into()),
            Any::String(s) => JsonValue::String(s.to_string()),
            Any::Buffer(b) => {
                let engine = base64::engine::general_purpose::STANDARD;
                JsonValue::String(engine.encode(b))
            }
            Any::Array(items) => JsonValue::Array(items.iter().map(Any::to_json).collect()),
            Any::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries.iter() {
                    map.insert(key.clone(), value.to_json());
                }
                JsonValue::Object(map)
            }
        }
    }
}

impl From<&serde_json::Value> for Any {
    fn from(json: &serde_json::Value) -> Self {
        use serde_json::Value as JsonValue;

        match json {
            JsonValue::Null => Any::Null,
            JsonValue::Bool(b) => Any::Bool(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Any::BigInt(i)
                } else if let Some(f) = n.as_f64() {
                    Any::Number(f)
                } else {
                    Any::Null
                }
            }
            JsonValue::String(s) => Any::String(s.as_str().into()),
            JsonValue::Array(items) => Any::Array(items.iter().map(Any::from).collect()),
            JsonValue::Object(obj) => {
                let entries = obj
                    .iter()
                    .map(|(key, value)| (key.clone(), Any::from(value)))
                    .collect();
                Any::Map(Arc::new(entries))
            }
        }
    }
}

impl From<serde_json::Value> for Any {
    fn from(json: serde_json::Value) -> Self {
        Any::from(&json)
    }
}

impl From<bool> for Any {
    fn from(value: bool) -> Self {
        Any::Bool(value)
    }
}

impl From<f64> for Any {
    fn from(value: f64) -> Self {
        Any::Number(value)
    }
}

impl From<i64> for Any {
    fn from(value: i64) -> Self {
        Any::BigInt(value)
    }
}

impl From<&str> for Any {
    fn from(value: &str) -> Self {
        Any::String(value.into())
    }
}

impl From<String> for Any {
    fn from(value: String) -> Self {
        Any::String(value.into())
    }
}

impl From<Vec<u8>> for Any {
    fn from(value: Vec<u8>) -> Self {
        Any::Buffer(value.into())
    }
}

impl Encode for Any {
    fn encode(&self, encoder: &mut Encoder) {
        match self {
            Any::Undefined => encoder.write_u8(TAG_UNDEFINED),
            Any::Null => encoder.write_u8(TAG_NULL),
            Any::BigInt(i) => {
                encoder.write_u8(TAG_INTEGER);
                encoder.write_var_i64(*i);
            }
            Any::Number(n) => {
                encoder.write_u8(TAG_FLOAT64);
                encoder.write_f64(*n);
            }
            Any::Bool(false) => encoder.write_u8(TAG_FALSE),
            Any::Bool(true) => encoder.write_u8(TAG_TRUE),
            Any::String(s) => {
                encoder.write_u8(TAG_STRING);
                encoder.write_string(s);
            }
            Any::Map(entries) => {
                encoder.write_u8(TAG_MAP);
                // sorted so equal maps always encode to equal bytes
                let mut keys: Vec<&String> = entries.keys().collect();
                keys.sort();
                encoder.write_var_u64(keys.len() as u64);
                for key in keys {
                    encoder.write_string(key);
                    entries[key].encode(encoder);
                }
            }
            Any::Array(items) => {
                encoder.write_u8(TAG_ARRAY);
                encoder.write_var_u64(items.len() as u64);
                for item in items.iter() {
                    item.encode(encoder);
                }
            }
            Any::Buffer(bytes) => {
                encoder.write_u8(TAG_BUFFER);
                encoder.write_buf(bytes);
            }
        }
    }
}

impl Decode for Any {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        let tag = decoder.read_u8()?;
        let value = match tag {
            TAG_UNDEFINED => Any::Undefined,
            TAG_NULL => Any::Null,
            TAG_INTEGER => Any::BigInt(decoder.read_var_i64()?),
            TAG_FLOAT64 => Any::Number(decoder.read_f64()?),
            TAG_FALSE => Any::Bool(false),
            TAG_TRUE => Any::Bool(true),
            TAG_STRING => Any::String(decoder.read_string()?.into()),
            TAG_MAP => {
                let len = decoder.read_len()?;
                let mut entries = HashMap::with_capacity(len);
                for _ in 0..len {
                    let key = decoder.read_string()?.to_string();
                    let value = Any::decode(decoder)?;
                    entries.insert(key, value);
                }
                Any::Map(Arc::new(entries))
            }
            TAG_ARRAY => {
                let len = decoder.read_len()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(Any::decode(decoder)?);
                }
                Any::Array(items.into())
            }
            TAG_BUFFER => Any::Buffer(decoder.read_buf()?.into()),
            other => return Err(SyncError::Decode(format!("unknown value tag {other}"))),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_value_conversion() {
        let json = serde_json::json!({
            "name": "test",
            "value": 42,
            "ratio": 0.5,
            "active": true,
            "tags": ["a", "b", "c"],
            "none": null
        });

        let any = Any::from(&json);
        assert_eq!(any.to_json(), json);
    }

    #[test]
    fn test_buffer_projects_to_base64() {
        let any = Any::from(vec![104u8, 105]);
        assert_eq!(any.to_json(), serde_json::json!("aGk="));
    }

    #[test]
    fn test_undefined_projects_to_null() {
        assert_eq!(Any::Undefined.to_json(), serde_json::Value::Null);
    }

    #[test]
    fn test_nested_value_codec() {
        let value = Any::from(serde_json::json!({
            "list": [1, -2, 3.25, "x", false],
            "inner": { "deep": null }
        }));

        let mut enc = Encoder::new();
        value.encode(&mut enc);
        enc.write_u8(TAG_UNDEFINED);
        let bytes = enc.into_bytes();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(Any::decode(&mut dec).unwrap(), value);
        assert_eq!(Any::decode(&mut dec).unwrap(), Any::Undefined);
    }

    #[test]
    fn test_unknown_tag() {
        let mut dec = Decoder::new(&[3]);
        assert!(matches!(Any::decode(&mut dec), Err(SyncError::Decode(_))));
    }
}
