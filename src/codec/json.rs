//! JSON codec with a bytes extension.
//!
//! Plain JSON cannot carry byte strings, so they are wrapped in single-key
//! objects: `{"__base64__": "..."}` always works, and `{"__bytes__": "..."}`
//! is produced instead when friendly mode is requested and the bytes decode
//! as UTF-8.  Encoded bodies end with a newline.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Result, RpcError};
use crate::value::{Map, Value};

const KEY_BASE64: &str = "__base64__";
const KEY_BYTES: &str = "__bytes__";

/// Serialize a value to JSON bytes.  `friendly` selects the readable
/// `__bytes__` form for UTF-8-clean byte strings.
pub fn to_json(value: &Value, friendly: bool) -> Result<Vec<u8>> {
    let json = to_serde(value, friendly);
    let mut out = serde_json::to_vec(&json).map_err(|e| RpcError::Codec(e.to_string()))?;
    out.push(b'\n');
    Ok(out)
}

pub fn from_json(bytes: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| RpcError::Codec(format!("body is not UTF-8: {e}")))?;
    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| RpcError::Codec(e.to_string()))?;
    Ok(from_serde(&json))
}

/// Values serialize through their JSON mapping (bytes become the
/// `__base64__` wrapper), so they can be embedded in any serde structure.
impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        to_serde(self, false).serialize(serializer)
    }
}

fn to_serde(value: &Value, friendly: bool) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => (*b).into(),
        Value::Int(i) => (*i).into(),
        Value::UInt(u) => (*u).into(),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => s.clone().into(),
        Value::Bytes(b) => {
            let mut wrap = serde_json::Map::new();
            match std::str::from_utf8(b) {
                Ok(text) if friendly => {
                    wrap.insert(KEY_BYTES.to_owned(), text.into());
                }
                _ => {
                    wrap.insert(KEY_BASE64.to_owned(), BASE64.encode(b).into());
                }
            }
            serde_json::Value::Object(wrap)
        }
        Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| to_serde(v, friendly)).collect())
        }
        Value::Map(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), to_serde(v, friendly))).collect(),
        ),
        Value::Fd(fd) => fd.spec().to_magic().into(),
    }
}

fn from_serde(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_serde).collect()),
        serde_json::Value::Object(obj) => {
            if obj.len() == 1 {
                if let Some(serde_json::Value::String(b64)) = obj.get(KEY_BASE64) {
                    if let Ok(bytes) = BASE64.decode(b64) {
                        return Value::Bytes(bytes);
                    }
                }
                if let Some(serde_json::Value::String(text)) = obj.get(KEY_BYTES) {
                    return Value::Bytes(text.clone().into_bytes());
                }
            }
            let map: Map = obj.iter().map(|(k, v)| (k.clone(), from_serde(v))).collect();
            Value::Map(map)
        }
    }
}
