//! Binary-pack codec.
//!
//! Standard msgpack, plus ext-type 1 for big integers: the payload is the
//! ASCII-hexadecimal rendering of a value that does not fit the native
//! integer range.  We decode those for interoperability; on the encode side
//! every representable integer fits msgpack's native i64/u64 forms.

use crate::error::{Result, RpcError};
use crate::value::{Map, Value};

/// Ext type carrying an ASCII-hex big integer.
const EXT_BIGINT: i8 = 1;

pub fn to_msgpack(value: &Value) -> Result<Vec<u8>> {
    let mp = to_rmpv(value);
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &mp)
        .map_err(|e| RpcError::Codec(format!("to_msgpack failed: {e}")))?;
    Ok(out)
}

pub fn from_msgpack(bytes: &[u8]) -> Result<Value> {
    let mut cursor = bytes;
    let mp = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| RpcError::Codec(format!("from_msgpack failed: {e}")))?;
    from_rmpv(&mp)
}

fn to_rmpv(value: &Value) -> rmpv::Value {
    match value {
        Value::Null => rmpv::Value::Nil,
        Value::Bool(b) => (*b).into(),
        Value::Int(i) => (*i).into(),
        Value::UInt(u) => (*u).into(),
        Value::Float(f) => (*f).into(),
        Value::Str(s) => s.as_str().into(),
        Value::Bytes(b) => rmpv::Value::Binary(b.clone()),
        Value::Array(items) => rmpv::Value::Array(items.iter().map(to_rmpv).collect()),
        Value::Map(map) => rmpv::Value::Map(
            map.iter().map(|(k, v)| (k.as_str().into(), to_rmpv(v))).collect(),
        ),
        Value::Fd(fd) => fd.spec().to_magic().as_str().into(),
    }
}

fn from_rmpv(mp: &rmpv::Value) -> Result<Value> {
    Ok(match mp {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(*b),
        rmpv::Value::Integer(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                return Err(RpcError::Codec("integer out of range".into()));
            }
        }
        rmpv::Value::F32(f) => Value::Float((*f).into()),
        rmpv::Value::F64(f) => Value::Float(*f),
        rmpv::Value::String(s) => match s.as_str() {
            Some(text) => Value::Str(text.to_owned()),
            None => Value::Bytes(s.as_bytes().to_vec()),
        },
        rmpv::Value::Binary(b) => Value::Bytes(b.clone()),
        rmpv::Value::Array(items) => {
            Value::Array(items.iter().map(from_rmpv).collect::<Result<_>>()?)
        }
        rmpv::Value::Map(pairs) => {
            let mut map = Map::new();
            for (k, v) in pairs {
                let key = k
                    .as_str()
                    .ok_or_else(|| RpcError::Codec("non-string map key".into()))?;
                map.insert(key.to_owned(), from_rmpv(v)?);
            }
            Value::Map(map)
        }
        rmpv::Value::Ext(EXT_BIGINT, payload) => decode_bigint(payload)?,
        rmpv::Value::Ext(code, _) => {
            return Err(RpcError::Codec(format!("unsupported ext type {code}")));
        }
    })
}

fn decode_bigint(payload: &[u8]) -> Result<Value> {
    let hex = std::str::from_utf8(payload)
        .map_err(|_| RpcError::Codec("bigint ext payload is not ASCII".into()))?;
    if let Ok(u) = u64::from_str_radix(hex, 16) {
        return Ok(Value::UInt(u));
    }
    if let Some(rest) = hex.strip_prefix('-') {
        if let Ok(i) = i64::from_str_radix(rest, 16) {
            return Ok(Value::Int(-i));
        }
    }
    Err(RpcError::Codec(format!("bigint {hex} exceeds the native integer range")))
}
