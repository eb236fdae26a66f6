//! Server-Sent-Event line format.
//!
//! An event is zero or more `id:` / `event:` / `retry:` lines, then one or
//! more `data:` lines (embedded newlines split into multiple `data:` lines),
//! terminated by a blank line.  Parsing is the inverse; repeated keys join
//! with newlines.

use crate::codec::json;
use crate::error::{Result, RpcError};
use crate::value::{Map, Value};

/// Serialize an event map.  `id`, `event` and `retry` keys become their own
/// lines; the `data` key (or, absent one, the remaining map) becomes the
/// `data:` lines.
pub fn to_event(value: &Value) -> Result<Vec<u8>> {
    let mut event = match value {
        Value::Map(m) => m.clone(),
        other => {
            let mut m = Map::new();
            m.insert("data".to_owned(), other.clone());
            m
        }
    };

    let mut lines: Vec<Vec<u8>> = Vec::new();
    for key in ["id", "event", "retry"] {
        if let Some(val) = event.remove(key) {
            let text = match val {
                Value::Str(s) => s,
                Value::Int(i) => i.to_string(),
                Value::UInt(u) => u.to_string(),
                other => String::from_utf8_lossy(&json::to_json(&other, false)?)
                    .trim_end()
                    .to_owned(),
            };
            lines.push(format!("{key}: {text}").into_bytes());
        }
    }

    let data = match event.remove("data") {
        Some(d) => d,
        None => Value::Map(event),
    };
    let data_bytes = match &data {
        Value::Str(s) => s.clone().into_bytes(),
        Value::Bytes(b) => b.clone(),
        Value::Map(m) if m.is_empty() => Vec::new(),
        other => {
            let mut encoded = json::to_json(other, false)?;
            encoded.pop(); // the codec's trailing newline is not data
            encoded
        }
    };
    if !data_bytes.is_empty() {
        for line in data_bytes.split(|b| *b == b'\n') {
            let mut data_line = b"data: ".to_vec();
            data_line.extend_from_slice(line);
            lines.push(data_line);
        }
    }

    lines.push(b"".to_vec());
    lines.push(b"".to_vec());
    Ok(lines.join(&b'\n'))
}

/// Parse one event back into a map of string values.
pub fn from_event(bytes: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| RpcError::Codec(format!("event is not UTF-8: {e}")))?;
    let mut event = Map::new();
    for line in text.trim_end().lines() {
        let (key, rest) = line
            .split_once(':')
            .ok_or_else(|| RpcError::Codec(format!("malformed event line: {line:?}")))?;
        let val = rest.strip_prefix(' ').unwrap_or(rest);
        match event.get_mut(key) {
            Some(Value::Str(existing)) => {
                existing.push('\n');
                existing.push_str(val);
            }
            _ => {
                event.insert(key.to_owned(), Value::Str(val.to_owned()));
            }
        }
    }
    Ok(Value::Map(event))
}
