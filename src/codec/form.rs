//! `application/x-www-form-urlencoded` request bodies (POST only).
//!
//! Single-valued keys collapse to a scalar; repeated keys become arrays.
//! The `_args` key is always kept as an array; it carries the positional
//! argument list.

use crate::error::Result;
use crate::value::{Map, Value};

pub const ARGS_KEY: &str = "_args";

pub fn from_form(body: &[u8]) -> Result<Value> {
    let text = String::from_utf8_lossy(body);
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for (key, val) in form_urlencoded::parse(text.trim().as_bytes()) {
        match grouped.iter_mut().find(|(k, _)| *k == key) {
            Some((_, vals)) => vals.push(val.into_owned()),
            None => grouped.push((key.into_owned(), vec![val.into_owned()])),
        }
    }

    let mut map = Map::new();
    for (key, mut vals) in grouped {
        let value = if key == ARGS_KEY {
            Value::Array(vals.into_iter().map(Value::Str).collect())
        } else if vals.len() == 1 {
            Value::Str(vals.remove(0))
        } else {
            Value::Array(vals.into_iter().map(Value::Str).collect())
        };
        map.insert(key, value);
    }
    Ok(Value::Map(map))
}
