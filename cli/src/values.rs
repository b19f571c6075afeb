// JSON <-> event argument conversion for the command line

use anyhow::{Context, Result};
use peerlink_core::Value;
use serde_json::Value as Json;

/// Parse `[..]` (or a single JSON value) into event arguments
pub fn parse_args(raw: Option<&str>) -> Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let json: Json = serde_json::from_str(raw).context("Arguments must be valid JSON")?;
    Ok(match json {
        Json::Array(items) => items.into_iter().map(from_json).collect(),
        other => vec![from_json(other)],
    })
}

pub fn from_json(json: Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::Text(s),
        Json::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        // Objects travel as their JSON text
        object @ Json::Object(_) => Value::Text(object.to_string()),
    }
}

pub fn to_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(x) => serde_json::Number::from_f64(*x).map_or(Json::Null, Json::Number),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(b) => Json::Array(b.iter().map(|byte| Json::from(*byte)).collect()),
        Value::List(items) => Json::Array(items.iter().map(to_json).collect()),
    }
}

/// Render arguments as a JSON array
pub fn render(args: &[Value]) -> String {
    Json::Array(args.iter().map(to_json).collect()).to_string()
}
