//! Response normalization
//!
//! OData v2 wraps payloads in `{"d": ...}` and decorates every entity with a
//! `__metadata` block and `__deferred` links for unexpanded navigation
//! properties. The compact form drops both and keeps the data.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::str::FromStr;

/// Output format selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Envelope passed through unchanged
    #[serde(rename = "json")]
    Raw,
    /// Metadata and deferred links stripped
    #[default]
    #[serde(rename = "json_compact")]
    Compact,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" | "raw" => Ok(Self::Raw),
            "json_compact" | "compact" | "" => Ok(Self::Compact),
            other => Err(format!(
                "Unknown format '{}'. Valid options: json, json_compact",
                other
            )),
        }
    }
}

/// Normalize a decoded OData envelope.
///
/// Compact collections become `{results, count}`, single entities become
/// `{result}`. An empty envelope (`{}`) is an empty collection; an empty `d`
/// object is an empty entity.
pub fn normalize(envelope: Value, format: OutputFormat) -> Value {
    if format == OutputFormat::Raw {
        return envelope;
    }

    let payload = match envelope {
        Value::Object(mut outer) => match outer.remove("d") {
            Some(d) => d,
            None if outer.is_empty() => return collection(Vec::new()),
            None => return json!({ "result": clean_entity(outer) }),
        },
        other => return other,
    };

    match payload {
        Value::Object(mut entity) => {
            if let Some(Value::Array(results)) = entity.get_mut("results") {
                collection(std::mem::take(results))
            } else {
                json!({ "result": clean_entity(entity) })
            }
        }
        Value::Array(results) => collection(results),
        other => other,
    }
}

fn collection(results: Vec<Value>) -> Value {
    let results: Vec<Value> = results.into_iter().map(clean_value).collect();
    let count = results.len();
    json!({ "results": results, "count": count })
}

/// Drop `__metadata` and deferred links, recursing into expanded data
fn clean_entity(entity: Map<String, Value>) -> Map<String, Value> {
    entity
        .into_iter()
        .filter(|(key, value)| key != "__metadata" && !is_deferred(value))
        .map(|(key, value)| (key, clean_value(value)))
        .collect()
}

fn clean_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(clean_entity(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(clean_value).collect()),
        other => other,
    }
}

fn is_deferred(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| obj.contains_key("__deferred"))
        .unwrap_or(false)
}
