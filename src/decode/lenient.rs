//! Tolerant JSON field readers: integers may arrive as numbers or strings.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Integer from a JSON number, numeric string or null (zero).
pub(super) fn i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    Ok(Value::deserialize(deserializer)?.as_lenient_i64().unwrap_or_default())
}

/// List of integers, each lenient.
pub(super) fn i64_vec<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<i64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value
        .as_array()
        .map(|items| items.iter().filter_map(LenientValue::as_lenient_i64).collect())
        .unwrap_or_default())
}

/// String from a JSON string or number; null becomes empty.
pub(super) fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Value::deserialize(deserializer)?.as_lenient_string().unwrap_or_default())
}

pub(super) trait LenientValue {
    fn as_lenient_i64(&self) -> Option<i64>;
    fn as_lenient_string(&self) -> Option<String>;
    fn as_lenient_bool(&self) -> Option<bool>;
}

impl LenientValue for Value {
    fn as_lenient_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64().or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok())),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_lenient_string(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn as_lenient_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|n| n != 0),
            Value::String(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}
