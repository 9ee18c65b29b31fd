//! Value coercion through the declared attribute schema.
//!
//! Stored values that fail to coerce make the leaf a non-match; a
//! comparator value that fails to coerce is a configuration error and
//! raises instead.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use cohort_core::types::AttributeType;
use cohort_core::{CohortError, CohortResult};

/// A raw JSON value lifted into the declared attribute type.
#[derive(Debug, Clone, PartialEq)]
pub enum CoercedValue {
    Number(f64),
    Text(String),
    Flag(bool),
    Timestamp(DateTime<Utc>),
    List(Vec<serde_json::Value>),
    Map(serde_json::Map<String, serde_json::Value>),
}

/// Coerce a stored customer value. `None` means the value does not conform
/// to the declared type; the caller treats that as "no match".
pub fn coerce_stored(declared: AttributeType, raw: &serde_json::Value) -> Option<CoercedValue> {
    match declared {
        AttributeType::Number => number(raw).map(CoercedValue::Number),
        AttributeType::Boolean => flag(raw).map(CoercedValue::Flag),
        AttributeType::String => text(raw).map(CoercedValue::Text),
        AttributeType::Email => raw.as_str().map(|s| CoercedValue::Text(s.to_string())),
        AttributeType::Date | AttributeType::DateTime => {
            timestamp(raw).map(CoercedValue::Timestamp)
        }
        AttributeType::Array => raw.as_array().map(|a| CoercedValue::List(a.clone())),
        AttributeType::Object => raw.as_object().map(|o| CoercedValue::Map(o.clone())),
    }
}

/// Coerce a comparator value from the query configuration. Failure here is
/// a malformed segment definition and raises.
pub fn coerce_comparand(
    declared: AttributeType,
    raw: &serde_json::Value,
) -> CohortResult<CoercedValue> {
    coerce_stored(declared, raw).ok_or_else(|| {
        CohortError::validation(format!(
            "comparison value {raw} is not a valid {declared:?}"
        ))
    })
}

pub fn number(raw: &serde_json::Value) -> Option<f64> {
    match raw {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn flag(raw: &serde_json::Value) -> Option<bool> {
    match raw {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn text(raw: &serde_json::Value) -> Option<String> {
    match raw {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// RFC 3339 timestamps, bare dates, or epoch milliseconds.
pub fn timestamp(raw: &serde_json::Value) -> Option<DateTime<Utc>> {
    match raw {
        serde_json::Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| Utc.from_utc_datetime(&dt))
        }
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        _ => None,
    }
}
