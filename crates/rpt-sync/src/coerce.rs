//! Source JSON value → typed cell coercion.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rpt_core::{ColumnType, SqlValue};
use serde_json::Value as JsonValue;

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Coerces one source value. `Ok(SqlValue::Null)` for absent, null, or blank
/// non-text values; `Err` carries the offending value rendered as JSON.
pub fn coerce(value: Option<&JsonValue>, column_type: ColumnType) -> Result<SqlValue, String> {
    let value = match value {
        None | Some(JsonValue::Null) => return Ok(SqlValue::Null),
        Some(v) => v,
    };
    if column_type != ColumnType::Text && value.as_str().is_some_and(|s| s.trim().is_empty()) {
        return Ok(SqlValue::Null);
    }

    let coerced = match column_type {
        ColumnType::Text => Some(SqlValue::Text(match value {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })),
        ColumnType::Numeric => to_f64(value).map(SqlValue::Numeric),
        ColumnType::Integer => to_i64(value).map(SqlValue::Integer),
        ColumnType::Date => value.as_str().and_then(parse_date).map(SqlValue::Date),
        ColumnType::Timestamp => value
            .as_str()
            .and_then(parse_timestamp)
            .map(SqlValue::Timestamp),
        ColumnType::Boolean => to_bool(value).map(SqlValue::Boolean),
    };
    coerced.ok_or_else(|| value.to_string())
}

fn to_f64(value: &JsonValue) -> Option<f64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn to_i64(value: &JsonValue) -> Option<i64> {
    if let JsonValue::Number(n) = value {
        if let Some(i) = n.as_i64() {
            return Some(i);
        }
    }
    if let JsonValue::String(s) = value {
        if let Ok(i) = s.trim().parse::<i64>() {
            return Some(i);
        }
    }
    let f = to_f64(value)?;
    (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

fn to_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => match n.as_i64()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        },
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "true" | "1" => Some(true),
            "n" | "no" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    // Wall clock as written; the offset is dropped, not applied.
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(s).map(|dt| dt.date()))
}
