//! Field coercion for untyped row images
//!
//! Every accessor treats an absent field and a JSON `null` the same way. A present value that
//! cannot be converted is a [`DecodeError`], never a silent `None`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Borrowed view over one row image (`before` or `after`)
#[derive(Debug, Clone, Copy)]
pub struct Image<'a> {
    fields: &'a Map<String, Value>,
}

impl<'a> Image<'a> {
    pub fn new(value: &'a Value) -> Result<Self, DecodeError> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(DecodeError::NotAnObject(json_type(other))),
        }
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        match self.fields.get(field) {
            Some(Value::Null) | None => None,
            Some(v) => Some(v),
        }
    }

    pub fn required_i64(&self, field: &'static str) -> Result<i64, DecodeError> {
        self.optional_i64(field)?
            .ok_or(DecodeError::MissingField { field })
    }

    pub fn optional_i64(&self, field: &'static str) -> Result<Option<i64>, DecodeError> {
        self.get(field).map(|v| coerce_i64(field, v)).transpose()
    }

    pub fn optional_f64(&self, field: &'static str) -> Result<Option<f64>, DecodeError> {
        self.get(field).map(|v| coerce_f64(field, v)).transpose()
    }

    pub fn optional_string(&self, field: &'static str) -> Result<Option<String>, DecodeError> {
        Ok(self.get(field).map(coerce_string))
    }

    pub fn optional_datetime(
        &self,
        field: &'static str,
    ) -> Result<Option<DateTime<Utc>>, DecodeError> {
        self.get(field).map(|v| coerce_datetime(field, v)).transpose()
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn invalid(field: &'static str, expected: &'static str, value: &Value) -> DecodeError {
    DecodeError::InvalidField {
        field,
        expected,
        found: value.to_string(),
    }
}

/// 2^53; integral floats at or past this magnitude no longer map to a single integer
const MAX_EXACT_F64: f64 = 9_007_199_254_740_992.0;

fn exact_integral(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < MAX_EXACT_F64 {
        Some(f as i64)
    } else {
        None
    }
}

/// `"42.000"` style strings, parsed from the digits so large keys stay exact
fn zero_fraction_decimal(s: &str) -> Option<i64> {
    let (whole, fraction) = s.split_once('.')?;
    if fraction.is_empty() || !fraction.bytes().all(|b| b == b'0') {
        return None;
    }
    whole.parse::<i64>().ok()
}

/// Integers, integral floats, and strings holding either
///
/// Anything outside the `i64` range, or a float too large to be exact, is rejected rather than
/// rounded onto a neighbouring key.
pub fn coerce_i64(field: &'static str, value: &Value) -> Result<i64, DecodeError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            // u64 beyond i64::MAX also reports as_f64; only genuine floats get the fallback
            if n.is_f64() {
                n.as_f64().and_then(exact_integral)
            } else {
                None
            }
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| zero_fraction_decimal(s))
                .or_else(|| {
                    // whole-number strings that failed i64 parsing overflowed
                    if s.bytes().all(|b| b.is_ascii_digit() || b == b'-' || b == b'+') {
                        None
                    } else {
                        s.parse::<f64>().ok().and_then(exact_integral)
                    }
                })
        }
        _ => None,
    };

    parsed.ok_or_else(|| invalid(field, "integer", value))
}

/// Any finite number, or a string holding one
pub fn coerce_f64(field: &'static str, value: &Value) -> Result<f64, DecodeError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    parsed
        .filter(|f| f.is_finite())
        .ok_or_else(|| invalid(field, "decimal", value))
}

/// Strings pass through; every other value uses its display form
pub fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Timestamp strings in the common database layouts, or epoch milliseconds
pub fn coerce_datetime(field: &'static str, value: &Value) -> Result<DateTime<Utc>, DecodeError> {
    match value {
        Value::Number(_) => {
            let millis = coerce_i64(field, value)?;
            DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| invalid(field, "timestamp", value))
        }
        Value::String(s) => {
            parse_datetime_best_effort(s).ok_or_else(|| invalid(field, "timestamp", value))
        }
        other => Err(invalid(field, "timestamp", other)),
    }
}

fn parse_datetime_best_effort(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|ndt| Utc.from_utc_datetime(&ndt));
    }
    None
}
