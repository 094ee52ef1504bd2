//! Value filters
//!
//! Small transformations exposed to configuration expressions as the
//! `trim`, `lowercase`, `uppercase` and `round` callables. Non-matching
//! value types pass through untouched.

use serde_json::{Value, json};

/// Trim whitespace from a string
pub fn trim(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other,
    }
}

/// Convert a string to uppercase
pub fn uppercase(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_uppercase()),
        other => other,
    }
}

/// Convert a string to lowercase
pub fn lowercase(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.to_lowercase()),
        other => other,
    }
}

/// Round a number to the given number of decimal places
pub fn round_decimals(value: Value, decimals: u32) -> Value {
    match value.as_f64() {
        Some(num) if value.is_number() => {
            let factor = 10_f64.powi(decimals as i32);
            let rounded = (num * factor).round() / factor;
            if decimals == 0 && rounded.abs() < i64::MAX as f64 {
                json!(rounded as i64)
            } else {
                json!(rounded)
            }
        }
        _ => value,
    }
}
