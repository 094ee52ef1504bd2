//! Reusable rule checks
//!
//! Each factory returns a check taking the attribute label and the value.
//! Checks only judge values of the type they understand; anything else
//! passes so that rules can be combined freely (`required|min:3`).

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// A boxed rule check
pub type Check = Box<dyn Fn(&str, &Value) -> Result<(), String> + Send + Sync>;

/// Rule: value is present (not null)
pub fn required() -> impl Fn(&str, &Value) -> Result<(), String> + Send + Sync + Clone {
    |attribute: &str, value: &Value| {
        if value.is_null() {
            Err(format!("The {} field is required.", attribute))
        } else {
            Ok(())
        }
    }
}

/// Rule: number is strictly positive
pub fn positive() -> impl Fn(&str, &Value) -> Result<(), String> + Send + Sync + Clone {
    |attribute: &str, value: &Value| match value.as_f64() {
        Some(num) if num <= 0.0 => Err(format!(
            "The {} must be positive (got {}).",
            attribute, num
        )),
        _ => Ok(()),
    }
}

/// Rule: string length or number is at least `min`
pub fn min(min: f64) -> impl Fn(&str, &Value) -> Result<(), String> + Send + Sync + Clone {
    move |attribute: &str, value: &Value| match measure(value) {
        Some((size, unit)) if size < min => Err(format!(
            "The {} must be at least {}{}.",
            attribute, min, unit
        )),
        _ => Ok(()),
    }
}

/// Rule: string length or number is at most `max`
pub fn max(max: f64) -> impl Fn(&str, &Value) -> Result<(), String> + Send + Sync + Clone {
    move |attribute: &str, value: &Value| match measure(value) {
        Some((size, unit)) if size > max => Err(format!(
            "The {} may not be greater than {}{}.",
            attribute, max, unit
        )),
        _ => Ok(()),
    }
}

/// Rule: string length or number lies within `[low, high]`
pub fn between(
    low: f64,
    high: f64,
) -> impl Fn(&str, &Value) -> Result<(), String> + Send + Sync + Clone {
    move |attribute: &str, value: &Value| match measure(value) {
        Some((size, unit)) if size < low || size > high => Err(format!(
            "The {} must be between {} and {}{}.",
            attribute, low, high, unit
        )),
        _ => Ok(()),
    }
}

/// Rule: value is one of the allowed strings
pub fn in_list(
    allowed: Vec<String>,
) -> impl Fn(&str, &Value) -> Result<(), String> + Send + Sync + Clone {
    move |attribute: &str, value: &Value| {
        let candidate = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Ok(()),
        };
        if allowed.contains(&candidate) {
            Ok(())
        } else {
            Err(format!(
                "The selected {} is invalid (allowed: {}).",
                attribute,
                allowed.join(", ")
            ))
        }
    }
}

/// Rule: string looks like an email address
pub fn email() -> impl Fn(&str, &Value) -> Result<(), String> + Send + Sync + Clone {
    |attribute: &str, value: &Value| match value.as_str() {
        Some(s) if !email_regex().is_match(s) => Err(format!(
            "The {} must be a valid email address.",
            attribute
        )),
        _ => Ok(()),
    }
}

/// Rule: string parses as a date with the given format
pub fn date_format(
    format: String,
) -> impl Fn(&str, &Value) -> Result<(), String> + Send + Sync + Clone {
    move |attribute: &str, value: &Value| match value.as_str() {
        Some(s) if chrono::NaiveDate::parse_from_str(s, &format).is_err() => Err(format!(
            "The {} does not match the format {}.",
            attribute, format
        )),
        _ => Ok(()),
    }
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap())
}

/// Size of a value for min/max checks, with a unit suffix for messages
fn measure(value: &Value) -> Option<(f64, &'static str)> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| (f, "")),
        Value::String(s) => Some((s.chars().count() as f64, " characters")),
        Value::Array(items) => Some((items.len() as f64, " items")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // === required() ===

    #[test]
    fn test_required_null_value_returns_error() {
        let v = required();
        let result = v("name", &json!(null));
        assert_eq!(result.unwrap_err(), "The name field is required.");
    }

    #[test]
    fn test_required_empty_string_returns_ok() {
        let v = required();
        assert!(v("name", &json!("")).is_ok());
    }

    // === positive() ===

    #[test]
    fn test_positive_zero_returns_error() {
        let v = positive();
        assert!(v("price", &json!(0)).is_err());
        assert!(v("price", &json!(3)).is_ok());
        assert!(v("price", &json!("text")).is_ok());
    }

    // === min() / max() / between() ===

    #[test]
    fn test_min_on_strings_and_numbers() {
        let v = min(3.0);
        assert!(v("name", &json!("ab")).unwrap_err().contains("3 characters"));
        assert!(v("name", &json!("abc")).is_ok());
        assert!(v("age", &json!(2)).is_err());
    }

    #[test]
    fn test_max_value_over_returns_error() {
        let v = max(100.0);
        assert!(v("score", &json!(101)).is_err());
        assert!(v("score", &json!(100)).is_ok());
    }

    #[test]
    fn test_between_bounds_inclusive() {
        let v = between(1.0, 5.0);
        assert!(v("stars", &json!(1)).is_ok());
        assert!(v("stars", &json!(5)).is_ok());
        assert!(v("stars", &json!(6)).is_err());
    }

    // === in_list() ===

    #[test]
    fn test_in_list_value_not_in_list_returns_error() {
        let v = in_list(vec!["active".into(), "inactive".into()]);
        assert!(v("status", &json!("active")).is_ok());
        assert!(v("status", &json!("deleted")).is_err());
    }

    // === email() / date_format() ===

    #[test]
    fn test_email_rule() {
        let v = email();
        assert!(v("email", &json!("bob@example.com")).is_ok());
        assert!(v("email", &json!("not an email")).is_err());
    }

    #[test]
    fn test_date_format_rule() {
        let v = date_format("%Y-%m-%d".to_string());
        assert!(v("releaseDate", &json!("2024-01-15")).is_ok());
        assert!(v("releaseDate", &json!("15/01/2024")).is_err());
    }
}
