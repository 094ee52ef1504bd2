//! Configuration values that may be literal or dynamic
//!
//! Any configuration entry can be replaced by an expression of the form
//! `{"$call": "<name>", "args": [...]}`. Expressions are evaluated per call
//! by the [`ConfigResolver`](crate::core::resolver::ConfigResolver) against
//! the request context.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

/// Key marking an object as an expression
pub const CALL_KEY: &str = "$call";
const ARGS_KEY: &str = "args";

/// A configuration value: either a plain literal or something to evaluate
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// A JSON literal with no expressions inside
    Literal(Value),
    /// A call into the expression registry
    Expression { call: String, args: Vec<ConfigValue> },
    /// A list containing at least one expression
    List(Vec<ConfigValue>),
    /// An object containing at least one expression
    Map(Vec<(String, ConfigValue)>),
}

impl ConfigValue {
    /// Build a literal value
    pub fn literal(value: impl Into<Value>) -> Self {
        ConfigValue::Literal(value.into())
    }

    /// Build an expression value
    pub fn call(name: impl Into<String>, args: Vec<ConfigValue>) -> Self {
        ConfigValue::Expression {
            call: name.into(),
            args,
        }
    }

    /// Shorthand for `{"$call": "ctx", "args": [path]}`
    pub fn ctx(path: &str) -> Self {
        Self::call("ctx", vec![Self::literal(path)])
    }

    /// Convert raw JSON, detecting expressions at any depth
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) if map.contains_key(CALL_KEY) => {
                let mut map = map;
                let call = match map.remove(CALL_KEY) {
                    Some(Value::String(name)) => name,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let args = match map.remove(ARGS_KEY) {
                    Some(Value::Array(items)) => items.into_iter().map(Self::from_value).collect(),
                    Some(Value::Null) | None => Vec::new(),
                    Some(single) => vec![Self::from_value(single)],
                };
                ConfigValue::Expression { call, args }
            }
            Value::Object(map) => {
                let entries: Vec<(String, ConfigValue)> = map
                    .into_iter()
                    .map(|(k, v)| (k, Self::from_value(v)))
                    .collect();
                if entries.iter().all(|(_, v)| v.is_literal()) {
                    ConfigValue::Literal(Value::Object(
                        entries
                            .into_iter()
                            .map(|(k, v)| (k, v.into_value()))
                            .collect(),
                    ))
                } else {
                    ConfigValue::Map(entries)
                }
            }
            Value::Array(items) => {
                let items: Vec<ConfigValue> = items.into_iter().map(Self::from_value).collect();
                if items.iter().all(ConfigValue::is_literal) {
                    ConfigValue::Literal(Value::Array(
                        items.into_iter().map(ConfigValue::into_value).collect(),
                    ))
                } else {
                    ConfigValue::List(items)
                }
            }
            scalar => ConfigValue::Literal(scalar),
        }
    }

    /// Back to the JSON syntax the value was read from
    pub fn into_value(self) -> Value {
        match self {
            ConfigValue::Literal(v) => v,
            ConfigValue::Expression { call, args } => json!({
                CALL_KEY: call,
                ARGS_KEY: args.into_iter().map(ConfigValue::into_value).collect::<Vec<_>>(),
            }),
            ConfigValue::List(items) => {
                Value::Array(items.into_iter().map(ConfigValue::into_value).collect())
            }
            ConfigValue::Map(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.into_value()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, ConfigValue::Literal(_))
    }

    /// Whether evaluation is needed to know the value
    pub fn is_dynamic(&self) -> bool {
        !self.is_literal()
    }

    /// The literal value, if no evaluation is needed
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            ConfigValue::Literal(v) => Some(v),
            _ => None,
        }
    }

    /// A literal `null` counts as an absent setting
    pub fn is_null(&self) -> bool {
        matches!(self, ConfigValue::Literal(Value::Null))
    }
}

impl Default for ConfigValue {
    fn default() -> Self {
        ConfigValue::Literal(Value::Null)
    }
}

impl From<Value> for ConfigValue {
    fn from(value: Value) -> Self {
        Self::from_value(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Literal(Value::Bool(value))
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Literal(Value::String(value.to_string()))
    }
}

impl From<u64> for ConfigValue {
    fn from(value: u64) -> Self {
        ConfigValue::Literal(json!(value))
    }
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(Self::from_value(raw))
    }
}

impl Serialize for ConfigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.clone().into_value().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_object_stays_literal() {
        let value = ConfigValue::from_value(json!({"a": 1, "b": [1, 2]}));
        assert!(value.is_literal());
    }

    #[test]
    fn test_expression_detected() {
        let value = ConfigValue::from_value(json!({"$call": "ctx", "args": ["params.id"]}));
        match value {
            ConfigValue::Expression { call, args } => {
                assert_eq!(call, "ctx");
                assert_eq!(args, vec![ConfigValue::literal("params.id")]);
            }
            other => panic!("expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_expression_makes_map() {
        let value = ConfigValue::from_value(json!({
            "name": "fixed",
            "owner": {"$call": "ctx", "args": ["params.userId"]}
        }));
        assert!(matches!(value, ConfigValue::Map(_)));
        assert!(value.is_dynamic());
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let value: ConfigValue = serde_yaml::from_str("$call: not\nargs: [true]").unwrap();
        assert!(matches!(value, ConfigValue::Expression { ref call, .. } if call == "not"));
    }
}
