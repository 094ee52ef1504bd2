//! Validation collaborator
//!
//! Before an entity is persisted its values are handed to a [`Validator`]
//! together with the rules declared in the action's `settings.validate`
//! block. [`RuleValidator`] is the default implementation and understands
//! pipe-separated rule strings such as `required|min:3`.

pub mod filters;
pub mod validators;

use indexmap::IndexMap;
use serde_json::{Map, Value};
use validators::Check;

/// Rejects entity values that do not satisfy the configured rules
pub trait Validator: Send + Sync {
    /// Validate `values` against `rules` (field → rule string)
    ///
    /// `messages` overrides default messages by `field.rule` key and
    /// `custom_attributes` maps field names to the labels used in messages.
    fn validate(
        &self,
        values: &Map<String, Value>,
        rules: &IndexMap<String, String>,
        messages: &IndexMap<String, String>,
        custom_attributes: &IndexMap<String, String>,
    ) -> Result<(), Vec<String>>;
}

/// Default validator supporting `required`, `positive`, `min:N`, `max:N`,
/// `between:A,B`, `in:a,b,...`, `email` and `date:FORMAT`
#[derive(Debug, Clone, Default)]
pub struct RuleValidator;

impl RuleValidator {
    pub fn new() -> Self {
        Self
    }

    fn parse_rule(rule: &str) -> Result<(String, Check), String> {
        let (name, arg) = match rule.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (rule.trim(), None),
        };

        let number = |raw: Option<&str>| -> Result<f64, String> {
            raw.and_then(|r| r.parse::<f64>().ok())
                .ok_or_else(|| format!("Rule '{}' needs a numeric argument", name))
        };

        let check: Check = match name {
            "required" => Box::new(validators::required()),
            "positive" => Box::new(validators::positive()),
            "email" => Box::new(validators::email()),
            "min" => Box::new(validators::min(number(arg)?)),
            "max" => Box::new(validators::max(number(arg)?)),
            "between" => {
                let (low, high) = arg
                    .and_then(|a| a.split_once(','))
                    .ok_or_else(|| "Rule 'between' needs two arguments".to_string())?;
                Box::new(validators::between(
                    number(Some(low.trim()))?,
                    number(Some(high.trim()))?,
                ))
            }
            "in" => Box::new(validators::in_list(
                arg.unwrap_or_default()
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )),
            "date" => Box::new(validators::date_format(
                arg.unwrap_or("%Y-%m-%d").to_string(),
            )),
            other => return Err(format!("Unknown validation rule '{}'", other)),
        };

        Ok((name.to_string(), check))
    }
}

impl Validator for RuleValidator {
    fn validate(
        &self,
        values: &Map<String, Value>,
        rules: &IndexMap<String, String>,
        messages: &IndexMap<String, String>,
        custom_attributes: &IndexMap<String, String>,
    ) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (field, rule_string) in rules {
            let value = values.get(field).unwrap_or(&Value::Null);
            let attribute = custom_attributes
                .get(field)
                .map(String::as_str)
                .unwrap_or(field);

            for rule in rule_string.split('|').filter(|r| !r.trim().is_empty()) {
                let (name, check) = match Self::parse_rule(rule) {
                    Ok(parsed) => parsed,
                    Err(message) => {
                        errors.push(format!("{} ({})", message, field));
                        continue;
                    }
                };
                if let Err(default_message) = check(attribute, value) {
                    let message = messages
                        .get(&format!("{}.{}", field, name))
                        .map(|custom| custom.replace(":attribute", attribute))
                        .unwrap_or(default_message);
                    errors.push(message);
                }
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn values(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_all_rules_pass() {
        let validator = RuleValidator::new();
        let result = validator.validate(
            &values(json!({"name": "Bob", "email": "bob@example.com", "age": 30})),
            &rules(&[("name", "required|min:2"), ("email", "email"), ("age", "between:18,99")]),
            &IndexMap::new(),
            &IndexMap::new(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_collects_every_failure() {
        let validator = RuleValidator::new();
        let errors = validator
            .validate(
                &values(json!({"name": "B"})),
                &rules(&[("name", "min:2"), ("email", "required")]),
                &IndexMap::new(),
                &IndexMap::new(),
            )
            .unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_custom_messages_and_attributes() {
        let validator = RuleValidator::new();
        let errors = validator
            .validate(
                &values(json!({})),
                &rules(&[("name", "required")]),
                &rules(&[("name.required", "Please give :attribute")]),
                &rules(&[("name", "artist name")]),
            )
            .unwrap_err();
        assert_eq!(errors, vec!["Please give artist name".to_string()]);
    }

    #[test]
    fn test_unknown_rule_is_reported() {
        let validator = RuleValidator::new();
        let errors = validator
            .validate(
                &values(json!({"name": "x"})),
                &rules(&[("name", "shiny")]),
                &IndexMap::new(),
                &IndexMap::new(),
            )
            .unwrap_err();
        assert!(errors[0].contains("Unknown validation rule 'shiny'"));
    }
}
