//! Alternative wire encodings of front-end input
//!
//! Two encodings are accepted besides the canonical JSON shape:
//!
//! - **Flat GET parameters** for reads, decoded by [`decode_get_params`] or
//!   the [`GetParams`] axum extractor:
//!
//!   ```text
//!   and_where_eq_t-name=Blue
//!   or_where_in_t-year[]=1999&or_where_in_t-year[]=2001
//!   and_where_gt_t-rating_2=3
//!   and_where_andX_group=[{"field":"t.a","operator":"eq","arguments":[1]}]
//!   orderBy_t-name=DESC&groupBy[]=t.genre
//!   placeholder_owner_integer=4&option_limit=10
//!   ```
//!
//!   Dots in field names are written as dashes. A trailing `_<n>` lets two
//!   conditions share operator and field.
//!
//! - **Simplified mutation params**, expanded by [`normalize_simplified`]
//!   into the chain form the binder understands.

use crate::core::binder::{ChainType, id_key};
use crate::core::error::{GateError, GateResult, RequestError};
use crate::core::filter::{ConditionType, FilterCondition, Operator};
use crate::core::query::{FrontEndOptions, FrontEndPlaceholder, RequestOptions};
use crate::core::store::Persistence;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn condition_key_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^(and|or)_(where|having)_([A-Za-z]+)_(.+?)(?:_(\d+))?$").unwrap())
}

/// Interpret a raw GET value, keeping it a string unless it is a number or boolean
pub fn parse_scalar(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

fn field_name(encoded: &str) -> String {
    encoded.replace('-', ".")
}

fn invalid(message: String) -> GateError {
    RequestError::InvalidParams { message }.into()
}

#[derive(Debug)]
struct PendingCondition {
    clause: String,
    condition_type: ConditionType,
    operator: String,
    field: String,
    values: Vec<String>,
}

/// Decode flat GET pairs into [`FrontEndOptions`]
///
/// Unknown keys are ignored so the query string can carry unrelated data.
pub fn decode_get_params(pairs: &[(String, String)]) -> GateResult<FrontEndOptions> {
    let mut decoded = FrontEndOptions::new();
    let mut pending: IndexMap<String, PendingCondition> = IndexMap::new();
    let mut options = Map::new();

    for (raw_key, raw_value) in pairs {
        let key = raw_key.strip_suffix("[]").unwrap_or(raw_key);

        if let Some(captures) = condition_key_regex().captures(key) {
            let entry = pending.entry(key.to_string()).or_insert_with(|| PendingCondition {
                clause: captures[2].to_string(),
                condition_type: if &captures[1] == "or" {
                    ConditionType::Or
                } else {
                    ConditionType::And
                },
                operator: captures[3].to_string(),
                field: field_name(&captures[4]),
                values: Vec::new(),
            });
            entry.values.push(raw_value.clone());
        } else if let Some(field) = key.strip_prefix("orderBy_") {
            decoded
                .query
                .order_by
                .insert(field_name(field), raw_value.clone());
        } else if key == "groupBy" {
            decoded.query.group_by.push(field_name(raw_value));
        } else if let Some(rest) = key.strip_prefix("placeholder_") {
            let (name, param_type) = match rest.split_once('_') {
                Some((name, param_type)) => (name, Some(param_type.to_string())),
                None => (rest, None),
            };
            decoded.query.placeholders.insert(
                name.to_string(),
                FrontEndPlaceholder {
                    value: parse_scalar(raw_value),
                    param_type,
                },
            );
        } else if let Some(name) = key.strip_prefix("option_") {
            options.insert(name.to_string(), parse_scalar(raw_value));
        }
    }

    for (key, condition) in pending {
        let operator: Operator = condition.operator.parse()?;
        let mut decoded_condition = match operator {
            Operator::AndX | Operator::OrX => {
                let raw = condition.values.first().map(String::as_str).unwrap_or("[]");
                let conditions: Vec<FilterCondition> = serde_json::from_str(raw)
                    .map_err(|e| invalid(format!("'{}' must hold JSON conditions: {}", key, e)))?;
                FilterCondition::group(operator.as_str(), conditions)
            }
            Operator::IsNull | Operator::IsNotNull => {
                FilterCondition::new(&condition.field, operator.as_str(), Vec::new())
            }
            _ => FilterCondition::new(
                &condition.field,
                operator.as_str(),
                condition.values.iter().map(|v| parse_scalar(v)).collect(),
            ),
        };
        decoded_condition = decoded_condition.with_type(condition.condition_type);
        match condition.clause.as_str() {
            "having" => decoded.query.having.push(decoded_condition),
            _ => decoded.query.where_clause.push(decoded_condition),
        }
    }

    if !options.is_empty() {
        decoded.options = serde_json::from_value::<RequestOptions>(Value::Object(options))
            .map_err(|e| invalid(format!("invalid option: {}", e)))?;
    }
    decoded.options.use_get_params = Some(true);
    Ok(decoded)
}

/// Extracts [`FrontEndOptions`] from a flat GET query string
///
/// ```ignore
/// async fn list(GetParams(front_end): GetParams) -> Result<ReadOutcome, GateError> {
///     registry.repository("album")?.read(json!({}), front_end, CallOptions::new())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct GetParams(pub FrontEndOptions);

impl<S> FromRequestParts<S> for GetParams
where
    S: Send + Sync,
{
    type Rejection = GateError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri)
            .map_err(|e| invalid(e.body_text()))?;
        Ok(GetParams(decode_get_params(&pairs)?))
    }
}

// =============================================================================
// Simplified mutation params
// =============================================================================

/// Expand simplified params into the chain form
///
/// Top level: a list of objects (or one object); `id` selects the entity for
/// update and delete. Relation values:
///
/// - `id` plus other fields → `update`
/// - `id` only → `read`
/// - no `id` → `create`
/// - explicit `chainType` / `assignType` win over inference
/// - list elements default to `addSingle`, single objects to `set`
pub fn normalize_simplified(
    persistence: &dyn Persistence,
    entity_type: &str,
    chain: ChainType,
    params: Value,
) -> GateResult<Value> {
    let items = match params {
        Value::Array(items) => items,
        Value::Object(fields) => vec![Value::Object(fields)],
        Value::Null => return Ok(Value::Null),
        other => return Err(invalid(format!("simplified params must be objects, got {}", other))),
    };

    if chain == ChainType::Create {
        let mut created = Vec::with_capacity(items.len());
        for item in items {
            let Value::Object(fields) = item else {
                return Err(invalid("create entries must be objects".to_string()));
            };
            created.push(Value::Object(normalize_fields(persistence, entity_type, fields)?));
        }
        return Ok(Value::Array(created));
    }

    let mut by_id = Map::new();
    for item in items {
        let (id, fields) = match item {
            Value::Object(mut fields) => {
                let id = fields
                    .remove("id")
                    .filter(|id| !id.is_null())
                    .ok_or_else(|| invalid(format!("{} entries need an id", chain)))?;
                (id, fields)
            }
            scalar @ (Value::String(_) | Value::Number(_)) => (scalar, Map::new()),
            other => return Err(invalid(format!("invalid {} entry {}", chain, other))),
        };
        by_id.insert(
            id_key(&id),
            Value::Object(normalize_fields(persistence, entity_type, fields)?),
        );
    }
    Ok(Value::Object(by_id))
}

fn normalize_fields(
    persistence: &dyn Persistence,
    entity_type: &str,
    fields: Map<String, Value>,
) -> GateResult<Map<String, Value>> {
    let associations = persistence.associations(entity_type);
    let mut normalized = Map::new();
    for (name, value) in fields {
        let value = match associations.iter().find(|a| a.name == name) {
            Some(association) => match value {
                Value::Array(items) => {
                    let mut chains = Map::new();
                    for item in items {
                        add_to_chain(persistence, &association.target, item, "addSingle", &mut chains)?;
                    }
                    Value::Object(chains)
                }
                object @ Value::Object(_) => {
                    let mut chains = Map::new();
                    add_to_chain(persistence, &association.target, object, "set", &mut chains)?;
                    Value::Object(chains)
                }
                // Bare ids and null are understood by the binder as they are
                other => other,
            },
            None => value,
        };
        normalized.insert(name, value);
    }
    Ok(normalized)
}

fn add_to_chain(
    persistence: &dyn Persistence,
    target: &str,
    item: Value,
    default_assign: &str,
    chains: &mut Map<String, Value>,
) -> GateResult<()> {
    let mut fields = match item {
        Value::Object(fields) => fields,
        scalar @ (Value::String(_) | Value::Number(_)) => {
            let mut fields = Map::new();
            fields.insert("id".to_string(), scalar);
            fields
        }
        other => return Err(invalid(format!("invalid relation entry {}", other))),
    };

    let explicit = match fields.remove("chainType") {
        Some(Value::String(name)) => Some(name.parse::<ChainType>()?),
        Some(Value::Null) | None => None,
        Some(other) => {
            return Err(RequestError::UnknownChainType {
                chain_type: other.to_string(),
            }
            .into());
        }
    };
    let id = fields.remove("id").filter(|id| !id.is_null());
    let has_values = fields.keys().any(|k| k != "assignType");
    let chain = match (explicit, &id) {
        (Some(chain), _) => chain,
        (None, None) => ChainType::Create,
        (None, Some(_)) if has_values => ChainType::Update,
        (None, Some(_)) => ChainType::Read,
    };

    if chain != ChainType::Delete && !fields.contains_key("assignType") {
        fields.insert("assignType".to_string(), Value::String(default_assign.to_string()));
    }
    let fields = normalize_fields(persistence, target, fields)?;

    let slot = chains.entry(chain.as_str().to_string());
    match (chain, id) {
        (ChainType::Create, _) => {
            if let Value::Array(list) = slot.or_insert_with(|| Value::Array(Vec::new())) {
                list.push(Value::Object(fields));
            }
        }
        (_, Some(id)) => {
            if let Value::Object(map) = slot.or_insert_with(|| Value::Object(Map::new())) {
                map.insert(id_key(&id), Value::Object(fields));
            }
        }
        (_, None) => return Err(invalid(format!("{} chain needs an id", chain))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_scalar() {
        assert_eq!(parse_scalar("12"), json!(12));
        assert_eq!(parse_scalar("true"), json!(true));
        assert_eq!(parse_scalar("Blue"), json!("Blue"));
        assert_eq!(parse_scalar("\"quoted\""), json!("\"quoted\""));
    }

    #[test]
    fn test_decode_conditions() {
        let decoded = decode_get_params(&pairs(&[
            ("and_where_eq_t-name", "Blue"),
            ("or_where_in_t-year[]", "1999"),
            ("or_where_in_t-year[]", "2001"),
            ("and_where_gt_t-rating_2", "3"),
            ("and_having_isNull_t-deletedAt", ""),
        ]))
        .unwrap();

        let conditions = &decoded.query.where_clause;
        assert_eq!(conditions.len(), 3);
        assert_eq!(conditions[0].field.as_deref(), Some("t.name"));
        assert_eq!(conditions[0].arguments, vec![json!("Blue")]);
        assert_eq!(conditions[1].condition_type, ConditionType::Or);
        assert_eq!(conditions[1].arguments, vec![json!(1999), json!(2001)]);
        assert_eq!(conditions[2].field.as_deref(), Some("t.rating"));
        assert_eq!(decoded.query.having[0].operator, "isNull");
        assert!(decoded.query.having[0].arguments.is_empty());
    }

    #[test]
    fn test_decode_group_condition() {
        let decoded = decode_get_params(&pairs(&[(
            "and_where_orX_g",
            r#"[{"field":"t.a","operator":"eq","arguments":[1]},{"field":"t.b","operator":"eq","arguments":[2]}]"#,
        )]))
        .unwrap();
        let group = &decoded.query.where_clause[0];
        assert_eq!(group.operator, "orX");
        assert_eq!(group.conditions.len(), 2);
    }

    #[test]
    fn test_decode_order_group_placeholder_option() {
        let decoded = decode_get_params(&pairs(&[
            ("orderBy_t-name", "DESC"),
            ("groupBy[]", "t.genre"),
            ("placeholder_owner_integer", "4"),
            ("placeholder_name", "x"),
            ("option_limit", "10"),
            ("option_returnCount", "false"),
            ("unrelated", "ignored"),
        ]))
        .unwrap();
        assert_eq!(decoded.query.order_by.get("t.name").map(String::as_str), Some("DESC"));
        assert_eq!(decoded.query.group_by, vec!["t.genre".to_string()]);
        assert_eq!(decoded.query.placeholders["owner"].value, json!(4));
        assert_eq!(decoded.query.placeholders["owner"].param_type.as_deref(), Some("integer"));
        assert_eq!(decoded.query.placeholders["name"].param_type, None);
        assert_eq!(decoded.options.limit, Some(10));
        assert_eq!(decoded.options.return_count, Some(false));
        assert_eq!(decoded.options.use_get_params, Some(true));
    }

    #[test]
    fn test_decode_unsafe_operator() {
        let err = decode_get_params(&pairs(&[("and_where_exec_t-name", "x")])).unwrap_err();
        assert_eq!(err.error_code(), "UNSAFE_OPERATOR");
    }
}
