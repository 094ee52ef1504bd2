//! Two-layer permission evaluation
//!
//! Every permission question is asked of two layers: an aggregate node
//! (for example `read.permissions.where`) and an optional field node below
//! it (`read.permissions.where.fields["t.name"]`). The field layer is the
//! authority when it has an explicit answer; otherwise the `permissive`
//! flags decide how the aggregate layer is consulted.

use crate::core::error::GateResult;
use crate::core::resolver::{ConfigResolver, ResolveContext};
use crate::core::value::ConfigValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Per-field (or per-aggregate) value hooks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSettings {
    /// Evaluated with `value` in context; `false` vetoes the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closure: Option<ConfigValue>,

    /// Evaluated with `value` in context; the result replaces the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutate: Option<ConfigValue>,

    /// Value the field must hold (a map of field → value at action level)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce: Option<ConfigValue>,

    /// Value forced onto the field (a map of field → value at action level)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_to: Option<ConfigValue>,

    /// Validation rules, only read at action level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<ValidateSettings>,
}

impl PermissionSettings {
    fn merge(&mut self, other: &PermissionSettings) {
        if other.closure.is_some() {
            self.closure = other.closure.clone();
        }
        if other.mutate.is_some() {
            self.mutate = other.mutate.clone();
        }
        if other.enforce.is_some() {
            self.enforce = other.enforce.clone();
        }
        if other.set_to.is_some() {
            self.set_to = other.set_to.clone();
        }
        if other.validate.is_some() {
            self.validate = other.validate.clone();
        }
    }
}

/// Validation rules handed to the validation collaborator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateSettings {
    /// Restrict validation to these fields (all rule fields when empty)
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub rules: IndexMap<String, String>,
    #[serde(default)]
    pub messages: IndexMap<String, String>,
    #[serde(default)]
    pub custom_attributes: IndexMap<String, String>,
}

/// Which allow-list a check consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Operators,
    Directions,
    Assign,
    Chain,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Operators => "operators",
            Bucket::Directions => "directions",
            Bucket::Assign => "assign",
            Bucket::Chain => "chain",
        }
    }
}

/// Field layer of a permission check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldPermission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissive: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub operators: IndexMap<String, ConfigValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub directions: IndexMap<String, ConfigValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub assign: IndexMap<String, ConfigValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub chain: IndexMap<String, ConfigValue>,
    #[serde(default)]
    pub settings: PermissionSettings,
}

/// Aggregate layer of a permission check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissive: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub operators: IndexMap<String, ConfigValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub directions: IndexMap<String, ConfigValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub assign: IndexMap<String, ConfigValue>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub chain: IndexMap<String, ConfigValue>,
    #[serde(default)]
    pub settings: PermissionSettings,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub fields: IndexMap<String, FieldPermission>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub placeholder_names: IndexMap<String, FieldPermission>,
}

/// Read access to the allow-lists shared by both layers
pub trait PermissionLayer {
    fn bucket(&self, bucket: Bucket) -> &IndexMap<String, ConfigValue>;
    fn permissive(&self) -> Option<&ConfigValue>;
    fn settings(&self) -> &PermissionSettings;
}

macro_rules! impl_permission_layer {
    ($ty:ty) => {
        impl PermissionLayer for $ty {
            fn bucket(&self, bucket: Bucket) -> &IndexMap<String, ConfigValue> {
                match bucket {
                    Bucket::Operators => &self.operators,
                    Bucket::Directions => &self.directions,
                    Bucket::Assign => &self.assign,
                    Bucket::Chain => &self.chain,
                }
            }

            fn permissive(&self) -> Option<&ConfigValue> {
                self.permissive.as_ref()
            }

            fn settings(&self) -> &PermissionSettings {
                &self.settings
            }
        }
    };
}

impl_permission_layer!(PermissionNode);
impl_permission_layer!(FieldPermission);

fn merge_flag(base: &mut Option<ConfigValue>, other: &Option<ConfigValue>) {
    if other.is_some() {
        *base = other.clone();
    }
}

fn merge_bucket(base: &mut IndexMap<String, ConfigValue>, other: &IndexMap<String, ConfigValue>) {
    for (key, value) in other {
        base.insert(key.clone(), value.clone());
    }
}

impl FieldPermission {
    /// Merge an override layer into this one; set flags win, buckets union
    pub fn merge(&mut self, other: &FieldPermission) {
        merge_flag(&mut self.allowed, &other.allowed);
        merge_flag(&mut self.permissive, &other.permissive);
        merge_bucket(&mut self.operators, &other.operators);
        merge_bucket(&mut self.directions, &other.directions);
        merge_bucket(&mut self.assign, &other.assign);
        merge_bucket(&mut self.chain, &other.chain);
        self.settings.merge(&other.settings);
    }
}

impl PermissionNode {
    /// Merge an override layer into this one; set flags win, maps union
    pub fn merge(&mut self, other: &PermissionNode) {
        merge_flag(&mut self.allowed, &other.allowed);
        merge_flag(&mut self.permissive, &other.permissive);
        merge_bucket(&mut self.operators, &other.operators);
        merge_bucket(&mut self.directions, &other.directions);
        merge_bucket(&mut self.assign, &other.assign);
        merge_bucket(&mut self.chain, &other.chain);
        self.settings.merge(&other.settings);
        for (name, field) in &other.fields {
            self.fields
                .entry(name.clone())
                .or_default()
                .merge(field);
        }
        for (name, field) in &other.placeholder_names {
            self.placeholder_names
                .entry(name.clone())
                .or_default()
                .merge(field);
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldPermission> {
        self.fields.get(name)
    }
}

/// Outcome of a permission check
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Whether the target is allowed
    pub allowed: bool,
    /// Whether a closure rejected the value
    pub vetoed: bool,
    /// The candidate value after `mutate`
    pub value: Value,
}

/// Evaluates permission questions against resolved configuration
#[derive(Debug, Clone, Copy)]
pub struct PermissionEvaluator<'a> {
    resolver: &'a ConfigResolver,
}

impl<'a> PermissionEvaluator<'a> {
    pub fn new(resolver: &'a ConfigResolver) -> Self {
        Self { resolver }
    }

    /// Run the `mutate` and `closure` hooks for a candidate value
    ///
    /// Hooks missing on the field layer fall back to the aggregate layer.
    pub fn apply_hooks(
        &self,
        aggregate: &dyn PermissionLayer,
        field: Option<&dyn PermissionLayer>,
        value: Value,
        ctx: &ResolveContext,
    ) -> GateResult<(Value, bool)> {
        let field_settings = field.map(|f| f.settings());
        let mutate = field_settings
            .and_then(|s| s.mutate.as_ref())
            .or(aggregate.settings().mutate.as_ref());
        let closure = field_settings
            .and_then(|s| s.closure.as_ref())
            .or(aggregate.settings().closure.as_ref());

        let value = match mutate {
            Some(mutate) => self
                .resolver
                .resolve(mutate, &ctx.with_extra("value", value))?,
            None => value,
        };

        let vetoed = match closure {
            Some(closure) => {
                let closure_ctx = ctx.with_extra("value", value.clone());
                let outcome = self.resolver.resolve(closure, &closure_ctx)?;
                outcome == Value::Bool(false)
            }
            None => false,
        };

        Ok((value, vetoed))
    }

    /// Check whether `target` is allowed in `bucket`
    ///
    /// 1. field `mutate` transforms the candidate value
    /// 2. field `closure` returning `false` vetoes unconditionally
    /// 3. an explicit field bucket entry for `target` is authoritative
    /// 4. otherwise a permissive field allows unless the aggregate bucket
    ///    denies `target`; a non-permissive field allows only when the
    ///    aggregate bucket allows `target` or the aggregate is permissive
    pub fn permissive_permission_check(
        &self,
        aggregate: &dyn PermissionLayer,
        field: Option<&dyn PermissionLayer>,
        bucket: Bucket,
        target: &str,
        value: Value,
        ctx: &ResolveContext,
    ) -> GateResult<Verdict> {
        let (value, vetoed) = self.apply_hooks(aggregate, field, value, ctx)?;
        if vetoed {
            debug!(bucket = bucket.as_str(), target, "closure vetoed value");
            return Ok(Verdict {
                allowed: false,
                vetoed: true,
                value,
            });
        }

        let check_ctx = ctx.with_extra("value", value.clone());
        let allowed = self.bucket_check(aggregate, field, bucket, target, &check_ctx)?;

        Ok(Verdict {
            allowed,
            vetoed: false,
            value,
        })
    }

    /// Steps 3 and 4 of [`permissive_permission_check`](Self::permissive_permission_check),
    /// without running any value hooks
    pub fn bucket_check(
        &self,
        aggregate: &dyn PermissionLayer,
        field: Option<&dyn PermissionLayer>,
        bucket: Bucket,
        target: &str,
        ctx: &ResolveContext,
    ) -> GateResult<bool> {
        let setting = format!("{}.{}", bucket.as_str(), target);
        let check_ctx = ctx.with_extra("target", Value::String(target.to_string()));

        let explicit = match field {
            Some(f) => self
                .resolver
                .resolve_bool(f.bucket(bucket).get(target), &check_ctx, &setting)?,
            None => None,
        };

        let allowed = match explicit {
            Some(answer) => answer,
            None => {
                let field_permissive = match field {
                    Some(f) => self
                        .resolver
                        .resolve_bool(f.permissive(), &check_ctx, "permissive")?
                        .unwrap_or(false),
                    None => false,
                };
                let aggregate_entry = self.resolver.resolve_bool(
                    aggregate.bucket(bucket).get(target),
                    &check_ctx,
                    &setting,
                )?;
                if field_permissive {
                    aggregate_entry != Some(false)
                } else {
                    aggregate_entry == Some(true)
                        || self
                            .resolver
                            .resolve_bool(aggregate.permissive(), &check_ctx, "permissive")?
                            .unwrap_or(false)
                }
            }
        };

        Ok(allowed)
    }

    /// Field `allowed` when set, else aggregate `permissive` (default `false`)
    pub fn permissive_allowed_check(
        &self,
        aggregate: &dyn PermissionLayer,
        field_allowed: Option<&ConfigValue>,
        ctx: &ResolveContext,
    ) -> GateResult<bool> {
        if let Some(answer) = self.resolver.resolve_bool(field_allowed, ctx, "allowed")? {
            return Ok(answer);
        }
        Ok(self
            .resolver
            .resolve_bool(aggregate.permissive(), ctx, "permissive")?
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(yaml: &str) -> PermissionNode {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn check(
        aggregate: &PermissionNode,
        field: &str,
        operator: &str,
        value: Value,
    ) -> Verdict {
        let resolver = ConfigResolver::default();
        let evaluator = PermissionEvaluator::new(&resolver);
        evaluator
            .permissive_permission_check(
                aggregate,
                aggregate.field(field).map(|f| f as &dyn PermissionLayer),
                Bucket::Operators,
                operator,
                value,
                &ResolveContext::default(),
            )
            .unwrap()
    }

    // --- permissive_permission_check ---

    #[test]
    fn test_non_permissive_everywhere_denies() {
        let agg = node("permissive: false\nfields:\n  t.name:\n    permissive: false\n");
        assert!(!check(&agg, "t.name", "eq", json!("x")).allowed);
    }

    #[test]
    fn test_field_entry_is_authoritative() {
        let agg = node(
            "permissive: true\noperators: {eq: true}\nfields:\n  t.name:\n    operators: {eq: false}\n",
        );
        assert!(!check(&agg, "t.name", "eq", json!("x")).allowed);

        let agg = node("permissive: false\nfields:\n  t.name:\n    operators: {eq: true}\n");
        assert!(check(&agg, "t.name", "eq", json!("x")).allowed);
    }

    #[test]
    fn test_permissive_field_respects_aggregate_denial() {
        let agg = node("operators: {like: false}\nfields:\n  t.name:\n    permissive: true\n");
        assert!(!check(&agg, "t.name", "like", json!("x")).allowed);
        assert!(check(&agg, "t.name", "eq", json!("x")).allowed);
    }

    #[test]
    fn test_non_permissive_field_uses_aggregate_allow() {
        let agg = node("operators: {eq: true}\n");
        assert!(check(&agg, "t.name", "eq", json!("x")).allowed);
        assert!(!check(&agg, "t.name", "neq", json!("x")).allowed);

        let agg = node("permissive: true\n");
        assert!(check(&agg, "t.anything", "gt", json!(1)).allowed);
    }

    #[test]
    fn test_closure_veto_beats_explicit_allow() {
        let agg = node(
            r#"
fields:
  t.name:
    operators: {eq: true}
    settings:
      closure: {"$call": "neq", "args": [{"$call": "ctx", "args": ["value"]}, "forbidden"]}
"#,
        );
        let verdict = check(&agg, "t.name", "eq", json!("forbidden"));
        assert!(verdict.vetoed);
        assert!(!verdict.allowed);
        assert!(check(&agg, "t.name", "eq", json!("fine")).allowed);
    }

    #[test]
    fn test_mutate_runs_before_closure() {
        let agg = node(
            r#"
permissive: true
fields:
  t.name:
    settings:
      mutate: {"$call": "uppercase", "args": [{"$call": "ctx", "args": ["value"]}]}
      closure: {"$call": "eq", "args": [{"$call": "ctx", "args": ["value"]}, "BOB"]}
"#,
        );
        let verdict = check(&agg, "t.name", "eq", json!("bob"));
        assert!(verdict.allowed);
        assert_eq!(verdict.value, json!("BOB"));
    }

    #[test]
    fn test_aggregate_settings_fallback() {
        let agg = node(
            r#"
permissive: true
settings:
  closure: {"$call": "not", "args": [{"$call": "is_null", "args": [{"$call": "ctx", "args": ["value"]}]}]}
"#,
        );
        assert!(check(&agg, "t.name", "eq", Value::Null).vetoed);
    }

    // --- permissive_allowed_check ---

    #[test]
    fn test_permissive_allowed_check() {
        let resolver = ConfigResolver::default();
        let evaluator = PermissionEvaluator::new(&resolver);
        let ctx = ResolveContext::default();
        let strict = node("permissive: false");
        let open = node("permissive: true");
        let no = ConfigValue::from(false);

        assert!(!evaluator.permissive_allowed_check(&strict, None, &ctx).unwrap());
        assert!(evaluator.permissive_allowed_check(&open, None, &ctx).unwrap());
        assert!(!evaluator.permissive_allowed_check(&open, Some(&no), &ctx).unwrap());
        assert!(!evaluator
            .permissive_allowed_check(&PermissionNode::default(), None, &ctx)
            .unwrap());
    }

    // --- merge ---

    #[test]
    fn test_override_merge_keeps_unset_flags() {
        let mut base = node("permissive: false\noperators: {eq: true}\nfields:\n  t.a:\n    permissive: true\n");
        let overrides = node("operators: {like: true}\nfields:\n  t.a:\n    operators: {gt: false}\n");
        base.merge(&overrides);
        assert_eq!(base.permissive, Some(ConfigValue::from(false)));
        assert_eq!(base.operators.len(), 2);
        let field = base.field("t.a").unwrap();
        assert_eq!(field.permissive, Some(ConfigValue::from(true)));
        assert_eq!(field.operators.get("gt"), Some(&ConfigValue::from(false)));
    }
}
