//! Resolution of dynamic configuration values
//!
//! A [`ConfigResolver`] turns a [`ConfigValue`] into a concrete JSON value by
//! evaluating expressions against a [`ResolveContext`]. Only callables that
//! were registered in the [`ExpressionRegistry`] before the registry was
//! frozen can be invoked, so configuration can never run arbitrary code.

use crate::core::error::{ExpressionError, GateResult};
use crate::core::validation::filters;
use crate::core::value::ConfigValue;
use anyhow::{Result, anyhow};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A registered callable: receives resolved arguments and the call context
pub type Callable = Arc<dyn Fn(&[Value], &ResolveContext) -> Result<Value> + Send + Sync>;

/// Closed set of named callables available to configuration expressions
#[derive(Clone)]
pub struct ExpressionRegistry {
    callables: HashMap<String, Callable>,
}

impl fmt::Debug for ExpressionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.callables.keys().collect();
        names.sort();
        f.debug_struct("ExpressionRegistry")
            .field("callables", &names)
            .finish()
    }
}

impl Default for ExpressionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ExpressionRegistry {
    /// Create a registry with no callables at all
    pub fn empty() -> Self {
        Self {
            callables: HashMap::new(),
        }
    }

    /// Create a registry preloaded with the built-in callables
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();

        registry.register("ctx", |args, ctx| {
            let path = string_arg(args, 0, "ctx")?;
            Ok(ctx.lookup(&path).cloned().unwrap_or(Value::Null))
        });
        registry.register("not", |args, _| Ok(Value::Bool(!truthy(arg(args, 0)))));
        registry.register("and", |args, _| Ok(Value::Bool(args.iter().all(truthy))));
        registry.register("or", |args, _| Ok(Value::Bool(args.iter().any(truthy))));
        registry.register("eq", |args, _| Ok(Value::Bool(arg(args, 0) == arg(args, 1))));
        registry.register("neq", |args, _| Ok(Value::Bool(arg(args, 0) != arg(args, 1))));
        registry.register("gt", |args, _| compare(args, |o| o.is_gt()));
        registry.register("gte", |args, _| compare(args, |o| o.is_ge()));
        registry.register("lt", |args, _| compare(args, |o| o.is_lt()));
        registry.register("lte", |args, _| compare(args, |o| o.is_le()));
        registry.register("in", |args, _| {
            let needle = arg(args, 0);
            match arg(args, 1) {
                Value::Array(items) => Ok(Value::Bool(items.contains(needle))),
                other => Err(anyhow!("'in' expects a list as second argument, got {}", other)),
            }
        });
        registry.register("is_null", |args, _| Ok(Value::Bool(arg(args, 0).is_null())));
        registry.register("coalesce", |args, _| {
            Ok(args
                .iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null))
        });
        registry.register("concat", |args, _| {
            let joined: String = args.iter().map(display).collect();
            Ok(Value::String(joined))
        });
        registry.register("trim", |args, _| Ok(filters::trim(arg(args, 0).clone())));
        registry.register("lowercase", |args, _| {
            Ok(filters::lowercase(arg(args, 0).clone()))
        });
        registry.register("uppercase", |args, _| {
            Ok(filters::uppercase(arg(args, 0).clone()))
        });
        registry.register("round", |args, _| {
            let decimals = arg(args, 1).as_u64().unwrap_or(0) as u32;
            Ok(filters::round_decimals(arg(args, 0).clone(), decimals))
        });

        registry
    }

    /// Register (or replace) a named callable
    pub fn register<F>(&mut self, name: impl Into<String>, callable: F) -> &mut Self
    where
        F: Fn(&[Value], &ResolveContext) -> Result<Value> + Send + Sync + 'static,
    {
        self.callables.insert(name.into(), Arc::new(callable));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.callables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callables.contains_key(name)
    }
}

/// Per-call context that expressions can read from
///
/// Lookups use dotted paths whose first segment selects the source:
/// `params`, `options`, `optionOverrides`, `frontEndOptions`, or the name of
/// an extra such as `value`, `field` or `operator`.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub params: Value,
    pub options: Value,
    pub option_overrides: Value,
    pub front_end_options: Value,
    pub extras: Map<String, Value>,
}

impl ResolveContext {
    pub fn new(params: Value, options: Value, option_overrides: Value, front_end_options: Value) -> Self {
        Self {
            params,
            options,
            option_overrides,
            front_end_options,
            extras: Map::new(),
        }
    }

    /// Copy of this context with one extra entry added
    pub fn with_extra(&self, key: &str, value: Value) -> Self {
        let mut ctx = self.clone();
        ctx.extras.insert(key.to_string(), value);
        ctx
    }

    /// Set an extra entry in place
    pub fn set_extra(&mut self, key: &str, value: Value) {
        self.extras.insert(key.to_string(), value);
    }

    /// Look up a dotted path
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let root = match segments.next()? {
            "params" => &self.params,
            "options" => &self.options,
            "optionOverrides" => &self.option_overrides,
            "frontEndOptions" => &self.front_end_options,
            extra => self.extras.get(extra)?,
        };

        segments.try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

/// Evaluates configuration values against a call context
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    registry: Arc<ExpressionRegistry>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new(Arc::new(ExpressionRegistry::with_builtins()))
    }
}

impl ConfigResolver {
    pub fn new(registry: Arc<ExpressionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ExpressionRegistry {
        &self.registry
    }

    /// Resolve a value; arguments are resolved depth-first before the callable runs
    pub fn resolve(&self, value: &ConfigValue, ctx: &ResolveContext) -> GateResult<Value> {
        match value {
            ConfigValue::Literal(v) => Ok(v.clone()),
            ConfigValue::List(items) => items
                .iter()
                .map(|item| self.resolve(item, ctx))
                .collect::<GateResult<Vec<_>>>()
                .map(Value::Array),
            ConfigValue::Map(entries) => {
                let mut out = Map::new();
                for (key, entry) in entries {
                    out.insert(key.clone(), self.resolve(entry, ctx)?);
                }
                Ok(Value::Object(out))
            }
            ConfigValue::Expression { call, args } => {
                let callable = self
                    .registry
                    .get(call)
                    .ok_or_else(|| ExpressionError::UnknownCallable { name: call.clone() })?;
                let resolved = args
                    .iter()
                    .map(|a| self.resolve(a, ctx))
                    .collect::<GateResult<Vec<_>>>()?;
                callable(&resolved, ctx).map_err(|e| {
                    ExpressionError::CallFailed {
                        name: call.clone(),
                        message: e.to_string(),
                    }
                    .into()
                })
            }
        }
    }

    /// Resolve an optional value; `None` and `null` both yield `None`
    pub fn resolve_opt(
        &self,
        value: Option<&ConfigValue>,
        ctx: &ResolveContext,
    ) -> GateResult<Option<Value>> {
        match value {
            None => Ok(None),
            Some(v) => match self.resolve(v, ctx)? {
                Value::Null => Ok(None),
                resolved => Ok(Some(resolved)),
            },
        }
    }

    pub fn resolve_bool(
        &self,
        value: Option<&ConfigValue>,
        ctx: &ResolveContext,
        setting: &str,
    ) -> GateResult<Option<bool>> {
        match self.resolve_opt(value, ctx)? {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(other) => Err(mismatch(setting, "a boolean", &other)),
        }
    }

    pub fn resolve_u64(
        &self,
        value: Option<&ConfigValue>,
        ctx: &ResolveContext,
        setting: &str,
    ) -> GateResult<Option<u64>> {
        match self.resolve_opt(value, ctx)? {
            None => Ok(None),
            Some(Value::Number(n)) if n.as_u64().is_some() => Ok(n.as_u64()),
            Some(Value::String(s)) if s.parse::<u64>().is_ok() => Ok(s.parse().ok()),
            Some(other) => Err(mismatch(setting, "a non-negative integer", &other)),
        }
    }

    pub fn resolve_string(
        &self,
        value: Option<&ConfigValue>,
        ctx: &ResolveContext,
        setting: &str,
    ) -> GateResult<Option<String>> {
        match self.resolve_opt(value, ctx)? {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(mismatch(setting, "a string", &other)),
        }
    }

    /// Resolve the first layer that yields a non-null value
    ///
    /// Layers are given in priority order, typically call overrides, then
    /// call options, then entity defaults.
    pub fn find_setting(
        &self,
        layers: &[Option<&ConfigValue>],
        ctx: &ResolveContext,
    ) -> GateResult<Option<Value>> {
        for layer in layers {
            if let Some(v) = self.resolve_opt(*layer, ctx)? {
                return Ok(Some(v));
            }
        }
        Ok(None)
    }

    /// [`find_setting`](Self::find_setting) for boolean settings
    pub fn find_bool(
        &self,
        layers: &[Option<&ConfigValue>],
        ctx: &ResolveContext,
        setting: &str,
    ) -> GateResult<Option<bool>> {
        for layer in layers {
            if let Some(b) = self.resolve_bool(*layer, ctx, setting)? {
                return Ok(Some(b));
            }
        }
        Ok(None)
    }

    /// [`find_setting`](Self::find_setting) for integer settings
    pub fn find_u64(
        &self,
        layers: &[Option<&ConfigValue>],
        ctx: &ResolveContext,
        setting: &str,
    ) -> GateResult<Option<u64>> {
        for layer in layers {
            if let Some(n) = self.resolve_u64(*layer, ctx, setting)? {
                return Ok(Some(n));
            }
        }
        Ok(None)
    }
}

fn mismatch(setting: &str, expected: &str, actual: &Value) -> crate::core::error::GateError {
    ExpressionError::TypeMismatch {
        setting: setting.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
    .into()
}

static NULL: Value = Value::Null;

fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&NULL)
}

fn string_arg(args: &[Value], index: usize, callable: &str) -> Result<String> {
    arg(args, index)
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("'{}' expects a string argument at position {}", callable, index))
}

/// Truthiness used by the boolean built-ins
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compare(args: &[Value], test: impl Fn(std::cmp::Ordering) -> bool) -> Result<Value> {
    let ordering = match (arg(args, 0), arg(args, 1)) {
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (a, b) => return Err(anyhow!("cannot compare {} with {}", a, b)),
    };
    Ok(json!(ordering.is_some_and(test)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ResolveContext {
        ResolveContext::new(
            json!({"userId": 7, "name": "  Bob "}),
            json!({"role": "admin"}),
            Value::Null,
            json!({"options": {"limit": 10}}),
        )
    }

    // --- lookup ---

    #[test]
    fn test_lookup_dotted_paths() {
        let ctx = ctx().with_extra("value", json!([1, 2]));
        assert_eq!(ctx.lookup("params.userId"), Some(&json!(7)));
        assert_eq!(ctx.lookup("frontEndOptions.options.limit"), Some(&json!(10)));
        assert_eq!(ctx.lookup("value.1"), Some(&json!(2)));
        assert_eq!(ctx.lookup("params.missing"), None);
        assert_eq!(ctx.lookup("nothing"), None);
    }

    // --- resolve ---

    #[test]
    fn test_resolve_nested_arguments_first() {
        let resolver = ConfigResolver::default();
        let value = ConfigValue::call(
            "eq",
            vec![ConfigValue::ctx("options.role"), ConfigValue::literal("admin")],
        );
        assert_eq!(resolver.resolve(&value, &ctx()).unwrap(), json!(true));
    }

    #[test]
    fn test_literal_resolution_is_repeatable() {
        let resolver = ConfigResolver::default();
        let value = ConfigValue::from_value(json!({"published": true, "tags": ["a", "b"], "limit": 5}));
        let first = resolver.resolve(&value, &ctx()).unwrap();
        let second = resolver.resolve(&value, &ctx().with_extra("value", json!("other"))).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, json!({"published": true, "tags": ["a", "b"], "limit": 5}));
        assert!(matches!(value, ConfigValue::Literal(_)));
    }

    #[test]
    fn test_resolve_map_with_expression() {
        let resolver = ConfigResolver::default();
        let value = ConfigValue::from_value(json!({
            "owner": {"$call": "ctx", "args": ["params.userId"]},
            "fixed": 1
        }));
        assert_eq!(
            resolver.resolve(&value, &ctx()).unwrap(),
            json!({"owner": 7, "fixed": 1})
        );
    }

    #[test]
    fn test_unknown_callable_is_an_error() {
        let resolver = ConfigResolver::default();
        let err = resolver
            .resolve(&ConfigValue::call("system", vec![]), &ctx())
            .unwrap_err();
        assert!(err.to_string().contains("Unknown callable 'system'"));
    }

    #[test]
    fn test_callable_failure_is_wrapped() {
        let mut registry = ExpressionRegistry::with_builtins();
        registry.register("boom", |_, _| Err(anyhow!("exploded")));
        let resolver = ConfigResolver::new(Arc::new(registry));
        let err = resolver
            .resolve(&ConfigValue::call("boom", vec![]), &ctx())
            .unwrap_err();
        assert_eq!(err.to_string(), "Callable 'boom' failed: exploded");
    }

    #[test]
    fn test_filters_as_callables() {
        let resolver = ConfigResolver::default();
        let value = ConfigValue::call(
            "uppercase",
            vec![ConfigValue::call("trim", vec![ConfigValue::ctx("params.name")])],
        );
        assert_eq!(resolver.resolve(&value, &ctx()).unwrap(), json!("BOB"));
    }

    // --- typed helpers ---

    #[test]
    fn test_resolve_bool_type_mismatch() {
        let resolver = ConfigResolver::default();
        let value = ConfigValue::literal("yes");
        let err = resolver
            .resolve_bool(Some(&value), &ctx(), "allowed")
            .unwrap_err();
        assert!(err.to_string().contains("Expected a boolean for 'allowed'"));
    }

    #[test]
    fn test_find_setting_first_non_null_wins() {
        let resolver = ConfigResolver::default();
        let overrides = ConfigValue::literal(Value::Null);
        let options = ConfigValue::literal(50);
        let defaults = ConfigValue::literal(25);
        let found = resolver
            .find_setting(&[Some(&overrides), None, Some(&options), Some(&defaults)], &ctx())
            .unwrap();
        assert_eq!(found, Some(json!(50)));
    }
}
