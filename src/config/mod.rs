//! Configuration loading and management
//!
//! A [`GatewayConfig`] holds one [`EntityConfig`] per entity type. Each
//! entity config is keyed by action (`read`, `create`, `update`, `delete`)
//! and declares the base query, caching and placeholder settings, and the
//! permission tree that gates front-end input.
//!
//! ```yaml
//! entities:
//!   album:
//!     read:
//!       query:
//!         where:
//!           published:
//!             value: { expr: eq, arguments: [t.published, ":published"] }
//!       settings:
//!         placeholders:
//!           published: { value: true }
//!       permissions:
//!         maxLimit: 50
//!         where:
//!           permissive: false
//!           fields:
//!             t.name:
//!               operators: { eq: true, like: true }
//!     create:
//!       permissive: true
//! ```

use crate::core::error::ConfigError;
use crate::core::filter::ConditionType;
use crate::core::permission::PermissionNode;
use crate::core::value::ConfigValue;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

/// Complete configuration for every exposed entity type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub entities: IndexMap<String, EntityConfig>,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Merge another configuration into this one
    ///
    /// Entity types present in `other` replace the ones defined here.
    pub fn merge(&mut self, other: GatewayConfig) {
        for (name, entity) in other.entities {
            self.entities.insert(name, entity);
        }
    }

    /// Add or replace one entity configuration
    pub fn with_entity(mut self, entity_type: &str, config: EntityConfig) -> Self {
        self.entities.insert(entity_type.to_string(), config);
        self
    }

    pub fn entity(&self, entity_type: &str) -> Result<&EntityConfig, ConfigError> {
        self.entities
            .get(entity_type)
            .ok_or_else(|| ConfigError::UnknownEntityType {
                entity_type: entity_type.to_string(),
            })
    }
}

fn default_alias() -> String {
    "t".to_string()
}

/// Configuration for one entity type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityConfig {
    /// Alias of the root entity in generated queries
    #[serde(default = "default_alias")]
    pub alias: String,

    #[serde(default)]
    pub read: ReadConfig,

    #[serde(default)]
    pub create: MutationConfig,

    #[serde(default)]
    pub update: MutationConfig,

    #[serde(default)]
    pub delete: MutationConfig,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            alias: default_alias(),
            read: ReadConfig::default(),
            create: MutationConfig::default(),
            update: MutationConfig::default(),
            delete: MutationConfig::default(),
        }
    }
}

impl EntityConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Configuration of a mutation action
    pub fn mutation(&self, action: &str) -> Option<&MutationConfig> {
        match action {
            "create" => Some(&self.create),
            "update" => Some(&self.update),
            "delete" => Some(&self.delete),
            _ => None,
        }
    }
}

// =============================================================================
// Read configuration
// =============================================================================

/// The `read` action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadConfig {
    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub settings: ReadSettings,

    #[serde(default)]
    pub permissions: ReadPermissions,

    /// Entity-level defaults for call options (`paginate`, `hydrate`, ...)
    #[serde(default)]
    pub options: IndexMap<String, ConfigValue>,
}

/// Base query parts, always applied before any front-end input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryConfig {
    #[serde(default)]
    pub select: IndexMap<String, ConfigValue>,

    /// Generated from the entity type and alias when empty
    #[serde(default)]
    pub from: IndexMap<String, FromConfig>,

    #[serde(default)]
    pub joins: IndexMap<String, JoinConfig>,

    #[serde(default, rename = "where")]
    pub where_clause: IndexMap<String, ConditionConfig>,

    #[serde(default)]
    pub having: IndexMap<String, ConditionConfig>,

    #[serde(default)]
    pub order_by: IndexMap<String, OrderConfig>,

    #[serde(default)]
    pub group_by: IndexMap<String, ConfigValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromConfig {
    pub entity: ConfigValue,
    pub alias: ConfigValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_by: Option<ConfigValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    #[default]
    Left,
    Inner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfig {
    /// Association path, e.g. `t.albums`
    pub target: ConfigValue,
    pub join_alias: ConfigValue,
    #[serde(default)]
    pub kind: JoinKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_type: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_by: Option<ConfigValue>,
}

/// A base `where` or `having` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(default, rename = "type")]
    pub condition_type: ConditionType,
    pub value: QueryPart,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfig {
    pub sort: ConfigValue,
    #[serde(default = "default_order")]
    pub order: ConfigValue,
}

fn default_order() -> ConfigValue {
    ConfigValue::literal("ASC")
}

/// Part of a trusted base query
///
/// Either a plain (possibly dynamic) value, or `{expr, arguments}` naming a
/// whitelisted operator whose arguments are query parts themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPart {
    Value(ConfigValue),
    Expression {
        expr: String,
        arguments: Vec<QueryPart>,
    },
}

impl QueryPart {
    fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut map) if map.contains_key("expr") => {
                let expr = match map.remove("expr") {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let arguments = match map.remove("arguments") {
                    Some(Value::Array(items)) => items.into_iter().map(Self::from_value).collect(),
                    Some(Value::Null) | None => Vec::new(),
                    Some(single) => vec![Self::from_value(single)],
                };
                QueryPart::Expression { expr, arguments }
            }
            other => QueryPart::Value(ConfigValue::from_value(other)),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            QueryPart::Value(v) => v.clone().into_value(),
            QueryPart::Expression { expr, arguments } => json!({
                "expr": expr,
                "arguments": arguments.iter().map(QueryPart::to_value).collect::<Vec<_>>(),
            }),
        }
    }
}

impl<'de> Deserialize<'de> for QueryPart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_value(Value::deserialize(deserializer)?))
    }
}

impl Serialize for QueryPart {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// `read.settings`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadSettings {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub placeholders: IndexMap<String, PlaceholderConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_join: Option<ConfigValue>,
}

/// `read.settings.cache`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_query_cache: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_result_cache: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_id: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_cache_driver: Option<ConfigValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_cache_driver: Option<ConfigValue>,
}

impl CacheConfig {
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        match key {
            "useQueryCache" => self.use_query_cache.as_ref(),
            "useResultCache" => self.use_result_cache.as_ref(),
            "timeToLive" => self.time_to_live.as_ref(),
            "cacheId" => self.cache_id.as_ref(),
            "queryCacheDriver" => self.query_cache_driver.as_ref(),
            "resultCacheDriver" => self.result_cache_driver.as_ref(),
            _ => None,
        }
    }
}

/// A named query parameter supplied by configuration or call options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderConfig {
    #[serde(default)]
    pub value: ConfigValue,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub param_type: Option<ConfigValue>,
}

impl PlaceholderConfig {
    pub fn new(value: impl Into<ConfigValue>) -> Self {
        Self {
            value: value.into(),
            param_type: None,
        }
    }
}

/// `read.permissions`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPermissions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<ConfigValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_limit: Option<ConfigValue>,

    #[serde(default, rename = "where")]
    pub where_clause: PermissionNode,

    #[serde(default)]
    pub having: PermissionNode,

    #[serde(default)]
    pub order_by: PermissionNode,

    #[serde(default)]
    pub group_by: PermissionNode,

    #[serde(default)]
    pub placeholders: PermissionNode,
}

impl ReadPermissions {
    /// Merge call-time overrides; flags set in `other` win, maps union
    pub fn merge(&mut self, other: &ReadPermissions) {
        if other.allowed.is_some() {
            self.allowed = other.allowed.clone();
        }
        if other.max_limit.is_some() {
            self.max_limit = other.max_limit.clone();
        }
        self.where_clause.merge(&other.where_clause);
        self.having.merge(&other.having);
        self.order_by.merge(&other.order_by);
        self.group_by.merge(&other.group_by);
        self.placeholders.merge(&other.placeholders);
    }
}

// =============================================================================
// Mutation configuration
// =============================================================================

/// The `create`, `update` and `delete` actions
///
/// The action node is the aggregate permission layer of its fields:
/// `allowed` gates the action, `permissive` is the fallback for fields
/// without an explicit answer, `settings` holds entity-level hooks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationConfig {
    #[serde(flatten)]
    pub permissions: PermissionNode,

    /// Entity-level defaults for call options (`transaction`, `batchMax`, ...)
    #[serde(default)]
    pub options: IndexMap<String, ConfigValue>,
}

// =============================================================================
// Call options
// =============================================================================

/// Back-end options and overrides supplied per call
///
/// Scalar settings (`limit`, `paginate`, `transaction`, ...) replace lower
/// layers. Permission trees merge into the configured ones instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<ReadPermissions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_permissions: Option<PermissionNode>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub placeholders: IndexMap<String, PlaceholderConfig>,

    #[serde(flatten)]
    pub settings: IndexMap<String, ConfigValue>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one scalar option
    pub fn with(mut self, key: &str, value: impl Into<ConfigValue>) -> Self {
        self.settings.insert(key.to_string(), value.into());
        self
    }

    pub fn with_permissions(mut self, permissions: ReadPermissions) -> Self {
        self.permissions = Some(permissions);
        self
    }

    pub fn with_mutation_permissions(mut self, permissions: PermissionNode) -> Self {
        self.mutation_permissions = Some(permissions);
        self
    }

    pub fn with_placeholder(mut self, name: &str, placeholder: PlaceholderConfig) -> Self {
        self.placeholders.insert(name.to_string(), placeholder);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.settings.get(key)
    }

    /// Raw JSON view, as exposed to expressions through `options.*`
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
