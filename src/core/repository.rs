//! Repository facade
//!
//! A [`RepositoryRegistry`] owns the shared collaborators (configuration,
//! expression registry, persistence, validator, event bus) and hands out a
//! [`Repository`] per entity type. Repositories are cheap views; the
//! registry is `Send + Sync` and is meant to be shared behind an `Arc`.
//!
//! # Example
//!
//! ```ignore
//! let registry = RepositoryRegistry::builder()
//!     .with_config(GatewayConfig::from_yaml_file("gateway.yaml")?)
//!     .with_persistence(InMemoryPersistence::new())
//!     .build()?;
//!
//! let outcome = registry
//!     .repository("album")?
//!     .read(json!({}), front_end, CallOptions::new())?;
//! ```

use crate::config::{CallOptions, EntityConfig, GatewayConfig, MutationConfig};
use crate::core::binder::{
    AssociationBinder, ChainType, MutationEntry, MutationRequest, MutationScope,
    entries_from_params, nested_overrides,
};
use crate::core::error::{
    ConfigError, GateError, GateResult, LimitError, PermissionError, RequestError,
};
use crate::core::events::{EventBus, LifecycleEvent};
use crate::core::filter::{Expr, Operand, Operator};
use crate::core::permission::PermissionNode;
use crate::core::query::{
    FrontEndOptions, PaginationMeta, QueryCompiler, QuerySpec, ReadPhase, ReadRequest, enter_phase,
};
use crate::core::resolver::{ConfigResolver, ExpressionRegistry, ResolveContext};
use crate::core::store::{EntityRecord, Persistence};
use crate::core::validation::{RuleValidator, Validator};
use crate::core::value::ConfigValue;
use crate::core::wire;
use axum::Json;
use axum::response::{IntoResponse, Response};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// Registry
// =============================================================================

/// Builder for a [`RepositoryRegistry`]
///
/// Only the persistence collaborator is required.
pub struct RegistryBuilder {
    config: GatewayConfig,
    expressions: ExpressionRegistry,
    persistence: Option<Arc<dyn Persistence>>,
    validator: Option<Arc<dyn Validator>>,
    events: Option<EventBus>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            expressions: ExpressionRegistry::with_builtins(),
            persistence: None,
            validator: None,
            events: None,
        }
    }

    /// Add entity configurations; later entities replace earlier ones
    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config.merge(config);
        self
    }

    pub fn with_persistence(mut self, persistence: impl Persistence + 'static) -> Self {
        self.persistence = Some(Arc::new(persistence));
        self
    }

    /// Share an already wrapped persistence backend
    pub fn with_shared_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a callable usable from `$call` expressions
    pub fn register_callable<F>(mut self, name: &str, callable: F) -> Self
    where
        F: Fn(&[Value], &ResolveContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.expressions.register(name, callable);
        self
    }

    pub fn build(self) -> GateResult<RepositoryRegistry> {
        let persistence = self.persistence.ok_or_else(|| ConfigError::MissingCollaborator {
            collaborator: "persistence".to_string(),
        })?;

        info!(
            entities = self.config.entities.len(),
            "repository registry built"
        );
        Ok(RepositoryRegistry {
            config: Arc::new(self.config),
            resolver: ConfigResolver::new(Arc::new(self.expressions)),
            persistence,
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(RuleValidator::new())),
            events: self.events.unwrap_or_default(),
        })
    }
}

/// Shared collaborators for every repository
#[derive(Clone)]
pub struct RepositoryRegistry {
    config: Arc<GatewayConfig>,
    resolver: ConfigResolver,
    persistence: Arc<dyn Persistence>,
    validator: Arc<dyn Validator>,
    events: EventBus,
}

impl fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryRegistry")
            .field("entities", &self.config.entities.keys().collect::<Vec<_>>())
            .field("events", &self.events)
            .finish()
    }
}

impl RepositoryRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Repository for one configured entity type
    pub fn repository(&self, entity_type: &str) -> GateResult<Repository<'_>> {
        let config = self.config.entity(entity_type)?;
        Ok(Repository {
            registry: self,
            entity_type: entity_type.to_string(),
            config,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn persistence(&self) -> &dyn Persistence {
        self.persistence.as_ref()
    }

    pub fn validator(&self) -> &dyn Validator {
        self.validator.as_ref()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

// =============================================================================
// Read outcome
// =============================================================================

/// Result of [`Repository::read`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ReadOutcome {
    /// `hydrate` was off; the verified query is returned for composition
    Query { query: QuerySpec },
    Rows { rows: Vec<Value> },
    Page {
        count: Option<u64>,
        rows: Vec<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pagination: Option<PaginationMeta>,
    },
}

impl ReadOutcome {
    /// Rows of an executed read
    pub fn rows(&self) -> &[Value] {
        match self {
            ReadOutcome::Query { .. } => &[],
            ReadOutcome::Rows { rows } | ReadOutcome::Page { rows, .. } => rows,
        }
    }

    pub fn query(&self) -> Option<&QuerySpec> {
        match self {
            ReadOutcome::Query { query } => Some(query),
            _ => None,
        }
    }
}

impl IntoResponse for ReadOutcome {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Permission-gated entry point for one entity type
pub struct Repository<'r> {
    registry: &'r RepositoryRegistry,
    entity_type: String,
    config: &'r EntityConfig,
}

impl<'r> Repository<'r> {
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn config(&self) -> &EntityConfig {
        self.config
    }

    fn options_value(options: &IndexMap<String, ConfigValue>) -> Value {
        serde_json::to_value(options).unwrap_or(Value::Null)
    }

    /// Compile and, unless `hydrate` is off, execute a read
    pub fn read(
        &self,
        params: Value,
        front_end: FrontEndOptions,
        overrides: CallOptions,
    ) -> GateResult<ReadOutcome> {
        enter_phase(&self.entity_type, ReadPhase::Idle);
        let result = self.read_inner(params, &front_end, &overrides);
        match &result {
            Ok(_) => enter_phase(&self.entity_type, ReadPhase::Done),
            Err(e) => {
                enter_phase(&self.entity_type, ReadPhase::Failed);
                warn!(entity_type = %self.entity_type, error = %e, "read failed");
            }
        }
        result
    }

    fn read_inner(
        &self,
        params: Value,
        front_end: &FrontEndOptions,
        overrides: &CallOptions,
    ) -> GateResult<ReadOutcome> {
        let resolver = self.registry.resolver();
        let ctx = ResolveContext::new(
            params,
            Self::options_value(&self.config.read.options),
            overrides.to_value(),
            front_end.to_value(),
        );
        let request = ReadRequest {
            entity_type: &self.entity_type,
            config: self.config,
            front_end,
            overrides,
            ctx: &ctx,
        };

        let permissions = request.effective_permissions();
        let allowed = resolver
            .resolve_bool(permissions.allowed.as_ref(), &ctx, "read.permissions.allowed")?
            .unwrap_or(true);
        if !allowed {
            return Err(self.action_denied("read"));
        }

        let spec = QueryCompiler::new(resolver).compile(&request)?;
        if !spec.shaping.hydrate {
            enter_phase(&self.entity_type, ReadPhase::ReturnUnexecuted);
            return Ok(ReadOutcome::Query { query: spec });
        }

        enter_phase(&self.entity_type, ReadPhase::Executing);
        let persistence = self.registry.persistence();
        let (count, rows) = if spec.shaping.paginate {
            let page = persistence
                .execute_paginated(&spec, spec.shaping.fetch_join, spec.shaping.return_count)
                .map_err(GateError::execution)?;
            (Some(page.count), page.rows)
        } else {
            (None, persistence.execute(&spec).map_err(GateError::execution)?)
        };

        let rows = self.to_array(rows)?;
        debug!(entity_type = %self.entity_type, rows = rows.len(), "read executed");

        Ok(match count {
            Some(count) => ReadOutcome::Page {
                pagination: count.map(|total| PaginationMeta::new(spec.offset, spec.limit, total)),
                count,
                rows,
            },
            None => ReadOutcome::Rows { rows },
        })
    }

    /// Run the to-array events over result rows
    fn to_array(&self, rows: Vec<Value>) -> GateResult<Vec<Value>> {
        let events = self.registry.events();
        let rows = match events.publish(LifecycleEvent::BeforeToArray, &self.entity_type, Value::Array(rows))? {
            Value::Array(rows) => rows,
            other => vec![other],
        };
        match events.publish(LifecycleEvent::AfterToArray, &self.entity_type, Value::Array(rows))? {
            Value::Array(rows) => Ok(rows),
            other => Ok(vec![other]),
        }
    }

    pub fn create(
        &self,
        params: Value,
        overrides: CallOptions,
        front_end: FrontEndOptions,
    ) -> GateResult<Vec<EntityRecord>> {
        self.mutate(ChainType::Create, params, &overrides, &front_end)
    }

    pub fn update(
        &self,
        params: Value,
        overrides: CallOptions,
        front_end: FrontEndOptions,
    ) -> GateResult<Vec<EntityRecord>> {
        self.mutate(ChainType::Update, params, &overrides, &front_end)
    }

    pub fn delete(
        &self,
        params: Value,
        overrides: CallOptions,
        front_end: FrontEndOptions,
    ) -> GateResult<Vec<EntityRecord>> {
        self.mutate(ChainType::Delete, params, &overrides, &front_end)
    }

    /// Fetch rows whose `field` (a column of this entity) is one of `ids`
    ///
    /// No permission is evaluated; this is a back-end helper.
    pub fn find_in(&self, field: &str, ids: &[Value]) -> GateResult<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let persistence = self.registry.persistence();
        if field == "id" {
            return persistence
                .find_in(&self.entity_type, ids)
                .map_err(GateError::execution);
        }

        let mut spec = QuerySpec::new(&self.entity_type);
        spec.select.push(self.config.alias.clone());
        spec.from.push(crate::core::query::FromClause {
            entity: self.entity_type.clone(),
            alias: self.config.alias.clone(),
            index_by: None,
        });
        spec.set_parameter("ids", Value::Array(ids.to_vec()), None);
        spec.and_where(Expr::Predicate {
            field: format!("{}.{}", self.config.alias, field),
            operator: Operator::In,
            arguments: vec![Operand::Param("ids".to_string())],
        });
        spec.limit = u64::MAX;
        persistence.execute(&spec).map_err(GateError::execution)
    }

    fn mutation_config(&self, chain: ChainType) -> GateResult<&'r MutationConfig> {
        self.config.mutation(chain.as_str()).ok_or_else(|| {
            RequestError::InvalidParams {
                message: format!("'{}' is not a mutation", chain),
            }
            .into()
        })
    }

    fn action_denied(&self, action: &str) -> GateError {
        warn!(entity_type = %self.entity_type, action, "action denied");
        PermissionError::ActionNotAllowed {
            entity_type: self.entity_type.clone(),
            action: action.to_string(),
        }
        .into()
    }

    /// An explicit override wins even when null, which lifts the limit
    fn batch_max(
        &self,
        config: &MutationConfig,
        overrides: &CallOptions,
        ctx: &ResolveContext,
    ) -> GateResult<Option<u64>> {
        let value = match overrides.get("batchMax") {
            Some(value) => Some(value),
            None => config.options.get("batchMax"),
        };
        self.registry.resolver().resolve_u64(value, ctx, "batchMax")
    }

    fn mutation_context(
        &self,
        config: &MutationConfig,
        params: &Value,
        overrides: &CallOptions,
        front_end: &FrontEndOptions,
    ) -> ResolveContext {
        ResolveContext::new(
            params.clone(),
            Self::options_value(&config.options),
            overrides.to_value(),
            front_end.to_value(),
        )
    }

    fn check_batch(
        &self,
        config: &MutationConfig,
        size: usize,
        overrides: &CallOptions,
        ctx: &ResolveContext,
    ) -> GateResult<()> {
        if let Some(batch_max) = self.batch_max(config, overrides, ctx)? {
            if size as u64 > batch_max {
                warn!(entity_type = %self.entity_type, size, batch_max, "batch too large");
                return Err(LimitError::BatchTooLarge { size, batch_max }.into());
            }
        }
        Ok(())
    }

    /// Action node with call-time permission overrides merged in
    fn mutation_node(config: &MutationConfig, overrides: &CallOptions) -> PermissionNode {
        let mut node = config.permissions.clone();
        if let Some(extra) = &overrides.mutation_permissions {
            node.merge(extra);
        }
        node
    }

    fn check_allowed(&self, chain: ChainType, node: &PermissionNode, ctx: &ResolveContext) -> GateResult<()> {
        let allowed = self
            .registry
            .resolver()
            .resolve_bool(node.allowed.as_ref(), ctx, "allowed")?
            .unwrap_or(true);
        if allowed {
            Ok(())
        } else {
            Err(self.action_denied(chain.as_str()))
        }
    }

    /// A read chain only loads an entity, gated by the read action
    fn check_read_chain(&self, params: Value, front_end: &FrontEndOptions) -> GateResult<()> {
        let ctx = ResolveContext::new(
            params,
            Self::options_value(&self.config.read.options),
            Value::Null,
            front_end.to_value(),
        );
        let allowed = self
            .registry
            .resolver()
            .resolve_bool(self.config.read.permissions.allowed.as_ref(), &ctx, "read.permissions.allowed")?
            .unwrap_or(true);
        if allowed {
            Ok(())
        } else {
            Err(self.action_denied("read"))
        }
    }

    /// Check a batch and its nested chains before anything is written
    pub(crate) fn verify(
        &self,
        chain: ChainType,
        params: &Value,
        entries: &[MutationEntry],
        overrides: &CallOptions,
        front_end: &FrontEndOptions,
    ) -> GateResult<()> {
        if chain == ChainType::Read {
            if entries.iter().any(|entry| entry.id.is_none()) {
                return Err(RequestError::InvalidParams {
                    message: format!("read on '{}' needs an id", self.entity_type),
                }
                .into());
            }
            return self.check_read_chain(params.clone(), front_end);
        }

        let config = self.mutation_config(chain)?;
        let node = Self::mutation_node(config, overrides);
        let ctx = self.mutation_context(config, params, overrides, front_end);
        self.check_allowed(chain, &node, &ctx)?;
        self.check_batch(config, entries.len(), overrides, &ctx)?;

        let request = MutationRequest {
            entity_type: &self.entity_type,
            chain,
            node: &node,
            front_end,
            ctx: &ctx,
        };
        AssociationBinder::new(self.registry).verify(&request, entries)
    }

    /// Top-level mutation: normalization, verification, transaction
    fn mutate(
        &self,
        chain: ChainType,
        params: Value,
        overrides: &CallOptions,
        front_end: &FrontEndOptions,
    ) -> GateResult<Vec<EntityRecord>> {
        let params = if front_end.simplified() {
            wire::normalize_simplified(self.registry.persistence(), &self.entity_type, chain, params)?
        } else {
            params
        };
        let entries = entries_from_params(chain, &params)?;
        let config = self.mutation_config(chain)?;
        let ctx = self.mutation_context(config, &params, overrides, front_end);
        self.verify(chain, &params, &entries, overrides, front_end)?;

        let resolver = self.registry.resolver();
        let setting = |key: &str| [overrides.get(key), config.options.get(key)];
        let transaction = resolver
            .find_bool(&setting("transaction"), &ctx, "transaction")?
            .unwrap_or(true);
        let flush = resolver
            .find_bool(&setting("flush"), &ctx, "flush")?
            .unwrap_or(true);

        info!(
            entity_type = %self.entity_type,
            action = chain.as_str(),
            entries = entries.len(),
            transaction,
            "mutation started"
        );

        let persistence = self.registry.persistence();
        if transaction {
            persistence.begin().map_err(GateError::execution)?;
        }

        let mut scope = MutationScope::new();
        let result = self
            .run_mutation(chain, &params, entries, overrides, front_end, &mut scope)
            .and_then(|records| {
                if flush {
                    persistence.flush().map_err(GateError::execution)?;
                }
                Ok(records)
            });

        match result {
            Ok(records) => {
                if transaction {
                    persistence.commit().map_err(GateError::execution)?;
                }
                let rows = records.iter().map(EntityRecord::to_row).collect();
                self.to_array(rows)?;
                Ok(records)
            }
            Err(e) => {
                if transaction {
                    if let Err(rollback) = persistence.rollback() {
                        error!(entity_type = %self.entity_type, error = %rollback, "rollback failed");
                    }
                }
                warn!(entity_type = %self.entity_type, action = chain.as_str(), error = %e, "mutation failed");
                Err(e)
            }
        }
    }

    /// Bind and persist a batch without transaction handling
    fn run_mutation(
        &self,
        chain: ChainType,
        params: &Value,
        entries: Vec<MutationEntry>,
        overrides: &CallOptions,
        front_end: &FrontEndOptions,
        scope: &mut MutationScope,
    ) -> GateResult<Vec<EntityRecord>> {
        let config = self.mutation_config(chain)?;
        let node = Self::mutation_node(config, overrides);
        let ctx = self.mutation_context(config, params, overrides, front_end);
        let resolver = self.registry.resolver();

        self.check_allowed(chain, &node, &ctx)?;
        self.check_batch(config, entries.len(), overrides, &ctx)?;

        let binder = AssociationBinder::new(self.registry);
        let prepopulate = resolver
            .find_bool(
                &[
                    overrides.get("prePopulateEntities"),
                    config.options.get("prePopulateEntities"),
                ],
                &ctx,
                "prePopulateEntities",
            )?
            .unwrap_or(true);
        if prepopulate {
            binder.prepopulate(&self.entity_type, chain, &entries, scope)?;
        }

        let request = MutationRequest {
            entity_type: &self.entity_type,
            chain,
            node: &node,
            front_end,
            ctx: &ctx,
        };
        entries
            .into_iter()
            .map(|entry| binder.bind_entity(&request, entry, scope))
            .collect()
    }

    /// Execute one chain entry on behalf of a parent entity
    pub(crate) fn run_chain(
        &self,
        chain: ChainType,
        entry: MutationEntry,
        front_end: &FrontEndOptions,
        scope: &mut MutationScope,
    ) -> GateResult<EntityRecord> {
        let params = Value::Object(entry.fields.clone());

        if chain == ChainType::Read {
            self.check_read_chain(params, front_end)?;
            let id = entry.id.ok_or_else(|| RequestError::InvalidParams {
                message: format!("read on '{}' needs an id", self.entity_type),
            })?;
            let row = AssociationBinder::new(self.registry).load_existing(&self.entity_type, &id, scope)?;
            let mut record = EntityRecord::from_row(&self.entity_type, &row);
            record.fields.remove("id");
            return Ok(record);
        }

        let overrides = nested_overrides();
        self.run_mutation(chain, &params, vec![entry], &overrides, front_end, scope)?
            .pop()
            .ok_or_else(|| {
                RequestError::InvalidParams {
                    message: format!("{} on '{}' produced no record", chain, self.entity_type),
                }
                .into()
            })
    }
}
