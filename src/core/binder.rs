//! Association binding for mutations
//!
//! The [`AssociationBinder`] turns one entry of a mutation batch into an
//! [`EntityRecord`]. Scalar fields go through the field pipeline
//! (permission → mutate → closure → enforce → setTo). Relation fields carry
//! a chain request:
//!
//! ```json
//! {
//!   "artist": { "read": { "a1": { "assignType": "set" } } },
//!   "tracks": {
//!     "create": [ { "title": "Intro" } ],
//!     "update": { "t9": { "title": "Outro", "assignType": "addSingle" } }
//!   }
//! }
//! ```
//!
//! Every chain entry is executed by the target entity's repository with a
//! fresh context and the result is attached to the parent through an
//! [`AssociationChange`].

use crate::config::CallOptions;
use crate::core::error::{
    EnforcementError, GateError, GateResult, PermissionError, RequestError, ValidationError,
};
use crate::core::events::LifecycleEvent;
use crate::core::permission::{Bucket, PermissionEvaluator, PermissionLayer, PermissionNode};
use crate::core::query::FrontEndOptions;
use crate::core::repository::RepositoryRegistry;
use crate::core::resolver::ResolveContext;
use crate::core::store::{Association, EntityRecord};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Keys of a chain entry that are directives rather than field values
pub const IGNORE_KEYS: [&str; 2] = ["assignType", "chainType"];

/// What a chain entry does with the related entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Create,
    Read,
    Update,
    Delete,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainType::Create => "create",
            ChainType::Read => "read",
            ChainType::Update => "update",
            ChainType::Delete => "delete",
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainType {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChainType::Create),
            "read" => Ok(ChainType::Read),
            "update" => Ok(ChainType::Update),
            "delete" => Ok(ChainType::Delete),
            other => Err(RequestError::UnknownChainType {
                chain_type: other.to_string(),
            }),
        }
    }
}

/// How a related entity is attached to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssignType {
    #[serde(rename = "set")]
    Set,
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "remove")]
    Remove,
    #[serde(rename = "setSingle")]
    SetSingle,
    #[serde(rename = "addSingle")]
    AddSingle,
    #[serde(rename = "removeSingle")]
    RemoveSingle,
    #[serde(rename = "setNull")]
    SetNull,
    /// Run the chain without attaching its entity to the parent
    #[serde(rename = "null")]
    Null,
}

impl AssignType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignType::Set => "set",
            AssignType::Add => "add",
            AssignType::Remove => "remove",
            AssignType::SetSingle => "setSingle",
            AssignType::AddSingle => "addSingle",
            AssignType::RemoveSingle => "removeSingle",
            AssignType::SetNull => "setNull",
            AssignType::Null => "null",
        }
    }

    /// `*Single` variants address one element through the singular mutator
    pub fn is_single(&self) -> bool {
        matches!(
            self,
            AssignType::SetSingle | AssignType::AddSingle | AssignType::RemoveSingle
        )
    }

    fn verb(&self) -> &'static str {
        match self {
            AssignType::Set | AssignType::SetSingle | AssignType::SetNull | AssignType::Null => "set",
            AssignType::Add | AssignType::AddSingle => "add",
            AssignType::Remove | AssignType::RemoveSingle => "remove",
        }
    }

    /// Name of the mutator applying this assignment, e.g. `addTrack`
    pub fn mutator(&self, relation: &str) -> String {
        let name = if self.is_single() {
            relation.strip_suffix('s').unwrap_or(relation)
        } else {
            relation
        };
        let mut chars = name.chars();
        let capitalized: String = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        };
        format!("{}{}", self.verb(), capitalized)
    }

    /// Whether the assignment produces a relation change on the parent
    pub fn attaches(&self) -> bool {
        !matches!(self, AssignType::Null)
    }

    /// Assignment used when a chain entry does not name one
    pub fn default_for(chain: ChainType, to_many: bool) -> Option<AssignType> {
        match chain {
            ChainType::Delete => None,
            _ if to_many => Some(AssignType::AddSingle),
            _ => Some(AssignType::Set),
        }
    }
}

impl fmt::Display for AssignType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignType {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "set" => Ok(AssignType::Set),
            "add" => Ok(AssignType::Add),
            "remove" => Ok(AssignType::Remove),
            "setSingle" => Ok(AssignType::SetSingle),
            "addSingle" => Ok(AssignType::AddSingle),
            "removeSingle" => Ok(AssignType::RemoveSingle),
            "setNull" => Ok(AssignType::SetNull),
            "null" => Ok(AssignType::Null),
            other => Err(RequestError::UnknownAssignType {
                assign_type: other.to_string(),
            }),
        }
    }
}

/// A relation update to apply together with the parent write
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssociationChange {
    pub relation: String,
    pub mutator: String,
    pub assign: AssignType,
    /// Id of the related entity, `None` for [`AssignType::SetNull`]
    pub target: Option<Value>,
}

impl AssociationChange {
    pub fn new(relation: &str, assign: AssignType, target: Option<Value>) -> Self {
        Self {
            relation: relation.to_string(),
            mutator: assign.mutator(relation),
            assign,
            target,
        }
    }
}

/// One entity of a mutation batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationEntry {
    pub id: Option<Value>,
    pub fields: Map<String, Value>,
}

/// Canonical key of an id, shared by caches and backends
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Split mutation params into entries
///
/// `create` takes a list of field maps (or a single map). `read`, `update`
/// and `delete` take a map of id → field map; a list of bare ids or of maps
/// carrying an `id` is accepted as well.
pub fn entries_from_params(chain: ChainType, params: &Value) -> GateResult<Vec<MutationEntry>> {
    let invalid = |message: String| -> GateError { RequestError::InvalidParams { message }.into() };

    match (chain, params) {
        (_, Value::Null) => Ok(Vec::new()),
        (ChainType::Create, Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Object(fields) => Ok(MutationEntry {
                    id: None,
                    fields: fields.clone(),
                }),
                other => Err(invalid(format!("create entries must be objects, got {}", other))),
            })
            .collect(),
        (ChainType::Create, Value::Object(fields)) => Ok(vec![MutationEntry {
            id: None,
            fields: fields.clone(),
        }]),
        (_, Value::Object(map)) => map
            .iter()
            .map(|(id, fields)| match fields {
                Value::Object(fields) => Ok(MutationEntry {
                    id: Some(Value::String(id.clone())),
                    fields: fields.clone(),
                }),
                Value::Null => Ok(MutationEntry {
                    id: Some(Value::String(id.clone())),
                    fields: Map::new(),
                }),
                other => Err(invalid(format!("entry '{}' must be an object, got {}", id, other))),
            })
            .collect(),
        (_, Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Object(fields) => {
                    let mut fields = fields.clone();
                    let id = fields
                        .remove("id")
                        .filter(|id| !id.is_null())
                        .ok_or_else(|| invalid(format!("{} entries need an id", chain)))?;
                    Ok(MutationEntry {
                        id: Some(id),
                        fields,
                    })
                }
                Value::String(_) | Value::Number(_) => Ok(MutationEntry {
                    id: Some(item.clone()),
                    fields: Map::new(),
                }),
                other => Err(invalid(format!("invalid {} entry {}", chain, other))),
            })
            .collect(),
        (_, other) => Err(invalid(format!("unexpected {} params {}", chain, other))),
    }
}

/// A bare id on a relation is shorthand for reading and setting that entity
pub fn fix_scalar_association_value(value: Value) -> Value {
    match value {
        Value::String(_) | Value::Number(_) => {
            json!({ "read": { id_key(&value): { "assignType": "set" } } })
        }
        other => other,
    }
}

/// Call-local state shared by a top-level mutation and its nested chains
#[derive(Debug, Default)]
pub struct MutationScope {
    prefetched: HashMap<String, HashMap<String, Value>>,
}

impl MutationScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, entity_type: &str, id: &Value) -> Option<&Value> {
        self.prefetched.get(entity_type)?.get(&id_key(id))
    }

    pub fn store(&mut self, entity_type: &str, row: Value) {
        if let Some(id) = row.get("id").map(id_key) {
            self.prefetched
                .entry(entity_type.to_string())
                .or_default()
                .insert(id, row);
        }
    }

    pub fn forget(&mut self, entity_type: &str, id: &Value) {
        if let Some(rows) = self.prefetched.get_mut(entity_type) {
            rows.remove(&id_key(id));
        }
    }

    /// Number of cached entities of a type
    pub fn cached_count(&self, entity_type: &str) -> usize {
        self.prefetched.get(entity_type).map_or(0, HashMap::len)
    }
}

/// Everything binding one batch needs
pub struct MutationRequest<'a> {
    pub entity_type: &'a str,
    pub chain: ChainType,
    /// Action node with call-time permission overrides merged in
    pub node: &'a PermissionNode,
    pub front_end: &'a FrontEndOptions,
    pub ctx: &'a ResolveContext,
}

/// Binds mutation entries to records, recursing through chains
#[derive(Clone, Copy)]
pub struct AssociationBinder<'r> {
    registry: &'r RepositoryRegistry,
}

impl<'r> AssociationBinder<'r> {
    pub fn new(registry: &'r RepositoryRegistry) -> Self {
        Self { registry }
    }

    fn evaluator(&self) -> PermissionEvaluator<'r> {
        PermissionEvaluator::new(self.registry.resolver())
    }

    // -------------------------------------------------------------------------
    // Pre-population
    // -------------------------------------------------------------------------

    /// Fetch every entity referenced by the batch with one query per type
    pub fn prepopulate(
        &self,
        entity_type: &str,
        chain: ChainType,
        entries: &[MutationEntry],
        scope: &mut MutationScope,
    ) -> GateResult<()> {
        let mut wanted: IndexMap<String, Vec<Value>> = IndexMap::new();
        self.gather(entity_type, chain, entries, &mut wanted);

        for (target, ids) in wanted {
            let mut missing: Vec<Value> = Vec::new();
            for id in ids {
                if scope.cached(&target, &id).is_none() && !missing.contains(&id) {
                    missing.push(id);
                }
            }
            if missing.is_empty() {
                continue;
            }
            debug!(entity_type = %target, count = missing.len(), "pre-populating entities");
            let rows = self
                .registry
                .persistence()
                .find_in(&target, &missing)
                .map_err(GateError::execution)?;
            for row in rows {
                scope.store(&target, row);
            }
        }
        Ok(())
    }

    fn gather(
        &self,
        entity_type: &str,
        chain: ChainType,
        entries: &[MutationEntry],
        wanted: &mut IndexMap<String, Vec<Value>>,
    ) {
        if chain != ChainType::Create {
            let ids = wanted.entry(entity_type.to_string()).or_default();
            ids.extend(entries.iter().filter_map(|e| e.id.clone()));
        }

        let associations = self.registry.persistence().associations(entity_type);
        for entry in entries {
            for (field, value) in &entry.fields {
                let Some(association) = associations.iter().find(|a| &a.name == field) else {
                    continue;
                };
                let Value::Object(chains) = fix_scalar_association_value(value.clone()) else {
                    continue;
                };
                for (name, sub) in &chains {
                    let Ok(sub_chain) = name.parse::<ChainType>() else {
                        continue;
                    };
                    if let Ok(sub_entries) = entries_from_params(sub_chain, sub) {
                        self.gather(&association.target, sub_chain, &sub_entries, wanted);
                    }
                }
            }
        }
    }

    /// Load an existing entity, from the call cache when possible
    pub fn load_existing(
        &self,
        entity_type: &str,
        id: &Value,
        scope: &mut MutationScope,
    ) -> GateResult<Value> {
        if let Some(row) = scope.cached(entity_type, id) {
            return Ok(row.clone());
        }
        let row = self
            .registry
            .persistence()
            .find_in(entity_type, std::slice::from_ref(id))
            .map_err(GateError::execution)?
            .into_iter()
            .next()
            .ok_or_else(|| RequestError::EntityNotFound {
                entity_type: entity_type.to_string(),
                id: id_key(id),
            })?;
        scope.store(entity_type, row.clone());
        Ok(row)
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Run the permission and format checks of a batch, nested chains
    /// included, without touching the persistence layer
    ///
    /// Binding repeats these checks; this pass only guarantees that a batch
    /// failing one of them fails before its first write.
    pub fn verify(&self, request: &MutationRequest<'_>, entries: &[MutationEntry]) -> GateResult<()> {
        let associations = self.registry.persistence().associations(request.entity_type);
        for entry in entries {
            if request.chain != ChainType::Create && entry.id.is_none() {
                return Err(RequestError::InvalidParams {
                    message: format!("{} on '{}' needs an id", request.chain, request.entity_type),
                }
                .into());
            }
            for (field, value) in &entry.fields {
                if field == "id" || IGNORE_KEYS.contains(&field.as_str()) {
                    continue;
                }
                match associations.iter().find(|a| &a.name == field) {
                    Some(association) => self.verify_association(request, association, value)?,
                    None if request.chain == ChainType::Delete => {}
                    None => self.check_field(request, field)?,
                }
            }
        }
        Ok(())
    }

    fn verify_association(
        &self,
        request: &MutationRequest<'_>,
        association: &Association,
        value: &Value,
    ) -> GateResult<()> {
        let relation = association.name.as_str();
        let ctx = request
            .ctx
            .with_extra("field", Value::String(relation.to_string()));
        if value.is_null() {
            return self.check_assign(request, relation, AssignType::SetNull, &ctx);
        }

        let target = self.registry.repository(&association.target)?;
        let overrides = nested_overrides();
        for (name, sub_params) in chain_requests(relation, value.clone())? {
            let chain = self.check_chain(request, relation, &name, &ctx)?;
            for mut entry in entries_from_params(chain, &sub_params)? {
                if let Some(assign) = take_assign(&mut entry, chain, association.to_many)? {
                    self.check_assign(request, relation, assign, &ctx)?;
                }
                let params = Value::Object(entry.fields.clone());
                target.verify(
                    chain,
                    &params,
                    std::slice::from_ref(&entry),
                    &overrides,
                    request.front_end,
                )?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Binding
    // -------------------------------------------------------------------------

    /// Bind and persist one entry
    pub fn bind_entity(
        &self,
        request: &MutationRequest<'_>,
        entry: MutationEntry,
        scope: &mut MutationScope,
    ) -> GateResult<EntityRecord> {
        let entity_type = request.entity_type;
        let mut record = match request.chain {
            ChainType::Create => EntityRecord::new(entity_type),
            _ => {
                let id = entry.id.clone().ok_or_else(|| RequestError::InvalidParams {
                    message: format!("{} on '{}' needs an id", request.chain, entity_type),
                })?;
                let row = self.load_existing(entity_type, &id, scope)?;
                let mut record = EntityRecord::from_row(entity_type, &row);
                record.fields.remove("id");
                record.id = Some(row.get("id").cloned().unwrap_or(id));
                record
            }
        };

        let associations = self.registry.persistence().associations(entity_type);
        for (field, value) in entry.fields {
            if field == "id" || IGNORE_KEYS.contains(&field.as_str()) {
                continue;
            }
            match associations.iter().find(|a| a.name == field) {
                Some(association) => {
                    self.bind_association(request, &mut record, association, value, scope)?
                }
                None if request.chain == ChainType::Delete => {}
                None => self.bind_field(request, &mut record, &field, value)?,
            }
        }

        self.pre_persist(request, &mut record)?;
        self.persist(request, record, scope)
    }

    fn bind_field(
        &self,
        request: &MutationRequest<'_>,
        record: &mut EntityRecord,
        field: &str,
        value: Value,
    ) -> GateResult<()> {
        self.check_field(request, field)?;
        let resolver = self.registry.resolver();
        let ctx = request
            .ctx
            .with_extra("field", Value::String(field.to_string()));
        let permission = request.node.fields.get(field);

        let payload = self
            .registry
            .events()
            .publish(
                LifecycleEvent::BeforeSetField,
                request.entity_type,
                json!({ "field": field, "value": value }),
            )
            .map_err(GateError::from)?;
        let mut value = payload.get("value").cloned().unwrap_or(Value::Null);

        if let Some(settings) = permission.map(|p| &p.settings) {
            if let Some(mutate) = &settings.mutate {
                value = resolver.resolve(mutate, &ctx.with_extra("value", value.clone()))?;
            }
            let value_ctx = ctx.with_extra("value", value.clone());
            if let Some(closure) = &settings.closure {
                if resolver.resolve(closure, &value_ctx)? == Value::Bool(false) {
                    warn!(entity_type = request.entity_type, field, "field value vetoed by closure");
                    return Err(PermissionError::ClosureVeto {
                        field: field.to_string(),
                    }
                    .into());
                }
            }
            if let Some(expected) = resolver.resolve_opt(settings.enforce.as_ref(), &value_ctx)? {
                if expected != value {
                    return Err(EnforcementError::Violation {
                        field: field.to_string(),
                        expected,
                        actual: value,
                    }
                    .into());
                }
            }
            if let Some(forced) = resolver.resolve_opt(settings.set_to.as_ref(), &value_ctx)? {
                value = forced;
            }
        }

        record.fields.insert(field.to_string(), value);
        Ok(())
    }

    fn bind_association(
        &self,
        request: &MutationRequest<'_>,
        record: &mut EntityRecord,
        association: &Association,
        value: Value,
        scope: &mut MutationScope,
    ) -> GateResult<()> {
        let relation = association.name.as_str();
        let payload = self
            .registry
            .events()
            .publish(
                LifecycleEvent::BeforeProcessAssociationParams,
                request.entity_type,
                json!({ "relation": relation, "params": value }),
            )
            .map_err(GateError::from)?;
        let value = payload.get("params").cloned().unwrap_or(Value::Null);

        let ctx = request
            .ctx
            .with_extra("field", Value::String(relation.to_string()));

        if value.is_null() {
            self.check_assign(request, relation, AssignType::SetNull, &ctx)?;
            record
                .changes
                .push(AssociationChange::new(relation, AssignType::SetNull, None));
            return Ok(());
        }

        for (name, sub_params) in chain_requests(relation, value)? {
            let chain = self.check_chain(request, relation, &name, &ctx)?;
            for mut entry in entries_from_params(chain, &sub_params)? {
                let assign = take_assign(&mut entry, chain, association.to_many)?;
                if let Some(assign) = assign {
                    self.check_assign(request, relation, assign, &ctx)?;
                }

                let mut child = self
                    .registry
                    .repository(&association.target)?
                    .run_chain(chain, entry, request.front_end, scope)?;
                child.assign = assign;

                match assign {
                    Some(AssignType::SetNull) => record
                        .changes
                        .push(AssociationChange::new(relation, AssignType::SetNull, None)),
                    Some(assign) if assign.attaches() => record.changes.push(
                        AssociationChange::new(relation, assign, child.id.clone()),
                    ),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Checks
    // -------------------------------------------------------------------------

    fn check_field(&self, request: &MutationRequest<'_>, field: &str) -> GateResult<()> {
        let resolver = self.registry.resolver();
        let ctx = request
            .ctx
            .with_extra("field", Value::String(field.to_string()));
        let permission = request.node.fields.get(field);

        let allowed = match permission {
            Some(p) => match resolver.resolve_bool(p.allowed.as_ref(), &ctx, "allowed")? {
                Some(answer) => Some(answer),
                None => resolver.resolve_bool(p.permissive.as_ref(), &ctx, "permissive")?,
            },
            None => None,
        };
        let allowed = match allowed {
            Some(answer) => answer,
            None => resolver
                .resolve_bool(request.node.permissive.as_ref(), &ctx, "permissive")?
                .unwrap_or(false),
        };
        if !allowed {
            warn!(entity_type = request.entity_type, field, "field write denied");
            return Err(PermissionError::FieldNotAllowed {
                entity_type: request.entity_type.to_string(),
                field: field.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn check_chain(
        &self,
        request: &MutationRequest<'_>,
        relation: &str,
        name: &str,
        ctx: &ResolveContext,
    ) -> GateResult<ChainType> {
        let chain: ChainType = name.parse()?;
        let node = request.node;
        let field_layer = node.field(relation).map(|f| f as &dyn PermissionLayer);
        if self
            .evaluator()
            .bucket_check(node, field_layer, Bucket::Chain, chain.as_str(), ctx)?
        {
            return Ok(chain);
        }
        warn!(relation, chain = chain.as_str(), "chain type denied");
        Err(PermissionError::ChainTypeNotAllowed {
            field: relation.to_string(),
            chain_type: chain.to_string(),
        }
        .into())
    }

    fn check_assign(
        &self,
        request: &MutationRequest<'_>,
        relation: &str,
        assign: AssignType,
        ctx: &ResolveContext,
    ) -> GateResult<()> {
        let node = request.node;
        let field_layer = node.field(relation).map(|f| f as &dyn PermissionLayer);
        if self
            .evaluator()
            .bucket_check(node, field_layer, Bucket::Assign, assign.as_str(), ctx)?
        {
            return Ok(());
        }
        warn!(relation, assign = assign.as_str(), "assign type denied");
        Err(PermissionError::AssignTypeNotAllowed {
            field: relation.to_string(),
            assign_type: assign.to_string(),
        }
        .into())
    }

    /// Entity-level hooks: mutate → closure → enforce → setTo → validate
    fn pre_persist(&self, request: &MutationRequest<'_>, record: &mut EntityRecord) -> GateResult<()> {
        let resolver = self.registry.resolver();
        let settings = &request.node.settings;
        let writes = request.chain != ChainType::Delete;

        if writes {
            if let Some(mutate) = &settings.mutate {
                let ctx = request.ctx.with_extra("value", record.to_row());
                if let Value::Object(fields) = resolver.resolve(mutate, &ctx)? {
                    record.fields = fields;
                    record.fields.remove("id");
                }
            }
        }

        let ctx = request.ctx.with_extra("value", record.to_row());
        if let Some(closure) = &settings.closure {
            if resolver.resolve(closure, &ctx)? == Value::Bool(false) {
                warn!(entity_type = request.entity_type, "entity vetoed by closure");
                return Err(PermissionError::ClosureVeto {
                    field: request.entity_type.to_string(),
                }
                .into());
            }
        }

        if let Some(Value::Object(enforced)) = resolver.resolve_opt(settings.enforce.as_ref(), &ctx)? {
            for (field, expected) in enforced {
                let actual = record.fields.get(&field).cloned().unwrap_or(Value::Null);
                if actual != expected {
                    warn!(entity_type = request.entity_type, field = %field, "enforced value mismatch");
                    return Err(EnforcementError::Violation {
                        field,
                        expected,
                        actual,
                    }
                    .into());
                }
            }
        }

        if !writes {
            return Ok(());
        }

        if let Some(Value::Object(forced)) = resolver.resolve_opt(settings.set_to.as_ref(), &ctx)? {
            for (field, value) in forced {
                record.fields.insert(field, value);
            }
        }

        if let Some(validate) = &settings.validate {
            let rules: IndexMap<String, String> = if validate.fields.is_empty() {
                validate.rules.clone()
            } else {
                validate
                    .rules
                    .iter()
                    .filter(|(field, _)| validate.fields.contains(field))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            };
            self.registry
                .validator()
                .validate(
                    &record.fields,
                    &rules,
                    &validate.messages,
                    &validate.custom_attributes,
                )
                .map_err(|messages| ValidationError::Failed {
                    entity_type: request.entity_type.to_string(),
                    messages,
                })?;
        }
        Ok(())
    }

    fn persist(
        &self,
        request: &MutationRequest<'_>,
        mut record: EntityRecord,
        scope: &mut MutationScope,
    ) -> GateResult<EntityRecord> {
        let events = self.registry.events();
        let persistence = self.registry.persistence();

        let payload = events
            .publish(LifecycleEvent::BeforePersist, request.entity_type, record.to_row())
            .map_err(GateError::from)?;
        if let Value::Object(mut fields) = payload {
            fields.remove("id");
            record.fields = fields;
        }

        let row = match request.chain {
            ChainType::Create => persistence.insert(&record).map_err(GateError::execution)?,
            ChainType::Update => persistence.update(&record).map_err(GateError::execution)?,
            ChainType::Delete => {
                persistence.remove(&record).map_err(GateError::execution)?;
                record.to_row()
            }
            ChainType::Read => record.to_row(),
        };

        if let Some(id) = row.get("id") {
            record.id = Some(id.clone());
        }
        if let Value::Object(fields) = &row {
            record.fields = fields.clone();
            record.fields.remove("id");
        }

        match (request.chain, &record.id) {
            (ChainType::Delete, Some(id)) => scope.forget(request.entity_type, id),
            (_, Some(_)) => scope.store(request.entity_type, row.clone()),
            _ => {}
        }

        debug!(
            entity_type = request.entity_type,
            action = request.chain.as_str(),
            changes = record.changes.len(),
            "entity persisted"
        );
        events
            .publish(LifecycleEvent::AfterPersist, request.entity_type, row)
            .map_err(GateError::from)?;
        Ok(record)
    }
}

/// Chain requests of a relation value, keyed by chain name
fn chain_requests(relation: &str, value: Value) -> GateResult<Map<String, Value>> {
    match fix_scalar_association_value(value) {
        Value::Object(chains) => Ok(chains),
        _ => Err(RequestError::InvalidParams {
            message: format!("relation '{}' expects a chain request", relation),
        }
        .into()),
    }
}

/// Strip the directives off a chain entry and pick its assignment
fn take_assign(
    entry: &mut MutationEntry,
    chain: ChainType,
    to_many: bool,
) -> GateResult<Option<AssignType>> {
    entry.fields.remove("chainType");
    match entry.fields.remove("assignType") {
        Some(Value::String(name)) => Ok(Some(name.parse::<AssignType>()?)),
        Some(Value::Null) | None => Ok(AssignType::default_for(chain, to_many)),
        Some(other) => Err(RequestError::UnknownAssignType {
            assign_type: other.to_string(),
        }
        .into()),
    }
}

/// Overrides applied to every nested chain call
pub fn nested_overrides() -> CallOptions {
    CallOptions::new()
        .with("transaction", false)
        .with("flush", false)
        .with("batchMax", Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutator_names() {
        assert_eq!(AssignType::AddSingle.mutator("tracks"), "addTrack");
        assert_eq!(AssignType::Add.mutator("tracks"), "addTracks");
        assert_eq!(AssignType::Set.mutator("artist"), "setArtist");
        assert_eq!(AssignType::RemoveSingle.mutator("tracks"), "removeTrack");
        assert_eq!(AssignType::SetNull.mutator("artist"), "setArtist");
    }

    #[test]
    fn test_set_null_and_null_are_distinct() {
        assert_eq!("setNull".parse::<AssignType>().unwrap(), AssignType::SetNull);
        assert_eq!("null".parse::<AssignType>().unwrap(), AssignType::Null);
        assert_eq!(AssignType::SetNull.as_str(), "setNull");
        assert_eq!(serde_json::to_value(AssignType::Null).unwrap(), json!("null"));
        assert!(AssignType::SetNull.attaches());
        assert!(!AssignType::Null.attaches());
    }

    #[test]
    fn test_take_assign_strips_directives() {
        let mut entry = MutationEntry {
            id: Some(json!("t1")),
            fields: json!({"title": "x", "assignType": "null", "chainType": "update"})
                .as_object()
                .cloned()
                .unwrap(),
        };
        let assign = take_assign(&mut entry, ChainType::Update, true).unwrap();
        assert_eq!(assign, Some(AssignType::Null));
        assert_eq!(entry.fields.len(), 1);

        let mut bare = MutationEntry::default();
        assert_eq!(take_assign(&mut bare, ChainType::Delete, true).unwrap(), None);
    }

    #[test]
    fn test_default_assign_types() {
        assert_eq!(
            AssignType::default_for(ChainType::Create, true),
            Some(AssignType::AddSingle)
        );
        assert_eq!(
            AssignType::default_for(ChainType::Read, false),
            Some(AssignType::Set)
        );
        assert_eq!(AssignType::default_for(ChainType::Delete, true), None);
    }

    #[test]
    fn test_unknown_names() {
        assert!(matches!(
            "merge".parse::<ChainType>(),
            Err(RequestError::UnknownChainType { .. })
        ));
        assert!(matches!(
            "append".parse::<AssignType>(),
            Err(RequestError::UnknownAssignType { .. })
        ));
    }

    #[test]
    fn test_bare_id_becomes_read_set() {
        assert_eq!(
            fix_scalar_association_value(json!(7)),
            json!({"read": {"7": {"assignType": "set"}}})
        );
        assert_eq!(fix_scalar_association_value(json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_entries_from_params_shapes() {
        let create = entries_from_params(ChainType::Create, &json!([{"name": "a"}, {"name": "b"}])).unwrap();
        assert_eq!(create.len(), 2);
        assert!(create[0].id.is_none());

        let update = entries_from_params(ChainType::Update, &json!({"x1": {"name": "a"}})).unwrap();
        assert_eq!(update[0].id, Some(json!("x1")));

        let listed = entries_from_params(ChainType::Delete, &json!([{"id": 4}, 5])).unwrap();
        assert_eq!(listed[0].id, Some(json!(4)));
        assert_eq!(listed[1].id, Some(json!(5)));

        assert!(entries_from_params(ChainType::Update, &json!([{"name": "no id"}])).is_err());
        assert!(entries_from_params(ChainType::Create, &json!("oops")).is_err());
    }

    #[test]
    fn test_scope_cache() {
        let mut scope = MutationScope::new();
        scope.store("album", json!({"id": 3, "name": "x"}));
        assert!(scope.cached("album", &json!(3)).is_some());
        assert!(scope.cached("album", &json!("3")).is_some());
        scope.forget("album", &json!(3));
        assert_eq!(scope.cached_count("album"), 0);
    }
}
