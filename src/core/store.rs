//! Persistence collaborator
//!
//! The gateway never talks to a database itself. It hands verified
//! [`QuerySpec`]s and [`EntityRecord`]s to a [`Persistence`] implementation,
//! which owns execution, hydration, transactions and schema metadata.
//! Errors from the implementation are surfaced unchanged as
//! [`GateError::Execution`](crate::core::error::GateError::Execution).

use crate::core::binder::{AssignType, AssociationChange};
use crate::core::query::QuerySpec;
use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};

/// Schema metadata for one association of an entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Association {
    /// Field name on the owning entity
    pub name: String,
    /// Entity type on the other side
    pub target: String,
    /// Whether the field holds a collection
    pub to_many: bool,
}

impl Association {
    pub fn to_one(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            to_many: false,
        }
    }

    pub fn to_many(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            to_many: true,
        }
    }
}

/// A page of rows with an optional total count
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Page {
    /// Total number of matching rows, independent of limit and offset
    pub count: Option<u64>,
    pub rows: Vec<Value>,
}

/// An entity about to be written (or just written) by a mutation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityRecord {
    pub entity_type: String,
    /// `None` until the entity has been inserted
    pub id: Option<Value>,
    /// Scalar field values
    pub fields: Map<String, Value>,
    /// Association changes to apply with the write
    pub changes: Vec<AssociationChange>,
    /// How this record was attached to its parent, for nested records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assign: Option<AssignType>,
}

impl EntityRecord {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: Value) -> Self {
        self.id = Some(id);
        self
    }

    /// Build a record from a stored row
    pub fn from_row(entity_type: &str, row: &Value) -> Self {
        let fields = row.as_object().cloned().unwrap_or_default();
        Self {
            entity_type: entity_type.to_string(),
            id: fields.get("id").cloned(),
            fields,
            changes: Vec::new(),
            assign: None,
        }
    }

    /// Row view with the id folded into the fields
    pub fn to_row(&self) -> Value {
        let mut row = self.fields.clone();
        if let Some(id) = &self.id {
            row.insert("id".to_string(), id.clone());
        }
        Value::Object(row)
    }
}

/// Executes queries and writes for the gateway
///
/// Implementations must be `Send + Sync`: one instance is shared by every
/// repository built from a registry.
pub trait Persistence: Send + Sync {
    /// Run a query and return every row
    fn execute(&self, query: &QuerySpec) -> Result<Vec<Value>>;

    /// Run a query as a page; `count` ignores limit and offset
    fn execute_paginated(&self, query: &QuerySpec, fetch_join: bool, return_count: bool)
    -> Result<Page>;

    /// Fetch the entities of a type whose id is in `ids`
    fn find_in(&self, entity_type: &str, ids: &[Value]) -> Result<Vec<Value>>;

    /// Insert a new entity and return the stored row
    fn insert(&self, record: &EntityRecord) -> Result<Value>;

    /// Update an existing entity and return the stored row
    fn update(&self, record: &EntityRecord) -> Result<Value>;

    /// Remove an existing entity
    fn remove(&self, record: &EntityRecord) -> Result<()>;

    /// Associations declared for an entity type
    fn associations(&self, entity_type: &str) -> Vec<Association>;

    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Push pending writes to the backend; called once per top-level mutation
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
