//! In-memory implementation of Persistence for testing and development

use crate::core::binder::{AssignType, AssociationChange, id_key};
use crate::core::filter::{Expr, Operand, Operator, is_valid_field};
use crate::core::query::{Direction, QuerySpec};
use crate::core::store::{Association, EntityRecord, Page, Persistence};
use anyhow::{Result, anyhow, bail};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

type Tables = HashMap<String, IndexMap<String, Value>>;

#[derive(Default)]
struct Store {
    tables: Tables,
    schema: HashMap<String, Vec<Association>>,
    snapshot: Option<Tables>,
    calls: Vec<String>,
}

/// In-memory persistence backend
///
/// Rows are JSON objects keyed by id. Generated ids are UUID strings.
/// Transactions snapshot every table on `begin` and restore it on
/// `rollback`. Queries support predicates over root columns, ordering and
/// pagination; joins, grouping, having clauses and raw fragments are
/// rejected. Uses RwLock for thread-safe access.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    store: Arc<RwLock<Store>>,
}

impl InMemoryPersistence {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an association of an entity type
    pub fn with_association(self, entity_type: &str, association: Association) -> Self {
        if let Ok(mut store) = self.store.write() {
            store
                .schema
                .entry(entity_type.to_string())
                .or_default()
                .push(association);
        }
        self
    }

    /// Insert rows as they are; rows without an id get a generated one
    pub fn seed(&self, entity_type: &str, rows: Vec<Value>) -> Result<()> {
        let mut store = self
            .store
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
        let table = store.tables.entry(entity_type.to_string()).or_default();
        for mut row in rows {
            let Value::Object(fields) = &mut row else {
                bail!("seed rows must be objects");
            };
            let id = fields
                .entry("id")
                .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
                .clone();
            table.insert(id_key(&id), row);
        }
        Ok(())
    }

    /// Current rows of an entity type, in insertion order
    pub fn rows(&self, entity_type: &str) -> Result<Vec<Value>> {
        let store = self
            .store
            .read()
            .map_err(|e| anyhow!("Failed to acquire read lock: {}", e))?;
        Ok(store
            .tables
            .get(entity_type)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    /// One row by id
    pub fn get(&self, entity_type: &str, id: &Value) -> Result<Option<Value>> {
        let store = self
            .store
            .read()
            .map_err(|e| anyhow!("Failed to acquire read lock: {}", e))?;
        Ok(store
            .tables
            .get(entity_type)
            .and_then(|t| t.get(&id_key(id)))
            .cloned())
    }

    /// Operations performed so far, e.g. `find_in:artist:2` or `insert:album`
    pub fn calls(&self) -> Vec<String> {
        self.store.read().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut store) = self.store.write() {
            store.calls.clear();
        }
    }

    fn select(&self, spec: &QuerySpec) -> Result<Vec<Value>> {
        if !spec.joins.is_empty() {
            bail!("joins are not supported by the in-memory backend");
        }
        if !spec.group_by.is_empty() || spec.having.is_some() {
            bail!("grouping is not supported by the in-memory backend");
        }

        let root = spec
            .from
            .first()
            .map(|f| f.entity.as_str())
            .unwrap_or(spec.entity_type.as_str());
        let evaluator = Evaluator {
            spec,
            alias: spec.root_alias(),
        };

        let store = self
            .store
            .read()
            .map_err(|e| anyhow!("Failed to acquire read lock: {}", e))?;
        let mut rows = Vec::new();
        if let Some(table) = store.tables.get(root) {
            for row in table.values() {
                let keep = match &spec.where_clause {
                    Some(expr) => evaluator.matches(expr, row)?,
                    None => true,
                };
                if keep {
                    rows.push(row.clone());
                }
            }
        }
        drop(store);

        if !spec.order_by.is_empty() {
            let keys = spec
                .order_by
                .iter()
                .map(|o| Ok((evaluator.column_name(&o.field)?, o.direction)))
                .collect::<Result<Vec<_>>>()?;
            rows.sort_by(|a, b| {
                for (column, direction) in &keys {
                    let ordering = compare(
                        a.get(column).unwrap_or(&Value::Null),
                        b.get(column).unwrap_or(&Value::Null),
                    )
                    .unwrap_or(Ordering::Equal);
                    let ordering = match direction {
                        Direction::Asc => ordering,
                        Direction::Desc => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }
        Ok(rows)
    }

    fn window(rows: Vec<Value>, spec: &QuerySpec) -> Vec<Value> {
        let skip = usize::try_from(spec.offset.saturating_sub(1)).unwrap_or(usize::MAX);
        let take = usize::try_from(spec.limit).unwrap_or(usize::MAX);
        rows.into_iter().skip(skip).take(take).collect()
    }

    fn log(store: &mut Store, call: String) {
        store.calls.push(call);
    }

    fn apply_changes(store: &Store, entity_type: &str, row: &mut Value, changes: &[AssociationChange]) -> Result<()> {
        let associations = store.schema.get(entity_type);
        for change in changes.iter().filter(|c| c.assign.attaches()) {
            let association = associations
                .and_then(|a| a.iter().find(|a| a.name == change.relation))
                .ok_or_else(|| anyhow!("unknown association '{}' on '{}'", change.relation, entity_type))?;
            let Value::Object(fields) = row else {
                bail!("row of '{}' is not an object", entity_type);
            };
            let target = change.target.clone().unwrap_or(Value::Null);

            if !association.to_many {
                let value = match change.assign {
                    AssignType::SetNull => Value::Null,
                    AssignType::Remove | AssignType::RemoveSingle => {
                        match fields.get(&change.relation) {
                            Some(current) if id_key(current) == id_key(&target) => Value::Null,
                            Some(current) => current.clone(),
                            None => Value::Null,
                        }
                    }
                    _ => target,
                };
                fields.insert(change.relation.clone(), value);
                continue;
            }

            let mut items = match fields.remove(&change.relation) {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            let position = items.iter().position(|i| id_key(i) == id_key(&target));
            match change.assign {
                AssignType::SetNull => items.clear(),
                AssignType::Set | AssignType::SetSingle => items = vec![target],
                AssignType::Add | AssignType::AddSingle => {
                    if position.is_none() {
                        items.push(target);
                    }
                }
                AssignType::Remove | AssignType::RemoveSingle => {
                    if let Some(position) = position {
                        items.remove(position);
                    }
                }
                AssignType::Null => {}
            }
            fields.insert(change.relation.clone(), Value::Array(items));
        }
        Ok(())
    }
}

impl Persistence for InMemoryPersistence {
    fn execute(&self, query: &QuerySpec) -> Result<Vec<Value>> {
        let rows = self.select(query)?;
        Ok(Self::window(rows, query))
    }

    fn execute_paginated(&self, query: &QuerySpec, _fetch_join: bool, return_count: bool) -> Result<Page> {
        let rows = self.select(query)?;
        let count = return_count.then_some(rows.len() as u64);
        Ok(Page {
            count,
            rows: Self::window(rows, query),
        })
    }

    fn find_in(&self, entity_type: &str, ids: &[Value]) -> Result<Vec<Value>> {
        let mut store = self
            .store
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
        Self::log(&mut store, format!("find_in:{}:{}", entity_type, ids.len()));

        let Some(table) = store.tables.get(entity_type) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| table.get(&id_key(id)).cloned())
            .collect())
    }

    fn insert(&self, record: &EntityRecord) -> Result<Value> {
        let mut store = self
            .store
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
        Self::log(&mut store, format!("insert:{}", record.entity_type));

        let id = record
            .id
            .clone()
            .unwrap_or_else(|| Value::String(Uuid::new_v4().to_string()));
        let mut row = record.clone().with_id(id.clone()).to_row();
        Self::apply_changes(&store, &record.entity_type, &mut row, &record.changes)?;

        let table = store.tables.entry(record.entity_type.clone()).or_default();
        if table.contains_key(&id_key(&id)) {
            bail!("'{}' with id {} already exists", record.entity_type, id_key(&id));
        }
        table.insert(id_key(&id), row.clone());
        Ok(row)
    }

    fn update(&self, record: &EntityRecord) -> Result<Value> {
        let mut store = self
            .store
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
        Self::log(&mut store, format!("update:{}", record.entity_type));

        let id = record
            .id
            .clone()
            .ok_or_else(|| anyhow!("cannot update '{}' without an id", record.entity_type))?;
        let mut row = record.to_row();
        Self::apply_changes(&store, &record.entity_type, &mut row, &record.changes)?;

        let slot = store
            .tables
            .get_mut(&record.entity_type)
            .and_then(|t| t.get_mut(&id_key(&id)))
            .ok_or_else(|| anyhow!("'{}' {} not found", record.entity_type, id_key(&id)))?;
        *slot = row.clone();
        Ok(row)
    }

    fn remove(&self, record: &EntityRecord) -> Result<()> {
        let mut store = self
            .store
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
        Self::log(&mut store, format!("remove:{}", record.entity_type));

        let id = record
            .id
            .as_ref()
            .ok_or_else(|| anyhow!("cannot remove '{}' without an id", record.entity_type))?;
        store
            .tables
            .get_mut(&record.entity_type)
            .and_then(|t| t.shift_remove(&id_key(id)))
            .ok_or_else(|| anyhow!("'{}' {} not found", record.entity_type, id_key(id)))?;
        Ok(())
    }

    fn associations(&self, entity_type: &str) -> Vec<Association> {
        self.store
            .read()
            .ok()
            .and_then(|s| s.schema.get(entity_type).cloned())
            .unwrap_or_default()
    }

    fn begin(&self) -> Result<()> {
        let mut store = self
            .store
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
        if store.snapshot.is_some() {
            bail!("a transaction is already open");
        }
        store.snapshot = Some(store.tables.clone());
        Self::log(&mut store, "begin".to_string());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut store = self
            .store
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
        store
            .snapshot
            .take()
            .ok_or_else(|| anyhow!("no open transaction to commit"))?;
        Self::log(&mut store, "commit".to_string());
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut store = self
            .store
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
        let snapshot = store
            .snapshot
            .take()
            .ok_or_else(|| anyhow!("no open transaction to roll back"))?;
        store.tables = snapshot;
        Self::log(&mut store, "rollback".to_string());
        Ok(())
    }
}

// =============================================================================
// Expression evaluation
// =============================================================================

struct Evaluator<'a> {
    spec: &'a QuerySpec,
    alias: &'a str,
}

impl Evaluator<'_> {
    fn column_name(&self, field: &str) -> Result<String> {
        match field.split_once('.') {
            Some((alias, column)) if alias == self.alias => Ok(column.to_string()),
            Some((alias, _)) => bail!("unknown alias '{}'", alias),
            None => Ok(field.to_string()),
        }
    }

    fn operand(&self, operand: &Operand, row: &Value) -> Result<Value> {
        match operand {
            Operand::Param(name) => self
                .spec
                .parameter(name)
                .cloned()
                .ok_or_else(|| anyhow!("unbound parameter '{}'", name)),
            Operand::Fragment(text) => {
                if let Some(name) = text.strip_prefix(':') {
                    return self
                        .spec
                        .parameter(name)
                        .cloned()
                        .ok_or_else(|| anyhow!("unbound parameter '{}'", name));
                }
                if is_valid_field(text) {
                    let column = self.column_name(text)?;
                    return Ok(row.get(&column).cloned().unwrap_or(Value::Null));
                }
                Ok(Value::String(text.clone()))
            }
            Operand::Expr(_) => bail!("nested expressions as operands are not supported"),
        }
    }

    fn matches(&self, expr: &Expr, row: &Value) -> Result<bool> {
        match expr {
            Expr::Fragment { text } => bail!("raw fragment '{}' is not supported", text),
            Expr::And { items } => {
                for item in items {
                    if !self.matches(item, row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Or { items } => {
                for item in items {
                    if self.matches(item, row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Predicate {
                field,
                operator,
                arguments,
            } => {
                let column = self.column_name(field)?;
                let actual = row.get(&column).cloned().unwrap_or(Value::Null);
                let arguments = arguments
                    .iter()
                    .map(|a| self.operand(a, row))
                    .collect::<Result<Vec<_>>>()?;
                predicate(*operator, &actual, &arguments)
            }
        }
    }
}

fn predicate(operator: Operator, actual: &Value, arguments: &[Value]) -> Result<bool> {
    let first = arguments.first().unwrap_or(&Value::Null);
    let list = || -> Vec<&Value> {
        match arguments {
            [Value::Array(items)] => items.iter().collect(),
            items => items.iter().collect(),
        }
    };

    Ok(match operator {
        Operator::Eq => loose_eq(actual, first),
        Operator::Neq => !loose_eq(actual, first),
        Operator::Lt => compare(actual, first) == Some(Ordering::Less),
        Operator::Lte => matches!(compare(actual, first), Some(Ordering::Less | Ordering::Equal)),
        Operator::Gt => compare(actual, first) == Some(Ordering::Greater),
        Operator::Gte => matches!(compare(actual, first), Some(Ordering::Greater | Ordering::Equal)),
        Operator::In => list().into_iter().any(|v| loose_eq(actual, v)),
        Operator::NotIn => !list().into_iter().any(|v| loose_eq(actual, v)),
        Operator::IsNull => actual.is_null(),
        Operator::IsNotNull => !actual.is_null(),
        Operator::Like => like(actual, first)?,
        Operator::NotLike => !like(actual, first)?,
        Operator::Between => {
            let upper = arguments.get(1).unwrap_or(&Value::Null);
            matches!(compare(actual, first), Some(Ordering::Greater | Ordering::Equal))
                && matches!(compare(actual, upper), Some(Ordering::Less | Ordering::Equal))
        }
        Operator::AndX | Operator::OrX => bail!("'{}' cannot be used as a predicate", operator),
    })
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => None,
    }
}

/// SQL `LIKE` with `%` and `_` wildcards, case-insensitive
fn like(actual: &Value, pattern: &Value) -> Result<bool> {
    let (Some(actual), Some(pattern)) = (actual.as_str(), pattern.as_str()) else {
        return Ok(false);
    };
    let mut translated = String::from("(?is)^");
    for c in pattern.chars() {
        match c {
            '%' => translated.push_str(".*"),
            '_' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    translated.push('$');
    Ok(Regex::new(&translated)?.is_match(actual))
}
