//! Lifecycle events for repository calls
//!
//! The [`EventBus`] lets applications observe and adjust a call while it
//! runs. Listeners are invoked synchronously, in registration order, and
//! may rewrite the event payload. A listener error aborts the call.
//!
//! # Usage
//!
//! ```rust,ignore
//! let bus = EventBus::new();
//!
//! bus.subscribe(LifecycleEvent::BeforeSetField, |envelope| {
//!     if envelope.payload["field"] == "name" {
//!         let trimmed = envelope.payload["value"].as_str().unwrap_or("").trim().to_string();
//!         envelope.payload["value"] = trimmed.into();
//!     }
//!     Ok(())
//! })?;
//! ```

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Points in a call where listeners run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Before a scalar field value is written; payload `{field, value}`
    BeforeSetField,
    /// Before a relation's chain request is processed; payload `{relation, params}`
    BeforeProcessAssociationParams,
    /// Before a record is handed to persistence; payload is the record
    BeforePersist,
    /// After persistence returned; payload is the stored row
    AfterPersist,
    /// Before results are returned; payload is the result rows
    BeforeToArray,
    /// After results were shaped; payload is the final result
    AfterToArray,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::BeforeSetField => "before_set_field",
            LifecycleEvent::BeforeProcessAssociationParams => "before_process_association_params",
            LifecycleEvent::BeforePersist => "before_persist",
            LifecycleEvent::AfterPersist => "after_persist",
            LifecycleEvent::BeforeToArray => "before_to_array",
            LifecycleEvent::AfterToArray => "after_to_array",
        }
    }
}

/// Envelope wrapping an event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    pub event: LifecycleEvent,
    pub entity_type: String,
    /// Mutable event data
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(event: LifecycleEvent, entity_type: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
            entity_type: entity_type.to_string(),
            payload,
        }
    }
}

/// A registered listener
pub type Listener = Arc<dyn Fn(&mut EventEnvelope) -> Result<()> + Send + Sync>;

struct Subscription {
    event: Option<LifecycleEvent>,
    listener: Listener,
}

/// Synchronous event bus shared by all repositories of a registry
///
/// The bus is cheap to clone (Arc internally) and can be shared across threads.
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event
    pub fn subscribe<F>(&self, event: LifecycleEvent, listener: F) -> Result<()>
    where
        F: Fn(&mut EventEnvelope) -> Result<()> + Send + Sync + 'static,
    {
        self.push(Some(event), Arc::new(listener))
    }

    /// Register a listener for every event
    pub fn subscribe_all<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(&mut EventEnvelope) -> Result<()> + Send + Sync + 'static,
    {
        self.push(None, Arc::new(listener))
    }

    fn push(&self, event: Option<LifecycleEvent>, listener: Listener) -> Result<()> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .map_err(|e| anyhow!("Failed to acquire write lock: {}", e))?;
        subscriptions.push(Subscription { event, listener });
        Ok(())
    }

    /// Run every matching listener and return the (possibly rewritten) payload
    pub fn publish(&self, event: LifecycleEvent, entity_type: &str, payload: Value) -> Result<Value> {
        let listeners: Vec<Listener> = {
            let subscriptions = self
                .subscriptions
                .read()
                .map_err(|e| anyhow!("Failed to acquire read lock: {}", e))?;
            subscriptions
                .iter()
                .filter(|s| s.event.is_none_or(|e| e == event))
                .map(|s| s.listener.clone())
                .collect()
        };

        if listeners.is_empty() {
            return Ok(payload);
        }

        let mut envelope = EventEnvelope::new(event, entity_type, payload);
        for listener in listeners {
            listener(&mut envelope)?;
        }
        Ok(envelope.payload)
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.subscriptions.read().map(|s| s.len()).unwrap_or(0)
    }
}
