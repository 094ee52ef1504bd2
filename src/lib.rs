//! # Gatehouse
//!
//! A declarative, permission-gated query and mutation compiler for
//! configurable CRUD endpoints.
//!
//! ## Features
//!
//! - **Trusted base configuration**: per entity `read`, `create`, `update`
//!   and `delete` sections loaded from YAML or JSON
//! - **Untrusted front-end input**: filters, ordering, grouping,
//!   placeholders and paging checked against a layered permission model
//! - **Dynamic settings**: any configuration value may be a `$call`
//!   expression resolved per call from a closed registry of callables
//! - **Verified queries**: a [`QuerySpec`](core::QuerySpec) with bound
//!   parameters only, never concatenated literals
//! - **Nested mutations**: chains across associations with assign and
//!   chain type permissions, enforcement, validation and lifecycle events
//! - **Pluggable persistence**: execution, transactions and schema live
//!   behind the [`Persistence`](core::Persistence) trait
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gatehouse::prelude::*;
//!
//! let config = GatewayConfig::from_yaml_str(r#"
//! entities:
//!   album:
//!     read:
//!       permissions:
//!         where:
//!           fields:
//!             t.name:
//!               operators: { eq: true, like: true }
//! "#)?;
//!
//! let registry = RepositoryRegistry::builder()
//!     .with_config(config)
//!     .with_persistence(InMemoryPersistence::new())
//!     .build()?;
//!
//! let front_end = FrontEndOptions::new()
//!     .with_where(FilterCondition::new("t.name", "like", vec![json!("Blue%")]))
//!     .with_limit(10);
//!
//! let outcome = registry
//!     .repository("album")?
//!     .read(json!({}), front_end, CallOptions::new())?;
//! ```

pub mod config;
pub mod core;
pub mod storage;

/// Re-exports of commonly used types and traits
pub mod prelude {
    // === Core ===
    pub use crate::core::{
        binder::{AssignType, AssociationChange, ChainType},
        error::{
            ConfigError, EnforcementError, ErrorResponse, ExpressionError, GateError, GateResult,
            LimitError, PermissionError, RequestError, ValidationError,
        },
        events::{EventBus, EventEnvelope, LifecycleEvent},
        filter::{ConditionType, Expr, FilterCondition, Operand, Operator},
        permission::{FieldPermission, PermissionNode, PermissionSettings},
        query::{FrontEndOptions, PaginationMeta, QuerySpec},
        repository::{ReadOutcome, RegistryBuilder, Repository, RepositoryRegistry},
        resolver::{ExpressionRegistry, ResolveContext},
        store::{Association, EntityRecord, Page, Persistence},
        validation::{RuleValidator, Validator},
        value::ConfigValue,
        wire::GetParams,
    };

    // === Storage ===
    #[cfg(feature = "in-memory")]
    pub use crate::storage::InMemoryPersistence;

    // === Config ===
    pub use crate::config::{CallOptions, EntityConfig, GatewayConfig, PlaceholderConfig};

    // === External dependencies ===
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{Value, json};
}
