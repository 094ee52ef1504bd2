//! Core module containing the compiler, the permission model and the collaborator traits

pub mod binder;
pub mod error;
pub mod events;
pub mod filter;
pub mod permission;
pub mod query;
pub mod repository;
pub mod resolver;
pub mod store;
pub mod validation;
pub mod value;
pub mod wire;

pub use binder::{AssignType, AssociationBinder, AssociationChange, ChainType};
pub use error::{GateError, GateResult};
pub use events::{EventBus, EventEnvelope, LifecycleEvent};
pub use filter::{ConditionType, Expr, FilterCondition, FilterExpressionBuilder, Operand, Operator};
pub use permission::{Bucket, FieldPermission, PermissionEvaluator, PermissionNode, PermissionSettings};
pub use query::{FrontEndOptions, QueryCompiler, QuerySpec};
pub use repository::{ReadOutcome, RegistryBuilder, Repository, RepositoryRegistry};
pub use resolver::{ConfigResolver, ExpressionRegistry, ResolveContext};
pub use store::{Association, EntityRecord, Page, Persistence};
pub use validation::{RuleValidator, Validator};
pub use value::ConfigValue;
pub use wire::GetParams;
