//! Typed error handling for gatehouse
//!
//! Every failure raised while compiling or executing a request maps to one
//! category of [`GateError`]. Each category carries enough structured context
//! (field, operator, limit values) to build an actionable message without
//! leaking the internal query structure.
//!
//! # Error Categories
//!
//! - [`ConfigError`]: missing collaborators, unknown entity types, bad configuration
//! - [`ExpressionError`]: dynamic configuration values that cannot be evaluated
//! - [`PermissionError`]: anything the configuration denies
//! - [`RequestError`]: malformed front-end input
//! - [`LimitError`]: row, batch and parameter limits
//! - [`EnforcementError`]: a field does not hold its enforced value
//! - [`ValidationError`]: the validation collaborator rejected the values
//! - `Execution`: errors passed through from the persistence collaborator
//!
//! # Example
//!
//! ```rust,ignore
//! match repository.read(params, front_end, CallOptions::default()) {
//!     Ok(outcome) => println!("{:?}", outcome),
//!     Err(GateError::Permission(PermissionError::OperatorNotAllowed { field, operator })) => {
//!         println!("{} cannot be filtered with {}", field, operator);
//!     }
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Result alias used throughout the crate
pub type GateResult<T> = Result<T, GateError>;

/// The main error type for gatehouse
#[derive(Debug, Error)]
pub enum GateError {
    /// Configuration and wiring errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Dynamic expression evaluation errors
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// Permission denials
    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// Malformed front-end requests
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Row, batch or parameter limits
    #[error(transparent)]
    Limit(#[from] LimitError),

    /// Enforced field values
    #[error(transparent)]
    Enforcement(#[from] EnforcementError),

    /// Validation collaborator failures
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Errors raised by the persistence collaborator, passed through untouched
    #[error("Execution failed: {0}")]
    Execution(#[source] anyhow::Error),
}

/// Error response structure for HTTP responses
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl GateError {
    /// Wrap a collaborator error
    pub fn execution(err: impl Into<anyhow::Error>) -> Self {
        GateError::Execution(err.into())
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GateError::Expression(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GateError::Permission(_) => StatusCode::FORBIDDEN,
            GateError::Request(e) => e.status_code(),
            GateError::Limit(_) => StatusCode::BAD_REQUEST,
            GateError::Enforcement(_) => StatusCode::BAD_REQUEST,
            GateError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GateError::Execution(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            GateError::Config(_) => "CONFIGURATION_ERROR",
            GateError::Expression(_) => "EXPRESSION_EVALUATION_ERROR",
            GateError::Permission(e) => e.error_code(),
            GateError::Request(e) => e.error_code(),
            GateError::Limit(e) => e.error_code(),
            GateError::Enforcement(_) => "ENFORCEMENT_VIOLATION",
            GateError::Validation(_) => "VALIDATION_FAILED",
            GateError::Execution(_) => "EXECUTION_ERROR",
        }
    }

    /// Convert to an error response
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.error_code().to_string(),
            message: self.to_string(),
            details: self.details(),
        }
    }

    /// Structured context for the error, if any
    pub fn details(&self) -> Option<Value> {
        match self {
            GateError::Permission(PermissionError::OperatorNotAllowed { field, operator }) => {
                Some(json!({ "field": field, "operator": operator }))
            }
            GateError::Permission(PermissionError::OrderByNotAllowed { field, direction }) => {
                Some(json!({ "field": field, "direction": direction }))
            }
            GateError::Permission(PermissionError::ClosureVeto { field }) => {
                Some(json!({ "field": field }))
            }
            GateError::Request(RequestError::MalformedField { field }) => {
                Some(json!({ "field": field }))
            }
            GateError::Request(RequestError::UnsafeOperator { operator }) => {
                Some(json!({ "operator": operator }))
            }
            GateError::Limit(LimitError::LimitExceeded { limit, max_limit }) => {
                Some(json!({ "limit": limit, "max_limit": max_limit }))
            }
            GateError::Limit(LimitError::BatchTooLarge { size, batch_max }) => {
                Some(json!({ "size": size, "batch_max": batch_max }))
            }
            GateError::Enforcement(EnforcementError::Violation {
                field,
                expected,
                actual,
            }) => Some(json!({ "field": field, "expected": expected, "actual": actual })),
            GateError::Validation(ValidationError::Failed { entity_type, messages }) => {
                Some(json!({ "entity_type": entity_type, "messages": messages }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(self.to_response());
        (status, body).into_response()
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

/// Errors related to configuration and collaborator wiring
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required collaborator was never provided to the registry builder
    #[error("Missing required collaborator: {collaborator}")]
    MissingCollaborator { collaborator: String },

    /// No configuration exists for the entity type
    #[error("No configuration registered for entity type '{entity_type}'")]
    UnknownEntityType { entity_type: String },

    /// The configuration document could not be parsed
    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    /// A configuration value has an invalid shape
    #[error("Invalid configuration at '{path}': {message}")]
    InvalidValue { path: String, message: String },
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::ParseError {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::ParseError {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::ParseError {
            message: err.to_string(),
        }
    }
}

// =============================================================================
// Expression Errors
// =============================================================================

/// Errors raised while resolving dynamic configuration values
#[derive(Debug, Error)]
pub enum ExpressionError {
    /// The expression names a callable that is not in the registry
    #[error("Unknown callable '{name}' referenced by configuration expression")]
    UnknownCallable { name: String },

    /// The callable ran and failed
    #[error("Callable '{name}' failed: {message}")]
    CallFailed { name: String, message: String },

    /// The resolved value does not have the expected type
    #[error("Expected {expected} for '{setting}', got {actual}")]
    TypeMismatch {
        setting: String,
        expected: String,
        actual: String,
    },
}

// =============================================================================
// Permission Errors
// =============================================================================

/// Everything the configuration can deny
#[derive(Debug, Error)]
pub enum PermissionError {
    /// The action (read/create/update/delete) is disabled
    #[error("Action '{action}' is not allowed on '{entity_type}'")]
    ActionNotAllowed { entity_type: String, action: String },

    /// A filter operator is not permitted on a field
    #[error("Operator not allowed. field = {field}, operator = {operator}")]
    OperatorNotAllowed { field: String, operator: String },

    /// An order-by direction is not permitted on a field
    #[error("Order by not allowed. field = {field}, direction = {direction}")]
    OrderByNotAllowed { field: String, direction: String },

    /// Grouping on a field is not permitted
    #[error("Group by not allowed. field = {field}")]
    GroupByNotAllowed { field: String },

    /// The front end may not supply this placeholder
    #[error("Placeholder not allowed. placeholder = {name}")]
    PlaceholderNotAllowed { name: String },

    /// The field may not be written
    #[error("Field '{field}' may not be set on '{entity_type}'")]
    FieldNotAllowed { entity_type: String, field: String },

    /// The assign type is not permitted on the relation
    #[error("Assign type not permitted. assignType = {assign_type}, field = {field}")]
    AssignTypeNotAllowed { field: String, assign_type: String },

    /// The chain type is not permitted on the relation
    #[error("Chain type not permitted. chainType = {chain_type}, relation = {field}")]
    ChainTypeNotAllowed { field: String, chain_type: String },

    /// A configured closure vetoed the value
    #[error("A validation closure did not pass. field = {field}")]
    ClosureVeto { field: String },
}

impl PermissionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            PermissionError::ActionNotAllowed { .. } => "ACTION_NOT_ALLOWED",
            PermissionError::OperatorNotAllowed { .. } => "OPERATOR_NOT_ALLOWED",
            PermissionError::OrderByNotAllowed { .. } => "ORDER_BY_NOT_ALLOWED",
            PermissionError::GroupByNotAllowed { .. } => "GROUP_BY_NOT_ALLOWED",
            PermissionError::PlaceholderNotAllowed { .. } => "PLACEHOLDER_NOT_ALLOWED",
            PermissionError::FieldNotAllowed { .. } => "FIELD_NOT_ALLOWED",
            PermissionError::AssignTypeNotAllowed { .. } => "ASSIGN_TYPE_NOT_ALLOWED",
            PermissionError::ChainTypeNotAllowed { .. } => "CHAIN_TYPE_NOT_ALLOWED",
            PermissionError::ClosureVeto { .. } => "CLOSURE_VETO",
        }
    }
}

// =============================================================================
// Request Errors
// =============================================================================

/// Errors caused by malformed front-end input
#[derive(Debug, Error)]
pub enum RequestError {
    /// Field names must be `alias.column`
    #[error("Fields must be passed as [table alias].[field name]. field = {field}")]
    MalformedField { field: String },

    /// Operator outside of the safe whitelist
    #[error("Requested operator is not safe to use. operator = {operator}")]
    UnsafeOperator { operator: String },

    /// Operator received the wrong number of arguments
    #[error("Operator '{operator}' expects {expected} argument(s), got {actual}")]
    InvalidArguments {
        operator: String,
        expected: String,
        actual: usize,
    },

    /// Order direction is neither ASC nor DESC
    #[error("Invalid order direction '{direction}' for field {field}")]
    InvalidDirection { field: String, direction: String },

    /// Unknown assign type in an association request
    #[error("Unknown assign type. assignType = {assign_type}")]
    UnknownAssignType { assign_type: String },

    /// Unknown chain type in an association request
    #[error("Unknown chain type. chainType = {chain_type}")]
    UnknownChainType { chain_type: String },

    /// Params have the wrong shape for the action
    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    /// Referenced entity does not exist
    #[error("{entity_type} with id '{id}' not found")]
    EntityNotFound { entity_type: String, id: String },
}

impl RequestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RequestError::EntityNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            RequestError::MalformedField { .. } => "MALFORMED_FIELD",
            RequestError::UnsafeOperator { .. } => "UNSAFE_OPERATOR",
            RequestError::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            RequestError::InvalidDirection { .. } => "INVALID_DIRECTION",
            RequestError::UnknownAssignType { .. } => "UNKNOWN_ASSIGN_TYPE",
            RequestError::UnknownChainType { .. } => "UNKNOWN_CHAIN_TYPE",
            RequestError::InvalidParams { .. } => "INVALID_PARAMS",
            RequestError::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
        }
    }
}

// =============================================================================
// Limit Errors
// =============================================================================

/// Row, batch and parameter limits
#[derive(Debug, Error)]
pub enum LimitError {
    /// Requested row limit exceeds the configured maximum
    #[error("Requested limit greater than max. limit = {limit}, max = {max_limit}")]
    LimitExceeded { limit: u64, max_limit: u64 },

    /// Too many entities in one mutation batch
    #[error("Batch too large. size = {size}, max = {batch_max}")]
    BatchTooLarge { size: usize, batch_max: u64 },

    /// Too many front-end conditions and placeholders
    #[error("Too many query params. count = {count}, max = {max}")]
    TooManyParams { count: usize, max: u64 },
}

impl LimitError {
    pub fn error_code(&self) -> &'static str {
        match self {
            LimitError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            LimitError::BatchTooLarge { .. } => "BATCH_TOO_LARGE",
            LimitError::TooManyParams { .. } => "TOO_MANY_PARAMS",
        }
    }
}

// =============================================================================
// Enforcement / Validation Errors
// =============================================================================

/// A field is not set to its enforced value
#[derive(Debug, Error)]
pub enum EnforcementError {
    #[error("A field is not set to it's enforced value. field = {field}")]
    Violation {
        field: String,
        expected: Value,
        actual: Value,
    },
}

/// The validation collaborator rejected the values
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Validation failed on '{entity_type}': {}", messages.join(", "))]
    Failed {
        entity_type: String,
        messages: Vec<String>,
    },
}

impl From<anyhow::Error> for GateError {
    fn from(err: anyhow::Error) -> Self {
        // Preserve typed errors that travelled through an anyhow boundary
        match err.downcast::<GateError>() {
            Ok(gate) => gate,
            Err(other) => GateError::Execution(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_not_allowed_display() {
        let err = GateError::Permission(PermissionError::OperatorNotAllowed {
            field: "t.age".to_string(),
            operator: "gt".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Operator not allowed. field = t.age, operator = gt"
        );
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(err.error_code(), "OPERATOR_NOT_ALLOWED");
    }

    #[test]
    fn test_limit_exceeded_details() {
        let err = GateError::from(LimitError::LimitExceeded {
            limit: 150,
            max_limit: 100,
        });
        let details = err.details().expect("limit errors carry details");
        assert_eq!(details["limit"], 150);
        assert_eq!(details["max_limit"], 100);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_entity_not_found_is_404() {
        let err = GateError::from(RequestError::EntityNotFound {
            entity_type: "album".to_string(),
            id: "7".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_typed_error() {
        let typed = GateError::from(RequestError::UnsafeOperator {
            operator: "orWhere".to_string(),
        });
        let wrapped: anyhow::Error = typed.into();
        match GateError::from(wrapped) {
            GateError::Request(RequestError::UnsafeOperator { operator }) => {
                assert_eq!(operator, "orWhere")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_plain_anyhow_becomes_execution() {
        let err = GateError::from(anyhow::anyhow!("connection reset"));
        assert!(matches!(err, GateError::Execution(_)));
        assert_eq!(err.error_code(), "EXECUTION_ERROR");
    }

    #[test]
    fn test_error_response_serialization() {
        let err = GateError::from(PermissionError::PlaceholderNotAllowed {
            name: "secret".to_string(),
        });
        let body = serde_json::to_value(err.to_response()).unwrap();
        assert_eq!(body["code"], "PLACEHOLDER_NOT_ALLOWED");
        assert!(body.get("details").is_none());
    }
}
