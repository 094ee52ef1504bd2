//! Integration tests for permission-gated reads
//!
//! These tests verify that:
//! - The base configuration filter always applies
//! - Front-end filters, ordering and placeholders are checked field by field
//! - Limits, pagination and result shaping follow the layered options

use axum::http::StatusCode;
use gatehouse::config::ReadPermissions;
use gatehouse::prelude::*;

const CATALOG: &str = r#"
entities:
  album:
    read:
      query:
        where:
          published:
            value: { expr: eq, arguments: [t.published, ":published"] }
      settings:
        placeholders:
          published: { value: true }
      permissions:
        maxLimit: 50
        where:
          fields:
            t.name:
              operators: { eq: true, like: true }
            t.year:
              permissive: true
              operators: { between: false }
        orderBy:
          permissive: true
          fields:
            t.year:
              directions: { DESC: false }
  artist:
    read:
      permissions:
        allowed: { "$call": is_admin }
"#;

fn registry() -> (RepositoryRegistry, InMemoryPersistence) {
    let backend = InMemoryPersistence::new();
    backend
        .seed(
            "album",
            vec![
                json!({"id": "a1", "name": "Blue", "year": 1971, "published": true}),
                json!({"id": "a2", "name": "Blonde", "year": 2016, "published": true}),
                json!({"id": "a3", "name": "Hejira", "year": 1976, "published": true}),
                json!({"id": "a4", "name": "Draft", "year": 2020, "published": false}),
            ],
        )
        .unwrap();
    backend
        .seed("artist", vec![json!({"id": "joni", "name": "Joni Mitchell"})])
        .unwrap();

    let registry = RepositoryRegistry::builder()
        .with_config(GatewayConfig::from_yaml_str(CATALOG).unwrap())
        .with_persistence(backend.clone())
        .register_callable("is_admin", |_, ctx| {
            Ok(json!(ctx.lookup("optionOverrides.role") == Some(&json!("admin"))))
        })
        .build()
        .unwrap();
    (registry, backend)
}

fn read(registry: &RepositoryRegistry, front_end: FrontEndOptions) -> GateResult<ReadOutcome> {
    registry
        .repository("album")?
        .read(json!({}), front_end, CallOptions::new())
}

fn names(outcome: &ReadOutcome) -> Vec<String> {
    outcome
        .rows()
        .iter()
        .map(|row| row["name"].as_str().unwrap_or_default().to_string())
        .collect()
}

// =============================================================================
// Base filter
// =============================================================================

#[test]
fn test_base_filter_hides_unpublished() {
    let (registry, _) = registry();
    let outcome = read(&registry, FrontEndOptions::new()).unwrap();
    assert_eq!(names(&outcome), vec!["Blue", "Blonde", "Hejira"]);
}

#[test]
fn test_front_end_filter_narrows() {
    let (registry, _) = registry();
    let front_end =
        FrontEndOptions::new().with_where(FilterCondition::new("t.name", "like", vec![json!("Bl%")]));
    let outcome = read(&registry, front_end).unwrap();
    assert_eq!(names(&outcome), vec!["Blue", "Blonde"]);
}

#[test]
fn test_or_condition_cannot_widen_base_filter() {
    let (registry, _) = registry();
    let front_end = FrontEndOptions::new().with_where(
        FilterCondition::new("t.name", "eq", vec![json!("Draft")]).with_type(ConditionType::Or),
    );
    let outcome = read(&registry, front_end).unwrap();
    assert!(outcome.rows().is_empty());
}

// =============================================================================
// Operator permissions
// =============================================================================

#[test]
fn test_operator_not_in_field_allow_list() {
    let (registry, _) = registry();
    let front_end =
        FrontEndOptions::new().with_where(FilterCondition::new("t.name", "neq", vec![json!("Blue")]));
    let err = read(&registry, front_end).unwrap_err();
    assert_eq!(err.to_string(), "Operator not allowed. field = t.name, operator = neq");
    assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
}

#[test]
fn test_permissive_field_allows_unlisted_operator() {
    let (registry, _) = registry();
    let front_end =
        FrontEndOptions::new().with_where(FilterCondition::new("t.year", "gt", vec![json!(2000)]));
    let outcome = read(&registry, front_end).unwrap();
    assert_eq!(names(&outcome), vec!["Blonde"]);
}

#[test]
fn test_explicit_field_denial_beats_permissive_flag() {
    let (registry, _) = registry();
    let front_end = FrontEndOptions::new().with_where(FilterCondition::new(
        "t.year",
        "between",
        vec![json!(1970), json!(1980)],
    ));
    let err = read(&registry, front_end).unwrap_err();
    assert_eq!(err.error_code(), "OPERATOR_NOT_ALLOWED");
}

#[test]
fn test_unlisted_field_denied() {
    let (registry, _) = registry();
    let front_end =
        FrontEndOptions::new().with_where(FilterCondition::new("t.genre", "eq", vec![json!("folk")]));
    let err = read(&registry, front_end).unwrap_err();
    assert_eq!(err.to_string(), "Operator not allowed. field = t.genre, operator = eq");
}

#[test]
fn test_structure_checked_before_permissions() {
    let (registry, _) = registry();
    let front_end = FrontEndOptions::new()
        .with_where(FilterCondition::new("t.genre", "eq", vec![json!("folk")]))
        .with_where(FilterCondition::new("name", "eq", vec![json!("Blue")]));
    let err = read(&registry, front_end).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Fields must be passed as [table alias].[field name]. field = name"
    );
}

#[test]
fn test_unsafe_operator_rejected() {
    let (registry, _) = registry();
    let front_end =
        FrontEndOptions::new().with_where(FilterCondition::new("t.name", "regexp", vec![json!(".*")]));
    let err = read(&registry, front_end).unwrap_err();
    assert_eq!(err.error_code(), "UNSAFE_OPERATOR");
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
}

#[test]
fn test_nested_group_conditions_checked() {
    let (registry, _) = registry();
    let group = FilterCondition::group(
        "orX",
        vec![
            FilterCondition::new("t.name", "eq", vec![json!("Blue")]),
            FilterCondition::new("t.name", "eq", vec![json!("Hejira")]),
        ],
    );
    let outcome = read(&registry, FrontEndOptions::new().with_where(group)).unwrap();
    assert_eq!(names(&outcome), vec!["Blue", "Hejira"]);

    let denied = FilterCondition::group(
        "andX",
        vec![FilterCondition::new("t.secret", "eq", vec![json!(1)])],
    );
    let err = read(&registry, FrontEndOptions::new().with_where(denied)).unwrap_err();
    assert_eq!(err.error_code(), "OPERATOR_NOT_ALLOWED");
}

// =============================================================================
// Ordering, limits and shaping
// =============================================================================

#[test]
fn test_order_by_direction_permission() {
    let (registry, _) = registry();
    let outcome = read(&registry, FrontEndOptions::new().with_order_by("t.year", "ASC")).unwrap();
    assert_eq!(names(&outcome), vec!["Blue", "Hejira", "Blonde"]);

    let err = read(&registry, FrontEndOptions::new().with_order_by("t.year", "DESC")).unwrap_err();
    assert_eq!(err.to_string(), "Order by not allowed. field = t.year, direction = DESC");
}

#[test]
fn test_limit_above_configured_max() {
    let (registry, _) = registry();
    let err = read(&registry, FrontEndOptions::new().with_limit(51)).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Requested limit greater than max. limit = 51, max = 50"
    );
    assert!(read(&registry, FrontEndOptions::new().with_limit(50)).is_ok());
}

#[test]
fn test_pagination_count_ignores_window() {
    let (registry, _) = registry();
    let front_end = FrontEndOptions::new()
        .with_order_by("t.year", "ASC")
        .with_limit(2)
        .with_offset(1);
    let outcome = registry
        .repository("album")
        .unwrap()
        .read(json!({}), front_end, CallOptions::new().with("paginate", true))
        .unwrap();

    match outcome {
        ReadOutcome::Page {
            count,
            rows,
            pagination,
        } => {
            assert_eq!(count, Some(3));
            assert_eq!(rows.len(), 2);
            let pagination = pagination.unwrap();
            assert!(pagination.has_next);
            assert!(!pagination.has_prev);
        }
        other => panic!("expected a page, got {:?}", other),
    }
}

#[test]
fn test_offset_past_the_end() {
    let (registry, _) = registry();
    let front_end = FrontEndOptions::new().with_offset(u64::MAX);
    let outcome = registry
        .repository("album")
        .unwrap()
        .read(json!({}), front_end, CallOptions::new().with("paginate", true))
        .unwrap();

    match outcome {
        ReadOutcome::Page {
            count,
            rows,
            pagination,
        } => {
            assert_eq!(count, Some(3));
            assert!(rows.is_empty());
            let pagination = pagination.unwrap();
            assert!(!pagination.has_next);
            assert!(pagination.has_prev);
        }
        other => panic!("expected a page, got {:?}", other),
    }
}

#[test]
fn test_return_count_false_skips_count() {
    let (registry, _) = registry();
    let front_end = FrontEndOptions::new().with_return_count(false);
    let outcome = registry
        .repository("album")
        .unwrap()
        .read(json!({}), front_end, CallOptions::new().with("paginate", true))
        .unwrap();
    assert!(matches!(outcome, ReadOutcome::Page { count: None, .. }));
}

#[test]
fn test_hydrate_false_returns_query() {
    let (registry, backend) = registry();
    backend.clear_calls();
    let front_end =
        FrontEndOptions::new().with_where(FilterCondition::new("t.name", "eq", vec![json!("Blue")]));
    let outcome = registry
        .repository("album")
        .unwrap()
        .read(json!({}), front_end, CallOptions::new().with("hydrate", false))
        .unwrap();

    let query = outcome.query().expect("unexecuted query");
    assert_eq!(query.parameter("published"), Some(&json!(true)));
    assert_eq!(query.parameter("frontEndParam0"), Some(&json!("Blue")));
    assert!(matches!(query.where_clause, Some(Expr::And { .. })));
    assert!(backend.calls().is_empty());
}

// =============================================================================
// Placeholders and action gate
// =============================================================================

#[test]
fn test_front_end_placeholder_denied_by_default() {
    let (registry, _) = registry();
    let front_end = FrontEndOptions::new().with_placeholder("published", json!(false));
    let err = read(&registry, front_end).unwrap_err();
    assert_eq!(err.to_string(), "Placeholder not allowed. placeholder = published");
}

#[test]
fn test_front_end_placeholder_wins_when_allowed() {
    let (registry, _) = registry();
    let permissions: ReadPermissions = serde_yaml::from_str(
        "placeholders:\n  placeholderNames:\n    published:\n      allowed: true\n",
    )
    .unwrap();
    let front_end = FrontEndOptions::new().with_placeholder("published", json!(false));
    let outcome = registry
        .repository("album")
        .unwrap()
        .read(json!({}), front_end, CallOptions::new().with_permissions(permissions))
        .unwrap();
    assert_eq!(names(&outcome), vec!["Draft"]);
}

#[test]
fn test_front_end_placeholder_cannot_shadow_generated_params() {
    let (registry, _) = registry();
    let permissions: ReadPermissions =
        serde_yaml::from_str("placeholders:\n  permissive: true\n").unwrap();
    let front_end = FrontEndOptions::new()
        .with_where(FilterCondition::new("t.name", "eq", vec![json!("Blue")]))
        .with_placeholder("frontEndParam0", json!("Draft"));

    let err = registry
        .repository("album")
        .unwrap()
        .read(json!({}), front_end, CallOptions::new().with_permissions(permissions))
        .unwrap_err();
    assert_eq!(err.error_code(), "PLACEHOLDER_NOT_ALLOWED");
    assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
}

#[test]
fn test_dynamic_action_gate() {
    let (registry, _) = registry();
    let artists = registry.repository("artist").unwrap();

    let err = artists
        .read(json!({}), FrontEndOptions::new(), CallOptions::new().with("role", "guest"))
        .unwrap_err();
    assert_eq!(err.error_code(), "ACTION_NOT_ALLOWED");

    let outcome = artists
        .read(json!({}), FrontEndOptions::new(), CallOptions::new().with("role", "admin"))
        .unwrap();
    assert_eq!(outcome.rows().len(), 1);
}

#[test]
fn test_unknown_entity_type() {
    let (registry, _) = registry();
    let err = registry.repository("label").err().unwrap();
    assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
}
