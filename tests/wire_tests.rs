//! Tests for the alternative wire encodings
//!
//! These tests verify that:
//! - The GetParams extractor decodes flat query strings
//! - Decoded GET input goes through the same permission checks
//! - Simplified mutation params expand into chains

use axum::extract::FromRequestParts;
use axum::http::{Request, StatusCode};
use gatehouse::core::wire::{GetParams, normalize_simplified};
use gatehouse::prelude::*;

const CATALOG: &str = r#"
entities:
  album:
    read:
      permissions:
        where:
          fields:
            t.name:
              operators: { like: true }
        orderBy:
          permissive: true
"#;

async fn extract(uri: &str) -> Result<FrontEndOptions, GateError> {
    let (mut parts, _) = Request::builder().uri(uri).body(()).unwrap().into_parts();
    let GetParams(front_end) = GetParams::from_request_parts(&mut parts, &()).await?;
    Ok(front_end)
}

fn registry() -> RepositoryRegistry {
    let backend = InMemoryPersistence::new()
        .with_association("album", Association::to_many("tracks", "track"))
        .with_association("track", Association::to_one("writer", "artist"));
    backend
        .seed(
            "album",
            vec![
                json!({"id": "a1", "name": "Blue"}),
                json!({"id": "a2", "name": "Blonde"}),
                json!({"id": "a3", "name": "Hejira"}),
            ],
        )
        .unwrap();
    RepositoryRegistry::builder()
        .with_config(GatewayConfig::from_yaml_str(CATALOG).unwrap())
        .with_persistence(backend)
        .build()
        .unwrap()
}

// =============================================================================
// GET extractor
// =============================================================================

#[tokio::test]
async fn test_extractor_decodes_query_string() {
    let front_end = extract("/albums?and_where_like_t-name=Bl%25&orderBy_t-name=DESC&option_limit=5")
        .await
        .unwrap();

    assert_eq!(front_end.query.where_clause.len(), 1);
    assert_eq!(front_end.query.where_clause[0].arguments, vec![json!("Bl%")]);
    assert_eq!(front_end.options.limit, Some(5));
    assert_eq!(front_end.options.use_get_params, Some(true));

    let outcome = registry()
        .repository("album")
        .unwrap()
        .read(json!({}), front_end, CallOptions::new())
        .unwrap();
    let names: Vec<&str> = outcome
        .rows()
        .iter()
        .filter_map(|row| row["name"].as_str())
        .collect();
    assert_eq!(names, vec!["Blue", "Blonde"]);
}

#[tokio::test]
async fn test_extractor_without_query() {
    let front_end = extract("/albums").await.unwrap();
    assert!(front_end.query.where_clause.is_empty());
    assert_eq!(front_end.options.use_get_params, Some(true));
}

#[tokio::test]
async fn test_extractor_rejects_unsafe_operator() {
    let err = extract("/albums?and_where_drop_t-name=x").await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(err.error_code(), "UNSAFE_OPERATOR");
}

#[tokio::test]
async fn test_decoded_input_is_permission_checked() {
    let front_end = extract("/albums?and_where_eq_t-name=Blue").await.unwrap();
    let err = registry()
        .repository("album")
        .unwrap()
        .read(json!({}), front_end, CallOptions::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "Operator not allowed. field = t.name, operator = eq");
}

// =============================================================================
// Simplified params
// =============================================================================

#[test]
fn test_simplified_create_infers_chains() {
    let registry = registry();
    let normalized = normalize_simplified(
        registry.persistence(),
        "album",
        ChainType::Create,
        json!({
            "name": "Hejira",
            "tracks": [
                {"title": "Coyote", "writer": {"id": "joni"}},
                {"id": "t9"},
                {"id": "t8", "title": "Renamed"}
            ]
        }),
    )
    .unwrap();

    assert_eq!(
        normalized,
        json!([{
            "name": "Hejira",
            "tracks": {
                "create": [{
                    "title": "Coyote",
                    "assignType": "addSingle",
                    "writer": {"read": {"joni": {"assignType": "set"}}}
                }],
                "read": {"t9": {"assignType": "addSingle"}},
                "update": {"t8": {"title": "Renamed", "assignType": "addSingle"}}
            }
        }])
    );
}

#[test]
fn test_simplified_update_keys_by_id() {
    let registry = registry();
    let normalized = normalize_simplified(
        registry.persistence(),
        "album",
        ChainType::Update,
        json!([{"id": "a1", "name": "Blue"}, "a2"]),
    )
    .unwrap();
    assert_eq!(normalized, json!({"a1": {"name": "Blue"}, "a2": {}}));
}

#[test]
fn test_simplified_explicit_types_win() {
    let registry = registry();
    let normalized = normalize_simplified(
        registry.persistence(),
        "album",
        ChainType::Update,
        json!([{"id": "a1", "tracks": [{"id": "t1", "chainType": "delete"}, {"id": "t2", "assignType": "removeSingle"}]}]),
    )
    .unwrap();
    assert_eq!(
        normalized["a1"]["tracks"],
        json!({
            "delete": {"t1": {}},
            "read": {"t2": {"assignType": "removeSingle"}}
        })
    );
}

#[test]
fn test_simplified_update_requires_id() {
    let registry = registry();
    let err = normalize_simplified(
        registry.persistence(),
        "album",
        ChainType::Update,
        json!([{"name": "Blue"}]),
    )
    .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_PARAMS");
}
