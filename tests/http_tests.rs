//! End-to-end tests through an Axum router
//!
//! These tests verify that:
//! - GET query strings reach the compiler through the GetParams extractor
//! - Read outcomes and records serialize as JSON responses
//! - Errors become status codes with a code/message body

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use axum_test::TestServer;
use gatehouse::prelude::*;
use std::sync::Arc;

const CATALOG: &str = r#"
entities:
  album:
    read:
      permissions:
        maxLimit: 20
        where:
          fields:
            t.year:
              operators: { gte: true, lt: true }
        orderBy:
          permissive: true
    create:
      fields:
        name:
          allowed: true
"#;

type AppState = Arc<RepositoryRegistry>;

async fn list_albums(
    State(registry): State<AppState>,
    GetParams(front_end): GetParams,
) -> Result<ReadOutcome, GateError> {
    registry
        .repository("album")?
        .read(json!({}), front_end, CallOptions::new().with("paginate", true))
}

async fn create_albums(
    State(registry): State<AppState>,
    Json(params): Json<Value>,
) -> Result<Json<Vec<EntityRecord>>, GateError> {
    let records = registry
        .repository("album")?
        .create(params, CallOptions::new(), FrontEndOptions::new())?;
    Ok(Json(records))
}

fn create_test_server() -> (TestServer, InMemoryPersistence) {
    let backend = InMemoryPersistence::new();
    backend
        .seed(
            "album",
            vec![
                json!({"id": "a1", "name": "Blue", "year": 1971}),
                json!({"id": "a2", "name": "Hejira", "year": 1976}),
                json!({"id": "a3", "name": "Blonde", "year": 2016}),
            ],
        )
        .unwrap();

    let registry = RepositoryRegistry::builder()
        .with_config(GatewayConfig::from_yaml_str(CATALOG).unwrap())
        .with_persistence(backend.clone())
        .build()
        .unwrap();

    let app = Router::new()
        .route("/albums", get(list_albums).post(create_albums))
        .with_state(Arc::new(registry));

    let server = TestServer::try_new(app).expect("Failed to create test server");
    (server, backend)
}

// =============================================================================
// Reads
// =============================================================================

mod read_tests {
    use super::*;

    #[tokio::test]
    async fn test_filtered_page() {
        let (server, _) = create_test_server();

        let response = server
            .get("/albums?and_where_gte_t-year=1970&and_where_lt_t-year=2000&orderBy_t-year=DESC&option_limit=1")
            .await;
        response.assert_status_ok();

        let body: Value = response.json();
        assert_eq!(body["count"], 2);
        assert_eq!(body["rows"][0]["name"], "Hejira");
        assert_eq!(body["pagination"]["has_next"], true);
    }

    #[tokio::test]
    async fn test_denied_operator_is_forbidden() {
        let (server, _) = create_test_server();

        let response = server.get("/albums?and_where_eq_t-name=Blue").await;
        response.assert_status(StatusCode::FORBIDDEN);

        let body: Value = response.json();
        assert_eq!(body["code"], "OPERATOR_NOT_ALLOWED");
        assert_eq!(body["details"]["field"], "t.name");
    }

    #[tokio::test]
    async fn test_limit_above_max_is_bad_request() {
        let (server, _) = create_test_server();

        let response = server.get("/albums?option_limit=21").await;
        response.assert_status(StatusCode::BAD_REQUEST);

        let body: Value = response.json();
        assert_eq!(body["code"], "LIMIT_EXCEEDED");
    }
}

// =============================================================================
// Mutations
// =============================================================================

mod mutation_tests {
    use super::*;

    #[tokio::test]
    async fn test_create_returns_records() {
        let (server, backend) = create_test_server();

        let response = server.post("/albums").json(&json!([{"name": "Court and Spark"}])).await;
        response.assert_status_ok();

        let body: Value = response.json();
        assert_eq!(body[0]["fields"]["name"], "Court and Spark");
        assert!(body[0]["id"].as_str().is_some());
        assert_eq!(backend.rows("album").unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_unlisted_field_is_forbidden() {
        let (server, backend) = create_test_server();

        let response = server
            .post("/albums")
            .json(&json!([{"name": "Mingus", "year": 1979}]))
            .await;
        response.assert_status(StatusCode::FORBIDDEN);

        let body: Value = response.json();
        assert_eq!(body["code"], "FIELD_NOT_ALLOWED");
        assert_eq!(backend.rows("album").unwrap().len(), 3);
    }
}
