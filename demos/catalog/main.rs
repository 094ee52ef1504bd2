//! Music catalog served over Axum
//!
//! This example demonstrates:
//! - Loading a permission configuration from YAML
//! - Reading through flat GET parameters with the `GetParams` extractor
//! - Nested creates across associations with per-relation chain permissions
//! - Dynamic settings resolved from call options (`$call`)
//!
//! Try it:
//!
//! ```text
//! curl 'http://127.0.0.1:3000/albums?and_where_like_t-name=Bl%25&orderBy_t-year=ASC'
//! curl 'http://127.0.0.1:3000/albums?option_limit=500'
//! curl -X POST http://127.0.0.1:3000/albums -H 'content-type: application/json' \
//!   -d '[{"name":"Hejira","artist":"joni","tracks":{"create":[{"title":" Coyote "}]}}]'
//! ```

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use gatehouse::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const CATALOG: &str = r#"
entities:
  artist:
    read:
      permissions:
        where:
          permissive: true
  track:
    create:
      permissive: true
      fields:
        title:
          settings:
            mutate: { "$call": trim, args: [{ "$call": ctx, args: [value] }] }
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
        maxLimit: 100
        where:
          fields:
            t.name:
              operators: { eq: true, like: true }
            t.year:
              permissive: true
        orderBy:
          permissive: true
    create:
      permissive: true
      fields:
        ownerId:
          allowed: false
        artist:
          chain: { read: true }
        tracks:
          chain: { create: true, read: true }
      settings:
        setTo:
          ownerId: { "$call": ctx, args: [optionOverrides.userId] }
          published: true
        validate:
          rules:
            name: required
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
    // A real service would take the user from its auth layer
    let records = registry.repository("album")?.create(
        params,
        CallOptions::new().with("userId", 1),
        FrontEndOptions::new(),
    )?;
    Ok(Json(records))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gatehouse=debug")),
        )
        .init();

    println!("🎵 Gatehouse Catalog Example");
    println!("============================\n");

    let backend = InMemoryPersistence::new()
        .with_association("album", Association::to_one("artist", "artist"))
        .with_association("album", Association::to_many("tracks", "track"));
    backend.seed(
        "artist",
        vec![
            json!({"id": "joni", "name": "Joni Mitchell"}),
            json!({"id": "frank", "name": "Frank Ocean"}),
        ],
    )?;
    backend.seed(
        "album",
        vec![
            json!({"id": "a1", "name": "Blue", "year": 1971, "published": true, "artist": "joni", "tracks": []}),
            json!({"id": "a2", "name": "Blonde", "year": 2016, "published": true, "artist": "frank", "tracks": []}),
            json!({"id": "a3", "name": "Untitled demo", "year": 2020, "published": false, "artist": null, "tracks": []}),
        ],
    )?;

    let config = GatewayConfig::from_yaml_str(CATALOG)?;
    println!("✅ Loaded configuration for {} entity types", config.entities.len());

    let registry = Arc::new(
        RepositoryRegistry::builder()
            .with_config(config)
            .with_persistence(backend)
            .build()?,
    );

    let app = Router::new()
        .route("/albums", get(list_albums).post(create_albums))
        .with_state(registry);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    println!("🌐 Listening on http://{}", addr);
    println!("   GET  /albums   flat GET filters, ordering and paging");
    println!("   POST /albums   nested creates\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
