//! Tests for configuration loading and call-time layering
//!
//! These tests verify that:
//! - YAML files, YAML strings and JSON strings produce the same configuration
//! - Merged configurations replace whole entity types
//! - Dynamic `$call` values resolve per call
//! - Call options override entity options, which override defaults

use gatehouse::prelude::*;
use gatehouse::core::Validator;
use indexmap::IndexMap;
use serde_json::Map;
use tempfile::TempDir;

const YAML: &str = r#"
entities:
  album:
    read:
      options:
        paginate: { "$call": ctx, args: [optionOverrides.wantPage] }
      settings:
        placeholders:
          published: { value: true }
      query:
        where:
          published:
            value: { expr: eq, arguments: [t.published, ":published"] }
      permissions:
        where:
          fields:
            t.name:
              operators: { eq: true }
    create:
      permissive: true
      settings:
        validate:
          rules:
            name: required
"#;

fn backend() -> InMemoryPersistence {
    let backend = InMemoryPersistence::new();
    backend
        .seed(
            "album",
            vec![
                json!({"id": "a1", "name": "Blue", "published": true}),
                json!({"id": "a2", "name": "Draft", "published": false}),
            ],
        )
        .unwrap();
    backend
}

fn registry(config: GatewayConfig) -> RepositoryRegistry {
    RepositoryRegistry::builder()
        .with_config(config)
        .with_persistence(backend())
        .build()
        .unwrap()
}

// =============================================================================
// Loading
// =============================================================================

#[test]
fn test_yaml_file_loading() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("gateway.yaml");
    std::fs::write(&path, YAML).unwrap();

    let config = GatewayConfig::from_yaml_file(path.to_str().unwrap()).unwrap();

    let album = config.entity("album").unwrap();
    assert_eq!(album.alias, "t");
    assert!(album.read.settings.placeholders.contains_key("published"));
}

#[test]
fn test_missing_file() {
    let err = GatewayConfig::from_yaml_file("/nonexistent/gatehouse.yaml").unwrap_err();
    assert!(matches!(err, ConfigError::ParseError { .. }));
}

#[test]
fn test_json_and_yaml_agree() {
    let from_yaml = GatewayConfig::from_yaml_str(YAML).unwrap();
    let as_json = serde_json::to_string(&from_yaml).unwrap();
    let from_json = GatewayConfig::from_json_str(&as_json).unwrap();

    assert_eq!(
        serde_json::to_value(&from_yaml).unwrap(),
        serde_json::to_value(&from_json).unwrap()
    );
}

#[test]
fn test_builder_merges_configs() {
    let extra = GatewayConfig::default().with_entity("artist", EntityConfig::default());
    let registry = RepositoryRegistry::builder()
        .with_config(GatewayConfig::from_yaml_str(YAML).unwrap())
        .with_config(extra)
        .with_persistence(backend())
        .build()
        .unwrap();

    assert!(registry.repository("album").is_ok());
    assert!(registry.repository("artist").is_ok());
    assert_eq!(registry.config().entities.len(), 2);
}

// =============================================================================
// Layering
// =============================================================================

#[test]
fn test_dynamic_entity_option() {
    let registry = registry(GatewayConfig::from_yaml_str(YAML).unwrap());
    let albums = registry.repository("album").unwrap();

    let plain = albums
        .read(json!({}), FrontEndOptions::new(), CallOptions::new().with("wantPage", false))
        .unwrap();
    assert!(matches!(plain, ReadOutcome::Rows { .. }));

    let paged = albums
        .read(json!({}), FrontEndOptions::new(), CallOptions::new().with("wantPage", true))
        .unwrap();
    assert!(matches!(paged, ReadOutcome::Page { .. }));
}

#[test]
fn test_call_option_beats_entity_option() {
    let registry = registry(GatewayConfig::from_yaml_str(YAML).unwrap());
    let outcome = registry
        .repository("album")
        .unwrap()
        .read(
            json!({}),
            FrontEndOptions::new(),
            CallOptions::new().with("wantPage", true).with("paginate", false),
        )
        .unwrap();
    assert!(matches!(outcome, ReadOutcome::Rows { .. }));
}

#[test]
fn test_call_placeholder_beats_config_placeholder() {
    let registry = registry(GatewayConfig::from_yaml_str(YAML).unwrap());
    let outcome = registry
        .repository("album")
        .unwrap()
        .read(
            json!({}),
            FrontEndOptions::new(),
            CallOptions::new().with_placeholder("published", PlaceholderConfig::new(false)),
        )
        .unwrap();
    assert_eq!(outcome.rows().len(), 1);
    assert_eq!(outcome.rows()[0]["name"], "Draft");
}

// =============================================================================
// Collaborators
// =============================================================================

struct RejectEverything;

impl Validator for RejectEverything {
    fn validate(
        &self,
        _values: &Map<String, Value>,
        rules: &IndexMap<String, String>,
        _messages: &IndexMap<String, String>,
        _custom_attributes: &IndexMap<String, String>,
    ) -> Result<(), Vec<String>> {
        Err(rules.keys().map(|field| format!("{} rejected", field)).collect())
    }
}

#[test]
fn test_custom_validator() {
    let registry = RepositoryRegistry::builder()
        .with_config(GatewayConfig::from_yaml_str(YAML).unwrap())
        .with_persistence(backend())
        .with_validator(RejectEverything)
        .build()
        .unwrap();

    let err = registry
        .repository("album")
        .unwrap()
        .create(json!([{"name": "Blue"}]), CallOptions::new(), FrontEndOptions::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "Validation failed on 'album': name rejected");
}

#[test]
fn test_persistence_is_required() {
    let err = RepositoryRegistry::builder()
        .with_config(GatewayConfig::from_yaml_str(YAML).unwrap())
        .build()
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
}
