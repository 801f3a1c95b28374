//! Config file → running app → status report.

use std::io::Write;

use coordination::ServiceStatus;
use rag_agent::config::ExtractorKind;
use rag_agent::{build_app, RagConfig};

const CONFIG: &str = r#"
[gateway]
failure_threshold = 2
cooldown_ms = 1000

[[gateway.providers]]
name = "local"
base_url = "http://127.0.0.1:1/v1"
model = "test-model"
tier = "flash"

[memory]
extractor = "pattern"
collective_min_users = 3
collective_capacity = 500

[orchestrator]
verify_answers = true
"#;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_config_file_round_trip() {
    let file = write_config(CONFIG);
    let config = RagConfig::from_file(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.gateway.settings.failure_threshold, 2);
    assert_eq!(config.gateway.providers.len(), 1);
    assert_eq!(config.gateway.providers[0].endpoint.name, "local");
    assert_eq!(config.memory.extractor, ExtractorKind::Pattern);
    assert_eq!(config.memory.collective_min_users, 3);
    assert_eq!(config.memory.collective_capacity, 500);
    assert!(config.orchestrator.verify_answers);
    // Untouched sections keep their defaults.
    assert_eq!(config.memory.settings.read_concurrency, 10);
}

#[test]
fn test_missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = RagConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn test_malformed_config_file_is_an_error() {
    let file = write_config("[gateway\nfailure_threshold = ");
    assert!(RagConfig::from_file(file.path()).is_err());
}

#[tokio::test]
async fn test_app_from_config_reports_status() {
    let file = write_config(CONFIG);
    let config = RagConfig::from_file(file.path()).unwrap();
    let app = build_app(&config).await.unwrap();

    let report = app.probe.report().await;
    assert_eq!(report.components.memory, ServiceStatus::Healthy);
    assert_eq!(report.components.gateway, ServiceStatus::Healthy);
    assert_eq!(report.components.search, ServiceStatus::Healthy);
    assert_eq!(report.status, ServiceStatus::Healthy);
    assert!(report.providers.contains_key("local"));
    // Nothing listens on port 1.
    assert_eq!(report.endpoints.get("local"), Some(&false));
    assert_eq!(report.write_queue.map(|q| q.enqueued), Some(0));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "HEALTHY");

    app.shutdown().await;
}
