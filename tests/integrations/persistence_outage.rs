//! Backend outages against a fake InfluxDB: fallback, recovery and resync.

#[path = "../helpers/mod.rs"]
mod helpers;

use helpers::app::TestAppBuilder;
use helpers::{eventually, process_tree};
use hostwatch::core::MetricValue;
use hostwatch::persistence::test_utils::FakeBackend;
use hostwatch::persistence::{InfluxBackend, Point, TimeSeriesBackend};
use hostwatch::providers::ScriptedProvider;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(10);

fn influx_builder(server: &MockServer) -> TestAppBuilder {
    let mut builder = TestAppBuilder::new();
    builder.config.backend.url = server.uri();
    builder.config.backend.token = Some("t0k3n".to_string());
    builder.config.persistence.max_attempts = 2;
    let backend = InfluxBackend::new(&builder.config.backend).unwrap();
    builder.with_backend_arc(Arc::new(backend) as Arc<dyn TimeSeriesBackend>)
}

async fn mount_unavailable(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v2/write"))
        .respond_with(ResponseTemplate::new(503).set_body_string("service unavailable"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(server)
        .await;
}

async fn write_bodies(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == "/api/v2/write")
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .collect()
}

#[tokio::test]
async fn test_outage_goes_to_fallback_and_recovery_replays_it() {
    helpers::init_tracing();
    let server = MockServer::start().await;
    mount_unavailable(&server).await;

    let mut app = influx_builder(&server)
        .with_provider(
            "process",
            ScriptedProvider::constant(process_tree(7, 0.5)),
            Duration::from_millis(50),
        )
        .build()
        .await
        .unwrap();

    let client = app.persistence().clone();
    eventually(WAIT, || !client.is_reachable() && client.fallback_pending() >= 3).await;

    // The backend comes back.
    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/write"))
        .and(query_param("bucket", "metrics"))
        .and(query_param("precision", "ns"))
        .and(header("Authorization", "Token t0k3n"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    eventually(WAIT, || client.is_reachable() && client.fallback_pending() == 0).await;

    let bodies = write_bodies(&server).await;
    assert!(!bodies.is_empty());
    // Replayed points keep the integer kind they were sampled with.
    assert!(bodies.iter().all(|b| b.contains("process_pid=7i")));
    assert!(bodies.iter().all(|b| b.contains("process_cpu_value=0.5")));

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_schema_conflict_drops_points_without_fallback() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/write"))
        .respond_with(ResponseTemplate::new(422).set_body_string(
            r#"{"code":"unprocessable entity","message":"partial write: field type conflict: input field \"process_pid\" on measurement \"process\" is type float, already exists as type integer dropped=1"}"#,
        ))
        .mount(&server)
        .await;

    let mut app = influx_builder(&server)
        .with_provider(
            "process",
            ScriptedProvider::constant(process_tree(7, 0.5)),
            Duration::from_millis(50),
        )
        .build()
        .await
        .unwrap();

    let client = app.persistence().clone();
    let server_ref = &server;
    tokio::time::timeout(WAIT, async {
        while write_bodies(server_ref).await.len() < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // Permanent errors are not retried into the fallback log.
    assert!(client.is_reachable());
    assert_eq!(client.fallback_pending(), 0);

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_unsent_points_survive_shutdown_in_fallback_log() {
    let backend = FakeBackend::new();
    backend.set_unreachable(true);

    let mut app = TestAppBuilder::new()
        .with_provider(
            "process",
            ScriptedProvider::constant(process_tree(99, 1.25)),
            Duration::from_millis(50),
        )
        .with_backend(backend.clone())
        .build()
        .await
        .unwrap();

    let client = app.persistence().clone();
    eventually(WAIT, || client.fallback_pending() >= 2).await;
    let fallback_path = app.fallback_path.clone();
    app.shutdown(WAIT).await.unwrap();

    let contents = std::fs::read_to_string(&fallback_path).unwrap();
    let points: Vec<Point> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(points.len() >= 2);
    for point in &points {
        assert_eq!(point.fields.get("process_pid"), Some(&MetricValue::Integer(99)));
        assert_eq!(point.fields.get("process_cpu_value"), Some(&MetricValue::Real(1.25)));
    }
    assert!(backend.written().is_empty());
}
