//! The HTTP and WebSocket consumer surface.

#[path = "../helpers/mod.rs"]
mod helpers;

use futures_util::StreamExt;
use helpers::app::TestAppBuilder;
use helpers::{cpu_tree, eventually, process_tree, wait_for_snapshot};
use hostwatch::alerts::{AlertRuleConfig, Operator};
use hostwatch::persistence::test_utils::FakeBackend;
use hostwatch::providers::{ScriptStep, ScriptedProvider};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_snapshot_and_status_endpoints() {
    let mut app = TestAppBuilder::new()
        .with_provider(
            "process",
            ScriptedProvider::constant(process_tree(4242, 2.5)),
            Duration::from_millis(50),
        )
        .with_backend(FakeBackend::new())
        .with_web()
        .build()
        .await
        .unwrap();
    wait_for_snapshot(&mut app.snapshots, WAIT, |s| s.domains.contains_key("process")).await;

    let base = format!("http://{}", app.web_addr());
    let snapshot: Value = reqwest::get(format!("{}/api/snapshot", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tree = &snapshot["domains"]["process"]["tree"];
    assert_eq!(tree["pid"].as_i64(), Some(4242));
    assert_eq!(tree["cpu"]["value"].as_f64(), Some(2.5));
    assert!(snapshot["captured_at"].is_string());

    let status: Value = reqwest::get(format!("{}/api/status", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["backend_reachable"], Value::Bool(true));
    assert_eq!(status["failing_providers"], serde_json::json!([]));

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_history_reads_back_persisted_samples() {
    let backend = FakeBackend::new();
    let mut app = TestAppBuilder::new()
        .with_provider(
            "process",
            ScriptedProvider::constant(process_tree(31, 0.75)),
            Duration::from_millis(50),
        )
        .with_backend(backend.clone())
        .with_web()
        .build()
        .await
        .unwrap();
    eventually(WAIT, || backend.written().len() >= 2).await;

    let url = format!("http://{}/api/history/process?minutes=5", app.web_addr());
    let response = reqwest::get(url).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let samples: Vec<Value> = response.json().await.unwrap();
    assert!(samples.len() >= 2);
    for sample in &samples {
        assert_eq!(sample["tree"]["pid"].as_i64(), Some(31));
        assert_eq!(sample["tree"]["threads"]["count"].as_i64(), Some(4));
    }

    // An outage is reported as unavailable, not as an empty history.
    backend.set_unreachable(true);
    let url = format!("http://{}/api/history/process", app.web_addr());
    let response = reqwest::get(url).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_history_without_backend_is_unavailable() {
    let mut app = TestAppBuilder::new()
        .with_provider(
            "cpu",
            ScriptedProvider::constant(cpu_tree(1.0)),
            Duration::from_millis(50),
        )
        .without_backend()
        .with_web()
        .build()
        .await
        .unwrap();

    let url = format!("http://{}/api/history/cpu", app.web_addr());
    let response = reqwest::get(url).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "persistence is disabled");

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_websocket_streams_snapshots_then_alerts() {
    let cpu = ScriptedProvider::new([ScriptStep::Sample(cpu_tree(10.0))]);
    let rule = AlertRuleConfig {
        name: "cpu-high".to_string(),
        metric: "cpu.average.cpu_percent".to_string(),
        operator: Operator::Gt,
        threshold: 80.0,
        critical_threshold: None,
        hysteresis: 1,
    };
    let mut app = TestAppBuilder::new()
        .with_provider("cpu", cpu.clone(), Duration::from_millis(40))
        .with_rules(vec![rule])
        .without_backend()
        .with_web()
        .build()
        .await
        .unwrap();
    wait_for_snapshot(&mut app.snapshots, WAIT, |s| s.domains.contains_key("cpu")).await;

    let (mut ws, _) = connect_async(format!("ws://{}/ws", app.web_addr()))
        .await
        .unwrap();

    let first = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    let first: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert_eq!(first["type"], "snapshot");
    assert_eq!(
        first["domains"]["cpu"]["tree"]["average"]["cpu_percent"].as_f64(),
        Some(10.0)
    );

    cpu.set(ScriptStep::Sample(cpu_tree(95.0)));
    let alert = timeout(WAIT, async {
        loop {
            let message = ws.next().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
            if value["type"] == "alert" {
                return value;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(alert["rule"], "cpu-high");
    assert_eq!(alert["old_state"], "OK");
    assert_eq!(alert["new_state"], "WARNING");
    assert_eq!(alert["value"].as_f64(), Some(95.0));

    drop(ws);
    app.shutdown(WAIT).await.unwrap();
}
