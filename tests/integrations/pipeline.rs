//! Providers through scheduler, publisher, persistence and alerts.

#[path = "../helpers/mod.rs"]
mod helpers;

use helpers::app::TestAppBuilder;
use helpers::{cpu_tree, eventually, process_tree, wait_for_snapshot};
use hostwatch::alerts::{AlertRuleConfig, AlertState, Operator};
use hostwatch::core::MetricValue;
use hostwatch::persistence::test_utils::FakeBackend;
use hostwatch::providers::{ScriptStep, ScriptedProvider};
use hostwatch::registry::ProviderSettings;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_slow_provider_does_not_hold_up_others() {
    helpers::init_tracing();
    let cpu = ScriptedProvider::constant(cpu_tree(10.0));
    let process = ScriptedProvider::new([
        ScriptStep::Sample(process_tree(100, 1.0)),
        ScriptStep::Slow(Duration::from_millis(800), process_tree(100, 2.0)),
    ]);

    let mut app = TestAppBuilder::new()
        .with_provider("cpu", cpu.clone(), Duration::from_millis(50))
        .with_provider("process", process.clone(), Duration::from_millis(100))
        .without_backend()
        .build()
        .await
        .unwrap();

    wait_for_snapshot(&mut app.snapshots, WAIT, |s| s.domains.len() == 2).await;
    let cpu_calls_before = cpu.calls();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The process sampler is stuck in its slow cycle the whole time.
    assert!(process.calls() <= 3, "process ran {} times", process.calls());
    assert!(
        cpu.calls() >= cpu_calls_before + 5,
        "cpu only ran {} times",
        cpu.calls() - cpu_calls_before
    );
    let snapshot = app.snapshots.borrow().clone();
    assert_eq!(
        snapshot.lookup("process.pid"),
        Some(&MetricValue::Integer(100))
    );

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_samples_are_persisted_with_stable_kinds() {
    let backend = FakeBackend::new();
    let process = ScriptedProvider::new([
        ScriptStep::Sample(process_tree(4242, 1.0)),
        ScriptStep::Sample(process_tree(4242, 2.0)),
    ]);

    let mut app = TestAppBuilder::new()
        .with_provider("process", process, Duration::from_millis(50))
        .with_backend(backend.clone())
        .build()
        .await
        .unwrap();

    eventually(WAIT, || backend.written().len() >= 2).await;
    let written = backend.written();
    for point in &written {
        assert_eq!(point.measurement, "process");
        assert_eq!(point.fields.get("process_pid"), Some(&MetricValue::Integer(4242)));
        assert!(matches!(point.fields.get("process_cpu_value"), Some(MetricValue::Real(_))));
        assert_eq!(point.fields.get("process_threads_count"), Some(&MetricValue::Integer(4)));
    }
    // One point per recorded sample, never a repeat of the same capture.
    let mut times: Vec<_> = written.iter().map(|p| p.timestamp).collect();
    times.dedup();
    assert_eq!(times.len(), written.len());

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_sustained_breach_escalates_one_step_at_a_time() {
    let cpu = ScriptedProvider::new([ScriptStep::Sample(cpu_tree(20.0))]);
    let rule = AlertRuleConfig {
        name: "cpu-high".to_string(),
        metric: "cpu.average.cpu_percent".to_string(),
        operator: Operator::Gt,
        threshold: 90.0,
        critical_threshold: None,
        hysteresis: 3,
    };

    let mut app = TestAppBuilder::new()
        .with_provider("cpu", cpu.clone(), Duration::from_millis(40))
        .with_rules(vec![rule])
        .without_backend()
        .build()
        .await
        .unwrap();

    wait_for_snapshot(&mut app.snapshots, WAIT, |s| s.domains.contains_key("cpu")).await;
    cpu.set(ScriptStep::Sample(cpu_tree(97.0)));

    let first = timeout(WAIT, app.alerts_rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        (first.old_state, first.new_state),
        (AlertState::Ok, AlertState::Warning)
    );
    assert_eq!(first.value, 97.0);
    assert_eq!(first.metric, "cpu.average.cpu_percent");

    let second = timeout(WAIT, app.alerts_rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        (second.old_state, second.new_state),
        (AlertState::Warning, AlertState::Critical)
    );

    // Recovery steps back down through WARNING.
    cpu.set(ScriptStep::Sample(cpu_tree(10.0)));
    let third = timeout(WAIT, app.alerts_rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        (third.old_state, third.new_state),
        (AlertState::Critical, AlertState::Warning)
    );
    let fourth = timeout(WAIT, app.alerts_rx.recv()).await.unwrap().unwrap();
    assert_eq!(fourth.new_state, AlertState::Ok);

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_failing_provider_is_surfaced_and_others_continue() {
    let memory = ScriptedProvider::constant(
        hostwatch::core::MetricTree::new().with_branch(
            "virtual_memory",
            hostwatch::core::MetricTree::new().with("percent", 42.0),
        ),
    );
    let disk = ScriptedProvider::new([ScriptStep::Fail("device vanished".to_string())]);

    let mut app = TestAppBuilder::new()
        .with_provider("memory", memory, Duration::from_millis(40))
        .with_provider_settings(
            "disk",
            disk,
            ProviderSettings {
                interval: Duration::from_millis(40),
                timeout: Duration::from_secs(1),
                surface_after_failures: 2,
                ..Default::default()
            },
        )
        .without_backend()
        .build()
        .await
        .unwrap();

    let registry = app.registry.clone();
    eventually(WAIT, || registry.failing_providers() == vec!["disk".to_string()]).await;

    let snapshot =
        wait_for_snapshot(&mut app.snapshots, WAIT, |s| s.domains.contains_key("memory")).await;
    assert!(!snapshot.domains.contains_key("disk"));
    assert_eq!(
        snapshot.lookup("memory.virtual_memory.percent"),
        Some(&MetricValue::Real(42.0))
    );

    app.shutdown(WAIT).await.unwrap();
}
