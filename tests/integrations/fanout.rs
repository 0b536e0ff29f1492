//! Live consumers behind the running agent.

#[path = "../helpers/mod.rs"]
mod helpers;

use helpers::app::TestAppBuilder;
use helpers::{cpu_tree, wait_for_snapshot};
use hostwatch::alerts::{AlertRuleConfig, AlertState, Operator};
use hostwatch::core::LiveUpdate;
use hostwatch::providers::{ScriptStep, ScriptedProvider};
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_stalled_consumer_holds_only_the_latest_snapshot() {
    let cpu = ScriptedProvider::constant(cpu_tree(5.0));
    let mut app = TestAppBuilder::new()
        .with_provider("cpu", cpu, Duration::from_millis(30))
        .without_backend()
        .build()
        .await
        .unwrap();

    let stalled = app.hub.subscribe();
    let active = app.hub.subscribe();

    let mut received = 0;
    let mut last_seen = None;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(LiveUpdate::Snapshot(snapshot))) =
            timeout(Duration::from_millis(200), active.recv()).await
        {
            received += 1;
            last_seen = Some(snapshot.captured_at);
        }
    }
    assert!(received >= 5, "active consumer only got {} snapshots", received);

    // The stalled consumer never read, yet its queue never grew.
    assert_eq!(stalled.pending(), 1);
    let Some(LiveUpdate::Snapshot(latest)) = stalled.try_recv() else {
        panic!("stalled consumer should hold a snapshot");
    };
    assert!(latest.captured_at >= last_seen.unwrap());

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_alert_transitions_reach_live_consumers() {
    let cpu = ScriptedProvider::new([ScriptStep::Sample(cpu_tree(15.0))]);
    let rule = AlertRuleConfig {
        name: "cpu-high".to_string(),
        metric: "cpu.average.cpu_percent".to_string(),
        operator: Operator::Ge,
        threshold: 90.0,
        critical_threshold: Some(98.0),
        hysteresis: 2,
    };
    let mut app = TestAppBuilder::new()
        .with_provider("cpu", cpu.clone(), Duration::from_millis(30))
        .with_rules(vec![rule])
        .without_backend()
        .build()
        .await
        .unwrap();

    let consumer = app.hub.subscribe();
    wait_for_snapshot(&mut app.snapshots, WAIT, |s| s.domains.contains_key("cpu")).await;
    cpu.set(ScriptStep::Sample(cpu_tree(99.0)));

    let event = timeout(WAIT, async {
        loop {
            match consumer.recv().await {
                Some(LiveUpdate::Alert(event)) => return event,
                Some(LiveUpdate::Snapshot(_)) => continue,
                None => panic!("hub closed"),
            }
        }
    })
    .await
    .unwrap();

    // A value past the critical threshold still climbs one step at a time.
    assert_eq!(event.rule, "cpu-high");
    assert_eq!(event.old_state, AlertState::Ok);
    assert_eq!(event.new_state, AlertState::Warning);

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_stalled_consumer_keeps_alerts_behind_newer_snapshots() {
    let cpu = ScriptedProvider::new([ScriptStep::Sample(cpu_tree(15.0))]);
    let rule = AlertRuleConfig {
        name: "cpu-high".to_string(),
        metric: "cpu.average.cpu_percent".to_string(),
        operator: Operator::Gt,
        threshold: 90.0,
        critical_threshold: Some(99.0),
        hysteresis: 1,
    };
    let mut app = TestAppBuilder::new()
        .with_provider("cpu", cpu.clone(), Duration::from_millis(30))
        .with_rules(vec![rule])
        .without_backend()
        .build()
        .await
        .unwrap();

    let stalled = app.hub.subscribe();
    wait_for_snapshot(&mut app.snapshots, WAIT, |s| s.domains.contains_key("cpu")).await;
    cpu.set(ScriptStep::Sample(cpu_tree(95.0)));

    // The transition happens while the consumer is not reading, and several
    // snapshots follow it.
    timeout(WAIT, app.alerts_rx.recv()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut alerts = Vec::new();
    let mut snapshots = 0;
    while let Some(update) = stalled.try_recv() {
        match update {
            LiveUpdate::Alert(event) => alerts.push(event),
            LiveUpdate::Snapshot(_) => snapshots += 1,
        }
    }
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].rule, "cpu-high");
    assert_eq!(alerts[0].new_state, AlertState::Warning);
    assert_eq!(snapshots, 1);

    app.shutdown(WAIT).await.unwrap();
}
