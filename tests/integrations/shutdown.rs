//! Orderly shutdown of the whole agent.

#[path = "../helpers/mod.rs"]
mod helpers;

use helpers::app::TestAppBuilder;
use helpers::{cpu_tree, eventually, process_tree, wait_for_snapshot};
use hostwatch::app::block_on_bounded;
use hostwatch::persistence::test_utils::FakeBackend;
use hostwatch::providers::{ScriptStep, ScriptedProvider};
use hostwatch::registry::ProviderSettings;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_stuck_provider_does_not_delay_shutdown_past_grace() {
    helpers::init_tracing();
    let stuck = ScriptedProvider::new([ScriptStep::Slow(Duration::from_secs(3), cpu_tree(1.0))]);
    let process = ScriptedProvider::constant(process_tree(1, 0.1));

    let mut builder = TestAppBuilder::new()
        .with_provider_settings(
            "cpu",
            stuck.clone(),
            ProviderSettings {
                interval: Duration::from_millis(50),
                timeout: Duration::from_secs(60),
                ..Default::default()
            },
        )
        .with_provider("process", process, Duration::from_millis(50))
        .without_backend();
    builder.config.agent.shutdown_grace_seconds = 1;
    let mut app = builder.build().await.unwrap();

    wait_for_snapshot(&mut app.snapshots, Duration::from_secs(5), |s| {
        s.domains.contains_key("process")
    })
    .await;
    eventually(Duration::from_secs(5), || stuck.calls() >= 1).await;

    let started = Instant::now();
    app.shutdown(Duration::from_secs(5)).await.unwrap();
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(2500),
        "shutdown took {:?}",
        elapsed
    );
}

#[tokio::test]
async fn test_shutdown_flushes_buffered_points_to_backend() {
    let backend = FakeBackend::new();
    let mut app = TestAppBuilder::new()
        .with_provider(
            "process",
            ScriptedProvider::constant(process_tree(12, 0.5)),
            Duration::from_millis(50),
        )
        .with_backend(backend.clone())
        .build()
        .await
        .unwrap();

    eventually(Duration::from_secs(5), || backend.written().len() >= 2).await;
    let client = app.persistence().clone();
    app.shutdown(Duration::from_secs(5)).await.unwrap();

    // A healthy backend takes everything; nothing spills to the fallback log.
    assert!(client.is_reachable());
    assert_eq!(client.fallback_pending(), 0);
    assert!(backend
        .written()
        .iter()
        .all(|point| point.measurement == "process"));
}

#[test]
fn test_stuck_sampler_does_not_hold_the_runtime_open() {
    let stuck = ScriptedProvider::new([ScriptStep::Slow(Duration::from_secs(10), cpu_tree(1.0))]);
    let started = Instant::now();

    block_on_bounded(
        async {
            let mut builder = TestAppBuilder::new()
                .with_provider_settings(
                    "cpu",
                    stuck.clone(),
                    ProviderSettings {
                        interval: Duration::from_millis(50),
                        timeout: Duration::from_millis(100),
                        ..Default::default()
                    },
                )
                .without_backend();
            builder.config.agent.shutdown_grace_seconds = 1;
            let mut app = builder.build().await.unwrap();

            eventually(Duration::from_secs(5), || stuck.calls() >= 1).await;
            app.shutdown(Duration::from_secs(5)).await.unwrap();
        },
        Duration::from_millis(200),
    )
    .unwrap();

    // The sampler is still asleep in its blocking thread when this returns.
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(5), "teardown took {:?}", elapsed);
}
