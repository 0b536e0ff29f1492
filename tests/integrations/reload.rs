//! Live reload of a running agent from its configuration file.

#[path = "../helpers/mod.rs"]
mod helpers;

use clap::Parser;
use helpers::app::TestAppBuilder;
use helpers::fs_watch::{rewrite, PlatformTimeouts};
use helpers::{cpu_tree, wait_for_snapshot};
use hostwatch::alerts::AlertState;
use hostwatch::cli::Cli;
use hostwatch::config::ConfigurationError;
use hostwatch::providers::ScriptedProvider;
use hostwatch::reload::{ReloadOutcome, ReloadSummary};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Waits for a reload outcome accepted by `predicate`. A single write can
/// produce more than one file event, so earlier outcomes are skipped.
async fn outcome_matching<F>(
    rx: &mut mpsc::Receiver<ReloadOutcome>,
    within: Duration,
    predicate: F,
) -> ReloadOutcome
where
    F: Fn(&ReloadOutcome) -> bool,
{
    timeout(within, async {
        loop {
            let outcome = rx.recv().await.expect("reload notifier closed");
            if predicate(&outcome) {
                return outcome;
            }
        }
    })
    .await
    .expect("no matching reload outcome")
}

fn cli_for(path: &Path) -> Cli {
    Cli::try_parse_from(["hostwatch", "--config", path.to_str().unwrap()]).unwrap()
}

#[tokio::test]
async fn test_reload_applies_intervals_and_rules() {
    helpers::init_tracing();
    let timeouts = PlatformTimeouts::for_current_platform();
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("hostwatch.toml");
    rewrite(&config_path, "[providers.cpu]\ninterval_seconds = 0.05\ntimeout_seconds = 1\n").await;

    let (notify_tx, mut notify_rx) = mpsc::channel(16);
    let mut app = TestAppBuilder::new()
        .with_provider(
            "cpu",
            ScriptedProvider::constant(cpu_tree(80.0)),
            Duration::from_millis(50),
        )
        .without_backend()
        .with_cli(cli_for(&config_path))
        .with_reload_notifier(notify_tx)
        .build()
        .await
        .unwrap();
    wait_for_snapshot(&mut app.snapshots, WAIT, |s| s.domains.contains_key("cpu")).await;
    tokio::time::sleep(timeouts.watcher_startup).await;

    rewrite(
        &config_path,
        r#"
[providers.cpu]
interval_seconds = 0.2
timeout_seconds = 1

[[alerts.rules]]
name = "cpu-busy"
metric = "cpu.average.cpu_percent"
operator = "gt"
threshold = 50.0
hysteresis = 1
"#,
    )
    .await;

    let outcome = outcome_matching(&mut notify_rx, timeouts.reload_notification_timeout, |o| {
        matches!(o, Ok(summary) if summary.rules_changed)
    })
    .await;
    assert_eq!(
        outcome.unwrap(),
        ReloadSummary {
            rules: 1,
            rules_changed: true,
            providers_updated: 1,
        }
    );
    let settings = app.registry.entry("cpu").unwrap().settings();
    assert_eq!(settings.interval, Duration::from_millis(200));

    // The new rule is evaluated against the next samples.
    let event = timeout(WAIT, app.alerts_rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.rule, "cpu-busy");
    assert_eq!(event.new_state, AlertState::Warning);

    app.shutdown(WAIT).await.unwrap();
}

#[tokio::test]
async fn test_rejected_reload_keeps_running_configuration() {
    let timeouts = PlatformTimeouts::for_current_platform();
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("hostwatch.toml");
    rewrite(&config_path, "[providers.cpu]\ninterval_seconds = 0.05\n").await;

    let (notify_tx, mut notify_rx) = mpsc::channel(16);
    let mut app = TestAppBuilder::new()
        .with_provider(
            "cpu",
            ScriptedProvider::constant(cpu_tree(5.0)),
            Duration::from_millis(50),
        )
        .without_backend()
        .with_cli(cli_for(&config_path))
        .with_reload_notifier(notify_tx)
        .build()
        .await
        .unwrap();
    tokio::time::sleep(timeouts.watcher_startup).await;

    rewrite(
        &config_path,
        "[providers.cpu]\ninterval_seconds = 3\n[persistence]\ninitial_backoff_ms = 10000\nmax_backoff_ms = 10\n",
    )
    .await;
    let outcome = outcome_matching(&mut notify_rx, timeouts.reload_notification_timeout, |o| {
        o.is_err()
    })
    .await;
    assert!(matches!(outcome, Err(ConfigurationError::Invalid(_))));
    assert_eq!(
        app.registry.entry("cpu").unwrap().settings().interval,
        Duration::from_millis(50)
    );

    // Turning a provider off needs a restart.
    rewrite(&config_path, "[providers.network]\nenabled = false\n").await;
    let outcome = outcome_matching(&mut notify_rx, timeouts.reload_notification_timeout, |o| {
        matches!(o, Err(ConfigurationError::ProviderSetChanged { .. }))
    })
    .await;
    let Err(ConfigurationError::ProviderSetChanged { running, requested }) = outcome else {
        unreachable!();
    };
    assert!(running.contains(&"network".to_string()));
    assert!(!requested.contains(&"network".to_string()));
    assert_eq!(
        app.registry.entry("cpu").unwrap().settings().interval,
        Duration::from_millis(50)
    );

    app.shutdown(WAIT).await.unwrap();
}
