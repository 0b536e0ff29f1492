//! Configuration layering: defaults, TOML file, environment, command line.

use clap::Parser;
use hostwatch::cli::Cli;
use hostwatch::config::{Config, ConfigurationError};
use hostwatch::persistence::OverflowPolicy;
use serial_test::serial;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Runs `test_fn` with a temporary config file holding `toml_content`.
fn with_config_file<F>(toml_content: &str, test_fn: F)
where
    F: FnOnce(&Path),
{
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{}", toml_content).unwrap();
    test_fn(file.path());
}

/// Sets environment variables for the duration of `test_fn`.
fn with_env<F>(vars: &[(&str, &str)], test_fn: F)
where
    F: FnOnce(),
{
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(test_fn));
    for (key, _) in vars {
        std::env::remove_var(key);
    }
    if let Err(panic) = result {
        std::panic::resume_unwind(panic);
    }
}

fn cli(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("hostwatch").chain(args.iter().copied())).unwrap()
}

#[test]
#[serial]
fn test_load_full_valid_config() {
    let toml_content = r#"
        log_level = "debug"

        [agent]
        coalesce_window_ms = 50
        shutdown_grace_seconds = 8

        [providers.cpu]
        interval_seconds = 1.5
        timeout_seconds = 1
        [providers.disk]
        interval_seconds = 30
        stale_after_seconds = 90
        surface_after_failures = 5
        [providers.network]
        enabled = false

        [backend]
        url = "http://influx.internal:8086"
        org = "ops"
        bucket = "hosts"
        token = "secret"
        [backend.tags]
        host = "web-1"

        [persistence]
        buffer_capacity = 2000
        overflow = "drop_oldest"
        max_attempts = 5
        fallback_path = "/var/lib/hostwatch/fallback.jsonl"

        [[alerts.rules]]
        name = "cpu-high"
        metric = "cpu.average.cpu_percent"
        operator = "above"
        threshold = 85.0
        critical_threshold = 95.0
        hysteresis = 2

        [web]
        enabled = false

        [metrics]
        enabled = true
        listen_address = "0.0.0.0:9100"
    "#;

    with_config_file(toml_content, |path| {
        let config = Config::load(&cli(&["--config", path.to_str().unwrap()])).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.agent.coalesce_window_ms, 50);
        assert_eq!(config.agent.shutdown_grace_seconds, 8);
        assert_eq!(config.providers.cpu.interval, Duration::from_millis(1500));
        assert_eq!(config.providers.cpu.timeout, Duration::from_secs(1));
        assert_eq!(config.providers.disk.stale_after, Some(Duration::from_secs(90)));
        assert_eq!(config.providers.disk.surface_after_failures, 5);
        assert!(!config.providers.network.enabled);
        // Untouched providers keep their defaults.
        assert_eq!(config.providers.memory.interval, Duration::from_secs(5));

        assert_eq!(config.backend.url, "http://influx.internal:8086");
        assert_eq!(config.backend.token.as_deref(), Some("secret"));
        assert_eq!(config.backend.tags.get("host").map(String::as_str), Some("web-1"));
        assert_eq!(config.persistence.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.persistence.max_attempts, 5);
        assert_eq!(config.persistence.batch_size, 500);

        assert_eq!(config.alerts.rules.len(), 1);
        assert_eq!(config.alerts.rules[0].critical_threshold, Some(95.0));
        assert!(!config.web.enabled);
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.listen_address, "0.0.0.0:9100".parse().unwrap());

        let enabled: Vec<&str> = config
            .providers
            .enabled()
            .iter()
            .map(|(kind, _)| kind.domain())
            .collect();
        assert_eq!(enabled, vec!["cpu", "memory", "disk", "process"]);
    });
}

#[test]
#[serial]
fn test_environment_overrides_file_and_cli_overrides_environment() {
    let toml_content = r#"
        log_level = "warn"
        [backend]
        bucket = "from-file"
        [persistence]
        batch_size = 100
    "#;

    with_config_file(toml_content, |path| {
        with_env(
            &[
                ("HOSTWATCH_LOG_LEVEL", "debug"),
                ("HOSTWATCH_BACKEND__BUCKET", "from-env"),
                ("HOSTWATCH_PROVIDERS__CPU__INTERVAL_SECONDS", "0.5"),
            ],
            || {
                let config = Config::load(&cli(&[
                    "--config",
                    path.to_str().unwrap(),
                    "--log-level",
                    "trace",
                    "--no-backend",
                    "--web-listen",
                    "127.0.0.1:7000",
                ]))
                .unwrap();

                assert_eq!(config.log_level, "trace");
                assert_eq!(config.backend.bucket, "from-env");
                assert!(!config.backend.enabled);
                assert_eq!(config.persistence.batch_size, 100);
                assert_eq!(config.providers.cpu.interval, Duration::from_millis(500));
                assert!(config.web.enabled);
                assert_eq!(config.web.listen_address, "127.0.0.1:7000".parse().unwrap());
            },
        );
    });
}

#[test]
#[serial]
fn test_missing_config_file_is_an_error() {
    let err = Config::load(&cli(&["--config", "/nonexistent/hostwatch.toml"])).unwrap_err();
    match err {
        ConfigurationError::Load(message) => {
            assert!(message.contains("Config file not found at specified path"))
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
#[serial]
fn test_invalid_values_are_rejected() {
    with_config_file("[persistence]\ninitial_backoff_ms = 10000\nmax_backoff_ms = 10\n", |path| {
        let err = Config::load(&cli(&["--config", path.to_str().unwrap()])).unwrap_err();
        assert!(matches!(err, ConfigurationError::Invalid(_)));
    });

    let bad_rule = r#"
        [[alerts.rules]]
        name = "mem"
        metric = "memory"
        operator = "gt"
        threshold = 90.0
    "#;
    with_config_file(bad_rule, |path| {
        let err = Config::load(&cli(&["--config", path.to_str().unwrap()])).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidRule { .. }));
    });

    with_config_file("[persistence]\noverflow = \"block\"\n", |path| {
        let err = Config::load(&cli(&["--config", path.to_str().unwrap()])).unwrap_err();
        assert!(matches!(err, ConfigurationError::Load(_)));
    });
}

#[test]
#[serial]
fn test_defaults_without_file() {
    let config = Config::load(&cli(&[])).unwrap();
    assert_eq!(config, Config::default());
}
