//! hostwatch - host and container telemetry agent.

use anyhow::{bail, Result};
use clap::Parser;
use hostwatch::{
    alerts::load_rules,
    app::{block_on_bounded, App},
    cli::{Cli, Command, OutputFormat},
    codec::Codec,
    config::Config,
    console,
    history::{self, SnapshotLog},
    persistence::{InfluxBackend, PersistenceClient},
    providers::Provider,
    registry::{ProviderDescriptor, ProviderRegistry},
    scheduler::Scheduler,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Blocking threads left behind by stuck samplers get this long after the
// agent itself has shut down.
const RUNTIME_TEARDOWN: Duration = Duration::from_millis(500);

fn main() -> Result<ExitCode> {
    block_on_bounded(agent_main(), RUNTIME_TEARDOWN)?
}

async fn agent_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info");
            error!("Failed to load configuration: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };
    init_tracing(&config.log_level);

    match command {
        Command::CheckConfig => check_config(&config),
        Command::Once { format } => once(&config, format).await,
        Command::Resync => resync(&config).await,
        Command::Export {
            format,
            input,
            output,
        } => export(&config, format, input, output).await,
        Command::Run => run_agent(cli, config, false).await,
        Command::Watch => run_agent(cli, config, true).await,
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn check_config(config: &Config) -> Result<ExitCode> {
    let rules = match load_rules(&config.alerts) {
        Ok(rules) => rules,
        Err(e) => {
            eprintln!("Invalid alert rules: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    println!("Configuration OK");
    for (kind, settings) in config.providers.enabled() {
        println!(
            "  provider {:<8} every {:?} (timeout {:?})",
            kind.domain(),
            settings.interval,
            settings.timeout
        );
    }
    println!("  alert rules: {}", rules.len());
    if config.backend.enabled {
        println!(
            "  backend: {} (org {}, bucket {})",
            config.backend.url, config.backend.org, config.backend.bucket
        );
    } else {
        println!("  backend: disabled");
    }
    if config.web.enabled {
        println!("  web: {}", config.web.listen_address);
    }
    if config.metrics.enabled {
        println!("  metrics: {}", config.metrics.listen_address);
    }
    if config.history.enabled {
        println!("  history: {}", config.history.path.display());
    }
    Ok(ExitCode::SUCCESS)
}

async fn once(config: &Config, format: OutputFormat) -> Result<ExitCode> {
    let registry = Arc::new(ProviderRegistry::new());
    for (kind, settings) in config.providers.enabled() {
        registry.register(ProviderDescriptor::new(
            kind.domain(),
            Provider::for_kind(kind),
            settings,
        ))?;
    }

    // CPU usage is measured between two refreshes.
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    let snapshot = Scheduler::new(registry, Arc::new(Notify::new()))
        .sample_once()
        .await;

    let rendered = match format {
        OutputFormat::Json => console::render_json(&snapshot)?,
        OutputFormat::Csv => {
            console::render_csv(&snapshot, &Codec::new(config.persistence.separator.clone()))?
        }
    };
    println!("{}", rendered.trim_end());
    Ok(ExitCode::SUCCESS)
}

async fn export(
    config: &Config,
    format: OutputFormat,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let log = SnapshotLog::new(input.unwrap_or_else(|| config.history.path.clone()));
    let snapshots = log.read_all().await?;
    if snapshots.is_empty() {
        eprintln!("No snapshots to export in {}", log.path().display());
        return Ok(ExitCode::FAILURE);
    }

    let rendered = match format {
        OutputFormat::Json => history::export_json(&snapshots)?,
        OutputFormat::Csv => history::export_csv(
            &snapshots,
            &Codec::new(config.persistence.separator.clone()),
        )?,
    };
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, rendered).await?;
            info!(snapshots = snapshots.len(), path = %path.display(), "History exported.");
        }
        None => println!("{}", rendered.trim_end()),
    }
    Ok(ExitCode::SUCCESS)
}

async fn resync(config: &Config) -> Result<ExitCode> {
    if !config.backend.enabled {
        bail!("the backend is disabled, nothing to resync to");
    }
    let backend = Arc::new(InfluxBackend::new(&config.backend)?);
    let client = PersistenceClient::new(
        backend,
        Arc::new(Codec::new(config.persistence.separator.clone())),
        &config.persistence,
        config.backend.tags.clone(),
    )
    .await?;

    let report = client.resync().await?;
    info!(
        sent = report.sent,
        dropped = report.dropped,
        remaining = report.remaining,
        "Resync finished."
    );
    println!(
        "sent {}, dropped {}, remaining {}",
        report.sent, report.dropped, report.remaining
    );
    Ok(if report.remaining == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_agent(cli: Cli, config: Config, console: bool) -> Result<ExitCode> {
    info!("hostwatch starting up...");
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    for (kind, settings) in config.providers.enabled() {
        info!("Provider {}: every {:?}", kind.domain(), settings.interval);
    }
    if config.backend.enabled {
        info!("Backend: {} (bucket {})", config.backend.url, config.backend.bucket);
    } else {
        info!("Backend: disabled");
    }
    info!("Fallback Log: {}", config.persistence.fallback_path.display());
    info!("Shutdown Grace: {}s", config.agent.shutdown_grace_seconds);
    info!("-------------------------------------------------------");

    // =========================================================================
    // Create Shutdown Channel
    // =========================================================================
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received. Shutting down gracefully...");
        let _ = shutdown_tx.send(true);
    });

    let app = App::builder(config)
        .cli(cli)
        .console(console)
        .build(shutdown_rx)
        .await?;
    app.run().await?;

    info!("hostwatch stopped.");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
