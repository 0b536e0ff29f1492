//! The main application logic, decoupled from the entry point.

use crate::{
    alerts::{self, load_rules, AlertEvaluator, AlertEvent, AlertRuleConfig},
    cli::Cli,
    codec::Codec,
    config::Config,
    console,
    core::{AgentStatus, LiveUpdate, MetricSnapshot},
    fanout::{self, FanoutHub, Subscription},
    history::SnapshotLog,
    internal_metrics::MetricsBuilder,
    persistence::{InfluxBackend, PersistenceClient, TimeSeriesBackend},
    providers::Provider,
    publisher::SnapshotPublisher,
    registry::{ProviderDescriptor, ProviderRegistry},
    reload::{ConfigReloader, ReloadOutcome},
    scheduler::Scheduler,
    task_manager::TaskManager,
    web::{StatusSource, WebServer},
};
use anyhow::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::{sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tracing::{error, info, instrument};

const ALERT_CHANNEL_CAPACITY: usize = 256;

/// Runs `future` to completion on a new multi-threaded runtime, then tears
/// the runtime down. Samplers still stuck in a blocking read are abandoned
/// after `teardown` instead of holding the process open.
pub fn block_on_bounded<F: Future>(future: F, teardown: Duration) -> std::io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(teardown);
    Ok(output)
}

/// A handle to the running application, containing all its task handles.
pub struct App {
    task_manager: TaskManager,
    grace: Duration,
    registry: Arc<ProviderRegistry>,
    snapshots: watch::Receiver<Arc<MetricSnapshot>>,
    hub: Arc<FanoutHub<LiveUpdate>>,
    alerts_tx: broadcast::Sender<AlertEvent>,
    status: StatusSource,
    persistence: Option<Arc<PersistenceClient>>,
    web_addr: Option<SocketAddr>,
    metrics_addr: Option<SocketAddr>,
    // Held so the evaluator keeps its rule set when nothing reloads it.
    _rules_tx: Option<watch::Sender<Arc<Vec<AlertRuleConfig>>>>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn web_addr(&self) -> Option<SocketAddr> {
        self.web_addr
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// A receiver of published merged snapshots.
    pub fn snapshots(&self) -> watch::Receiver<Arc<MetricSnapshot>> {
        self.snapshots.clone()
    }

    /// Joins the live fan-out as a new consumer.
    pub fn subscribe_live(&self) -> Subscription<LiveUpdate> {
        self.hub.subscribe()
    }

    pub fn hub(&self) -> Arc<FanoutHub<LiveUpdate>> {
        self.hub.clone()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts_tx.subscribe()
    }

    pub fn persistence(&self) -> Option<&Arc<PersistenceClient>> {
        self.persistence.as_ref()
    }

    pub fn status(&self) -> AgentStatus {
        self.status.status()
    }

    /// Waits for the shutdown signal and then gracefully shuts down all tasks.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.task_manager.get_shutdown_rx();
        if !*shutdown_rx.borrow_and_update() {
            shutdown_rx.changed().await.ok();
        }
        info!("Shutdown signal received. Waiting for tasks to complete...");

        self.task_manager.shutdown(self.grace).await;

        info!("All tasks shut down.");
        Ok(())
    }
}

/// Builder for the main application.
///
/// Separates constructing the components from running them, and lets tests
/// swap in scripted providers and a fake backend.
pub struct AppBuilder {
    config: Config,
    cli: Option<Cli>,
    providers_override: Option<Vec<ProviderDescriptor>>,
    backend_override: Option<Arc<dyn TimeSeriesBackend>>,
    reload_notifier: Option<mpsc::Sender<ReloadOutcome>>,
    console: bool,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cli: None,
            providers_override: None,
            backend_override: None,
            reload_notifier: None,
            console: false,
        }
    }

    /// The command line the configuration was loaded from. Enables live
    /// reload, which re-reads configuration through the same layers.
    pub fn cli(mut self, cli: Cli) -> Self {
        self.cli = Some(cli);
        self
    }

    /// Overrides the host providers for testing.
    pub fn providers_override(mut self, providers: Vec<ProviderDescriptor>) -> Self {
        self.providers_override = Some(providers);
        self
    }

    /// Overrides the time-series backend for testing.
    pub fn backend_override(mut self, backend: Arc<dyn TimeSeriesBackend>) -> Self {
        self.backend_override = Some(backend);
        self
    }

    /// Reports every reload attempt on `notifier`.
    pub fn reload_notifier(mut self, notifier: mpsc::Sender<ReloadOutcome>) -> Self {
        self.reload_notifier = Some(notifier);
        self
    }

    /// Prints live updates to the terminal.
    pub fn console(mut self, enabled: bool) -> Self {
        self.console = enabled;
        self
    }

    /// Builds and initializes all application components, returning a runnable `App`.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let config = self.config;
        let task_manager = TaskManager::new(shutdown_rx);
        let grace = Duration::from_secs(config.agent.shutdown_grace_seconds);

        // =========================================================================
        // 1. Initialize Metrics
        // =========================================================================
        let metrics_addr = match MetricsBuilder::new(config.metrics.clone())
            .build(task_manager.get_shutdown_rx())
        {
            Some((server, addr)) => {
                task_manager.spawn("MetricsServer", server.run());
                Some(addr)
            }
            None => None,
        };

        // =========================================================================
        // 2. Provider Registry
        // =========================================================================
        let registry = Arc::new(ProviderRegistry::new());
        let descriptors = match self.providers_override {
            Some(descriptors) => descriptors,
            None => config
                .providers
                .enabled()
                .into_iter()
                .map(|(kind, settings)| {
                    ProviderDescriptor::new(kind.domain(), Provider::for_kind(kind), settings)
                })
                .collect(),
        };
        for descriptor in descriptors {
            registry.register(descriptor)?;
        }
        info!(providers = ?registry.domains(), "Providers registered.");

        // =========================================================================
        // 3. Scheduler & Snapshot Publisher
        // =========================================================================
        let updated = Arc::new(Notify::new());
        Scheduler::new(registry.clone(), updated.clone()).start(&task_manager);

        let (publisher, snapshots_rx) = SnapshotPublisher::new(
            registry.clone(),
            updated,
            Duration::from_millis(config.agent.coalesce_window_ms),
        );
        task_manager.spawn("SnapshotPublisher", publisher.run(task_manager.get_shutdown_rx()));

        // =========================================================================
        // 4. Persistence
        // =========================================================================
        let persistence = if config.backend.enabled {
            let backend = match self.backend_override {
                Some(backend) => backend,
                None => Arc::new(InfluxBackend::new(&config.backend)?) as Arc<dyn TimeSeriesBackend>,
            };
            let codec = Arc::new(Codec::new(config.persistence.separator.clone()));
            let client = PersistenceClient::new(
                backend,
                codec,
                &config.persistence,
                config.backend.tags.clone(),
            )
            .await?;
            task_manager.spawn(
                "PersistenceFeeder",
                client
                    .clone()
                    .follow(snapshots_rx.clone(), task_manager.get_shutdown_rx()),
            );
            task_manager.spawn(
                "PersistenceDrain",
                client.clone().run(task_manager.get_shutdown_rx(), grace / 2),
            );
            Some(client)
        } else {
            info!("Backend disabled, snapshots are not persisted.");
            None
        };

        if config.history.enabled {
            info!(path = %config.history.path.display(), "Snapshot history log enabled.");
            task_manager.spawn(
                "HistoryLog",
                SnapshotLog::new(&config.history.path)
                    .follow(snapshots_rx.clone(), task_manager.get_shutdown_rx()),
            );
        }

        // =========================================================================
        // 5. Alerts
        // =========================================================================
        let rules = load_rules(&config.alerts)?;
        info!(rules = rules.len(), "Alert rules loaded.");
        let (rules_tx, rules_rx) = watch::channel(Arc::new(rules.clone()));
        let (alerts_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);

        task_manager.spawn(
            "AlertEvaluator",
            AlertEvaluator::new(rules).run(
                snapshots_rx.clone(),
                rules_rx,
                alerts_tx.clone(),
                task_manager.get_shutdown_rx(),
            ),
        );
        task_manager.spawn(
            "AlertLogger",
            alerts::logging_subscriber::run(alerts_tx.subscribe(), task_manager.get_shutdown_rx()),
        );

        // =========================================================================
        // 6. Live Fan-out & Consumers
        // =========================================================================
        let hub = Arc::new(FanoutHub::new(
            config.fanout.consumer_queue_capacity,
            config.fanout.event_queue_capacity,
        ));
        task_manager.spawn(
            "FanoutPump",
            fanout::pump(
                hub.clone(),
                snapshots_rx.clone(),
                alerts_tx.subscribe(),
                task_manager.get_shutdown_rx(),
            ),
        );

        let status = StatusSource::new(registry.clone(), persistence.clone());

        let web_addr = if config.web.enabled {
            let (server, addr) = WebServer::bind(
                config.web.listen_address,
                snapshots_rx.clone(),
                status.clone(),
                hub.clone(),
                persistence.clone(),
                task_manager.get_shutdown_rx(),
            )
            .await?;
            task_manager.spawn("WebServer", server.run());
            Some(addr)
        } else {
            None
        };

        if self.console {
            task_manager.spawn(
                "Console",
                console::run(hub.subscribe(), status.clone(), task_manager.get_shutdown_rx()),
            );
        }

        // =========================================================================
        // 7. Live Reload
        // =========================================================================
        let rules_tx = match self.cli {
            Some(cli) => {
                let mut reloader = ConfigReloader::new(cli, &config, registry.clone(), rules_tx);
                if let Some(notifier) = self.reload_notifier {
                    reloader = reloader.with_notifier(notifier);
                }
                let files = reloader.watched_files(&config);
                let shutdown_rx = task_manager.get_shutdown_rx();
                task_manager.spawn("ConfigReloader", async move {
                    if let Err(e) = reloader.run(files, shutdown_rx).await {
                        error!("Configuration watcher failed: {}", e);
                    }
                });
                None
            }
            None => Some(rules_tx),
        };

        info!(
            web = ?web_addr,
            metrics = ?metrics_addr,
            tasks = task_manager.len(),
            "hostwatch initialized successfully."
        );

        Ok(App {
            task_manager,
            grace,
            registry,
            snapshots: snapshots_rx,
            hub,
            alerts_tx,
            status,
            persistence,
            web_addr,
            metrics_addr,
            _rules_tx: rules_tx,
        })
    }
}
