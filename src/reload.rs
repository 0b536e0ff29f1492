//! Live reload of provider settings and alert rules.
//!
//! A reload is triggered by a change to the configuration file or any rule
//! file, or by SIGHUP. The whole configuration is re-read and validated
//! first; a reload that fails validation or tries to change which providers
//! run is rejected and the running configuration stays in effect.

use crate::alerts::rules::load_rules;
use crate::alerts::AlertRuleConfig;
use crate::cli::Cli;
use crate::config::{Config, ConfigurationError};
use crate::registry::ProviderRegistry;
use anyhow::Result;
use notify::{event::EventKind, Config as WatcherConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// What an accepted reload changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReloadSummary {
    pub rules: usize,
    pub rules_changed: bool,
    pub providers_updated: usize,
}

pub type ReloadOutcome = Result<ReloadSummary, ConfigurationError>;

pub struct ConfigReloader {
    cli: Cli,
    registry: Arc<ProviderRegistry>,
    rules_tx: watch::Sender<Arc<Vec<AlertRuleConfig>>>,
    running: BTreeSet<String>,
    notifier: Option<mpsc::Sender<ReloadOutcome>>,
}

impl ConfigReloader {
    /// `running` is the configuration the agent started with; its enabled
    /// providers are the set a reload may not change.
    pub fn new(
        cli: Cli,
        running: &Config,
        registry: Arc<ProviderRegistry>,
        rules_tx: watch::Sender<Arc<Vec<AlertRuleConfig>>>,
    ) -> Self {
        Self {
            cli,
            registry,
            rules_tx,
            running: enabled_domains(running),
            notifier: None,
        }
    }

    /// Reports the outcome of every reload attempt on `notifier`.
    pub fn with_notifier(mut self, notifier: mpsc::Sender<ReloadOutcome>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Re-reads the configuration and applies it if it is acceptable.
    pub fn reload(&self) -> ReloadOutcome {
        let config = Config::load(&self.cli)?;
        let rules = load_rules(&config.alerts)?;

        let requested = enabled_domains(&config);
        if requested != self.running {
            return Err(ConfigurationError::ProviderSetChanged {
                running: self.running.iter().cloned().collect(),
                requested: requested.into_iter().collect(),
            });
        }

        let mut providers_updated = 0;
        for (kind, settings) in config.providers.enabled() {
            let Some(entry) = self.registry.entry(kind.domain()) else {
                continue;
            };
            if entry.settings() != settings {
                self.registry.update_settings(kind.domain(), settings)?;
                providers_updated += 1;
            }
        }

        let count = rules.len();
        let rules_changed = self.rules_tx.send_if_modified(|current| {
            if current.as_slice() == rules.as_slice() {
                false
            } else {
                *current = Arc::new(rules);
                true
            }
        });

        Ok(ReloadSummary {
            rules: count,
            rules_changed,
            providers_updated,
        })
    }

    async fn reload_and_report(&self, trigger: &str) {
        let outcome = self.reload();
        match &outcome {
            Ok(summary) => info!(
                trigger,
                rules = summary.rules,
                rules_changed = summary.rules_changed,
                providers_updated = summary.providers_updated,
                "Configuration reloaded."
            ),
            Err(e) => error!(trigger, error = %e, "Configuration reload rejected, keeping the running configuration."),
        }
        if let Some(notifier) = &self.notifier {
            if notifier.send(outcome).await.is_err() {
                warn!("Reload notifier channel closed");
            }
        }
    }

    /// Files whose changes trigger a reload: the configuration file and the
    /// rule files it named at startup.
    pub fn watched_files(&self, running: &Config) -> Vec<PathBuf> {
        self.cli
            .config
            .iter()
            .chain(running.alerts.rule_files.iter())
            .cloned()
            .collect()
    }

    /// Watches `files` and SIGHUP until shutdown.
    #[instrument(skip_all)]
    pub async fn run(self, files: Vec<PathBuf>, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    if let Err(e) = tx.blocking_send(event) {
                        debug!("Failed to forward file event: {}", e);
                    }
                }
            },
            WatcherConfig::default(),
        )?;

        let watched: HashSet<PathBuf> = files.iter().map(|p| normalize(p)).collect();
        let parents: HashSet<PathBuf> = watched
            .iter()
            .filter_map(|p| p.parent().map(Path::to_path_buf))
            .collect();
        for parent in &parents {
            watcher.watch(parent, RecursiveMode::NonRecursive)?;
        }
        info!(files = watched.len(), "Watching configuration for changes.");

        let mut hangup = hangup_signal();
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                Some(event) = rx.recv() => {
                    if should_reload(&event, &watched) {
                        self.reload_and_report("file").await;
                    }
                }
                _ = next_hangup(&mut hangup) => {
                    self.reload_and_report("sighup").await;
                }
            }
        }
        info!("Configuration watcher finished.");
        Ok(())
    }
}

fn enabled_domains(config: &Config) -> BTreeSet<String> {
    config
        .providers
        .enabled()
        .into_iter()
        .map(|(kind, _)| kind.domain().to_string())
        .collect()
}

fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn should_reload(event: &Event, watched: &HashSet<PathBuf>) -> bool {
    match event.kind {
        EventKind::Modify(_) | EventKind::Create(_) => {
            event.paths.iter().any(|path| watched.contains(&normalize(path)))
        }
        _ => false,
    }
}

#[cfg(unix)]
type Hangup = tokio::signal::unix::Signal;
#[cfg(not(unix))]
type Hangup = ();

#[cfg(unix)]
fn hangup_signal() -> Option<Hangup> {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(signal) => Some(signal),
        Err(e) => {
            warn!(error = %e, "SIGHUP reload unavailable.");
            None
        }
    }
}

#[cfg(not(unix))]
fn hangup_signal() -> Option<Hangup> {
    None
}

async fn next_hangup(hangup: &mut Option<Hangup>) {
    #[cfg(unix)]
    {
        if let Some(signal) = hangup {
            if signal.recv().await.is_some() {
                return;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = hangup;
    std::future::pending::<()>().await
}
