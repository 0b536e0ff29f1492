//! The provider registry.
//!
//! Holds every registered provider together with its settings, health and the
//! most recent completed sample of its domain. Each domain's sample is stored
//! behind an `ArcSwapOption`, so `snapshot()` never waits on a sampler and
//! never observes a half-written subtree: readers see either the previous
//! sample or the new one.

use crate::config::ConfigurationError;
use crate::core::{DomainSample, MetricSnapshot, MetricTree};
use crate::providers::{Provider, ProviderSampleError};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Per-provider scheduling and staleness settings. These can change at
/// runtime through a configuration reload.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub interval: Duration,
    pub timeout: Duration,
    /// A domain whose last good sample is older than this is left out of
    /// snapshots. `None` keeps stale values indefinitely.
    pub stale_after: Option<Duration>,
    /// Consecutive failures before the provider is reported as failing.
    pub surface_after_failures: u32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            stale_after: None,
            surface_after_failures: 3,
        }
    }
}

/// Everything needed to register a provider.
#[derive(Debug)]
pub struct ProviderDescriptor {
    pub name: String,
    pub sampler: Provider,
    pub settings: ProviderSettings,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, sampler: Provider, settings: ProviderSettings) -> Self {
        Self {
            name: name.into(),
            sampler,
            settings,
        }
    }
}

/// Last-known health of one provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderHealth {
    pub last_sample_at: Option<DateTime<Utc>>,
    pub last_error: Option<ProviderSampleError>,
    pub consecutive_failures: u32,
}

#[derive(Error, Debug, PartialEq)]
pub enum RecordError {
    #[error("domain '{0}' is not registered")]
    UnknownDomain(String),
    #[error("sample for '{domain}' captured at {incoming} is older than the stored one ({latest})")]
    OutOfOrder {
        domain: String,
        latest: DateTime<Utc>,
        incoming: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct StoredSample {
    sample: DomainSample,
    recorded_at: Instant,
}

/// A registered domain. The scheduler task for the domain owns the sampling
/// side; everything else only reads.
#[derive(Debug)]
pub struct DomainEntry {
    name: String,
    sampler: Arc<Mutex<Provider>>,
    settings: watch::Sender<ProviderSettings>,
    latest: ArcSwapOption<StoredSample>,
    // Also serializes writers so samples of one domain apply in order.
    health: Mutex<ProviderHealth>,
}

impl DomainEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sampler(&self) -> Arc<Mutex<Provider>> {
        self.sampler.clone()
    }

    pub fn settings(&self) -> ProviderSettings {
        self.settings.borrow().clone()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<ProviderSettings> {
        self.settings.subscribe()
    }

    fn is_fresh(&self, stored: &StoredSample) -> bool {
        match self.settings.borrow().stale_after {
            Some(limit) => stored.recorded_at.elapsed() <= limit,
            None => true,
        }
    }
}

/// The set of registered providers and their latest samples.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    domains: RwLock<BTreeMap<String, Arc<DomainEntry>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a provider. Fails if its domain name is already taken.
    pub fn register(
        &self,
        descriptor: ProviderDescriptor,
    ) -> Result<Arc<DomainEntry>, ConfigurationError> {
        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        if domains.contains_key(&descriptor.name) {
            return Err(ConfigurationError::DuplicateDomain(descriptor.name));
        }
        let (settings, _) = watch::channel(descriptor.settings);
        let entry = Arc::new(DomainEntry {
            name: descriptor.name.clone(),
            sampler: Arc::new(Mutex::new(descriptor.sampler)),
            settings,
            latest: ArcSwapOption::empty(),
            health: Mutex::new(ProviderHealth::default()),
        });
        domains.insert(descriptor.name, entry.clone());
        debug!(domain = %entry.name, "Registered provider");
        Ok(entry)
    }

    pub fn entry(&self, domain: &str) -> Option<Arc<DomainEntry>> {
        self.domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(domain)
            .cloned()
    }

    fn entries(&self) -> Vec<Arc<DomainEntry>> {
        self.domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Names of all registered domains, in order.
    pub fn domains(&self) -> Vec<String> {
        self.domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Atomically replaces the stored subtree for `domain` and clears its
    /// failure streak. A sample older than the stored one is rejected.
    pub fn record(
        &self,
        domain: &str,
        tree: MetricTree,
        captured_at: DateTime<Utc>,
    ) -> Result<(), RecordError> {
        let entry = self
            .entry(domain)
            .ok_or_else(|| RecordError::UnknownDomain(domain.to_string()))?;

        let mut health = entry.health.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = entry.latest.load_full() {
            if current.sample.captured_at > captured_at {
                return Err(RecordError::OutOfOrder {
                    domain: domain.to_string(),
                    latest: current.sample.captured_at,
                    incoming: captured_at,
                });
            }
        }

        entry.latest.store(Some(Arc::new(StoredSample {
            sample: DomainSample { captured_at, tree },
            recorded_at: Instant::now(),
        })));

        if health.consecutive_failures > 0 {
            debug!(domain, failures = health.consecutive_failures, "Provider recovered");
        }
        health.last_sample_at = Some(captured_at);
        health.last_error = None;
        health.consecutive_failures = 0;
        Ok(())
    }

    /// Notes a failed cycle. The stored sample is left untouched. Returns the
    /// length of the current failure streak.
    pub fn record_failure(
        &self,
        domain: &str,
        error: ProviderSampleError,
    ) -> Result<u32, RecordError> {
        let entry = self
            .entry(domain)
            .ok_or_else(|| RecordError::UnknownDomain(domain.to_string()))?;
        let surface_after = entry.settings.borrow().surface_after_failures;

        let mut health = entry.health.lock().unwrap_or_else(PoisonError::into_inner);
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        let failures = health.consecutive_failures;
        if failures == surface_after {
            warn!(domain, failures, error = %error, "Provider is now failing persistently");
        } else {
            debug!(domain, failures, error = %error, "Provider sample failed");
        }
        health.last_error = Some(error);
        Ok(failures)
    }

    /// A merged view of each domain's latest completed sample.
    ///
    /// Domains with no sample yet, or whose sample is older than their
    /// `stale_after`, are omitted.
    pub fn snapshot(&self) -> MetricSnapshot {
        let mut domains = BTreeMap::new();
        for entry in self.entries() {
            if let Some(stored) = entry.latest.load_full() {
                if entry.is_fresh(&stored) {
                    domains.insert(entry.name.clone(), stored.sample.clone());
                }
            }
        }
        MetricSnapshot {
            captured_at: Utc::now(),
            domains,
        }
    }

    /// The latest stored sample for one domain, regardless of staleness.
    pub fn latest(&self, domain: &str) -> Option<DomainSample> {
        self.entry(domain)?
            .latest
            .load_full()
            .map(|stored| stored.sample.clone())
    }

    pub fn health(&self, domain: &str) -> Option<ProviderHealth> {
        let entry = self.entry(domain)?;
        let health = entry.health.lock().unwrap_or_else(PoisonError::into_inner);
        Some(health.clone())
    }

    /// Providers whose failure streak reached their surfacing threshold.
    pub fn failing_providers(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| {
                let threshold = entry.settings.borrow().surface_after_failures.max(1);
                let health = entry.health.lock().unwrap_or_else(PoisonError::into_inner);
                health.consecutive_failures >= threshold
            })
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Replaces a provider's settings; its scheduler task picks them up on
    /// its next cycle.
    pub fn update_settings(
        &self,
        domain: &str,
        settings: ProviderSettings,
    ) -> Result<(), ConfigurationError> {
        let entry = self
            .entry(domain)
            .ok_or_else(|| ConfigurationError::UnknownProvider(domain.to_string()))?;
        entry.settings.send_if_modified(|current| {
            if *current == settings {
                false
            } else {
                *current = settings;
                true
            }
        });
        Ok(())
    }
}
