//! Metric providers.
//!
//! Each provider reads one domain of host state and returns it as a
//! [`MetricTree`]. Providers are a closed set of variants selected by name at
//! startup; the scheduler drives each one on its own blocking thread.

use crate::core::MetricTree;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

pub mod cpu;
pub mod disk;
pub mod memory;
pub mod network;
pub mod process;
#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;

pub use cpu::CpuProvider;
pub use disk::DiskProvider;
pub use memory::MemoryProvider;
pub use network::NetworkProvider;
pub use process::ProcessProvider;
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{ScriptStep, ScriptedProvider};

/// A single failed sampling cycle for one domain.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderSampleError {
    #[error("{0} is unavailable on this host")]
    Unavailable(String),
    #[error("sampling failed: {0}")]
    Sample(String),
    #[error("sample did not complete within {0:?}")]
    Timeout(Duration),
    #[error("sampler panicked")]
    Panicked,
}

/// The built-in provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Cpu,
    Memory,
    Disk,
    Network,
    Process,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Cpu,
        ProviderKind::Memory,
        ProviderKind::Disk,
        ProviderKind::Network,
        ProviderKind::Process,
    ];

    /// The domain name this provider records under.
    pub fn domain(&self) -> &'static str {
        match self {
            ProviderKind::Cpu => "cpu",
            ProviderKind::Memory => "memory",
            ProviderKind::Disk => "disk",
            ProviderKind::Network => "network",
            ProviderKind::Process => "process",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.domain())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.domain() == s)
            .ok_or_else(|| format!("unknown provider '{}'", s))
    }
}

/// A sampler for one domain.
pub enum Provider {
    Cpu(CpuProvider),
    Memory(MemoryProvider),
    Disk(DiskProvider),
    Network(NetworkProvider),
    Process(ProcessProvider),
    #[cfg(any(test, feature = "test-utils"))]
    Scripted(ScriptedProvider),
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::Cpu(_) => "Cpu",
            Provider::Memory(_) => "Memory",
            Provider::Disk(_) => "Disk",
            Provider::Network(_) => "Network",
            Provider::Process(_) => "Process",
            #[cfg(any(test, feature = "test-utils"))]
            Provider::Scripted(_) => "Scripted",
        };
        f.debug_tuple("Provider").field(&name).finish()
    }
}

impl Provider {
    /// Creates the host provider for `kind`.
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Cpu => Provider::Cpu(CpuProvider::new()),
            ProviderKind::Memory => Provider::Memory(MemoryProvider::new()),
            ProviderKind::Disk => Provider::Disk(DiskProvider::new()),
            ProviderKind::Network => Provider::Network(NetworkProvider::new()),
            ProviderKind::Process => Provider::Process(ProcessProvider::new()),
        }
    }

    /// Reads the current state of this provider's domain.
    ///
    /// This blocks on host interfaces and must be called off the async
    /// executor.
    pub fn sample(&mut self) -> Result<MetricTree, ProviderSampleError> {
        match self {
            Provider::Cpu(p) => p.sample(),
            Provider::Memory(p) => p.sample(),
            Provider::Disk(p) => p.sample(),
            Provider::Network(p) => p.sample(),
            Provider::Process(p) => p.sample(),
            #[cfg(any(test, feature = "test-utils"))]
            Provider::Scripted(p) => p.sample(),
        }
    }
}

static SANITIZE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"[^0-9A-Za-z_]+").expect("sanitize pattern is valid")
});

/// Turns a device, mountpoint or interface name into a safe tree key.
pub fn sanitize_key(raw: &str) -> String {
    let key = SANITIZE_RE.replace_all(raw, "_");
    let key = key.trim_matches('_');
    if key.is_empty() {
        "root".to_string()
    } else {
        key.to_string()
    }
}

pub(crate) fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
