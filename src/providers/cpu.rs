//! CPU utilisation, frequency, core counts and load average.

use super::ProviderSampleError;
use crate::core::MetricTree;
use sysinfo::System;

pub struct CpuProvider {
    system: System,
}

impl CpuProvider {
    pub fn new() -> Self {
        let mut system = System::new();
        // Usage is computed between two refreshes; prime the first one here.
        system.refresh_cpu();
        Self { system }
    }

    pub fn sample(&mut self) -> Result<MetricTree, ProviderSampleError> {
        self.system.refresh_cpu();
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return Err(ProviderSampleError::Unavailable("cpu".to_string()));
        }

        let per_core = cpus
            .iter()
            .enumerate()
            .fold(MetricTree::new(), |tree, (i, cpu)| {
                tree.with(format!("core_{}_usage", i), cpu.cpu_usage())
            });

        let mut count = MetricTree::new().with("logical", cpus.len());
        if let Some(physical) = self.system.physical_core_count() {
            count.insert_leaf("physical", physical);
        }

        let load = System::load_average();

        Ok(MetricTree::new()
            .with_branch(
                "average",
                MetricTree::new().with("cpu_percent", self.system.global_cpu_info().cpu_usage()),
            )
            .with_branch("per_core", per_core)
            .with_branch(
                "frequency",
                MetricTree::new().with("current_mhz", cpus[0].frequency()),
            )
            .with_branch("count", count)
            .with_branch(
                "load",
                MetricTree::new()
                    .with("1min", load.one)
                    .with("5min", load.five)
                    .with("15min", load.fifteen),
            ))
    }
}

impl Default for CpuProvider {
    fn default() -> Self {
        Self::new()
    }
}
