//! Virtual memory and swap usage.

use super::{percent, ProviderSampleError};
use crate::core::MetricTree;
use sysinfo::System;

pub struct MemoryProvider {
    system: System,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    pub fn sample(&mut self) -> Result<MetricTree, ProviderSampleError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(ProviderSampleError::Unavailable("memory".to_string()));
        }
        let used = self.system.used_memory();

        let virtual_memory = MetricTree::new()
            .with("total", total)
            .with("used", used)
            .with("free", self.system.free_memory())
            .with("available", self.system.available_memory())
            .with("percent", percent(used, total));

        let swap_total = self.system.total_swap();
        let swap_used = self.system.used_swap();
        let swap_memory = MetricTree::new()
            .with("total", swap_total)
            .with("used", swap_used)
            .with("free", self.system.free_swap())
            .with("percent", percent(swap_used, swap_total));

        Ok(MetricTree::new()
            .with_branch("virtual_memory", virtual_memory)
            .with_branch("swap_memory", swap_memory))
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}
