//! Per-partition disk usage.

use super::{percent, sanitize_key, ProviderSampleError};
use crate::core::MetricTree;
use sysinfo::Disks;

pub struct DiskProvider {
    disks: Disks,
}

impl DiskProvider {
    pub fn new() -> Self {
        Self {
            disks: Disks::new(),
        }
    }

    /// One branch per mounted partition. Mounts come and go, so the list is
    /// rebuilt on every cycle.
    pub fn sample(&mut self) -> Result<MetricTree, ProviderSampleError> {
        self.disks.refresh_list();

        let mut tree = MetricTree::new();
        for disk in self.disks.list() {
            let device = disk.name().to_string_lossy();
            let mountpoint = disk.mount_point().to_string_lossy();
            let total = disk.total_space();
            let free = disk.available_space();
            let used = total.saturating_sub(free);

            let metrics = MetricTree::new()
                .with("total_bytes", total)
                .with("used_bytes", used)
                .with("free_bytes", free)
                .with("usage_percent", percent(used, total));

            tree.insert_branch(
                sanitize_key(&format!("{}_{}", device, mountpoint)),
                MetricTree::new()
                    .with("device", device.to_string())
                    .with("mountpoint", mountpoint.to_string())
                    .with("fstype", disk.file_system().to_string_lossy().into_owned())
                    .with_branch("metrics", metrics),
            );
        }
        Ok(tree)
    }
}

impl Default for DiskProvider {
    fn default() -> Self {
        Self::new()
    }
}
