//! Resource usage of the agent's own process.

use super::{percent, ProviderSampleError};
use crate::core::MetricTree;
use sysinfo::{Pid, System};

pub struct ProcessProvider {
    system: System,
    pid: Option<Pid>,
    last_thread_count: Option<usize>,
}

impl ProcessProvider {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = sysinfo::get_current_pid().ok();
        if let Some(pid) = pid {
            system.refresh_process(pid);
        }
        Self {
            system,
            pid,
            last_thread_count: None,
        }
    }

    pub fn sample(&mut self) -> Result<MetricTree, ProviderSampleError> {
        let pid = self
            .pid
            .ok_or_else(|| ProviderSampleError::Unavailable("current pid".to_string()))?;

        self.system.refresh_memory();
        if !self.system.refresh_process(pid) {
            return Err(ProviderSampleError::Sample(format!(
                "process {} could not be refreshed",
                pid
            )));
        }
        let process = self
            .system
            .process(pid)
            .ok_or_else(|| ProviderSampleError::Sample(format!("process {} vanished", pid)))?;

        let rss = process.memory();
        let io = process.disk_usage();

        let mut tree = MetricTree::new()
            .with("pid", pid.as_u32())
            .with_branch("uptime", MetricTree::new().with("value", process.run_time()))
            .with_branch("cpu", MetricTree::new().with("value", process.cpu_usage()))
            .with_branch(
                "memory",
                MetricTree::new()
                    .with("rss", rss)
                    .with("vms", process.virtual_memory())
                    .with("percent", percent(rss, self.system.total_memory())),
            )
            .with_branch(
                "io",
                MetricTree::new()
                    .with("read_bytes", io.total_read_bytes)
                    .with("write_bytes", io.total_written_bytes),
            );

        // Thread listing is only available on Linux.
        if let Some(tasks) = process.tasks() {
            let count = tasks.len();
            let delta = self
                .last_thread_count
                .map(|last| count as i64 - last as i64)
                .unwrap_or(0);
            self.last_thread_count = Some(count);
            tree.insert_branch(
                "threads",
                MetricTree::new().with("count", count).with("delta", delta),
            );
        }

        Ok(tree)
    }
}

impl Default for ProcessProvider {
    fn default() -> Self {
        Self::new()
    }
}
