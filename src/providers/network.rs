//! Aggregate and per-interface network I/O counters.

use super::{sanitize_key, ProviderSampleError};
use crate::core::MetricTree;
use std::time::Instant;
use sysinfo::Networks;

pub struct NetworkProvider {
    networks: Networks,
    last_refresh: Instant,
}

impl NetworkProvider {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
            last_refresh: Instant::now(),
        }
    }

    pub fn sample(&mut self) -> Result<MetricTree, ProviderSampleError> {
        self.networks.refresh();
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refresh).as_secs_f64();
        self.last_refresh = now;

        let (mut sent, mut recv, mut packets_sent, mut packets_recv, mut errin, mut errout) =
            (0u64, 0u64, 0u64, 0u64, 0u64, 0u64);
        let mut interfaces = MetricTree::new();

        for (name, data) in self.networks.list() {
            sent = sent.saturating_add(data.total_transmitted());
            recv = recv.saturating_add(data.total_received());
            packets_sent = packets_sent.saturating_add(data.total_packets_transmitted());
            packets_recv = packets_recv.saturating_add(data.total_packets_received());
            errin = errin.saturating_add(data.total_errors_on_received());
            errout = errout.saturating_add(data.total_errors_on_transmitted());

            let rate = |bytes: u64| if elapsed > 0.0 { bytes as f64 / elapsed } else { 0.0 };
            interfaces.insert_branch(
                sanitize_key(name),
                MetricTree::new()
                    .with("bytes_sent", data.total_transmitted())
                    .with("bytes_recv", data.total_received())
                    .with("tx_rate", rate(data.transmitted()))
                    .with("rx_rate", rate(data.received())),
            );
        }

        let counters = MetricTree::new()
            .with("bytes_sent", sent)
            .with("bytes_recv", recv)
            .with("packets_sent", packets_sent)
            .with("packets_recv", packets_recv)
            .with("errin", errin)
            .with("errout", errout);

        Ok(MetricTree::new()
            .with_branch("io_counters", MetricTree::new().with_branch("metrics", counters))
            .with_branch("interfaces", interfaces))
    }
}

impl Default for NetworkProvider {
    fn default() -> Self {
        Self::new()
    }
}
