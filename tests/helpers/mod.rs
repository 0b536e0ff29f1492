#![allow(dead_code)]


use hostwatch::core::{MetricSnapshot, MetricTree};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

/// Opt-in log output for a test run.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("hostwatch=debug")
        .with_test_writer()
        .try_init();
}

/// A process-like tree: an integer pid and a real cpu value.
pub fn process_tree(pid: i64, cpu: f64) -> MetricTree {
    MetricTree::new()
        .with("pid", pid)
        .with_branch("cpu", MetricTree::new().with("value", cpu))
        .with_branch("threads", MetricTree::new().with("count", 4_i64))
}

pub fn cpu_tree(percent: f64) -> MetricTree {
    MetricTree::new().with_branch("average", MetricTree::new().with("cpu_percent", percent))
}

/// Waits until a published snapshot satisfies `predicate`.
pub async fn wait_for_snapshot<F>(
    rx: &mut watch::Receiver<Arc<MetricSnapshot>>,
    within: Duration,
    predicate: F,
) -> Arc<MetricSnapshot>
where
    F: Fn(&MetricSnapshot) -> bool,
{
    timeout(within, async {
        loop {
            {
                let current = rx.borrow_and_update().clone();
                if predicate(&current) {
                    return current;
                }
            }
            rx.changed().await.expect("snapshot channel closed");
        }
    })
    .await
    .expect("no matching snapshot was published in time")
}

/// Polls `condition` every 20ms until it holds.
pub async fn eventually<F>(within: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout(within, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}
