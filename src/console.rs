//! Terminal output: one-shot snapshot rendering and the `watch` refresh loop.

use crate::codec::{Codec, FlatRecord};
use crate::core::{AgentStatus, LiveUpdate, MetricSnapshot, MetricValue};
use crate::fanout::Subscription;
use crate::web::StatusSource;
use anyhow::Result;
use std::collections::BTreeSet;
use std::fmt::Write;
use tokio::sync::watch;
use tracing::{info, instrument};

/// Pretty JSON of the whole snapshot, domains nested.
pub fn render_json(snapshot: &MetricSnapshot) -> Result<String> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

/// A CSV header and a single row: `captured_at` followed by every flattened
/// field in key order.
pub fn render_csv(snapshot: &MetricSnapshot, codec: &Codec) -> Result<String> {
    render_csv_rows(std::slice::from_ref(snapshot), codec)
}

/// One row per snapshot under a shared header. Columns are the union of
/// every snapshot's fields; a field a snapshot lacks is left empty.
pub fn render_csv_rows(snapshots: &[MetricSnapshot], codec: &Codec) -> Result<String> {
    let records: Vec<FlatRecord> = snapshots
        .iter()
        .map(|snapshot| codec.flatten(&snapshot.to_tree()).record)
        .collect();
    let columns: BTreeSet<&String> = records.iter().flat_map(|record| record.keys()).collect();
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["captured_at"];
    header.extend(columns.iter().map(|key| key.as_str()));
    writer.write_record(&header)?;

    for (snapshot, record) in snapshots.iter().zip(&records) {
        let mut row = vec![snapshot.captured_at.to_rfc3339()];
        row.extend(
            columns
                .iter()
                .map(|key| record.get(*key).map(|v| v.to_string()).unwrap_or_default()),
        );
        writer.write_record(&row)?;
    }

    Ok(String::from_utf8(writer.into_inner()?)?)
}

fn percent(snapshot: &MetricSnapshot, path: &str) -> Option<f64> {
    snapshot.lookup(path).and_then(MetricValue::as_f64)
}

/// One status line for a snapshot.
pub fn summary_line(snapshot: &MetricSnapshot, status: &AgentStatus) -> String {
    let mut line = snapshot.captured_at.format("%H:%M:%S").to_string();
    if let Some(cpu) = percent(snapshot, "cpu.average.cpu_percent") {
        let _ = write!(line, " cpu {:.1}%", cpu);
    }
    if let Some(mem) = percent(snapshot, "memory.virtual_memory.percent") {
        let _ = write!(line, " mem {:.1}%", mem);
    }
    if let Some(rss) = snapshot.lookup("process.memory.rss").and_then(MetricValue::as_f64) {
        let _ = write!(line, " rss {:.1}MiB", rss / (1024.0 * 1024.0));
    }
    let _ = write!(line, " | {} domains", snapshot.domains.len());
    let _ = write!(
        line,
        " | backend {}",
        if status.backend_reachable { "up" } else { "down" }
    );
    if status.buffered_points > 0 || status.fallback_pending > 0 {
        let _ = write!(
            line,
            " ({} buffered, {} in fallback)",
            status.buffered_points, status.fallback_pending
        );
    }
    if !status.failing_providers.is_empty() {
        let _ = write!(line, " | failing: {}", status.failing_providers.join(","));
    }
    line
}

/// Prints a line for every delivered update until shutdown.
#[instrument(skip_all)]
pub async fn run(
    subscription: Subscription<LiveUpdate>,
    status: StatusSource,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Console consumer started.");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            update = subscription.recv() => match update {
                Some(LiveUpdate::Snapshot(snapshot)) => {
                    println!("{}", summary_line(&snapshot, &status.status()));
                }
                Some(LiveUpdate::Alert(event)) => {
                    println!(
                        "ALERT {} {} -> {} ({} = {})",
                        event.rule, event.old_state, event.new_state, event.metric, event.value
                    );
                }
                None => break,
            }
        }
    }
    info!("Console consumer finished.");
}
