//! InfluxDB v2 HTTP backend.

use super::backend::{BackendError, Point, QueryRow, TimeSeriesBackend};
use super::line_protocol;
use crate::codec::FlatRecord;
use crate::config::BackendConfig;
use crate::core::MetricValue;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Writes line protocol to `/api/v2/write` and reads back with Flux.
pub struct InfluxBackend {
    client: reqwest::Client,
    url: String,
    org: String,
    bucket: String,
    token: Option<String>,
}

impl InfluxBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            token: config.token.clone(),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, format!("Token {}", token)),
            None => request,
        }
    }

    fn flux(&self, measurement: &str, range: Duration) -> String {
        format!(
            "from(bucket: \"{bucket}\")\n  |> range(start: -{secs}s)\n  |> filter(fn: (r) => r._measurement == \"{measurement}\")\n  |> pivot(rowKey: [\"_time\"], columnKey: [\"_field\"], valueColumn: \"_value\")",
            bucket = self.bucket.replace('"', "\\\""),
            secs = range.as_secs().max(1),
            measurement = measurement.replace('"', "\\\""),
        )
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    BackendError::Transient(e.to_string())
}

/// Sorts a non-success response into the error taxonomy.
pub(crate) fn classify(status: StatusCode, body: &str) -> BackendError {
    let detail = format!("{}: {}", status, body.trim());
    match status.as_u16() {
        400 | 422 if body.to_ascii_lowercase().contains("type conflict") => {
            BackendError::SchemaConflict(detail)
        }
        400 | 413 | 422 => BackendError::Rejected(detail),
        401 | 403 | 404 | 408 | 429 => BackendError::Transient(detail),
        s if s >= 500 => BackendError::Transient(detail),
        _ => BackendError::Rejected(detail),
    }
}

#[async_trait]
impl TimeSeriesBackend for InfluxBackend {
    fn name(&self) -> &str {
        "influxdb"
    }

    #[instrument(skip(self, points), fields(count = points.len()))]
    async fn write(&self, points: &[Point]) -> Result<(), BackendError> {
        let body = line_protocol::encode_batch(points);
        if body.is_empty() {
            return Ok(());
        }

        let request = self
            .client
            .post(format!("{}/api/v2/write", self.url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        let response = self.authorized(request).send().await.map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            debug!(status = %status, "Batch written.");
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify(status, &text))
    }

    #[instrument(skip(self))]
    async fn query(
        &self,
        measurement: &str,
        range: Duration,
    ) -> Result<Vec<QueryRow>, BackendError> {
        let request = self
            .client
            .post(format!("{}/api/v2/query", self.url))
            .query(&[("org", self.org.as_str())])
            .header(reqwest::header::ACCEPT, "application/csv")
            .json(&serde_json::json!({
                "query": self.flux(measurement, range),
                "type": "flux",
                "dialect": {
                    "header": true,
                    "annotations": ["datatype", "group", "default"],
                },
            }));
        let response = self.authorized(request).send().await.map_err(transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify(status, &text));
        }
        parse_annotated_csv(&text)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(format!("{}/health", self.url))
            .send()
            .await
            .map_err(transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Transient(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }
}

#[derive(Default)]
struct Table {
    datatypes: Vec<String>,
    groups: Vec<bool>,
    header: Option<Vec<String>>,
}

fn is_field_column(name: &str, grouped: bool) -> bool {
    !grouped && !name.is_empty() && !name.starts_with('_') && name != "result" && name != "table"
}

fn decode(datatype: &str, raw: &str) -> Option<MetricValue> {
    if raw.is_empty() {
        return None;
    }
    match datatype {
        "long" => raw.parse::<i64>().ok().map(MetricValue::Integer),
        "unsignedLong" => raw.parse::<u64>().ok().map(MetricValue::from),
        "double" => raw.parse::<f64>().ok().map(MetricValue::Real),
        // Booleans are never written by the agent; anything else reads as text.
        _ => Some(MetricValue::Text(raw.to_string())),
    }
}

/// Parses Flux annotated CSV of pivoted rows.
///
/// The `#datatype` annotation of each table decides the kind of every value,
/// so integers come back as integers. Grouped columns are tags and are not
/// returned as fields.
pub(crate) fn parse_annotated_csv(body: &str) -> Result<Vec<QueryRow>, BackendError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut rows = Vec::new();
    let mut table = Table::default();

    for record in reader.records() {
        let record = record.map_err(|e| BackendError::Rejected(format!("malformed query response: {}", e)))?;
        let first = record.get(0).unwrap_or_default();

        match first {
            "#datatype" => {
                table = Table {
                    datatypes: record.iter().map(str::to_string).collect(),
                    ..Default::default()
                };
                continue;
            }
            "#group" => {
                table.groups = record.iter().map(|v| v == "true").collect();
                continue;
            }
            f if f.starts_with('#') => continue,
            _ => {}
        }

        let Some(header) = &table.header else {
            table.header = Some(record.iter().map(str::to_string).collect());
            continue;
        };

        let mut time = None;
        let mut fields = FlatRecord::new();
        for (i, raw) in record.iter().enumerate() {
            let Some(name) = header.get(i) else { continue };
            if name == "_time" {
                time = DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc));
                continue;
            }
            let grouped = table.groups.get(i).copied().unwrap_or(false);
            if !is_field_column(name, grouped) {
                continue;
            }
            let datatype = table.datatypes.get(i).map(String::as_str).unwrap_or("string");
            if let Some(value) = decode(datatype, raw) {
                fields.insert(name.clone(), value);
            }
        }

        match time {
            Some(time) => rows.push(QueryRow { time, fields }),
            None => warn!("Query row without a _time column, skipping."),
        }
    }

    rows.sort_by_key(|row| row.time);
    Ok(rows)
}
