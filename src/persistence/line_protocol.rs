//! InfluxDB line protocol encoding.
//!
//! Integers carry the `i` suffix and reals are always written with a decimal
//! point or exponent, so the backend infers the same field type on every
//! write. Non-finite reals cannot be represented and are skipped.

use super::backend::Point;
use crate::core::MetricValue;
use std::fmt::Write;

fn escape_measurement(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

fn escape_key(raw: &str) -> String {
    escape_measurement(raw).replace('=', "\\=")
}

fn escape_string_field(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('"', "\\\"")
}

fn encode_value(value: &MetricValue) -> Option<String> {
    match value {
        MetricValue::Integer(i) => Some(format!("{}i", i)),
        MetricValue::Real(f) if f.is_finite() => {
            // `{:?}` keeps a trailing `.0` on whole numbers.
            Some(format!("{:?}", f))
        }
        MetricValue::Real(_) => None,
        MetricValue::Text(s) => Some(format!("\"{}\"", escape_string_field(s))),
    }
}

/// Encodes one point. Returns `None` when no field is representable.
pub fn encode_point(point: &Point) -> Option<String> {
    let fields: Vec<String> = point
        .fields
        .iter()
        .filter_map(|(key, value)| {
            encode_value(value).map(|encoded| format!("{}={}", escape_key(key), encoded))
        })
        .collect();
    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(&point.measurement);
    for (key, value) in &point.tags {
        let _ = write!(line, ",{}={}", escape_key(key), escape_key(value));
    }
    line.push(' ');
    line.push_str(&fields.join(","));
    if let Some(nanos) = point.timestamp.timestamp_nanos_opt() {
        let _ = write!(line, " {}", nanos);
    }
    Some(line)
}

/// Encodes a batch, one line per point.
pub fn encode_batch(points: &[Point]) -> String {
    points
        .iter()
        .filter_map(encode_point)
        .collect::<Vec<_>>()
        .join("\n")
}
