//! Core domain types for hostwatch
//!
//! This module defines the value model shared by every component: the typed
//! scalar leaves produced by providers, the nested trees that hold them, and
//! the merged snapshot handed to persistence, alerting and live consumers.

use crate::alerts::AlertEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A single sampled scalar.
///
/// The variant is the leaf's kind and never changes for a given key. Integer
/// counters (pids, byte totals, thread counts) stay `Integer` all the way to
/// the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

/// The kind of a [`MetricValue`], as recorded by the codec ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Integer,
    Real,
    Text,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Integer => write!(f, "integer"),
            MetricKind::Real => write!(f, "real"),
            MetricKind::Text => write!(f, "text"),
        }
    }
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Integer(_) => MetricKind::Integer,
            MetricValue::Real(_) => MetricKind::Real,
            MetricValue::Text(_) => MetricKind::Text,
        }
    }

    /// Numeric view used for threshold comparisons. Text has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Integer(v) => Some(*v as f64),
            MetricValue::Real(v) => Some(*v),
            MetricValue::Text(_) => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(v) => write!(f, "{}", v),
            MetricValue::Real(v) => write!(f, "{}", v),
            MetricValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Integer(v)
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Integer(v.into())
    }
}

impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::Integer(v.into())
    }
}

// Counters above i64::MAX saturate instead of switching kind.
impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Real(v)
    }
}

impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        MetricValue::Real(v.into())
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// A node in a metric tree: either a typed leaf or a nested branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricNode {
    Leaf(MetricValue),
    Branch(MetricTree),
}

impl From<MetricValue> for MetricNode {
    fn from(v: MetricValue) -> Self {
        MetricNode::Leaf(v)
    }
}

impl From<MetricTree> for MetricNode {
    fn from(v: MetricTree) -> Self {
        MetricNode::Branch(v)
    }
}

/// A nested mapping of names to metric nodes, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricTree(BTreeMap<String, MetricNode>);

impl MetricTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style leaf insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.insert_leaf(key, value);
        self
    }

    /// Builder-style branch insertion.
    pub fn with_branch(mut self, key: impl Into<String>, branch: MetricTree) -> Self {
        self.insert_branch(key, branch);
        self
    }

    pub fn insert_leaf(&mut self, key: impl Into<String>, value: impl Into<MetricValue>) {
        self.0.insert(key.into(), MetricNode::Leaf(value.into()));
    }

    pub fn insert_branch(&mut self, key: impl Into<String>, branch: MetricTree) {
        self.0.insert(key.into(), MetricNode::Branch(branch));
    }

    pub(crate) fn insert_node(&mut self, key: String, node: MetricNode) {
        self.0.insert(key, node);
    }

    pub fn get(&self, key: &str) -> Option<&MetricNode> {
        self.0.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut MetricNode> {
        self.0.get_mut(key)
    }

    /// Follows `path` through nested branches and returns the leaf at its end.
    pub fn get_path<'a, I>(&self, path: I) -> Option<&MetricValue>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut segments = path.into_iter().peekable();
        let mut current = self;
        while let Some(segment) = segments.next() {
            match (current.0.get(segment)?, segments.peek()) {
                (MetricNode::Leaf(value), None) => return Some(value),
                (MetricNode::Branch(branch), Some(_)) => current = branch,
                _ => return None,
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricNode)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, MetricNode)> for MetricTree {
    fn from_iter<T: IntoIterator<Item = (String, MetricNode)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The most recent completed sample of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSample {
    pub captured_at: DateTime<Utc>,
    pub tree: MetricTree,
}

/// A point-in-time merge of every domain's latest completed sample.
///
/// Domains may have been captured at different instants; each keeps its own
/// `captured_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub captured_at: DateTime<Utc>,
    pub domains: BTreeMap<String, DomainSample>,
}

impl MetricSnapshot {
    pub fn empty() -> Self {
        Self {
            captured_at: Utc::now(),
            domains: BTreeMap::new(),
        }
    }

    /// Resolves a dotted path such as `cpu.average.cpu_percent`, where the
    /// first segment names the domain.
    pub fn lookup(&self, path: &str) -> Option<&MetricValue> {
        let mut segments = path.split('.');
        let domain = segments.next()?;
        self.domains.get(domain)?.tree.get_path(segments)
    }

    /// The snapshot as a single tree keyed by domain.
    pub fn to_tree(&self) -> MetricTree {
        self.domains
            .iter()
            .map(|(name, sample)| (name.clone(), MetricNode::Branch(sample.tree.clone())))
            .collect()
    }
}

/// Agent health exposed to consumers alongside snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Whether the last backend interaction succeeded.
    pub backend_reachable: bool,
    /// Points waiting in the in-memory persistence buffer.
    pub buffered_points: usize,
    /// Records held in the local fallback log awaiting resync.
    pub fallback_pending: usize,
    /// Providers whose consecutive failures reached their surfacing threshold.
    pub failing_providers: Vec<String>,
}

/// A message delivered to live consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveUpdate {
    Snapshot(Arc<MetricSnapshot>),
    Alert(AlertEvent),
}
