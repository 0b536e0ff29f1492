//! Nested-to-flat metric codec.
//!
//! Persistence writes flat key/value fields, so every leaf of a domain tree is
//! joined into a single key (`process` + `pid` becomes `process_pid`). The
//! codec keeps a ledger of every key it has emitted together with the path it
//! came from and the kind it was first written with. The ledger serves two
//! purposes:
//!
//! - Type stability. A key first written as an integer is never written as a
//!   real afterwards (or the reverse). A leaf that changes kind is excluded
//!   from the record and reported as a [`CodecConflict`], never coerced.
//! - Exact unflattening. Keys the codec produced itself map back to their
//!   original path even when a segment contains the separator. Unknown keys
//!   are split on the separator.

use crate::core::{MetricKind, MetricNode, MetricTree, MetricValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, warn};

/// A flat mapping from joined key to a typed scalar.
pub type FlatRecord = BTreeMap<String, MetricValue>;

/// The default join separator between path segments.
pub const DEFAULT_SEPARATOR: &str = "_";

#[derive(Debug, Clone)]
struct KeyInfo {
    path: Vec<String>,
    kind: MetricKind,
}

/// A leaf that could not be flattened without breaking the key's schema.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecConflict {
    /// The leaf's kind differs from the kind the key was first written with.
    Kind {
        key: String,
        expected: MetricKind,
        found: MetricKind,
    },
    /// Two different paths join to the same flat key.
    Collision {
        key: String,
        existing: Vec<String>,
        incoming: Vec<String>,
    },
}

impl CodecConflict {
    pub fn key(&self) -> &str {
        match self {
            CodecConflict::Kind { key, .. } | CodecConflict::Collision { key, .. } => key,
        }
    }
}

/// The result of flattening a tree.
#[derive(Debug, Clone, Default)]
pub struct Flattened {
    pub record: FlatRecord,
    pub conflicts: Vec<CodecConflict>,
}

/// Bidirectional nested/flat transform with a kind ledger.
#[derive(Debug)]
pub struct Codec {
    separator: String,
    ledger: RwLock<HashMap<String, KeyInfo>>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

impl Codec {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            ledger: RwLock::new(HashMap::new()),
        }
    }

    /// Flattens a whole tree; top-level keys become the first key segment.
    pub fn flatten(&self, tree: &MetricTree) -> Flattened {
        let mut leaves = Vec::new();
        collect_leaves(tree, &mut Vec::new(), &mut leaves);
        self.admit(leaves)
    }

    /// Flattens one domain's subtree with the domain name as key prefix.
    pub fn flatten_domain(&self, domain: &str, tree: &MetricTree) -> Flattened {
        let mut leaves = Vec::new();
        collect_leaves(tree, &mut vec![domain.to_string()], &mut leaves);
        self.admit(leaves)
    }

    /// Checks each leaf against the ledger and builds the record.
    fn admit(&self, leaves: Vec<(Vec<String>, MetricValue)>) -> Flattened {
        let mut ledger = self.ledger.write().unwrap_or_else(PoisonError::into_inner);
        let mut out = Flattened::default();

        for (path, value) in leaves {
            let key = path.join(&self.separator);
            let kind = value.kind();
            match ledger.get(&key) {
                Some(info) if info.path != path => {
                    warn!(key = %key, existing = ?info.path, incoming = ?path, "Flat key collision, leaf excluded.");
                    out.conflicts.push(CodecConflict::Collision {
                        key,
                        existing: info.path.clone(),
                        incoming: path,
                    });
                }
                Some(info) if info.kind != kind => {
                    warn!(key = %key, expected = %info.kind, found = %kind, "Metric changed kind, leaf excluded.");
                    out.conflicts.push(CodecConflict::Kind {
                        key,
                        expected: info.kind,
                        found: kind,
                    });
                }
                Some(_) => {
                    out.record.insert(key, value);
                }
                None => {
                    ledger.insert(key.clone(), KeyInfo { path, kind });
                    out.record.insert(key, value);
                }
            }
        }
        out
    }

    /// The kind a flat key was first written with, if known.
    pub fn kind_of(&self, key: &str) -> Option<MetricKind> {
        self.ledger
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|info| info.kind)
    }

    /// Rebuilds a nested tree from a flat record.
    ///
    /// Keys are processed in sorted order so the result does not depend on the
    /// order in which a query returned them. When an unknown key would descend
    /// through an existing leaf, its remaining segments are joined back
    /// together and kept as a single leaf at that level.
    pub fn unflatten(&self, record: &FlatRecord) -> MetricTree {
        let ledger = self.ledger.read().unwrap_or_else(PoisonError::into_inner);
        let mut tree = MetricTree::new();

        for (key, value) in record {
            let segments: Vec<String> = match ledger.get(key) {
                Some(info) => info.path.clone(),
                None => key.split(self.separator.as_str()).map(str::to_string).collect(),
            };
            insert_at(&mut tree, &segments, value.clone(), &self.separator, key);
        }
        tree
    }

    /// Unflattens a record whose keys all carry the `domain` prefix and
    /// returns just that domain's subtree.
    pub fn unflatten_domain(&self, domain: &str, record: &FlatRecord) -> MetricTree {
        let mut tree = self.unflatten(record);
        match tree.get_mut(domain) {
            Some(MetricNode::Branch(branch)) => std::mem::take(branch),
            _ => MetricTree::new(),
        }
    }
}

fn collect_leaves(
    tree: &MetricTree,
    prefix: &mut Vec<String>,
    out: &mut Vec<(Vec<String>, MetricValue)>,
) {
    for (name, node) in tree.iter() {
        prefix.push(name.clone());
        match node {
            MetricNode::Leaf(value) => out.push((prefix.clone(), value.clone())),
            MetricNode::Branch(branch) => collect_leaves(branch, prefix, out),
        }
        prefix.pop();
    }
}

fn insert_at(tree: &mut MetricTree, segments: &[String], value: MetricValue, sep: &str, key: &str) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        if tree.get(first).is_some() {
            debug!(key, "Flat key lands on an occupied node, keeping the first value.");
            return;
        }
        tree.insert_leaf(first.clone(), value);
        return;
    }

    match tree.get_mut(first) {
        Some(MetricNode::Branch(branch)) => insert_at(branch, rest, value, sep, key),
        Some(MetricNode::Leaf(_)) => {
            let joined = segments.join(sep);
            if tree.get(&joined).is_none() {
                tree.insert_leaf(joined, value);
            } else {
                debug!(key, "Flat key collides after rejoining, keeping the first value.");
            }
        }
        None => {
            let mut branch = MetricTree::new();
            insert_at(&mut branch, rest, value, sep, key);
            tree.insert_node(first.clone(), MetricNode::Branch(branch));
        }
    }
}
