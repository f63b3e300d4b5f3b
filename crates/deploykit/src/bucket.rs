//! Cross-node record store
//!
//! Configs publish [`Record`]s into named buckets so that other configs can
//! consume them, e.g. a load balancer reading the addresses of its backends.
//! Buckets are append-only during a pass and keep publication order.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A tagged data item published by one config.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Producing node.
    pub source_node: String,
    /// Producing (top) config.
    pub source_config: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_config: Option<String>,
    /// Rendered output, for records produced by a file entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Caller-supplied payload.
    #[serde(flatten)]
    pub values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(source_node: impl Into<String>, source_config: impl Into<String>) -> Self {
        Self {
            source_node: source_node.into(),
            source_config: source_config.into(),
            dest_node: None,
            dest_config: None,
            text: None,
            values: BTreeMap::new(),
        }
    }

    /// Make this record an edge towards another node/config.
    pub fn with_dest(mut self, dest_node: impl Into<String>, dest_config: impl Into<String>) -> Self {
        self.dest_node = Some(dest_node.into());
        self.dest_config = Some(dest_config.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{}/{}", self.source_node, self.source_config),
        }
    }
}

/// Named, ordered collections of records.
#[derive(Debug, Clone, Default)]
pub struct BucketStore {
    buckets: BTreeMap<String, Vec<Record>>,
}

impl BucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a bucket for appending, creating it if absent.
    pub fn get_mut(&mut self, name: &str) -> &mut Vec<Record> {
        self.buckets.entry(name.to_string()).or_default()
    }

    /// Records of a bucket; empty if the bucket was never created.
    pub fn get(&self, name: &str) -> &[Record] {
        self.buckets.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn push(&mut self, name: &str, record: Record) {
        self.get_mut(name).push(record);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buckets.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Record])> {
        self.buckets
            .iter()
            .map(|(name, records)| (name.as_str(), records.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}
