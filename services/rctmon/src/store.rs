//! Last-value cache of device readings
//!
//! The scheduler is the only writer; exposition scrapes and tests read. Entries
//! are `Arc<Reading>` so a write is a pointer swap inside one shard and a
//! reader always sees a whole reading, old or new.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

use crate::protocol::Value;

/// Sorted label pairs, part of a reading's identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSet(Vec<(String, String)>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs; a repeated key keeps the last value
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut set = Self::new();
        for (key, value) in pairs {
            set.insert(key, value);
        }
        set
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.binary_search_by(|(k, _)| k.as_str().cmp(key.as_str())) {
            Ok(pos) => self.0[pos].1 = value,
            Err(pos) => self.0.insert(pos, (key, value)),
        }
    }

    /// Copy with one more label
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut set = self.clone();
        set.insert(key, value);
        set
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|pos| self.0[pos].1.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={:?}", key, value)?;
        }
        f.write_str("}")
    }
}

/// Store key: identifier plus label set
pub type ReadingKey = (u32, LabelSet);

/// One decoded value with everything a sink needs to export it
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub oid: u32,
    pub metric: &'static str,
    pub labels: LabelSet,
    pub value: Value,
    pub observed_at: DateTime<Utc>,
}

impl Reading {
    pub fn key(&self) -> ReadingKey {
        (self.oid, self.labels.clone())
    }

    /// Same identifier and labels as `other`
    pub fn same_series(&self, other: &Reading) -> bool {
        self.oid == other.oid && self.labels == other.labels
    }
}

/// Concurrent map of the latest reading per series
#[derive(Debug, Default)]
pub struct MetricStore {
    entries: DashMap<ReadingKey, Arc<Reading>>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for the reading's series and return the stored value
    pub fn write(&self, reading: Reading) -> Arc<Reading> {
        let reading = Arc::new(reading);
        self.entries.insert(reading.key(), Arc::clone(&reading));
        reading
    }

    /// Latest reading, or `None` when the series has not been observed yet
    pub fn get(&self, oid: u32, labels: &LabelSet) -> Option<Arc<Reading>> {
        self.entries
            .get(&(oid, labels.clone()))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All readings for a metric name, in label order
    pub fn by_metric(&self, metric: &str) -> Vec<Arc<Reading>> {
        let mut readings: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.value().metric == metric)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        readings.sort_by(|a, b| a.labels.cmp(&b.labels));
        readings
    }

    /// Every stored reading, ordered by metric name then labels
    pub fn snapshot(&self) -> Vec<Arc<Reading>> {
        let mut readings: Vec<_> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        readings.sort_by(|a, b| (a.metric, &a.labels).cmp(&(b.metric, &b.labels)));
        readings
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
