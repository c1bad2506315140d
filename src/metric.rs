//! The metric record and its merge semantics.
//!
//! A metric is keyed by `(id, kind)`; the same id may exist independently
//! as a counter and as a gauge.  Counters accumulate deltas, gauges keep
//! the latest value.  The merge rules are pure functions dispatched on the
//! kind tag so both repository backends share one source of truth.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MetricError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            _ => Err(MetricError::InvalidType),
        }
    }
}

/// Wire and storage representation of a single metric.  Exactly one of
/// `delta` / `value` is populated, determined by `kind`.  The `hash` field
/// is carried opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Metric {
    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Metric {
            id: id.into(),
            kind: MetricKind::Counter,
            delta: Some(delta),
            value: None,
            hash: None,
        }
    }

    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Metric {
            id: id.into(),
            kind: MetricKind::Gauge,
            delta: None,
            value: Some(value),
            hash: None,
        }
    }

    pub fn key(&self) -> (String, MetricKind) {
        (self.id.clone(), self.kind)
    }

    /// Plain numeric rendering used by `GET /value/{kind}/{id}`.
    pub fn render_value(&self) -> String {
        match self.kind {
            MetricKind::Counter => self.delta.unwrap_or(0).to_string(),
            MetricKind::Gauge => self.value.unwrap_or(0.0).to_string(),
        }
    }

    /// Enforce the per-kind field invariants: a counter must carry a delta
    /// and never a value, and vice versa.  An empty id is reported as a
    /// missing metric, matching the lookup surface for unnamed keys.
    pub fn validated(mut self) -> Result<Metric, MetricError> {
        if self.id.is_empty() {
            return Err(MetricError::NotFound);
        }
        match self.kind {
            MetricKind::Counter => {
                if self.delta.is_none() {
                    return Err(MetricError::MissingValue);
                }
                self.value = None;
            }
            MetricKind::Gauge => {
                if self.value.is_none() {
                    return Err(MetricError::MissingValue);
                }
                self.delta = None;
            }
        }
        Ok(self)
    }
}

/// Merge an incoming metric into its stored predecessor.  Counter deltas
/// add (missing treated as zero); a gauge discards the old value.
pub fn merge(old: &Metric, new: &Metric) -> Metric {
    match new.kind {
        MetricKind::Counter => Metric {
            id: new.id.clone(),
            kind: MetricKind::Counter,
            delta: Some(old.delta.unwrap_or(0) + new.delta.unwrap_or(0)),
            value: None,
            hash: new.hash.clone(),
        },
        MetricKind::Gauge => Metric {
            id: new.id.clone(),
            kind: MetricKind::Gauge,
            delta: None,
            value: new.value,
            hash: new.hash.clone(),
        },
    }
}

/// Collapse duplicate `(id, kind)` entries within one batch, preserving
/// first-seen order.  A single SQL UPSERT statement must not touch the
/// same row twice, so batches are folded before they reach the database;
/// folding applies the same merge rules, keeping observable sums intact.
pub fn fold_batch(metrics: Vec<Metric>) -> Vec<Metric> {
    let mut order: Vec<Metric> = Vec::with_capacity(metrics.len());
    let mut index: HashMap<(String, MetricKind), usize> = HashMap::with_capacity(metrics.len());
    for metric in metrics {
        match index.get(&metric.key()) {
            Some(&i) => order[i] = merge(&order[i], &metric),
            None => {
                index.insert(metric.key(), order.len());
                order.push(metric);
            }
        }
    }
    order
}
