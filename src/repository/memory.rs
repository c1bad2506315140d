//! In-memory repository backed by a concurrent map.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::MetricError;
use crate::metric::{merge, Metric, MetricKind};

use super::Repository;

#[derive(Default)]
pub struct MemoryRepository {
    entries: DashMap<(String, MetricKind), Metric>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert(&self, metric: Metric) -> Metric {
        match self.entries.entry(metric.key()) {
            Entry::Occupied(mut occupied) => {
                let merged = merge(occupied.get(), &metric);
                occupied.insert(merged.clone());
                merged
            }
            Entry::Vacant(vacant) => {
                vacant.insert(metric.clone());
                metric
            }
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_or_update(&self, metric: Metric) -> Result<Metric, MetricError> {
        Ok(self.upsert(metric))
    }

    async fn save_or_update_batch(&self, metrics: Vec<Metric>) -> Result<(), MetricError> {
        for metric in metrics {
            self.upsert(metric);
        }
        Ok(())
    }

    async fn get(&self, id: &str, kind: MetricKind) -> Result<Metric, MetricError> {
        self.entries
            .get(&(id.to_string(), kind))
            .map(|entry| entry.value().clone())
            .ok_or(MetricError::NotFound)
    }

    async fn list(&self) -> Result<Vec<Metric>, MetricError> {
        Ok(self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list_by_kind(&self, kind: MetricKind) -> Result<Vec<Metric>, MetricError> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.value().kind == kind)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn ping(&self) -> Result<(), MetricError> {
        Ok(())
    }

    async fn bootstrap(&self) -> Result<(), MetricError> {
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_updates_accumulate() {
        let repo = MemoryRepository::new();
        repo.save_or_update(Metric::counter("req", 2)).await.unwrap();
        let stored = repo.save_or_update(Metric::counter("req", 3)).await.unwrap();
        assert_eq!(stored.delta, Some(5));

        let fetched = repo.get("req", MetricKind::Counter).await.unwrap();
        assert_eq!(fetched.delta, Some(5));
    }

    #[tokio::test]
    async fn gauge_updates_replace() {
        let repo = MemoryRepository::new();
        repo.save_or_update(Metric::gauge("cpu", 0.9)).await.unwrap();
        repo.save_or_update(Metric::gauge("cpu", 0.1)).await.unwrap();
        let fetched = repo.get("cpu", MetricKind::Gauge).await.unwrap();
        assert_eq!(fetched.value, Some(0.1));
    }

    #[tokio::test]
    async fn kind_mismatch_is_a_miss() {
        let repo = MemoryRepository::new();
        repo.save_or_update(Metric::gauge("x", 1.0)).await.unwrap();
        assert!(matches!(
            repo.get("x", MetricKind::Counter).await,
            Err(MetricError::NotFound)
        ));
    }

    #[tokio::test]
    async fn batch_applies_elementwise() {
        let repo = MemoryRepository::new();
        repo.save_or_update_batch(vec![
            Metric::counter("req", 2),
            Metric::counter("req", 3),
            Metric::gauge("cpu", 0.5),
        ])
        .await
        .unwrap();
        assert_eq!(
            repo.get("req", MetricKind::Counter).await.unwrap().delta,
            Some(5)
        );
        assert_eq!(repo.list().await.unwrap().len(), 2);
        assert_eq!(
            repo.list_by_kind(MetricKind::Gauge).await.unwrap().len(),
            1
        );
    }
}
