//! Ingestion core shared by the HTTP handlers and the gRPC service.
//!
//! The service delegates conflict resolution to the repository (see the
//! repository module for the one-merge-per-path rule) and keeps the
//! snapshot mirror in step when write-through mode is active.  Snapshot
//! failures are logged and never fail the request.

use std::sync::Arc;

use crate::error::MetricError;
use crate::metric::{Metric, MetricKind};
use crate::repository::Repository;
use crate::snapshot::SnapshotStore;

pub struct MetricService {
    repo: Arc<dyn Repository>,
    snapshot: Option<Arc<SnapshotStore>>,
}

impl MetricService {
    pub fn new(repo: Arc<dyn Repository>, snapshot: Option<Arc<SnapshotStore>>) -> Self {
        MetricService { repo, snapshot }
    }

    pub async fn save_or_update(&self, metric: Metric) -> Result<Metric, MetricError> {
        let stored = self.repo.save_or_update(metric).await?;
        if let Some(snapshot) = self.write_through() {
            if let Err(err) = snapshot.write_one(&stored) {
                tracing::error!(error = %err, "failed to mirror metric to snapshot file");
            }
        }
        tracing::debug!(id = %stored.id, kind = %stored.kind, "metric updated");
        Ok(stored)
    }

    pub async fn save_or_update_batch(&self, metrics: Vec<Metric>) -> Result<(), MetricError> {
        self.repo.save_or_update_batch(metrics).await?;
        if let Some(snapshot) = self.write_through() {
            if let Err(err) = snapshot.flush_all().await {
                tracing::error!(error = %err, "failed to mirror batch to snapshot file");
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &str, kind: MetricKind) -> Result<Metric, MetricError> {
        self.repo.get(id, kind).await
    }

    pub async fn list(&self) -> Result<Vec<Metric>, MetricError> {
        self.repo.list().await
    }

    pub async fn list_by_kind(&self, kind: MetricKind) -> Result<Vec<Metric>, MetricError> {
        self.repo.list_by_kind(kind).await
    }

    pub async fn ping(&self) -> Result<(), MetricError> {
        self.repo.ping().await
    }

    fn write_through(&self) -> Option<&Arc<SnapshotStore>> {
        self.snapshot.as_ref().filter(|s| s.sync_mode())
    }
}
