//! Keyed `(id, kind)` metric storage.
//!
//! Two backends implement the same capability set: an in-memory map for
//! standalone deployments and a Postgres pool when a DSN is configured.
//! Conflict resolution lives inside each backend so an increment is applied
//! exactly once per write path: the memory store runs the merge engine
//! under its per-key entry lock, the SQL store lets the UPSERT sum.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ServerConfig;
use crate::error::MetricError;
use crate::metric::{Metric, MetricKind};

pub mod memory;
pub mod postgres;

pub use memory::MemoryRepository;
pub use postgres::PostgresRepository;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Upsert one metric and return its stored (post-merge) form.
    async fn save_or_update(&self, metric: Metric) -> Result<Metric, MetricError>;
    async fn save_or_update_batch(&self, metrics: Vec<Metric>) -> Result<(), MetricError>;
    async fn get(&self, id: &str, kind: MetricKind) -> Result<Metric, MetricError>;
    async fn list(&self) -> Result<Vec<Metric>, MetricError>;
    async fn list_by_kind(&self, kind: MetricKind) -> Result<Vec<Metric>, MetricError>;
    async fn ping(&self) -> Result<(), MetricError>;
    /// Prepare backing storage; idempotent.
    async fn bootstrap(&self) -> Result<(), MetricError>;
    async fn close(&self);
}

pub async fn build(cfg: &ServerConfig) -> Result<Arc<dyn Repository>, MetricError> {
    match &cfg.database_dsn {
        Some(dsn) => {
            let repo = PostgresRepository::connect(dsn, &cfg.storage).await?;
            Ok(Arc::new(repo))
        }
        None => Ok(Arc::new(MemoryRepository::new())),
    }
}
