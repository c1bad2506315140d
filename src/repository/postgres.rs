//! Postgres repository on a sqlx pool.
//!
//! Every statement runs under the storage backoff envelope; errors the
//! classifier marks permanent short-circuit immediately.  Counter merging
//! happens inside the UPSERT, so callers always pass the raw delta.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::StorageConfig;
use crate::error::MetricError;
use crate::metric::{fold_batch, Metric, MetricKind};
use crate::retry::{storage_backoff, to_backoff};

use super::Repository;

const BOOTSTRAP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS metrics (
    id VARCHAR(255) NOT NULL,
    kind VARCHAR(50) NOT NULL CHECK (kind IN ('counter', 'gauge')),
    delta BIGINT,
    value DOUBLE PRECISION,
    hash VARCHAR(255),
    created_at TIMESTAMPTZ DEFAULT NOW(),
    updated_at TIMESTAMPTZ DEFAULT NOW(),
    PRIMARY KEY (id, kind)
)"#;

const UPSERT_ONE_SQL: &str = r#"
INSERT INTO metrics (id, kind, delta, value, hash)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (id, kind) DO UPDATE SET
    delta = CASE
        WHEN metrics.kind = 'counter'
            THEN COALESCE(metrics.delta, 0) + COALESCE(EXCLUDED.delta, 0)
        ELSE EXCLUDED.delta
    END,
    value = CASE
        WHEN metrics.kind = 'gauge' THEN EXCLUDED.value
        ELSE metrics.value
    END,
    hash = EXCLUDED.hash,
    updated_at = NOW()
RETURNING id, kind, delta, value, hash"#;

const UPSERT_BATCH_SQL: &str = r#"
INSERT INTO metrics (id, kind, delta, value, hash)
SELECT * FROM UNNEST($1::text[], $2::text[], $3::bigint[], $4::double precision[], $5::text[])
ON CONFLICT (id, kind) DO UPDATE SET
    delta = CASE
        WHEN metrics.kind = 'counter'
            THEN COALESCE(metrics.delta, 0) + COALESCE(EXCLUDED.delta, 0)
        ELSE EXCLUDED.delta
    END,
    value = CASE
        WHEN metrics.kind = 'gauge' THEN EXCLUDED.value
        ELSE metrics.value
    END,
    hash = EXCLUDED.hash,
    updated_at = NOW()"#;

const SELECT_ONE_SQL: &str =
    "SELECT id, kind, delta, value, hash FROM metrics WHERE id = $1 AND kind = $2";
const SELECT_ALL_SQL: &str = "SELECT id, kind, delta, value, hash FROM metrics";
const SELECT_BY_KIND_SQL: &str =
    "SELECT id, kind, delta, value, hash FROM metrics WHERE kind = $1";

#[derive(sqlx::FromRow)]
struct MetricRow {
    id: String,
    kind: String,
    delta: Option<i64>,
    value: Option<f64>,
    hash: Option<String>,
}

impl TryFrom<MetricRow> for Metric {
    type Error = MetricError;

    fn try_from(row: MetricRow) -> Result<Self, Self::Error> {
        Ok(Metric {
            id: row.id,
            kind: row.kind.parse()?,
            delta: row.delta,
            value: row.value,
            hash: row.hash,
        })
    }
}

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(dsn: &str, cfg: &StorageConfig) -> Result<Self, MetricError> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_conns)
            .min_connections(cfg.min_conns)
            .max_lifetime(Duration::from_secs(cfg.max_lifetime_secs))
            .idle_timeout(Duration::from_secs(cfg.max_idle_secs))
            .connect(dsn)
            .await
            .map_err(MetricError::Storage)?;
        Ok(PostgresRepository { pool })
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn save_or_update(&self, metric: Metric) -> Result<Metric, MetricError> {
        let row = backoff::future::retry(storage_backoff(), || async {
            sqlx::query_as::<_, MetricRow>(UPSERT_ONE_SQL)
                .bind(&metric.id)
                .bind(metric.kind.as_str())
                .bind(metric.delta)
                .bind(metric.value)
                .bind(&metric.hash)
                .fetch_one(&self.pool)
                .await
                .map_err(to_backoff)
        })
        .await
        .map_err(MetricError::Storage)?;
        row.try_into()
    }

    async fn save_or_update_batch(&self, metrics: Vec<Metric>) -> Result<(), MetricError> {
        if metrics.is_empty() {
            return Ok(());
        }
        // One statement must not update the same row twice, so duplicate
        // keys are folded before the UPSERT.
        let metrics = fold_batch(metrics);
        let mut ids = Vec::with_capacity(metrics.len());
        let mut kinds = Vec::with_capacity(metrics.len());
        let mut deltas = Vec::with_capacity(metrics.len());
        let mut values = Vec::with_capacity(metrics.len());
        let mut hashes = Vec::with_capacity(metrics.len());
        for metric in &metrics {
            ids.push(metric.id.clone());
            kinds.push(metric.kind.as_str().to_string());
            deltas.push(metric.delta);
            values.push(metric.value);
            hashes.push(metric.hash.clone());
        }

        backoff::future::retry(storage_backoff(), || async {
            sqlx::query(UPSERT_BATCH_SQL)
                .bind(&ids)
                .bind(&kinds)
                .bind(&deltas)
                .bind(&values)
                .bind(&hashes)
                .execute(&self.pool)
                .await
                .map_err(to_backoff)
        })
        .await
        .map_err(MetricError::Storage)?;
        Ok(())
    }

    async fn get(&self, id: &str, kind: MetricKind) -> Result<Metric, MetricError> {
        let row = backoff::future::retry(storage_backoff(), || async {
            sqlx::query_as::<_, MetricRow>(SELECT_ONE_SQL)
                .bind(id)
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(to_backoff)
        })
        .await
        .map_err(MetricError::Storage)?;
        row.ok_or(MetricError::NotFound)?.try_into()
    }

    async fn list(&self) -> Result<Vec<Metric>, MetricError> {
        let rows = backoff::future::retry(storage_backoff(), || async {
            sqlx::query_as::<_, MetricRow>(SELECT_ALL_SQL)
                .fetch_all(&self.pool)
                .await
                .map_err(to_backoff)
        })
        .await
        .map_err(MetricError::Storage)?;
        rows.into_iter().map(Metric::try_from).collect()
    }

    async fn list_by_kind(&self, kind: MetricKind) -> Result<Vec<Metric>, MetricError> {
        let rows = backoff::future::retry(storage_backoff(), || async {
            sqlx::query_as::<_, MetricRow>(SELECT_BY_KIND_SQL)
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(to_backoff)
        })
        .await
        .map_err(MetricError::Storage)?;
        rows.into_iter().map(Metric::try_from).collect()
    }

    async fn ping(&self) -> Result<(), MetricError> {
        backoff::future::retry(storage_backoff(), || async {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(to_backoff)
        })
        .await
        .map_err(MetricError::Storage)?;
        Ok(())
    }

    async fn bootstrap(&self) -> Result<(), MetricError> {
        backoff::future::retry(storage_backoff(), || async {
            sqlx::query(BOOTSTRAP_SQL)
                .execute(&self.pool)
                .await
                .map_err(to_backoff)
        })
        .await
        .map_err(MetricError::Storage)?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
