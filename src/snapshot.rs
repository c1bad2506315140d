//! Durable JSONL mirror of the repository.
//!
//! In sync mode (interval 0) every successful write appends one record.
//! In interval mode a background task truncates and rewrites the full
//! repository content every N seconds.  The file is never consulted at
//! read time; it is replayed only on boot when restore is enabled.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::MetricError;
use crate::metric::Metric;
use crate::repository::Repository;

pub struct SnapshotStore {
    repo: Arc<dyn Repository>,
    path: PathBuf,
    interval: Duration,
    sync_mode: bool,
    worker: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl SnapshotStore {
    pub fn new(repo: Arc<dyn Repository>, path: impl Into<PathBuf>, interval_secs: u64) -> Self {
        SnapshotStore {
            repo,
            path: path.into(),
            interval: Duration::from_secs(interval_secs),
            sync_mode: interval_secs == 0,
            worker: Mutex::new(None),
        }
    }

    pub fn sync_mode(&self) -> bool {
        self.sync_mode
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Append a single record; used by the write-through path.
    pub fn write_one(&self, metric: &Metric) -> Result<(), MetricError> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(MetricError::Snapshot)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, metric).map_err(MetricError::SnapshotDecode)?;
        writer.write_all(b"\n").map_err(MetricError::Snapshot)?;
        writer.flush().map_err(MetricError::Snapshot)?;
        Ok(())
    }

    /// Truncate the file and rewrite the full repository content.
    pub async fn flush_all(&self) -> Result<(), MetricError> {
        let metrics = self.repo.list().await?;
        let mut buf = Vec::new();
        for metric in &metrics {
            serde_json::to_writer(&mut buf, metric).map_err(MetricError::SnapshotDecode)?;
            buf.push(b'\n');
        }
        fs::write(&self.path, buf).map_err(MetricError::Snapshot)?;
        tracing::debug!(count = metrics.len(), path = %self.path.display(), "snapshot flushed");
        Ok(())
    }

    /// Replay the file into the repository.  A missing file is an empty
    /// store; a malformed record aborts the restore.  Records are keyed
    /// before replay so a later line overrides an earlier one with the
    /// same `(id, kind)` instead of merging into it.
    pub async fn restore(&self) -> Result<usize, MetricError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "snapshot file absent, starting empty");
                return Ok(0);
            }
            Err(err) => return Err(MetricError::Snapshot(err)),
        };

        let mut latest: Vec<Metric> = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let metric: Metric =
                serde_json::from_str(line).map_err(MetricError::SnapshotDecode)?;
            if let Some(existing) = latest
                .iter_mut()
                .find(|m| m.id == metric.id && m.kind == metric.kind)
            {
                *existing = metric;
            } else {
                latest.push(metric);
            }
        }

        let count = latest.len();
        for metric in latest {
            self.repo.save_or_update(metric).await?;
        }
        tracing::info!(count, path = %self.path.display(), "snapshot restored");
        Ok(count)
    }

    /// Start the periodic flush task.  A no-op in sync mode.
    pub fn start(self: &Arc<Self>) {
        if self.sync_mode {
            return;
        }
        let (tx, mut rx) = watch::channel(false);
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.interval);
            // The first tick completes immediately; skip it so the initial
            // flush happens one full interval after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = store.flush_all().await {
                            tracing::error!(error = %err, "periodic snapshot flush failed");
                        }
                    }
                    _ = rx.changed() => break,
                }
            }
        });
        *self.worker.lock().unwrap() = Some((tx, handle));
    }

    /// Stop the flush task and write a final full snapshot.
    pub async fn close(&self) -> Result<(), MetricError> {
        let worker = self.worker.lock().unwrap().take();
        if let Some((tx, handle)) = worker {
            let _ = tx.send(true);
            let _ = handle.await;
        }
        self.flush_all().await
    }
}
