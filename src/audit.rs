//! Best-effort audit fan-out for accepted ingest calls.
//!
//! Observers register once during wiring; the set is read-only afterwards,
//! so notification needs no locking.  Sink failures are logged and never
//! reach the request path.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::metric::Metric;
use crate::retry::send_backoff;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: i64,
    pub ip_address: String,
    pub metrics: Vec<String>,
}

impl AuditEvent {
    pub fn new(ip: impl Into<String>, metrics: &[Metric]) -> Self {
        AuditEvent {
            ts: chrono::Utc::now().timestamp(),
            ip_address: ip.into(),
            metrics: metrics.iter().map(|m| m.id.clone()).collect(),
        }
    }
}

#[async_trait]
pub trait AuditObserver: Send + Sync {
    fn id(&self) -> &str;
    async fn notify(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Observer registry.  `attach` is only callable while the subject is
/// still exclusively owned; afterwards it is shared behind an `Arc` and
/// only `notify_all` runs.
#[derive(Default)]
pub struct AuditSubject {
    observers: Vec<Arc<dyn AuditObserver>>,
}

impl AuditSubject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, observer: Arc<dyn AuditObserver>) {
        self.observers.push(observer);
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub async fn notify_all(&self, event: AuditEvent) {
        for observer in &self.observers {
            if let Err(err) = observer.notify(&event).await {
                tracing::warn!(observer = observer.id(), error = %err, "audit sink failed");
            }
        }
    }
}

/// Appends one JSON line per event.
pub struct FileObserver {
    path: PathBuf,
}

impl FileObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileObserver { path: path.into() }
    }
}

#[async_trait]
impl AuditObserver for FileObserver {
    fn id(&self) -> &str {
        "audit-file"
    }

    async fn notify(&self, event: &AuditEvent) -> anyhow::Result<()> {
        use std::io::Write;

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }
}

/// POSTs each event as JSON, retrying transport failures.
pub struct UrlObserver {
    url: String,
    client: reqwest::Client,
}

impl UrlObserver {
    pub fn new(url: impl Into<String>) -> Self {
        UrlObserver {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AuditObserver for UrlObserver {
    fn id(&self) -> &str {
        "audit-url"
    }

    async fn notify(&self, event: &AuditEvent) -> anyhow::Result<()> {
        let response = backoff::future::retry(send_backoff(), || async {
            self.client
                .post(&self.url)
                .json(event)
                .send()
                .await
                .map_err(backoff::Error::transient)
        })
        .await?;
        tracing::debug!(status = %response.status(), url = %self.url, "audit event sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AuditObserver for CountingObserver {
        fn id(&self) -> &str {
            "counting"
        }

        async fn notify(&self, _event: &AuditEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("sink down");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn notify_all_reaches_every_observer_despite_failures() {
        let failing = Arc::new(CountingObserver {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let healthy = Arc::new(CountingObserver {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let mut subject = AuditSubject::new();
        subject.attach(failing.clone());
        subject.attach(healthy.clone());

        let event = AuditEvent::new("10.0.0.1", &[Metric::counter("req", 1)]);
        subject.notify_all(event).await;

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn file_observer_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let observer = FileObserver::new(&path);

        let event = AuditEvent::new("10.0.0.1", &[Metric::counter("req", 1)]);
        observer.notify(&event).await.unwrap();
        observer.notify(&event).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.ip_address, "10.0.0.1");
        assert_eq!(parsed.metrics, vec!["req".to_string()]);
    }

    #[test]
    fn event_collects_metric_ids() {
        let event = AuditEvent::new(
            "192.168.0.5",
            &[Metric::counter("a", 1), Metric::gauge("b", 2.0)],
        );
        assert_eq!(event.metrics, vec!["a".to_string(), "b".to_string()]);
    }
}
