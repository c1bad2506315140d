//! Outbound transport and the report loop.
//!
//! Wire order on the HTTP path: serialize the batch, digest the plain
//! JSON, gzip it, then encrypt the compressed bytes when a public key is
//! configured.  The server undoes those transforms in reverse.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use rsa::RsaPublicKey;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::codec;
use crate::crypto;
use crate::metric::Metric;
use crate::retry::send_backoff;

use super::collector::Collector;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Non-loopback IPv4 of this host, detected once per process.  The UDP
/// socket is never written to; connecting just asks the kernel which
/// interface would route there.
static LOCAL_IP: Lazy<Option<IpAddr>> = Lazy::new(detect_local_ip);

fn detect_local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 80)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    match ip {
        IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(ip),
        _ => None,
    }
}

pub(crate) fn local_ip_string() -> Option<String> {
    (*LOCAL_IP).map(|ip| ip.to_string())
}

/// Seam between the report loop and the concrete wire protocol.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_batch(&self, metrics: &[Metric]) -> anyhow::Result<()>;
}

/// Reuses serialization buffers across report ticks.  Acquire hands out a
/// cleared buffer; release returns it to the pool.
#[derive(Default)]
pub struct BufferPool {
    buffers: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn acquire(&self) -> Vec<u8> {
        self.buffers.lock().unwrap().pop().unwrap_or_default()
    }

    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        self.buffers.lock().unwrap().push(buffer);
    }
}

pub struct HttpSender {
    client: reqwest::Client,
    base_url: String,
    key: Option<String>,
    public_key: Option<RsaPublicKey>,
    local_ip: Option<String>,
    buffers: BufferPool,
}

impl HttpSender {
    pub fn new(
        base_url: impl Into<String>,
        key: Option<String>,
        crypto_key_path: Option<&str>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build http client")?;

        let public_key = match crypto_key_path {
            Some(path) => {
                let key = crypto::load_public_key(path)?;
                tracing::info!(path, "public key loaded for encryption");
                Some(key)
            }
            None => None,
        };

        let local_ip = local_ip_string();
        if let Some(ip) = &local_ip {
            tracing::info!(ip = %ip, "local IP detected");
        }

        Ok(HttpSender {
            client,
            base_url: base_url.into(),
            key,
            public_key,
            local_ip,
            buffers: BufferPool::default(),
        })
    }

    pub async fn send_one(&self, metric: &Metric) -> anyhow::Result<()> {
        let mut plain = self.buffers.acquire();
        serde_json::to_writer(&mut plain, metric)?;
        let result = self.post("/update", &plain).await;
        self.buffers.release(plain);
        result
    }

    async fn post(&self, path: &str, plain: &[u8]) -> anyhow::Result<()> {
        let digest = self.key.as_deref().map(|key| codec::sign(plain, key));
        let mut body = codec::compress(plain).context("failed to gzip payload")?;
        let encrypted = self.public_key.is_some();
        if let Some(public_key) = &self.public_key {
            body = crypto::encrypt(&body, public_key).context("failed to encrypt payload")?;
        }
        let url = format!("{}{}", self.base_url, path);

        let response = backoff::future::retry(send_backoff(), || {
            let request = self.build_request(&url, &body, digest.as_deref(), encrypted);
            async move { request.send().await.map_err(backoff::Error::transient) }
        })
        .await
        .with_context(|| format!("failed to send metrics to {url}"))?;

        tracing::debug!(
            status = %response.status(),
            compressed_size = body.len(),
            "metrics sent"
        );
        Ok(())
    }

    fn build_request(
        &self,
        url: &str,
        body: &[u8],
        digest: Option<&str>,
        encrypted: bool,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(body.to_vec());
        if let Some(ip) = &self.local_ip {
            request = request.header("X-Real-IP", ip);
        }
        if encrypted {
            request = request.header("Content-Encryption", "rsa");
        }
        if let Some(digest) = digest {
            request = request.header("HashSHA256", digest);
        }
        request
    }
}

#[async_trait]
impl Transport for HttpSender {
    async fn send_batch(&self, metrics: &[Metric]) -> anyhow::Result<()> {
        if metrics.is_empty() {
            tracing::debug!("no metrics to send, skipping");
            return Ok(());
        }
        let mut plain = self.buffers.acquire();
        serde_json::to_writer(&mut plain, metrics)?;
        let result = self.post("/updates", &plain).await;
        self.buffers.release(plain);
        result
    }
}

/// Report loop: every tick drains the collector and ships one batch task,
/// gated by the semaphore.  In-flight sends are joined before the loop
/// returns so shutdown never drops an accepted batch.
pub async fn run_reporter(
    transport: Arc<dyn Transport>,
    collector: Arc<Collector>,
    mut shutdown: watch::Receiver<bool>,
    report_interval: Duration,
    limiter: Arc<Semaphore>,
) {
    let mut ticker = tokio::time::interval(report_interval);
    ticker.tick().await;
    let mut inflight = JoinSet::new();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let batch = collector.snapshot();
                let transport = transport.clone();
                let limiter = limiter.clone();
                inflight.spawn(async move {
                    let _permit = match limiter.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    if let Err(err) = transport.send_batch(&batch).await {
                        tracing::error!(error = %err, "failed to send metrics");
                    }
                });
                // Reap tasks that already finished so the set stays small.
                while inflight.try_join_next().is_some() {}
            }
            _ = shutdown.changed() => break,
        }
    }
    while inflight.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_pool_hands_back_cleared_buffers() {
        let pool = BufferPool::default();
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(b"payload");
        let capacity = buffer.capacity();
        pool.release(buffer);

        let reused = pool.acquire();
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), capacity);
    }

    #[test]
    fn local_ip_is_never_loopback() {
        if let Some(ip) = *LOCAL_IP {
            assert!(!ip.is_loopback());
        }
    }
}

