//! gRPC transport for the agent.

use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;
use tonic::transport::Channel;

use crate::metric::{Metric, MetricKind};
use crate::proto::metrics_client::MetricsClient;
use crate::proto::{metric, Metric as ProtoMetric, UpdateMetricsRequest};

use super::sender::{local_ip_string, Transport};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct GrpcSender {
    client: MetricsClient<Channel>,
    local_ip: Option<String>,
}

impl GrpcSender {
    pub async fn connect(addr: &str) -> anyhow::Result<Self> {
        let endpoint = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let client = MetricsClient::connect(endpoint.clone())
            .await
            .with_context(|| format!("failed to connect to grpc server {endpoint}"))?;

        let local_ip = local_ip_string();
        if let Some(ip) = &local_ip {
            tracing::info!(ip = %ip, "local IP detected for grpc");
        }
        Ok(GrpcSender { client, local_ip })
    }
}

fn to_proto(m: &Metric) -> ProtoMetric {
    match m.kind {
        MetricKind::Gauge => ProtoMetric {
            id: m.id.clone(),
            r#type: metric::Kind::Gauge as i32,
            value: m.value.unwrap_or(0.0),
            delta: 0,
        },
        MetricKind::Counter => ProtoMetric {
            id: m.id.clone(),
            r#type: metric::Kind::Counter as i32,
            value: 0.0,
            delta: m.delta.unwrap_or(0),
        },
    }
}

#[async_trait]
impl Transport for GrpcSender {
    async fn send_batch(&self, metrics: &[Metric]) -> anyhow::Result<()> {
        if metrics.is_empty() {
            tracing::debug!("no metrics to send, skipping");
            return Ok(());
        }

        let mut request = tonic::Request::new(UpdateMetricsRequest {
            metrics: metrics.iter().map(to_proto).collect(),
        });
        request.set_timeout(SEND_TIMEOUT);
        if let Some(ip) = &self.local_ip {
            let value = tonic::metadata::MetadataValue::try_from(ip.as_str())
                .context("local ip is not valid metadata")?;
            request.metadata_mut().insert("x-real-ip", value);
        }

        self.client
            .clone()
            .update_metrics(request)
            .await
            .context("failed to send metrics via grpc")?;
        tracing::debug!(count = metrics.len(), "metrics sent via grpc");
        Ok(())
    }
}
