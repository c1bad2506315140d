//! gRPC ingress: one unary `UpdateMetrics` with the trusted-subnet check
//! as an interceptor.  Hash and encryption middleware do not apply here;
//! transport security is the channel's concern.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use tonic::service::interceptor::InterceptedService;
use tonic::{Request, Response, Status};

use crate::audit::{AuditEvent, AuditSubject};
use crate::metric::Metric;
use crate::proto::metrics_server::{Metrics, MetricsServer};
use crate::proto::{metric, UpdateMetricsRequest, UpdateMetricsResponse};
use crate::service::MetricService;

pub struct MetricsGrpc {
    service: Arc<MetricService>,
    audit: Arc<AuditSubject>,
}

impl MetricsGrpc {
    pub fn new(service: Arc<MetricService>, audit: Arc<AuditSubject>) -> Self {
        MetricsGrpc { service, audit }
    }
}

#[tonic::async_trait]
impl Metrics for MetricsGrpc {
    async fn update_metrics(
        &self,
        request: Request<UpdateMetricsRequest>,
    ) -> Result<Response<UpdateMetricsResponse>, Status> {
        let ip = request
            .metadata()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let inner = request.into_inner();
        if inner.metrics.is_empty() {
            return Err(Status::invalid_argument("metrics list is empty"));
        }

        let mut batch = Vec::with_capacity(inner.metrics.len());
        for m in inner.metrics {
            if m.id.is_empty() {
                return Err(Status::invalid_argument("metric id is empty"));
            }
            let kind = metric::Kind::try_from(m.r#type)
                .map_err(|_| Status::invalid_argument(format!("unknown metric type: {}", m.r#type)))?;
            let converted = match kind {
                metric::Kind::Gauge => Metric::gauge(m.id, m.value),
                metric::Kind::Counter => Metric::counter(m.id, m.delta),
            };
            batch.push(converted);
        }

        self.service
            .save_or_update_batch(batch.clone())
            .await
            .map_err(|err| Status::internal(format!("failed to update metrics: {err}")))?;
        self.audit.notify_all(AuditEvent::new(ip, &batch)).await;

        Ok(Response::new(UpdateMetricsResponse {}))
    }
}

/// Admits only callers whose `x-real-ip` metadata falls inside the
/// configured CIDR; with no subnet configured everything passes.
pub fn subnet_interceptor(
    trusted_subnet: Option<String>,
) -> impl tonic::service::Interceptor + Clone {
    move |request: Request<()>| {
        let Some(cidr) = trusted_subnet.as_deref() else {
            return Ok(request);
        };
        let subnet: IpNet = cidr
            .parse()
            .map_err(|_| Status::internal("invalid trusted subnet configuration"))?;
        let ip = request
            .metadata()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
            .ok_or_else(|| Status::permission_denied("missing or invalid x-real-ip metadata"))?;
        if subnet.contains(&ip) {
            Ok(request)
        } else {
            Err(Status::permission_denied("address not in trusted subnet"))
        }
    }
}

pub fn grpc_service(
    service: Arc<MetricService>,
    audit: Arc<AuditSubject>,
    trusted_subnet: Option<String>,
) -> InterceptedService<MetricsServer<MetricsGrpc>, impl tonic::service::Interceptor + Clone> {
    MetricsServer::with_interceptor(
        MetricsGrpc::new(service, audit),
        subnet_interceptor(trusted_subnet),
    )
}
