//! HTTP operations of the ingestion surface.
//!
//! Successful updates respond with the stored (post-merge) metric; when a
//! secret is configured the response carries a `HashSHA256` header over
//! the response body.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;

use crate::audit::AuditEvent;
use crate::codec;
use crate::error::{error_response, MetricError};
use crate::metric::{Metric, MetricKind};

use super::middleware::ClientIp;
use super::AppState;

const INDEX_CACHE_TTL: Duration = Duration::from_secs(5);

/// Incoming update DTO.  The kind arrives as a plain string so an unknown
/// tag surfaces as `InvalidMetricType` instead of a deserialization error.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub delta: Option<i64>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub hash: Option<String>,
}

impl MetricPayload {
    fn validate(self) -> Result<Metric, MetricError> {
        let kind: MetricKind = self.kind.parse()?;
        Metric {
            id: self.id,
            kind,
            delta: self.delta,
            value: self.value,
            hash: self.hash,
        }
        .validated()
    }
}

/// `POST /update/{kind}/{id}/{value}`: the counter path value is an
/// increment, not an absolute overwrite.
pub async fn update_by_path(
    State(state): State<AppState>,
    Extension(ip): Extension<ClientIp>,
    Path((kind, id, value)): Path<(String, String, String)>,
) -> Result<Response, MetricError> {
    let metric = parse_path_metric(&kind, &id, &value)?;
    let stored = state.service.save_or_update(metric).await?;
    state
        .audit
        .notify_all(AuditEvent::new(ip.display(), std::slice::from_ref(&stored)))
        .await;
    Ok(json_with_hash(&state, &stored))
}

/// `POST /update`: single JSON metric.
pub async fn update_by_body(
    State(state): State<AppState>,
    Extension(ip): Extension<ClientIp>,
    payload: Result<Json<MetricPayload>, JsonRejection>,
) -> Result<Response, MetricError> {
    let Json(payload) = match payload {
        Ok(json) => json,
        Err(rejection) => return Ok(reject_json(rejection)),
    };
    let metric = payload.validate()?;
    let stored = state.service.save_or_update(metric).await?;
    state
        .audit
        .notify_all(AuditEvent::new(ip.display(), std::slice::from_ref(&stored)))
        .await;
    Ok(json_with_hash(&state, &stored))
}

/// `POST /updates`: JSON array; the first invalid entry aborts the whole
/// batch before anything is written.
pub async fn update_batch(
    State(state): State<AppState>,
    Extension(ip): Extension<ClientIp>,
    payload: Result<Json<Vec<MetricPayload>>, JsonRejection>,
) -> Result<Response, MetricError> {
    let Json(payloads) = match payload {
        Ok(json) => json,
        Err(rejection) => return Ok(reject_json(rejection)),
    };

    let mut validated = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let id = payload.id.clone();
        match payload.validate() {
            Ok(metric) => validated.push(metric),
            Err(err) => {
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid metric {id}: {err}"),
                ));
            }
        }
    }

    state.service.save_or_update_batch(validated.clone()).await?;
    state
        .audit
        .notify_all(AuditEvent::new(ip.display(), &validated))
        .await;
    Ok(json_with_hash(&state, &validated))
}

#[derive(Debug, Deserialize)]
pub struct MetricQuery {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// `POST /value`: full stored metric or 404.
pub async fn value_by_body(
    State(state): State<AppState>,
    payload: Result<Json<MetricQuery>, JsonRejection>,
) -> Result<Response, MetricError> {
    let Json(query) = match payload {
        Ok(json) => json,
        Err(rejection) => return Ok(reject_json(rejection)),
    };
    if query.id.is_empty() {
        return Err(MetricError::NotFound);
    }
    let kind: MetricKind = query.kind.parse()?;
    let stored = state.service.get(&query.id, kind).await?;
    Ok(json_with_hash(&state, &stored))
}

/// `GET /value/{kind}/{id}`: plain numeric rendering.
pub async fn value_by_path(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Result<Response, MetricError> {
    if id.is_empty() {
        return Err(MetricError::NotFound);
    }
    let kind: MetricKind = kind.parse()?;
    let stored = state.service.get(&id, kind).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        stored.render_value(),
    )
        .into_response())
}

/// `GET /ping`: repository health check.
pub async fn ping(State(state): State<AppState>) -> Result<Response, MetricError> {
    state.service.ping().await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "pong",
    )
        .into_response())
}

/// `GET /healthz`: process liveness.
pub async fn healthz() -> Response {
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], "OK").into_response()
}

/// `GET /`: HTML table of all metrics; the rendered page is cached for a
/// few seconds to keep the index cheap under dashboards polling it.
pub async fn index(State(state): State<AppState>) -> Result<Response, MetricError> {
    {
        let cache = state.index_cache.lock().unwrap();
        if let Some((rendered_at, html)) = cache.as_ref() {
            if rendered_at.elapsed() < INDEX_CACHE_TTL {
                return Ok(Html(html.clone()).into_response());
            }
        }
    }

    let mut metrics = state.service.list().await?;
    metrics.sort_by(|a, b| a.id.cmp(&b.id).then(a.kind.as_str().cmp(b.kind.as_str())));
    let html = render_index(&metrics);
    *state.index_cache.lock().unwrap() = Some((Instant::now(), html.clone()));
    Ok(Html(html).into_response())
}

fn parse_path_metric(kind: &str, id: &str, value: &str) -> Result<Metric, MetricError> {
    if id.is_empty() {
        return Err(MetricError::NotFound);
    }
    let kind: MetricKind = kind.parse()?;
    match kind {
        MetricKind::Counter => {
            let delta = value
                .parse::<i64>()
                .map_err(|_| MetricError::InvalidValue)?;
            Ok(Metric::counter(id, delta))
        }
        MetricKind::Gauge => {
            let value = value
                .parse::<f64>()
                .map_err(|_| MetricError::InvalidValue)?;
            Ok(Metric::gauge(id, value))
        }
    }
}

fn reject_json(rejection: JsonRejection) -> Response {
    error_response(rejection.status(), rejection.body_text())
}

fn json_with_hash<T: serde::Serialize>(state: &AppState, value: &T) -> Response {
    let body = match serde_json::to_vec(value) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode response body");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let mut builder = Response::builder().header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = &state.key {
        builder = builder.header("HashSHA256", codec::sign(&body, key));
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn render_index(metrics: &[Metric]) -> String {
    let mut rows = String::new();
    for metric in metrics {
        rows.push_str(&format!(
            "      <tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape_html(&metric.id),
            metric.kind,
            metric.render_value()
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Metrics</title></head>\n<body>\n  \
         <h1>Metrics</h1>\n  <table border=\"1\">\n    \
         <tr><th>Name</th><th>Type</th><th>Value</th></tr>\n{rows}  </table>\n</body>\n</html>\n"
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_metric_parses_per_kind() {
        let counter = parse_path_metric("counter", "req", "5").unwrap();
        assert_eq!(counter.delta, Some(5));
        let gauge = parse_path_metric("gauge", "cpu", "0.25").unwrap();
        assert_eq!(gauge.value, Some(0.25));
    }

    #[test]
    fn path_metric_rejects_bad_input() {
        assert!(matches!(
            parse_path_metric("histogram", "x", "1"),
            Err(MetricError::InvalidType)
        ));
        assert!(matches!(
            parse_path_metric("counter", "x", "1.5"),
            Err(MetricError::InvalidValue)
        ));
        assert!(matches!(
            parse_path_metric("gauge", "x", "abc"),
            Err(MetricError::InvalidValue)
        ));
        assert!(matches!(
            parse_path_metric("counter", "", "1"),
            Err(MetricError::NotFound)
        ));
    }

    #[test]
    fn index_escapes_metric_ids() {
        let html = render_index(&[Metric::gauge("<script>", 1.0)]);
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }
}
