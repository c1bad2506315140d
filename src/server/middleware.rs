//! Request middleware for the ingestion surface.
//!
//! Body transforms run in wire order: the agent ships
//! `encrypt(gzip(json))`, so the request is decrypted first, then
//! decompressed, and only then is the integrity digest checked against the
//! plain JSON bytes.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use ipnet::IpNet;

use crate::codec;
use crate::crypto::{self, MAX_ENCRYPTED_BODY};
use crate::error::error_response;

use super::AppState;

/// Upper bound applied when buffering request bodies.
pub const MAX_BODY_BYTES: usize = MAX_ENCRYPTED_BODY;

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

/// Client address taken from `X-Real-IP`; consumed by the subnet filter,
/// the request logger and audit events.
#[derive(Clone, Debug)]
pub struct ClientIp(pub Option<IpAddr>);

impl ClientIp {
    pub fn display(&self) -> String {
        self.0.map(|ip| ip.to_string()).unwrap_or_default()
    }
}

pub async fn real_ip(mut req: Request, next: Next) -> Response {
    let ip = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());
    req.extensions_mut().insert(ClientIp(ip));
    next.run(req).await
}

pub async fn request_logger(req: Request, next: Next) -> Response {
    let request_id = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let remote = req
        .extensions()
        .get::<ClientIp>()
        .map(ClientIp::display)
        .unwrap_or_default();
    let start = Instant::now();

    let mut response = next.run(req).await;

    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    let size = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    tracing::info!(
        request_id,
        method = %method,
        path = %path,
        remote = %remote,
        status = response.status().as_u16(),
        duration_ms,
        size,
        "request"
    );
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Rejects callers outside the trusted CIDR.  A missing or unparseable
/// `X-Real-IP` is a 403; a malformed CIDR in the configuration is a 500.
pub async fn subnet_filter(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(cidr) = state.trusted_subnet.as_deref() else {
        return next.run(req).await;
    };
    let subnet: IpNet = match cidr.parse() {
        Ok(subnet) => subnet,
        Err(err) => {
            tracing::error!(cidr, error = %err, "invalid trusted subnet configuration");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let ip = req.extensions().get::<ClientIp>().and_then(|c| c.0);
    match ip {
        Some(ip) if subnet.contains(&ip) => next.run(req).await,
        _ => error_response(StatusCode::FORBIDDEN, "forbidden"),
    }
}

/// Decrypts `Content-Encryption: rsa` bodies when a private key is loaded.
pub async fn decrypt_body(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(private_key) = state.private_key.clone() else {
        return next.run(req).await;
    };
    let encrypted = req
        .headers()
        .get("content-encryption")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("rsa"))
        .unwrap_or(false);
    if !encrypted {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "failed to buffer encrypted request body");
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };
    match crypto::decrypt(&bytes, &private_key) {
        Ok(plain) => {
            parts.headers.remove("content-encryption");
            parts.headers.remove(header::CONTENT_LENGTH);
            next.run(Request::from_parts(parts, Body::from(plain))).await
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to decrypt request body");
            error_response(StatusCode::BAD_REQUEST, "failed to decrypt request body")
        }
    }
}

/// Inflates `Content-Encoding: gzip` request bodies.
pub async fn decompress_body(req: Request, next: Next) -> Response {
    let gzipped = req
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);
    if !gzipped {
        return next.run(req).await;
    }

    let (mut parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "failed to buffer gzip request body");
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };
    match codec::decompress(&bytes) {
        Ok(plain) => {
            parts.headers.remove(header::CONTENT_ENCODING);
            parts.headers.remove(header::CONTENT_LENGTH);
            next.run(Request::from_parts(parts, Body::from(plain))).await
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to decompress request body");
            error_response(StatusCode::BAD_REQUEST, "failed to decompress gzip content")
        }
    }
}

/// Verifies `HashSHA256` against the plaintext body.  The check only runs
/// when a secret is configured; a request without the header is let
/// through so unkeyed writers keep working.
pub async fn verify_hash(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(key) = state.key.clone() else {
        return next.run(req).await;
    };
    let received = req
        .headers()
        .get("HashSHA256")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let Some(received) = received else {
        return next.run(req).await;
    };

    let (parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "failed to buffer request body for hash check");
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };
    if !codec::verify(&bytes, &key, &received) {
        tracing::warn!(path = %parts.uri.path(), "hash validation failed");
        return error_response(StatusCode::BAD_REQUEST, "hash validation failed");
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}
