//! Server runtime: state wiring, the router with its middleware stack, and
//! the listener lifecycle with graceful shutdown.
//!
//! Shutdown order on signal: stop the gRPC ingress, drain HTTP under a
//! bounded grace period, write the final snapshot, close the repository.

pub mod grpc;
pub mod handlers;
pub mod middleware;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::middleware as axum_middleware;
use axum::routing::{get, post};
use axum::Router;
use rsa::RsaPrivateKey;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;

use crate::audit::{AuditSubject, FileObserver, UrlObserver};
use crate::config::ServerConfig;
use crate::crypto;
use crate::repository::{self, Repository};
use crate::service::MetricService;
use crate::shutdown;
use crate::snapshot::SnapshotStore;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state handed to every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MetricService>,
    pub audit: Arc<AuditSubject>,
    /// Shared secret for the integrity digest; `None` disables both
    /// verification and response signing.
    pub key: Option<String>,
    pub private_key: Option<Arc<RsaPrivateKey>>,
    pub trusted_subnet: Option<String>,
    pub index_cache: Arc<Mutex<Option<(Instant, String)>>>,
}

/// Everything the runtime needs beyond the router itself.
pub struct ServerParts {
    pub state: AppState,
    pub repo: Arc<dyn Repository>,
    pub snapshot: Option<Arc<SnapshotStore>>,
}

/// Builds repository, snapshot store, service and audit fan-out from the
/// configuration.  Restore (when enabled) happens here, before any
/// listener accepts traffic.
pub async fn build_parts(cfg: &ServerConfig) -> anyhow::Result<ServerParts> {
    let private_key = match &cfg.crypto_key {
        Some(path) => {
            let key = crypto::load_private_key(path)?;
            tracing::info!(path = %path, "private key loaded for decryption");
            Some(Arc::new(key))
        }
        None => None,
    };

    let repo = repository::build(cfg).await?;
    repo.bootstrap().await?;

    let snapshot = if cfg.snapshot_enabled() {
        Some(Arc::new(SnapshotStore::new(
            repo.clone(),
            &cfg.store_file,
            cfg.store_interval,
        )))
    } else {
        None
    };
    if let Some(snapshot) = &snapshot {
        if cfg.restore {
            snapshot.restore().await?;
        }
    }

    let service = Arc::new(MetricService::new(repo.clone(), snapshot.clone()));

    let mut audit = AuditSubject::new();
    if let Some(path) = &cfg.audit_file {
        audit.attach(Arc::new(FileObserver::new(path)));
    }
    if let Some(url) = &cfg.audit_url {
        audit.attach(Arc::new(UrlObserver::new(url)));
    }

    let state = AppState {
        service,
        audit: Arc::new(audit),
        key: cfg.key.clone(),
        private_key,
        trusted_subnet: cfg.trusted_subnet.clone(),
        index_cache: Arc::new(Mutex::new(None)),
    };

    Ok(ServerParts {
        state,
        repo,
        snapshot,
    })
}

/// Builds the router.  Layers are listed outermost first; the body
/// transforms sit innermost so decryption runs before decompression and
/// the digest check sees plain JSON.
pub fn app(state: AppState) -> Router {
    let stack = ServiceBuilder::new()
        .layer(CatchPanicLayer::new())
        .layer(axum_middleware::from_fn(middleware::real_ip))
        .layer(axum_middleware::from_fn(middleware::request_logger))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::subnet_filter,
        ))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::decrypt_body,
        ))
        .layer(axum_middleware::from_fn(middleware::decompress_body))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::verify_hash,
        ));

    Router::new()
        .route("/", get(handlers::index))
        .route("/healthz", get(handlers::healthz))
        .route("/ping", get(handlers::ping))
        .route("/value", post(handlers::value_by_body))
        .route("/value/:kind/:id", get(handlers::value_by_path))
        .route("/update", post(handlers::update_by_body))
        .route("/update/:kind/:id/:value", post(handlers::update_by_path))
        .route("/updates", post(handlers::update_batch))
        .layer(DefaultBodyLimit::max(middleware::MAX_BODY_BYTES))
        .layer(stack)
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    let ServerParts {
        state,
        repo,
        snapshot,
    } = build_parts(&cfg).await?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    shutdown::spawn_signal_listener(shutdown_tx)?;

    let grpc_task = match &cfg.grpc_address {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .with_context(|| format!("invalid grpc address {addr}"))?;
            let svc = grpc::grpc_service(
                state.service.clone(),
                state.audit.clone(),
                cfg.trusted_subnet.clone(),
            );
            let mut rx = shutdown_rx.clone();
            tracing::info!(%addr, "grpc listening");
            Some(tokio::spawn(async move {
                let result = tonic::transport::Server::builder()
                    .add_service(svc)
                    .serve_with_shutdown(addr, async move {
                        let _ = rx.changed().await;
                    })
                    .await;
                if let Err(err) = result {
                    tracing::error!(error = %err, "grpc server error");
                }
            }))
        }
        None => None,
    };

    if let Some(snapshot) = &snapshot {
        snapshot.start();
    }

    let listener = TcpListener::bind(&cfg.address)
        .await
        .with_context(|| format!("failed to bind {}", cfg.address))?;
    tracing::info!(addr = %cfg.address, "listening");

    let mut rx = shutdown_rx.clone();
    let mut http_task = tokio::spawn(async move {
        let server = axum::serve(listener, app(state)).with_graceful_shutdown(async move {
            let _ = rx.changed().await;
        });
        if let Err(err) = server.await {
            tracing::error!(error = %err, "http server error");
        }
    });

    let mut rx = shutdown_rx;
    let _ = rx.changed().await;

    if let Some(task) = grpc_task {
        let _ = task.await;
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut http_task)
        .await
        .is_err()
    {
        tracing::warn!("timed out waiting for http connections to drain");
        http_task.abort();
    }
    if let Some(snapshot) = &snapshot {
        if let Err(err) = snapshot.close().await {
            tracing::error!(error = %err, "final snapshot flush failed");
        }
    }
    repo.close().await;
    tracing::info!("server stopped");
    Ok(())
}
