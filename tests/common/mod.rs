use std::sync::{Arc, Mutex};

use metrix::audit::AuditSubject;
use metrix::repository::{MemoryRepository, Repository};
use metrix::server::{app, AppState};
use metrix::service::MetricService;
use metrix::snapshot::SnapshotStore;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Builds an `AppState` over a fresh in-memory repository.
#[allow(dead_code)]
pub fn memory_state() -> AppState {
    state_with(None, None, None)
}

#[allow(dead_code)]
pub fn state_with(
    key: Option<String>,
    private_key: Option<Arc<rsa::RsaPrivateKey>>,
    trusted_subnet: Option<String>,
) -> AppState {
    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
    state_from_repo(repo, key, private_key, trusted_subnet, None)
}

#[allow(dead_code)]
pub fn state_from_repo(
    repo: Arc<dyn Repository>,
    key: Option<String>,
    private_key: Option<Arc<rsa::RsaPrivateKey>>,
    trusted_subnet: Option<String>,
    snapshot: Option<Arc<SnapshotStore>>,
) -> AppState {
    AppState {
        service: Arc::new(MetricService::new(repo, snapshot)),
        audit: Arc::new(AuditSubject::new()),
        key,
        private_key,
        trusted_subnet,
        index_cache: Arc::new(Mutex::new(None)),
    }
}

/// Spawns the app on an ephemeral port and returns its base URL.
#[allow(dead_code)]
pub async fn spawn_app(state: AppState) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}
