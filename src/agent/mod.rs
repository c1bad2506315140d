//! Agent runtime: wires the collector and sender loops to a signal-driven
//! shutdown and waits for in-flight sends before exiting.

pub mod collector;
pub mod grpc;
pub mod sender;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

pub use collector::Collector;
pub use grpc::GrpcSender;
pub use sender::{run_reporter, HttpSender, Transport};

use crate::config::AgentConfig;
use crate::shutdown;

pub async fn run(cfg: AgentConfig) -> anyhow::Result<()> {
    let collector = Arc::new(Collector::new());
    // A transport init failure is fatal; there is nothing to retry against.
    let transport: Arc<dyn Transport> = match &cfg.grpc_address {
        Some(addr) => Arc::new(GrpcSender::connect(addr).await?),
        None => Arc::new(HttpSender::new(
            cfg.address.clone(),
            cfg.key.clone(),
            cfg.crypto_key.as_deref(),
        )?),
    };
    let limiter = Arc::new(Semaphore::new(cfg.rate_limit));

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    shutdown::spawn_signal_listener(shutdown_tx)?;

    tracing::info!(
        address = %cfg.address,
        poll_interval = cfg.poll_interval,
        report_interval = cfg.report_interval,
        rate_limit = cfg.rate_limit,
        "agent started"
    );

    let collect_task = tokio::spawn(
        collector
            .clone()
            .run(shutdown_rx.clone(), Duration::from_secs(cfg.poll_interval)),
    );
    let report_task = tokio::spawn(run_reporter(
        transport,
        collector,
        shutdown_rx,
        Duration::from_secs(cfg.report_interval),
        limiter,
    ));

    let _ = tokio::join!(collect_task, report_task);
    tracing::info!("agent stopped");
    Ok(())
}
