//! Core library for Metrix, a two-process telemetry pipeline.
//!
//! The agent side (`agent`) samples process and host metrics on a poll
//! ticker and ships batches over HTTP or gRPC.  The server side (`server`)
//! validates, merges and persists incoming metrics behind a middleware
//! stack handling compression, transport encryption, integrity hashing and
//! subnet filtering.  Storage is pluggable (`repository`), optionally
//! mirrored to a JSONL snapshot file (`snapshot`), with accepted ingests
//! fanned out to audit sinks (`audit`).

pub mod agent;
pub mod audit;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod metric;
pub mod repository;
pub mod retry;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod snapshot;

/// Generated gRPC bindings for the `metrics` service.
pub mod proto {
    tonic::include_proto!("metrics");
}

pub use config::{AgentConfig, ServerConfig};
pub use error::MetricError;
pub use metric::{merge, Metric, MetricKind};
pub use server::{app, AppState};
