//! Configuration for both processes.
//!
//! Options come from three layers with fixed precedence: command-line
//! flags win over environment variables (clap resolves those two), and an
//! optional JSON config file fills anything still unset before the
//! built-in defaults apply.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_STORE_FILE: &str = "/tmp/metrics-db.json";
const DEFAULT_STORE_INTERVAL_SECS: u64 = 300;
const DEFAULT_REPORT_INTERVAL_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_RATE_LIMIT: usize = 1;

/// Connection-pool knobs for the SQL repository.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub max_conns: u32,
    pub min_conns: u32,
    pub max_lifetime_secs: u64,
    pub max_idle_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            max_conns: 8,
            min_conns: 1,
            max_lifetime_secs: 1800,
            max_idle_secs: 300,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "metrix-server", about = "Metrics ingestion server")]
pub struct ServerCli {
    /// Path to a JSON config file (lowest-precedence layer).
    #[arg(short = 'c', long = "config", env = "CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(short = 'a', long = "address", env = "ADDRESS")]
    pub address: Option<String>,
    #[arg(short = 'g', long = "grpc-address", env = "GRPC_ADDRESS")]
    pub grpc_address: Option<String>,
    /// Snapshot flush interval in seconds; 0 switches to write-through.
    #[arg(short = 'i', long = "store-interval", env = "STORE_INTERVAL")]
    pub store_interval: Option<u64>,
    #[arg(short = 'f', long = "store-file", env = "FILE_STORAGE_PATH")]
    pub store_file: Option<String>,
    #[arg(short = 'r', long = "restore", env = "RESTORE")]
    pub restore: Option<bool>,
    #[arg(short = 'd', long = "database-dsn", env = "DATABASE_DSN")]
    pub database_dsn: Option<String>,
    /// Shared secret for the integrity digest.
    #[arg(short = 'k', long = "key", env = "KEY")]
    pub key: Option<String>,
    /// Path to the PEM RSA private key used to decrypt request bodies.
    #[arg(long = "crypto-key", env = "CRYPTO_KEY")]
    pub crypto_key: Option<String>,
    #[arg(short = 't', long = "trusted-subnet", env = "TRUSTED_SUBNET")]
    pub trusted_subnet: Option<String>,
    #[arg(long = "audit-file", env = "AUDIT_FILE")]
    pub audit_file: Option<String>,
    #[arg(long = "audit-url", env = "AUDIT_URL")]
    pub audit_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub address: Option<String>,
    pub grpc_address: Option<String>,
    pub store_interval: Option<u64>,
    pub store_file: Option<String>,
    pub restore: Option<bool>,
    pub database_dsn: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<String>,
    pub trusted_subnet: Option<String>,
    pub audit_file: Option<String>,
    pub audit_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
    pub grpc_address: Option<String>,
    pub store_interval: u64,
    pub store_file: String,
    pub restore: bool,
    pub database_dsn: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<String>,
    pub trusted_subnet: Option<String>,
    pub audit_file: Option<String>,
    pub audit_url: Option<String>,
    pub storage: StorageConfig,
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let cli = ServerCli::parse();
        let file = load_file_config(cli.config.as_deref())?;
        Ok(Self::resolve(cli, file))
    }

    pub fn resolve(cli: ServerCli, file: ServerFileConfig) -> Self {
        ServerConfig {
            address: cli
                .address
                .or(file.address)
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            grpc_address: cli.grpc_address.or(file.grpc_address).filter(non_empty),
            store_interval: cli
                .store_interval
                .or(file.store_interval)
                .unwrap_or(DEFAULT_STORE_INTERVAL_SECS),
            store_file: cli
                .store_file
                .or(file.store_file)
                .unwrap_or_else(|| DEFAULT_STORE_FILE.to_string()),
            restore: cli.restore.or(file.restore).unwrap_or(true),
            database_dsn: cli.database_dsn.or(file.database_dsn).filter(non_empty),
            key: cli.key.or(file.key).filter(non_empty),
            crypto_key: cli.crypto_key.or(file.crypto_key).filter(non_empty),
            trusted_subnet: cli
                .trusted_subnet
                .or(file.trusted_subnet)
                .filter(non_empty),
            audit_file: cli.audit_file.or(file.audit_file).filter(non_empty),
            audit_url: cli.audit_url.or(file.audit_url).filter(non_empty),
            storage: StorageConfig::default(),
        }
    }

    pub fn uses_sql(&self) -> bool {
        self.database_dsn.is_some()
    }

    /// The snapshot file mirrors the repository only when the database is
    /// not the authority and a file path is configured.
    pub fn snapshot_enabled(&self) -> bool {
        !self.uses_sql() && !self.store_file.is_empty()
    }

    pub fn sync_mode(&self) -> bool {
        self.store_interval == 0
    }
}

#[derive(Debug, Parser)]
#[command(name = "metrix-agent", about = "Metrics collection agent")]
pub struct AgentCli {
    /// Path to a JSON config file (lowest-precedence layer).
    #[arg(short = 'c', long = "config", env = "CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(short = 'a', long = "address", env = "ADDRESS")]
    pub address: Option<String>,
    /// When set, metrics are shipped over gRPC instead of HTTP.
    #[arg(short = 'g', long = "grpc-address", env = "GRPC_ADDRESS")]
    pub grpc_address: Option<String>,
    #[arg(short = 'r', long = "report-interval", env = "REPORT_INTERVAL")]
    pub report_interval: Option<u64>,
    #[arg(short = 'p', long = "poll-interval", env = "POLL_INTERVAL")]
    pub poll_interval: Option<u64>,
    /// Maximum number of concurrent outbound sends.
    #[arg(short = 'l', long = "rate-limit", env = "RATE_LIMIT")]
    pub rate_limit: Option<usize>,
    #[arg(short = 'k', long = "key", env = "KEY")]
    pub key: Option<String>,
    /// Path to the PEM RSA public key used to encrypt payloads.
    #[arg(long = "crypto-key", env = "CRYPTO_KEY")]
    pub crypto_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AgentFileConfig {
    pub address: Option<String>,
    pub grpc_address: Option<String>,
    pub report_interval: Option<u64>,
    pub poll_interval: Option<u64>,
    pub rate_limit: Option<usize>,
    pub key: Option<String>,
    pub crypto_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server base URL, always scheme-prefixed.
    pub address: String,
    pub grpc_address: Option<String>,
    pub report_interval: u64,
    pub poll_interval: u64,
    pub rate_limit: usize,
    pub key: Option<String>,
    pub crypto_key: Option<String>,
}

impl AgentConfig {
    pub fn load() -> anyhow::Result<Self> {
        let cli = AgentCli::parse();
        let file: AgentFileConfig = load_file_config(cli.config.as_deref())?;
        Ok(Self::resolve(cli, file))
    }

    pub fn resolve(cli: AgentCli, file: AgentFileConfig) -> Self {
        let address = cli
            .address
            .or(file.address)
            .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
        AgentConfig {
            address: normalize_base_url(&address),
            grpc_address: cli.grpc_address.or(file.grpc_address).filter(non_empty),
            report_interval: cli
                .report_interval
                .or(file.report_interval)
                .unwrap_or(DEFAULT_REPORT_INTERVAL_SECS),
            poll_interval: cli
                .poll_interval
                .or(file.poll_interval)
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
            rate_limit: cli
                .rate_limit
                .or(file.rate_limit)
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_RATE_LIMIT),
            key: cli.key.or(file.key).filter(non_empty),
            crypto_key: cli.crypto_key.or(file.crypto_key).filter(non_empty),
        }
    }
}

fn load_file_config<T: Default + for<'de> Deserialize<'de>>(
    path: Option<&std::path::Path>,
) -> anyhow::Result<T> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))
        }
        None => Ok(T::default()),
    }
}

fn non_empty(s: &String) -> bool {
    !s.trim().is_empty()
}

fn normalize_base_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}
