use std::path::PathBuf;

use clap::Parser;

/// Server settings. Every flag can also be set through its `ROOMBOOK_*`
/// environment variable.
#[derive(Parser, Debug, Clone)]
#[command(name = "roombook", version, about = "Room booking server speaking the Postgres wire protocol")]
pub struct Config {
    #[arg(long, env = "ROOMBOOK_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "ROOMBOOK_PORT", default_value_t = 5433)]
    pub port: u16,

    /// Directory holding `roombook.wal`.
    #[arg(long, env = "ROOMBOOK_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Shared password every login must present.
    #[arg(long, env = "ROOMBOOK_PASSWORD", default_value = "roombook", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "ROOMBOOK_MAX_CONNECTIONS", default_value_t = 256)]
    pub max_connections: usize,

    /// WAL appends since the last compaction that trigger the next one.
    #[arg(long, env = "ROOMBOOK_COMPACT_THRESHOLD", default_value_t = 1000)]
    pub compact_threshold: u64,

    #[arg(long, env = "ROOMBOOK_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "ROOMBOOK_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Serve Prometheus metrics on this port. Disabled when unset.
    #[arg(long, env = "ROOMBOOK_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roombook.wal")
    }
}
