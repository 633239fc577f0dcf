use std::path::PathBuf;

use gearcheck_broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("broker setup failed: {0}")]
    Broker(#[from] BrokerError),
    #[error("supervisor counter {path}: {source}")]
    Supervisor {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
