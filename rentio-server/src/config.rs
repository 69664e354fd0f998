use rentio_core::{AutopilotConfig, GougingSettings, RedundancySettings, RentError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path of the SQLite metadata database.
    pub store_path: PathBuf,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Shared secret for the control-plane API.
    pub auth_secret: String,
    /// Serve GET /objects without authentication.
    #[serde(default)]
    pub anonymous_downloads: bool,
    /// Base URL of the blockchain node's JSON API.
    pub node_api_url: String,
    /// Base URL of the host-RPC gateway translating JSON to the wire
    /// protocol.
    #[serde(default = "default_host_gateway_url")]
    pub host_gateway_url: String,
    /// Hex-encoded 32-byte worker seed; account keys derive from it.
    pub worker_seed: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_sector_timeout_ms")]
    pub upload_sector_timeout_ms: u64,
    #[serde(default = "default_sector_timeout_ms")]
    pub download_sector_timeout_ms: u64,
    #[serde(default = "default_migrator_parallel_slabs")]
    pub migrator_parallel_slabs: usize,
    #[serde(default = "default_health_cutoff")]
    pub migrator_health_cutoff: f64,
    #[serde(default)]
    pub autopilot: AutopilotConfig,
    #[serde(default)]
    pub gouging: GougingSettings,
    #[serde(default)]
    pub redundancy: RedundancySettings,
}

fn default_listen_addr() -> String {
    "127.0.0.1:9980".to_string()
}

fn default_host_gateway_url() -> String {
    "http://127.0.0.1:9981".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30 * 60
}

fn default_sector_timeout_ms() -> u64 {
    3000
}

fn default_migrator_parallel_slabs() -> usize {
    2
}

fn default_health_cutoff() -> f64 {
    0.75
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| RentError::Config(format!("invalid config file '{path}': {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth_secret.is_empty() {
            return Err(RentError::Config("auth_secret cannot be empty".to_string()));
        }
        self.worker_seed()?;
        self.autopilot.validate()?;
        self.redundancy.validate()?;
        Ok(())
    }

    pub fn worker_seed(&self) -> Result<[u8; 32]> {
        let mut seed = [0u8; 32];
        hex::decode_to_slice(&self.worker_seed, &mut seed)
            .map_err(|e| RentError::Config(format!("worker_seed must be 32 hex bytes: {e}")))?;
        Ok(seed)
    }
}
