use crate::error::{RentError, Result};
use crate::types::Currency;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Caps a renter imposes on host prices. A host breaching any cap is
/// ineligible until its next price table refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GougingSettings {
    pub max_rpc_price: Currency,
    pub max_contract_price: Currency,
    pub max_download_price: Currency,
    pub max_upload_price: Currency,
    pub max_storage_price: Currency,
    pub max_sector_access_price: Currency,
    pub min_max_collateral: Currency,
    /// Minimum price table validity in seconds.
    pub min_price_table_validity_secs: u64,
    /// How far the host's reported block height may lag ours.
    pub host_block_height_leeway: u64,
}

impl Default for GougingSettings {
    fn default() -> Self {
        Self {
            max_rpc_price: Currency::new(1_000_000),
            max_contract_price: Currency::new(15_000_000_000),
            max_download_price: Currency::new(3_000_000_000_000),
            max_upload_price: Currency::new(3_000_000_000_000),
            max_storage_price: Currency::new(631_000),
            max_sector_access_price: Currency::new(1_000_000),
            min_max_collateral: Currency::new(10_000_000),
            min_price_table_validity_secs: 60,
            host_block_height_leeway: 6,
        }
    }
}

/// Erasure-coding parameters applied to new uploads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RedundancySettings {
    pub min_shards: u8,
    pub total_shards: u8,
}

impl Default for RedundancySettings {
    fn default() -> Self {
        Self {
            min_shards: 10,
            total_shards: 30,
        }
    }
}

impl RedundancySettings {
    pub fn validate(&self) -> Result<()> {
        if self.min_shards == 0 {
            return Err(RentError::Config("min_shards must be positive".into()));
        }
        if self.min_shards > self.total_shards {
            return Err(RentError::Config(format!(
                "min_shards {} exceeds total_shards {}",
                self.min_shards, self.total_shards
            )));
        }
        Ok(())
    }

    pub fn redundancy(&self) -> f64 {
        self.total_shards as f64 / self.min_shards as f64
    }
}

/// Contract formation and maintenance parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractsConfig {
    /// Target number of usable contracts.
    pub amount: u64,
    /// Funds allocated per contract at formation.
    pub allowance: Currency,
    /// Contract duration in blocks.
    pub period: u64,
    /// Blocks before window start at which we renew.
    pub renew_window: u64,
    /// Run the pruner during maintenance.
    pub prune: bool,
}

impl Default for ContractsConfig {
    fn default() -> Self {
        Self {
            amount: 50,
            allowance: Currency::new(1_000_000_000_000),
            period: 4032,
            renew_window: 1008,
            prune: true,
        }
    }
}

/// Host scanning and removal parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostsConfig {
    /// Hours of downtime after which a persistently failing host is removed.
    pub max_downtime_hours: u64,
    /// Consecutive scan failures required before removal.
    pub min_recent_scan_failures: u64,
    /// Minimum composite score for a host to be usable.
    pub min_score: f64,
    /// Probes issued concurrently per scan tick.
    pub scan_batch_size: usize,
    /// Per-probe budget.
    #[serde(with = "duration_secs")]
    pub scan_timeout: Duration,
    /// Interval between scans of the same host.
    #[serde(with = "duration_secs")]
    pub scan_interval: Duration,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            max_downtime_hours: 24 * 7,
            min_recent_scan_failures: 10,
            min_score: 1e-9,
            scan_batch_size: 10,
            scan_timeout: Duration::from_secs(30),
            scan_interval: Duration::from_secs(60 * 60),
        }
    }
}

const MAX_DOWNTIME_HOURS_CAP: u64 = 99 * 365 * 24;

/// Top-level autopilot configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AutopilotConfig {
    pub enabled: bool,
    pub contracts: ContractsConfig,
    pub hosts: HostsConfig,
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hosts.max_downtime_hours > MAX_DOWNTIME_HOURS_CAP {
            return Err(RentError::Config(format!(
                "max_downtime_hours {} exceeds cap {}",
                self.hosts.max_downtime_hours, MAX_DOWNTIME_HOURS_CAP
            )));
        }
        if self.contracts.renew_window == 0 {
            return Err(RentError::Config("renew_window must be positive".into()));
        }
        if self.contracts.amount == 0 {
            return Err(RentError::Config("contract amount must be positive".into()));
        }
        Ok(())
    }

    /// How many hosts the contractor wants contracts with, including
    /// headroom for churn.
    pub fn wanted_contracts(&self) -> u64 {
        self.contracts.amount
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_downtime_cap() {
        let mut cfg = AutopilotConfig {
            enabled: true,
            ..Default::default()
        };
        cfg.hosts.max_downtime_hours = 99 * 365 * 24;
        assert!(cfg.validate().is_ok());
        cfg.hosts.max_downtime_hours += 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_redundancy_validation() {
        assert!(RedundancySettings {
            min_shards: 0,
            total_shards: 3
        }
        .validate()
        .is_err());
        assert!(RedundancySettings {
            min_shards: 4,
            total_shards: 3
        }
        .validate()
        .is_err());
        assert!(RedundancySettings {
            min_shards: 3,
            total_shards: 3
        }
        .validate()
        .is_ok());
    }
}
