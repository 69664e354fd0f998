//! Price gouging checks against the renter's configured caps.

use super::{HostSettings, PriceTable};
use crate::settings::GougingSettings;
use std::fmt;

#[derive(Debug, Clone)]
pub struct GougingChecker {
    settings: GougingSettings,
    consensus_height: u64,
}

/// The individual reasons a host was judged to be gouging. Empty means the
/// host passed.
#[derive(Debug, Default, Clone)]
pub struct GougingBreakdown {
    pub reasons: Vec<String>,
}

impl GougingBreakdown {
    pub fn is_gouging(&self) -> bool {
        !self.reasons.is_empty()
    }
}

impl fmt::Display for GougingBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reasons.join("; "))
    }
}

impl GougingChecker {
    pub fn new(settings: GougingSettings, consensus_height: u64) -> Self {
        Self {
            settings,
            consensus_height,
        }
    }

    pub fn check_price_table(&self, pt: &PriceTable) -> GougingBreakdown {
        let s = &self.settings;
        let mut breakdown = GougingBreakdown::default();
        let mut reject = |reason: String| breakdown.reasons.push(reason);

        if pt.update_price_table_cost > s.max_rpc_price {
            reject(format!(
                "update price table cost {} exceeds max RPC price {}",
                pt.update_price_table_cost, s.max_rpc_price
            ));
        }
        if pt.latest_revision_cost > s.max_rpc_price {
            reject(format!(
                "latest revision cost {} exceeds max RPC price {}",
                pt.latest_revision_cost, s.max_rpc_price
            ));
        }
        if pt.contract_price > s.max_contract_price {
            reject(format!(
                "contract price {} exceeds max {}",
                pt.contract_price, s.max_contract_price
            ));
        }
        if pt.download_bandwidth_cost > s.max_download_price {
            reject(format!(
                "download price {} exceeds max {}",
                pt.download_bandwidth_cost, s.max_download_price
            ));
        }
        if pt.upload_bandwidth_cost > s.max_upload_price {
            reject(format!(
                "upload price {} exceeds max {}",
                pt.upload_bandwidth_cost, s.max_upload_price
            ));
        }
        if pt.storage_cost > s.max_storage_price {
            reject(format!(
                "storage price {} exceeds max {}",
                pt.storage_cost, s.max_storage_price
            ));
        }
        if pt.sector_access_cost > s.max_sector_access_price {
            reject(format!(
                "sector access price {} exceeds max {}",
                pt.sector_access_cost, s.max_sector_access_price
            ));
        }
        if pt.max_collateral < s.min_max_collateral {
            reject(format!(
                "max collateral {} below required {}",
                pt.max_collateral, s.min_max_collateral
            ));
        }
        if pt.validity_secs < s.min_price_table_validity_secs {
            reject(format!(
                "price table validity {}s below required {}s",
                pt.validity_secs, s.min_price_table_validity_secs
            ));
        }
        let leeway = s.host_block_height_leeway;
        let out_of_range = pt.host_block_height + leeway < self.consensus_height
            || pt.host_block_height > self.consensus_height + leeway;
        if out_of_range {
            reject(format!(
                "host block height {} outside leeway {} of {}",
                pt.host_block_height, leeway, self.consensus_height
            ));
        }
        breakdown
    }

    /// Settings-level check used before forming contracts.
    pub fn check_settings(&self, settings: &HostSettings) -> GougingBreakdown {
        let mut breakdown = GougingBreakdown::default();
        if settings.max_collateral < self.settings.min_max_collateral {
            breakdown.reasons.push(format!(
                "max collateral {} below required {}",
                settings.max_collateral, self.settings.min_max_collateral
            ));
        }
        breakdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Currency;

    fn benign_table(height: u64) -> PriceTable {
        PriceTable {
            validity_secs: 600,
            host_block_height: height,
            max_collateral: Currency::new(u128::MAX / 2),
            ..Default::default()
        }
    }

    #[test]
    fn test_benign_table_passes() {
        let checker = GougingChecker::new(GougingSettings::default(), 100);
        assert!(!checker.check_price_table(&benign_table(100)).is_gouging());
    }

    #[test]
    fn test_each_cap_is_enforced() {
        let settings = GougingSettings::default();
        let checker = GougingChecker::new(settings.clone(), 100);

        let mut pt = benign_table(100);
        pt.storage_cost = settings.max_storage_price.saturating_add(Currency::new(1));
        assert!(checker.check_price_table(&pt).is_gouging());

        let mut pt = benign_table(100);
        pt.validity_secs = settings.min_price_table_validity_secs - 1;
        assert!(checker.check_price_table(&pt).is_gouging());

        let mut pt = benign_table(100);
        pt.max_collateral = Currency::ZERO;
        assert!(checker.check_price_table(&pt).is_gouging());
    }

    #[test]
    fn test_block_height_leeway() {
        let checker = GougingChecker::new(GougingSettings::default(), 100);
        let leeway = GougingSettings::default().host_block_height_leeway;
        assert!(!checker
            .check_price_table(&benign_table(100 - leeway))
            .is_gouging());
        assert!(!checker
            .check_price_table(&benign_table(100 + leeway))
            .is_gouging());
        assert!(checker
            .check_price_table(&benign_table(100 - leeway - 1))
            .is_gouging());
        assert!(checker
            .check_price_table(&benign_table(100 + leeway + 1))
            .is_gouging());
    }
}
