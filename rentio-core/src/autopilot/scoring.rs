//! Host scoring.
//!
//! The composite score is the product of the sub-scores, so a near-zero on
//! any axis dominates. Every sub-score stays strictly positive; zero is
//! reserved for "unusable", which is handled before scoring. Ties between
//! equal scores break by host public key to keep selection deterministic.

use crate::settings::{AutopilotConfig, GougingSettings};
use crate::store::HostInfo;
use chrono::Utc;

const MIN_SUB_SCORE: f64 = 0.001;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct HostScoreBreakdown {
    pub age: f64,
    pub collateral: f64,
    pub interactions: f64,
    pub storage_remaining: f64,
    pub uptime: f64,
    pub version: f64,
    pub prices: f64,
}

impl HostScoreBreakdown {
    pub fn score(&self) -> f64 {
        self.age
            * self.collateral
            * self.interactions
            * self.storage_remaining
            * self.uptime
            * self.version
            * self.prices
    }
}

pub fn host_score(
    host: &HostInfo,
    cfg: &AutopilotConfig,
    gouging: &GougingSettings,
) -> HostScoreBreakdown {
    HostScoreBreakdown {
        age: age_score(host),
        collateral: collateral_score(host, cfg),
        interactions: interactions_score(host),
        storage_remaining: storage_score(host),
        uptime: uptime_score(host),
        version: version_score(host),
        prices: price_score(host, gouging),
    }
}

fn clamp(score: f64) -> f64 {
    score.clamp(MIN_SUB_SCORE, 1.0)
}

/// Young hosts have not proven themselves yet; the score ramps to 1 over
/// several months of being known.
fn age_score(host: &HostInfo) -> f64 {
    let days = (Utc::now() - host.known_since).num_days();
    let score = match days {
        d if d < 1 => 0.25,
        d if d < 7 => 0.5,
        d if d < 14 => 0.66,
        d if d < 30 => 0.8,
        d if d < 90 => 0.95,
        _ => 1.0,
    };
    clamp(score)
}

/// How much collateral the host can put up relative to what a contract of
/// our size wants to see.
fn collateral_score(host: &HostInfo, cfg: &AutopilotConfig) -> f64 {
    let Some(settings) = &host.settings else {
        return MIN_SUB_SCORE;
    };
    let per_contract = cfg.contracts.allowance.div(cfg.contracts.amount.max(1));
    let wanted = per_contract.div(2);
    if wanted.is_zero() {
        return 1.0;
    }
    let ratio = settings.max_collateral.0 as f64 / wanted.0 as f64;
    clamp(ratio / 2.0)
}

/// Laplace-smoothed success ratio over recorded interactions, cubed so
/// unreliable hosts fall off quickly.
fn interactions_score(host: &HostInfo) -> f64 {
    let i = &host.interactions;
    let ratio =
        (i.successful_interactions + 1.0) / (i.successful_interactions + i.failed_interactions + 2.0);
    clamp(ratio.powi(3))
}

fn storage_score(host: &HostInfo) -> f64 {
    let Some(settings) = &host.settings else {
        return MIN_SUB_SCORE;
    };
    if settings.total_storage == 0 {
        return MIN_SUB_SCORE;
    }
    let frac = settings.remaining_storage as f64 / settings.total_storage as f64;
    clamp(0.25 + 0.75 * frac)
}

fn uptime_score(host: &HostInfo) -> f64 {
    let i = &host.interactions;
    // benefit of the doubt until we have two scans
    if i.total_scans == 0 {
        return 0.25;
    }
    if i.total_scans == 1 {
        return if i.last_scan_success { 0.75 } else { MIN_SUB_SCORE };
    }
    let up = i.uptime.as_secs_f64();
    let down = i.downtime.as_secs_f64();
    let total = up + down;
    let ratio = if total == 0.0 { 1.0 } else { up / total };
    // hosts below two nines decay hard
    clamp(ratio.powi(8))
}

fn version_score(host: &HostInfo) -> f64 {
    let Some(settings) = &host.settings else {
        return MIN_SUB_SCORE;
    };
    let mut parts = settings
        .version
        .trim_start_matches('v')
        .split('.')
        .filter_map(|p| p.parse::<u64>().ok());
    let (major, minor) = (parts.next().unwrap_or(0), parts.next().unwrap_or(0));
    let score = match (major, minor) {
        (2.., _) => 1.0,
        (1, 6..) => 1.0,
        (1, 5) => 0.99,
        (1, _) => 0.9,
        _ => 0.1,
    };
    clamp(score)
}

/// How far below the gouging caps the host prices sit; at the cap the score
/// bottoms out, at half the cap or less it is neutral.
fn price_score(host: &HostInfo, gouging: &GougingSettings) -> f64 {
    let Some(pt) = &host.price_table else {
        return 0.5;
    };
    let ratio = |price: crate::types::Currency, cap: crate::types::Currency| -> f64 {
        if cap.is_zero() {
            return 0.0;
        }
        (price.0 as f64 / cap.0 as f64).min(1.0)
    };
    let worst = [
        ratio(pt.storage_cost, gouging.max_storage_price),
        ratio(pt.upload_bandwidth_cost, gouging.max_upload_price),
        ratio(pt.download_bandwidth_cost, gouging.max_download_price),
        ratio(pt.sector_access_cost, gouging.max_sector_access_price),
    ]
    .into_iter()
    .fold(0.0f64, f64::max);
    clamp(1.0 - worst / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostSettings, PriceTable};
    use crate::store::HostInteractions;
    use crate::types::{Currency, PublicKey};
    use std::time::Duration;

    fn veteran_host() -> HostInfo {
        HostInfo {
            public_key: PublicKey::random(),
            net_address: "host.example.com:9982".into(),
            announced_height: 10,
            known_since: Utc::now() - chrono::Duration::days(365),
            interactions: HostInteractions {
                total_scans: 100,
                last_scan: Some(Utc::now()),
                last_scan_success: true,
                second_to_last_scan_success: true,
                uptime: Duration::from_secs(100_000),
                downtime: Duration::from_secs(0),
                consecutive_failures: 0,
                successful_interactions: 50.0,
                failed_interactions: 0.0,
            },
            settings: Some(HostSettings {
                accepting_contracts: true,
                max_collateral: Currency::new(u128::MAX / 4),
                remaining_storage: 1 << 40,
                total_storage: 1 << 40,
                version: "1.6.2".into(),
            }),
            price_table: Some(PriceTable::default()),
            price_table_expiry: None,
            blocked: false,
        }
    }

    #[test]
    fn test_all_sub_scores_stay_positive() {
        let bare = HostInfo {
            settings: None,
            price_table: None,
            interactions: HostInteractions::default(),
            ..veteran_host()
        };
        let breakdown = host_score(&bare, &AutopilotConfig::default(), &GougingSettings::default());
        assert!(breakdown.score() > 0.0);
        for sub in [
            breakdown.age,
            breakdown.collateral,
            breakdown.interactions,
            breakdown.storage_remaining,
            breakdown.uptime,
            breakdown.version,
            breakdown.prices,
        ] {
            assert!(sub > 0.0 && sub <= 1.0);
        }
    }

    #[test]
    fn test_veteran_beats_newcomer() {
        let cfg = AutopilotConfig::default();
        let gouging = GougingSettings::default();
        let veteran = host_score(&veteran_host(), &cfg, &gouging);

        let newcomer = HostInfo {
            known_since: Utc::now(),
            interactions: HostInteractions {
                total_scans: 1,
                last_scan_success: true,
                ..Default::default()
            },
            ..veteran_host()
        };
        let newcomer = host_score(&newcomer, &cfg, &gouging);
        assert!(veteran.score() > newcomer.score());
    }

    #[test]
    fn test_flaky_uptime_dominates() {
        let cfg = AutopilotConfig::default();
        let gouging = GougingSettings::default();
        let solid = host_score(&veteran_host(), &cfg, &gouging);

        let mut flaky_info = veteran_host();
        flaky_info.interactions.uptime = Duration::from_secs(50_000);
        flaky_info.interactions.downtime = Duration::from_secs(50_000);
        let flaky = host_score(&flaky_info, &cfg, &gouging);
        assert!(flaky.score() < solid.score() / 10.0);
    }
}
