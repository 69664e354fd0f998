//! Contract maintenance: archive, renew, refresh, form, and keep the
//! contract set pointing at exactly the usable contracts.

use super::scoring::host_score;
use crate::error::{Result, UnusableReason};
use crate::host::{GougingChecker, HostTransport};
use crate::settings::{AutopilotConfig, GougingSettings, RedundancySettings};
use crate::store::{ContractMetadata, HostInfo, MetadataStore};
use crate::transfer::{ContractLocker, CONTRACT_LOCKING_UPLOAD_PRIORITY};
use crate::types::{Currency, FileContractId, PublicKey};
use crate::chain::ConsensusState;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Everything a maintenance cycle needs to know, rebuilt per heartbeat.
#[derive(Debug, Clone)]
pub struct MaintenanceState {
    pub config: AutopilotConfig,
    pub gouging: GougingSettings,
    pub redundancy: RedundancySettings,
    pub consensus: ConsensusState,
    pub fee: Currency,
    pub address: String,
    pub skip_contract_formations: bool,
}

/// Parallel fan-out bound for formations and renewals.
const MAINTENANCE_FANOUT: usize = 8;

pub const ARCHIVAL_REASON_EXPIRED: &str = "expired";
pub const ARCHIVAL_REASON_BLOCKED: &str = "hostblocked";

pub struct Contractor {
    store: Arc<MetadataStore>,
    transport: Arc<dyn HostTransport>,
    locker: Arc<dyn ContractLocker>,
    contract_set: String,
}

impl Contractor {
    pub fn new(
        store: Arc<MetadataStore>,
        transport: Arc<dyn HostTransport>,
        locker: Arc<dyn ContractLocker>,
        contract_set: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            locker,
            contract_set: contract_set.into(),
        }
    }

    pub fn contract_set(&self) -> &str {
        &self.contract_set
    }

    /// One maintenance cycle. Returns whether the contract set changed.
    pub async fn perform_contract_maintenance(
        &self,
        shutdown: &CancellationToken,
        state: &MaintenanceState,
    ) -> Result<bool> {
        let height = state.consensus.block_height;
        let cfg = &state.config.contracts;
        let checker = GougingChecker::new(state.gouging.clone(), height);

        let hosts: HashMap<PublicKey, HostInfo> = self
            .store
            .hosts(0, usize::MAX)?
            .into_iter()
            .map(|h| (h.public_key, h))
            .collect();
        let contracts = self.store.active_contracts()?;
        let contracted: HashSet<PublicKey> = contracts.iter().map(|c| c.host_key).collect();

        // partition into keep / renew / refresh / archive
        let mut keep = Vec::new();
        let mut to_renew = Vec::new();
        let mut to_refresh = Vec::new();
        let mut to_archive: HashMap<FileContractId, String> = HashMap::new();
        for contract in contracts {
            let host = hosts.get(&contract.host_key);
            match host {
                None => {
                    to_archive.insert(contract.id, ARCHIVAL_REASON_BLOCKED.to_string());
                    continue;
                }
                Some(host) if host.blocked => {
                    to_archive.insert(contract.id, ARCHIVAL_REASON_BLOCKED.to_string());
                    continue;
                }
                _ => {}
            }
            if contract.window_end <= height {
                to_archive.insert(contract.id, ARCHIVAL_REASON_EXPIRED.to_string());
                continue;
            }
            if height >= contract.window_start.saturating_sub(cfg.renew_window) {
                to_renew.push(contract);
            } else if needs_refresh(&contract) {
                to_refresh.push(contract);
            } else {
                keep.push(contract);
            }
        }

        if !to_archive.is_empty() {
            tracing::info!("archiving {} contracts", to_archive.len());
            self.store.archive_contracts(&to_archive)?;
        }

        // renewals and refreshes, bounded fan-out, each bracketed by the
        // predecessor's contract lock
        let mut usable: Vec<ContractMetadata> = Vec::new();
        let mut usable_keys: HashSet<PublicKey> = HashSet::new();
        for contract in &keep {
            let Some(host) = hosts.get(&contract.host_key) else {
                continue;
            };
            if host_usability(host, &state.config, &state.gouging, &checker).is_empty() {
                usable_keys.insert(contract.host_key);
                usable.push(contract.clone());
            }
        }

        let renewed = self
            .renew_contracts(shutdown, state, to_renew.into_iter().chain(to_refresh).collect(), &hosts)
            .await;
        for contract in renewed {
            usable_keys.insert(contract.host_key);
            usable.push(contract);
        }

        // form contracts with the best-scored candidates when short
        let wanted = cfg.amount as usize;
        if usable.len() < wanted && !state.skip_contract_formations && !shutdown.is_cancelled() {
            // never form a second contract with a host we already cover
            let mut exclude = usable_keys.clone();
            exclude.extend(contracted.iter().copied());
            let candidates =
                self.select_candidates(&hosts, &exclude, state, &checker, wanted - usable.len());
            let formed = self.form_contracts(shutdown, state, candidates).await;
            for contract in formed {
                usable_keys.insert(contract.host_key);
                usable.push(contract);
            }
        } else if state.skip_contract_formations {
            tracing::warn!("contract formations skipped, wallet is empty");
        }

        // replace the set atomically and report whether it changed
        let previous: HashSet<FileContractId> = match self.store.contracts_in_set(&self.contract_set)
        {
            Ok(contracts) => contracts.into_iter().map(|c| c.id).collect(),
            Err(_) => HashSet::new(),
        };
        let ids: Vec<FileContractId> = usable.iter().map(|c| c.id).collect();
        self.store.set_contract_set(&self.contract_set, &ids)?;
        let current: HashSet<FileContractId> = ids.into_iter().collect();
        Ok(previous != current)
    }

    async fn renew_contracts(
        &self,
        shutdown: &CancellationToken,
        state: &MaintenanceState,
        contracts: Vec<ContractMetadata>,
        hosts: &HashMap<PublicKey, HostInfo>,
    ) -> Vec<ContractMetadata> {
        let height = state.consensus.block_height;
        let cfg = &state.config.contracts;
        let end_height = height + cfg.period;
        let renter_funds = cfg.allowance.div(cfg.amount.max(1));

        let fanout = Arc::new(Semaphore::new(MAINTENANCE_FANOUT));
        let mut tasks = Vec::new();
        for contract in contracts {
            let Some(host) = hosts.get(&contract.host_key) else {
                continue;
            };
            let addr = host.net_address.clone();
            let transport = Arc::clone(&self.transport);
            let locker = Arc::clone(&self.locker);
            let store = Arc::clone(&self.store);
            let fanout = Arc::clone(&fanout);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = fanout.acquire_owned().await.ok()?;
                if shutdown.is_cancelled() {
                    return None;
                }
                let lock_id = locker
                    .acquire_contract(
                        contract.id,
                        CONTRACT_LOCKING_UPLOAD_PRIORITY,
                        Duration::from_secs(30),
                    )
                    .await
                    .ok()?;
                let result = transport
                    .renew_contract(contract.host_key, &addr, contract.id, renter_funds, end_height)
                    .await;
                let _ = locker.release_contract(contract.id, lock_id).await;
                match result {
                    Ok(formation) => {
                        match store.add_renewed_contract(
                            formation.contract_id,
                            formation.total_cost,
                            height,
                            formation.window_start,
                            formation.window_end,
                            contract.id,
                        ) {
                            Ok(meta) => Some(meta),
                            Err(e) => {
                                tracing::error!(
                                    "failed to persist renewal of {}: {}",
                                    contract.id,
                                    e
                                );
                                None
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("renewal of {} failed: {}", contract.id, e);
                        None
                    }
                }
            }));
        }

        let mut renewed = Vec::new();
        for task in tasks {
            if let Ok(Some(meta)) = task.await {
                renewed.push(meta);
            }
        }
        renewed
    }

    fn select_candidates(
        &self,
        hosts: &HashMap<PublicKey, HostInfo>,
        exclude: &HashSet<PublicKey>,
        state: &MaintenanceState,
        checker: &GougingChecker,
        want: usize,
    ) -> Vec<(PublicKey, String)> {
        let mut used_domains: HashSet<String> = hosts
            .values()
            .filter(|h| exclude.contains(&h.public_key))
            .map(|h| domain_of(&h.net_address))
            .collect();

        let mut scored: Vec<(f64, PublicKey, String)> = hosts
            .values()
            .filter(|h| !exclude.contains(&h.public_key))
            .filter(|h| host_usability(h, &state.config, &state.gouging, checker).is_empty())
            .map(|h| {
                let score = host_score(h, &state.config, &state.gouging).score();
                (score, h.public_key, h.net_address.clone())
            })
            .collect();
        // deterministic: score descending, host key breaking ties
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });

        let mut picked = Vec::new();
        for (_, key, addr) in scored {
            if picked.len() >= want {
                break;
            }
            // one host per domain keeps shards off shared infrastructure
            if !used_domains.insert(domain_of(&addr)) {
                continue;
            }
            picked.push((key, addr));
        }
        picked
    }

    async fn form_contracts(
        &self,
        shutdown: &CancellationToken,
        state: &MaintenanceState,
        candidates: Vec<(PublicKey, String)>,
    ) -> Vec<ContractMetadata> {
        let height = state.consensus.block_height;
        let cfg = &state.config.contracts;
        let end_height = height + cfg.period;
        let renter_funds = cfg.allowance.div(cfg.amount.max(1));

        let fanout = Arc::new(Semaphore::new(MAINTENANCE_FANOUT));
        let mut tasks = Vec::new();
        for (host, addr) in candidates {
            let transport = Arc::clone(&self.transport);
            let store = Arc::clone(&self.store);
            let fanout = Arc::clone(&fanout);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = fanout.acquire_owned().await.ok()?;
                if shutdown.is_cancelled() {
                    return None;
                }
                match transport
                    .form_contract(host, &addr, renter_funds, end_height)
                    .await
                {
                    Ok(formation) => match store.add_contract(
                        formation.contract_id,
                        host,
                        formation.total_cost,
                        height,
                        formation.window_start,
                        formation.window_end,
                    ) {
                        Ok(meta) => Some(meta),
                        Err(e) => {
                            tracing::error!("failed to persist contract with {}: {}", host, e);
                            None
                        }
                    },
                    Err(e) => {
                        tracing::warn!("formation with {} failed: {}", host, e);
                        None
                    }
                }
            }));
        }

        let mut formed = Vec::new();
        for task in tasks {
            if let Ok(Some(meta)) = task.await {
                formed.push(meta);
            }
        }
        formed
    }
}

/// A contract needs a refresh once recorded spending has eaten most of its
/// funds while uploads keep flowing.
fn needs_refresh(contract: &ContractMetadata) -> bool {
    let quarter = contract.total_cost.div(4);
    let half = contract.total_cost.div(2);
    contract.remaining_funds() < quarter && contract.spending.uploads > half
}

/// Why a host cannot be used right now; empty means usable.
pub fn host_usability(
    host: &HostInfo,
    cfg: &AutopilotConfig,
    gouging: &GougingSettings,
    checker: &GougingChecker,
) -> Vec<UnusableReason> {
    let mut reasons = Vec::new();
    if host.blocked {
        reasons.push(UnusableReason::Blocked);
    }
    if host.announced_height == 0 || host.net_address.is_empty() {
        reasons.push(UnusableReason::NotAnnounced);
    }
    if !host.is_online() {
        reasons.push(UnusableReason::Offline);
    }
    if !host.scanned() {
        reasons.push(UnusableReason::NotCompletingScan);
    }
    if let Some(settings) = &host.settings {
        if !settings.accepting_contracts {
            reasons.push(UnusableReason::NotAcceptingContracts);
        }
    }
    if let Some(pt) = &host.price_table {
        if checker.check_price_table(pt).is_gouging() {
            reasons.push(UnusableReason::Gouging);
        }
    }
    if host.scanned() {
        let score = host_score(host, cfg, gouging).score();
        if score < cfg.hosts.min_score {
            reasons.push(UnusableReason::LowScore);
        }
    }
    reasons
}

fn domain_of(net_address: &str) -> String {
    net_address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(net_address)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ContractFormation, HostSettings, Payment, PriceTable, Revision};
    use crate::store::HostScan;
    use crate::transfer::MemContractLocker;
    use crate::types::Hash256;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FormingTransport {
        formations: AtomicUsize,
        renewals: Mutex<Vec<FileContractId>>,
    }

    impl FormingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                formations: AtomicUsize::new(0),
                renewals: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HostTransport for FormingTransport {
        async fn form_contract(
            &self,
            _host: PublicKey,
            _addr: &str,
            _renter_funds: Currency,
            end_height: u64,
        ) -> Result<ContractFormation> {
            self.formations.fetch_add(1, Ordering::SeqCst);
            Ok(ContractFormation {
                contract_id: FileContractId::random(),
                total_cost: Currency::new(1_000),
                window_start: end_height,
                window_end: end_height + 144,
            })
        }

        async fn renew_contract(
            &self,
            _host: PublicKey,
            _addr: &str,
            contract_id: FileContractId,
            _renter_funds: Currency,
            end_height: u64,
        ) -> Result<ContractFormation> {
            self.renewals.lock().unwrap().push(contract_id);
            Ok(ContractFormation {
                contract_id: FileContractId::random(),
                total_cost: Currency::new(2_000),
                window_start: end_height,
                window_end: end_height + 144,
            })
        }

        async fn scan(&self, _: PublicKey, _: &str) -> Result<(HostSettings, PriceTable)> {
            unimplemented!()
        }
        async fn update_price_table(
            &self,
            _: PublicKey,
            _: &str,
            _: Option<Payment>,
        ) -> Result<PriceTable> {
            unimplemented!()
        }
        async fn account_balance(
            &self,
            _: PublicKey,
            _: &str,
            _: PublicKey,
            _: Payment,
        ) -> Result<Currency> {
            unimplemented!()
        }
        async fn fund_account(
            &self,
            _: PublicKey,
            _: &str,
            _: PublicKey,
            _: Currency,
            _: Payment,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn latest_revision(
            &self,
            _: PublicKey,
            _: &str,
            _: FileContractId,
        ) -> Result<Revision> {
            unimplemented!()
        }
        async fn read_sector(
            &self,
            _: PublicKey,
            _: &str,
            _: Hash256,
            _: u32,
            _: u32,
            _: Payment,
        ) -> Result<(Vec<u8>, Vec<Hash256>)> {
            unimplemented!()
        }
        async fn append_sector(
            &self,
            _: PublicKey,
            _: &str,
            _: FileContractId,
            _: &[u8],
            _: Payment,
        ) -> Result<Hash256> {
            unimplemented!()
        }
        async fn delete_sectors(
            &self,
            _: PublicKey,
            _: &str,
            _: FileContractId,
            _: &[Hash256],
            _: Payment,
        ) -> Result<()> {
            unimplemented!()
        }
    }

    fn good_settings() -> HostSettings {
        HostSettings {
            accepting_contracts: true,
            max_collateral: Currency::new(u128::MAX / 4),
            remaining_storage: 1 << 40,
            total_storage: 1 << 40,
            version: "1.6.0".into(),
        }
    }

    fn benign_price_table(height: u64) -> PriceTable {
        PriceTable {
            validity_secs: 600,
            host_block_height: height,
            max_collateral: Currency::new(u128::MAX / 4),
            ..Default::default()
        }
    }

    fn seed_scanned_host(store: &MetadataStore, addr: &str, height: u64) -> PublicKey {
        let hk = PublicKey::random();
        store.record_host_announcement(hk, addr, 1).unwrap();
        store
            .record_host_scans(&[HostScan {
                host: hk,
                timestamp: Utc::now(),
                success: true,
                settings: Some(good_settings()),
                price_table: Some(benign_price_table(height)),
            }])
            .unwrap();
        hk
    }

    fn maintenance_state(height: u64, amount: u64) -> MaintenanceState {
        let mut config = AutopilotConfig {
            enabled: true,
            ..Default::default()
        };
        config.contracts.amount = amount;
        MaintenanceState {
            config,
            gouging: GougingSettings::default(),
            redundancy: RedundancySettings::default(),
            consensus: ConsensusState {
                block_height: height,
                synced: true,
            },
            fee: Currency::new(1),
            address: "addr1".into(),
            skip_contract_formations: false,
        }
    }

    fn contractor(store: &Arc<MetadataStore>, transport: Arc<FormingTransport>) -> Contractor {
        Contractor::new(
            Arc::clone(store),
            transport,
            Arc::new(MemContractLocker::new(Duration::from_secs(60))),
            "autopilot",
        )
    }

    #[tokio::test]
    async fn test_forms_contracts_up_to_wanted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("meta.db")).unwrap());
        for i in 0..5 {
            seed_scanned_host(&store, &format!("h{i}.example.com:9982"), 100);
        }
        let transport = FormingTransport::new();
        let contractor = contractor(&store, Arc::clone(&transport));

        let changed = contractor
            .perform_contract_maintenance(&CancellationToken::new(), &maintenance_state(100, 3))
            .await
            .unwrap();

        assert!(changed);
        assert_eq!(transport.formations.load(Ordering::SeqCst), 3);
        assert_eq!(store.contracts_in_set("autopilot").unwrap().len(), 3);
        // a second cycle is a no-op
        let changed = contractor
            .perform_contract_maintenance(&CancellationToken::new(), &maintenance_state(100, 3))
            .await
            .unwrap();
        assert!(!changed);
        assert_eq!(transport.formations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_renewal_when_window_approaches() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("meta.db")).unwrap());
        let hk = seed_scanned_host(&store, "renewme.example.com:9982", 900);
        let c1 = FileContractId::random();
        store
            .add_contract(c1, hk, Currency::new(5_000), 10, 1000, 1144)
            .unwrap();
        store.set_contract_set("autopilot", &[c1]).unwrap();

        let transport = FormingTransport::new();
        let contractor = contractor(&store, Arc::clone(&transport));

        // height 900, window_start 1000, renew_window 200: inside the window
        let mut state = maintenance_state(900, 1);
        state.config.contracts.renew_window = 200;
        let changed = contractor
            .perform_contract_maintenance(&CancellationToken::new(), &state)
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(*transport.renewals.lock().unwrap(), vec![c1]);

        // the renewal pair is consistent and the set moved over
        let archived = store.archived_contract(c1).unwrap();
        let c2 = archived.renewed_to.expect("forward pointer");
        assert_eq!(
            archived.reason,
            crate::store::contracts::ARCHIVAL_REASON_RENEWED
        );
        let renewed = store.contract(c2).unwrap();
        assert_eq!(renewed.renewed_from, Some(c1));
        let in_set: Vec<FileContractId> = store
            .contracts_in_set("autopilot")
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert!(in_set.contains(&c2));
        assert!(!in_set.contains(&c1));
    }

    #[tokio::test]
    async fn test_blocked_host_contract_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("meta.db")).unwrap());
        let hk = seed_scanned_host(&store, "bad.example.com:9982", 100);
        let fcid = FileContractId::random();
        store
            .add_contract(fcid, hk, Currency::new(5_000), 10, 5000, 5144)
            .unwrap();
        store.set_contract_set("autopilot", &[fcid]).unwrap();
        store
            .update_blocklist(&["bad.example.com".into()], &[], false)
            .unwrap();

        let transport = FormingTransport::new();
        let contractor = contractor(&store, Arc::clone(&transport));
        let mut state = maintenance_state(100, 1);
        state.skip_contract_formations = true;
        contractor
            .perform_contract_maintenance(&CancellationToken::new(), &state)
            .await
            .unwrap();

        let archived = store.archived_contract(fcid).unwrap();
        assert_eq!(archived.reason, ARCHIVAL_REASON_BLOCKED);
        assert!(store.contracts_in_set("autopilot").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_candidates_deduplicate_domains() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("meta.db")).unwrap());
        // two hosts behind one domain, one behind another
        seed_scanned_host(&store, "shared.example.com:9982", 100);
        seed_scanned_host(&store, "shared.example.com:9983", 100);
        seed_scanned_host(&store, "solo.example.com:9982", 100);

        let transport = FormingTransport::new();
        let contractor = contractor(&store, Arc::clone(&transport));
        contractor
            .perform_contract_maintenance(&CancellationToken::new(), &maintenance_state(100, 3))
            .await
            .unwrap();

        // only two formations: the duplicate domain was skipped
        assert_eq!(transport.formations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_host_usability_reasons() {
        let cfg = AutopilotConfig::default();
        let gouging = GougingSettings::default();
        let checker = GougingChecker::new(gouging.clone(), 100);

        let mut host = HostInfo {
            public_key: PublicKey::random(),
            net_address: "u.example.com:9982".into(),
            announced_height: 5,
            known_since: Utc::now() - chrono::Duration::days(100),
            interactions: crate::store::HostInteractions {
                total_scans: 5,
                last_scan: Some(Utc::now()),
                last_scan_success: true,
                second_to_last_scan_success: true,
                uptime: Duration::from_secs(1000),
                downtime: Duration::ZERO,
                consecutive_failures: 0,
                successful_interactions: 5.0,
                failed_interactions: 0.0,
            },
            settings: Some(good_settings()),
            price_table: Some(benign_price_table(100)),
            price_table_expiry: None,
            blocked: false,
        };
        assert!(host_usability(&host, &cfg, &gouging, &checker).is_empty());

        host.blocked = true;
        assert_eq!(
            host_usability(&host, &cfg, &gouging, &checker),
            vec![UnusableReason::Blocked]
        );
        host.blocked = false;

        host.settings.as_mut().unwrap().accepting_contracts = false;
        assert_eq!(
            host_usability(&host, &cfg, &gouging, &checker),
            vec![UnusableReason::NotAcceptingContracts]
        );
        host.settings.as_mut().unwrap().accepting_contracts = true;

        host.price_table.as_mut().unwrap().host_block_height = 1_000;
        assert_eq!(
            host_usability(&host, &cfg, &gouging, &checker),
            vec![UnusableReason::Gouging]
        );
    }
}
