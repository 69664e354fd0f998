//! The autopilot: a single-threaded periodic control loop driving host
//! scanning, account upkeep, contract maintenance, migration, and pruning.
//! Everything it invokes fans out internally; the loop itself only ever
//! runs one iteration at a time.

pub mod contractor;
pub mod migrator;
pub mod pruner;
pub mod scanner;
pub mod scoring;

pub use contractor::{Contractor, MaintenanceState};
pub use migrator::Migrator;
pub use pruner::Pruner;
pub use scanner::Scanner;
pub use scoring::{host_score, HostScoreBreakdown};

use crate::chain::ChainClient;
use crate::error::{RentError, Result};
use crate::host::{AccountManager, GougingChecker, HostTransport, Payment};
use crate::settings::{AutopilotConfig, GougingSettings, RedundancySettings};
use crate::store::MetadataStore;
use crate::types::Currency;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Local balance every host account is topped up to each cycle.
const ACCOUNT_TARGET_BALANCE: Currency = Currency(1_000_000_000);

/// The name of the contract set the autopilot maintains.
pub const AUTOPILOT_CONTRACT_SET: &str = "autopilot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotState {
    Init,
    WaitingOnline,
    WaitingSynced,
    WaitingEnabled,
    Active,
    ShuttingDown,
}

pub struct Autopilot {
    chain: Arc<dyn ChainClient>,
    store: Arc<MetadataStore>,
    transport: Arc<dyn HostTransport>,
    accounts: Arc<AccountManager>,
    pub scanner: Arc<Scanner>,
    pub contractor: Arc<Contractor>,
    pub migrator: Arc<Migrator>,
    pub pruner: Arc<Pruner>,

    config: RwLock<AutopilotConfig>,
    gouging: RwLock<GougingSettings>,
    redundancy: RwLock<RedundancySettings>,

    heartbeat: Duration,
    poll_interval: Duration,
    wallet_poll_interval: Duration,

    state: Mutex<AutopilotState>,
    start_time: Mutex<Option<DateTime<Utc>>>,
    trigger_tx: mpsc::Sender<bool>,
    trigger_rx: tokio::sync::Mutex<mpsc::Receiver<bool>>,
    shutdown: CancellationToken,
    stopped: tokio::sync::Notify,
}

#[allow(clippy::too_many_arguments)]
impl Autopilot {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<MetadataStore>,
        transport: Arc<dyn HostTransport>,
        accounts: Arc<AccountManager>,
        scanner: Arc<Scanner>,
        contractor: Arc<Contractor>,
        migrator: Arc<Migrator>,
        pruner: Arc<Pruner>,
        config: AutopilotConfig,
        gouging: GougingSettings,
        redundancy: RedundancySettings,
        heartbeat: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        Self {
            chain,
            store,
            transport,
            accounts,
            scanner,
            contractor,
            migrator,
            pruner,
            config: RwLock::new(config),
            gouging: RwLock::new(gouging),
            redundancy: RwLock::new(redundancy),
            heartbeat,
            poll_interval: Duration::from_secs(1),
            wallet_poll_interval: Duration::from_secs(5),
            state: Mutex::new(AutopilotState::Init),
            start_time: Mutex::new(None),
            trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(trigger_rx),
            shutdown,
            stopped: tokio::sync::Notify::new(),
        }
    }

    #[cfg(test)]
    fn with_poll_intervals(mut self, poll: Duration, wallet: Duration) -> Self {
        self.poll_interval = poll;
        self.wallet_poll_interval = wallet;
        self
    }

    pub fn state(&self) -> AutopilotState {
        *self.state.lock().expect("autopilot state poisoned")
    }

    fn set_state(&self, state: AutopilotState) {
        tracing::info!("autopilot entering state {:?}", state);
        *self.state.lock().expect("autopilot state poisoned") = state;
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        *self.start_time.lock().expect("autopilot state poisoned")
    }

    pub fn config(&self) -> AutopilotConfig {
        self.config.read().expect("autopilot config poisoned").clone()
    }

    pub fn update_config(&self, config: AutopilotConfig) -> Result<()> {
        config.validate()?;
        *self.config.write().expect("autopilot config poisoned") = config;
        Ok(())
    }

    /// Fire the loop out of its sleep; returns false when a trigger is
    /// already pending.
    pub fn trigger(&self, force_scan: bool) -> bool {
        self.trigger_tx.try_send(force_scan).is_ok()
    }

    /// Drive the state machine until shutdown.
    pub async fn run(self: Arc<Self>) {
        *self.start_time.lock().expect("autopilot state poisoned") = Some(Utc::now());

        self.set_state(AutopilotState::WaitingOnline);
        if !self.block_until_online().await {
            self.finish();
            return;
        }
        self.set_state(AutopilotState::WaitingSynced);
        if !self.block_until_synced().await {
            self.finish();
            return;
        }
        self.set_state(AutopilotState::WaitingEnabled);
        if !self.block_until_enabled().await {
            self.finish();
            return;
        }

        if let Err(e) = self.try_schedule_trigger_when_funded().await {
            if !matches!(e, RentError::Cancelled) {
                tracing::error!("wallet trigger setup failed: {}", e);
            }
        }

        self.set_state(AutopilotState::Active);
        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick is immediate

        let mut force_scan = false;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            tracing::info!("autopilot iteration starting");
            self.perform_maintenance(force_scan).await;
            tracing::info!("autopilot iteration ended");
            force_scan = false;

            let mut rx = self.trigger_rx.lock().await;
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                triggered = rx.recv() => {
                    tracing::info!("autopilot iteration triggered");
                    force_scan = triggered.unwrap_or(false);
                    ticker.reset();
                }
                _ = ticker.tick() => {}
            }
        }
        self.finish();
    }

    fn finish(&self) {
        self.set_state(AutopilotState::ShuttingDown);
        self.stopped.notify_waiters();
    }

    /// Cancel the loop and wait up to `timeout` for in-flight maintenance
    /// to drain.
    pub async fn shutdown(&self, timeout: Duration) {
        let mut stopped = std::pin::pin!(self.stopped.notified());
        stopped.as_mut().enable();
        self.shutdown.cancel();
        if self.state() == AutopilotState::ShuttingDown {
            return;
        }
        let _ = tokio::time::timeout(timeout, stopped).await;
    }

    async fn block_until_online(&self) -> bool {
        loop {
            match self.chain.syncer_peers().await {
                Ok(peers) if !peers.is_empty() => return true,
                Ok(_) => {}
                Err(e) => tracing::error!("failed to get peers: {}", e),
            }
            if !self.sleep_poll().await {
                return false;
            }
        }
    }

    async fn block_until_synced(&self) -> bool {
        loop {
            match self.chain.consensus_state().await {
                Ok(cs) if cs.synced => return true,
                Ok(_) => {}
                Err(e) => tracing::error!("failed to get consensus state: {}", e),
            }
            if !self.sleep_poll().await {
                return false;
            }
        }
    }

    async fn block_until_enabled(&self) -> bool {
        loop {
            if self.config().enabled {
                return true;
            }
            if !self.sleep_poll().await {
                return false;
            }
        }
    }

    async fn sleep_poll(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }

    /// A one-shot task that fires the trigger once the wallet first sees
    /// funds, so a fresh node starts forming contracts without waiting for
    /// the next heartbeat.
    async fn try_schedule_trigger_when_funded(self: &Arc<Self>) -> Result<()> {
        let wallet = self.chain.wallet().await?;
        if !wallet.is_empty() {
            return Ok(());
        }

        tracing::info!("autopilot trigger scheduled for the wallet's first deposit");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(this.wallet_poll_interval) => {}
                }
                match this.chain.wallet().await {
                    Ok(wallet) if !wallet.is_empty() => {
                        if this.trigger(false) {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("failed to get wallet info: {}", e),
                }
            }
        });
        Ok(())
    }

    async fn perform_maintenance(&self, force_scan: bool) {
        // scanning needs neither sync nor configuration
        self.scanner.scan(&self.shutdown, force_scan).await;

        let state = match self.build_state().await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("aborting maintenance, failed to build state: {}", e);
                return;
            }
        };
        self.scanner.update_hosts_config(state.config.hosts.clone());
        let checker = GougingChecker::new(state.gouging.clone(), state.consensus.block_height);

        self.perform_account_maintenance(&state).await;

        let set_changed = match self
            .contractor
            .perform_contract_maintenance(&self.shutdown, &state)
            .await
        {
            Ok(changed) => changed,
            Err(RentError::Cancelled) => return,
            Err(e) => {
                tracing::error!("contract maintenance failed: {}", e);
                false
            }
        };
        // the health of slabs may have changed with the set
        if set_changed {
            self.migrator.signal_maintenance_finished();
        }

        self.migrator.migrate(&self.shutdown, &checker).await;

        if state.config.contracts.prune {
            self.pruner
                .perform_pruning(&self.shutdown, &checker, state.consensus.block_height)
                .await;
        } else {
            tracing::debug!("pruning disabled");
        }
    }

    /// Sync flagged accounts against their hosts, then refill every
    /// account in the set back to the target balance.
    async fn perform_account_maintenance(&self, state: &MaintenanceState) {
        let contracts = self
            .store
            .contracts_in_set(self.contractor.contract_set())
            .unwrap_or_default();

        let flagged: std::collections::HashSet<_> = self
            .store
            .accounts()
            .unwrap_or_default()
            .into_iter()
            .filter(|a| a.requires_sync)
            .map(|a| a.host_key)
            .collect();

        for contract in contracts {
            if self.shutdown.is_cancelled() {
                return;
            }
            let account = match self.accounts.for_host(contract.host_key) {
                Ok(account) => account,
                Err(e) => {
                    tracing::warn!("no account for host {}: {}", contract.host_key, e);
                    continue;
                }
            };

            if flagged.contains(&contract.host_key) {
                let transport = Arc::clone(&self.transport);
                let host = contract.host_key;
                let addr = contract.host_address.clone();
                let id = account.id();
                let result = account
                    .with_sync(|| async {
                        transport
                            .account_balance(
                                host,
                                &addr,
                                id,
                                Payment::ByEphemeralAccount {
                                    account: id,
                                    amount: Currency::ZERO,
                                    expiry_height: state.consensus.block_height
                                        + crate::host::WITHDRAWAL_EXPIRY_BLOCKS,
                                },
                            )
                            .await
                    })
                    .await;
                if let Err(e) = result {
                    tracing::warn!("account sync with {} failed: {}", contract.host_key, e);
                    continue;
                }
            }

            let balance = account.balance().unwrap_or(0);
            let target = ACCOUNT_TARGET_BALANCE.0 as i128;
            if balance >= target / 2 {
                continue;
            }
            let deposit = Currency::new((target - balance.max(0)) as u128);
            let transport = Arc::clone(&self.transport);
            let host = contract.host_key;
            let addr = contract.host_address.clone();
            let id = account.id();
            let fcid = contract.id;
            let result = account
                .with_deposit(|| async {
                    transport
                        .fund_account(
                            host,
                            &addr,
                            id,
                            deposit,
                            Payment::ByContract {
                                contract_id: fcid,
                                amount: deposit,
                            },
                        )
                        .await?;
                    Ok(deposit)
                })
                .await;
            if let Err(e) = result {
                tracing::warn!("refilling account with {} failed: {}", contract.host_key, e);
            }
        }
    }

    async fn build_state(&self) -> Result<MaintenanceState> {
        let config = self.config();
        let consensus = self.chain.consensus_state().await?;
        if !consensus.synced {
            return Err(RentError::PreconditionFailed("consensus not synced".into()));
        }
        let fee = self.chain.recommended_fee().await?;
        let wallet = self.chain.wallet().await?;
        let skip_contract_formations = wallet.is_empty();

        Ok(MaintenanceState {
            config,
            gouging: self.gouging.read().expect("gouging poisoned").clone(),
            redundancy: *self.redundancy.read().expect("redundancy poisoned"),
            consensus,
            fee,
            address: wallet.address,
            skip_contract_formations,
        })
    }
}
