//! Slab migration: re-disperse unhealthy slabs through the transfer
//! engine, a bounded number at a time.

use crate::error::Result;
use crate::host::{GougingChecker, SectorStoreFactory, SectorStore};
use crate::store::MetadataStore;
use crate::transfer::{migrate_slab, ContractLocker};
use crate::types::{FileContractId, PublicKey};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const MIGRATION_BATCH: usize = 32;

pub struct Migrator {
    store: Arc<MetadataStore>,
    locker: Arc<dyn ContractLocker>,
    factory: Arc<dyn SectorStoreFactory>,
    contract_set: String,
    health_cutoff: f64,
    parallel_slabs: usize,
    download_sector_timeout: Duration,
    upload_sector_timeout: Duration,
    migrating: AtomicBool,
    last_start: Mutex<Option<DateTime<Utc>>>,
    /// Set when contract maintenance changed the set: failed slabs become
    /// worth retrying.
    maintenance_finished: AtomicBool,
}

impl Migrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<MetadataStore>,
        locker: Arc<dyn ContractLocker>,
        factory: Arc<dyn SectorStoreFactory>,
        contract_set: impl Into<String>,
        health_cutoff: f64,
        parallel_slabs: usize,
        download_sector_timeout: Duration,
        upload_sector_timeout: Duration,
    ) -> Self {
        Self {
            store,
            locker,
            factory,
            contract_set: contract_set.into(),
            health_cutoff,
            parallel_slabs: parallel_slabs.max(1),
            download_sector_timeout,
            upload_sector_timeout,
            migrating: AtomicBool::new(false),
            last_start: Mutex::new(None),
            maintenance_finished: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> (bool, Option<DateTime<Utc>>) {
        (
            self.migrating.load(Ordering::SeqCst),
            *self.last_start.lock().expect("migrator status poisoned"),
        )
    }

    /// Wake a running migration immediately: the contract set changed, so
    /// slabs that previously failed may now be migratable.
    pub fn signal_maintenance_finished(&self) {
        self.maintenance_finished.store(true, Ordering::SeqCst);
    }

    /// Drain the unhealthy-slab queue. Honors cancellation between slabs; a
    /// migration in flight leaves its slab unchanged or better on abort.
    pub async fn migrate(&self, shutdown: &CancellationToken, gouging: &GougingChecker) {
        if self
            .migrating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *self.last_start.lock().expect("migrator status poisoned") = Some(Utc::now());

        if let Err(e) = self.migrate_pass(shutdown, gouging).await {
            tracing::error!("migration pass failed: {}", e);
        }

        self.migrating.store(false, Ordering::SeqCst);
    }

    async fn migrate_pass(
        &self,
        shutdown: &CancellationToken,
        gouging: &GougingChecker,
    ) -> Result<()> {
        let mut failed: HashSet<String> = HashSet::new();
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            if self.maintenance_finished.swap(false, Ordering::SeqCst) {
                // set changed: previously failed slabs get another chance
                failed.clear();
            }

            let (hosts, used_contracts) = self.healthy_pool(gouging)?;
            let batch: Vec<_> = self
                .store
                .slabs_for_migration(&self.contract_set, self.health_cutoff, MIGRATION_BATCH)?
                .into_iter()
                .filter(|sh| !failed.contains(&sh.slab.key.to_string()))
                .collect();
            if batch.is_empty() {
                return Ok(());
            }
            tracing::info!("migrating {} slabs", batch.len());

            let pool = Arc::new(Semaphore::new(self.parallel_slabs));
            let mut tasks = Vec::new();
            for slab_health in batch {
                let pool = Arc::clone(&pool);
                let hosts = hosts.clone();
                let used_contracts = used_contracts.clone();
                let locker = Arc::clone(&self.locker);
                let store = Arc::clone(&self.store);
                let shutdown = shutdown.clone();
                let dl = self.download_sector_timeout;
                let ul = self.upload_sector_timeout;
                tasks.push(tokio::spawn(async move {
                    let _permit = pool.acquire_owned().await.expect("pool closed");
                    if shutdown.is_cancelled() {
                        return None;
                    }
                    let mut slab = slab_health.slab;
                    let key = slab.key.to_string();
                    match migrate_slab(&mut slab, &hosts, locker, dl, ul, &shutdown).await {
                        Ok(()) => match store.update_slab(&slab, &used_contracts) {
                            Ok(()) => {
                                tracing::debug!(
                                    "migrated slab {} (health {:.2})",
                                    key,
                                    slab_health.health
                                );
                                None
                            }
                            Err(e) => {
                                tracing::error!("failed to persist migrated slab {}: {}", key, e);
                                Some(key)
                            }
                        },
                        Err(e) => {
                            tracing::warn!("migration of slab {} failed: {}", key, e);
                            Some(key)
                        }
                    }
                }));
            }

            for task in tasks {
                if let Ok(Some(key)) = task.await {
                    failed.insert(key);
                }
            }
        }
    }

    /// The sector stores and host → contract map for the current set.
    fn healthy_pool(
        &self,
        gouging: &GougingChecker,
    ) -> Result<(Vec<Arc<dyn SectorStore>>, HashMap<PublicKey, FileContractId>)> {
        let contracts = self.store.contracts_in_set(&self.contract_set)?;
        let mut hosts = Vec::with_capacity(contracts.len());
        let mut used = HashMap::with_capacity(contracts.len());
        for contract in contracts {
            hosts.push(self.factory.sector_store(
                contract.host_key,
                &contract.host_address,
                contract.id,
                gouging,
            ));
            used.insert(contract.host_key, contract.id);
        }
        Ok((hosts, used))
    }
}
