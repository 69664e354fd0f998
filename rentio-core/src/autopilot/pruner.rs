//! Pruning: delete orphaned data from hosts and the store.
//!
//! Sectors are swept only once no shard references them; archived
//! contracts are hard-deleted once their proof window has closed.

use crate::error::Result;
use crate::host::{GougingChecker, SectorStoreFactory};
use crate::store::MetadataStore;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub struct Pruner {
    store: Arc<MetadataStore>,
    factory: Arc<dyn SectorStoreFactory>,
    pruning: AtomicBool,
    last_start: Mutex<Option<DateTime<Utc>>>,
}

impl Pruner {
    pub fn new(store: Arc<MetadataStore>, factory: Arc<dyn SectorStoreFactory>) -> Self {
        Self {
            store,
            factory,
            pruning: AtomicBool::new(false),
            last_start: Mutex::new(None),
        }
    }

    pub fn status(&self) -> (bool, Option<DateTime<Utc>>) {
        (
            self.pruning.load(Ordering::SeqCst),
            *self.last_start.lock().expect("pruner status poisoned"),
        )
    }

    pub async fn perform_pruning(
        &self,
        shutdown: &CancellationToken,
        gouging: &GougingChecker,
        block_height: u64,
    ) {
        if self
            .pruning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *self.last_start.lock().expect("pruner status poisoned") = Some(Utc::now());

        if let Err(e) = self.prune_pass(shutdown, gouging, block_height).await {
            tracing::error!("prune pass failed: {}", e);
        }

        self.pruning.store(false, Ordering::SeqCst);
    }

    async fn prune_pass(
        &self,
        shutdown: &CancellationToken,
        gouging: &GougingChecker,
        block_height: u64,
    ) -> Result<()> {
        // slabs nothing references anymore free their shards first
        let orphaned = self.store.delete_orphaned_slabs()?;
        if orphaned > 0 {
            tracing::info!("dropped {} orphaned slabs", orphaned);
        }

        // unreferenced sectors plus stale per-host copies, grouped so each
        // host gets one DeleteSectors call
        let mut prunable = self.store.prunable_sectors()?;
        for (host, roots) in self.store.stale_host_sectors()? {
            let entry = prunable.entry(host).or_default();
            for root in roots {
                if !entry.contains(&root) {
                    entry.push(root);
                }
            }
        }
        if !prunable.is_empty() {
            let contracts: HashMap<_, _> = self
                .store
                .active_contracts()
                .unwrap_or_default()
                .into_iter()
                .map(|c| (c.host_key, c))
                .collect();

            let mut tasks = Vec::new();
            for (host_key, roots) in prunable {
                if shutdown.is_cancelled() {
                    break;
                }
                let Some((fcid, addr)) = (match contracts.get(&host_key) {
                    Some(contract) => Some((contract.id, contract.host_address.clone())),
                    // best effort for hosts we only ever had archived
                    // contracts with
                    None => self
                        .store
                        .latest_archived_contract_for_host(host_key)
                        .ok()
                        .flatten()
                        .and_then(|archived| {
                            self.store
                                .host(host_key)
                                .ok()
                                .map(|h| (archived.id, h.net_address))
                        }),
                }) else {
                    // the rows are still reclaimed below
                    continue;
                };
                let store = self.factory.sector_store(host_key, &addr, fcid, gouging);
                tasks.push(tokio::spawn(async move {
                    let count = roots.len();
                    match store.delete_sectors(&roots).await {
                        Ok(()) => {
                            tracing::debug!("deleted {} sectors from {}", count, host_key)
                        }
                        Err(e) => {
                            tracing::warn!("failed to delete sectors from {}: {}", host_key, e)
                        }
                    }
                }));
            }
            for task in tasks {
                let _ = task.await;
            }
        }

        let stale = self.store.delete_stale_host_sectors()?;
        if stale > 0 {
            tracing::debug!("dropped {} stale host-sector links", stale);
        }
        let swept = self.store.delete_prunable_sectors()?;
        if swept > 0 {
            tracing::info!("pruned {} sector rows", swept);
        }

        // archived contracts past their proof window can finally go
        let expired = self.store.delete_expired_archived_contracts(block_height)?;
        if expired > 0 {
            tracing::info!("hard-deleted {} expired archived contracts", expired);
        }
        Ok(())
    }
}
