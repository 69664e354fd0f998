//! Per-host price table cache with single-flight refresh.
//!
//! A cached table is reused until shortly before expiry; the renewal point
//! is jittered by up to 10% of the table's validity so a fleet of workers
//! does not stampede the host. Concurrent fetches share one in-flight
//! update and its result, success or error.

use super::accounts::AccountManager;
use super::{HostTransport, Payment, PriceTable, Revision, WITHDRAWAL_EXPIRY_BLOCKS};
use crate::error::{RentError, Result};
use crate::types::{Currency, PublicKey};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// How long before actual expiry a table is already considered stale.
const VALIDITY_LEEWAY: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct CachedTable {
    table: PriceTable,
    expiry: Instant,
    /// Randomized refresh point before `expiry`.
    renew_at: Instant,
}

type FetchResult = std::result::Result<PriceTable, String>;

struct Entry {
    cached: Option<CachedTable>,
    inflight: Option<watch::Receiver<Option<FetchResult>>>,
}

pub struct PriceTableCache {
    transport: Arc<dyn HostTransport>,
    accounts: Arc<AccountManager>,
    entries: Mutex<HashMap<PublicKey, Entry>>,
}

enum FetchPlan {
    Await(watch::Receiver<Option<FetchResult>>),
    Fetch(watch::Sender<Option<FetchResult>>),
}

impl PriceTableCache {
    pub fn new(transport: Arc<dyn HostTransport>, accounts: Arc<AccountManager>) -> Self {
        Self {
            transport,
            accounts,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a valid price table for the host. Prefers paying from the
    /// ephemeral account; a supplied revision (or an empty account) routes
    /// payment through the contract instead.
    pub async fn fetch(
        &self,
        host: PublicKey,
        addr: &str,
        revision: Option<&Revision>,
    ) -> Result<PriceTable> {
        let plan = {
            let mut entries = self.entries.lock().expect("price table cache poisoned");
            let entry = entries.entry(host).or_insert(Entry {
                cached: None,
                inflight: None,
            });

            if let Some(cached) = &entry.cached {
                if Instant::now() < cached.renew_at {
                    return Ok(cached.table.clone());
                }
            }
            if let Some(rx) = &entry.inflight {
                // an update is in flight; a still-usable table short-cuts
                if let Some(cached) = &entry.cached {
                    if Instant::now() + VALIDITY_LEEWAY < cached.expiry {
                        return Ok(cached.table.clone());
                    }
                }
                FetchPlan::Await(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                entry.inflight = Some(rx);
                FetchPlan::Fetch(tx)
            }
        };

        match plan {
            FetchPlan::Await(mut rx) => {
                let value = rx
                    .wait_for(|v| v.is_some())
                    .await
                    .map_err(|_| RentError::Host("price table update abandoned".into()))?;
                match value.clone().expect("waited for Some") {
                    Ok(table) => Ok(table),
                    Err(e) => Err(RentError::Host(e)),
                }
            }
            FetchPlan::Fetch(tx) => {
                let result = self.fetch_from_host(host, addr, revision).await;

                let shared: FetchResult = match &result {
                    Ok(table) => Ok(table.clone()),
                    Err(e) => Err(e.to_string()),
                };
                {
                    let mut entries = self.entries.lock().expect("price table cache poisoned");
                    let entry = entries.get_mut(&host).expect("entry exists while in flight");
                    if let Ok(table) = &shared {
                        let validity = Duration::from_secs(table.validity_secs);
                        let jitter_limit = (validity.as_secs() / 10).max(1);
                        let jitter =
                            Duration::from_secs(rand::thread_rng().gen_range(0..jitter_limit));
                        let expiry = Instant::now() + validity;
                        entry.cached = Some(CachedTable {
                            table: table.clone(),
                            expiry,
                            renew_at: expiry
                                .checked_sub(VALIDITY_LEEWAY + jitter)
                                .unwrap_or_else(Instant::now),
                        });
                    }
                    entry.inflight = None;
                }
                let _ = tx.send(Some(shared));
                result
            }
        }
    }

    async fn fetch_from_host(
        &self,
        host: PublicKey,
        addr: &str,
        revision: Option<&Revision>,
    ) -> Result<PriceTable> {
        let account = self.accounts.for_host(host)?;

        // contract payment when a revision is supplied or the account is dry
        if let Some(revision) = revision {
            let table = self
                .transport
                .update_price_table(
                    host,
                    addr,
                    Some(Payment::ByContract {
                        contract_id: revision.contract_id,
                        amount: revision.renter_funds,
                    }),
                )
                .await?;
            return Ok(table);
        }
        if account.balance()? <= 0 {
            // no funds to pay from the account; fetch unpaid (scan-grade)
            return self.transport.update_price_table(host, addr, None).await;
        }

        account
            .with_withdrawal(|| async {
                // the concrete amount is quoted by the returned table; the
                // wire layer settles the pay-after-receive handshake
                let table = self
                    .transport
                    .update_price_table(
                        host,
                        addr,
                        Some(Payment::ByEphemeralAccount {
                            account: account.id(),
                            amount: Currency::ZERO,
                            expiry_height: WITHDRAWAL_EXPIRY_BLOCKS,
                        }),
                    )
                    .await?;
                Ok((table.update_price_table_cost, table))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{ContractFormation, HostSettings};
    use crate::store::MetadataStore;
    use crate::types::{Currency, FileContractId, Hash256};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct BlockingTransport {
        fetches: AtomicUsize,
        release: Notify,
        block: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl HostTransport for BlockingTransport {
        async fn update_price_table(
            &self,
            _host: PublicKey,
            _addr: &str,
            _payment: Option<Payment>,
        ) -> Result<PriceTable> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.block.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            Ok(PriceTable {
                validity_secs: 600,
                update_price_table_cost: Currency::new(1),
                ..Default::default()
            })
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
        async fn form_contract(
            &self,
            _: PublicKey,
            _: &str,
            _: Currency,
            _: u64,
        ) -> Result<ContractFormation> {
            unimplemented!()
        }
        async fn renew_contract(
            &self,
            _: PublicKey,
            _: &str,
            _: FileContractId,
            _: Currency,
            _: u64,
        ) -> Result<ContractFormation> {
            unimplemented!()
        }
        async fn scan(&self, _: PublicKey, _: &str) -> Result<(HostSettings, PriceTable)> {
            unimplemented!()
        }
    }

    fn cache_with(
        transport: Arc<BlockingTransport>,
    ) -> (tempfile::TempDir, Arc<PriceTableCache>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("meta.db")).unwrap());
        let accounts = Arc::new(AccountManager::new(store, [1u8; 32]));
        (
            dir,
            Arc::new(PriceTableCache::new(transport, accounts)),
        )
    }

    #[tokio::test]
    async fn test_cached_table_is_reused() {
        let transport = Arc::new(BlockingTransport {
            fetches: AtomicUsize::new(0),
            release: Notify::new(),
            block: std::sync::atomic::AtomicBool::new(false),
        });
        let (_dir, cache) = cache_with(Arc::clone(&transport));
        let host = PublicKey::random();

        cache.fetch(host, "h:9982", None).await.unwrap();
        let first = transport.fetches.load(Ordering::SeqCst);
        cache.fetch(host, "h:9982", None).await.unwrap();
        cache.fetch(host, "h:9982", None).await.unwrap();
        assert_eq!(transport.fetches.load(Ordering::SeqCst), first);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_flight() {
        let transport = Arc::new(BlockingTransport {
            fetches: AtomicUsize::new(0),
            release: Notify::new(),
            block: std::sync::atomic::AtomicBool::new(true),
        });
        let (_dir, cache) = cache_with(Arc::clone(&transport));
        let host = PublicKey::random();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache.fetch(host, "h:9982", None).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.block.store(false, Ordering::SeqCst);
        transport.release.notify_waiters();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // only the single-flight fetch hit the transport
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
    }
}
