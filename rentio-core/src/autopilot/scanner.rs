//! Periodic host scanning.
//!
//! Each pass probes the hosts that are due, bounded by a concurrency
//! budget, folds the results into the interaction counters, and removes
//! hosts that have been failing for the full downtime window. A forced
//! scan ignores the cadence but shares the budget.

use crate::error::Result;
use crate::host::HostTransport;
use crate::settings::HostsConfig;
use crate::store::{HostScan, MetadataStore};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

pub struct Scanner {
    store: Arc<MetadataStore>,
    transport: Arc<dyn HostTransport>,
    cfg: Mutex<HostsConfig>,
    scanning: AtomicBool,
    last_start: Mutex<Option<DateTime<Utc>>>,
    finished: Notify,
}

impl Scanner {
    pub fn new(
        store: Arc<MetadataStore>,
        transport: Arc<dyn HostTransport>,
        cfg: HostsConfig,
    ) -> Self {
        Self {
            store,
            transport,
            cfg: Mutex::new(cfg),
            scanning: AtomicBool::new(false),
            last_start: Mutex::new(None),
            finished: Notify::new(),
        }
    }

    pub fn update_hosts_config(&self, cfg: HostsConfig) {
        *self.cfg.lock().expect("scanner config poisoned") = cfg;
    }

    pub fn status(&self) -> (bool, Option<DateTime<Utc>>) {
        (
            self.scanning.load(Ordering::SeqCst),
            *self.last_start.lock().expect("scanner status poisoned"),
        )
    }

    /// Await the end of the scan pass currently running (or the next one).
    pub async fn finished(&self) {
        self.finished.notified().await;
    }

    /// Run one scan pass. A pass already in progress is not doubled up
    /// unless forced.
    pub async fn scan(&self, shutdown: &CancellationToken, force: bool) {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
            && !force
        {
            return;
        }
        *self.last_start.lock().expect("scanner status poisoned") = Some(Utc::now());

        if let Err(e) = self.scan_pass(shutdown, force).await {
            tracing::error!("host scan pass failed: {}", e);
        }

        self.scanning.store(false, Ordering::SeqCst);
        self.finished.notify_waiters();
    }

    async fn scan_pass(&self, shutdown: &CancellationToken, force: bool) -> Result<()> {
        let cfg = self.cfg.lock().expect("scanner config poisoned").clone();
        let cutoff = if force {
            Utc::now()
        } else {
            Utc::now()
                - chrono::Duration::from_std(cfg.scan_interval)
                    .unwrap_or_else(|_| chrono::Duration::hours(1))
        };

        let mut total = 0usize;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let batch = self
                .store
                .hosts_for_scanning(cutoff, cfg.scan_batch_size)?;
            if batch.is_empty() {
                break;
            }
            total += batch.len();

            let budget = Arc::new(Semaphore::new(cfg.scan_batch_size.max(1)));
            let mut probes = Vec::with_capacity(batch.len());
            for (host, addr) in batch {
                let budget = Arc::clone(&budget);
                let transport = Arc::clone(&self.transport);
                let timeout = cfg.scan_timeout;
                probes.push(tokio::spawn(async move {
                    let _permit = budget.acquire_owned().await.expect("budget closed");
                    let result = tokio::time::timeout(timeout, transport.scan(host, &addr)).await;
                    match result {
                        Ok(Ok((settings, price_table))) => HostScan {
                            host,
                            timestamp: Utc::now(),
                            success: true,
                            settings: Some(settings),
                            price_table: Some(price_table),
                        },
                        Ok(Err(e)) => {
                            tracing::debug!("scan of {} failed: {}", host, e);
                            failed_scan(host)
                        }
                        Err(_) => failed_scan(host),
                    }
                }));
            }

            let mut scans = Vec::with_capacity(probes.len());
            for probe in probes {
                if let Ok(scan) = probe.await {
                    scans.push(scan);
                }
            }
            self.store.record_host_scans(&scans)?;
        }

        let removed = self.store.remove_offline_hosts(
            cfg.min_recent_scan_failures,
            Duration::from_secs(cfg.max_downtime_hours * 3600),
        )?;
        if removed > 0 {
            tracing::info!("removed {} hosts past the downtime window", removed);
        }
        tracing::debug!("scan pass probed {} hosts", total);
        Ok(())
    }
}

fn failed_scan(host: crate::types::PublicKey) -> HostScan {
    HostScan {
        host,
        timestamp: Utc::now(),
        success: false,
        settings: None,
        price_table: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{
        ContractFormation, HostSettings, Payment, PriceTable, Revision,
    };
    use crate::types::{Currency, FileContractId, Hash256, PublicKey};
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Hosts in `down` fail their probe.
    struct ScanTransport {
        down: Mutex<HashSet<PublicKey>>,
    }

    #[async_trait]
    impl HostTransport for ScanTransport {
        async fn scan(
            &self,
            host: PublicKey,
            _addr: &str,
        ) -> Result<(HostSettings, PriceTable)> {
            if self.down.lock().unwrap().contains(&host) {
                return Err(crate::error::RentError::Host("connection refused".into()));
            }
            Ok((HostSettings::default(), PriceTable::default()))
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
    }

    #[tokio::test]
    async fn test_scan_updates_interactions_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("meta.db")).unwrap());
        let up = PublicKey::random();
        let down = PublicKey::random();
        store
            .record_host_announcement(up, "up.example.com:9982", 1)
            .unwrap();
        store
            .record_host_announcement(down, "down.example.com:9982", 1)
            .unwrap();

        let transport = Arc::new(ScanTransport {
            down: Mutex::new([down].into_iter().collect()),
        });
        let scanner = Arc::new(Scanner::new(
            Arc::clone(&store),
            transport,
            HostsConfig::default(),
        ));

        let waiter = Arc::clone(&scanner);
        let notified = tokio::spawn(async move { waiter.finished().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        scanner.scan(&CancellationToken::new(), true).await;
        notified.await.unwrap();

        let up_info = store.host(up).unwrap();
        assert!(up_info.interactions.last_scan_success);
        assert!(up_info.scanned());
        let down_info = store.host(down).unwrap();
        assert!(!down_info.interactions.last_scan_success);
        assert_eq!(down_info.interactions.consecutive_failures, 1);
        assert!(!scanner.status().0);
        assert!(scanner.status().1.is_some());
    }

    #[tokio::test]
    async fn test_cadence_skips_recently_scanned_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("meta.db")).unwrap());
        let hk = PublicKey::random();
        store
            .record_host_announcement(hk, "fresh.example.com:9982", 1)
            .unwrap();
        let transport = Arc::new(ScanTransport {
            down: Mutex::new(HashSet::new()),
        });
        let scanner = Scanner::new(Arc::clone(&store), transport, HostsConfig::default());

        scanner.scan(&CancellationToken::new(), true).await;
        let first = store.host(hk).unwrap().interactions.total_scans;
        // an unforced pass right away finds nothing due
        scanner.scan(&CancellationToken::new(), false).await;
        assert_eq!(store.host(hk).unwrap().interactions.total_scans, first);
        // a forced pass probes again
        scanner.scan(&CancellationToken::new(), true).await;
        assert_eq!(store.host(hk).unwrap().interactions.total_scans, first + 1);
    }
}
