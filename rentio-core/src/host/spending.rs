//! Buffered recording of contract spending.
//!
//! Transfer workers record spending deltas as they land; a background task
//! flushes the buffer to the store on an interval so hot paths never wait
//! on the database.

use crate::store::{ContractSpendingRecord, MetadataStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct SpendingRecorder {
    store: Arc<MetadataStore>,
    buf: Mutex<Vec<ContractSpendingRecord>>,
}

impl SpendingRecorder {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            store,
            buf: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, record: ContractSpendingRecord) {
        self.buf
            .lock()
            .expect("spending buffer poisoned")
            .push(record);
    }

    /// Apply all buffered records; the store coalesces them by contract.
    pub fn flush(&self) {
        let records: Vec<ContractSpendingRecord> = {
            let mut buf = self.buf.lock().expect("spending buffer poisoned");
            std::mem::take(&mut *buf)
        };
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.store.record_contract_spending(&records) {
            tracing::warn!("failed to flush {} spending records: {}", records.len(), e);
            // put them back for the next flush
            self.buf
                .lock()
                .expect("spending buffer poisoned")
                .extend(records);
        }
    }

    /// Flush periodically until shutdown, then drain once more.
    pub fn run_flusher(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        self.flush();
                        return;
                    }
                    _ = ticker.tick() => self.flush(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ContractSpending;
    use crate::types::{Currency, FileContractId, PublicKey};

    #[tokio::test]
    async fn test_records_flush_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("meta.db")).unwrap());
        let hk = PublicKey::random();
        store
            .record_host_announcement(hk, "s.example.com:9982", 1)
            .unwrap();
        let fcid = FileContractId::random();
        store
            .add_contract(fcid, hk, Currency::new(1000), 1, 100, 244)
            .unwrap();

        let recorder = SpendingRecorder::new(Arc::clone(&store));
        for _ in 0..3 {
            recorder.record(ContractSpendingRecord {
                contract_id: fcid,
                spending: ContractSpending {
                    uploads: Currency::new(5),
                    ..Default::default()
                },
            });
        }
        recorder.flush();
        assert_eq!(
            store.contract(fcid).unwrap().spending.uploads,
            Currency::new(15)
        );

        // an empty buffer flush is a no-op
        recorder.flush();
        assert_eq!(
            store.contract(fcid).unwrap().spending.uploads,
            Currency::new(15)
        );
    }
}
