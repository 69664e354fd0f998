//! Per-contract priority locks used by transfer workers.
//!
//! Locks are exclusive per contract and carry a TTL so a crashed worker
//! cannot wedge a contract forever. The wait queue is ordered by priority,
//! then arrival.

use crate::error::{RentError, Result};
use crate::types::FileContractId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Priority of slab uploads on the contract lock queue.
pub const CONTRACT_LOCKING_UPLOAD_PRIORITY: u32 = 1;
/// Priority of slab downloads; migrations interleave by using the matching
/// priority for each direction.
pub const CONTRACT_LOCKING_DOWNLOAD_PRIORITY: u32 = 2;

#[async_trait]
pub trait ContractLocker: Send + Sync {
    /// Acquire the exclusive lock on `fcid`. Lower priority values are
    /// served first. Fails with a timeout once `max_wait` elapses.
    async fn acquire_contract(
        &self,
        fcid: FileContractId,
        priority: u32,
        max_wait: Duration,
    ) -> Result<u64>;

    /// Release a held lock. Releasing an expired or reassigned lock is a
    /// no-op.
    async fn release_contract(&self, fcid: FileContractId, lock_id: u64) -> Result<()>;
}

struct Waiter {
    priority: u32,
    seq: u64,
    tx: oneshot::Sender<u64>,
}

#[derive(Default)]
struct LockState {
    holder: Option<(u64, Instant)>,
    queue: Vec<Waiter>,
}

/// Hand the lock to the best waiter, skipping waiters that gave up.
fn grant_next(state: &mut LockState, ttl: Duration, ids: &AtomicU64) {
    loop {
        let Some(best) = state
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| (w.priority, w.seq))
            .map(|(i, _)| i)
        else {
            return;
        };
        let waiter = state.queue.swap_remove(best);
        let lock_id = ids.fetch_add(1, Ordering::SeqCst);
        if waiter.tx.send(lock_id).is_ok() {
            state.holder = Some((lock_id, Instant::now() + ttl));
            return;
        }
    }
}

/// In-process [`ContractLocker`].
pub struct MemContractLocker {
    ttl: Duration,
    next_id: Arc<AtomicU64>,
    next_seq: AtomicU64,
    locks: Arc<Mutex<HashMap<FileContractId, LockState>>>,
}

impl MemContractLocker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            next_id: Arc::new(AtomicU64::new(1)),
            next_seq: AtomicU64::new(1),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reassign the lock once the holder's TTL passes without a release.
    fn spawn_expiry_poke(&self, fcid: FileContractId, expiry: Instant) {
        let locks = Arc::clone(&self.locks);
        let ids = Arc::clone(&self.next_id);
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep_until(expiry).await;
            let mut map = locks.lock().expect("contract locks poisoned");
            if let Some(state) = map.get_mut(&fcid) {
                let expired = state
                    .holder
                    .map(|(_, holder_expiry)| Instant::now() >= holder_expiry)
                    .unwrap_or(false);
                if expired {
                    state.holder = None;
                    grant_next(state, ttl, &ids);
                }
            }
        });
    }
}

#[async_trait]
impl ContractLocker for MemContractLocker {
    async fn acquire_contract(
        &self,
        fcid: FileContractId,
        priority: u32,
        max_wait: Duration,
    ) -> Result<u64> {
        let (seq, rx) = {
            let mut map = self.locks.lock().expect("contract locks poisoned");
            let state = map.entry(fcid).or_default();

            let free = state
                .holder
                .map(|(_, expiry)| Instant::now() >= expiry)
                .unwrap_or(true);
            if free && state.queue.is_empty() {
                let lock_id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let expiry = Instant::now() + self.ttl;
                state.holder = Some((lock_id, expiry));
                self.spawn_expiry_poke(fcid, expiry);
                return Ok(lock_id);
            }

            let (tx, rx) = oneshot::channel();
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            state.queue.push(Waiter { priority, seq, tx });
            if let Some((_, expiry)) = state.holder {
                self.spawn_expiry_poke(fcid, expiry);
            }
            (seq, rx)
        };

        match tokio::time::timeout(max_wait, rx).await {
            Ok(Ok(lock_id)) => {
                self.spawn_expiry_poke(fcid, Instant::now() + self.ttl);
                Ok(lock_id)
            }
            Ok(Err(_)) => Err(RentError::Internal("contract lock dropped".into())),
            Err(_) => {
                // withdraw from the queue; a racing grant skips closed
                // waiters
                let mut map = self.locks.lock().expect("contract locks poisoned");
                if let Some(state) = map.get_mut(&fcid) {
                    state.queue.retain(|w| w.seq != seq);
                }
                Err(RentError::Timeout("contract lock acquire".into()))
            }
        }
    }

    async fn release_contract(&self, fcid: FileContractId, lock_id: u64) -> Result<()> {
        let mut map = self.locks.lock().expect("contract locks poisoned");
        let Some(state) = map.get_mut(&fcid) else {
            return Ok(());
        };
        match state.holder {
            Some((held, _)) if held == lock_id => {
                state.holder = None;
                grant_next(state, self.ttl, &self.next_id);
            }
            // expired or reassigned: release is idempotent
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_acquire_release() {
        let locker = MemContractLocker::new(Duration::from_secs(60));
        let fcid = FileContractId::random();

        let id1 = locker
            .acquire_contract(fcid, 1, Duration::from_secs(1))
            .await
            .unwrap();
        // second acquire times out while the first holds
        let err = locker
            .acquire_contract(fcid, 1, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RentError::Timeout(_)));

        locker.release_contract(fcid, id1).await.unwrap();
        let id2 = locker
            .acquire_contract(fcid, 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert_ne!(id1, id2);
        // double release of a reassigned lock is a no-op
        locker.release_contract(fcid, id1).await.unwrap();
        locker.release_contract(fcid, id2).await.unwrap();
    }

    #[tokio::test]
    async fn test_priority_ordering_on_wait_queue() {
        let locker = Arc::new(MemContractLocker::new(Duration::from_secs(60)));
        let fcid = FileContractId::random();
        let holder = locker
            .acquire_contract(fcid, 1, Duration::from_secs(1))
            .await
            .unwrap();

        // a download waits first, then an upload jumps the queue
        let l1 = Arc::clone(&locker);
        let download = tokio::spawn(async move {
            l1.acquire_contract(fcid, CONTRACT_LOCKING_DOWNLOAD_PRIORITY, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let l2 = Arc::clone(&locker);
        let upload = tokio::spawn(async move {
            l2.acquire_contract(fcid, CONTRACT_LOCKING_UPLOAD_PRIORITY, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        locker.release_contract(fcid, holder).await.unwrap();
        // upload is served before the earlier download
        let upload_id = upload.await.unwrap().unwrap();
        assert!(!download.is_finished());
        locker.release_contract(fcid, upload_id).await.unwrap();
        let download_id = download.await.unwrap().unwrap();
        locker.release_contract(fcid, download_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_is_reassigned() {
        let locker = Arc::new(MemContractLocker::new(Duration::from_millis(100)));
        let fcid = FileContractId::random();
        let stale = locker
            .acquire_contract(fcid, 1, Duration::from_secs(1))
            .await
            .unwrap();

        // the holder never releases; the waiter gets the lock at expiry
        let waited = locker
            .acquire_contract(fcid, 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(stale, waited);
        // releasing the expired id is idempotent
        locker.release_contract(fcid, stale).await.unwrap();
    }
}
