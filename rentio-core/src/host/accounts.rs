//! Ephemeral account management.
//!
//! Each (worker, host) pair owns one prepaid account held by the host. The
//! host-side balance is authoritative; the local balance is an optimistic
//! projection the autopilot refills and reconciles via explicit sync.

use crate::error::{RentError, Result};
use crate::store::MetadataStore;
use crate::types::{Currency, PublicKey};
use ed25519_dalek::SigningKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long an account lock may be waited for before the caller times out.
pub const ACCOUNT_LOCKING_DURATION: Duration = Duration::from_secs(30);

pub struct AccountManager {
    store: Arc<MetadataStore>,
    /// Sub-seed all account keys are derived from.
    key: [u8; 32],
    locks: Mutex<HashMap<PublicKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountManager {
    pub fn new(store: Arc<MetadataStore>, worker_seed: [u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(worker_seed);
        hasher.update(b"accountkey");
        Self {
            store,
            key: hasher.finalize().into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The account used for a given host, created on first use.
    pub fn for_host(self: &Arc<Self>, host: PublicKey) -> Result<Account> {
        if host.is_zero() {
            return Err(RentError::InvalidRequest("empty host key provided".into()));
        }
        let id = PublicKey(self.derive_account_key(host).verifying_key().to_bytes());
        self.store.ensure_account(id, host)?;
        Ok(Account {
            manager: Arc::clone(self),
            id,
            host,
        })
    }

    /// Derive the account keypair for a host:
    /// `key = ed25519(SHA256(subkey || host || index))`, index 0.
    pub fn derive_account_key(&self, host: PublicKey) -> SigningKey {
        let index = 0u8;
        let mut hasher = Sha256::new();
        hasher.update(self.key);
        hasher.update(host.as_bytes());
        hasher.update([index]);
        let seed: [u8; 32] = hasher.finalize().into();
        SigningKey::from_bytes(&seed)
    }

    fn lock_for(&self, id: PublicKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("account lock registry poisoned");
        Arc::clone(locks.entry(id).or_default())
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }
}

pub struct Account {
    manager: Arc<AccountManager>,
    id: PublicKey,
    host: PublicKey,
}

impl Account {
    pub fn id(&self) -> PublicKey {
        self.id
    }

    pub fn host(&self) -> PublicKey {
        self.host
    }

    async fn acquire(&self) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        let lock = self.manager.lock_for(self.id);
        tokio::time::timeout(ACCOUNT_LOCKING_DURATION, lock.lock_owned())
            .await
            .map_err(|_| RentError::Timeout("account lock acquire".into()))
    }

    pub fn balance(&self) -> Result<i128> {
        self.manager.store.account_balance(self.id)
    }

    /// Run `amt_fn` under the account lock and add its returned amount to
    /// the balance. An error leaves the balance untouched.
    pub async fn with_deposit<F, Fut>(&self, amt_fn: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Currency>>,
    {
        let _guard = self.acquire().await?;
        let amount = amt_fn().await?;
        if !amount.is_zero() {
            self.manager.store.add_account_balance(self.id, amount.0 as i128)?;
        }
        Ok(())
    }

    /// Run `amt_fn` under the account lock and subtract the amount it spent.
    /// Short-circuits when the local balance is already depleted; a
    /// balance-insufficient failure from the host flags the account for
    /// sync before propagating.
    pub async fn with_withdrawal<F, Fut, T>(&self, amt_fn: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(Currency, T)>>,
    {
        let _guard = self.acquire().await?;
        if self.manager.store.account_balance(self.id)? <= 0 {
            return Err(RentError::BalanceInsufficient);
        }
        match amt_fn().await {
            Ok((amount, value)) => {
                self.manager
                    .store
                    .add_account_balance(self.id, -(amount.0 as i128))?;
                Ok(value)
            }
            Err(RentError::BalanceInsufficient) => {
                if let Err(e) = self.manager.store.set_account_requires_sync(self.id, true) {
                    tracing::warn!("failed to schedule account sync for {}: {}", self.id, e);
                }
                Err(RentError::BalanceInsufficient)
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the local balance with the host-reported one and clear the
    /// requires-sync flag. Holds the lock exclusively for the duration.
    pub async fn with_sync<F, Fut>(&self, balance_fn: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Currency>>,
    {
        let _guard = self.acquire().await?;
        let balance = balance_fn().await?;
        self.manager
            .store
            .set_account_balance(self.id, balance.0 as i128)?;
        self.manager.store.set_account_requires_sync(self.id, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, Arc<AccountManager>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("meta.db")).unwrap());
        (dir, Arc::new(AccountManager::new(store, [7u8; 32])))
    }

    #[test]
    fn test_account_key_derivation_is_deterministic() {
        let (_dir, mgr) = manager();
        let host = PublicKey::random();
        let a = mgr.for_host(host).unwrap();
        let b = mgr.for_host(host).unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), mgr.for_host(PublicKey::random()).unwrap().id());
    }

    #[tokio::test]
    async fn test_deposit_then_withdraw_is_balance_neutral() {
        let (_dir, mgr) = manager();
        let account = mgr.for_host(PublicKey::random()).unwrap();

        account
            .with_deposit(|| async { Ok(Currency::new(1000)) })
            .await
            .unwrap();
        assert_eq!(account.balance().unwrap(), 1000);

        account
            .with_withdrawal(|| async { Ok((Currency::new(1000), ())) })
            .await
            .unwrap();
        assert_eq!(account.balance().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_withdrawal_short_circuits_on_empty_balance() {
        let (_dir, mgr) = manager();
        let account = mgr.for_host(PublicKey::random()).unwrap();
        let err = account
            .with_withdrawal(|| async {
                panic!("amount fn must not run with zero balance");
                #[allow(unreachable_code)]
                Ok((Currency::ZERO, ()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RentError::BalanceInsufficient));
    }

    #[tokio::test]
    async fn test_host_balance_insufficient_schedules_sync() {
        let (_dir, mgr) = manager();
        let host = PublicKey::random();
        let account = mgr.for_host(host).unwrap();
        account
            .with_deposit(|| async { Ok(Currency::new(10)) })
            .await
            .unwrap();

        let err = account
            .with_withdrawal::<_, _, ()>(|| async { Err(RentError::BalanceInsufficient) })
            .await
            .unwrap_err();
        assert!(matches!(err, RentError::BalanceInsufficient));

        let persisted = mgr.store().accounts().unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(persisted[0].requires_sync);
        // the failed withdrawal did not mutate the balance
        assert_eq!(account.balance().unwrap(), 10);

        // the next maintenance cycle syncs to the host-reported value
        account
            .with_sync(|| async { Ok(Currency::new(3)) })
            .await
            .unwrap();
        assert_eq!(account.balance().unwrap(), 3);
        assert!(!mgr.store().accounts().unwrap()[0].requires_sync);
    }

    #[tokio::test]
    async fn test_failed_deposit_leaves_balance_unchanged() {
        let (_dir, mgr) = manager();
        let account = mgr.for_host(PublicKey::random()).unwrap();
        let _ = account
            .with_deposit(|| async { Err(RentError::Host("connection reset".into())) })
            .await;
        assert_eq!(account.balance().unwrap(), 0);
    }
}
