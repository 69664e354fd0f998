//! Host-facing ports and per-host state.
//!
//! The wire-level RPC codec (framing, session encryption, signatures) lives
//! behind [`HostTransport`]; the transfer engine only ever sees
//! [`SectorStore`]. New host protocol revisions are added by providing
//! another implementation of these ports.

pub mod accounts;
pub mod gouging;
pub mod pricetable;
pub mod spending;

use crate::error::{RentError, Result};
use crate::object::merkle;
use crate::store::{ContractSpending, ContractSpendingRecord};
use crate::types::{Currency, FileContractId, Hash256, PublicKey, LEAF_SIZE, SECTOR_SIZE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use accounts::{Account, AccountManager};
pub use gouging::{GougingBreakdown, GougingChecker};
pub use pricetable::PriceTableCache;
pub use spending::SpendingRecorder;

/// Blocks added to the current height when signing withdrawal messages.
pub const WITHDRAWAL_EXPIRY_BLOCKS: u64 = 6;

/// A host's advertised settings, cached from its last successful scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSettings {
    pub accepting_contracts: bool,
    pub max_collateral: Currency,
    pub remaining_storage: u64,
    pub total_storage: u64,
    pub version: String,
}

/// A host's time-bounded schedule of per-operation costs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceTable {
    /// Seconds the table stays valid after issuance.
    pub validity_secs: u64,
    /// Block height as reported by the host.
    pub host_block_height: u64,
    pub update_price_table_cost: Currency,
    pub account_balance_cost: Currency,
    pub fund_account_cost: Currency,
    pub latest_revision_cost: Currency,
    pub init_base_cost: Currency,
    pub read_base_cost: Currency,
    pub write_base_cost: Currency,
    pub upload_bandwidth_cost: Currency,
    pub download_bandwidth_cost: Currency,
    pub sector_access_cost: Currency,
    pub storage_cost: Currency,
    pub contract_price: Currency,
    pub max_collateral: Currency,
}

impl PriceTable {
    /// Overestimate for reading one full sector, padded ~10% the way hosts
    /// expect.
    pub fn read_sector_cost(&self) -> Result<Currency> {
        let bandwidth = self
            .download_bandwidth_cost
            .checked_mul((SECTOR_SIZE + 4096) as u64)
            .ok_or_else(|| overflow("read sector bandwidth"))?;
        let cost = self
            .init_base_cost
            .checked_add(self.read_base_cost)
            .and_then(|c| c.checked_add(bandwidth))
            .ok_or_else(|| overflow("read sector cost"))?;
        Ok(cost
            .checked_mul(10)
            .ok_or_else(|| overflow("read sector leeway"))?
            .div(9))
    }

    /// Overestimate for appending one full sector.
    pub fn append_sector_cost(&self) -> Result<Currency> {
        let bandwidth = self
            .upload_bandwidth_cost
            .checked_mul(SECTOR_SIZE as u64)
            .ok_or_else(|| overflow("append sector bandwidth"))?;
        let cost = self
            .init_base_cost
            .checked_add(self.write_base_cost)
            .and_then(|c| c.checked_add(bandwidth))
            .ok_or_else(|| overflow("append sector cost"))?;
        Ok(cost
            .checked_mul(10)
            .ok_or_else(|| overflow("append sector leeway"))?
            .div(9))
    }

    pub fn delete_sectors_cost(&self, count: usize) -> Result<Currency> {
        let access = self
            .sector_access_cost
            .checked_mul(count as u64)
            .ok_or_else(|| overflow("delete sectors access"))?;
        self.init_base_cost
            .checked_add(access)
            .ok_or_else(|| overflow("delete sectors cost"))
    }
}

fn overflow(what: &str) -> RentError {
    RentError::Internal(format!("overflow while calculating {what}"))
}

/// How an RPC is paid for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Payment {
    ByContract {
        contract_id: FileContractId,
        amount: Currency,
    },
    ByEphemeralAccount {
        account: PublicKey,
        amount: Currency,
        expiry_height: u64,
    },
}

/// A contract revision as reported by a host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Revision {
    pub contract_id: FileContractId,
    pub revision_number: u64,
    pub renter_funds: Currency,
}

/// Result of forming or renewing a contract with a host.
#[derive(Debug, Clone, Copy)]
pub struct ContractFormation {
    pub contract_id: FileContractId,
    pub total_cost: Currency,
    pub window_start: u64,
    pub window_end: u64,
}

/// The host RPC surface the core consumes. Implementations wrap a framed,
/// session-encrypted stream; mocks back the test suite.
#[async_trait]
pub trait HostTransport: Send + Sync {
    async fn update_price_table(
        &self,
        host: PublicKey,
        addr: &str,
        payment: Option<Payment>,
    ) -> Result<PriceTable>;

    async fn account_balance(
        &self,
        host: PublicKey,
        addr: &str,
        account: PublicKey,
        payment: Payment,
    ) -> Result<Currency>;

    async fn fund_account(
        &self,
        host: PublicKey,
        addr: &str,
        account: PublicKey,
        amount: Currency,
        payment: Payment,
    ) -> Result<()>;

    async fn latest_revision(&self, host: PublicKey, addr: &str, contract_id: FileContractId)
        -> Result<Revision>;

    /// Execute a ReadSector program; returns the data and its merkle range
    /// proof.
    async fn read_sector(
        &self,
        host: PublicKey,
        addr: &str,
        root: Hash256,
        offset: u32,
        length: u32,
        payment: Payment,
    ) -> Result<(Vec<u8>, Vec<Hash256>)>;

    /// Append one sector under the given contract; returns the root the
    /// host computed.
    async fn append_sector(
        &self,
        host: PublicKey,
        addr: &str,
        contract_id: FileContractId,
        sector: &[u8],
        payment: Payment,
    ) -> Result<Hash256>;

    async fn delete_sectors(
        &self,
        host: PublicKey,
        addr: &str,
        contract_id: FileContractId,
        roots: &[Hash256],
        payment: Payment,
    ) -> Result<()>;

    async fn form_contract(
        &self,
        host: PublicKey,
        addr: &str,
        renter_funds: Currency,
        end_height: u64,
    ) -> Result<ContractFormation>;

    async fn renew_contract(
        &self,
        host: PublicKey,
        addr: &str,
        contract_id: FileContractId,
        renter_funds: Currency,
        end_height: u64,
    ) -> Result<ContractFormation>;

    /// Probe a host: fetch settings and an unpaid price table.
    async fn scan(&self, host: PublicKey, addr: &str) -> Result<(HostSettings, PriceTable)>;
}

/// Stores contract data on one host over one funded contract.
#[async_trait]
pub trait SectorStore: Send + Sync {
    fn contract(&self) -> FileContractId;
    fn host_key(&self) -> PublicKey;

    /// Upload one sector; returns its merkle root.
    async fn upload_sector(&self, sector: &[u8]) -> Result<Hash256>;

    /// Download `length` bytes at `offset` from the sector with the given
    /// root, verifying the returned range proof.
    async fn download_sector(&self, root: Hash256, offset: u32, length: u32) -> Result<Vec<u8>>;

    /// Best-effort deletion; an empty slice is a no-op.
    async fn delete_sectors(&self, roots: &[Hash256]) -> Result<()>;
}

/// Mints a [`SectorStore`] for one (host, contract) pair. The autopilot's
/// migrator and pruner assemble their host pools through this port; tests
/// substitute in-memory stores.
pub trait SectorStoreFactory: Send + Sync {
    fn sector_store(
        &self,
        host: PublicKey,
        addr: &str,
        contract: FileContractId,
        gouging: &GougingChecker,
    ) -> Arc<dyn SectorStore>;
}

/// [`SectorStoreFactory`] producing [`RemoteHost`]s.
pub struct RemoteHostFactory {
    pub transport: Arc<dyn HostTransport>,
    pub accounts: Arc<AccountManager>,
    pub price_tables: Arc<PriceTableCache>,
    pub spending: Arc<SpendingRecorder>,
}

impl SectorStoreFactory for RemoteHostFactory {
    fn sector_store(
        &self,
        host: PublicKey,
        addr: &str,
        contract: FileContractId,
        gouging: &GougingChecker,
    ) -> Arc<dyn SectorStore> {
        Arc::new(RemoteHost::new(
            host,
            addr.to_string(),
            contract,
            Arc::clone(&self.transport),
            Arc::clone(&self.accounts),
            Arc::clone(&self.price_tables),
            gouging.clone(),
            Arc::clone(&self.spending),
        ))
    }
}

/// The production [`SectorStore`]: pays through ephemeral accounts, checks
/// gouging, verifies proofs, and records contract spending.
pub struct RemoteHost {
    host: PublicKey,
    addr: String,
    contract_id: FileContractId,
    transport: Arc<dyn HostTransport>,
    accounts: Arc<AccountManager>,
    price_tables: Arc<PriceTableCache>,
    gouging: GougingChecker,
    spending: Arc<SpendingRecorder>,
}

impl RemoteHost {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: PublicKey,
        addr: String,
        contract_id: FileContractId,
        transport: Arc<dyn HostTransport>,
        accounts: Arc<AccountManager>,
        price_tables: Arc<PriceTableCache>,
        gouging: GougingChecker,
        spending: Arc<SpendingRecorder>,
    ) -> Self {
        Self {
            host,
            addr,
            contract_id,
            transport,
            accounts,
            price_tables,
            gouging,
            spending,
        }
    }

    async fn checked_price_table(&self) -> Result<PriceTable> {
        let pt = self
            .price_tables
            .fetch(self.host, &self.addr, None)
            .await?;
        let breakdown = self.gouging.check_price_table(&pt);
        if breakdown.is_gouging() {
            return Err(RentError::Unusable(crate::error::UnusableReason::Gouging));
        }
        Ok(pt)
    }

    fn record_spending(&self, spending: ContractSpending) {
        self.spending.record(ContractSpendingRecord {
            contract_id: self.contract_id,
            spending,
        });
    }
}

#[async_trait]
impl SectorStore for RemoteHost {
    fn contract(&self) -> FileContractId {
        self.contract_id
    }

    fn host_key(&self) -> PublicKey {
        self.host
    }

    async fn upload_sector(&self, sector: &[u8]) -> Result<Hash256> {
        if sector.len() != SECTOR_SIZE {
            return Err(RentError::InvalidRequest(format!(
                "sector must be {SECTOR_SIZE} bytes, got {}",
                sector.len()
            )));
        }
        let pt = self.checked_price_table().await?;
        let cost = pt.append_sector_cost()?;
        let expected_root = merkle::sector_root(sector);

        let account = self.accounts.for_host(self.host)?;
        let payment = Payment::ByEphemeralAccount {
            account: account.id(),
            amount: cost,
            expiry_height: pt.host_block_height + WITHDRAWAL_EXPIRY_BLOCKS,
        };
        let root = account
            .with_withdrawal(|| async {
                let root = self
                    .transport
                    .append_sector(self.host, &self.addr, self.contract_id, sector, payment)
                    .await?;
                Ok((cost, root))
            })
            .await?;

        if root != expected_root {
            return Err(RentError::Integrity(format!(
                "host returned sector root {root}, expected {expected_root}"
            )));
        }
        self.record_spending(ContractSpending {
            uploads: cost,
            ..Default::default()
        });
        Ok(root)
    }

    async fn download_sector(&self, root: Hash256, offset: u32, length: u32) -> Result<Vec<u8>> {
        if offset as usize % LEAF_SIZE != 0 || length as usize % LEAF_SIZE != 0 {
            return Err(RentError::InvalidRequest(
                "sector range must be leaf-aligned".into(),
            ));
        }
        if (offset + length) as usize > SECTOR_SIZE || length == 0 {
            return Err(RentError::InvalidRequest("invalid sector range".into()));
        }
        let pt = self.checked_price_table().await?;
        let cost = pt.read_sector_cost()?;

        let account = self.accounts.for_host(self.host)?;
        let payment = Payment::ByEphemeralAccount {
            account: account.id(),
            amount: cost,
            expiry_height: pt.host_block_height + WITHDRAWAL_EXPIRY_BLOCKS,
        };
        let data = account
            .with_withdrawal(|| async {
                let (data, proof) = self
                    .transport
                    .read_sector(self.host, &self.addr, root, offset, length, payment)
                    .await?;
                let proof_start = offset as usize / LEAF_SIZE;
                let proof_end = (offset + length) as usize / LEAF_SIZE;
                if !merkle::verify_range_proof(&data, &proof, proof_start, proof_end, &root) {
                    return Err(RentError::Integrity(format!(
                        "merkle range proof verification failed for sector {root}"
                    )));
                }
                Ok((cost, data))
            })
            .await?;

        self.record_spending(ContractSpending {
            downloads: cost,
            ..Default::default()
        });
        Ok(data)
    }

    async fn delete_sectors(&self, roots: &[Hash256]) -> Result<()> {
        if roots.is_empty() {
            return Ok(());
        }
        let pt = self.checked_price_table().await?;
        let cost = pt.delete_sectors_cost(roots.len())?;
        let payment = Payment::ByContract {
            contract_id: self.contract_id,
            amount: cost,
        };
        self.transport
            .delete_sectors(self.host, &self.addr, self.contract_id, roots, payment)
            .await?;
        self.record_spending(ContractSpending {
            deletions: cost,
            ..Default::default()
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MetadataStore;
    use rand::RngCore;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves sectors it has accepted, with real merkle range proofs. Can
    /// corrupt proofs and report empty-account failures.
    struct FakeHostTransport {
        sectors: Mutex<HashMap<Hash256, Vec<u8>>>,
        corrupt_proofs: bool,
        refuse_withdrawals: bool,
        price_table: PriceTable,
    }

    impl FakeHostTransport {
        fn new() -> Self {
            Self {
                sectors: Mutex::new(HashMap::new()),
                corrupt_proofs: false,
                refuse_withdrawals: false,
                price_table: PriceTable {
                    validity_secs: 600,
                    host_block_height: 100,
                    update_price_table_cost: Currency::new(1),
                    init_base_cost: Currency::new(1),
                    read_base_cost: Currency::new(1),
                    write_base_cost: Currency::new(1),
                    sector_access_cost: Currency::new(1),
                    max_collateral: Currency::new(u128::MAX / 4),
                    ..Default::default()
                },
            }
        }
    }

    #[async_trait]
    impl HostTransport for FakeHostTransport {
        async fn update_price_table(
            &self,
            _: PublicKey,
            _: &str,
            _: Option<Payment>,
        ) -> Result<PriceTable> {
            Ok(self.price_table.clone())
        }

        async fn append_sector(
            &self,
            _: PublicKey,
            _: &str,
            _: FileContractId,
            sector: &[u8],
            _: Payment,
        ) -> Result<Hash256> {
            if self.refuse_withdrawals {
                return Err(RentError::BalanceInsufficient);
            }
            let root = merkle::sector_root(sector);
            self.sectors.lock().unwrap().insert(root, sector.to_vec());
            Ok(root)
        }

        async fn read_sector(
            &self,
            _: PublicKey,
            _: &str,
            root: Hash256,
            offset: u32,
            length: u32,
            _: Payment,
        ) -> Result<(Vec<u8>, Vec<Hash256>)> {
            let sectors = self.sectors.lock().unwrap();
            let Some(sector) = sectors.get(&root) else {
                return Err(RentError::NotFound(format!("sector {root}")));
            };
            let start = offset as usize / crate::types::LEAF_SIZE;
            let end = (offset + length) as usize / crate::types::LEAF_SIZE;
            let data = sector[offset as usize..(offset + length) as usize].to_vec();
            let mut proof = merkle::build_range_proof(sector, start, end);
            if self.corrupt_proofs {
                proof[0] = Hash256::random();
            }
            Ok((data, proof))
        }

        async fn delete_sectors(
            &self,
            _: PublicKey,
            _: &str,
            _: FileContractId,
            roots: &[Hash256],
            _: Payment,
        ) -> Result<()> {
            let mut sectors = self.sectors.lock().unwrap();
            for root in roots {
                sectors.remove(root);
            }
            Ok(())
        }

        async fn account_balance(
            &self,
            _: PublicKey,
            _: &str,
            _: PublicKey,
            _: Payment,
        ) -> Result<Currency> {
            Ok(Currency::new(42))
        }
        async fn fund_account(
            &self,
            _: PublicKey,
            _: &str,
            _: PublicKey,
            _: Currency,
            _: Payment,
        ) -> Result<()> {
            Ok(())
        }
        async fn latest_revision(
            &self,
            _: PublicKey,
            _: &str,
            contract_id: FileContractId,
        ) -> Result<Revision> {
            Ok(Revision {
                contract_id,
                revision_number: 1,
                renter_funds: Currency::new(1),
            })
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

    fn remote_host(
        transport: Arc<FakeHostTransport>,
        funded: bool,
    ) -> (tempfile::TempDir, RemoteHost, Arc<MetadataStore>, PublicKey) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::open(dir.path().join("meta.db")).unwrap());
        let accounts = Arc::new(AccountManager::new(Arc::clone(&store), [3u8; 32]));
        let price_tables = Arc::new(PriceTableCache::new(
            Arc::clone(&transport) as Arc<dyn HostTransport>,
            Arc::clone(&accounts),
        ));
        let spending = Arc::new(SpendingRecorder::new(Arc::clone(&store)));
        let hk = PublicKey::random();
        if funded {
            let account = accounts.for_host(hk).unwrap();
            store
                .set_account_balance(account.id(), 1_000_000_000_000)
                .unwrap();
        }
        let host = RemoteHost::new(
            hk,
            "fake.example.com:9982".into(),
            FileContractId::random(),
            transport,
            accounts,
            price_tables,
            GougingChecker::new(crate::settings::GougingSettings::default(), 100),
            spending,
        );
        (dir, host, store, hk)
    }

    fn random_sector() -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        rand::thread_rng().fill_bytes(&mut sector);
        sector
    }

    #[tokio::test]
    async fn test_upload_download_with_proof() {
        let transport = Arc::new(FakeHostTransport::new());
        let (_dir, host, _store, _hk) = remote_host(Arc::clone(&transport), true);

        let sector = random_sector();
        let root = host.upload_sector(&sector).await.unwrap();
        assert_eq!(root, merkle::sector_root(&sector));

        let data = host.download_sector(root, 0, 4096).await.unwrap();
        assert_eq!(data, &sector[..4096]);
    }

    #[tokio::test]
    async fn test_download_rejects_bad_proof() {
        let mut inner = FakeHostTransport::new();
        inner.corrupt_proofs = true;
        let transport = Arc::new(inner);
        let (_dir, host, _store, _hk) = remote_host(Arc::clone(&transport), true);

        let sector = random_sector();
        let root = merkle::sector_root(&sector);
        transport
            .sectors
            .lock()
            .unwrap()
            .insert(root, sector.clone());

        let err = host.download_sector(root, 64, 4096).await.unwrap_err();
        assert!(matches!(err, RentError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_gouging_host_is_refused() {
        let mut inner = FakeHostTransport::new();
        inner.price_table.max_collateral = Currency::ZERO;
        let transport = Arc::new(inner);
        let (_dir, host, _store, _hk) = remote_host(transport, true);

        let err = host.upload_sector(&random_sector()).await.unwrap_err();
        assert!(matches!(
            err,
            RentError::Unusable(crate::error::UnusableReason::Gouging)
        ));
    }

    #[tokio::test]
    async fn test_host_refusal_flags_account_for_sync() {
        let mut inner = FakeHostTransport::new();
        inner.refuse_withdrawals = true;
        let transport = Arc::new(inner);
        let (_dir, host, store, hk) = remote_host(transport, true);

        let err = host.upload_sector(&random_sector()).await.unwrap_err();
        assert!(matches!(err, RentError::BalanceInsufficient));
        let flagged = store
            .accounts()
            .unwrap()
            .into_iter()
            .find(|a| a.host_key == hk)
            .unwrap();
        assert!(flagged.requires_sync);
    }

    #[tokio::test]
    async fn test_empty_delete_is_noop() {
        let transport = Arc::new(FakeHostTransport::new());
        let (_dir, host, store, _hk) = remote_host(transport, false);
        host.delete_sectors(&[]).await.unwrap();
        // no account was even needed
        assert!(store.accounts().unwrap().is_empty());
    }
}
