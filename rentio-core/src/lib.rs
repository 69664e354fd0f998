//! Rentio Core - storage-renter core for decentralized cloud storage
//!
//! Rents space from independent, untrusted hosts on a blockchain-backed
//! market:
//! - erasure-coded, encrypted slab object model over 4 MiB sectors
//! - SQLite metadata store tying objects to slabs, sectors, contracts,
//!   and hosts
//! - parallel transfer engine with overdrive on slow hosts
//! - autopilot loop for scanning, contracting, migration, and pruning

pub mod autopilot;
pub mod chain;
pub mod error;
pub mod host;
pub mod object;
pub mod operations;
pub mod settings;
pub mod store;
pub mod transfer;
pub mod types;

pub use autopilot::{
    Autopilot, AutopilotState, Contractor, MaintenanceState, Migrator, Pruner, Scanner,
    AUTOPILOT_CONTRACT_SET,
};
pub use chain::{ChainClient, ConsensusState, Transaction, WalletInfo};
pub use error::{HostError, HostErrorSet, RentError, Result, UnusableReason};
pub use host::{
    Account, AccountManager, ContractFormation, GougingBreakdown, GougingChecker, HostSettings,
    HostTransport, Payment, PriceTable, PriceTableCache, RemoteHost, RemoteHostFactory, Revision,
    SectorStore, SectorStoreFactory, SpendingRecorder,
};
pub use object::{EncryptionKey, Object, Sector, Slab, SlabSlice};
pub use operations::{
    DownloadObjectOperation, DownloadObjectOperationRequest, DownloadObjectOperationResult,
    UploadObjectOperation, UploadObjectOperationRequest, UploadObjectOperationResult,
};
pub use settings::{
    AutopilotConfig, ContractsConfig, GougingSettings, HostsConfig, RedundancySettings,
};
pub use store::{
    ArchivedContract, CompletedPart, ContractMetadata, ContractSpending, ContractSpendingRecord,
    HostInfo, HostInteractions, HostScan, MetadataStore, MultipartPart, MultipartUpload,
    ObjectEntry, ObjectMetadata, ObjectsStats, PackedSlab, PersistedAccount, PriceTableUpdate,
    SlabHealth,
};
pub use transfer::{
    delete_slabs, download_slab, migrate_slab, parallel_download_slab, parallel_upload_slab,
    slabs_for_download, ContractLocker, MemContractLocker,
};
pub use types::{hash_bytes, Currency, FileContractId, Hash256, PublicKey, SECTOR_SIZE};
