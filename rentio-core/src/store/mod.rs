//! The persistent metadata store.
//!
//! A single SQLite database holds the full relational model: buckets,
//! objects, slices, slabs, shards, sectors, contracts and their archive,
//! contract sets, hosts, allow/blocklists, ephemeral accounts, multipart
//! uploads, and partial slab buffers. Referential integrity is enforced via
//! cascading deletes from object down to the sector join tables; sector rows
//! themselves are only removed by the pruner.

pub mod accounts;
pub mod contracts;
pub mod hosts;
pub mod multipart;
pub mod objects;

use crate::error::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};

pub use accounts::PersistedAccount;
pub use contracts::{ArchivedContract, ContractMetadata, ContractSpending, ContractSpendingRecord};
pub use hosts::{HostInfo, HostInteractions, HostScan, PriceTableUpdate};
pub use multipart::{CompletedPart, MultipartPart, MultipartUpload};
pub use objects::{ObjectEntry, ObjectMetadata, ObjectsStats, PackedSlab, SlabHealth};

pub struct MetadataStore {
    db_path: PathBuf,
}

impl MetadataStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            db_path: db_path.as_ref().to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS buckets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                policy TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS objects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bucket_id INTEGER NOT NULL REFERENCES buckets(id),
                path TEXT NOT NULL,
                key TEXT NOT NULL,
                size INTEGER NOT NULL,
                etag TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (bucket_id, path)
            );
            CREATE INDEX IF NOT EXISTS idx_objects_path ON objects(bucket_id, path);

            CREATE TABLE IF NOT EXISTS slabs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                min_shards INTEGER NOT NULL,
                total_shards INTEGER NOT NULL,
                buffered INTEGER NOT NULL DEFAULT 0,
                health REAL NOT NULL DEFAULT 1.0
            );

            CREATE TABLE IF NOT EXISTS sectors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                root BLOB NOT NULL UNIQUE,
                latest_host BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS shards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slab_id INTEGER NOT NULL REFERENCES slabs(id) ON DELETE CASCADE,
                slab_index INTEGER NOT NULL,
                sector_id INTEGER NOT NULL REFERENCES sectors(id),
                UNIQUE (slab_id, slab_index)
            );
            CREATE INDEX IF NOT EXISTS idx_shards_sector ON shards(sector_id);

            CREATE TABLE IF NOT EXISTS hosts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                public_key BLOB NOT NULL UNIQUE,
                net_address TEXT NOT NULL,
                announced_height INTEGER NOT NULL DEFAULT 0,
                known_since TEXT NOT NULL,
                last_scan INTEGER NOT NULL DEFAULT 0,
                last_scan_success INTEGER NOT NULL DEFAULT 0,
                second_to_last_scan_success INTEGER NOT NULL DEFAULT 0,
                uptime_ms INTEGER NOT NULL DEFAULT 0,
                downtime_ms INTEGER NOT NULL DEFAULT 0,
                total_scans INTEGER NOT NULL DEFAULT 0,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                successful_interactions REAL NOT NULL DEFAULT 0,
                failed_interactions REAL NOT NULL DEFAULT 0,
                settings TEXT,
                price_table TEXT,
                price_table_expiry INTEGER
            );

            CREATE TABLE IF NOT EXISTS contracts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fcid BLOB NOT NULL UNIQUE,
                host_id INTEGER NOT NULL REFERENCES hosts(id),
                renewed_from BLOB,
                total_cost TEXT NOT NULL DEFAULT '0',
                proof_height INTEGER NOT NULL DEFAULT 0,
                revision_height INTEGER NOT NULL DEFAULT 0,
                revision_number TEXT NOT NULL DEFAULT '0',
                start_height INTEGER NOT NULL,
                window_start INTEGER NOT NULL DEFAULT 0,
                window_end INTEGER NOT NULL DEFAULT 0,
                upload_spending TEXT NOT NULL DEFAULT '0',
                download_spending TEXT NOT NULL DEFAULT '0',
                fund_account_spending TEXT NOT NULL DEFAULT '0',
                delete_spending TEXT NOT NULL DEFAULT '0',
                sector_roots_spending TEXT NOT NULL DEFAULT '0'
            );

            CREATE TABLE IF NOT EXISTS archived_contracts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fcid BLOB NOT NULL UNIQUE,
                host_key BLOB NOT NULL,
                renewed_from BLOB,
                renewed_to BLOB,
                reason TEXT NOT NULL,
                total_cost TEXT NOT NULL DEFAULT '0',
                proof_height INTEGER NOT NULL DEFAULT 0,
                revision_height INTEGER NOT NULL DEFAULT 0,
                revision_number TEXT NOT NULL DEFAULT '0',
                start_height INTEGER NOT NULL,
                window_start INTEGER NOT NULL DEFAULT 0,
                window_end INTEGER NOT NULL DEFAULT 0,
                upload_spending TEXT NOT NULL DEFAULT '0',
                download_spending TEXT NOT NULL DEFAULT '0',
                fund_account_spending TEXT NOT NULL DEFAULT '0',
                delete_spending TEXT NOT NULL DEFAULT '0',
                sector_roots_spending TEXT NOT NULL DEFAULT '0'
            );

            CREATE TABLE IF NOT EXISTS contract_sets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS contract_set_contracts (
                set_id INTEGER NOT NULL REFERENCES contract_sets(id) ON DELETE CASCADE,
                contract_id INTEGER NOT NULL REFERENCES contracts(id) ON DELETE CASCADE,
                PRIMARY KEY (set_id, contract_id)
            );

            CREATE TABLE IF NOT EXISTS contract_sectors (
                contract_id INTEGER NOT NULL REFERENCES contracts(id) ON DELETE CASCADE,
                sector_id INTEGER NOT NULL REFERENCES sectors(id) ON DELETE CASCADE,
                PRIMARY KEY (contract_id, sector_id)
            );

            CREATE TABLE IF NOT EXISTS host_sectors (
                host_id INTEGER NOT NULL REFERENCES hosts(id) ON DELETE CASCADE,
                sector_id INTEGER NOT NULL REFERENCES sectors(id) ON DELETE CASCADE,
                PRIMARY KEY (host_id, sector_id)
            );

            CREATE TABLE IF NOT EXISTS allowlist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry BLOB NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS blocklist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entry TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id BLOB NOT NULL UNIQUE,
                host_key BLOB NOT NULL,
                balance TEXT NOT NULL DEFAULT '0',
                requires_sync INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS multipart_uploads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                upload_id TEXT NOT NULL UNIQUE,
                bucket_id INTEGER NOT NULL REFERENCES buckets(id),
                path TEXT NOT NULL,
                key TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS multipart_parts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                upload_id INTEGER NOT NULL REFERENCES multipart_uploads(id) ON DELETE CASCADE,
                part_number INTEGER NOT NULL,
                etag TEXT NOT NULL,
                size INTEGER NOT NULL,
                UNIQUE (upload_id, part_number)
            );

            CREATE TABLE IF NOT EXISTS slices (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                object_id INTEGER REFERENCES objects(id) ON DELETE CASCADE,
                multipart_part_id INTEGER REFERENCES multipart_parts(id) ON DELETE CASCADE,
                slab_id INTEGER NOT NULL REFERENCES slabs(id),
                slice_index INTEGER NOT NULL,
                offset INTEGER NOT NULL,
                length INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_slices_object ON slices(object_id);
            CREATE INDEX IF NOT EXISTS idx_slices_slab ON slices(slab_id);

            CREATE TABLE IF NOT EXISTS partial_slabs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slab_id INTEGER NOT NULL UNIQUE REFERENCES slabs(id) ON DELETE CASCADE,
                data BLOB NOT NULL,
                complete INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::MetadataStore;
    use tempfile::TempDir;

    /// An on-disk store living inside a temp directory, dropped with it.
    pub(crate) fn temp_store() -> (TempDir, MetadataStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("meta.db")).unwrap();
        (dir, store)
    }
}
