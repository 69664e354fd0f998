//! Contract rows, their archive, contract sets, and spending counters.

use super::MetadataStore;
use crate::error::{RentError, Result};
use crate::types::{Currency, FileContractId, PublicKey};
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const ARCHIVAL_REASON_RENEWED: &str = "renewed";
pub const ARCHIVAL_REASON_HOST_PRUNED: &str = "hostpruned";

/// Running spending counters of one contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpending {
    pub uploads: Currency,
    pub downloads: Currency,
    pub fund_account: Currency,
    pub deletions: Currency,
    pub sector_roots: Currency,
}

impl ContractSpending {
    pub fn add(self, other: ContractSpending) -> ContractSpending {
        ContractSpending {
            uploads: self.uploads.saturating_add(other.uploads),
            downloads: self.downloads.saturating_add(other.downloads),
            fund_account: self.fund_account.saturating_add(other.fund_account),
            deletions: self.deletions.saturating_add(other.deletions),
            sector_roots: self.sector_roots.saturating_add(other.sector_roots),
        }
    }

    pub fn total(&self) -> Currency {
        self.uploads
            .saturating_add(self.downloads)
            .saturating_add(self.fund_account)
            .saturating_add(self.deletions)
            .saturating_add(self.sector_roots)
    }
}

/// A spending delta recorded against a contract by a transfer worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContractSpendingRecord {
    pub contract_id: FileContractId,
    pub spending: ContractSpending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractMetadata {
    pub id: FileContractId,
    pub host_key: PublicKey,
    pub host_address: String,
    pub renewed_from: Option<FileContractId>,
    pub total_cost: Currency,
    pub spending: ContractSpending,
    pub proof_height: u64,
    pub revision_height: u64,
    pub revision_number: u64,
    pub start_height: u64,
    pub window_start: u64,
    pub window_end: u64,
}

impl ContractMetadata {
    /// Funds not yet consumed by recorded spending.
    pub fn remaining_funds(&self) -> Currency {
        self.total_cost.saturating_sub(self.spending.total())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedContract {
    pub id: FileContractId,
    pub host_key: PublicKey,
    pub renewed_from: Option<FileContractId>,
    pub renewed_to: Option<FileContractId>,
    pub reason: String,
    pub total_cost: Currency,
    pub spending: ContractSpending,
    pub proof_height: u64,
    pub revision_number: u64,
    pub start_height: u64,
    pub window_start: u64,
    pub window_end: u64,
}

impl MetadataStore {
    pub fn add_contract(
        &self,
        fcid: FileContractId,
        host_key: PublicKey,
        total_cost: Currency,
        start_height: u64,
        window_start: u64,
        window_end: u64,
    ) -> Result<ContractMetadata> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        insert_contract(
            &tx,
            fcid,
            host_key,
            total_cost,
            start_height,
            window_start,
            window_end,
            None,
        )?;
        let meta = contract_by_fcid(&tx, fcid)?;
        tx.commit()?;
        Ok(meta)
    }

    /// Record a renewal as one atomic transition: the old contract is
    /// archived with reason "renewed" and forward pointer, its set
    /// membership and sector links move to the new contract, and the new
    /// contract carries the back pointer.
    pub fn add_renewed_contract(
        &self,
        fcid: FileContractId,
        total_cost: Currency,
        start_height: u64,
        window_start: u64,
        window_end: u64,
        renewed_from: FileContractId,
    ) -> Result<ContractMetadata> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let old = contract_by_fcid(&tx, renewed_from)?;
        let old_row_id: i64 = tx.query_row(
            "SELECT id FROM contracts WHERE fcid = ?1",
            params![renewed_from.as_bytes().as_slice()],
            |row| row.get(0),
        )?;

        archive_row(&tx, &old, ARCHIVAL_REASON_RENEWED, Some(fcid))?;

        insert_contract(
            &tx,
            fcid,
            old.host_key,
            total_cost,
            start_height,
            window_start,
            window_end,
            Some(renewed_from),
        )?;
        let new_row_id = tx.last_insert_rowid();

        // migrate set membership and sector links to the new contract
        tx.execute(
            "UPDATE contract_set_contracts SET contract_id = ?1 WHERE contract_id = ?2",
            params![new_row_id, old_row_id],
        )?;
        tx.execute(
            "UPDATE OR IGNORE contract_sectors SET contract_id = ?1 WHERE contract_id = ?2",
            params![new_row_id, old_row_id],
        )?;
        tx.execute("DELETE FROM contracts WHERE id = ?1", params![old_row_id])?;

        let meta = contract_by_fcid(&tx, fcid)?;
        tx.commit()?;
        Ok(meta)
    }

    /// Archive contracts with per-contract reasons. The active rows are
    /// removed, cascading their set memberships and sector links.
    pub fn archive_contracts(&self, to_archive: &HashMap<FileContractId, String>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (fcid, reason) in to_archive {
            let meta = match contract_by_fcid(&tx, *fcid) {
                Ok(meta) => meta,
                Err(RentError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            archive_row(&tx, &meta, reason, None)?;
            tx.execute(
                "DELETE FROM contracts WHERE fcid = ?1",
                params![fcid.as_bytes().as_slice()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn contract(&self, fcid: FileContractId) -> Result<ContractMetadata> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        contract_by_fcid(&tx, fcid)
    }

    pub fn active_contracts(&self) -> Result<Vec<ContractMetadata>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut stmt = tx.prepare(&format!(
            "{CONTRACT_SELECT} ORDER BY contracts.start_height ASC"
        ))?;
        let rows = stmt.query_map([], contract_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// The active contracts belonging to a named set.
    pub fn contracts_in_set(&self, set: &str) -> Result<Vec<ContractMetadata>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let set_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM contract_sets WHERE name = ?1",
                params![set],
                |row| row.get(0),
            )
            .optional()?;
        let Some(set_id) = set_id else {
            return Err(RentError::NotFound(format!("contract set '{set}'")));
        };
        let mut stmt = tx.prepare(&format!(
            "{CONTRACT_SELECT}
             INNER JOIN contract_set_contracts csc ON csc.contract_id = contracts.id
             WHERE csc.set_id = ?1"
        ))?;
        let rows = stmt.query_map(params![set_id], contract_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn contract_sets(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM contract_sets ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Replace a set's membership atomically.
    pub fn set_contract_set(&self, name: &str, fcids: &[FileContractId]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO contract_sets (name) VALUES (?1)",
            params![name],
        )?;
        let set_id: i64 = tx.query_row(
            "SELECT id FROM contract_sets WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM contract_set_contracts WHERE set_id = ?1",
            params![set_id],
        )?;
        for fcid in fcids {
            let contract_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM contracts WHERE fcid = ?1",
                    params![fcid.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(contract_id) = contract_id {
                tx.execute(
                    "INSERT OR IGNORE INTO contract_set_contracts (set_id, contract_id)
                     VALUES (?1, ?2)",
                    params![set_id, contract_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove_contract_set(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM contract_sets WHERE name = ?1", params![name])?;
        Ok(())
    }

    /// Apply spending deltas, coalescing by contract id before touching any
    /// row. Records for unknown contracts are skipped.
    pub fn record_contract_spending(&self, records: &[ContractSpendingRecord]) -> Result<()> {
        let mut squashed: HashMap<FileContractId, ContractSpending> = HashMap::new();
        for r in records {
            let entry = squashed.entry(r.contract_id).or_default();
            *entry = entry.add(r.spending);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for (fcid, delta) in squashed {
            let meta = match contract_by_fcid(&tx, fcid) {
                Ok(meta) => meta,
                Err(RentError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let updated = meta.spending.add(delta);
            tx.execute(
                "UPDATE contracts SET upload_spending = ?1, download_spending = ?2,
                     fund_account_spending = ?3, delete_spending = ?4,
                     sector_roots_spending = ?5
                 WHERE fcid = ?6",
                params![
                    updated.uploads.to_string(),
                    updated.downloads.to_string(),
                    updated.fund_account.to_string(),
                    updated.deletions.to_string(),
                    updated.sector_roots.to_string(),
                    fcid.as_bytes().as_slice(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a revision observed for a contract. Revision numbers must be
    /// strictly increasing; a stale revision is rejected.
    pub fn update_contract_revision(
        &self,
        fcid: FileContractId,
        revision_number: u64,
        revision_height: u64,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let meta = contract_by_fcid(&tx, fcid)?;
        if revision_number <= meta.revision_number {
            return Err(RentError::Conflict(format!(
                "revision number {} is not greater than {}",
                revision_number, meta.revision_number
            )));
        }
        tx.execute(
            "UPDATE contracts SET revision_number = ?1, revision_height = ?2 WHERE fcid = ?3",
            params![
                revision_number.to_string(),
                revision_height,
                fcid.as_bytes().as_slice()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn update_contract_proof_height(
        &self,
        fcid: FileContractId,
        proof_height: u64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE contracts SET proof_height = ?1 WHERE fcid = ?2",
            params![proof_height, fcid.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    /// Walk the renewal chain backwards from `fcid`, stopping below
    /// `start_height`.
    pub fn ancestor_contracts(
        &self,
        fcid: FileContractId,
        start_height: u64,
    ) -> Result<Vec<ArchivedContract>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "WITH RECURSIVE ancestors AS (
                 SELECT * FROM archived_contracts WHERE renewed_to = ?1
                 UNION ALL
                 SELECT archived_contracts.* FROM ancestors, archived_contracts
                 WHERE archived_contracts.renewed_to = ancestors.fcid
             )
             SELECT fcid, host_key, renewed_from, renewed_to, reason, total_cost,
                    proof_height, revision_number, start_height, window_start, window_end,
                    upload_spending, download_spending, fund_account_spending,
                    delete_spending, sector_roots_spending
             FROM ancestors WHERE start_height >= ?2",
        )?;
        let rows = stmt.query_map(
            params![fcid.as_bytes().as_slice(), start_height],
            archived_from_row,
        )?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// The most recent archived contract with a host, used by the pruner to
    /// address deletions at hosts no active contract covers anymore.
    pub fn latest_archived_contract_for_host(
        &self,
        host: PublicKey,
    ) -> Result<Option<ArchivedContract>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT fcid, host_key, renewed_from, renewed_to, reason, total_cost,
                        proof_height, revision_number, start_height, window_start, window_end,
                        upload_spending, download_spending, fund_account_spending,
                        delete_spending, sector_roots_spending
                 FROM archived_contracts WHERE host_key = ?1
                 ORDER BY start_height DESC, id DESC LIMIT 1",
                params![host.as_bytes().as_slice()],
                archived_from_row,
            )
            .optional()?)
    }

    pub fn archived_contract(&self, fcid: FileContractId) -> Result<ArchivedContract> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT fcid, host_key, renewed_from, renewed_to, reason, total_cost,
                    proof_height, revision_number, start_height, window_start, window_end,
                    upload_spending, download_spending, fund_account_spending,
                    delete_spending, sector_roots_spending
             FROM archived_contracts WHERE fcid = ?1",
            params![fcid.as_bytes().as_slice()],
            archived_from_row,
        )
        .optional()?
        .ok_or_else(|| RentError::NotFound(format!("archived contract {fcid}")))
    }

    /// Hard-delete archived contracts whose proof window closed at or before
    /// `height`. Their sector links were already removed at archival; the
    /// pruner deallocates the sectors themselves.
    pub fn delete_expired_archived_contracts(&self, height: u64) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM archived_contracts WHERE window_end <= ?1",
            params![height],
        )?;
        Ok(deleted)
    }
}

const CONTRACT_SELECT: &str = "SELECT contracts.fcid, hosts.public_key, hosts.net_address,
        contracts.renewed_from, contracts.total_cost, contracts.proof_height,
        contracts.revision_height, contracts.revision_number, contracts.start_height,
        contracts.window_start, contracts.window_end, contracts.upload_spending,
        contracts.download_spending, contracts.fund_account_spending,
        contracts.delete_spending, contracts.sector_roots_spending
     FROM contracts INNER JOIN hosts ON hosts.id = contracts.host_id";

fn parse_currency(s: String) -> Currency {
    s.parse().unwrap_or(Currency::ZERO)
}

fn parse_fcid(bytes: Option<Vec<u8>>) -> Option<FileContractId> {
    bytes.as_deref().and_then(FileContractId::from_slice)
}

fn contract_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContractMetadata> {
    let fcid: Vec<u8> = row.get(0)?;
    let host_key: Vec<u8> = row.get(1)?;
    Ok(ContractMetadata {
        id: FileContractId::from_slice(&fcid).unwrap_or_default(),
        host_key: PublicKey::from_slice(&host_key).unwrap_or_default(),
        host_address: row.get(2)?,
        renewed_from: parse_fcid(row.get(3)?),
        total_cost: parse_currency(row.get(4)?),
        proof_height: row.get::<_, i64>(5)? as u64,
        revision_height: row.get::<_, i64>(6)? as u64,
        revision_number: row.get::<_, String>(7)?.parse().unwrap_or(0),
        start_height: row.get::<_, i64>(8)? as u64,
        window_start: row.get::<_, i64>(9)? as u64,
        window_end: row.get::<_, i64>(10)? as u64,
        spending: ContractSpending {
            uploads: parse_currency(row.get(11)?),
            downloads: parse_currency(row.get(12)?),
            fund_account: parse_currency(row.get(13)?),
            deletions: parse_currency(row.get(14)?),
            sector_roots: parse_currency(row.get(15)?),
        },
    })
}

fn archived_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArchivedContract> {
    let fcid: Vec<u8> = row.get(0)?;
    let host_key: Vec<u8> = row.get(1)?;
    Ok(ArchivedContract {
        id: FileContractId::from_slice(&fcid).unwrap_or_default(),
        host_key: PublicKey::from_slice(&host_key).unwrap_or_default(),
        renewed_from: parse_fcid(row.get(2)?),
        renewed_to: parse_fcid(row.get(3)?),
        reason: row.get(4)?,
        total_cost: parse_currency(row.get(5)?),
        proof_height: row.get::<_, i64>(6)? as u64,
        revision_number: row.get::<_, String>(7)?.parse().unwrap_or(0),
        start_height: row.get::<_, i64>(8)? as u64,
        window_start: row.get::<_, i64>(9)? as u64,
        window_end: row.get::<_, i64>(10)? as u64,
        spending: ContractSpending {
            uploads: parse_currency(row.get(11)?),
            downloads: parse_currency(row.get(12)?),
            fund_account: parse_currency(row.get(13)?),
            deletions: parse_currency(row.get(14)?),
            sector_roots: parse_currency(row.get(15)?),
        },
    })
}

pub(crate) fn contract_by_fcid(
    tx: &Transaction<'_>,
    fcid: FileContractId,
) -> Result<ContractMetadata> {
    tx.query_row(
        &format!("{CONTRACT_SELECT} WHERE contracts.fcid = ?1"),
        params![fcid.as_bytes().as_slice()],
        contract_from_row,
    )
    .optional()?
    .ok_or_else(|| RentError::NotFound(format!("contract {fcid}")))
}

#[allow(clippy::too_many_arguments)]
fn insert_contract(
    tx: &Transaction<'_>,
    fcid: FileContractId,
    host_key: PublicKey,
    total_cost: Currency,
    start_height: u64,
    window_start: u64,
    window_end: u64,
    renewed_from: Option<FileContractId>,
) -> Result<()> {
    let host_id: Option<i64> = tx
        .query_row(
            "SELECT id FROM hosts WHERE public_key = ?1",
            params![host_key.as_bytes().as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(host_id) = host_id else {
        return Err(RentError::NotFound(format!("host {host_key}")));
    };
    tx.execute(
        "INSERT INTO contracts (fcid, host_id, renewed_from, total_cost, start_height,
             window_start, window_end)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            fcid.as_bytes().as_slice(),
            host_id,
            renewed_from.map(|f| f.0.to_vec()),
            total_cost.to_string(),
            start_height,
            window_start,
            window_end,
        ],
    )?;
    Ok(())
}

fn archive_row(
    tx: &Transaction<'_>,
    meta: &ContractMetadata,
    reason: &str,
    renewed_to: Option<FileContractId>,
) -> Result<()> {
    tx.execute(
        "INSERT INTO archived_contracts (fcid, host_key, renewed_from, renewed_to, reason,
             total_cost, proof_height, revision_height, revision_number, start_height,
             window_start, window_end, upload_spending, download_spending,
             fund_account_spending, delete_spending, sector_roots_spending)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            meta.id.as_bytes().as_slice(),
            meta.host_key.as_bytes().as_slice(),
            meta.renewed_from.map(|f| f.0.to_vec()),
            renewed_to.map(|f| f.0.to_vec()),
            reason,
            meta.total_cost.to_string(),
            meta.proof_height,
            meta.revision_height,
            meta.revision_number.to_string(),
            meta.start_height,
            meta.window_start,
            meta.window_end,
            meta.spending.uploads.to_string(),
            meta.spending.downloads.to_string(),
            meta.spending.fund_account.to_string(),
            meta.spending.deletions.to_string(),
            meta.spending.sector_roots.to_string(),
        ],
    )?;
    Ok(())
}
