//! The host database: announcements, scan bookkeeping, removal, and the
//! allow/blocklists.

use super::MetadataStore;
use crate::error::{RentError, Result};
use crate::host::{HostSettings, PriceTable};
use crate::types::PublicKey;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInteractions {
    pub total_scans: u64,
    pub last_scan: Option<DateTime<Utc>>,
    pub last_scan_success: bool,
    pub second_to_last_scan_success: bool,
    #[serde(with = "crate::settings::duration_secs")]
    pub uptime: Duration,
    #[serde(with = "crate::settings::duration_secs")]
    pub downtime: Duration,
    pub consecutive_failures: u64,
    pub successful_interactions: f64,
    pub failed_interactions: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub public_key: PublicKey,
    pub net_address: String,
    pub announced_height: u64,
    pub known_since: DateTime<Utc>,
    pub interactions: HostInteractions,
    pub settings: Option<HostSettings>,
    pub price_table: Option<PriceTable>,
    pub price_table_expiry: Option<DateTime<Utc>>,
    pub blocked: bool,
}

impl HostInfo {
    /// A host counts as scanned once a probe has succeeded.
    pub fn scanned(&self) -> bool {
        self.interactions.total_scans > 0 && self.settings.is_some()
    }

    /// Online means the last or second-to-last scan succeeded.
    pub fn is_online(&self) -> bool {
        let i = &self.interactions;
        match i.total_scans {
            0 => false,
            1 => i.last_scan_success,
            _ => i.last_scan_success || i.second_to_last_scan_success,
        }
    }
}

/// Outcome of probing one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostScan {
    pub host: PublicKey,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub settings: Option<HostSettings>,
    pub price_table: Option<PriceTable>,
}

/// A freshly paid-for price table to persist alongside the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTableUpdate {
    pub host: PublicKey,
    pub price_table: PriceTable,
    pub expiry: DateTime<Utc>,
}

/// Admissibility per the allow/blocklists: the allowlist (when non-empty)
/// must contain the host, and no blocklist entry may match the address's
/// domain suffix.
pub fn is_host_blocked(
    allowlist: &[PublicKey],
    blocklist: &[String],
    host: PublicKey,
    net_address: &str,
) -> bool {
    if !allowlist.is_empty() && !allowlist.contains(&host) {
        return true;
    }
    let domain = net_address
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(net_address);
    blocklist.iter().any(|entry| {
        domain == entry || domain.ends_with(&format!(".{entry}"))
    })
}

impl MetadataStore {
    /// Upsert a host from a chain announcement.
    pub fn record_host_announcement(
        &self,
        host: PublicKey,
        net_address: &str,
        height: u64,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO hosts (public_key, net_address, announced_height, known_since)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(public_key) DO UPDATE SET
                 net_address = excluded.net_address,
                 announced_height = excluded.announced_height",
            params![
                host.as_bytes().as_slice(),
                net_address,
                height,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn host(&self, host: PublicKey) -> Result<HostInfo> {
        let allowlist = self.allowlist()?;
        let blocklist = self.blocklist()?;
        let conn = self.conn()?;
        conn.query_row(
            &format!("{HOST_SELECT} WHERE public_key = ?1"),
            params![host.as_bytes().as_slice()],
            host_from_row,
        )
        .optional()?
        .map(|mut h| {
            h.blocked = is_host_blocked(&allowlist, &blocklist, h.public_key, &h.net_address);
            h
        })
        .ok_or_else(|| RentError::NotFound(format!("host {host}")))
    }

    pub fn hosts(&self, offset: usize, limit: usize) -> Result<Vec<HostInfo>> {
        self.search_hosts("", &[], offset, limit)
    }

    pub fn search_hosts(
        &self,
        address_contains: &str,
        key_in: &[PublicKey],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<HostInfo>> {
        let allowlist = self.allowlist()?;
        let blocklist = self.blocklist()?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{HOST_SELECT} WHERE net_address LIKE ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![
                format!("%{address_contains}%"),
                limit as i64,
                offset as i64
            ],
            host_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            let mut h = row?;
            if !key_in.is_empty() && !key_in.contains(&h.public_key) {
                continue;
            }
            h.blocked = is_host_blocked(&allowlist, &blocklist, h.public_key, &h.net_address);
            out.push(h);
        }
        Ok(out)
    }

    /// Hosts due for a scan, least recently scanned first.
    pub fn hosts_for_scanning(
        &self,
        last_scan_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(PublicKey, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT public_key, net_address FROM hosts
             WHERE last_scan < ?1 ORDER BY last_scan ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![last_scan_before.timestamp_millis(), limit as i64],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut out = Vec::new();
        for row in rows {
            let (pk, addr) = row?;
            if let Some(pk) = PublicKey::from_slice(&pk) {
                out.push((pk, addr));
            }
        }
        Ok(out)
    }

    /// Fold scan results into the per-host interaction counters.
    pub fn record_host_scans(&self, scans: &[HostScan]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for scan in scans {
            let row: Option<(i64, bool, i64)> = tx
                .query_row(
                    "SELECT last_scan, last_scan_success, total_scans
                     FROM hosts WHERE public_key = ?1",
                    params![scan.host.as_bytes().as_slice()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((last_scan_ms, _, total_scans)) = row else {
                continue;
            };

            let now_ms = scan.timestamp.timestamp_millis();
            let elapsed_ms = if last_scan_ms > 0 && total_scans > 0 {
                (now_ms - last_scan_ms).max(0)
            } else {
                0
            };

            if scan.success {
                tx.execute(
                    "UPDATE hosts SET
                         second_to_last_scan_success = last_scan_success,
                         last_scan_success = 1,
                         last_scan = ?1,
                         total_scans = total_scans + 1,
                         uptime_ms = uptime_ms + ?2,
                         consecutive_failures = 0,
                         successful_interactions = successful_interactions + 1,
                         settings = ?3,
                         price_table = COALESCE(?4, price_table)
                     WHERE public_key = ?5",
                    params![
                        now_ms,
                        elapsed_ms,
                        scan.settings
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                        scan.price_table
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                        scan.host.as_bytes().as_slice(),
                    ],
                )?;
            } else {
                tx.execute(
                    "UPDATE hosts SET
                         second_to_last_scan_success = last_scan_success,
                         last_scan_success = 0,
                         last_scan = ?1,
                         total_scans = total_scans + 1,
                         downtime_ms = downtime_ms + ?2,
                         consecutive_failures = consecutive_failures + 1,
                         failed_interactions = failed_interactions + 1
                     WHERE public_key = ?3",
                    params![now_ms, elapsed_ms, scan.host.as_bytes().as_slice()],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Persist a freshly fetched price table.
    pub fn record_price_table_updates(&self, updates: &[PriceTableUpdate]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for u in updates {
            tx.execute(
                "UPDATE hosts SET price_table = ?1, price_table_expiry = ?2
                 WHERE public_key = ?3",
                params![
                    serde_json::to_string(&u.price_table)?,
                    u.expiry.timestamp_millis(),
                    u.host.as_bytes().as_slice(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop hosts that have failed every recent scan and been down past the
    /// cutoff. Their contracts are archived first.
    pub fn remove_offline_hosts(
        &self,
        min_recent_scan_failures: u64,
        max_downtime: Duration,
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut stmt = tx.prepare(
            "SELECT id, public_key FROM hosts
             WHERE consecutive_failures >= ?1 AND downtime_ms >= ?2",
        )?;
        let doomed: Vec<(i64, Vec<u8>)> = stmt
            .query_map(
                params![min_recent_scan_failures, max_downtime.as_millis() as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        for (host_id, host_key) in &doomed {
            // archive this host's contracts before the row disappears
            let mut stmt = tx.prepare("SELECT fcid FROM contracts WHERE host_id = ?1")?;
            let fcids: Vec<Vec<u8>> = stmt
                .query_map(params![host_id], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            drop(stmt);
            for fcid in fcids {
                tx.execute(
                    "INSERT INTO archived_contracts (fcid, host_key, reason, total_cost,
                         proof_height, revision_height, revision_number, start_height,
                         window_start, window_end, upload_spending, download_spending,
                         fund_account_spending, delete_spending, sector_roots_spending)
                     SELECT fcid, ?1, ?2, total_cost, proof_height, revision_height,
                         revision_number, start_height, window_start, window_end,
                         upload_spending, download_spending, fund_account_spending,
                         delete_spending, sector_roots_spending
                     FROM contracts WHERE fcid = ?3",
                    params![
                        host_key.as_slice(),
                        super::contracts::ARCHIVAL_REASON_HOST_PRUNED,
                        fcid.as_slice()
                    ],
                )?;
                tx.execute("DELETE FROM contracts WHERE fcid = ?1", params![fcid])?;
            }
            tx.execute("DELETE FROM hosts WHERE id = ?1", params![host_id])?;
        }
        tx.commit()?;
        Ok(doomed.len())
    }

    // === allowlist / blocklist ===

    pub fn allowlist(&self) -> Result<Vec<PublicKey>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT entry FROM allowlist ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for row in rows {
            if let Some(pk) = PublicKey::from_slice(&row?) {
                out.push(pk);
            }
        }
        Ok(out)
    }

    pub fn blocklist(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT entry FROM blocklist ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Clear-then-add is a single transaction.
    pub fn update_allowlist(
        &self,
        add: &[PublicKey],
        remove: &[PublicKey],
        clear: bool,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if clear {
            tx.execute("DELETE FROM allowlist", [])?;
        }
        for pk in add {
            tx.execute(
                "INSERT OR IGNORE INTO allowlist (entry) VALUES (?1)",
                params![pk.as_bytes().as_slice()],
            )?;
        }
        for pk in remove {
            tx.execute(
                "DELETE FROM allowlist WHERE entry = ?1",
                params![pk.as_bytes().as_slice()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn update_blocklist(&self, add: &[String], remove: &[String], clear: bool) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if clear {
            tx.execute("DELETE FROM blocklist", [])?;
        }
        for entry in add {
            tx.execute(
                "INSERT OR IGNORE INTO blocklist (entry) VALUES (?1)",
                params![entry],
            )?;
        }
        for entry in remove {
            tx.execute("DELETE FROM blocklist WHERE entry = ?1", params![entry])?;
        }
        tx.commit()?;
        Ok(())
    }
}

const HOST_SELECT: &str = "SELECT public_key, net_address, announced_height, known_since,
        last_scan, last_scan_success, second_to_last_scan_success, uptime_ms, downtime_ms,
        total_scans, consecutive_failures, successful_interactions, failed_interactions,
        settings, price_table, price_table_expiry
    FROM hosts";

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<HostInfo> {
    let public_key: Vec<u8> = row.get(0)?;
    let known_since: String = row.get(3)?;
    let last_scan_ms: i64 = row.get(4)?;
    let settings: Option<String> = row.get(13)?;
    let price_table: Option<String> = row.get(14)?;
    let price_table_expiry: Option<i64> = row.get(15)?;
    Ok(HostInfo {
        public_key: PublicKey::from_slice(&public_key).unwrap_or_default(),
        net_address: row.get(1)?,
        announced_height: row.get::<_, i64>(2)? as u64,
        known_since: DateTime::parse_from_rfc3339(&known_since)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        interactions: HostInteractions {
            total_scans: row.get::<_, i64>(9)? as u64,
            last_scan: (last_scan_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_scan_ms).single())
                .flatten(),
            last_scan_success: row.get(5)?,
            second_to_last_scan_success: row.get(6)?,
            uptime: Duration::from_millis(row.get::<_, i64>(7)?.max(0) as u64),
            downtime: Duration::from_millis(row.get::<_, i64>(8)?.max(0) as u64),
            consecutive_failures: row.get::<_, i64>(10)? as u64,
            successful_interactions: row.get(11)?,
            failed_interactions: row.get(12)?,
        },
        settings: settings.and_then(|s| serde_json::from_str(&s).ok()),
        price_table: price_table.and_then(|s| serde_json::from_str(&s).ok()),
        price_table_expiry: price_table_expiry
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        blocked: false,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testutil::temp_store;
    use super::*;

    #[test]
    fn test_announcement_upserts() {
        let (_dir, store) = temp_store();
        let hk = PublicKey::random();
        store
            .record_host_announcement(hk, "old.example.com:9982", 5)
            .unwrap();
        store
            .record_host_announcement(hk, "new.example.com:9982", 9)
            .unwrap();
        let host = store.host(hk).unwrap();
        assert_eq!(host.net_address, "new.example.com:9982");
        assert_eq!(host.announced_height, 9);
        assert_eq!(store.hosts(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_scan_bookkeeping() {
        let (_dir, store) = temp_store();
        let hk = PublicKey::random();
        store
            .record_host_announcement(hk, "h.example.com:9982", 1)
            .unwrap();

        let t0 = Utc::now();
        let scan = |success, timestamp| HostScan {
            host: hk,
            timestamp,
            success,
            settings: success.then(HostSettings::default),
            price_table: success.then(PriceTable::default),
        };

        store.record_host_scans(&[scan(true, t0)]).unwrap();
        let h = store.host(hk).unwrap();
        assert!(h.interactions.last_scan_success);
        assert_eq!(h.interactions.total_scans, 1);
        assert_eq!(h.interactions.consecutive_failures, 0);
        assert!(h.scanned());

        let t1 = t0 + chrono::Duration::minutes(10);
        store.record_host_scans(&[scan(false, t1)]).unwrap();
        let h = store.host(hk).unwrap();
        assert!(!h.interactions.last_scan_success);
        assert!(h.interactions.second_to_last_scan_success);
        assert_eq!(h.interactions.consecutive_failures, 1);
        assert_eq!(h.interactions.downtime, Duration::from_secs(600));
        assert!(h.is_online());

        let t2 = t1 + chrono::Duration::minutes(10);
        store.record_host_scans(&[scan(false, t2)]).unwrap();
        let h = store.host(hk).unwrap();
        assert_eq!(h.interactions.consecutive_failures, 2);
        assert!(!h.is_online());
    }

    #[test]
    fn test_remove_offline_hosts() {
        let (_dir, store) = temp_store();
        let hk = PublicKey::random();
        store
            .record_host_announcement(hk, "gone.example.com:9982", 1)
            .unwrap();
        let fcid = crate::types::FileContractId::random();
        store
            .add_contract(fcid, hk, crate::types::Currency::new(5), 1, 100, 244)
            .unwrap();

        let mut t = Utc::now();
        for _ in 0..3 {
            store
                .record_host_scans(&[HostScan {
                    host: hk,
                    timestamp: t,
                    success: false,
                    settings: None,
                    price_table: None,
                }])
                .unwrap();
            t += chrono::Duration::hours(5);
        }

        // not enough failures yet
        assert_eq!(
            store
                .remove_offline_hosts(5, Duration::from_secs(3600))
                .unwrap(),
            0
        );
        // both thresholds crossed
        assert_eq!(
            store
                .remove_offline_hosts(3, Duration::from_secs(3600))
                .unwrap(),
            1
        );
        assert!(matches!(store.host(hk), Err(RentError::NotFound(_))));
        // the host's contract was archived, not lost
        let archived = store.archived_contract(fcid).unwrap();
        assert_eq!(
            archived.reason,
            super::super::contracts::ARCHIVAL_REASON_HOST_PRUNED
        );
    }

    #[test]
    fn test_allowlist_blocklist_semantics() {
        let allow: Vec<PublicKey> = vec![];
        let hk = PublicKey::random();
        // empty allowlist admits everyone
        assert!(!is_host_blocked(&allow, &[], hk, "a.example.com:9982"));
        // non-empty allowlist without the host blocks it
        let other = PublicKey::random();
        assert!(is_host_blocked(&[other], &[], hk, "a.example.com:9982"));
        assert!(!is_host_blocked(&[other, hk], &[], hk, "a.example.com:9982"));

        // blocklist matches the domain itself and subdomains, not suffixes
        // of unrelated names
        let block = vec!["example.com".to_string()];
        assert!(is_host_blocked(&[], &block, hk, "example.com:9982"));
        assert!(is_host_blocked(&[], &block, hk, "host.example.com:9982"));
        assert!(!is_host_blocked(&[], &block, hk, "notexample.com:9982"));
    }

    #[test]
    fn test_clear_then_add_is_atomic() {
        let (_dir, store) = temp_store();
        let a = PublicKey::random();
        let b = PublicKey::random();
        store.update_allowlist(&[a], &[], false).unwrap();
        store.update_allowlist(&[b], &[], true).unwrap();
        assert_eq!(store.allowlist().unwrap(), vec![b]);

        store
            .update_blocklist(&["one.com".into(), "two.com".into()], &[], false)
            .unwrap();
        store
            .update_blocklist(&["three.com".into()], &["nonexistent.com".into()], true)
            .unwrap();
        assert_eq!(store.blocklist().unwrap(), vec!["three.com".to_string()]);
    }
}
