//! Buckets, objects, slabs, and the health queries driving migration.

use super::MetadataStore;
use crate::error::{RentError, Result};
use crate::object::{EncryptionKey, Object, Sector, Slab, SlabSlice};
use crate::types::{FileContractId, Hash256, PublicKey, SECTOR_SIZE};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub name: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// One entry of a directory-style listing; directories aggregate the sizes
/// of everything beneath them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ObjectsStats {
    pub num_objects: u64,
    /// Sum of object sizes, i.e. logical bytes stored.
    pub total_objects_size: u64,
    /// Distinct sectors times sector size.
    pub total_sectors_size: u64,
    /// Sector-contract links times sector size, i.e. physical bytes uploaded.
    pub total_uploaded_size: u64,
}

/// A slab paired with its computed health within a contract set.
#[derive(Debug, Clone)]
pub struct SlabHealth {
    pub slab: Slab,
    pub health: f64,
}

/// A completed partial-slab buffer, ready to be erasure-coded and uploaded.
#[derive(Debug, Clone)]
pub struct PackedSlab {
    pub key: EncryptionKey,
    pub min_shards: u8,
    pub total_shards: u8,
    pub data: Vec<u8>,
}

const HEALTH_SQL: &str = "CASE WHEN slabs.min_shards = slabs.total_shards THEN
        CASE WHEN COUNT(DISTINCT c.host_id) < slabs.min_shards THEN -1.0 ELSE 1.0 END
    ELSE
        MAX(0.0, MIN(1.0,
            (CAST(COUNT(DISTINCT c.host_id) AS REAL) - CAST(slabs.min_shards AS REAL)) /
            (CAST(slabs.total_shards AS REAL) - CAST(slabs.min_shards AS REAL))))
    END";

impl MetadataStore {
    // === buckets ===

    pub fn create_bucket(&self, name: &str, policy: serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO buckets (name, policy, created_at) VALUES (?1, ?2, ?3)",
            params![name, policy.to_string(), Utc::now().to_rfc3339()],
        )?;
        if inserted == 0 {
            return Err(RentError::AlreadyExists(format!("bucket '{name}'")));
        }
        Ok(())
    }

    pub fn bucket(&self, name: &str) -> Result<(String, serde_json::Value)> {
        let conn = self.conn()?;
        let row: Option<String> = conn
            .query_row(
                "SELECT policy FROM buckets WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        match row {
            Some(policy) => Ok((name.to_string(), serde_json::from_str(&policy)?)),
            None => Err(RentError::NotFound(format!("bucket '{name}'"))),
        }
    }

    pub fn buckets(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM buckets ORDER BY name")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    pub fn update_bucket_policy(&self, name: &str, policy: serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE buckets SET policy = ?1 WHERE name = ?2",
            params![policy.to_string(), name],
        )?;
        if updated == 0 {
            return Err(RentError::NotFound(format!("bucket '{name}'")));
        }
        Ok(())
    }

    pub fn delete_bucket(&self, name: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let bucket_id = bucket_id(&tx, name)?;
        let objects: u64 = tx.query_row(
            "SELECT COUNT(*) FROM objects WHERE bucket_id = ?1",
            params![bucket_id],
            |row| row.get(0),
        )?;
        if objects > 0 {
            return Err(RentError::Conflict(format!("bucket '{name}' is not empty")));
        }
        tx.execute(
            "DELETE FROM multipart_uploads WHERE bucket_id = ?1",
            params![bucket_id],
        )?;
        tx.execute("DELETE FROM buckets WHERE id = ?1", params![bucket_id])?;
        tx.commit()?;
        Ok(())
    }

    // === objects ===

    /// Insert or replace the object at (bucket, path). Replacement is atomic;
    /// the previous object's slices are cascaded away and their slabs left
    /// for the pruner.
    pub fn update_object(
        &self,
        bucket: &str,
        path: &str,
        object: &Object,
        etag: Option<&str>,
        used_contracts: &HashMap<PublicKey, FileContractId>,
    ) -> Result<()> {
        for ss in &object.slabs {
            for shard in &ss.slab.shards {
                if !used_contracts.contains_key(&shard.host) {
                    return Err(RentError::PreconditionFailed(format!(
                        "missing contract for host {}",
                        shard.host
                    )));
                }
            }
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let bucket_id = bucket_id(&tx, bucket)?;

        tx.execute(
            "DELETE FROM objects WHERE bucket_id = ?1 AND path = ?2",
            params![bucket_id, path],
        )?;
        tx.execute(
            "INSERT INTO objects (bucket_id, path, key, size, etag, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                bucket_id,
                path,
                object.key.to_string(),
                object.size() as i64,
                etag,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let object_id = tx.last_insert_rowid();

        for (i, ss) in object.slabs.iter().enumerate() {
            let slab_id = upsert_slab(&tx, &ss.slab)?;
            tx.execute(
                "INSERT INTO slices (object_id, slab_id, slice_index, offset, length)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![object_id, slab_id, i as i64, ss.offset, ss.length],
            )?;
            insert_shards(&tx, slab_id, &ss.slab.shards, used_contracts)?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn object(&self, bucket: &str, path: &str) -> Result<(Object, ObjectMetadata)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let bucket_id = bucket_id(&tx, bucket)?;

        let row: Option<(i64, String, i64, Option<String>)> = tx
            .query_row(
                "SELECT id, key, size, etag FROM objects WHERE bucket_id = ?1 AND path = ?2",
                params![bucket_id, path],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((object_id, key, size, etag)) = row else {
            return Err(RentError::NotFound(format!("object '{path}'")));
        };

        let mut stmt = tx.prepare(
            "SELECT s.slab_id, s.offset, s.length FROM slices s
             WHERE s.object_id = ?1 ORDER BY s.slice_index ASC",
        )?;
        let slice_rows: Vec<(i64, u32, u32)> = stmt
            .query_map(params![object_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let mut slabs = Vec::with_capacity(slice_rows.len());
        for (slab_id, offset, length) in slice_rows {
            let slab = load_slab(&tx, slab_id)?;
            slabs.push(SlabSlice {
                slab,
                offset,
                length,
            });
        }

        let object = Object {
            key: key.parse()?,
            slabs,
        };
        Ok((
            object,
            ObjectMetadata {
                name: path.to_string(),
                size: size as u64,
                etag,
            },
        ))
    }

    pub fn remove_object(&self, bucket: &str, path: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let bucket_id = bucket_id(&tx, bucket)?;
        let deleted = tx.execute(
            "DELETE FROM objects WHERE bucket_id = ?1 AND path = ?2",
            params![bucket_id, path],
        )?;
        tx.commit()?;
        if deleted == 0 {
            return Err(RentError::NotFound(format!("object '{path}'")));
        }
        Ok(())
    }

    pub fn search_objects(
        &self,
        bucket: &str,
        substring: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ObjectMetadata>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let bucket_id = bucket_id(&tx, bucket)?;
        let mut stmt = tx.prepare(
            "SELECT path, size, etag FROM objects
             WHERE bucket_id = ?1 AND path LIKE ?2
             ORDER BY path ASC LIMIT ?3 OFFSET ?4",
        )?;
        let rows = stmt.query_map(
            params![
                bucket_id,
                format!("%{substring}%"),
                limit as i64,
                offset as i64
            ],
            |row| {
                Ok(ObjectMetadata {
                    name: row.get(0)?,
                    size: row.get::<_, i64>(1)? as u64,
                    etag: row.get(2)?,
                })
            },
        )?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// POSIX-like directory listing under `path` (which must end in '/'),
    /// optionally filtered by an entry name prefix. Directories aggregate
    /// child sizes.
    pub fn object_entries(
        &self,
        bucket: &str,
        path: &str,
        prefix: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ObjectEntry>> {
        if !path.ends_with('/') {
            return Err(RentError::InvalidRequest("path must end in /".into()));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let bucket_id = bucket_id(&tx, bucket)?;
        let mut stmt = tx.prepare(
            "SELECT name, size FROM (
                 SELECT CASE slashindex WHEN 0 THEN ?1 || trimmed
                        ELSE ?1 || SUBSTR(trimmed, 1, slashindex) END AS name,
                        SUM(size) AS size
                 FROM (
                     SELECT size, trimmed, INSTR(trimmed, '/') AS slashindex
                     FROM (
                         SELECT size, SUBSTR(path, ?2) AS trimmed
                         FROM objects
                         WHERE bucket_id = ?3 AND path LIKE ?4
                     )
                 )
                 GROUP BY name
             )
             WHERE name LIKE ?5
             ORDER BY name ASC
             LIMIT ?6 OFFSET ?7",
        )?;
        let rows = stmt.query_map(
            params![
                path,
                path.chars().count() as i64 + 1,
                bucket_id,
                format!("{path}%"),
                format!("{path}{prefix}%"),
                limit as i64,
                offset as i64
            ],
            |row| {
                Ok(ObjectEntry {
                    name: row.get(0)?,
                    size: row.get::<_, i64>(1)? as u64,
                })
            },
        )?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Counts and sums, all gathered in one transaction for consistency.
    pub fn objects_stats(&self) -> Result<ObjectsStats> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let num_objects: i64 = tx.query_row("SELECT COUNT(*) FROM objects", [], |r| r.get(0))?;
        let total_objects_size: i64 =
            tx.query_row("SELECT COALESCE(SUM(size), 0) FROM objects", [], |r| {
                r.get(0)
            })?;
        let (distinct_sectors, links): (i64, i64) = tx.query_row(
            "SELECT COUNT(DISTINCT sector_id), COUNT(*) FROM contract_sectors",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(ObjectsStats {
            num_objects: num_objects as u64,
            total_objects_size: total_objects_size as u64,
            total_sectors_size: distinct_sectors as u64 * SECTOR_SIZE as u64,
            total_uploaded_size: links as u64 * SECTOR_SIZE as u64,
        })
    }

    // === slabs ===

    pub fn slab(&self, key: &EncryptionKey) -> Result<Slab> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let slab_id = slab_id_by_key(&tx, key)?;
        load_slab(&tx, slab_id)
    }

    /// Overwrite a slab's shards in place, typically after migration.
    /// Readers observe either the old or the new shard set.
    pub fn update_slab(
        &self,
        slab: &Slab,
        used_contracts: &HashMap<PublicKey, FileContractId>,
    ) -> Result<()> {
        for shard in &slab.shards {
            if shard.root.is_zero() {
                return Err(RentError::PreconditionFailed(
                    "shard root can never be the empty root".into(),
                ));
            }
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let slab_id = slab_id_by_key(&tx, &slab.key)?;
        insert_shards(&tx, slab_id, &slab.shards, used_contracts)?;
        tx.commit()?;
        Ok(())
    }

    /// Slabs below full redundancy in the set, least healthy first.
    pub fn unhealthy_slabs(
        &self,
        set: &str,
        health_cutoff: f64,
        limit: usize,
    ) -> Result<Vec<SlabHealth>> {
        self.query_slab_health(set, health_cutoff, limit, false)
    }

    /// Like `unhealthy_slabs`, but only slabs with at least one sector
    /// unreachable through the set's contracts.
    pub fn slabs_for_migration(
        &self,
        set: &str,
        health_cutoff: f64,
        limit: usize,
    ) -> Result<Vec<SlabHealth>> {
        self.query_slab_health(set, health_cutoff, limit, true)
    }

    fn query_slab_health(
        &self,
        set: &str,
        health_cutoff: f64,
        limit: usize,
        outside_set_only: bool,
    ) -> Result<Vec<SlabHealth>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let outside_filter = if outside_set_only {
            "AND EXISTS (
                SELECT 1 FROM shards sh2
                WHERE sh2.slab_id = slabs.id AND NOT EXISTS (
                    SELECT 1 FROM contract_sectors cs2
                    INNER JOIN contract_set_contracts csc2 ON csc2.contract_id = cs2.contract_id
                    INNER JOIN contract_sets cset2 ON cset2.id = csc2.set_id AND cset2.name = ?1
                    WHERE cs2.sector_id = sh2.sector_id
                )
            )"
        } else {
            ""
        };
        let sql = format!(
            "SELECT slabs.id, {HEALTH_SQL} AS health
             FROM slabs
             INNER JOIN shards sh ON sh.slab_id = slabs.id
             LEFT JOIN contract_sectors cs ON cs.sector_id = sh.sector_id
             LEFT JOIN contract_set_contracts csc ON csc.contract_id = cs.contract_id
                 AND csc.set_id = (SELECT id FROM contract_sets WHERE name = ?1)
             LEFT JOIN contracts c ON c.id = csc.contract_id
             WHERE slabs.buffered = 0 {outside_filter}
             GROUP BY slabs.id
             HAVING health >= 0 AND health <= ?2 AND health < 1.0
             ORDER BY health ASC, slabs.id ASC
             LIMIT ?3"
        );
        let mut stmt = tx.prepare(&sql)?;
        let rows: Vec<(i64, f64)> = stmt
            .query_map(params![set, health_cutoff, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let mut out = Vec::with_capacity(rows.len());
        for (slab_id, health) in rows {
            out.push(SlabHealth {
                slab: load_slab(&tx, slab_id)?,
                health,
            });
        }
        Ok(out)
    }

    /// Recompute and persist every slab's health relative to the set.
    pub fn refresh_health(&self, set: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let sql = format!(
            "SELECT slabs.id, {HEALTH_SQL} AS health
             FROM slabs
             INNER JOIN shards sh ON sh.slab_id = slabs.id
             LEFT JOIN contract_sectors cs ON cs.sector_id = sh.sector_id
             LEFT JOIN contract_set_contracts csc ON csc.contract_id = cs.contract_id
                 AND csc.set_id = (SELECT id FROM contract_sets WHERE name = ?1)
             LEFT JOIN contracts c ON c.id = csc.contract_id
             WHERE slabs.buffered = 0
             GROUP BY slabs.id"
        );
        let mut stmt = tx.prepare(&sql)?;
        let rows: Vec<(i64, f64)> = stmt
            .query_map(params![set], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);
        let updated = rows.len();
        for (id, health) in rows {
            tx.execute(
                "UPDATE slabs SET health = ?1 WHERE id = ?2",
                params![health, id],
            )?;
        }
        tx.commit()?;
        Ok(updated)
    }

    // === partial slabs ===

    /// Buffer bytes that do not fill a whole slab. Returns the slices
    /// covering `data` in buffer order; a buffer reaching capacity is marked
    /// complete and becomes eligible for packing.
    pub fn add_partial_slab(
        &self,
        data: &[u8],
        min_shards: u8,
        total_shards: u8,
    ) -> Result<Vec<SlabSlice>> {
        let capacity = min_shards as usize * SECTOR_SIZE;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut slices = Vec::new();
        let mut rem = data;

        while !rem.is_empty() {
            let open: Option<(i64, i64, String, i64)> = tx
                .query_row(
                    "SELECT ps.id, ps.slab_id, slabs.key, LENGTH(ps.data)
                     FROM partial_slabs ps
                     INNER JOIN slabs ON slabs.id = ps.slab_id
                     WHERE ps.complete = 0 AND slabs.min_shards = ?1 AND slabs.total_shards = ?2
                     ORDER BY ps.id ASC LIMIT 1",
                    params![min_shards, total_shards],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let (partial_id, key, used) = match open {
                Some((partial_id, _slab_id, key, used)) => {
                    (partial_id, key.parse::<EncryptionKey>()?, used as usize)
                }
                None => {
                    let key = EncryptionKey::generate();
                    tx.execute(
                        "INSERT INTO slabs (key, min_shards, total_shards, buffered)
                         VALUES (?1, ?2, ?3, 1)",
                        params![key.to_string(), min_shards, total_shards],
                    )?;
                    let slab_id = tx.last_insert_rowid();
                    tx.execute(
                        "INSERT INTO partial_slabs (slab_id, data) VALUES (?1, x'')",
                        params![slab_id],
                    )?;
                    (tx.last_insert_rowid(), key, 0)
                }
            };

            let take = rem.len().min(capacity - used);
            let complete = used + take >= capacity;
            tx.execute(
                "UPDATE partial_slabs SET data = data || ?1, complete = ?2 WHERE id = ?3",
                params![&rem[..take], complete, partial_id],
            )?;
            slices.push(SlabSlice {
                slab: Slab {
                    key,
                    min_shards,
                    shards: Vec::new(),
                },
                offset: used as u32,
                length: take as u32,
            });
            rem = &rem[take..];
        }

        tx.commit()?;
        Ok(slices)
    }

    /// Buffered data backing a slab, if the slab is still buffered.
    pub fn partial_slab_data(&self, key: &EncryptionKey) -> Result<Vec<u8>> {
        let conn = self.conn()?;
        let row: Option<Vec<u8>> = conn
            .query_row(
                "SELECT ps.data FROM partial_slabs ps
                 INNER JOIN slabs ON slabs.id = ps.slab_id
                 WHERE slabs.key = ?1",
                params![key.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        row.ok_or_else(|| RentError::NotFound(format!("partial slab '{key}'")))
    }

    /// Completed buffers awaiting erasure coding and upload.
    pub fn packed_slabs_for_upload(&self, limit: usize) -> Result<Vec<PackedSlab>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT slabs.key, slabs.min_shards, slabs.total_shards, ps.data
             FROM partial_slabs ps
             INNER JOIN slabs ON slabs.id = ps.slab_id
             WHERE ps.complete = 1
             ORDER BY ps.id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u8>(1)?,
                row.get::<_, u8>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (key, min_shards, total_shards, data) = row?;
            out.push(PackedSlab {
                key: key.parse()?,
                min_shards,
                total_shards,
                data,
            });
        }
        Ok(out)
    }

    /// Attach the uploaded shards to a previously buffered slab and drop its
    /// buffer.
    pub fn mark_packed_slab_uploaded(
        &self,
        key: &EncryptionKey,
        shards: &[Sector],
        used_contracts: &HashMap<PublicKey, FileContractId>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let slab_id = slab_id_by_key(&tx, key)?;
        insert_shards(&tx, slab_id, shards, used_contracts)?;
        tx.execute(
            "UPDATE slabs SET buffered = 0 WHERE id = ?1",
            params![slab_id],
        )?;
        tx.execute(
            "DELETE FROM partial_slabs WHERE slab_id = ?1",
            params![slab_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // === pruning support ===

    /// Delete slabs no slice references anymore. Their shards cascade away,
    /// leaving sectors unreferenced and therefore prunable.
    pub fn delete_orphaned_slabs(&self) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM slabs WHERE id NOT IN (SELECT DISTINCT slab_id FROM slices)",
            [],
        )?;
        Ok(deleted)
    }

    /// Sector roots with zero shard references, grouped by the hosts known
    /// to store them.
    pub fn prunable_sectors(&self) -> Result<HashMap<PublicKey, Vec<Hash256>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT h.public_key, sec.root
             FROM sectors sec
             INNER JOIN host_sectors hs ON hs.sector_id = sec.id
             INNER JOIN hosts h ON h.id = hs.host_id
             WHERE NOT EXISTS (SELECT 1 FROM shards sh WHERE sh.sector_id = sec.id)",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut by_host: HashMap<PublicKey, Vec<Hash256>> = HashMap::new();
        for row in rows {
            let (hk, root) = row?;
            let (Some(hk), Some(root)) = (PublicKey::from_slice(&hk), Hash256::from_slice(&root))
            else {
                continue;
            };
            by_host.entry(hk).or_default().push(root);
        }
        Ok(by_host)
    }

    /// Host copies no contract covers anymore: the host still stores the
    /// sector, but none of its active contracts reference it (e.g. after a
    /// migration moved the shard elsewhere).
    pub fn stale_host_sectors(&self) -> Result<HashMap<PublicKey, Vec<Hash256>>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT h.public_key, sec.root
             FROM host_sectors hs
             INNER JOIN hosts h ON h.id = hs.host_id
             INNER JOIN sectors sec ON sec.id = hs.sector_id
             WHERE NOT EXISTS (
                 SELECT 1 FROM contract_sectors cs
                 INNER JOIN contracts c ON c.id = cs.contract_id
                 WHERE cs.sector_id = hs.sector_id AND c.host_id = hs.host_id
             )",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut by_host: HashMap<PublicKey, Vec<Hash256>> = HashMap::new();
        for row in rows {
            let (hk, root) = row?;
            let (Some(hk), Some(root)) = (PublicKey::from_slice(&hk), Hash256::from_slice(&root))
            else {
                continue;
            };
            by_host.entry(hk).or_default().push(root);
        }
        Ok(by_host)
    }

    pub fn delete_stale_host_sectors(&self) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM host_sectors
             WHERE NOT EXISTS (
                 SELECT 1 FROM contract_sectors cs
                 INNER JOIN contracts c ON c.id = cs.contract_id
                 WHERE cs.sector_id = host_sectors.sector_id
                     AND c.host_id = host_sectors.host_id
             )",
            [],
        )?;
        Ok(deleted)
    }

    /// Remove sector rows that no shard references. Referenced sectors are
    /// never touched.
    pub fn delete_prunable_sectors(&self) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM sectors WHERE NOT EXISTS
                 (SELECT 1 FROM shards sh WHERE sh.sector_id = sectors.id)",
            [],
        )?;
        Ok(deleted)
    }
}

pub(crate) fn bucket_id(tx: &Transaction<'_>, name: &str) -> Result<i64> {
    tx.query_row(
        "SELECT id FROM buckets WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| RentError::NotFound(format!("bucket '{name}'")))
}

fn slab_id_by_key(tx: &Transaction<'_>, key: &EncryptionKey) -> Result<i64> {
    tx.query_row(
        "SELECT id FROM slabs WHERE key = ?1",
        params![key.to_string()],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| RentError::NotFound(format!("slab '{key}'")))
}

/// Find or create the slab row for a slab value.
pub(crate) fn upsert_slab(tx: &Transaction<'_>, slab: &Slab) -> Result<i64> {
    if let Some(id) = tx
        .query_row(
            "SELECT id FROM slabs WHERE key = ?1",
            params![slab.key.to_string()],
            |row| row.get(0),
        )
        .optional()?
    {
        return Ok(id);
    }
    tx.execute(
        "INSERT INTO slabs (key, min_shards, total_shards) VALUES (?1, ?2, ?3)",
        params![
            slab.key.to_string(),
            slab.min_shards,
            slab.shards.len() as i64
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Upsert sectors for each shard position and refresh the contract/host
/// join tables. Used by object writes, slab updates, and packed uploads.
pub(crate) fn insert_shards(
    tx: &Transaction<'_>,
    slab_id: i64,
    shards: &[Sector],
    used_contracts: &HashMap<PublicKey, FileContractId>,
) -> Result<()> {
    for (i, shard) in shards.iter().enumerate() {
        tx.execute(
            "INSERT INTO sectors (root, latest_host) VALUES (?1, ?2)
             ON CONFLICT(root) DO UPDATE SET latest_host = excluded.latest_host",
            params![shard.root.as_bytes().as_slice(), shard.host.as_bytes().as_slice()],
        )?;
        let sector_id: i64 = tx.query_row(
            "SELECT id FROM sectors WHERE root = ?1",
            params![shard.root.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO shards (slab_id, slab_index, sector_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(slab_id, slab_index) DO UPDATE SET sector_id = excluded.sector_id",
            params![slab_id, i as i64, sector_id],
        )?;

        if let Some(fcid) = used_contracts.get(&shard.host) {
            let contract_id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM contracts WHERE fcid = ?1",
                    params![fcid.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(contract_id) = contract_id {
                tx.execute(
                    "INSERT OR IGNORE INTO contract_sectors (contract_id, sector_id)
                     VALUES (?1, ?2)",
                    params![contract_id, sector_id],
                )?;
            }
        }
        let host_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM hosts WHERE public_key = ?1",
                params![shard.host.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(host_id) = host_id {
            tx.execute(
                "INSERT OR IGNORE INTO host_sectors (host_id, sector_id) VALUES (?1, ?2)",
                params![host_id, sector_id],
            )?;
        }
    }
    Ok(())
}

fn load_slab(tx: &Transaction<'_>, slab_id: i64) -> Result<Slab> {
    let (key, min_shards, total_shards): (String, u8, u8) = tx.query_row(
        "SELECT key, min_shards, total_shards FROM slabs WHERE id = ?1",
        params![slab_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    let mut shards = vec![
        Sector {
            host: PublicKey::default(),
            root: Hash256::default(),
        };
        total_shards as usize
    ];
    let mut stmt = tx.prepare(
        "SELECT sh.slab_index, sec.root, sec.latest_host
         FROM shards sh INNER JOIN sectors sec ON sec.id = sh.sector_id
         WHERE sh.slab_id = ?1 ORDER BY sh.slab_index ASC",
    )?;
    let rows = stmt.query_map(params![slab_id], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, Vec<u8>>(2)?,
        ))
    })?;
    let mut hydrated = 0usize;
    for row in rows {
        let (idx, root, host) = row?;
        let idx = idx as usize;
        if idx < shards.len() {
            shards[idx] = Sector {
                host: PublicKey::from_slice(&host).unwrap_or_default(),
                root: Hash256::from_slice(&root).unwrap_or_default(),
            };
            hydrated += 1;
        }
    }
    if hydrated == 0 {
        // a buffered slab has no shards yet
        shards.clear();
    }
    Ok(Slab {
        key: key.parse()?,
        min_shards,
        shards,
    })
}
