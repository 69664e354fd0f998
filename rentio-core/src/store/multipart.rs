//! Multipart uploads: parts accumulate slab slices, completion converts
//! them into an object in ascending part order.

use super::objects::{bucket_id, insert_shards, upsert_slab};
use super::MetadataStore;
use crate::error::{RentError, Result};
use crate::object::{EncryptionKey, SlabSlice};
use crate::types::{FileContractId, PublicKey};
use chrono::Utc;
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub bucket: String,
    pub path: String,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartPart {
    pub part_number: i64,
    pub etag: String,
    pub size: u64,
}

/// A part as named by the client on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: i64,
    pub etag: String,
}

impl MetadataStore {
    /// Start a multipart upload; the id is 32 bytes of entropy, hex-encoded.
    pub fn create_multipart_upload(
        &self,
        bucket: &str,
        path: &str,
        key: &EncryptionKey,
    ) -> Result<String> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let bucket_id = bucket_id(&tx, bucket)?;
        let mut entropy = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut entropy);
        let upload_id = hex::encode(entropy);
        tx.execute(
            "INSERT INTO multipart_uploads (upload_id, bucket_id, path, key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                upload_id,
                bucket_id,
                path,
                key.to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(upload_id)
    }

    /// Record a part. Re-uploading a part number replaces the previous data.
    pub fn add_multipart_part(
        &self,
        bucket: &str,
        path: &str,
        upload_id: &str,
        part_number: i64,
        etag: &str,
        slices: &[SlabSlice],
        used_contracts: &HashMap<PublicKey, FileContractId>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let upload_row = lookup_upload(&tx, bucket, path, upload_id)?;

        tx.execute(
            "DELETE FROM multipart_parts WHERE upload_id = ?1 AND part_number = ?2",
            params![upload_row, part_number],
        )?;
        let size: u64 = slices.iter().map(|s| s.length as u64).sum();
        tx.execute(
            "INSERT INTO multipart_parts (upload_id, part_number, etag, size)
             VALUES (?1, ?2, ?3, ?4)",
            params![upload_row, part_number, etag, size as i64],
        )?;
        let part_id = tx.last_insert_rowid();

        for (i, ss) in slices.iter().enumerate() {
            let slab_id = upsert_slab(&tx, &ss.slab)?;
            tx.execute(
                "INSERT INTO slices (multipart_part_id, slab_id, slice_index, offset, length)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![part_id, slab_id, i as i64, ss.offset, ss.length],
            )?;
            insert_shards(&tx, slab_id, &ss.slab.shards, used_contracts)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn multipart_upload(&self, upload_id: &str) -> Result<MultipartUpload> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT mu.upload_id, b.name, mu.path, mu.created_at
             FROM multipart_uploads mu INNER JOIN buckets b ON b.id = mu.bucket_id
             WHERE mu.upload_id = ?1",
            params![upload_id],
            |row| {
                let created: String = row.get(3)?;
                Ok(MultipartUpload {
                    upload_id: row.get(0)?,
                    bucket: row.get(1)?,
                    path: row.get(2)?,
                    created_at: chrono::DateTime::parse_from_rfc3339(&created)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            },
        )
        .optional()?
        .ok_or_else(|| RentError::NotFound(format!("multipart upload '{upload_id}'")))
    }

    pub fn multipart_parts(&self, upload_id: &str) -> Result<Vec<MultipartPart>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let upload_row: i64 = tx
            .query_row(
                "SELECT id FROM multipart_uploads WHERE upload_id = ?1",
                params![upload_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RentError::NotFound(format!("multipart upload '{upload_id}'")))?;
        let mut stmt = tx.prepare(
            "SELECT part_number, etag, size FROM multipart_parts
             WHERE upload_id = ?1 ORDER BY part_number ASC",
        )?;
        let rows = stmt.query_map(params![upload_row], |row| {
            Ok(MultipartPart {
                part_number: row.get(0)?,
                etag: row.get(1)?,
                size: row.get::<_, i64>(2)? as u64,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Drop an upload and everything it buffered.
    pub fn abort_multipart_upload(
        &self,
        bucket: &str,
        path: &str,
        upload_id: &str,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let upload_row = lookup_upload(&tx, bucket, path, upload_id)?;
        tx.execute(
            "DELETE FROM multipart_uploads WHERE id = ?1",
            params![upload_row],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Atomically convert the named parts into the destination object. Parts
    /// must be strictly ascending; the object etag is the SHA256 of the
    /// concatenated part etags.
    pub fn complete_multipart_upload(
        &self,
        bucket: &str,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<String> {
        for pair in parts.windows(2) {
            if pair[0].part_number >= pair[1].part_number {
                return Err(RentError::PreconditionFailed(format!(
                    "parts are not strictly ascending at {}",
                    pair[1].part_number
                )));
            }
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let upload_row = lookup_upload(&tx, bucket, path, upload_id)?;
        let (bucket_row, key): (i64, String) = tx.query_row(
            "SELECT bucket_id, key FROM multipart_uploads WHERE id = ?1",
            params![upload_row],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut hasher = Sha256::new();
        let mut size: i64 = 0;
        let mut part_ids = Vec::with_capacity(parts.len());
        for part in parts {
            let row: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT id, size FROM multipart_parts
                     WHERE upload_id = ?1 AND part_number = ?2 AND etag = ?3",
                    params![upload_row, part.part_number, part.etag],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((part_id, part_size)) = row else {
                return Err(RentError::NotFound(format!(
                    "part {} with etag '{}'",
                    part.part_number, part.etag
                )));
            };
            hasher.update(part.etag.as_bytes());
            size += part_size;
            part_ids.push(part_id);
        }
        let etag = hex::encode(hasher.finalize());

        tx.execute(
            "DELETE FROM objects WHERE bucket_id = ?1 AND path = ?2",
            params![bucket_row, path],
        )?;
        tx.execute(
            "INSERT INTO objects (bucket_id, path, key, size, etag, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                bucket_row,
                path,
                key,
                size,
                etag,
                Utc::now().to_rfc3339()
            ],
        )?;
        let object_id = tx.last_insert_rowid();

        // re-point the parts' slices at the object, preserving part order
        let mut slice_index: i64 = 0;
        for part_id in part_ids {
            let mut stmt = tx.prepare(
                "SELECT id FROM slices WHERE multipart_part_id = ?1 ORDER BY slice_index ASC",
            )?;
            let slice_ids: Vec<i64> = stmt
                .query_map(params![part_id], |row| row.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            drop(stmt);
            for slice_id in slice_ids {
                tx.execute(
                    "UPDATE slices SET object_id = ?1, multipart_part_id = NULL,
                         slice_index = ?2
                     WHERE id = ?3",
                    params![object_id, slice_index, slice_id],
                )?;
                slice_index += 1;
            }
        }

        tx.execute(
            "DELETE FROM multipart_uploads WHERE id = ?1",
            params![upload_row],
        )?;
        tx.commit()?;
        Ok(etag)
    }
}

fn lookup_upload(
    tx: &rusqlite::Transaction<'_>,
    bucket: &str,
    path: &str,
    upload_id: &str,
) -> Result<i64> {
    let row: Option<(i64, String, i64)> = tx
        .query_row(
            "SELECT id, path, bucket_id FROM multipart_uploads WHERE upload_id = ?1",
            params![upload_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((id, stored_path, stored_bucket)) = row else {
        return Err(RentError::NotFound(format!(
            "multipart upload '{upload_id}'"
        )));
    };
    if stored_path != path {
        return Err(RentError::PreconditionFailed(format!(
            "object id mismatch: '{stored_path}' != '{path}'"
        )));
    }
    let expected_bucket = bucket_id(tx, bucket)?;
    if stored_bucket != expected_bucket {
        return Err(RentError::PreconditionFailed(format!(
            "bucket mismatch for upload '{upload_id}'"
        )));
    }
    Ok(id)
}
