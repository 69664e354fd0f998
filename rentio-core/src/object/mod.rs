//! The slab-based object model and sector codec.
//!
//! An object is an ordered list of slab slices. Each slab stripes its data
//! across `min_shards` data shards in 64-byte leaves, extends them with
//! parity shards via Reed-Solomon over GF(2^8), and encrypts every shard
//! with an XChaCha20 keystream derived from the slab key and shard index.
//! Integrity comes from the sector merkle root, not the cipher.

pub mod merkle;

use crate::error::{RentError, Result};
use crate::types::{Hash256, PublicKey, LEAF_SIZE, SECTOR_SIZE};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::XChaCha20;
use rand::RngCore;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Symmetric key encrypting one slab (or one object's metadata).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut entropy = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut entropy);
        Self(entropy)
    }

    pub fn from_entropy(entropy: [u8; 32]) -> Self {
        Self(entropy)
    }

    pub fn entropy(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{}", hex::encode(self.0))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key:{}", hex::encode(&self.0[..4]))
    }
}

impl FromStr for EncryptionKey {
    type Err = RentError;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix("key:")
            .ok_or_else(|| RentError::InvalidRequest(format!("malformed key '{s}'")))?;
        let mut entropy = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut entropy)
            .map_err(|e| RentError::InvalidRequest(format!("malformed key '{s}': {e}")))?;
        Ok(Self(entropy))
    }
}

impl Serialize for EncryptionKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A shard's stored location: the sector root plus the host last known to
/// hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sector {
    pub host: PublicKey,
    pub root: Hash256,
}

/// Erasure-coding unit. `shards.len()` is the total shard count; any
/// `min_shards` of them recover the striped data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slab {
    pub key: EncryptionKey,
    pub min_shards: u8,
    pub shards: Vec<Sector>,
}

impl Slab {
    pub fn new(min_shards: u8, total_shards: u8) -> Self {
        Self {
            key: EncryptionKey::generate(),
            min_shards,
            shards: vec![
                Sector {
                    host: PublicKey::default(),
                    root: Hash256::default(),
                };
                total_shards as usize
            ],
        }
    }

    pub fn total_shards(&self) -> u8 {
        self.shards.len() as u8
    }

    /// Capacity of the striped data region in bytes.
    pub fn capacity(&self) -> usize {
        self.min_shards as usize * SECTOR_SIZE
    }

    /// Stripe `buf` across `min_shards` data shards and extend with parity.
    /// `buf` is padded with zeros up to capacity; returns `total` shards of
    /// exactly `SECTOR_SIZE` bytes each.
    pub fn encode(&self, buf: &[u8], total: u8) -> Result<Vec<Vec<u8>>> {
        let m = self.min_shards as usize;
        let n = total as usize;
        if m == 0 || m > n {
            return Err(RentError::InvalidRequest(format!(
                "invalid redundancy {m}-of-{n}"
            )));
        }
        if buf.len() > self.capacity() {
            return Err(RentError::InvalidRequest(format!(
                "buffer of {} bytes exceeds slab capacity {}",
                buf.len(),
                self.capacity()
            )));
        }

        let mut shards = vec![vec![0u8; SECTOR_SIZE]; n];
        striped_split(buf, &mut shards[..m]);
        if n > m {
            let rs = ReedSolomon::new(m, n - m)
                .map_err(|e| RentError::Internal(format!("reed-solomon init: {e:?}")))?;
            rs.encode(&mut shards)
                .map_err(|e| RentError::Internal(format!("reed-solomon encode: {e:?}")))?;
        }
        Ok(shards)
    }

    /// XOR each shard with its keystream. Encryption and decryption are the
    /// same operation.
    pub fn encrypt(&self, shards: &mut [Vec<u8>]) {
        self.xor_keystream(shards, 0)
    }

    /// Decrypt shards that were downloaded starting at `sector_offset`
    /// bytes into each sector.
    pub fn decrypt(&self, shards: &mut [Vec<u8>], sector_offset: usize) {
        self.xor_keystream(shards, sector_offset)
    }

    fn xor_keystream(&self, shards: &mut [Vec<u8>], offset: usize) {
        for (i, shard) in shards.iter_mut().enumerate() {
            if shard.is_empty() {
                continue;
            }
            self.xor_shard(i, shard, offset);
        }
    }

    /// Decrypt only the shards that were actually downloaded; indices are
    /// slab positions, so the keystreams line up with `encrypt`.
    pub fn decrypt_partial(&self, shards: &mut [Option<Vec<u8>>], sector_offset: usize) {
        for (i, shard) in shards.iter_mut().enumerate() {
            if let Some(shard) = shard {
                self.xor_shard(i, shard, sector_offset);
            }
        }
    }

    fn xor_shard(&self, index: usize, shard: &mut [u8], offset: usize) {
        let mut nonce = [0u8; 24];
        nonce[1] = index as u8;
        let mut cipher = XChaCha20::new(self.key.entropy().into(), (&nonce).into());
        cipher.seek(offset as u64);
        cipher.apply_keystream(shard);
    }

    /// Recover the missing shards in place. Present shards are `Some`,
    /// missing ones `None`; at least `min_shards` must be present.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let m = self.min_shards as usize;
        let n = shards.len();
        let present = shards.iter().filter(|s| s.is_some()).count();
        if present < m {
            return Err(RentError::Integrity(format!(
                "cannot reconstruct slab from {present} of {m} required shards"
            )));
        }
        if n == m {
            // no parity; all shards must already be present
            return Ok(());
        }
        let rs = ReedSolomon::new(m, n - m)
            .map_err(|e| RentError::Internal(format!("reed-solomon init: {e:?}")))?;
        rs.reconstruct(shards)
            .map_err(|e| RentError::Integrity(format!("reed-solomon reconstruct: {e:?}")))?;
        Ok(())
    }
}

/// An (offset, length) view into a slab's striped data, owned by an object
/// or multipart part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlabSlice {
    pub slab: Slab,
    pub offset: u32,
    pub length: u32,
}

impl SlabSlice {
    /// The leaf-aligned region of each sector that covers this slice.
    pub fn sector_region(&self) -> (u32, u32) {
        let min_chunk = self.slab.min_shards as u32 * LEAF_SIZE as u32;
        let start = (self.offset / min_chunk) * LEAF_SIZE as u32;
        let end = (self.offset + self.length).div_ceil(min_chunk) * LEAF_SIZE as u32;
        (start, end - start)
    }

    /// Write the slice's bytes to `out`, given the decrypted data shards
    /// covering `sector_region()`. Missing shards must have been
    /// reconstructed first.
    pub fn recover(&self, out: &mut Vec<u8>, shards: &[Option<Vec<u8>>]) -> Result<()> {
        let m = self.slab.min_shards as usize;
        let min_chunk = (m * LEAF_SIZE) as u32;
        let skip = (self.offset % min_chunk) as usize;
        let data: Vec<&[u8]> = shards[..m]
            .iter()
            .map(|s| {
                s.as_deref().ok_or_else(|| {
                    RentError::Integrity("data shard missing after reconstruction".into())
                })
            })
            .collect::<Result<_>>()?;
        striped_join(out, &data, skip, self.length as usize)
    }
}

/// An object: an encryption key plus ordered slab slices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Object {
    pub key: EncryptionKey,
    pub slabs: Vec<SlabSlice>,
}

impl Object {
    pub fn new() -> Self {
        Self {
            key: EncryptionKey::generate(),
            slabs: Vec::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.slabs.iter().map(|s| s.length as u64).sum()
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

/// Interleave `data` into the data shards in 64-byte leaves.
fn striped_split(data: &[u8], data_shards: &mut [Vec<u8>]) {
    let mut remaining = data;
    let mut off = 0;
    while !remaining.is_empty() {
        for shard in data_shards.iter_mut() {
            let take = remaining.len().min(LEAF_SIZE);
            shard[off..off + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if remaining.is_empty() {
                break;
            }
        }
        off += LEAF_SIZE;
    }
}

/// Inverse of `striped_split`: read `write_len` bytes from the interleaved
/// stream, skipping the first `skip` bytes.
fn striped_join(out: &mut Vec<u8>, data_shards: &[&[u8]], skip: usize, write_len: usize) -> Result<()> {
    let mut skip = skip;
    let mut remaining = write_len;
    let mut off = 0;
    while remaining > 0 {
        for shard in data_shards {
            if off + LEAF_SIZE > shard.len() {
                return Err(RentError::Integrity(
                    "insufficient shard data to recover slice".into(),
                ));
            }
            let mut chunk = &shard[off..off + LEAF_SIZE];
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            chunk = &chunk[skip..];
            skip = 0;
            let take = chunk.len().min(remaining);
            out.extend_from_slice(&chunk[..take]);
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
        off += LEAF_SIZE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let slab = Slab::new(2, 4);
        let data = random_bytes(1000);
        let mut shards = slab.encode(&data, 4).unwrap();
        let plain = shards.clone();

        slab.encrypt(&mut shards);
        assert_ne!(shards, plain);
        slab.encrypt(&mut shards);
        assert_eq!(shards, plain);
    }

    #[test]
    fn test_seeked_decrypt_matches_full_decrypt() {
        let slab = Slab::new(2, 3);
        let data = random_bytes(100_000);
        let mut shards = slab.encode(&data, 3).unwrap();
        let plain = shards.clone();
        slab.encrypt(&mut shards);

        // decrypt only a window starting at an aligned sector offset
        let offset = 4 * LEAF_SIZE;
        let mut windows: Vec<Vec<u8>> = shards
            .iter()
            .map(|s| s[offset..offset + 128].to_vec())
            .collect();
        slab.decrypt(&mut windows, offset);
        for (w, p) in windows.iter().zip(plain.iter()) {
            assert_eq!(w, &p[offset..offset + 128]);
        }
    }

    #[test]
    fn test_encode_erase_reconstruct() {
        for (m, n) in [(1u8, 1u8), (2, 4), (3, 5), (10, 30)] {
            let slab = Slab::new(m, n);
            let data = random_bytes(m as usize * 3 * LEAF_SIZE + 17);
            let shards = slab.encode(&data, n).unwrap();

            // erase any n-m shards (the trailing ones)
            let mut partial: Vec<Option<Vec<u8>>> =
                shards.iter().cloned().map(Some).collect();
            for s in partial.iter_mut().skip(m as usize) {
                *s = None;
            }
            slab.reconstruct(&mut partial).unwrap();
            for (orig, rec) in shards.iter().zip(partial.iter()) {
                assert_eq!(orig, rec.as_ref().unwrap());
            }
        }
    }

    #[test]
    fn test_reconstruct_fails_below_min_shards() {
        let slab = Slab::new(3, 5);
        let data = random_bytes(100);
        let shards = slab.encode(&data, 5).unwrap();
        let mut partial: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        partial[0] = None;
        partial[1] = None;
        partial[2] = None;
        assert!(matches!(
            slab.reconstruct(&mut partial),
            Err(RentError::Integrity(_))
        ));
    }

    #[test]
    fn test_slice_recover_exact_bytes() {
        let slab = Slab::new(2, 4);
        let data = random_bytes(50_000);
        let shards = slab.encode(&data, 4).unwrap();

        let slice = SlabSlice {
            slab: slab.clone(),
            offset: 1000,
            length: 20_000,
        };
        let (sec_off, sec_len) = slice.sector_region();
        assert_eq!(sec_off % LEAF_SIZE as u32, 0);

        // feed recover exactly the downloaded sector region of each shard
        let trimmed: Vec<Option<Vec<u8>>> = shards
            .iter()
            .map(|s| Some(s[sec_off as usize..(sec_off + sec_len) as usize].to_vec()))
            .collect();
        let mut out = Vec::new();
        slice.recover(&mut out, &trimmed).unwrap();
        assert_eq!(out, &data[1000..21_000]);
    }

    #[test]
    fn test_striped_split_join_identity() {
        let data = random_bytes(10 * LEAF_SIZE + 33);
        let mut shards = vec![vec![0u8; 6 * LEAF_SIZE]; 2];
        striped_split(&data, &mut shards);
        let refs: Vec<&[u8]> = shards.iter().map(|s| s.as_slice()).collect();
        let mut out = Vec::new();
        striped_join(&mut out, &refs, 0, data.len()).unwrap();
        assert_eq!(out, data);
    }
}
