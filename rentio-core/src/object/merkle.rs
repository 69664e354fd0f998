//! Sector merkle trees over 64-byte leaves, with range proofs.
//!
//! A sector always holds exactly `LEAVES_PER_SECTOR` leaves, so the tree is
//! perfect. Leaf and interior hashes are domain-separated by a prefix byte.

use crate::types::{Hash256, LEAF_SIZE, LEAVES_PER_SECTOR, SECTOR_SIZE};
use sha2::{Digest, Sha256};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

fn leaf_hash(leaf: &[u8]) -> Hash256 {
    let mut h = Sha256::new();
    h.update([LEAF_PREFIX]);
    h.update(leaf);
    Hash256(h.finalize().into())
}

fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut h = Sha256::new();
    h.update([NODE_PREFIX]);
    h.update(left.0);
    h.update(right.0);
    Hash256(h.finalize().into())
}

/// Accumulates subtree roots, merging equal-height neighbors. The canonical
/// left-to-right subtree decomposition of a perfect tree collapses to a
/// single root.
struct ProofAccumulator {
    stack: Vec<(Hash256, u32)>,
}

impl ProofAccumulator {
    fn new() -> Self {
        Self { stack: Vec::new() }
    }

    fn push(&mut self, hash: Hash256, height: u32) {
        let mut hash = hash;
        let mut height = height;
        while let Some(&(top, top_height)) = self.stack.last() {
            if top_height != height {
                break;
            }
            self.stack.pop();
            hash = node_hash(&top, &hash);
            height += 1;
        }
        self.stack.push((hash, height));
    }

    fn root(mut self) -> Option<Hash256> {
        let (root, _) = self.stack.pop()?;
        if self.stack.is_empty() {
            Some(root)
        } else {
            None
        }
    }
}

/// Compute the merkle root of a full sector.
pub fn sector_root(sector: &[u8]) -> Hash256 {
    assert_eq!(sector.len(), SECTOR_SIZE, "sector must be exactly 4 MiB");
    let mut acc = ProofAccumulator::new();
    for leaf in sector.chunks(LEAF_SIZE) {
        acc.push(leaf_hash(leaf), 0);
    }
    acc.root().expect("perfect tree collapses to one root")
}

/// Root of the subtree covering leaves `[start, end)`, where the range is a
/// properly aligned power-of-two block.
fn subtree_root(sector: &[u8], start: usize, end: usize) -> Hash256 {
    let mut acc = ProofAccumulator::new();
    for i in start..end {
        acc.push(leaf_hash(&sector[i * LEAF_SIZE..(i + 1) * LEAF_SIZE]), 0);
    }
    acc.root().expect("aligned range collapses to one root")
}

/// Size of the largest aligned subtree starting at `start` that does not
/// extend past `end`.
fn next_subtree_size(start: usize, end: usize) -> usize {
    let ideal = if start == 0 {
        usize::BITS - 1
    } else {
        start.trailing_zeros()
    };
    let max = (usize::BITS - ((end - start).leading_zeros())) - 1;
    1 << ideal.min(max)
}

/// Build a range proof for the leaves `[start, end)` of a sector.
pub fn build_range_proof(sector: &[u8], start: usize, end: usize) -> Vec<Hash256> {
    assert!(start < end && end <= LEAVES_PER_SECTOR);
    let mut proof = Vec::new();
    let mut i = 0;
    while i < start {
        let subtree = next_subtree_size(i, start);
        proof.push(subtree_root(sector, i, i + subtree));
        i += subtree;
    }
    i = end;
    while i < LEAVES_PER_SECTOR {
        let subtree = next_subtree_size(i, LEAVES_PER_SECTOR);
        proof.push(subtree_root(sector, i, i + subtree));
        i += subtree;
    }
    proof
}

/// Verify that `data` matches the leaves `[start, end)` of the sector with
/// the given root. `data` must be exactly `(end - start) * LEAF_SIZE` bytes.
pub fn verify_range_proof(
    data: &[u8],
    proof: &[Hash256],
    start: usize,
    end: usize,
    root: &Hash256,
) -> bool {
    if start >= end || end > LEAVES_PER_SECTOR {
        return false;
    }
    if data.len() != (end - start) * LEAF_SIZE {
        return false;
    }

    let mut acc = ProofAccumulator::new();
    let mut proof_iter = proof.iter();

    let mut i = 0;
    while i < start {
        let subtree = next_subtree_size(i, start);
        let Some(h) = proof_iter.next() else {
            return false;
        };
        acc.push(*h, subtree.trailing_zeros());
        i += subtree;
    }
    for leaf in data.chunks(LEAF_SIZE) {
        acc.push(leaf_hash(leaf), 0);
    }
    i = end;
    while i < LEAVES_PER_SECTOR {
        let subtree = next_subtree_size(i, LEAVES_PER_SECTOR);
        let Some(h) = proof_iter.next() else {
            return false;
        };
        acc.push(*h, subtree.trailing_zeros());
        i += subtree;
    }
    if proof_iter.next().is_some() {
        return false;
    }

    acc.root().map(|r| r == *root).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_sector() -> Vec<u8> {
        let mut sector = vec![0u8; SECTOR_SIZE];
        rand::thread_rng().fill_bytes(&mut sector);
        sector
    }

    #[test]
    fn test_sector_root_deterministic() {
        let sector = random_sector();
        assert_eq!(sector_root(&sector), sector_root(&sector));

        let mut tampered = sector.clone();
        tampered[0] ^= 1;
        assert_ne!(sector_root(&sector), sector_root(&tampered));
    }

    #[test]
    fn test_range_proof_round_trip() {
        let sector = random_sector();
        let root = sector_root(&sector);

        for (start, end) in [(0, 1), (0, LEAVES_PER_SECTOR), (7, 133), (1024, 2048)] {
            let proof = build_range_proof(&sector, start, end);
            let data = &sector[start * LEAF_SIZE..end * LEAF_SIZE];
            assert!(
                verify_range_proof(data, &proof, start, end, &root),
                "range [{start}, {end}) failed to verify"
            );
        }
    }

    #[test]
    fn test_range_proof_rejects_tampered_data() {
        let sector = random_sector();
        let root = sector_root(&sector);
        let proof = build_range_proof(&sector, 10, 20);
        let mut data = sector[10 * LEAF_SIZE..20 * LEAF_SIZE].to_vec();
        data[5] ^= 0xff;
        assert!(!verify_range_proof(&data, &proof, 10, 20, &root));
    }

    #[test]
    fn test_range_proof_rejects_wrong_range() {
        let sector = random_sector();
        let root = sector_root(&sector);
        let proof = build_range_proof(&sector, 10, 20);
        let data = &sector[10 * LEAF_SIZE..20 * LEAF_SIZE];
        assert!(!verify_range_proof(data, &proof, 11, 21, &root));
    }
}
