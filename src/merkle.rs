//! Merkle roots and partial merkle trees (BIP37)

use crate::crypto::double_sha256;
use crate::error::ValidationError;
use crate::network::MerkleBlockMessage;
use crate::types::{Hash, MerkleBlock};

fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left);
    data[32..].copy_from_slice(right);
    double_sha256(&data)
}

/// Merkle root of a full list of hashes; the last one is duplicated on odd levels.
pub fn merkle_root(hashes: &[Hash]) -> Option<Hash> {
    if hashes.is_empty() {
        return None;
    }
    let mut level = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], pair.get(1).unwrap_or(&pair[0])))
            .collect();
    }
    Some(level[0])
}

/// Hashes and flag bits describing the pruned tree a peer sends in a merkleblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMerkleTree {
    pub total_transactions: u32,
    pub hashes: Vec<Hash>,
    pub flags: Vec<u8>,
}

fn tree_width(total: u32, height: u32) -> u32 {
    ((total as u64 + (1u64 << height) - 1) >> height) as u32
}

fn tree_height(total: u32) -> u32 {
    let mut height = 0;
    while tree_width(total, height) > 1 {
        height += 1;
    }
    height
}

struct Extraction<'a> {
    tree: &'a PartialMerkleTree,
    bits_used: usize,
    hashes_used: usize,
    matched: Vec<Hash>,
}

impl Extraction<'_> {
    fn next_bit(&mut self) -> Result<bool, ValidationError> {
        let index = self.bits_used;
        let byte = self
            .tree
            .flags
            .get(index / 8)
            .ok_or_else(|| ValidationError::InvalidPartialMerkleTree("ran out of flag bits".into()))?;
        self.bits_used += 1;
        Ok(byte & (1 << (index % 8)) != 0)
    }

    fn next_hash(&mut self) -> Result<Hash, ValidationError> {
        let hash = self
            .tree
            .hashes
            .get(self.hashes_used)
            .ok_or_else(|| ValidationError::InvalidPartialMerkleTree("ran out of hashes".into()))?;
        self.hashes_used += 1;
        Ok(*hash)
    }

    fn traverse(&mut self, height: u32, position: u32) -> Result<Hash, ValidationError> {
        let parent_of_match = self.next_bit()?;
        if height == 0 || !parent_of_match {
            let hash = self.next_hash()?;
            if height == 0 && parent_of_match {
                self.matched.push(hash);
            }
            return Ok(hash);
        }

        let left = self.traverse(height - 1, position * 2)?;
        let right = if position * 2 + 1 < tree_width(self.tree.total_transactions, height - 1) {
            let right = self.traverse(height - 1, position * 2 + 1)?;
            // Identical siblings would allow forged duplicate-transaction trees
            if right == left {
                return Err(ValidationError::InvalidPartialMerkleTree("duplicate sibling hash".into()));
            }
            right
        } else {
            left
        };
        Ok(hash_pair(&left, &right))
    }
}

impl PartialMerkleTree {
    pub fn new(total_transactions: u32, hashes: Vec<Hash>, flags: Vec<u8>) -> Self {
        PartialMerkleTree {
            total_transactions,
            hashes,
            flags,
        }
    }

    /// Build the pruned tree for `txids`, keeping the leaves flagged in `matches`.
    pub fn from_transactions(txids: &[Hash], matches: &[bool]) -> Self {
        let total = txids.len() as u32;
        let mut bits = Vec::new();
        let mut hashes = Vec::new();
        if total > 0 {
            build(txids, matches, tree_height(total), 0, &mut bits, &mut hashes);
        }
        let mut flags = vec![0u8; bits.len().div_ceil(8)];
        for (index, bit) in bits.iter().enumerate() {
            if *bit {
                flags[index / 8] |= 1 << (index % 8);
            }
        }
        PartialMerkleTree {
            total_transactions: total,
            hashes,
            flags,
        }
    }

    /// ExtractMatches: PartialMerkleTree → (root, matched hashes)
    ///
    /// 1. Reject empty trees and trees with more hashes than transactions
    /// 2. Depth-first walk consuming one flag bit per node
    /// 3. Every hash and every flag byte must be consumed
    pub fn extract_matches(&self) -> Result<(Hash, Vec<Hash>), ValidationError> {
        if self.total_transactions == 0 {
            return Err(ValidationError::InvalidPartialMerkleTree("no transactions".into()));
        }
        if self.hashes.len() > self.total_transactions as usize {
            return Err(ValidationError::InvalidPartialMerkleTree("more hashes than transactions".into()));
        }
        if self.flags.len() * 8 < self.hashes.len() {
            return Err(ValidationError::InvalidPartialMerkleTree("fewer flag bits than hashes".into()));
        }

        let mut extraction = Extraction {
            tree: self,
            bits_used: 0,
            hashes_used: 0,
            matched: Vec::new(),
        };
        let root = extraction.traverse(tree_height(self.total_transactions), 0)?;

        if extraction.hashes_used != self.hashes.len() {
            return Err(ValidationError::InvalidPartialMerkleTree("unused hashes".into()));
        }
        if extraction.bits_used.div_ceil(8) != self.flags.len() {
            return Err(ValidationError::InvalidPartialMerkleTree("unused flag bytes".into()));
        }
        Ok((root, extraction.matched))
    }
}

fn subtree_hash(txids: &[Hash], height: u32, position: u32) -> Hash {
    if height == 0 {
        return txids[position as usize];
    }
    let left = subtree_hash(txids, height - 1, position * 2);
    let right = if position * 2 + 1 < tree_width(txids.len() as u32, height - 1) {
        subtree_hash(txids, height - 1, position * 2 + 1)
    } else {
        left
    };
    hash_pair(&left, &right)
}

fn build(txids: &[Hash], matches: &[bool], height: u32, position: u32, bits: &mut Vec<bool>, hashes: &mut Vec<Hash>) {
    let start = (position as usize) << height;
    let end = (((position as usize) + 1) << height).min(txids.len());
    let parent_of_match = (start..end).any(|i| matches.get(i).copied().unwrap_or(false));
    bits.push(parent_of_match);
    if height == 0 || !parent_of_match {
        hashes.push(subtree_hash(txids, height, position));
        return;
    }
    build(txids, matches, height - 1, position * 2, bits, hashes);
    if position * 2 + 1 < tree_width(txids.len() as u32, height - 1) {
        build(txids, matches, height - 1, position * 2 + 1, bits, hashes);
    }
}

/// Check a received merkleblock and turn it into a `MerkleBlock` awaiting its transactions.
pub fn validate_merkle_block(message: &MerkleBlockMessage) -> Result<MerkleBlock, ValidationError> {
    let tree = PartialMerkleTree::new(message.total_transactions, message.hashes.clone(), message.flags.clone());
    let (root, matched) = tree.extract_matches()?;
    if &root != message.header.merkle_root() {
        return Err(ValidationError::WrongMerkleRoot);
    }
    Ok(MerkleBlock::new(message.header.clone(), matched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HeaderHasher;
    use crate::types::Header;
    use proptest::prelude::*;

    fn txids(count: u8) -> Vec<Hash> {
        (0..count).map(|i| double_sha256(&[i])).collect()
    }

    #[test]
    fn test_merkle_root_single_and_pair() {
        let ids = txids(2);
        assert_eq!(merkle_root(&ids[..1]), Some(ids[0]));
        assert_eq!(merkle_root(&ids), Some(hash_pair(&ids[0], &ids[1])));
        assert_eq!(merkle_root(&[]), None);
    }

    #[test]
    fn test_merkle_root_odd_count_duplicates_last() {
        let ids = txids(3);
        let expected = hash_pair(&hash_pair(&ids[0], &ids[1]), &hash_pair(&ids[2], &ids[2]));
        assert_eq!(merkle_root(&ids), Some(expected));
    }

    #[test]
    fn test_partial_tree_extracts_matches_and_root() {
        let ids = txids(7);
        let matches = [false, true, false, false, true, false, false];
        let tree = PartialMerkleTree::from_transactions(&ids, &matches);
        let (root, matched) = tree.extract_matches().unwrap();
        assert_eq!(Some(root), merkle_root(&ids));
        assert_eq!(matched, vec![ids[1], ids[4]]);
    }

    #[test]
    fn test_partial_tree_without_matches_is_root_only() {
        let ids = txids(4);
        let tree = PartialMerkleTree::from_transactions(&ids, &[false; 4]);
        assert_eq!(tree.hashes.len(), 1);
        let (root, matched) = tree.extract_matches().unwrap();
        assert_eq!(Some(root), merkle_root(&ids));
        assert!(matched.is_empty());
    }

    #[test]
    fn test_partial_tree_rejects_extra_hash() {
        let ids = txids(4);
        let mut tree = PartialMerkleTree::from_transactions(&ids, &[true, false, false, false]);
        tree.hashes.push([9; 32]);
        assert!(tree.extract_matches().is_err());
    }

    #[test]
    fn test_partial_tree_rejects_empty() {
        let tree = PartialMerkleTree::new(0, vec![], vec![]);
        assert!(tree.extract_matches().is_err());
    }

    #[test]
    fn test_validate_merkle_block_checks_header_root() {
        let hasher = HeaderHasher::double_sha256();
        let ids = txids(3);
        let tree = PartialMerkleTree::from_transactions(&ids, &[false, false, true]);
        let root = merkle_root(&ids).unwrap();

        let good = MerkleBlockMessage {
            header: Header::new(1, [0; 32], root, 0, 0x207fffff, 0, &hasher),
            total_transactions: 3,
            hashes: tree.hashes.clone(),
            flags: tree.flags.clone(),
        };
        let merkle_block = validate_merkle_block(&good).unwrap();
        assert_eq!(merkle_block.matched_hashes, vec![ids[2]]);

        let bad = MerkleBlockMessage {
            header: Header::new(1, [0; 32], [1; 32], 0, 0x207fffff, 0, &hasher),
            ..good
        };
        assert_eq!(validate_merkle_block(&bad), Err(ValidationError::WrongMerkleRoot));
    }

    proptest! {
        #[test]
        fn prop_partial_tree_round_trips_matches(matches in proptest::collection::vec(any::<bool>(), 1..40)) {
            let ids: Vec<Hash> = (0..matches.len() as u32).map(|i| double_sha256(&i.to_le_bytes())).collect();
            let tree = PartialMerkleTree::from_transactions(&ids, &matches);
            let (root, matched) = tree.extract_matches().unwrap();
            prop_assert_eq!(Some(root), merkle_root(&ids));
            let expected: Vec<Hash> = ids
                .iter()
                .zip(&matches)
                .filter(|(_, matched)| **matched)
                .map(|(id, _)| *id)
                .collect();
            prop_assert_eq!(matched, expected);
        }
    }
}
