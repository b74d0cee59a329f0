//! Header-chain validation rules, one variant per network family

use crate::constants::*;
use crate::error::ValidationError;
use crate::params::{NetworkParams, ValidatorKind};
use crate::pow::{check_proof_of_work, next_work_required, U256};
use crate::types::{hash_to_hex, Block, Hash};

/// Read access to the local chain needed by the difficulty rules.
pub trait BlockLookup {
    fn block_by_hash(&self, hash: &Hash) -> Option<Block>;
    fn block_by_height(&self, height: u32) -> Option<Block>;
}

#[derive(Debug, Clone)]
pub struct BlockValidator {
    kind: ValidatorKind,
    max_target_bits: u32,
}

impl BlockValidator {
    pub fn new(params: &NetworkParams) -> Self {
        BlockValidator {
            kind: params.validator,
            max_target_bits: params.max_target_bits,
        }
    }

    pub fn with_kind(kind: ValidatorKind, max_target_bits: u32) -> Self {
        BlockValidator { kind, max_target_bits }
    }

    pub fn kind(&self) -> ValidatorKind {
        self.kind
    }

    /// Whether `height` starts a new difficulty interval.
    pub fn is_difficulty_transition(height: u32) -> bool {
        height % DIFFICULTY_ADJUSTMENT_INTERVAL == 0
    }

    /// Validate: Block × Block × chain → ok | ValidationError
    ///
    /// 1. The block links to `previous` by hash and height
    /// 2. Difficulty bits follow the network rule
    /// 3. The header hash meets its own target (legacy and testnet only)
    pub fn validate(&self, block: &Block, previous: &Block, chain: &dyn BlockLookup) -> Result<(), ValidationError> {
        self.check_linkage(block, previous)?;
        match self.kind {
            ValidatorKind::Relaxed => Ok(()),
            ValidatorKind::CheckpointOnly => {
                let target = U256::from_compact(block.header.bits())?;
                if target > U256::from_compact(self.max_target_bits)? {
                    return Err(ValidationError::TargetTooLarge(block.header.bits()));
                }
                Ok(())
            }
            ValidatorKind::Legacy | ValidatorKind::Testnet => {
                self.check_difficulty(block, previous, chain)?;
                check_proof_of_work(block.hash(), block.header.bits(), self.max_target_bits)
            }
        }
    }

    pub fn check_linkage(&self, block: &Block, previous: &Block) -> Result<(), ValidationError> {
        if block.prev_hash() != previous.hash() || block.height != previous.height + 1 {
            return Err(ValidationError::NoPreviousBlock(hash_to_hex(block.prev_hash())));
        }
        Ok(())
    }

    /// Expected bits for `block` given its predecessor.
    pub fn check_difficulty(&self, block: &Block, previous: &Block, chain: &dyn BlockLookup) -> Result<(), ValidationError> {
        let actual = block.header.bits();
        let expected = if Self::is_difficulty_transition(block.height) {
            let start_height = block.height - DIFFICULTY_ADJUSTMENT_INTERVAL;
            let interval_start = chain
                .block_by_height(start_height)
                .ok_or(ValidationError::NoIntervalStart(start_height))?;
            let timespan = previous.header.timestamp() as i64 - interval_start.header.timestamp() as i64;
            next_work_required(previous.header.bits(), timespan, self.max_target_bits)?
        } else if self.kind == ValidatorKind::Testnet {
            let min_difficulty_allowed =
                block.header.timestamp() as u64 > previous.header.timestamp() as u64 + 2 * TARGET_TIME_PER_BLOCK as u64;
            if min_difficulty_allowed && actual == self.max_target_bits {
                return Ok(());
            }
            self.last_non_min_difficulty_bits(previous, chain)
        } else {
            previous.header.bits()
        };

        if expected != actual {
            return Err(ValidationError::NotDifficultyTransitionEqualBits { expected, actual });
        }
        Ok(())
    }

    /// Walk back over minimum-difficulty blocks within the current interval.
    fn last_non_min_difficulty_bits(&self, previous: &Block, chain: &dyn BlockLookup) -> u32 {
        let mut cursor = previous.clone();
        while cursor.header.bits() == self.max_target_bits && !Self::is_difficulty_transition(cursor.height) {
            match chain.block_by_hash(cursor.prev_hash()) {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        cursor.header.bits()
    }
}
