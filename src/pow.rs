//! Compact difficulty targets, retargeting and proof-of-work checks

use crate::constants::*;
use crate::error::ValidationError;
use crate::types::Hash;

/// 256-bit unsigned integer for target arithmetic, little-endian limbs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U256([u64; 4]);

impl U256 {
    pub fn zero() -> Self {
        U256([0; 4])
    }

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }

        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }

        result
    }

    pub fn shr(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }

        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;

        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > word_shift {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }

        result
    }

    /// Multiply by a 64-bit factor; `None` on overflow.
    pub fn checked_mul_u64(&self, factor: u64) -> Option<Self> {
        let mut result = U256::zero();
        let mut carry: u128 = 0;
        for i in 0..4 {
            let product = self.0[i] as u128 * factor as u128 + carry;
            result.0[i] = product as u64;
            carry = product >> 64;
        }
        (carry == 0).then_some(result)
    }

    pub fn div_u64(&self, divisor: u64) -> Self {
        let mut result = U256::zero();
        let mut remainder: u128 = 0;
        for i in (0..4).rev() {
            let current = (remainder << 64) | self.0[i] as u128;
            result.0[i] = (current / divisor as u128) as u64;
            remainder = current % divisor as u128;
        }
        result
    }

    /// Interpret a hash (internal little-endian byte order) as a number.
    pub fn from_hash(hash: &Hash) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let mut limb = [0u8; 8];
            limb.copy_from_slice(&hash[i * 8..(i + 1) * 8]);
            *word = u64::from_le_bytes(limb);
        }
        U256(words)
    }

    /// DecodeCompact: bits → target
    ///
    /// The compact form is a 3-byte mantissa and a 1-byte base-256 exponent.
    /// Negative or overflowing encodings are rejected.
    pub fn from_compact(bits: u32) -> Result<Self, ValidationError> {
        let exponent = bits >> 24;
        let mantissa = bits & 0x007fffff;

        if bits & 0x00800000 != 0 && mantissa != 0 {
            return Err(ValidationError::InvalidCompactTarget(bits));
        }
        if exponent <= 3 {
            return Ok(U256::from_u64((mantissa >> (8 * (3 - exponent))) as u64));
        }
        let target = U256::from_u64(mantissa as u64).shl(8 * (exponent - 3));
        if target.shr(8 * (exponent - 3)) != U256::from_u64(mantissa as u64) {
            return Err(ValidationError::InvalidCompactTarget(bits));
        }
        Ok(target)
    }

    /// EncodeCompact: target → bits
    pub fn to_compact(&self) -> u32 {
        let mut size = self.bits().div_ceil(8);
        let mut compact = if size <= 3 {
            (self.0[0] << (8 * (3 - size))) as u32
        } else {
            self.shr(8 * (size - 3)).0[0] as u32
        };
        if compact & 0x00800000 != 0 {
            compact >>= 8;
            size += 1;
        }
        compact | (size << 24)
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                std::cmp::Ordering::Equal => continue,
                other => return other,
            }
        }
        std::cmp::Ordering::Equal
    }
}

/// NextWorkRequired: bits × timespan × maxBits → bits
///
/// 1. Clamp the actual timespan to [T/4, 4T] with T = two weeks
/// 2. newTarget = target(bits) × timespan / T
/// 3. Cap at the network maximum target and re-encode
pub fn next_work_required(last_bits: u32, actual_timespan: i64, max_target_bits: u32) -> Result<u32, ValidationError> {
    let target_timespan = TARGET_TIMESPAN as i64;
    let timespan = actual_timespan.clamp(target_timespan / 4, target_timespan * 4) as u64;

    let target = U256::from_compact(last_bits)?;
    let max_target = U256::from_compact(max_target_bits)?;
    let new_target = match target.checked_mul_u64(timespan) {
        Some(scaled) => scaled.div_u64(target_timespan as u64),
        None => max_target,
    };
    Ok(new_target.min(max_target).to_compact())
}

/// CheckProofOfWork: header hash must not exceed the expanded target.
pub fn check_proof_of_work(hash: &Hash, bits: u32, max_target_bits: u32) -> Result<(), ValidationError> {
    let target = U256::from_compact(bits)?;
    if target.is_zero() || target > U256::from_compact(max_target_bits)? {
        return Err(ValidationError::TargetTooLarge(bits));
    }
    if U256::from_hash(hash) > target {
        return Err(ValidationError::InvalidProofOfWork);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_roundtrip_of_known_values() {
        for bits in [0x1d00ffffu32, 0x172c0da7, 0x1b0404cb, 0x207fffff, 0x193f7bf8] {
            assert_eq!(U256::from_compact(bits).unwrap().to_compact(), bits);
        }
    }

    #[test]
    fn test_compact_rejects_negative() {
        assert!(U256::from_compact(0x04923456).is_err());
    }

    #[test]
    fn test_retarget_matches_mainnet_interval() {
        // Interval starting at height 536256
        let timespan = 1535129301i64 - 1533980459;
        assert_eq!(next_work_required(388763047, timespan, MAX_TARGET_BITS).unwrap(), 388618029);
    }

    #[test]
    fn test_retarget_exact_timespan_keeps_bits() {
        assert_eq!(
            next_work_required(0x1b0404cb, TARGET_TIMESPAN as i64, MAX_TARGET_BITS).unwrap(),
            0x1b0404cb
        );
    }

    #[test]
    fn test_retarget_is_clamped_and_capped() {
        // Very slow interval: at most four times easier, never above the maximum target
        assert_eq!(next_work_required(0x1d00ffff, 100 * TARGET_TIMESPAN as i64, MAX_TARGET_BITS).unwrap(), 0x1d00ffff);

        let fast = next_work_required(0x1b0404cb, 1, MAX_TARGET_BITS).unwrap();
        let quarter = U256::from_compact(0x1b0404cb).unwrap().div_u64(4).to_compact();
        assert_eq!(fast, quarter);
    }

    #[test]
    fn test_proof_of_work_against_target() {
        let mut easy_hash = [0u8; 32];
        easy_hash[0] = 1;
        assert!(check_proof_of_work(&easy_hash, 0x207fffff, REGTEST_MAX_TARGET_BITS).is_ok());

        let hard_hash = [0xff; 32];
        assert_eq!(
            check_proof_of_work(&hard_hash, 0x1d00ffff, MAX_TARGET_BITS),
            Err(ValidationError::InvalidProofOfWork)
        );
        assert_eq!(
            check_proof_of_work(&easy_hash, 0x207fffff, MAX_TARGET_BITS),
            Err(ValidationError::TargetTooLarge(0x207fffff))
        );
    }

    #[test]
    fn test_u256_mul_div() {
        let value = U256::from_u64(u64::MAX).shl(128);
        assert_eq!(value.checked_mul_u64(2).unwrap().div_u64(2), value);
        assert!(U256::from_u64(1).shl(255).checked_mul_u64(2).is_none());
        assert_eq!(U256::from_u64(1).shl(100).bits(), 101);
    }
}
