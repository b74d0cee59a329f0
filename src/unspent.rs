//! Spendable output selection and transaction size estimation

use crate::constants::DUST_LIMIT;
use crate::error::TransactionCreationError;
use crate::storage::{UnspentOutput, WalletRecords};
use crate::types::ScriptType;

/// Outputs the wallet may spend right now.
#[derive(Debug, Clone)]
pub struct UnspentOutputProvider {
    confirmations_threshold: u32,
}

impl UnspentOutputProvider {
    pub fn new(confirmations_threshold: u32) -> Self {
        UnspentOutputProvider {
            confirmations_threshold,
        }
    }

    /// Spendable: change from our own transactions is usable at once; anything
    /// received needs `confirmations_threshold` blocks on top of it, counting its own.
    pub fn spendable(&self, records: &WalletRecords) -> Vec<UnspentOutput> {
        let tip = records.last_block().map(|block| block.height);
        records
            .unspent_outputs()
            .into_iter()
            .filter(|unspent| {
                if unspent.is_outgoing {
                    return true;
                }
                match (unspent.block_height, tip) {
                    (Some(height), Some(tip)) if tip >= height => tip - height + 1 >= self.confirmations_threshold,
                    _ => false,
                }
            })
            .collect()
    }

    /// Sum of spendable output values.
    pub fn balance(&self, records: &WalletRecords) -> u64 {
        self.spendable(records).iter().map(|unspent| unspent.output.value).sum()
    }
}

/// Virtual-size estimates for the script forms the wallet signs and pays to.
pub struct TransactionSizeCalculator;

impl TransactionSizeCalculator {
    /// version + input count + output count + lock time
    const OVERHEAD: usize = 4 + 1 + 1 + 4;
    /// segwit marker and flag, witness-discounted
    const SEGWIT_MARKER_WEIGHT: usize = 2;
    const SIGNATURE_LENGTH: usize = 72 + 1;
    const PUBLIC_KEY_LENGTH: usize = 33 + 1;

    fn input_base_size(script_type: ScriptType) -> usize {
        let signature_script = match script_type {
            ScriptType::P2PKH => Self::SIGNATURE_LENGTH + Self::PUBLIC_KEY_LENGTH,
            ScriptType::P2PK => Self::SIGNATURE_LENGTH,
            // push of the 22-byte redeem program
            ScriptType::P2WPKHSH => 23,
            _ => 0,
        };
        // outpoint + script length + script + sequence
        36 + 1 + signature_script + 4
    }

    fn input_witness_size(script_type: ScriptType) -> usize {
        match script_type {
            ScriptType::P2WPKH | ScriptType::P2WPKHSH => 1 + Self::SIGNATURE_LENGTH + Self::PUBLIC_KEY_LENGTH,
            _ => 0,
        }
    }

    pub fn output_size(script_type: ScriptType) -> usize {
        let script = match script_type {
            ScriptType::P2PKH => 25,
            ScriptType::P2SH | ScriptType::P2WPKHSH => 23,
            ScriptType::P2WPKH => 22,
            ScriptType::P2WSH => 34,
            ScriptType::P2PK => 35,
            _ => 25,
        };
        8 + 1 + script
    }

    /// TransactionSize: input forms × output forms → virtual bytes
    pub fn transaction_size(inputs: &[ScriptType], outputs: &[ScriptType]) -> usize {
        let base: usize = Self::OVERHEAD
            + inputs.iter().map(|input| Self::input_base_size(*input)).sum::<usize>()
            + outputs.iter().map(|output| Self::output_size(*output)).sum::<usize>();
        let witness: usize = inputs.iter().map(|input| Self::input_witness_size(*input)).sum();
        if witness == 0 {
            return base;
        }
        let weight = base * 4 + Self::SEGWIT_MARKER_WEIGHT + witness;
        weight.div_ceil(4)
    }
}

/// Outcome of coin selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedUnspentOutputs {
    pub outputs: Vec<UnspentOutput>,
    pub total_value: u64,
    pub fee: u64,
    /// Value credited to the recipient after any receiver-paid fee
    pub recipient_value: u64,
    /// Change returned to the wallet; `None` when it would be dust
    pub change_value: Option<u64>,
}

pub struct UnspentOutputSelector;

impl UnspentOutputSelector {
    fn fee(inputs: &[ScriptType], outputs: &[ScriptType], fee_rate: u64) -> Option<u64> {
        (TransactionSizeCalculator::transaction_size(inputs, outputs) as u64).checked_mul(fee_rate)
    }

    /// Select: unspent × value × fee rate × recipient form × sender pays → selection
    ///
    /// 1. Walk outputs from the smallest up, accumulating until value plus fee is covered
    /// 2. Fee is re-estimated for every added input
    /// 3. A change output is added only when the remainder clears the dust limit;
    ///    otherwise the remainder goes to the fee
    pub fn select(
        unspent: Vec<UnspentOutput>,
        value: u64,
        fee_rate: u64,
        output_type: ScriptType,
        change_type: ScriptType,
        sender_pays: bool,
    ) -> Result<SelectedUnspentOutputs, TransactionCreationError> {
        if value < DUST_LIMIT {
            return Err(TransactionCreationError::Dust(value));
        }

        let mut candidates = unspent;
        candidates.sort_by_key(|unspent| unspent.output.value);
        let available = candidates
            .iter()
            .fold(0u64, |sum, unspent| sum.saturating_add(unspent.output.value));
        let overflow = TransactionCreationError::InsufficientFunds {
            required: u64::MAX,
            available,
        };

        let mut selected = Vec::new();
        let mut input_types = Vec::new();
        let mut total = 0u64;
        let mut required = value;
        for candidate in candidates {
            total = total.saturating_add(candidate.output.value);
            input_types.push(candidate.output.script_type);
            selected.push(candidate);

            required = if sender_pays {
                Self::fee(&input_types, &[output_type], fee_rate)
                    .and_then(|fee| value.checked_add(fee))
                    .ok_or_else(|| overflow.clone())?
            } else {
                value
            };
            if total >= required {
                break;
            }
        }
        if total < required || selected.is_empty() {
            return Err(TransactionCreationError::InsufficientFunds { required, available });
        }

        let fee_without_change = Self::fee(&input_types, &[output_type], fee_rate).ok_or_else(|| overflow.clone())?;
        let fee_with_change = Self::fee(&input_types, &[output_type, change_type], fee_rate).ok_or(overflow)?;

        let (recipient_value, fee, change_value) = if sender_pays {
            match value.checked_add(fee_with_change).and_then(|spent| total.checked_sub(spent)) {
                Some(change) if change >= DUST_LIMIT => (value, fee_with_change, Some(change)),
                _ => (value, total - value, None),
            }
        } else {
            let change = total - value;
            if change >= DUST_LIMIT {
                (value.saturating_sub(fee_with_change), fee_with_change, Some(change))
            } else {
                (value.saturating_sub(fee_without_change), fee_without_change + change, None)
            }
        };

        if recipient_value == 0 {
            return Err(TransactionCreationError::FeeMoreThanValue);
        }
        if recipient_value < DUST_LIMIT {
            return Err(TransactionCreationError::Dust(recipient_value));
        }

        Ok(SelectedUnspentOutputs {
            outputs: selected,
            total_value: total,
            fee,
            recipient_value,
            change_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HeaderHasher;
    use crate::script::p2pkh_script;
    use crate::types::*;

    fn unspent(value: u64, height: Option<u32>, is_outgoing: bool) -> UnspentOutput {
        let key = PublicKey::new(0, true, 0, vec![2; 33]);
        let mut output = TransactionOutput::new(value, p2pkh_script(&key.public_key_hash), 0);
        output.script_type = ScriptType::P2PKH;
        UnspentOutput {
            output,
            transaction_hash: [value as u8; 32],
            block_height: height,
            is_outgoing,
            public_key: key,
        }
    }

    #[test]
    fn test_legacy_sizes() {
        // one P2PKH input, one P2PKH output
        assert_eq!(TransactionSizeCalculator::transaction_size(&[ScriptType::P2PKH], &[ScriptType::P2PKH]), 192);
        assert_eq!(
            TransactionSizeCalculator::transaction_size(&[ScriptType::P2PKH], &[ScriptType::P2PKH, ScriptType::P2PKH]),
            226
        );
    }

    #[test]
    fn test_segwit_inputs_are_discounted() {
        let legacy = TransactionSizeCalculator::transaction_size(&[ScriptType::P2PKH], &[ScriptType::P2WPKH]);
        let native = TransactionSizeCalculator::transaction_size(&[ScriptType::P2WPKH], &[ScriptType::P2WPKH]);
        let wrapped = TransactionSizeCalculator::transaction_size(&[ScriptType::P2WPKHSH], &[ScriptType::P2WPKH]);
        assert!(native < wrapped && wrapped < legacy);
        assert_eq!(native, 110);
    }

    #[test]
    fn test_selector_adds_change_above_dust() {
        let selection =
            UnspentOutputSelector::select(vec![unspent(100_000, Some(1), false)], 50_000, 10, ScriptType::P2PKH, ScriptType::P2PKH, true)
                .unwrap();
        assert_eq!(selection.fee, 2260);
        assert_eq!(selection.recipient_value, 50_000);
        assert_eq!(selection.change_value, Some(100_000 - 50_000 - 2260));
    }

    #[test]
    fn test_selector_folds_dust_change_into_fee() {
        let selection =
            UnspentOutputSelector::select(vec![unspent(52_000, Some(1), false)], 50_000, 10, ScriptType::P2PKH, ScriptType::P2PKH, true)
                .unwrap();
        assert_eq!(selection.change_value, None);
        assert_eq!(selection.fee, 2000);
    }

    #[test]
    fn test_receiver_pays_fee() {
        let selection =
            UnspentOutputSelector::select(vec![unspent(50_000, Some(1), false)], 50_000, 10, ScriptType::P2PKH, ScriptType::P2PKH, false)
                .unwrap();
        assert_eq!(selection.recipient_value, 50_000 - 1920);
        assert_eq!(selection.fee, 1920);
        assert_eq!(selection.change_value, None);
    }

    #[test]
    fn test_insufficient_funds_reports_amounts() {
        let error =
            UnspentOutputSelector::select(vec![unspent(10_000, Some(1), false)], 50_000, 10, ScriptType::P2PKH, ScriptType::P2PKH, true)
                .unwrap_err();
        assert_eq!(
            error,
            TransactionCreationError::InsufficientFunds {
                required: 51_920,
                available: 10_000
            }
        );
    }

    #[test]
    fn test_amount_overflow_is_insufficient_funds() {
        let wallet = vec![unspent(u64::MAX, Some(1), false), unspent(u64::MAX - 1, Some(1), false)];
        let error = UnspentOutputSelector::select(wallet.clone(), u64::MAX - 100, 10, ScriptType::P2PKH, ScriptType::P2PKH, true)
            .unwrap_err();
        assert_eq!(
            error,
            TransactionCreationError::InsufficientFunds {
                required: u64::MAX,
                available: u64::MAX
            }
        );

        let error = UnspentOutputSelector::select(wallet, 50_000, u64::MAX, ScriptType::P2PKH, ScriptType::P2PKH, true)
            .unwrap_err();
        assert!(matches!(error, TransactionCreationError::InsufficientFunds { required: u64::MAX, .. }));
    }

    #[test]
    fn test_dust_value_rejected() {
        assert_eq!(
            UnspentOutputSelector::select(vec![], 100, 1, ScriptType::P2PKH, ScriptType::P2PKH, true),
            Err(TransactionCreationError::Dust(100))
        );
    }

    #[test]
    fn test_confirmation_threshold() {
        let mut records = WalletRecords::default();
        let hasher = HeaderHasher::double_sha256();
        let mut prev = [0; 32];
        for height in 0..3 {
            let header = Header::new(1, prev, [0; 32], 0, 0x207fffff, height, &hasher);
            prev = *header.hash();
            records.add_block(Block::new(header, height)).unwrap();
        }
        let key = PublicKey::new(0, true, 0, vec![2; 33]);
        records.add_public_keys(vec![key.clone()]);
        let mut output = TransactionOutput::new(5_000, p2pkh_script(&key.public_key_hash), 0);
        output.public_key_path = Some(key.path.clone());
        let mut tx = Transaction::new(1, vec![], vec![output], 0);
        tx.block_hash = Some(*records.block_at(2).unwrap().hash());
        records.save_transaction(tx).unwrap();

        assert_eq!(UnspentOutputProvider::new(1).balance(&records), 5_000);
        assert_eq!(UnspentOutputProvider::new(6).balance(&records), 0);
    }
}
