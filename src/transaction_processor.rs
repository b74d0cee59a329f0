//! Incoming and outgoing transaction processing against wallet records

use crate::address_manager::AddressManager;
use crate::error::{StorageError, TransactionCreationError};
use crate::storage::WalletRecords;
use crate::transaction_extractor::TransactionExtractor;
use crate::transaction_linker::TransactionLinker;
use crate::types::*;
use std::sync::Arc;
use tracing::{debug, warn};

/// What one processing pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub inserted: Vec<Hash>,
    pub updated: Vec<Hash>,
    pub deleted: Vec<Hash>,
    /// A key used by a new output fell inside the last distributed gap;
    /// peers may have missed matches, so the filter must be rebuilt.
    pub bloom_filter_expired: bool,
}

impl ProcessOutcome {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn merge(&mut self, other: ProcessOutcome) {
        self.inserted.extend(other.inserted);
        self.updated.extend(other.updated);
        self.deleted.extend(other.deleted);
        self.bloom_filter_expired |= other.bloom_filter_expired;
    }
}

pub struct TransactionProcessor {
    extractor: TransactionExtractor,
    address_manager: Arc<AddressManager>,
}

impl TransactionProcessor {
    pub fn new(extractor: TransactionExtractor, address_manager: Arc<AddressManager>) -> Self {
        TransactionProcessor {
            extractor,
            address_manager,
        }
    }

    fn mark_keys_used(records: &mut WalletRecords, transaction: &Transaction) -> bool {
        let mut newly_used = false;
        for output in &transaction.outputs {
            if let Some(path) = &output.public_key_path {
                newly_used |= records.mark_key_used(path);
            }
        }
        newly_used
    }

    /// Save `transaction`, evicting an unconfirmed double spend when the new one is confirmed.
    fn save(records: &mut WalletRecords, transaction: Transaction, outcome: &mut ProcessOutcome) -> Result<bool, StorageError> {
        let conflicts: Vec<Hash> = transaction
            .inputs
            .iter()
            .filter_map(|input| records.spender_of(&input.previous_output).copied())
            .filter(|spender| spender != &transaction.hash)
            .collect();

        for conflict in conflicts {
            let unconfirmed = records.transaction(&conflict).is_some_and(|tx| tx.block_hash.is_none());
            if transaction.block_hash.is_none() || !unconfirmed {
                warn!(hash = %hash_to_hex(&transaction.hash), conflict = %hash_to_hex(&conflict), "conflicting transaction ignored");
                return Ok(false);
            }
            records.delete_transaction(&conflict);
            outcome.deleted.push(conflict);
        }
        records.save_transaction(transaction)?;
        Ok(true)
    }

    /// ProcessIncoming: records × [Transaction] × Block? → ProcessOutcome
    ///
    /// 1. Known transactions get their block reference and relayed status updated
    /// 2. New transactions are extracted and linked; only ours are stored
    /// 3. Keys backing new outputs are marked used
    /// 4. Unless `skip_bloom_check`, a shifted gap sets `bloom_filter_expired`
    ///
    /// Callers run this inside one storage transaction.
    pub fn process_incoming(
        &self,
        records: &mut WalletRecords,
        transactions: Vec<Transaction>,
        block: Option<&Block>,
        skip_bloom_check: bool,
    ) -> Result<ProcessOutcome, StorageError> {
        let mut outcome = ProcessOutcome::default();
        let block_hash = block.map(|block| *block.hash());

        for mut transaction in transactions {
            if let Some(existing) = records.transaction(&transaction.hash).cloned() {
                let mut updated = existing;
                updated.status = TransactionStatus::Relayed;
                if block_hash.is_some() {
                    updated.block_hash = block_hash;
                }
                records.save_transaction(updated)?;
                outcome.updated.push(transaction.hash);
                continue;
            }

            self.extractor.extract(&mut transaction);
            TransactionLinker::link(records, &mut transaction);
            if !transaction.is_mine {
                continue;
            }

            transaction.block_hash = block_hash;
            transaction.status = TransactionStatus::Relayed;
            transaction.order = records.next_transaction_order();
            if let Some(block) = block {
                transaction.timestamp = block.header.timestamp() as u64;
            }

            let hash = transaction.hash;
            let stored = transaction.clone();
            if !Self::save(records, transaction, &mut outcome)? {
                continue;
            }
            let newly_used = Self::mark_keys_used(records, &stored);
            debug!(hash = %hash_to_hex(&hash), confirmed = block_hash.is_some(), "transaction stored");
            outcome.inserted.push(hash);

            if newly_used && !skip_bloom_check && self.address_manager.gap_shifts(records) {
                outcome.bloom_filter_expired = true;
            }
        }
        Ok(outcome)
    }

    /// ProcessOutgoing: records × Transaction → Transaction
    ///
    /// The transaction must be new; it is stored as pending with its change key marked used.
    pub fn process_outgoing(
        &self,
        records: &mut WalletRecords,
        mut transaction: Transaction,
    ) -> Result<Transaction, TransactionCreationError> {
        if records.transaction_exists(&transaction.hash) {
            return Err(TransactionCreationError::TransactionAlreadyExists(hash_to_hex(&transaction.hash)));
        }
        self.extractor.extract(&mut transaction);
        TransactionLinker::link(records, &mut transaction);
        transaction.is_mine = true;
        transaction.is_outgoing = true;
        transaction.status = TransactionStatus::New;
        transaction.order = records.next_transaction_order();

        Self::mark_keys_used(records, &transaction);
        records
            .save_transaction(transaction.clone())
            .map_err(|e| TransactionCreationError::TransactionAlreadyExists(e.to_string()))?;
        Ok(transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressConverterChain;
    use crate::error::SigningError;
    use crate::keys::KeyProvider;
    use crate::params::{NetworkKind, NetworkParams};
    use crate::script::p2pkh_script;
    use secp256k1::SecretKey;

    struct FakeKeys;

    impl KeyProvider for FakeKeys {
        fn public_key(&self, account: u32, index: u32, external: bool) -> Result<PublicKey, SigningError> {
            let mut bytes = vec![3u8; 33];
            bytes[1..5].copy_from_slice(&index.to_le_bytes());
            bytes[5] = external as u8;
            bytes[6..10].copy_from_slice(&account.to_le_bytes());
            Ok(PublicKey::new(account, external, index, bytes))
        }

        fn private_key(&self, path: &str) -> Result<SecretKey, SigningError> {
            Err(SigningError::KeyDerivation(path.to_string()))
        }
    }

    fn setup(gap: u32) -> (TransactionProcessor, Arc<AddressManager>, WalletRecords) {
        let params = NetworkParams::for_network(NetworkKind::RegTest);
        let converters = Arc::new(AddressConverterChain::for_network(&params).unwrap());
        let manager = Arc::new(AddressManager::new(Arc::new(FakeKeys), converters.clone(), gap));
        let mut records = WalletRecords::default();
        manager.fill_gap(&mut records).unwrap();
        let processor = TransactionProcessor::new(TransactionExtractor::new(converters), manager.clone());
        (processor, manager, records)
    }

    fn paying(records: &WalletRecords, path: &str, value: u64, salt: u8) -> Transaction {
        let key = records.public_key(path).unwrap();
        let input = TransactionInput::new(OutPoint { hash: [salt; 32], index: 0 }, vec![], 0xffffffff);
        Transaction::new(1, vec![input], vec![TransactionOutput::new(value, p2pkh_script(&key.public_key_hash), 0)], 0)
    }

    #[test]
    fn test_foreign_transactions_are_not_stored() {
        let (processor, _, mut records) = setup(3);
        let foreign = Transaction::new(1, vec![], vec![TransactionOutput::new(5, p2pkh_script(&[9; 20]), 0)], 0);
        let outcome = processor.process_incoming(&mut records, vec![foreign], None, false).unwrap();
        assert!(outcome.is_empty());
        assert!(records.transactions().is_empty());
    }

    #[test]
    fn test_reprocessing_is_idempotent() {
        let (processor, _, mut records) = setup(3);
        let tx = paying(&records, "0/0/2", 100_000, 1);
        let first = processor.process_incoming(&mut records, vec![tx.clone()], None, true).unwrap();
        assert_eq!(first.inserted, vec![tx.hash]);
        let second = processor.process_incoming(&mut records, vec![tx.clone()], None, true).unwrap();
        assert_eq!(second.updated, vec![tx.hash]);
        assert_eq!(records.transactions().len(), 1);
        assert_eq!(records.unspent_outputs().len(), 1);
        assert!(records.is_key_used("0/0/2"));
    }

    #[test]
    fn test_key_inside_gap_expires_bloom_filter() {
        let (processor, manager, mut records) = setup(3);
        let tx = paying(&records, "0/0/1", 1_000, 1);
        let outcome = processor.process_incoming(&mut records, vec![tx], None, false).unwrap();
        assert!(outcome.bloom_filter_expired);

        manager.fill_gap(&mut records).unwrap();
        assert!(!manager.gap_shifts(&records));
    }

    #[test]
    fn test_confirmed_transaction_evicts_unconfirmed_double_spend() {
        let (processor, _, mut records) = setup(3);
        let pending = paying(&records, "0/0/0", 1_000, 7);
        processor.process_incoming(&mut records, vec![pending.clone()], None, true).unwrap();

        let mut confirmed = paying(&records, "0/0/1", 900, 7);
        confirmed.lock_time = 1;
        confirmed.update_hash();
        let block = crate::params::NetworkParams::for_network(NetworkKind::RegTest)
            .last_checkpoint()
            .unwrap()
            .to_block(&crate::crypto::HeaderHasher::double_sha256());
        records.add_block(block.clone()).unwrap();

        let outcome = processor.process_incoming(&mut records, vec![confirmed.clone()], Some(&block), true).unwrap();
        assert_eq!(outcome.deleted, vec![pending.hash]);
        assert!(!records.transaction_exists(&pending.hash));
        assert_eq!(records.transaction(&confirmed.hash).unwrap().block_hash, Some(*block.hash()));
    }

    #[test]
    fn test_outgoing_duplicate_is_rejected() {
        let (processor, _, mut records) = setup(3);
        let tx = paying(&records, "0/1/0", 500, 2);
        processor.process_outgoing(&mut records, tx.clone()).unwrap();
        assert!(matches!(
            processor.process_outgoing(&mut records, tx),
            Err(TransactionCreationError::TransactionAlreadyExists(_))
        ));
    }
}
