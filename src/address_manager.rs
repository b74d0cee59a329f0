//! Gap-limit key maintenance and receive/change key selection

use crate::address::AddressConverterChain;
use crate::error::{SpvError, SigningError, TransactionCreationError};
use crate::keys::KeyProvider;
use crate::storage::WalletRecords;
use crate::types::{PublicKey, ScriptType};
use std::sync::Arc;
use tracing::debug;

pub struct AddressManager {
    keys: Arc<dyn KeyProvider>,
    converters: Arc<AddressConverterChain>,
    gap_limit: u32,
}

impl AddressManager {
    pub fn new(keys: Arc<dyn KeyProvider>, converters: Arc<AddressConverterChain>, gap_limit: u32) -> Self {
        AddressManager {
            keys,
            converters,
            gap_limit,
        }
    }

    pub fn gap_limit(&self) -> u32 {
        self.gap_limit
    }

    fn branch_keys<'a>(records: &'a WalletRecords, account: u32, external: bool) -> Vec<&'a PublicKey> {
        let mut keys: Vec<&PublicKey> = records
            .public_keys()
            .filter(|key| key.account == account && key.external == external)
            .collect();
        keys.sort_by_key(|key| key.index);
        keys
    }

    /// Keys after the last used one (all keys when none is used).
    fn gap_keys_count(records: &WalletRecords, keys: &[&PublicKey]) -> u32 {
        match keys.iter().rev().find(|key| records.is_key_used(&key.path)) {
            Some(last_used) => keys.iter().filter(|key| key.index > last_used.index).count() as u32,
            None => keys.len() as u32,
        }
    }

    fn accounts_count(records: &WalletRecords) -> u32 {
        let last_used_account = records
            .public_keys()
            .filter(|key| records.is_key_used(&key.path))
            .map(|key| key.account)
            .max();
        // One spare account past the last used one
        last_used_account.map_or(1, |account| account + 2)
    }

    /// FillGap: WalletRecords → keys added
    ///
    /// 1. Required accounts = last used account + 2, or 1 for an unused wallet
    /// 2. For every (account, branch) derive keys past the highest index until
    ///    the trailing unused run reaches the gap limit
    pub fn fill_gap(&self, records: &mut WalletRecords) -> Result<usize, SigningError> {
        let mut new_keys = Vec::new();
        for account in 0..Self::accounts_count(records) {
            for external in [true, false] {
                let keys = Self::branch_keys(records, account, external);
                let gap = Self::gap_keys_count(records, &keys);
                if gap >= self.gap_limit {
                    continue;
                }
                let next_index = keys.last().map_or(0, |key| key.index + 1);
                for offset in 0..self.gap_limit - gap {
                    new_keys.push(self.keys.public_key(account, next_index + offset, external)?);
                }
            }
        }
        let added = new_keys.len();
        if added > 0 {
            debug!(added, "filled key gap");
            records.add_public_keys(new_keys);
        }
        Ok(added)
    }

    /// Whether some (account, branch) has fewer than gap-limit trailing unused keys.
    pub fn gap_shifts(&self, records: &WalletRecords) -> bool {
        let Some(last_account) = records.public_keys().map(|key| key.account).max() else {
            return false;
        };
        (0..=last_account).any(|account| {
            [true, false].into_iter().any(|external| {
                Self::gap_keys_count(records, &Self::branch_keys(records, account, external)) < self.gap_limit
            })
        })
    }

    fn unused_key(&self, records: &WalletRecords, external: bool) -> Result<PublicKey, TransactionCreationError> {
        records
            .public_keys()
            .filter(|key| key.external == external && !records.is_key_used(&key.path))
            .min_by_key(|key| (key.index, key.account))
            .cloned()
            .ok_or(TransactionCreationError::NoUnusedPublicKey)
    }

    pub fn receive_public_key(&self, records: &WalletRecords) -> Result<PublicKey, TransactionCreationError> {
        self.unused_key(records, true)
    }

    pub fn change_public_key(&self, records: &WalletRecords) -> Result<PublicKey, TransactionCreationError> {
        self.unused_key(records, false)
    }

    pub fn receive_address(&self, records: &WalletRecords) -> Result<String, SpvError> {
        let key = self.receive_public_key(records)?;
        Ok(self.converters.convert(&key.public_key_hash, ScriptType::P2PKH)?.string)
    }
}
