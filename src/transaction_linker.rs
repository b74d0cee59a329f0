//! Ties inputs and outputs to stored outputs and wallet keys

use crate::storage::WalletRecords;
use crate::types::{ScriptType, Transaction};

pub struct TransactionLinker;

impl TransactionLinker {
    /// Link: WalletRecords × Transaction → Transaction (annotated)
    ///
    /// 1. An output is ours when its key hash names a wallet key; it records the key path
    /// 2. An input spending one of our outputs makes the transaction ours and outgoing
    pub fn link(records: &WalletRecords, transaction: &mut Transaction) {
        for output in &mut transaction.outputs {
            let Some(key_hash) = &output.key_hash else { continue };
            let Some(key) = records.public_key_by_hash(key_hash) else { continue };
            if output.script_type == ScriptType::P2SH && key.script_hash_p2wpkh == *key_hash {
                output.script_type = ScriptType::P2WPKHSH;
            }
            output.public_key_path = Some(key.path.clone());
            transaction.is_mine = true;
        }

        for input in &transaction.inputs {
            let owned = records
                .previous_output(&input.previous_output)
                .is_some_and(|previous| previous.public_key_path.is_some());
            if owned {
                transaction.is_mine = true;
                transaction.is_outgoing = true;
            }
        }
    }
}
