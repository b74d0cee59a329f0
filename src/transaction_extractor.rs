//! Script classification and address decoding for transaction inputs and outputs

use crate::address::AddressConverterChain;
use crate::crypto::hash160;
use crate::script::{classify, extract_input_key_hash};
use crate::types::{ScriptType, Transaction};
use std::sync::Arc;

pub struct TransactionExtractor {
    converters: Arc<AddressConverterChain>,
}

impl TransactionExtractor {
    pub fn new(converters: Arc<AddressConverterChain>) -> Self {
        TransactionExtractor { converters }
    }

    fn address(&self, script_type: ScriptType, key_hash: &[u8]) -> Option<String> {
        let converted = match script_type {
            ScriptType::P2PK => self.converters.convert(&hash160(key_hash), ScriptType::P2PKH),
            ScriptType::P2WPKHSH => self.converters.convert(key_hash, ScriptType::P2SH),
            other => self.converters.convert(key_hash, other),
        };
        converted.ok().map(|address| address.string)
    }

    /// Extract: fill script type, key hash and address on every input and output
    /// that uses a recognizable template. Unknown forms are left untouched.
    pub fn extract(&self, transaction: &mut Transaction) {
        for output in &mut transaction.outputs {
            let (script_type, key_hash) = classify(&output.locking_script);
            output.script_type = script_type;
            if let Some(key_hash) = key_hash {
                output.address = self.address(script_type, &key_hash);
                output.key_hash = Some(key_hash);
            }
        }

        for input in &mut transaction.inputs {
            if let Some((script_type, key_hash)) = extract_input_key_hash(input) {
                input.address = self.address(script_type, &key_hash);
                input.key_hash = Some(key_hash);
            }
        }
    }
}
