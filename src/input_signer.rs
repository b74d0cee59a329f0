//! Signature hashing and ECDSA signing of wallet inputs
//!
//! Three digest forms are supported: the legacy serialization, BIP143 for
//! segwit inputs, and BIP143 with SIGHASH_FORKID for Bitcoin Cash.

use crate::constants::{SIGHASH_ALL, SIGHASH_FORKID};
use crate::crypto::double_sha256;
use crate::error::SigningError;
use crate::keys::KeyProvider;
use crate::script::{p2pkh_script, p2wpkh_script, push_data};
use crate::serialization::{serialize_transaction, Encoder};
use crate::types::*;
use secp256k1::{All, Message, Secp256k1};
use std::sync::Arc;

/// An input being built together with what it spends.
#[derive(Debug, Clone)]
pub struct InputToSign {
    pub input: TransactionInput,
    pub previous_output: TransactionOutput,
    pub public_key: PublicKey,
}

/// Unlocking data for one input.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InputSignature {
    /// Pushes for the signature script
    pub script_items: Vec<ByteString>,
    pub witness: Vec<ByteString>,
}

impl InputSignature {
    pub fn signature_script(&self) -> ByteString {
        self.script_items.iter().flat_map(|item| push_data(item)).collect()
    }
}

/// Legacy digest: the spent script replaces the signed input's script, all other scripts are emptied.
pub fn legacy_sighash(transaction: &Transaction, index: usize, script_code: &[u8], hash_type: u32) -> Hash {
    let mut copy = transaction.clone();
    for (position, input) in copy.inputs.iter_mut().enumerate() {
        input.witness.clear();
        input.signature_script = if position == index { script_code.to_vec() } else { Vec::new() };
    }
    let mut bytes = serialize_transaction(&copy, false);
    bytes.extend_from_slice(&hash_type.to_le_bytes());
    double_sha256(&bytes)
}

/// BIP143 digest over prevouts, sequences, the spent script and amount, and outputs.
pub fn witness_sighash(transaction: &Transaction, index: usize, script_code: &[u8], value: u64, hash_type: u32) -> Hash {
    let mut prevouts = Encoder::new();
    let mut sequences = Encoder::new();
    for input in &transaction.inputs {
        prevouts
            .write_bytes(&input.previous_output.hash)
            .write_u32(input.previous_output.index);
        sequences.write_u32(input.sequence);
    }
    let mut outputs = Encoder::new();
    for output in &transaction.outputs {
        outputs.write_u64(output.value).write_var_bytes(&output.locking_script);
    }

    let input = &transaction.inputs[index];
    let mut preimage = Encoder::new();
    preimage
        .write_i32(transaction.version)
        .write_bytes(&double_sha256(&prevouts.into_inner()))
        .write_bytes(&double_sha256(&sequences.into_inner()))
        .write_bytes(&input.previous_output.hash)
        .write_u32(input.previous_output.index)
        .write_var_bytes(script_code)
        .write_u64(value)
        .write_u32(input.sequence)
        .write_bytes(&double_sha256(&outputs.into_inner()))
        .write_u32(transaction.lock_time)
        .write_u32(hash_type);
    double_sha256(&preimage.into_inner())
}

pub struct InputSigner {
    keys: Arc<dyn KeyProvider>,
    fork_id: bool,
    secp: Secp256k1<All>,
}

impl InputSigner {
    pub fn new(keys: Arc<dyn KeyProvider>, fork_id: bool) -> Self {
        InputSigner {
            keys,
            fork_id,
            secp: Secp256k1::new(),
        }
    }

    fn hash_type(&self) -> u32 {
        if self.fork_id {
            SIGHASH_ALL | SIGHASH_FORKID
        } else {
            SIGHASH_ALL
        }
    }

    fn sighash(&self, transaction: &Transaction, index: usize, to_sign: &InputToSign) -> Result<Hash, SigningError> {
        let previous = &to_sign.previous_output;
        let hash_type = self.hash_type();
        match previous.script_type {
            ScriptType::P2WPKH | ScriptType::P2WPKHSH => Ok(witness_sighash(
                transaction,
                index,
                &p2pkh_script(&to_sign.public_key.public_key_hash),
                previous.value,
                hash_type,
            )),
            ScriptType::P2PKH | ScriptType::P2PK if self.fork_id => Ok(witness_sighash(
                transaction,
                index,
                &previous.locking_script,
                previous.value,
                hash_type,
            )),
            ScriptType::P2PKH | ScriptType::P2PK => {
                Ok(legacy_sighash(transaction, index, &previous.locking_script, hash_type))
            }
            other => Err(SigningError::UnsupportedScriptType(other.to_string())),
        }
    }

    /// SigScriptData: Transaction × [InputToSign] × index → InputSignature
    ///
    /// 1. Derive the private key for the spent output's key path
    /// 2. Digest the transaction for the spent script form
    /// 3. DER signature with the hash type byte appended
    /// 4. Place signature and key per form: P2PKH script [sig, key], P2PK
    ///    script [sig], P2WPKH witness [sig, key], P2WPKH-in-P2SH script
    ///    [program] plus witness [sig, key]
    pub fn sig_script_data(
        &self,
        transaction: &Transaction,
        inputs_to_sign: &[InputToSign],
        index: usize,
    ) -> Result<InputSignature, SigningError> {
        let to_sign = inputs_to_sign.get(index).ok_or(SigningError::NoPreviousOutput(index))?;
        let private_key = self
            .keys
            .private_key(&to_sign.public_key.path)
            .map_err(|_| SigningError::NoPrivateKey(index))?;

        let digest = self.sighash(transaction, index, to_sign)?;
        let message = Message::from_digest_slice(&digest).map_err(|e| SigningError::KeyDerivation(e.to_string()))?;
        let mut signature = self.secp.sign_ecdsa(&message, &private_key).serialize_der().to_vec();
        signature.push(self.hash_type() as u8);

        let public_key = to_sign.public_key.public_key.clone();
        let data = match to_sign.previous_output.script_type {
            ScriptType::P2PKH => InputSignature {
                script_items: vec![signature, public_key],
                witness: Vec::new(),
            },
            ScriptType::P2PK => InputSignature {
                script_items: vec![signature],
                witness: Vec::new(),
            },
            ScriptType::P2WPKH => InputSignature {
                script_items: Vec::new(),
                witness: vec![signature, public_key],
            },
            ScriptType::P2WPKHSH => InputSignature {
                script_items: vec![p2wpkh_script(&to_sign.public_key.public_key_hash)],
                witness: vec![signature, public_key],
            },
            other => return Err(SigningError::UnsupportedScriptType(other.to_string())),
        };
        Ok(data)
    }
}
