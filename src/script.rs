//! Standard script templates: construction, classification and key extraction
//!
//! Only the forms a wallet creates or needs to recognize are covered. Scripts
//! are never executed.

use crate::crypto::hash160;
use crate::types::{ByteString, ScriptType, TransactionInput};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKMULTISIG: u8 = 0xae;

/// One parsed element: an opcode, with its data when it is a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptChunk {
    pub opcode: u8,
    pub data: Option<ByteString>,
}

/// Minimal push of `data`.
pub fn push_data(data: &[u8]) -> ByteString {
    let mut script = Vec::with_capacity(data.len() + 5);
    match data.len() {
        len if len < OP_PUSHDATA1 as usize => script.push(len as u8),
        len if len <= 0xff => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len if len <= 0xffff => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
    script
}

pub fn p2pkh_script(key_hash: &[u8]) -> ByteString {
    let mut script = vec![OP_DUP, OP_HASH160];
    script.extend(push_data(key_hash));
    script.extend([OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub fn p2sh_script(script_hash: &[u8]) -> ByteString {
    let mut script = vec![OP_HASH160];
    script.extend(push_data(script_hash));
    script.push(OP_EQUAL);
    script
}

pub fn p2pk_script(public_key: &[u8]) -> ByteString {
    let mut script = push_data(public_key);
    script.push(OP_CHECKSIG);
    script
}

/// Version 0 witness program (P2WPKH for 20 bytes, P2WSH for 32).
pub fn p2wpkh_script(program: &[u8]) -> ByteString {
    let mut script = vec![OP_0];
    script.extend(push_data(program));
    script
}

/// Locking script paying `key_hash` in the given form.
pub fn locking_script(script_type: ScriptType, key_hash: &[u8]) -> Option<ByteString> {
    match script_type {
        ScriptType::P2PKH => Some(p2pkh_script(key_hash)),
        ScriptType::P2SH | ScriptType::P2WPKHSH => Some(p2sh_script(key_hash)),
        ScriptType::P2WPKH | ScriptType::P2WSH => Some(p2wpkh_script(key_hash)),
        ScriptType::P2PK => Some(p2pk_script(key_hash)),
        _ => None,
    }
}

/// ParseChunks: script → chunks, `None` when a push runs past the end.
pub fn parse_chunks(script: &[u8]) -> Option<Vec<ScriptChunk>> {
    let mut chunks = Vec::new();
    let mut position = 0;
    while position < script.len() {
        let opcode = script[position];
        position += 1;
        let length = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let length = *script.get(position)? as usize;
                position += 1;
                length
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(position..position + 2)?;
                position += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(position..position + 4)?;
                position += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => {
                chunks.push(ScriptChunk { opcode, data: None });
                continue;
            }
        };
        let data = script.get(position..position.checked_add(length)?)?.to_vec();
        position += length;
        chunks.push(ScriptChunk {
            opcode,
            data: Some(data),
        });
    }
    Some(chunks)
}

fn is_public_key(data: &[u8]) -> bool {
    matches!((data.len(), data.first()), (33, Some(0x02 | 0x03)) | (65, Some(0x04)))
}

/// Classify: locking script → (ScriptType, key hash or public key)
pub fn classify(script: &[u8]) -> (ScriptType, Option<ByteString>) {
    match script {
        [OP_DUP, OP_HASH160, 20, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            (ScriptType::P2PKH, Some(hash.to_vec()))
        }
        [OP_HASH160, 20, hash @ .., OP_EQUAL] if hash.len() == 20 => (ScriptType::P2SH, Some(hash.to_vec())),
        [OP_0, 20, program @ ..] if program.len() == 20 => (ScriptType::P2WPKH, Some(program.to_vec())),
        [OP_0, 32, program @ ..] if program.len() == 32 => (ScriptType::P2WSH, Some(program.to_vec())),
        [OP_RETURN, ..] => (ScriptType::NullData, None),
        [len, key @ .., OP_CHECKSIG] if *len as usize == key.len() && is_public_key(key) => {
            (ScriptType::P2PK, Some(key.to_vec()))
        }
        [first, .., OP_CHECKMULTISIG] if (OP_1..=OP_16).contains(first) => (ScriptType::P2MultiSig, None),
        _ => (ScriptType::Unknown, None),
    }
}

/// Recover the spending key form from an input's unlocking data.
///
/// P2PKH inputs reveal the public key in the signature script, native segwit
/// inputs in the witness, and wrapped segwit inputs push the redeem program.
pub fn extract_input_key_hash(input: &TransactionInput) -> Option<(ScriptType, ByteString)> {
    let chunks = parse_chunks(&input.signature_script)?;

    if chunks.is_empty() {
        return match input.witness.as_slice() {
            [_, key] if is_public_key(key) => Some((ScriptType::P2WPKH, hash160(key).to_vec())),
            _ => None,
        };
    }

    let last = chunks.last().and_then(|chunk| chunk.data.clone())?;
    match chunks.len() {
        1 if !input.witness.is_empty() && last.len() == 22 && last[0] == OP_0 => {
            Some((ScriptType::P2WPKHSH, hash160(&last).to_vec()))
        }
        2 if is_public_key(&last) => Some((ScriptType::P2PKH, hash160(&last).to_vec())),
        1 => None,
        _ => match classify(&last).0 {
            ScriptType::Unknown => None,
            _ => Some((ScriptType::P2SH, hash160(&last).to_vec())),
        },
    }
}
