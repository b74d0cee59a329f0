//! Core data model shared by the sync engine, storage and transaction pipeline

use crate::crypto::HeaderHasher;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hash type: 256-bit hash in internal (wire) byte order
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Hex string of a hash in the conventional reversed display order.
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse a display-order hex hash back into internal byte order.
pub fn hash_from_hex(value: &str) -> Option<Hash> {
    let bytes = hex::decode(value).ok()?;
    let mut hash: Hash = bytes.try_into().ok()?;
    hash.reverse();
    Some(hash)
}

/// Seconds since the unix epoch.
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Block header. The hash is derived once at construction from the other
/// fields and the network's header hashing algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    version: i32,
    prev_block_hash: Hash,
    merkle_root: Hash,
    timestamp: u32,
    bits: u32,
    nonce: u32,
    hash: Hash,
}

impl Header {
    pub fn new(
        version: i32,
        prev_block_hash: Hash,
        merkle_root: Hash,
        timestamp: u32,
        bits: u32,
        nonce: u32,
        hasher: &HeaderHasher,
    ) -> Self {
        let mut header = Header {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
            hash: [0; 32],
        };
        header.hash = hasher.hash(&header.serialize());
        header
    }

    /// Serialize: 80 bytes, little-endian integer fields
    pub fn serialize(&self) -> [u8; 80] {
        let mut bytes = [0u8; 80];
        bytes[0..4].copy_from_slice(&self.version.to_le_bytes());
        bytes[4..36].copy_from_slice(&self.prev_block_hash);
        bytes[36..68].copy_from_slice(&self.merkle_root);
        bytes[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.bits.to_le_bytes());
        bytes[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn prev_block_hash(&self) -> &Hash {
        &self.prev_block_hash
    }

    pub fn merkle_root(&self) -> &Hash {
        &self.merkle_root
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }
}

/// A header linked into the local chain.
///
/// `has_transactions` flips to true once the merkle block for this header
/// has been verified and its matched transactions processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub height: u32,
    pub has_transactions: bool,
}

impl Block {
    pub fn new(header: Header, height: u32) -> Self {
        Block {
            header,
            height,
            has_transactions: false,
        }
    }

    pub fn hash(&self) -> &Hash {
        self.header.hash()
    }

    pub fn prev_hash(&self) -> &Hash {
        self.header.prev_block_hash()
    }
}

/// Header plus the transactions a peer matched against our bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    pub header: Header,
    pub matched_hashes: Vec<Hash>,
    pub transactions: Vec<Transaction>,
    pub height: Option<u32>,
}

impl MerkleBlock {
    pub fn new(header: Header, matched_hashes: Vec<Hash>) -> Self {
        MerkleBlock {
            header,
            matched_hashes,
            transactions: Vec::new(),
            height: None,
        }
    }

    pub fn block_hash(&self) -> &Hash {
        self.header.hash()
    }

    pub fn is_complete(&self) -> bool {
        self.transactions.len() == self.matched_hashes.len()
    }

    /// Attach a delivered transaction if it is one of the matched hashes and not yet present.
    pub fn add_transaction(&mut self, transaction: Transaction) -> bool {
        if !self.matched_hashes.contains(&transaction.hash)
            || self.transactions.iter().any(|tx| tx.hash == transaction.hash)
        {
            return false;
        }
        self.transactions.push(transaction);
        true
    }
}

/// OutPoint: previous transaction hash and output index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ScriptType {
    #[default]
    Unknown,
    P2PKH,
    P2PK,
    P2MultiSig,
    P2SH,
    P2WSH,
    P2WPKH,
    /// P2WPKH nested in P2SH
    P2WPKHSH,
    NullData,
}

impl ScriptType {
    pub fn is_witness(&self) -> bool {
        matches!(self, ScriptType::P2WPKH | ScriptType::P2WSH | ScriptType::P2WPKHSH)
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub previous_output: OutPoint,
    pub signature_script: ByteString,
    pub sequence: u32,
    pub witness: Vec<ByteString>,
    /// Key hash recovered from the unlocking data, when recognizable
    pub key_hash: Option<ByteString>,
    pub address: Option<String>,
}

impl TransactionInput {
    pub fn new(previous_output: OutPoint, signature_script: ByteString, sequence: u32) -> Self {
        TransactionInput {
            previous_output,
            signature_script,
            sequence,
            witness: Vec::new(),
            key_hash: None,
            address: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: u64,
    pub locking_script: ByteString,
    pub index: u32,
    pub script_type: ScriptType,
    pub key_hash: Option<ByteString>,
    pub address: Option<String>,
    /// Derivation path of the wallet key that owns this output
    pub public_key_path: Option<String>,
}

impl TransactionOutput {
    pub fn new(value: u64, locking_script: ByteString, index: u32) -> Self {
        TransactionOutput {
            value,
            locking_script,
            index,
            script_type: ScriptType::Unknown,
            key_hash: None,
            address: None,
            public_key_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransactionStatus {
    #[default]
    New,
    Relayed,
    Invalid,
}

/// Transaction together with the wallet bookkeeping attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash,
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
    pub segwit: bool,
    /// Special transaction payload (Dash version 3 typed transactions)
    pub extra_payload: Option<ByteString>,
    pub block_hash: Option<Hash>,
    pub status: TransactionStatus,
    pub is_mine: bool,
    pub is_outgoing: bool,
    pub timestamp: u64,
    pub order: u32,
}

impl Transaction {
    pub fn new(version: i32, inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>, lock_time: u32) -> Self {
        let mut transaction = Transaction {
            hash: [0; 32],
            version,
            segwit: inputs.iter().any(|input| !input.witness.is_empty()),
            inputs,
            outputs,
            lock_time,
            extra_payload: None,
            block_hash: None,
            status: TransactionStatus::New,
            is_mine: false,
            is_outgoing: false,
            timestamp: unix_time(),
            order: 0,
        };
        transaction.update_hash();
        transaction
    }

    /// Recompute the txid from the non-witness serialization.
    pub fn update_hash(&mut self) {
        self.segwit = self.inputs.iter().any(|input| !input.witness.is_empty());
        self.hash = crate::crypto::double_sha256(&crate::serialization::serialize_transaction(self, false));
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.hash == [0; 32]
    }
}

/// Wallet key derived at `account / branch / index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub account: u32,
    pub external: bool,
    pub index: u32,
    pub public_key: ByteString,
    pub public_key_hash: ByteString,
    /// hash160 of the P2WPKH program, the P2SH-wrapped segwit form
    pub script_hash_p2wpkh: ByteString,
    pub path: String,
}

impl PublicKey {
    pub fn new(account: u32, external: bool, index: u32, public_key: ByteString) -> Self {
        let public_key_hash = crate::crypto::hash160(&public_key).to_vec();
        let program = crate::script::p2wpkh_script(&public_key_hash);
        PublicKey {
            account,
            external,
            index,
            script_hash_p2wpkh: crate::crypto::hash160(&program).to_vec(),
            public_key_hash,
            public_key,
            path: PublicKey::path_for(account, external, index),
        }
    }

    pub fn path_for(account: u32, external: bool, index: u32) -> String {
        format!("{}/{}/{}", account, if external { 0 } else { 1 }, index)
    }
}

/// Broadcast bookkeeping for a locally created transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentTransaction {
    pub hash: Hash,
    pub first_send_time: u64,
    pub last_send_time: u64,
    pub retries_count: u32,
    pub send_success: bool,
}

impl SentTransaction {
    pub fn new(hash: Hash, now: u64) -> Self {
        SentTransaction {
            hash,
            first_send_time: now,
            last_send_time: now,
            retries_count: 0,
            send_success: false,
        }
    }
}

/// Candidate host in the peer address pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: String,
    pub score: i32,
    /// Unix time before which the host must not be retried
    pub backoff_until: u64,
    pub failures: u32,
}

impl PeerAddress {
    pub fn new(ip: impl Into<String>) -> Self {
        PeerAddress {
            ip: ip.into(),
            score: 0,
            backoff_until: 0,
            failures: 0,
        }
    }
}

pub const INV_ERROR: u32 = 0;
pub const INV_MSG_TX: u32 = 1;
pub const INV_MSG_BLOCK: u32 = 2;
pub const INV_MSG_FILTERED_BLOCK: u32 = 3;
pub const INV_MSG_TXLOCK_REQUEST: u32 = 4;
pub const INV_MSG_TXLOCK_VOTE: u32 = 5;

/// Inventory vector identifying objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryItem {
    pub inv_type: u32,
    pub hash: Hash,
}

impl InventoryItem {
    pub fn new(inv_type: u32, hash: Hash) -> Self {
        InventoryItem { inv_type, hash }
    }
}

/// Snapshot of the chain tip handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: String,
    pub height: u32,
    pub timestamp: u32,
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        BlockInfo {
            hash: hash_to_hex(block.hash()),
            height: block.height,
            timestamp: block.header.timestamp(),
        }
    }
}

/// Fee rates in satoshis per byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRate {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub date: u64,
}

impl Default for FeeRate {
    fn default() -> Self {
        FeeRate {
            low: crate::constants::DEFAULT_FEE_RATE,
            medium: crate::constants::DEFAULT_FEE_RATE,
            high: crate::constants::DEFAULT_FEE_RATE,
            date: 0,
        }
    }
}

/// Process-wide synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SyncState {
    NotSynced,
    /// Progress fraction in `[0, 1]`
    Syncing(f64),
    Synced,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::NotSynced
    }
}
