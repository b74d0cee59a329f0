//! Dash extensions: instant-send lock messages and masternode list sync
//!
//! The Dash parser sits ahead of the generic one in the parser chain. Lock
//! requests are processed as ordinary mempool transactions; votes are counted
//! per transaction. Masternode list diffs are applied on top of the last
//! verified list and checked against the coinbase special payload.

use crate::crypto::double_sha256;
use crate::error::{ProtocolError, ValidationError};
use crate::merkle::{merkle_root, PartialMerkleTree};
use crate::network::{MessageContext, MessageParser, NetworkMessage};
use crate::peer_group::{GroupActions, InventoryItemsHandler, PeerGroupHandle, PeerGroupListener, PeerTaskHandler};
use crate::peer_task::PeerTask;
use crate::serialization::{serialize_transaction, Decoder, Encoder};
use crate::storage::Storage;
use crate::transaction_syncer::TransactionSyncer;
use crate::types::*;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Votes after which a lock request is considered final.
pub const INSTANT_SEND_REQUIRED_VOTES: usize = 6;

const MAX_MASTERNODES: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionLockVote {
    pub tx_hash: Hash,
    pub outpoint: OutPoint,
    pub outpoint_masternode: OutPoint,
    pub quorum_modifier_hash: Hash,
    pub masternode_pro_tx_hash: Hash,
    pub signature: Vec<u8>,
}

impl TransactionLockVote {
    fn encode_unsigned(&self, encoder: &mut Encoder) {
        encoder
            .write_bytes(&self.tx_hash)
            .write_bytes(&self.outpoint.hash)
            .write_u32(self.outpoint.index)
            .write_bytes(&self.outpoint_masternode.hash)
            .write_u32(self.outpoint_masternode.index)
            .write_bytes(&self.quorum_modifier_hash)
            .write_bytes(&self.masternode_pro_tx_hash);
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        self.encode_unsigned(encoder);
        encoder.write_var_bytes(&self.signature);
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, ProtocolError> {
        Ok(TransactionLockVote {
            tx_hash: decoder.read_hash()?,
            outpoint: OutPoint {
                hash: decoder.read_hash()?,
                index: decoder.read_u32()?,
            },
            outpoint_masternode: OutPoint {
                hash: decoder.read_hash()?,
                index: decoder.read_u32()?,
            },
            quorum_modifier_hash: decoder.read_hash()?,
            masternode_pro_tx_hash: decoder.read_hash()?,
            signature: decoder.read_var_bytes()?,
        })
    }

    /// Inventory hash: the signature is not covered.
    pub fn hash(&self) -> Hash {
        let mut encoder = Encoder::new();
        self.encode_unsigned(&mut encoder);
        double_sha256(&encoder.into_inner())
    }
}

/// Simplified masternode list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Masternode {
    pub pro_reg_tx_hash: Hash,
    pub confirmed_hash: Hash,
    pub ip_address: [u8; 16],
    pub port: u16,
    pub pub_key_operator: [u8; 48],
    pub key_id_voting: [u8; 20],
    pub is_valid: bool,
}

impl Masternode {
    pub fn encode(&self, encoder: &mut Encoder) {
        encoder
            .write_bytes(&self.pro_reg_tx_hash)
            .write_bytes(&self.confirmed_hash)
            .write_bytes(&self.ip_address)
            .write_u16_be(self.port)
            .write_bytes(&self.pub_key_operator)
            .write_bytes(&self.key_id_voting)
            .write_u8(self.is_valid as u8);
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, ProtocolError> {
        Ok(Masternode {
            pro_reg_tx_hash: decoder.read_hash()?,
            confirmed_hash: decoder.read_hash()?,
            ip_address: decoder.read_array()?,
            port: decoder.read_u16_be()?,
            pub_key_operator: decoder.read_array()?,
            key_id_voting: decoder.read_array()?,
            is_valid: decoder.read_u8()? != 0,
        })
    }

    pub fn hash(&self) -> Hash {
        let mut encoder = Encoder::new();
        self.encode(&mut encoder);
        double_sha256(&encoder.into_inner())
    }

    /// List order: pro-reg hash compared as a little-endian 256-bit number.
    fn sort_key(&self) -> Hash {
        let mut key = self.pro_reg_tx_hash;
        key.reverse();
        key
    }
}

/// Special payload of a Dash coinbase transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseTransaction {
    pub version: u16,
    pub height: u32,
    pub merkle_root_mn_list: Hash,
}

impl CoinbaseTransaction {
    pub fn from_transaction(transaction: &Transaction) -> Result<Self, ProtocolError> {
        let payload = transaction
            .extra_payload
            .as_deref()
            .ok_or_else(|| ProtocolError::Malformed("coinbase without special payload".into()))?;
        let mut decoder = Decoder::new(payload);
        Ok(CoinbaseTransaction {
            version: decoder.read_u16()?,
            height: decoder.read_u32()?,
            merkle_root_mn_list: decoder.read_hash()?,
        })
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder
            .write_u16(self.version)
            .write_u32(self.height)
            .write_bytes(&self.merkle_root_mn_list);
        encoder.into_inner()
    }
}

/// mnlistdiff: changes between the lists at two blocks plus the coinbase proving the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasternodeListDiff {
    pub base_block_hash: Hash,
    pub block_hash: Hash,
    pub total_transactions: u32,
    pub merkle_hashes: Vec<Hash>,
    pub merkle_flags: Vec<u8>,
    pub cb_tx: Transaction,
    pub deleted_masternodes: Vec<Hash>,
    pub masternodes: Vec<Masternode>,
}

impl MasternodeListDiff {
    pub fn encode(&self, encoder: &mut Encoder) {
        encoder
            .write_bytes(&self.base_block_hash)
            .write_bytes(&self.block_hash)
            .write_u32(self.total_transactions)
            .write_var_int(self.merkle_hashes.len() as u64);
        for hash in &self.merkle_hashes {
            encoder.write_bytes(hash);
        }
        encoder
            .write_var_bytes(&self.merkle_flags)
            .write_bytes(&serialize_transaction(&self.cb_tx, false))
            .write_var_int(self.deleted_masternodes.len() as u64);
        for hash in &self.deleted_masternodes {
            encoder.write_bytes(hash);
        }
        encoder.write_var_int(self.masternodes.len() as u64);
        for masternode in &self.masternodes {
            masternode.encode(encoder);
        }
    }

    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, ProtocolError> {
        let base_block_hash = decoder.read_hash()?;
        let block_hash = decoder.read_hash()?;
        let total_transactions = decoder.read_u32()?;
        let count = decoder.read_count(decoder.remaining() / 32)?;
        let merkle_hashes = (0..count).map(|_| decoder.read_hash()).collect::<Result<_, _>>()?;
        let merkle_flags = decoder.read_var_bytes()?;
        let cb_tx = decoder.read_transaction(true)?;
        let count = decoder.read_count(decoder.remaining() / 32)?;
        let deleted_masternodes = (0..count).map(|_| decoder.read_hash()).collect::<Result<_, _>>()?;
        let count = decoder.read_count(MAX_MASTERNODES)?;
        let masternodes = (0..count)
            .map(|_| Masternode::decode(decoder))
            .collect::<Result<_, _>>()?;
        Ok(MasternodeListDiff {
            base_block_hash,
            block_hash,
            total_transactions,
            merkle_hashes,
            merkle_flags,
            cb_tx,
            deleted_masternodes,
            masternodes,
        })
    }
}

/// Parses `ix`, `txlvote` and `mnlistdiff`; leaves everything else to the next parser.
pub struct DashMessageParser;

impl MessageParser for DashMessageParser {
    fn parse(&self, command: &str, payload: &[u8], _context: &MessageContext) -> Option<Result<NetworkMessage, ProtocolError>> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            "ix" => decoder.read_transaction(true).map(NetworkMessage::TransactionLock),
            "txlvote" => TransactionLockVote::decode(&mut decoder).map(NetworkMessage::TransactionLockVote),
            "mnlistdiff" => MasternodeListDiff::decode(&mut decoder).map(NetworkMessage::MasternodeListDiff),
            _ => return None,
        };
        Some(message)
    }
}

/// Instant-send inventory and task handling.
pub struct InstantSend {
    syncer: Arc<TransactionSyncer>,
    votes: Mutex<HashMap<Hash, usize>>,
}

impl InstantSend {
    pub fn new(syncer: Arc<TransactionSyncer>) -> Self {
        InstantSend {
            syncer,
            votes: Mutex::new(HashMap::new()),
        }
    }

    pub fn vote_count(&self, tx_hash: &Hash) -> usize {
        self.votes.lock().get(tx_hash).copied().unwrap_or(0)
    }

    pub fn is_locked(&self, tx_hash: &Hash) -> bool {
        self.vote_count(tx_hash) >= INSTANT_SEND_REQUIRED_VOTES
    }
}

impl InventoryItemsHandler for InstantSend {
    fn handle_inventory_items(&self, host: &str, items: &[InventoryItem], actions: &mut GroupActions) {
        let hashes_of = |inv_type: u32| -> Vec<Hash> {
            items
                .iter()
                .filter(|item| item.inv_type == inv_type)
                .map(|item| item.hash)
                .collect()
        };
        let lock_requests = hashes_of(INV_MSG_TXLOCK_REQUEST);
        let lock_votes = hashes_of(INV_MSG_TXLOCK_VOTE);
        if !lock_requests.is_empty() {
            actions
                .peer_tasks
                .push((host.to_string(), PeerTask::request_transaction_lock_requests(lock_requests)));
        }
        if !lock_votes.is_empty() {
            actions
                .peer_tasks
                .push((host.to_string(), PeerTask::request_transaction_lock_votes(lock_votes)));
        }
    }
}

impl PeerTaskHandler for InstantSend {
    fn handle_completed_task(&self, host: &str, task: &PeerTask, _actions: &mut GroupActions) -> bool {
        match task {
            PeerTask::RequestTransactionLockRequests(request) => {
                if let Err(e) = self.syncer.handle_transactions(request.transactions.clone()) {
                    warn!(peer = %host, error = %e, "failed to process lock requests");
                }
                true
            }
            PeerTask::RequestTransactionLockVotes(request) => {
                let mut votes = self.votes.lock();
                for vote in &request.votes {
                    let count = votes.entry(vote.tx_hash).or_default();
                    *count += 1;
                    debug!(hash = %hash_to_hex(&vote.tx_hash), votes = *count, "lock vote received");
                }
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct MasternodeList {
    block_hash: Option<Hash>,
    /// Keyed by `Masternode::sort_key`
    entries: BTreeMap<Hash, Masternode>,
}

/// Verified masternode list, advanced one diff at a time.
pub struct MasternodeListManager {
    storage: Arc<Storage>,
    list: Mutex<MasternodeList>,
}

impl MasternodeListManager {
    pub fn new(storage: Arc<Storage>) -> Self {
        MasternodeListManager {
            storage,
            list: Mutex::new(MasternodeList::default()),
        }
    }

    /// Block of the current list; all zeros before the first diff.
    pub fn base_block_hash(&self) -> Hash {
        self.list.lock().block_hash.unwrap_or([0; 32])
    }

    pub fn masternodes(&self) -> Vec<Masternode> {
        self.list.lock().entries.values().cloned().collect()
    }

    /// UpdateList: MasternodeListDiff → ok | InvalidMasternodeList
    ///
    /// 1. The diff must start at the current list's block
    /// 2. The coinbase must be matched by the diff's partial merkle tree, whose
    ///    root equals the stored header's when the block is known
    /// 3. Deleted entries are removed, new and changed ones replaced
    /// 4. The sorted list's merkle root must equal the coinbase payload's
    ///
    /// The current list is left untouched when any check fails.
    pub fn update_list(&self, diff: &MasternodeListDiff) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidMasternodeList(reason.to_string());
        let mut list = self.list.lock();
        if diff.base_block_hash != list.block_hash.unwrap_or([0; 32]) {
            return Err(invalid("diff does not start at the current list"));
        }

        let tree = PartialMerkleTree::new(diff.total_transactions, diff.merkle_hashes.clone(), diff.merkle_flags.clone());
        let (root, matched) = tree.extract_matches()?;
        if !matched.contains(&diff.cb_tx.hash) {
            return Err(invalid("coinbase not in merkle tree"));
        }
        let header_root = self
            .storage
            .read(|records| records.block(&diff.block_hash).map(|block| *block.header.merkle_root()));
        if header_root.is_some_and(|header_root| header_root != root) {
            return Err(ValidationError::WrongMerkleRoot);
        }

        let coinbase = CoinbaseTransaction::from_transaction(&diff.cb_tx).map_err(|e| invalid(&e.to_string()))?;

        let mut entries = list.entries.clone();
        for deleted in &diff.deleted_masternodes {
            let mut key = *deleted;
            key.reverse();
            entries.remove(&key);
        }
        for masternode in &diff.masternodes {
            entries.insert(masternode.sort_key(), masternode.clone());
        }

        let hashes: Vec<Hash> = entries.values().map(Masternode::hash).collect();
        let list_root = merkle_root(&hashes).unwrap_or([0; 32]);
        if list_root != coinbase.merkle_root_mn_list {
            return Err(invalid("masternode list merkle root mismatch"));
        }

        info!(block = %hash_to_hex(&diff.block_hash), masternodes = entries.len(), "masternode list updated");
        list.entries = entries;
        list.block_hash = Some(diff.block_hash);
        Ok(())
    }
}

/// Requests list diffs and applies them; a bad diff drops the peer and is asked again.
pub struct MasternodeListSyncer {
    peer_group: PeerGroupHandle,
    manager: Arc<MasternodeListManager>,
}

impl MasternodeListSyncer {
    pub fn new(peer_group: PeerGroupHandle, manager: Arc<MasternodeListManager>) -> Self {
        MasternodeListSyncer { peer_group, manager }
    }

    pub fn manager(&self) -> &Arc<MasternodeListManager> {
        &self.manager
    }

    /// Queue a diff from the current list to `block_hash`.
    pub async fn sync(&self, block_hash: Hash) -> Result<(), crate::error::PeerGroupError> {
        let task = PeerTask::request_masternode_list_diff(self.manager.base_block_hash(), block_hash);
        self.peer_group.add_task(task).await
    }
}

impl PeerTaskHandler for MasternodeListSyncer {
    fn handle_completed_task(&self, host: &str, task: &PeerTask, actions: &mut GroupActions) -> bool {
        let PeerTask::RequestMasternodeListDiff(request) = task else {
            return false;
        };
        let Some(diff) = &request.diff else {
            return true;
        };
        if let Err(e) = self.manager.update_list(diff) {
            warn!(peer = %host, error = %e, "invalid masternode list diff");
            actions.disconnects.push((host.to_string(), e.to_string()));
            actions
                .group_tasks
                .push(PeerTask::request_masternode_list_diff(diff.base_block_hash, diff.block_hash));
        }
        true
    }
}

/// Once the chain is caught up, bring the list up to the tip.
impl PeerGroupListener for MasternodeListSyncer {
    fn on_all_peers_synced(&self, actions: &mut GroupActions) {
        let tip = self
            .manager
            .storage
            .read(|records| records.last_block().map(|block| *block.hash()));
        let base = self.manager.base_block_hash();
        if let Some(tip) = tip.filter(|tip| *tip != base) {
            actions
                .group_tasks
                .push(PeerTask::request_masternode_list_diff(base, tip));
        }
    }
}
