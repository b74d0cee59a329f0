//! Request/response exchanges run one at a time on a peer
//!
//! Tasks never touch sockets. A peer feeds them incoming messages and sends
//! whatever they return, which keeps every exchange testable in isolation.

use crate::dash::{MasternodeListDiff, TransactionLockVote};
use crate::error::{ProtocolError, SpvError};
use crate::merkle::validate_merkle_block;
use crate::network::{GetHeadersMessage, NetworkMessage};
use crate::types::*;
use std::collections::VecDeque;

/// Result of feeding a task one message (or starting it).
#[derive(Debug, Default)]
pub struct TaskStep {
    /// The message belonged to this task
    pub handled: bool,
    pub completed: bool,
    pub outgoing: Vec<NetworkMessage>,
    /// Merkle blocks whose matched transactions all arrived, in chain order
    pub merkle_blocks: Vec<MerkleBlock>,
}

impl TaskStep {
    fn handled() -> Self {
        TaskStep {
            handled: true,
            ..Default::default()
        }
    }

    fn completed() -> Self {
        TaskStep {
            handled: true,
            completed: true,
            ..Default::default()
        }
    }

    fn send(messages: Vec<NetworkMessage>) -> Self {
        TaskStep {
            outgoing: messages,
            ..Default::default()
        }
    }
}

fn inventory(inv_type: u32, hashes: &[Hash]) -> Vec<InventoryItem> {
    hashes.iter().map(|hash| InventoryItem::new(inv_type, *hash)).collect()
}

/// getheaders with a block locator; completes with up to 2000 headers.
#[derive(Debug, Clone)]
pub struct GetBlockHashesTask {
    pub protocol_version: u32,
    pub block_locator_hashes: Vec<Hash>,
    pub headers: Vec<Header>,
}

impl GetBlockHashesTask {
    fn start(&mut self) -> TaskStep {
        TaskStep::send(vec![NetworkMessage::GetHeaders(GetHeadersMessage {
            version: self.protocol_version,
            block_locator_hashes: self.block_locator_hashes.clone(),
            hash_stop: [0; 32],
        })])
    }

    fn handle_message(&mut self, message: &NetworkMessage) -> TaskStep {
        match message {
            NetworkMessage::Headers(headers) => {
                self.headers = headers.clone();
                TaskStep::completed()
            }
            _ => TaskStep::default(),
        }
    }
}

/// getdata for filtered blocks, terminated by a ping/pong round trip.
#[derive(Debug, Clone)]
pub struct GetMerkleBlocksTask {
    pub block_hashes: Vec<Hash>,
    pub ping_nonce: u64,
    pending: VecDeque<MerkleBlock>,
    pub received_count: usize,
}

impl GetMerkleBlocksTask {
    pub fn new(block_hashes: Vec<Hash>) -> Self {
        GetMerkleBlocksTask {
            block_hashes,
            ping_nonce: rand::random(),
            pending: VecDeque::new(),
            received_count: 0,
        }
    }

    fn start(&mut self) -> TaskStep {
        TaskStep::send(vec![
            NetworkMessage::GetData(inventory(INV_MSG_FILTERED_BLOCK, &self.block_hashes)),
            NetworkMessage::Ping(self.ping_nonce),
        ])
    }

    fn drain_complete(&mut self, step: &mut TaskStep) {
        while self.pending.front().is_some_and(MerkleBlock::is_complete) {
            if let Some(merkle_block) = self.pending.pop_front() {
                step.merkle_blocks.push(merkle_block);
            }
        }
    }

    fn handle_message(&mut self, message: &NetworkMessage) -> Result<TaskStep, SpvError> {
        let mut step = TaskStep::default();
        match message {
            NetworkMessage::MerkleBlock(message) => {
                if !self.block_hashes.contains(message.header.hash()) {
                    return Ok(step);
                }
                let merkle_block = validate_merkle_block(message)?;
                self.received_count += 1;
                self.pending.push_back(merkle_block);
                step.handled = true;
            }
            NetworkMessage::Tx(transaction) => {
                let Some(merkle_block) = self
                    .pending
                    .iter_mut()
                    .find(|block| block.matched_hashes.contains(&transaction.hash))
                else {
                    return Ok(step);
                };
                step.handled = merkle_block.add_transaction(transaction.clone());
            }
            NetworkMessage::Pong(nonce) if *nonce == self.ping_nonce => {
                self.drain_complete(&mut step);
                if !self.pending.is_empty() {
                    return Err(ProtocolError::Malformed("merkle block transactions missing".into()).into());
                }
                step.handled = true;
                step.completed = true;
                return Ok(step);
            }
            _ => return Ok(step),
        }
        self.drain_complete(&mut step);
        Ok(step)
    }
}

/// getdata for announced transactions.
#[derive(Debug, Clone)]
pub struct RequestTransactionsTask {
    pub hashes: Vec<Hash>,
    pub transactions: Vec<Transaction>,
}

impl RequestTransactionsTask {
    fn start(&mut self) -> TaskStep {
        TaskStep::send(vec![NetworkMessage::GetData(inventory(INV_MSG_TX, &self.hashes))])
    }

    fn handle_message(&mut self, message: &NetworkMessage) -> TaskStep {
        match message {
            NetworkMessage::Tx(transaction) => {
                let Some(position) = self.hashes.iter().position(|hash| hash == &transaction.hash) else {
                    return TaskStep::default();
                };
                self.hashes.remove(position);
                self.transactions.push(transaction.clone());
            }
            NetworkMessage::NotFound(items) => {
                let before = self.hashes.len();
                self.hashes.retain(|hash| !items.iter().any(|item| &item.hash == hash));
                if before == self.hashes.len() {
                    return TaskStep::default();
                }
            }
            _ => return TaskStep::default(),
        }
        if self.hashes.is_empty() {
            TaskStep::completed()
        } else {
            TaskStep::handled()
        }
    }
}

/// Announce a transaction with inv and serve it when the peer asks.
#[derive(Debug, Clone)]
pub struct SendTransactionTask {
    pub transaction: Transaction,
}

impl SendTransactionTask {
    fn start(&mut self) -> TaskStep {
        TaskStep::send(vec![NetworkMessage::Inv(vec![InventoryItem::new(
            INV_MSG_TX,
            self.transaction.hash,
        )])])
    }

    fn handle_message(&mut self, message: &NetworkMessage) -> TaskStep {
        match message {
            NetworkMessage::GetData(items)
                if items
                    .iter()
                    .any(|item| item.inv_type == INV_MSG_TX && item.hash == self.transaction.hash) =>
            {
                let mut step = TaskStep::completed();
                step.outgoing.push(NetworkMessage::Tx(self.transaction.clone()));
                step
            }
            _ => TaskStep::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestTransactionLockRequestsTask {
    pub hashes: Vec<Hash>,
    pub transactions: Vec<Transaction>,
}

impl RequestTransactionLockRequestsTask {
    fn start(&mut self) -> TaskStep {
        TaskStep::send(vec![NetworkMessage::GetData(inventory(INV_MSG_TXLOCK_REQUEST, &self.hashes))])
    }

    fn handle_message(&mut self, message: &NetworkMessage) -> TaskStep {
        let NetworkMessage::TransactionLock(transaction) = message else {
            return TaskStep::default();
        };
        let Some(position) = self.hashes.iter().position(|hash| hash == &transaction.hash) else {
            return TaskStep::default();
        };
        self.hashes.remove(position);
        self.transactions.push(transaction.clone());
        if self.hashes.is_empty() {
            TaskStep::completed()
        } else {
            TaskStep::handled()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestTransactionLockVotesTask {
    pub hashes: Vec<Hash>,
    pub votes: Vec<TransactionLockVote>,
}

impl RequestTransactionLockVotesTask {
    fn start(&mut self) -> TaskStep {
        TaskStep::send(vec![NetworkMessage::GetData(inventory(INV_MSG_TXLOCK_VOTE, &self.hashes))])
    }

    fn handle_message(&mut self, message: &NetworkMessage) -> TaskStep {
        let NetworkMessage::TransactionLockVote(vote) = message else {
            return TaskStep::default();
        };
        let hash = vote.hash();
        let Some(position) = self.hashes.iter().position(|candidate| candidate == &hash) else {
            return TaskStep::default();
        };
        self.hashes.remove(position);
        self.votes.push(vote.clone());
        if self.hashes.is_empty() {
            TaskStep::completed()
        } else {
            TaskStep::handled()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestMasternodeListDiffTask {
    pub base_block_hash: Hash,
    pub block_hash: Hash,
    pub diff: Option<MasternodeListDiff>,
}

impl RequestMasternodeListDiffTask {
    fn start(&mut self) -> TaskStep {
        TaskStep::send(vec![NetworkMessage::GetMasternodeListDiff {
            base_block_hash: self.base_block_hash,
            block_hash: self.block_hash,
        }])
    }

    fn handle_message(&mut self, message: &NetworkMessage) -> TaskStep {
        match message {
            NetworkMessage::MasternodeListDiff(diff)
                if diff.base_block_hash == self.base_block_hash && diff.block_hash == self.block_hash =>
            {
                self.diff = Some(diff.clone());
                TaskStep::completed()
            }
            _ => TaskStep::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeerTask {
    GetBlockHashes(GetBlockHashesTask),
    GetMerkleBlocks(GetMerkleBlocksTask),
    RequestTransactions(RequestTransactionsTask),
    SendTransaction(SendTransactionTask),
    RequestTransactionLockRequests(RequestTransactionLockRequestsTask),
    RequestTransactionLockVotes(RequestTransactionLockVotesTask),
    RequestMasternodeListDiff(RequestMasternodeListDiffTask),
}

impl PeerTask {
    pub fn get_block_hashes(protocol_version: u32, block_locator_hashes: Vec<Hash>) -> Self {
        PeerTask::GetBlockHashes(GetBlockHashesTask {
            protocol_version,
            block_locator_hashes,
            headers: Vec::new(),
        })
    }

    pub fn get_merkle_blocks(block_hashes: Vec<Hash>) -> Self {
        PeerTask::GetMerkleBlocks(GetMerkleBlocksTask::new(block_hashes))
    }

    pub fn request_transactions(hashes: Vec<Hash>) -> Self {
        PeerTask::RequestTransactions(RequestTransactionsTask {
            hashes,
            transactions: Vec::new(),
        })
    }

    pub fn send_transaction(transaction: Transaction) -> Self {
        PeerTask::SendTransaction(SendTransactionTask { transaction })
    }

    pub fn request_transaction_lock_requests(hashes: Vec<Hash>) -> Self {
        PeerTask::RequestTransactionLockRequests(RequestTransactionLockRequestsTask {
            hashes,
            transactions: Vec::new(),
        })
    }

    pub fn request_transaction_lock_votes(hashes: Vec<Hash>) -> Self {
        PeerTask::RequestTransactionLockVotes(RequestTransactionLockVotesTask {
            hashes,
            votes: Vec::new(),
        })
    }

    pub fn request_masternode_list_diff(base_block_hash: Hash, block_hash: Hash) -> Self {
        PeerTask::RequestMasternodeListDiff(RequestMasternodeListDiffTask {
            base_block_hash,
            block_hash,
            diff: None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerTask::GetBlockHashes(_) => "GetBlockHashes",
            PeerTask::GetMerkleBlocks(_) => "GetMerkleBlocks",
            PeerTask::RequestTransactions(_) => "RequestTransactions",
            PeerTask::SendTransaction(_) => "SendTransaction",
            PeerTask::RequestTransactionLockRequests(_) => "RequestTransactionLockRequests",
            PeerTask::RequestTransactionLockVotes(_) => "RequestTransactionLockVotes",
            PeerTask::RequestMasternodeListDiff(_) => "RequestMasternodeListDiff",
        }
    }

    /// Messages to send when the task becomes the peer's current one.
    pub fn start(&mut self) -> TaskStep {
        match self {
            PeerTask::GetBlockHashes(task) => task.start(),
            PeerTask::GetMerkleBlocks(task) => task.start(),
            PeerTask::RequestTransactions(task) => task.start(),
            PeerTask::SendTransaction(task) => task.start(),
            PeerTask::RequestTransactionLockRequests(task) => task.start(),
            PeerTask::RequestTransactionLockVotes(task) => task.start(),
            PeerTask::RequestMasternodeListDiff(task) => task.start(),
        }
    }

    /// Feed one incoming message. An error closes the peer.
    pub fn handle_message(&mut self, message: &NetworkMessage) -> Result<TaskStep, SpvError> {
        Ok(match self {
            PeerTask::GetBlockHashes(task) => task.handle_message(message),
            PeerTask::GetMerkleBlocks(task) => return task.handle_message(message),
            PeerTask::RequestTransactions(task) => task.handle_message(message),
            PeerTask::SendTransaction(task) => task.handle_message(message),
            PeerTask::RequestTransactionLockRequests(task) => task.handle_message(message),
            PeerTask::RequestTransactionLockVotes(task) => task.handle_message(message),
            PeerTask::RequestMasternodeListDiff(task) => task.handle_message(message),
        })
    }

    /// No response within the idle window. Best-effort exchanges finish with
    /// what they have; chain download exchanges fail the peer.
    pub fn handle_timeout(&mut self) -> Result<(), ProtocolError> {
        match self {
            PeerTask::GetBlockHashes(_) | PeerTask::GetMerkleBlocks(_) | PeerTask::RequestMasternodeListDiff(_) => {
                Err(ProtocolError::Timeout(self.name().to_string()))
            }
            _ => Ok(()),
        }
    }
}
