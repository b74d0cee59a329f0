//! Wallet notifications and the read-side data provider
//!
//! Engine components publish `WalletEvent`s on an unbounded channel; one
//! worker task drains it and calls the registered listeners in order, so
//! listener code never runs on a sync or network task.

use crate::storage::{Storage, WalletRecords};
use crate::transaction_processor::ProcessOutcome;
use crate::types::*;
use crate::unspent::UnspentOutputProvider;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Transaction as presented to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub hash: String,
    /// Net effect on the wallet: received minus spent
    pub amount: i64,
    pub block_height: Option<u32>,
    pub timestamp: u64,
    pub status: TransactionStatus,
    pub is_outgoing: bool,
    pub from: Vec<String>,
    pub to: Vec<TransactionAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAddress {
    pub address: String,
    pub mine: bool,
}

impl TransactionInfo {
    pub fn from_records(records: &WalletRecords, transaction: &Transaction) -> Self {
        let received: u64 = transaction
            .outputs
            .iter()
            .filter(|output| output.public_key_path.is_some())
            .map(|output| output.value)
            .sum();
        let spent: u64 = transaction
            .inputs
            .iter()
            .filter_map(|input| records.previous_output(&input.previous_output))
            .filter(|previous| previous.public_key_path.is_some())
            .map(|previous| previous.value)
            .sum();

        TransactionInfo {
            hash: hash_to_hex(&transaction.hash),
            amount: received as i64 - spent as i64,
            block_height: transaction
                .block_hash
                .and_then(|hash| records.block(&hash))
                .map(|block| block.height),
            timestamp: transaction.timestamp,
            status: transaction.status,
            is_outgoing: transaction.is_outgoing,
            from: transaction.inputs.iter().filter_map(|input| input.address.clone()).collect(),
            to: transaction
                .outputs
                .iter()
                .filter_map(|output| {
                    output.address.clone().map(|address| TransactionAddress {
                        address,
                        mine: output.public_key_path.is_some(),
                    })
                })
                .collect(),
        }
    }
}

/// Callbacks for the embedding application. All have empty defaults.
pub trait WalletListener: Send + Sync {
    fn on_balance_update(&self, _balance: u64) {}
    fn on_last_block_info_update(&self, _info: BlockInfo) {}
    fn on_transactions_update(&self, _inserted: Vec<TransactionInfo>, _updated: Vec<TransactionInfo>, _deleted: Vec<String>) {}
    fn on_kit_state_update(&self, _state: SyncState) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum WalletEvent {
    Balance(u64),
    LastBlockInfo(BlockInfo),
    Transactions {
        inserted: Vec<TransactionInfo>,
        updated: Vec<TransactionInfo>,
        deleted: Vec<String>,
    },
    KitState(SyncState),
}

fn deliver(listener: &dyn WalletListener, event: WalletEvent) {
    match event {
        WalletEvent::Balance(balance) => listener.on_balance_update(balance),
        WalletEvent::LastBlockInfo(info) => listener.on_last_block_info_update(info),
        WalletEvent::Transactions {
            inserted,
            updated,
            deleted,
        } => listener.on_transactions_update(inserted, updated, deleted),
        WalletEvent::KitState(state) => listener.on_kit_state_update(state),
    }
}

/// Queue of wallet events drained by a single worker.
pub struct ListenerDispatcher {
    sender: mpsc::UnboundedSender<WalletEvent>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<WalletEvent>>>,
    listeners: Mutex<Vec<Arc<dyn WalletListener>>>,
}

impl ListenerDispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        ListenerDispatcher {
            sender,
            receiver: Mutex::new(Some(receiver)),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Listeners added after `start` are not called.
    pub fn add_listener(&self, listener: Arc<dyn WalletListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn dispatch(&self, event: WalletEvent) {
        // Fails only once the worker is gone during shutdown
        let _ = self.sender.send(event);
    }

    /// Spawn the worker; events queued before this call are delivered first.
    /// Returns `None` when the worker is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let mut receiver = self.receiver.lock().take()?;
        let listeners = self.listeners.lock().clone();
        Some(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                for listener in &listeners {
                    deliver(listener.as_ref(), event.clone());
                }
            }
            debug!("listener dispatcher stopped");
        }))
    }
}

impl Default for ListenerDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side view of the wallet that turns storage changes into events.
pub struct DataProvider {
    storage: Arc<Storage>,
    unspent_provider: UnspentOutputProvider,
    dispatcher: Arc<ListenerDispatcher>,
    balance: Mutex<Option<u64>>,
    last_block_info: Mutex<Option<BlockInfo>>,
}

impl DataProvider {
    pub fn new(storage: Arc<Storage>, unspent_provider: UnspentOutputProvider, dispatcher: Arc<ListenerDispatcher>) -> Self {
        DataProvider {
            storage,
            unspent_provider,
            dispatcher,
            balance: Mutex::new(None),
            last_block_info: Mutex::new(None),
        }
    }

    pub fn balance(&self) -> u64 {
        self.storage.read(|records| self.unspent_provider.balance(records))
    }

    pub fn last_block_info(&self) -> Option<BlockInfo> {
        self.storage.read(|records| records.last_block().map(BlockInfo::from))
    }

    /// Transactions newest first. Paging starts after `from_hash` when given.
    pub fn transactions(&self, from_hash: Option<&str>, limit: Option<usize>) -> Vec<TransactionInfo> {
        self.storage.read(|records| {
            let mut transactions: Vec<&Transaction> = records.transactions().iter().collect();
            transactions.sort_by_key(|tx| std::cmp::Reverse((tx.timestamp, tx.order)));
            let start = from_hash
                .and_then(|hash| transactions.iter().position(|tx| hash_to_hex(&tx.hash) == hash))
                .map_or(0, |position| position + 1);
            transactions
                .into_iter()
                .skip(start)
                .take(limit.unwrap_or(usize::MAX))
                .map(|tx| TransactionInfo::from_records(records, tx))
                .collect()
        })
    }

    fn publish_balance(&self) {
        let balance = self.balance();
        let mut last = self.balance.lock();
        if *last != Some(balance) {
            *last = Some(balance);
            self.dispatcher.dispatch(WalletEvent::Balance(balance));
        }
    }

    /// Report what a processing pass changed, then the balance if it moved.
    pub fn on_transactions_changed(&self, outcome: &ProcessOutcome) {
        if outcome.is_empty() {
            return;
        }
        let (inserted, updated) = self.storage.read(|records| {
            let info = |hashes: &[Hash]| -> Vec<TransactionInfo> {
                hashes
                    .iter()
                    .filter_map(|hash| records.transaction(hash))
                    .map(|tx| TransactionInfo::from_records(records, tx))
                    .collect()
            };
            (info(&outcome.inserted), info(&outcome.updated))
        });
        self.dispatcher.dispatch(WalletEvent::Transactions {
            inserted,
            updated,
            deleted: outcome.deleted.iter().map(hash_to_hex).collect(),
        });
        self.publish_balance();
    }

    /// Report a new chain tip; confirmations may have unlocked balance.
    pub fn on_blocks_changed(&self) {
        if let Some(info) = self.last_block_info() {
            let mut last = self.last_block_info.lock();
            if last.as_ref() != Some(&info) {
                *last = Some(info.clone());
                self.dispatcher.dispatch(WalletEvent::LastBlockInfo(info));
            }
        }
        self.publish_balance();
    }

    pub fn on_kit_state_changed(&self, state: SyncState) {
        self.dispatcher.dispatch(WalletEvent::KitState(state));
    }
}
