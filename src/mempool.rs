//! Unconfirmed transaction intake from inv announcements

use crate::peer_group::{GroupActions, InventoryItemsHandler, PeerGroupListener, PeerTaskHandler};
use crate::peer_task::PeerTask;
use crate::transaction_syncer::TransactionSyncer;
use crate::types::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fetches announced transactions once per host and feeds them to the syncer.
pub struct MempoolTransactions {
    syncer: Arc<TransactionSyncer>,
    requested: Mutex<HashMap<String, Vec<Hash>>>,
}

impl MempoolTransactions {
    pub fn new(syncer: Arc<TransactionSyncer>) -> Self {
        MempoolTransactions {
            syncer,
            requested: Mutex::new(HashMap::new()),
        }
    }

    fn is_requested(&self, hash: &Hash) -> bool {
        self.requested.lock().values().any(|hashes| hashes.contains(hash))
    }

    fn remove_requested(&self, host: &str, hashes: &[Hash]) {
        let mut requested = self.requested.lock();
        if let Some(pending) = requested.get_mut(host) {
            pending.retain(|hash| !hashes.contains(hash));
            if pending.is_empty() {
                requested.remove(host);
            }
        }
    }

    pub fn requested_count(&self, host: &str) -> usize {
        self.requested.lock().get(host).map_or(0, Vec::len)
    }
}

impl InventoryItemsHandler for MempoolTransactions {
    fn handle_inventory_items(&self, host: &str, items: &[InventoryItem], actions: &mut GroupActions) {
        let hashes: Vec<Hash> = items
            .iter()
            .filter(|item| item.inv_type == INV_MSG_TX)
            .map(|item| item.hash)
            .filter(|hash| !self.is_requested(hash) && self.syncer.should_request_transaction(hash))
            .collect();
        if hashes.is_empty() {
            return;
        }
        debug!(peer = %host, count = hashes.len(), "requesting announced transactions");
        self.requested
            .lock()
            .entry(host.to_string())
            .or_default()
            .extend(hashes.iter().copied());
        actions.peer_tasks.push((host.to_string(), PeerTask::request_transactions(hashes)));
    }
}

impl PeerTaskHandler for MempoolTransactions {
    fn handle_completed_task(&self, host: &str, task: &PeerTask, _actions: &mut GroupActions) -> bool {
        match task {
            PeerTask::RequestTransactions(request) => {
                let hashes: Vec<Hash> = request.transactions.iter().map(|tx| tx.hash).collect();
                // Hashes the peer never delivered are dropped too
                let mut done = hashes.clone();
                done.extend(request.hashes.iter().copied());
                self.remove_requested(host, &done);
                if let Err(e) = self.syncer.handle_transactions(request.transactions.clone()) {
                    warn!(peer = %host, error = %e, "failed to process mempool transactions");
                }
                true
            }
            PeerTask::SendTransaction(send) => {
                // Attempts are counted per broadcast round by the sender
                debug!(peer = %host, hash = %hash_to_hex(&send.transaction.hash), "transaction served to peer");
                true
            }
            _ => false,
        }
    }
}

impl PeerGroupListener for MempoolTransactions {
    fn on_peer_disconnect(&self, host: &str, _error: Option<&str>) {
        self.requested.lock().remove(host);
    }
}
