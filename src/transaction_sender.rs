//! Broadcast of pending outgoing transactions

use crate::error::{PeerGroupError, SpvError};
use crate::peer_group::{GroupActions, PeerGroupHandle, PeerGroupListener};
use crate::peer_task::PeerTask;
use crate::transaction_syncer::TransactionSyncer;
use crate::types::*;
use std::sync::Arc;
use tracing::{info, warn};

pub struct TransactionSender {
    syncer: Arc<TransactionSyncer>,
    peer_group: PeerGroupHandle,
}

impl TransactionSender {
    pub fn new(syncer: Arc<TransactionSyncer>, peer_group: PeerGroupHandle) -> Self {
        TransactionSender { syncer, peer_group }
    }

    /// Broadcast requires a connected peer and half of the pool synced.
    pub fn can_send(&self) -> Result<(), PeerGroupError> {
        self.peer_group.check_peers_synced()
    }

    /// SendPendingTransactions: () → number broadcast
    ///
    /// Every pending transaction the retry policy allows goes to all peers;
    /// each round counts as one attempt.
    pub fn send_pending_transactions(&self) -> Result<usize, SpvError> {
        self.can_send()?;
        let pending = self.syncer.pending_transactions();
        for transaction in &pending {
            self.peer_group.broadcast(PeerTask::send_transaction(transaction.clone()))?;
            self.syncer.handle_sent_transaction(transaction)?;
            info!(hash = %hash_to_hex(&transaction.hash), "transaction broadcast");
        }
        Ok(pending.len())
    }
}

impl PeerGroupListener for TransactionSender {
    fn on_all_peers_synced(&self, actions: &mut GroupActions) {
        for transaction in self.syncer.pending_transactions() {
            if let Err(e) = self.syncer.handle_sent_transaction(&transaction) {
                warn!(hash = %hash_to_hex(&transaction.hash), error = %e, "failed to record broadcast");
                continue;
            }
            actions.broadcast.push(PeerTask::send_transaction(transaction));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressConverterChain;
    use crate::address_manager::AddressManager;
    use crate::bloom::BloomFilterManager;
    use crate::constants::DEFAULT_TASK_QUEUE_CAPACITY;
    use crate::keys::HdWallet;
    use crate::listener::{DataProvider, ListenerDispatcher};
    use crate::params::{NetworkKind, NetworkParams};
    use crate::peer::PeerHandle;
    use crate::peer_group::{GroupCommand, PeerGroupInbox};
    use crate::peer_manager::PeerInfo;
    use crate::script::p2pkh_script;
    use crate::storage::Storage;
    use crate::transaction_extractor::TransactionExtractor;
    use crate::transaction_processor::TransactionProcessor;
    use crate::transaction_syncer::RetryPolicy;
    use crate::unspent::UnspentOutputProvider;
    use tokio::sync::mpsc;

    fn sender() -> (TransactionSender, PeerGroupInbox, Arc<Storage>) {
        let params = NetworkParams::for_network(NetworkKind::RegTest);
        let storage = Arc::new(Storage::in_memory("sender"));
        let converters = Arc::new(AddressConverterChain::for_network(&params).unwrap());
        let manager = Arc::new(AddressManager::new(
            Arc::new(HdWallet::new(&[4u8; 32], params.coin_type).unwrap()),
            converters.clone(),
            2,
        ));
        storage
            .with_transaction(|records| manager.fill_gap(records).map_err(SpvError::from))
            .unwrap();
        let syncer = Arc::new(TransactionSyncer::new(
            storage.clone(),
            Arc::new(TransactionProcessor::new(TransactionExtractor::new(converters), manager.clone())),
            manager,
            Arc::new(BloomFilterManager::new()),
            Arc::new(DataProvider::new(storage.clone(), UnspentOutputProvider::new(1), Arc::new(ListenerDispatcher::new()))),
            RetryPolicy::default(),
        ));
        let (handle, inbox) = PeerGroupHandle::channel(DEFAULT_TASK_QUEUE_CAPACITY);
        (TransactionSender::new(syncer, handle), inbox, storage)
    }

    fn pending(storage: &Storage) -> Transaction {
        let mut tx = Transaction::new(1, vec![], vec![TransactionOutput::new(2_000, p2pkh_script(&[3; 20]), 0)], 0);
        tx.is_outgoing = true;
        tx.is_mine = true;
        storage
            .with_transaction(|records| records.save_transaction(tx.clone()))
            .unwrap();
        tx
    }

    fn add_synced_peer(sender: &TransactionSender, host: &str) {
        let (commands, _) = mpsc::unbounded_channel();
        let mut info = PeerInfo::new(PeerHandle::new(host, commands));
        info.connected = true;
        info.synced = true;
        sender.peer_group.registry().lock().add(info);
    }

    #[test]
    fn test_send_requires_synced_peers() {
        let (sender, _inbox, storage) = sender();
        let tx = pending(&storage);
        assert_eq!(
            sender.send_pending_transactions(),
            Err(SpvError::PeerGroup(PeerGroupError::NoConnectedPeers))
        );
        assert!(storage.read(|records| records.sent_transaction(&tx.hash).is_none()));
    }

    #[test]
    fn test_pending_transaction_broadcast_once_per_round() {
        let (sender, mut inbox, storage) = sender();
        let tx = pending(&storage);
        add_synced_peer(&sender, "10.0.0.1");

        assert_eq!(sender.send_pending_transactions().unwrap(), 1);
        let Some(GroupCommand::Broadcast(PeerTask::SendTransaction(task))) = inbox.try_next_command() else {
            panic!("expected a broadcast");
        };
        assert_eq!(task.transaction.hash, tx.hash);
        let sent = storage.read(|records| records.sent_transaction(&tx.hash).cloned()).unwrap();
        assert_eq!(sent.retries_count, 0);

        // Inside the retry interval nothing goes out again
        assert_eq!(sender.send_pending_transactions().unwrap(), 0);
    }

    #[test]
    fn test_all_peers_synced_queues_broadcast() {
        let (sender, _inbox, storage) = sender();
        pending(&storage);
        let mut actions = GroupActions::default();
        sender.on_all_peers_synced(&mut actions);
        assert_eq!(actions.broadcast.len(), 1);

        let mut again = GroupActions::default();
        sender.on_all_peers_synced(&mut again);
        assert!(again.broadcast.is_empty());
    }
}
