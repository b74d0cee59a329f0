//! Outgoing payment creation

use crate::address_manager::AddressManager;
use crate::bloom::BloomFilterManager;
use crate::error::{Result, SpvError, TransactionCreationError};
use crate::listener::DataProvider;
use crate::storage::Storage;
use crate::transaction_builder::TransactionBuilder;
use crate::transaction_processor::{ProcessOutcome, TransactionProcessor};
use crate::transaction_sender::TransactionSender;
use crate::types::*;
use std::sync::Arc;
use tracing::{info, warn};

pub struct TransactionCreator {
    storage: Arc<Storage>,
    builder: TransactionBuilder,
    processor: Arc<TransactionProcessor>,
    address_manager: Arc<AddressManager>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    sender: Arc<TransactionSender>,
    data_provider: Arc<DataProvider>,
}

impl TransactionCreator {
    pub fn new(
        storage: Arc<Storage>,
        builder: TransactionBuilder,
        processor: Arc<TransactionProcessor>,
        address_manager: Arc<AddressManager>,
        bloom_filter_manager: Arc<BloomFilterManager>,
        sender: Arc<TransactionSender>,
        data_provider: Arc<DataProvider>,
    ) -> Self {
        TransactionCreator {
            storage,
            builder,
            processor,
            address_manager,
            bloom_filter_manager,
            sender,
            data_provider,
        }
    }

    /// Create: address × value × fee rate × sender pays → Transaction
    ///
    /// 1. Peers must be ready to take the broadcast
    /// 2. Build, sign and store the transaction and refill the key gap in one
    ///    storage transaction; any failure leaves the wallet untouched
    /// 3. Reload the bloom filter with the new change key and outpoint
    /// 4. Notify listeners, then broadcast
    pub fn create(&self, address: &str, value: u64, fee_rate: u64, sender_pays: bool) -> Result<Transaction> {
        self.sender.can_send().map_err(TransactionCreationError::PeersNotReady)?;
        self.create_unchecked(address, value, fee_rate, sender_pays)
    }

    fn create_unchecked(&self, address: &str, value: u64, fee_rate: u64, sender_pays: bool) -> Result<Transaction> {
        let transaction = self.storage.with_transaction(|records| {
            let built = self.builder.build_transaction(records, value, address, fee_rate, sender_pays)?;
            let transaction = self.processor.process_outgoing(records, built)?;
            self.address_manager.fill_gap(records)?;
            Ok::<_, SpvError>(transaction)
        })?;
        info!(hash = %hash_to_hex(&transaction.hash), value, "outgoing transaction created");
        self.storage.read(|records| self.bloom_filter_manager.regenerate(records));

        self.data_provider.on_transactions_changed(&ProcessOutcome {
            inserted: vec![transaction.hash],
            ..ProcessOutcome::default()
        });
        if let Err(e) = self.sender.send_pending_transactions() {
            warn!(error = %e, "broadcast deferred");
        }
        Ok(transaction)
    }

    /// Fee for sending `value` at `fee_rate`, to `address` when known.
    pub fn fee(&self, value: u64, fee_rate: u64, sender_pays: bool, address: Option<&str>) -> Result<u64> {
        self.storage
            .read(|records| self.builder.fee(records, value, fee_rate, sender_pays, address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressConverterChain;
    use crate::address_manager::AddressManager;
    use crate::bloom::BloomFilterManager;
    use crate::constants::{DEFAULT_TASK_QUEUE_CAPACITY, SEQUENCE_FINAL};
    use crate::crypto::HeaderHasher;
    use crate::error::PeerGroupError;
    use crate::input_signer::InputSigner;
    use crate::keys::{HdWallet, KeyProvider};
    use crate::listener::ListenerDispatcher;
    use crate::params::{NetworkKind, NetworkParams};
    use crate::peer::PeerHandle;
    use crate::peer_group::{GroupCommand, PeerGroupHandle, PeerGroupInbox};
    use crate::peer_manager::PeerInfo;
    use crate::peer_task::PeerTask;
    use crate::script::p2pkh_script;
    use crate::transaction_extractor::TransactionExtractor;
    use crate::transaction_syncer::{RetryPolicy, TransactionSyncer};
    use crate::unspent::UnspentOutputProvider;
    use tokio::sync::mpsc;

    struct Fixture {
        creator: TransactionCreator,
        handle: PeerGroupHandle,
        inbox: PeerGroupInbox,
        storage: Arc<Storage>,
        converters: Arc<AddressConverterChain>,
        manager: Arc<AddressManager>,
        bloom: Arc<BloomFilterManager>,
    }

    fn fixture() -> Fixture {
        let params = NetworkParams::for_network(NetworkKind::RegTest);
        let storage = Arc::new(Storage::in_memory("creator"));
        let keys: Arc<dyn KeyProvider> = Arc::new(HdWallet::new(&[5u8; 32], params.coin_type).unwrap());
        let converters = Arc::new(AddressConverterChain::for_network(&params).unwrap());
        let manager = Arc::new(AddressManager::new(keys.clone(), converters.clone(), 3));
        let processor = Arc::new(TransactionProcessor::new(TransactionExtractor::new(converters.clone()), manager.clone()));

        storage
            .with_transaction(|records| {
                manager.fill_gap(records).map_err(SpvError::from)?;
                let block = params.last_checkpoint().unwrap().to_block(&HeaderHasher::double_sha256());
                records.add_block(block.clone())?;
                let key = records.public_key("0/0/0").unwrap().clone();
                let funding = Transaction::new(
                    1,
                    vec![TransactionInput::new(OutPoint { hash: [3; 32], index: 0 }, vec![], SEQUENCE_FINAL)],
                    vec![TransactionOutput::new(100_000, p2pkh_script(&key.public_key_hash), 0)],
                    0,
                );
                processor.process_incoming(records, vec![funding], Some(&block), false)?;
                Ok::<_, SpvError>(())
            })
            .unwrap();

        let data_provider = Arc::new(DataProvider::new(
            storage.clone(),
            UnspentOutputProvider::new(1),
            Arc::new(ListenerDispatcher::new()),
        ));
        let bloom = Arc::new(BloomFilterManager::new());
        let syncer = Arc::new(TransactionSyncer::new(
            storage.clone(),
            processor.clone(),
            manager.clone(),
            bloom.clone(),
            data_provider.clone(),
            RetryPolicy::default(),
        ));
        let (handle, inbox) = PeerGroupHandle::channel(DEFAULT_TASK_QUEUE_CAPACITY);
        let builder = TransactionBuilder::new(
            converters.clone(),
            manager.clone(),
            UnspentOutputProvider::new(1),
            InputSigner::new(keys, false),
        );
        let creator = TransactionCreator::new(
            storage.clone(),
            builder,
            processor,
            manager.clone(),
            bloom.clone(),
            Arc::new(TransactionSender::new(syncer, handle.clone())),
            data_provider,
        );
        Fixture {
            creator,
            handle,
            inbox,
            storage,
            converters,
            manager,
            bloom,
        }
    }

    fn add_synced_peer(handle: &PeerGroupHandle) {
        let (commands, _) = mpsc::unbounded_channel();
        let mut info = PeerInfo::new(PeerHandle::new("10.0.0.1", commands));
        info.connected = true;
        info.synced = true;
        handle.registry().lock().add(info);
    }

    fn recipient(converters: &AddressConverterChain) -> String {
        converters.convert(&[9u8; 20], ScriptType::P2PKH).unwrap().string
    }

    #[test]
    fn test_create_stores_and_broadcasts() {
        let mut fixture = fixture();
        add_synced_peer(&fixture.handle);
        let to = recipient(&fixture.converters);
        let fee = fixture.creator.fee(50_000, 10, true, Some(&to)).unwrap();

        let tx = fixture.creator.create(&to, 50_000, 10, true).unwrap();
        assert_eq!(tx.outputs[0].value, 50_000);
        assert_eq!(tx.outputs[1].value, 100_000 - 50_000 - fee);

        let stored = fixture.storage.read(|records| records.transaction(&tx.hash).cloned()).unwrap();
        assert!(stored.is_outgoing);
        assert_eq!(stored.status, TransactionStatus::New);
        assert!(fixture.storage.read(|records| records.is_key_used("0/1/0")));
        assert!(matches!(
            fixture.inbox.try_next_command(),
            Some(GroupCommand::Broadcast(PeerTask::SendTransaction(_)))
        ));
    }

    #[test]
    fn test_create_requires_ready_peers() {
        let fixture = fixture();
        let to = recipient(&fixture.converters);
        let result = fixture.creator.create(&to, 50_000, 10, true);
        assert_eq!(
            result,
            Err(SpvError::TransactionCreation(TransactionCreationError::PeersNotReady(
                PeerGroupError::NoConnectedPeers
            )))
        );
        assert_eq!(fixture.storage.read(|records| records.transactions().len()), 1);
    }

    #[test]
    fn test_insufficient_funds_writes_nothing() {
        let fixture = fixture();
        add_synced_peer(&fixture.handle);
        let to = recipient(&fixture.converters);
        let result = fixture.creator.create(&to, 150_000, 10, true);
        assert!(matches!(
            result,
            Err(SpvError::TransactionCreation(TransactionCreationError::InsufficientFunds { .. }))
        ));
        fixture.storage.read(|records| {
            assert_eq!(records.transactions().len(), 1);
            assert_eq!(records.unspent_outputs().len(), 1);
            assert!(!records.is_key_used("0/1/0"));
        });
    }

    #[test]
    fn test_back_to_back_sends_keep_change_gap_and_filter() {
        let fixture = fixture();
        add_synced_peer(&fixture.handle);
        let to = recipient(&fixture.converters);

        for _ in 0..5 {
            let tx = fixture.creator.create(&to, 10_000, 10, true).unwrap();
            let change = tx.outputs[1].public_key_path.clone().unwrap();
            let change_key = fixture
                .storage
                .read(|records| records.public_key(&change).cloned())
                .unwrap();

            assert!(!fixture.storage.read(|records| fixture.manager.gap_shifts(records)));
            let filter = fixture.bloom.current().unwrap();
            assert!(filter.contains(&change_key.public_key_hash));
            let mut outpoint = tx.hash.to_vec();
            outpoint.extend_from_slice(&1u32.to_le_bytes());
            assert!(filter.contains(&outpoint));
        }
        assert_eq!(fixture.storage.read(|records| records.transactions().len()), 6);
    }
}
