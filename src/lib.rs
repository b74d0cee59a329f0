//! # spv-engine
//!
//! SPV wallet engine for Bitcoin, Bitcoin Cash and Dash.
//!
//! The engine keeps a header chain from a trusted checkpoint, downloads
//! bloom-filtered merkle blocks for the wallet's keys, tracks the wallet's
//! transactions and unspent outputs, and builds, signs and broadcasts payments.
//!
//! ## Architecture
//!
//! - Wire layer: framing, message codecs and an ordered parser chain
//! - Peers: one task per connection, one outstanding request each
//! - Peer group: the single worker that owns the peer registry, elects the
//!   sync peer and runs task, inventory and lifecycle handlers
//! - Wallet: key derivation, address conversion, transaction processing,
//!   unspent output selection and signing over one transactional store
//! - `SpvKit`: wires the above from one validated `SpvConfig`
//!
//! ## Usage
//!
//! ```rust
//! use spv_engine::{NetworkKind, SpvConfig};
//!
//! let mut config = SpvConfig::new(NetworkKind::RegTest, "000102030405060708090a0b0c0d0e0f");
//! config.gap_limit = 5;
//! assert!(config.validate().is_ok());
//! ```

pub mod address;
pub mod address_manager;
pub mod block_syncer;
pub mod bloom;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod dash;
pub mod error;
pub mod fee_rate;
pub mod initial_syncer;
pub mod input_signer;
pub mod keys;
pub mod listener;
pub mod logging;
pub mod mempool;
pub mod merkle;
pub mod network;
pub mod params;
pub mod peer;
pub mod peer_address_manager;
pub mod peer_group;
pub mod peer_manager;
pub mod peer_task;
pub mod pow;
pub mod script;
pub mod serialization;
pub mod storage;
pub mod sync_manager;
pub mod transaction_builder;
pub mod transaction_creator;
pub mod transaction_extractor;
pub mod transaction_linker;
pub mod transaction_processor;
pub mod transaction_sender;
pub mod transaction_syncer;
pub mod types;
pub mod unspent;
pub mod validator;

// Re-export commonly used types
pub use config::SpvConfig;
pub use constants::*;
pub use crypto::HeaderHasher;
pub use error::{Result, SpvError};
pub use fee_rate::FeeRateProvider;
pub use initial_syncer::{ApiTransaction, BootstrapApi};
pub use listener::{TransactionInfo, WalletListener};
pub use params::{NetworkKind, NetworkParams};
pub use types::*;

use address::AddressConverterChain;
use address_manager::AddressManager;
use block_syncer::BlockSyncer;
use bloom::BloomFilterManager;
use dash::{DashMessageParser, InstantSend, Masternode, MasternodeListManager, MasternodeListSyncer};
use error::AddressError;
use fee_rate::FeeRateSyncer;
use initial_syncer::{BlockDiscoveryBatch, BlockHashFetcher, InitialSyncer};
use input_signer::InputSigner;
use keys::{HdWallet, KeyProvider};
use listener::{DataProvider, ListenerDispatcher};
use mempool::MempoolTransactions;
use network::{MessageContext, MessageParserChain};
use parking_lot::Mutex;
use peer::PeerSettings;
use peer_address_manager::PeerAddressManager;
use peer_group::{PeerGroup, PeerGroupHandle, PeerGroupSettings};
use std::sync::Arc;
use storage::{FileBackend, MemoryBackend, Storage, StorageBackend};
use sync_manager::SyncManager;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use transaction_builder::TransactionBuilder;
use transaction_creator::TransactionCreator;
use transaction_extractor::TransactionExtractor;
use transaction_processor::TransactionProcessor;
use transaction_sender::TransactionSender;
use transaction_syncer::TransactionSyncer;
use unspent::UnspentOutputProvider;
use validator::BlockValidator;

/// Dash-only components, present when the network has them.
struct DashExtension {
    instant_send: Arc<InstantSend>,
    masternode_list: Arc<MasternodeListSyncer>,
}

/// One wallet on one network.
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use spv_engine::{ApiTransaction, BootstrapApi, NetworkKind, SpvConfig, SpvKit};
/// use std::sync::Arc;
///
/// struct NoHistory;
///
/// #[async_trait]
/// impl BootstrapApi for NoHistory {
///     async fn transactions(&self, _addresses: &[String]) -> spv_engine::Result<Vec<ApiTransaction>> {
///         Ok(Vec::new())
///     }
/// }
///
/// # async fn run() -> spv_engine::Result<()> {
/// let mut config = SpvConfig::new(NetworkKind::TestNet, "000102030405060708090a0b0c0d0e0f");
/// config.new_wallet = true;
/// let kit = SpvKit::new(config, Arc::new(NoHistory), None)?;
/// kit.start().await?;
/// println!("pay to {}", kit.receive_address()?);
/// # Ok(())
/// # }
/// ```
pub struct SpvKit {
    params: NetworkParams,
    storage: Arc<Storage>,
    converters: Arc<AddressConverterChain>,
    address_manager: Arc<AddressManager>,
    dispatcher: Arc<ListenerDispatcher>,
    data_provider: Arc<DataProvider>,
    transaction_syncer: Arc<TransactionSyncer>,
    creator: TransactionCreator,
    fee_rate_syncer: Option<Arc<FeeRateSyncer>>,
    sync_manager: Arc<SyncManager>,
    peer_group: PeerGroupHandle,
    dash: Option<DashExtension>,
    dispatcher_worker: Mutex<Option<JoinHandle<()>>>,
}

impl SpvKit {
    /// New: config × collaborators → SpvKit
    ///
    /// 1. Validate the config; nothing starts on error
    /// 2. Open the store under `<network>-<wallet id>`
    /// 3. Build the wallet components over the store
    /// 4. Build the peer group and register handlers, Dash ones first
    pub fn new(
        config: SpvConfig,
        bootstrap_api: Arc<dyn BootstrapApi>,
        fee_rate_provider: Option<Arc<dyn FeeRateProvider>>,
    ) -> Result<Self> {
        config.validate()?;
        logging::init_tracing(config.log_filter.as_deref());

        let params = config.params();
        let hasher = config.header_hasher();
        let backend: Arc<dyn StorageBackend> = match &config.storage_dir {
            Some(directory) => Arc::new(FileBackend::new(directory.clone())?),
            None => Arc::new(MemoryBackend::new()),
        };
        let storage = Arc::new(Storage::open(backend, format!("{}-{}", params.kind, config.wallet_id))?);

        let keys: Arc<dyn KeyProvider> = Arc::new(HdWallet::new(&config.seed_bytes()?, params.coin_type)?);
        let converters = Arc::new(AddressConverterChain::for_network(&params)?);
        let address_manager = Arc::new(AddressManager::new(keys.clone(), converters.clone(), config.gap_limit));
        let bloom_filter_manager = Arc::new(BloomFilterManager::new());
        let dispatcher = Arc::new(ListenerDispatcher::new());
        let data_provider = Arc::new(DataProvider::new(
            storage.clone(),
            UnspentOutputProvider::new(config.confirmations_threshold),
            dispatcher.clone(),
        ));
        let processor = Arc::new(TransactionProcessor::new(
            TransactionExtractor::new(converters.clone()),
            address_manager.clone(),
        ));
        let block_syncer = Arc::new(BlockSyncer::new(
            storage.clone(),
            BlockValidator::new(&params),
            processor.clone(),
            address_manager.clone(),
            bloom_filter_manager.clone(),
            data_provider.clone(),
        ));
        let transaction_syncer = Arc::new(TransactionSyncer::new(
            storage.clone(),
            processor.clone(),
            address_manager.clone(),
            bloom_filter_manager.clone(),
            data_provider.clone(),
            config.retry,
        ));

        let (handle, inbox) = PeerGroupHandle::channel(config.task_queue_capacity);
        let sender = Arc::new(TransactionSender::new(transaction_syncer.clone(), handle.clone()));
        let builder = TransactionBuilder::new(
            converters.clone(),
            address_manager.clone(),
            UnspentOutputProvider::new(config.confirmations_threshold),
            InputSigner::new(keys.clone(), params.sighash_fork_id),
        );
        let creator = TransactionCreator::new(
            storage.clone(),
            builder,
            processor,
            address_manager.clone(),
            bloom_filter_manager.clone(),
            sender.clone(),
            data_provider.clone(),
        );
        let fee_rate_syncer = fee_rate_provider
            .map(|provider| Arc::new(FeeRateSyncer::new(storage.clone(), provider, config.fee_rate_refresh())));

        let discovery = BlockDiscoveryBatch::new(
            keys,
            BlockHashFetcher::new(bootstrap_api, converters.clone()),
            config.gap_limit,
        );
        let initial_syncer = Arc::new(InitialSyncer::new(
            storage.clone(),
            params.clone(),
            hasher.clone(),
            discovery,
            address_manager.clone(),
            block_syncer.clone(),
            config.new_wallet,
        ));
        let sync_manager = Arc::new(SyncManager::new(
            storage.clone(),
            initial_syncer,
            bloom_filter_manager.clone(),
            fee_rate_syncer.clone(),
            data_provider.clone(),
            handle.clone(),
            config.shutdown_timeout(),
        ));
        block_syncer.add_listener(sync_manager.clone());

        let mut parsers = MessageParserChain::new();
        if params.kind.is_dash() {
            parsers.prepend(Box::new(DashMessageParser));
        }
        let port = config.port.unwrap_or(params.port);
        let settings = PeerGroupSettings {
            peer_size: config.peer_size(&params),
            connect_interval: config.connect_interval(),
            peer: PeerSettings {
                magic: params.magic,
                port,
                protocol_version: params.protocol_version,
                user_agent: config.user_agent.clone(),
                local_best_height: storage.read(|records| records.last_block().map_or(0, |block| block.height)),
                handshake_timeout: config.handshake_timeout(),
                task_timeout: config.task_timeout(),
                parsers: Arc::new(parsers),
                context: MessageContext {
                    hasher,
                    special_transactions: params.special_transactions,
                },
            },
        };
        let dns_seeds = config
            .dns_seeds
            .clone()
            .unwrap_or_else(|| params.dns_seeds.iter().map(|seed| seed.to_string()).collect());
        let mut group = PeerGroup::new(
            inbox,
            settings,
            Arc::new(PeerAddressManager::new(storage.clone(), dns_seeds, port)),
            block_syncer,
            bloom_filter_manager.subscribe(),
            sync_manager.connectivity(),
        );

        let dash = if params.kind.is_dash() {
            let instant_send = Arc::new(InstantSend::new(transaction_syncer.clone()));
            let masternode_list = Arc::new(MasternodeListSyncer::new(
                handle.clone(),
                Arc::new(MasternodeListManager::new(storage.clone())),
            ));
            group.add_inventory_handler(instant_send.clone());
            group.add_task_handler(instant_send.clone());
            group.add_task_handler(masternode_list.clone());
            group.add_listener(masternode_list.clone());
            Some(DashExtension {
                instant_send,
                masternode_list,
            })
        } else {
            None
        };
        let mempool = Arc::new(MempoolTransactions::new(transaction_syncer.clone()));
        group.add_inventory_handler(mempool.clone());
        group.add_task_handler(mempool.clone());
        group.add_listener(mempool);
        group.add_listener(sender);
        group.add_listener(sync_manager.clone());
        sync_manager.attach(group);

        info!(network = %params.kind, wallet = %config.wallet_id, "kit created");
        Ok(SpvKit {
            params,
            storage,
            converters,
            address_manager,
            dispatcher,
            data_provider,
            transaction_syncer,
            creator,
            fee_rate_syncer,
            sync_manager,
            peer_group: handle,
            dash,
            dispatcher_worker: Mutex::new(None),
        })
    }

    pub fn network(&self) -> &NetworkParams {
        &self.params
    }

    /// Listeners added after `start` are not called.
    pub fn add_listener(&self, listener: Arc<dyn WalletListener>) {
        self.dispatcher.add_listener(listener);
    }

    /// Start: listener worker, wallet bootstrap, then the peer group.
    pub async fn start(&self) -> Result<()> {
        if let Some(worker) = self.dispatcher.start() {
            *self.dispatcher_worker.lock() = Some(worker);
        }
        self.sync_manager.start().await
    }

    /// Stop the peer group. A stopped kit cannot be started again.
    pub async fn stop(&self) {
        self.sync_manager.stop().await;
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_manager.state()
    }

    pub fn subscribe_sync_state(&self) -> watch::Receiver<SyncState> {
        self.sync_manager.subscribe()
    }

    /// Report OS network reachability; peers pause while false.
    pub fn set_connectivity(&self, connected: bool) {
        self.sync_manager.set_connectivity(connected);
    }

    pub fn balance(&self) -> u64 {
        self.data_provider.balance()
    }

    pub fn last_block_info(&self) -> Option<BlockInfo> {
        self.data_provider.last_block_info()
    }

    pub fn transactions(&self, from_hash: Option<&str>, limit: Option<usize>) -> Vec<TransactionInfo> {
        self.data_provider.transactions(from_hash, limit)
    }

    pub fn receive_address(&self) -> Result<String> {
        self.storage.read(|records| self.address_manager.receive_address(records))
    }

    pub fn validate_address(&self, address: &str) -> std::result::Result<(), AddressError> {
        self.converters.convert_string(address).map(|_| ())
    }

    /// Stored rate, or the default before the first refresh.
    pub fn fee_rate(&self) -> FeeRate {
        match &self.fee_rate_syncer {
            Some(syncer) => syncer.fee_rate(),
            None => self.storage.read(|records| records.fee_rate()).unwrap_or_default(),
        }
    }

    /// Fee for a payment; `fee_rate` defaults to the medium stored rate.
    pub fn fee(&self, value: u64, address: Option<&str>, sender_pays: bool, fee_rate: Option<u64>) -> Result<u64> {
        let fee_rate = fee_rate.unwrap_or_else(|| self.fee_rate().medium);
        self.creator.fee(value, fee_rate, sender_pays, address)
    }

    /// Send: build, sign, store and broadcast a payment.
    pub fn send(&self, address: &str, value: u64, sender_pays: bool, fee_rate: Option<u64>) -> Result<Transaction> {
        let fee_rate = fee_rate.unwrap_or_else(|| self.fee_rate().medium);
        self.creator.create(address, value, fee_rate, sender_pays)
    }

    /// Outgoing transactions still waiting for a broadcast attempt.
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.transaction_syncer.pending_transactions()
    }

    pub fn connected_peers(&self) -> usize {
        self.peer_group.connected_peers_count()
    }

    /// Sorted masternode list; empty off Dash.
    pub fn masternodes(&self) -> Vec<Masternode> {
        self.dash
            .as_ref()
            .map(|dash| dash.masternode_list.manager().masternodes())
            .unwrap_or_default()
    }

    pub fn is_instant_send_locked(&self, tx_hash: &Hash) -> bool {
        self.dash
            .as_ref()
            .is_some_and(|dash| dash.instant_send.is_locked(tx_hash))
    }

    /// Wipe the stored wallet. Only meaningful after `stop`.
    pub fn clear(&self) -> Result<()> {
        Ok(self.storage.clear()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    const SEED: &str = "000102030405060708090a0b0c0d0e0f";

    struct NoHistory;

    #[async_trait]
    impl BootstrapApi for NoHistory {
        async fn transactions(&self, _addresses: &[String]) -> Result<Vec<ApiTransaction>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let mut config = SpvConfig::new(NetworkKind::RegTest, SEED);
        config.gap_limit = 0;
        assert!(matches!(
            SpvKit::new(config, Arc::new(NoHistory), None),
            Err(SpvError::Config(_))
        ));

        let config = SpvConfig::new(NetworkKind::MainNetDash, SEED);
        assert!(matches!(
            SpvKit::new(config, Arc::new(NoHistory), None),
            Err(SpvError::Config(error::ConfigError::MissingField("header_hasher")))
        ));
    }

    #[tokio::test]
    async fn test_regtest_kit_lifecycle() {
        let mut config = SpvConfig::new(NetworkKind::RegTest, SEED);
        config.dns_seeds = Some(Vec::new());
        let kit = SpvKit::new(config, Arc::new(NoHistory), None).unwrap();
        assert_eq!(kit.sync_state(), SyncState::NotSynced);
        assert_eq!(kit.fee_rate().medium, DEFAULT_FEE_RATE);

        kit.start().await.unwrap();
        assert_eq!(kit.balance(), 0);
        assert_eq!(kit.last_block_info().map(|info| info.height), Some(0));
        let address = kit.receive_address().unwrap();
        assert!(kit.validate_address(&address).is_ok());
        assert!(kit.validate_address("not an address").is_err());
        assert!(kit.masternodes().is_empty());

        // Nothing connected: sending is refused before anything is built
        assert!(matches!(
            kit.send(&address, 10_000, true, None),
            Err(SpvError::TransactionCreation(_))
        ));
        kit.stop().await;
        assert_eq!(kit.sync_state(), SyncState::NotSynced);
    }

    #[tokio::test]
    async fn test_file_storage_is_keyed_by_network_and_wallet() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SpvConfig::new(NetworkKind::RegTest, SEED);
        config.dns_seeds = Some(Vec::new());
        config.storage_dir = Some(dir.path().to_path_buf());
        config.wallet_id = "alice".into();
        let kit = SpvKit::new(config.clone(), Arc::new(NoHistory), None).unwrap();
        kit.start().await.unwrap();
        let address = kit.receive_address().unwrap();
        kit.stop().await;
        drop(kit);

        let reopened = SpvKit::new(config, Arc::new(NoHistory), None).unwrap();
        assert_eq!(reopened.last_block_info().map(|info| info.height), Some(0));
        assert_eq!(reopened.receive_address().unwrap(), address);
    }
}
