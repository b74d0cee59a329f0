//! Header chain extension and merkle block download state
//!
//! Headers are validated and stored as blocks without transactions. The
//! merkle block for each is then downloaded in batches; a block counts as
//! downloaded once its matched transactions have been processed.

use crate::address_manager::AddressManager;
use crate::bloom::BloomFilterManager;
use crate::error::{SpvError, ValidationError};
use crate::listener::DataProvider;
use crate::storage::Storage;
use crate::transaction_processor::TransactionProcessor;
use crate::types::*;
use crate::validator::BlockValidator;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, SpvError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    Idle,
    Prepared,
    Downloading,
    Completed,
    Failed,
}

/// Progress callbacks for the sync state coordinator.
pub trait BlockSyncListener: Send + Sync {
    fn on_best_block_height_update(&self, _downloaded_height: u32, _best_height: u32) {}
    fn on_download_completed(&self) {}
}

#[derive(Debug)]
struct SyncerState {
    phase: DownloadPhase,
    /// Set when a merkle block used a key past the distributed filter; the
    /// rest of the current batch is ignored and fetched again.
    need_to_redownload: bool,
    peer_best_height: u32,
}

pub struct BlockSyncer {
    storage: Arc<Storage>,
    validator: BlockValidator,
    processor: Arc<TransactionProcessor>,
    address_manager: Arc<AddressManager>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    data_provider: Arc<DataProvider>,
    listeners: Mutex<Vec<Arc<dyn BlockSyncListener>>>,
    state: Mutex<SyncerState>,
}

impl BlockSyncer {
    pub fn new(
        storage: Arc<Storage>,
        validator: BlockValidator,
        processor: Arc<TransactionProcessor>,
        address_manager: Arc<AddressManager>,
        bloom_filter_manager: Arc<BloomFilterManager>,
        data_provider: Arc<DataProvider>,
    ) -> Self {
        BlockSyncer {
            storage,
            validator,
            processor,
            address_manager,
            bloom_filter_manager,
            data_provider,
            listeners: Mutex::new(Vec::new()),
            state: Mutex::new(SyncerState {
                phase: DownloadPhase::Idle,
                need_to_redownload: false,
                peer_best_height: 0,
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn BlockSyncListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn phase(&self) -> DownloadPhase {
        self.state.lock().phase
    }

    /// Store `checkpoint` as the chain root when the chain is empty. The root
    /// is trusted and counts as downloaded.
    pub fn ensure_checkpoint(&self, mut checkpoint: Block) -> Result<()> {
        checkpoint.has_transactions = true;
        self.storage.with_transaction(|records| {
            if records.blocks_count() == 0 {
                info!(height = checkpoint.height, hash = %hash_to_hex(checkpoint.hash()), "chain rooted at checkpoint");
                records.add_block(checkpoint)?;
            }
            Ok(())
        })
    }

    pub fn local_known_best_height(&self) -> u32 {
        self.storage.read(|records| records.last_block().map_or(0, |block| block.height))
    }

    pub fn local_downloaded_best_height(&self) -> u32 {
        self.storage
            .read(|records| records.last_downloaded_block().map_or(0, |block| block.height))
    }

    pub fn block_locator_hashes(&self) -> Vec<Hash> {
        self.storage.read(|records| records.block_locator_hashes())
    }

    /// Next merkle blocks to fetch, lowest height first.
    pub fn get_block_hashes(&self, limit: usize) -> Vec<Hash> {
        self.storage.read(|records| records.block_hashes_to_download(limit))
    }

    /// Whether an announced block is new to us.
    pub fn should_request(&self, hash: &Hash) -> bool {
        self.storage.read(|records| records.block(hash).is_none())
    }

    pub fn prepare_for_download(&self) {
        let mut state = self.state.lock();
        state.phase = DownloadPhase::Prepared;
        state.need_to_redownload = false;
    }

    pub fn download_started(&self, peer_best_height: u32) {
        let mut state = self.state.lock();
        state.phase = DownloadPhase::Downloading;
        state.peer_best_height = peer_best_height;
        debug!(peer_best_height, "block download started");
    }

    /// One GetMerkleBlocks batch finished. Blocks skipped after a filter
    /// expiry are still unmarked and come back in the next batch.
    pub fn download_iteration_completed(&self) {
        let mut state = self.state.lock();
        if state.need_to_redownload {
            info!("refetching merkle blocks with the regenerated filter");
            state.need_to_redownload = false;
        }
    }

    pub fn download_completed(&self) {
        self.state.lock().phase = DownloadPhase::Completed;
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_download_completed();
        }
    }

    pub fn download_failed(&self) {
        let mut state = self.state.lock();
        state.phase = DownloadPhase::Failed;
        state.need_to_redownload = false;
    }

    fn notify_progress(&self) {
        let downloaded = self.local_downloaded_best_height();
        let best = self.state.lock().peer_best_height.max(self.local_known_best_height());
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_best_block_height_update(downloaded, best);
        }
    }

    /// HandleHeaders: [Header] → number of blocks added | ValidationError
    ///
    /// 1. Headers already stored are skipped
    /// 2. Each new header must extend a known block that is the current tip
    /// 3. The network validator checks it against its predecessor
    /// 4. Any failure rejects the whole batch; nothing is stored
    pub fn handle_headers(&self, headers: &[Header]) -> Result<usize> {
        let added = self.storage.with_transaction(|records| {
            let mut added = 0;
            for header in headers {
                if records.block(header.hash()).is_some() {
                    continue;
                }
                let previous = records
                    .block(header.prev_block_hash())
                    .cloned()
                    .ok_or_else(|| ValidationError::NoPreviousBlock(hash_to_hex(header.prev_block_hash())))?;
                let height = previous.height + 1;
                if records.block_at(height).is_some() {
                    return Err(ValidationError::ConflictingBlock(height).into());
                }
                let block = Block::new(header.clone(), height);
                self.validator.validate(&block, &previous, &*records)?;
                records.add_block(block)?;
                added += 1;
            }
            Ok::<_, SpvError>(added)
        });

        match added {
            Ok(added) => {
                if added > 0 {
                    debug!(added, tip = self.local_known_best_height(), "headers stored");
                    self.notify_progress();
                }
                Ok(added)
            }
            Err(e) => {
                warn!(error = %e, "header batch rejected");
                Err(e)
            }
        }
    }

    /// HandleMerkleBlock: complete MerkleBlock → stored transactions
    ///
    /// 1. Ignored while a redownload is pending or when the header is unknown
    /// 2. Matched transactions are processed against the block in one storage transaction
    /// 3. On filter expiry the gap is filled, the block stays undownloaded and
    ///    the filter is regenerated after commit
    /// 4. Otherwise the block is marked downloaded and listeners are notified
    pub fn handle_merkle_block(&self, merkle_block: MerkleBlock) -> Result<()> {
        if self.state.lock().need_to_redownload {
            debug!(hash = %hash_to_hex(merkle_block.block_hash()), "skipping merkle block until redownload");
            return Ok(());
        }
        let Some(block) = self.storage.read(|records| records.block(merkle_block.block_hash()).cloned()) else {
            debug!(hash = %hash_to_hex(merkle_block.block_hash()), "merkle block for unknown header");
            return Ok(());
        };
        if block.has_transactions {
            return Ok(());
        }

        let outcome = self.storage.with_transaction(|records| {
            let outcome = self
                .processor
                .process_incoming(records, merkle_block.transactions, Some(&block), false)?;
            if outcome.bloom_filter_expired {
                self.address_manager.fill_gap(records)?;
            } else {
                records.set_block_has_transactions(block.hash())?;
            }
            Ok::<_, SpvError>(outcome)
        })?;

        if outcome.bloom_filter_expired {
            info!(height = block.height, "bloom filter expired, regenerating");
            self.state.lock().need_to_redownload = true;
            self.storage.read(|records| self.bloom_filter_manager.regenerate(records));
        } else {
            debug!(height = block.height, transactions = outcome.inserted.len(), "merkle block processed");
        }

        self.data_provider.on_transactions_changed(&outcome);
        self.data_provider.on_blocks_changed();
        self.notify_progress();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressConverterChain;
    use crate::crypto::HeaderHasher;
    use crate::keys::HdWallet;
    use crate::listener::ListenerDispatcher;
    use crate::params::{NetworkKind, NetworkParams, ValidatorKind};
    use crate::script::p2pkh_script;
    use crate::transaction_extractor::TransactionExtractor;
    use crate::unspent::UnspentOutputProvider;

    const REGTEST_BITS: u32 = 0x207fffff;

    fn syncer(validator: ValidatorKind) -> (BlockSyncer, Arc<Storage>, Arc<BloomFilterManager>) {
        let params = NetworkParams::for_network(NetworkKind::RegTest);
        let storage = Arc::new(Storage::in_memory("blocks"));
        let converters = Arc::new(AddressConverterChain::for_network(&params).unwrap());
        let manager = Arc::new(AddressManager::new(
            Arc::new(HdWallet::new(&[4u8; 32], params.coin_type).unwrap()),
            converters.clone(),
            2,
        ));
        storage
            .with_transaction(|records| manager.fill_gap(records).map_err(SpvError::from))
            .unwrap();
        let bloom = Arc::new(BloomFilterManager::new());
        let processor = Arc::new(TransactionProcessor::new(TransactionExtractor::new(converters), manager.clone()));
        let data_provider = Arc::new(DataProvider::new(
            storage.clone(),
            UnspentOutputProvider::new(1),
            Arc::new(ListenerDispatcher::new()),
        ));
        let syncer = BlockSyncer::new(
            storage.clone(),
            BlockValidator::with_kind(validator, 0x1d00ffff),
            processor,
            manager,
            bloom.clone(),
            data_provider,
        );
        let root = Block::new(header([0; 32], 1_600_000_000, 0x1d00ffff), 100);
        syncer.ensure_checkpoint(root).unwrap();
        (syncer, storage, bloom)
    }

    fn header(prev: Hash, timestamp: u32, bits: u32) -> Header {
        Header::new(1, prev, [0; 32], timestamp, bits, 0, &HeaderHasher::double_sha256())
    }

    fn chain_from(syncer: &BlockSyncer, count: u32) -> Vec<Header> {
        let mut prev = syncer.storage.read(|records| *records.last_block().unwrap().hash());
        (0..count)
            .map(|i| {
                let h = header(prev, 1_600_000_600 + i * 600, REGTEST_BITS);
                prev = *h.hash();
                h
            })
            .collect()
    }

    #[test]
    fn test_headers_extend_chain() {
        let (syncer, _, _) = syncer(ValidatorKind::Relaxed);
        let headers = chain_from(&syncer, 3);
        assert_eq!(syncer.handle_headers(&headers).unwrap(), 3);
        assert_eq!(syncer.local_known_best_height(), 103);
        assert_eq!(syncer.local_downloaded_best_height(), 100);
        assert_eq!(syncer.get_block_hashes(10).len(), 3);

        // Replayed headers are not errors
        assert_eq!(syncer.handle_headers(&headers).unwrap(), 0);
        assert!(!syncer.should_request(headers[0].hash()));
    }

    #[test]
    fn test_unlinked_header_rejects_batch() {
        let (syncer, _, _) = syncer(ValidatorKind::Relaxed);
        let mut headers = chain_from(&syncer, 2);
        headers.push(header([9; 32], 1_600_010_000, REGTEST_BITS));
        assert!(matches!(
            syncer.handle_headers(&headers),
            Err(SpvError::Validation(ValidationError::NoPreviousBlock(_)))
        ));
        assert_eq!(syncer.local_known_best_height(), 100);
    }

    #[test]
    fn test_competing_header_is_conflict() {
        let (syncer, _, _) = syncer(ValidatorKind::Relaxed);
        let headers = chain_from(&syncer, 1);
        syncer.handle_headers(&headers).unwrap();
        let root = syncer.storage.read(|records| *records.block_at(100).unwrap().hash());
        let competing = header(root, 1_600_099_999, REGTEST_BITS);
        assert!(matches!(
            syncer.handle_headers(&[competing]),
            Err(SpvError::Validation(ValidationError::ConflictingBlock(101)))
        ));
    }

    #[test]
    fn test_merkle_block_paying_gap_key_triggers_redownload() {
        let (syncer, storage, bloom) = syncer(ValidatorKind::Relaxed);
        let headers = chain_from(&syncer, 2);
        syncer.handle_headers(&headers).unwrap();
        syncer.download_started(102);

        let key = storage.read(|records| records.public_key("0/0/1").cloned()).unwrap();
        let tx = Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint { hash: [1; 32], index: 0 }, vec![], 0xffff_ffff)],
            vec![TransactionOutput::new(10_000, p2pkh_script(&key.public_key_hash), 0)],
            0,
        );
        let mut first = MerkleBlock::new(headers[0].clone(), vec![tx.hash]);
        first.add_transaction(tx);
        syncer.handle_merkle_block(first).unwrap();

        assert!(bloom.current().is_some());
        assert_eq!(syncer.local_downloaded_best_height(), 100);
        // The rest of the batch is ignored until the iteration completes
        syncer.handle_merkle_block(MerkleBlock::new(headers[1].clone(), vec![])).unwrap();
        assert_eq!(syncer.get_block_hashes(10).len(), 2);

        syncer.download_iteration_completed();
        syncer.handle_merkle_block(MerkleBlock::new(headers[0].clone(), vec![])).unwrap();
        syncer.handle_merkle_block(MerkleBlock::new(headers[1].clone(), vec![])).unwrap();
        assert_eq!(syncer.local_downloaded_best_height(), 102);
    }

    #[test]
    fn test_progress_reported_to_listeners() {
        #[derive(Default)]
        struct Progress(Mutex<Vec<(u32, u32)>>);
        impl BlockSyncListener for Progress {
            fn on_best_block_height_update(&self, downloaded: u32, best: u32) {
                self.0.lock().push((downloaded, best));
            }
        }

        let (syncer, _, _) = syncer(ValidatorKind::Relaxed);
        let progress = Arc::new(Progress::default());
        syncer.add_listener(progress.clone());
        syncer.download_started(110);
        let headers = chain_from(&syncer, 1);
        syncer.handle_headers(&headers).unwrap();
        syncer.handle_merkle_block(MerkleBlock::new(headers[0].clone(), vec![])).unwrap();
        assert_eq!(*progress.0.lock(), vec![(100, 110), (101, 110)]);
    }
}
