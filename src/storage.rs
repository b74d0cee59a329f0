//! Wallet persistence: the record set, pluggable backends and atomic transactions
//!
//! All wallet state lives in one `WalletRecords` value. Readers see the last
//! committed snapshot; writers run inside `Storage::with_transaction`, which
//! mutates a private copy and only publishes it after the backend accepted it.
//!
//! Every mutator journals a `Change`. A commit hands the backend only the
//! changes it made, and the backend folds its change log into a fresh
//! snapshot once the log outgrows the records.

use crate::error::StorageError;
use crate::types::*;
use crate::validator::BlockLookup;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Changes a commit may carry before the backend is asked for a full snapshot.
pub const MIN_COMPACTION_CHANGES: usize = 1024;

/// One committed mutation. Each variant carries the resulting value, so
/// replaying a change twice leaves the records as replaying it once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Block(Block),
    Transaction(Transaction),
    TransactionDeleted(Hash),
    PublicKey(PublicKey),
    KeyUsed(String),
    SentTransaction(SentTransaction),
    PeerAddress(PeerAddress),
    PeerAddressRemoved(String),
    FeeRate(FeeRate),
    InitialRestored(bool),
}

/// Owned, unspent output together with the key that can spend it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub output: TransactionOutput,
    pub transaction_hash: Hash,
    pub block_height: Option<u32>,
    pub is_outgoing: bool,
    pub public_key: PublicKey,
}

impl UnspentOutput {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            hash: self.transaction_hash,
            index: self.output.index,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalletRecords {
    blocks: BTreeMap<u32, Block>,
    transactions: Vec<Transaction>,
    public_keys: BTreeMap<String, PublicKey>,
    used_key_paths: BTreeSet<String>,
    sent_transactions: Vec<SentTransaction>,
    peer_addresses: BTreeMap<String, PeerAddress>,
    fee_rate: Option<FeeRate>,
    initial_restored: bool,

    #[serde(skip)]
    block_heights: HashMap<Hash, u32>,
    #[serde(skip)]
    transaction_index: HashMap<Hash, usize>,
    #[serde(skip)]
    spent_outputs: HashMap<OutPoint, Hash>,
    #[serde(skip)]
    journal: Vec<Change>,
}

impl WalletRecords {
    /// Rebuild the lookup indexes after deserialization or bulk edits.
    pub fn reindex(&mut self) {
        self.block_heights = self.blocks.iter().map(|(height, block)| (*block.hash(), *height)).collect();
        self.transaction_index = self
            .transactions
            .iter()
            .enumerate()
            .map(|(position, tx)| (tx.hash, position))
            .collect();
        self.spent_outputs.clear();
        for tx in &self.transactions {
            for input in &tx.inputs {
                self.spent_outputs.insert(input.previous_output, tx.hash);
            }
        }
    }

    /// Changes made since the journal was last taken.
    pub fn take_journal(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.journal)
    }

    /// Number of stored entries, used to size the change log.
    pub fn entries_count(&self) -> usize {
        self.blocks.len()
            + self.transactions.len()
            + self.public_keys.len()
            + self.sent_transactions.len()
            + self.peer_addresses.len()
    }

    /// Replay committed changes without constraint checks or journaling.
    /// Callers must `reindex` once the batch is applied.
    pub fn replay(&mut self, changes: impl IntoIterator<Item = Change>) {
        for change in changes {
            match change {
                Change::Block(block) => {
                    self.blocks.insert(block.height, block);
                }
                Change::Transaction(transaction) => {
                    match self.transactions.iter_mut().find(|tx| tx.hash == transaction.hash) {
                        Some(existing) => *existing = transaction,
                        None => self.transactions.push(transaction),
                    }
                }
                Change::TransactionDeleted(hash) => {
                    self.transactions.retain(|tx| tx.hash != hash);
                    self.sent_transactions.retain(|sent| sent.hash != hash);
                }
                Change::PublicKey(key) => {
                    self.public_keys.entry(key.path.clone()).or_insert(key);
                }
                Change::KeyUsed(path) => {
                    self.used_key_paths.insert(path);
                }
                Change::SentTransaction(sent) => {
                    match self.sent_transactions.iter_mut().find(|existing| existing.hash == sent.hash) {
                        Some(existing) => *existing = sent,
                        None => self.sent_transactions.push(sent),
                    }
                }
                Change::PeerAddress(address) => {
                    self.peer_addresses.insert(address.ip.clone(), address);
                }
                Change::PeerAddressRemoved(ip) => {
                    self.peer_addresses.remove(&ip);
                }
                Change::FeeRate(fee_rate) => self.fee_rate = Some(fee_rate),
                Change::InitialRestored(restored) => self.initial_restored = restored,
            }
        }
    }

    // ---- blocks ----

    pub fn block(&self, hash: &Hash) -> Option<&Block> {
        self.block_heights.get(hash).and_then(|height| self.blocks.get(height))
    }

    pub fn block_at(&self, height: u32) -> Option<&Block> {
        self.blocks.get(&height)
    }

    pub fn blocks_count(&self) -> usize {
        self.blocks.len()
    }

    /// Chain root: the checkpoint this wallet started from.
    pub fn first_block(&self) -> Option<&Block> {
        self.blocks.values().next()
    }

    /// Header chain tip.
    pub fn last_block(&self) -> Option<&Block> {
        self.blocks.values().next_back()
    }

    /// Tip of the contiguous run of blocks whose merkle blocks were processed.
    pub fn last_downloaded_block(&self) -> Option<&Block> {
        let mut last = None;
        for block in self.blocks.values() {
            if !block.has_transactions {
                break;
            }
            last = Some(block);
        }
        last
    }

    /// Insert a block. Only the first block may have an unknown predecessor.
    pub fn add_block(&mut self, block: Block) -> Result<(), StorageError> {
        if let Some(existing) = self.blocks.get(&block.height) {
            if existing.hash() != block.hash() {
                return Err(StorageError::Constraint(format!("height {} already occupied", block.height)));
            }
            return Ok(());
        }
        if !self.blocks.is_empty() && self.block(block.prev_hash()).is_none() {
            return Err(StorageError::Constraint(format!(
                "previous block {} unknown",
                hash_to_hex(block.prev_hash())
            )));
        }
        self.block_heights.insert(*block.hash(), block.height);
        self.journal.push(Change::Block(block.clone()));
        self.blocks.insert(block.height, block);
        Ok(())
    }

    pub fn set_block_has_transactions(&mut self, hash: &Hash) -> Result<(), StorageError> {
        let height = *self
            .block_heights
            .get(hash)
            .ok_or_else(|| StorageError::NotFound(hash_to_hex(hash)))?;
        if let Some(block) = self.blocks.get_mut(&height) {
            if !block.has_transactions {
                block.has_transactions = true;
                self.journal.push(Change::Block(block.clone()));
            }
        }
        Ok(())
    }

    /// Hashes of headers whose merkle blocks still need downloading, lowest first.
    pub fn block_hashes_to_download(&self, limit: usize) -> Vec<Hash> {
        self.blocks
            .values()
            .filter(|block| !block.has_transactions)
            .take(limit)
            .map(|block| *block.hash())
            .collect()
    }

    /// Locator: the last ten blocks, then exponentially sparser, ending at the root.
    pub fn block_locator_hashes(&self) -> Vec<Hash> {
        let mut hashes = Vec::new();
        let (Some(tip), Some(root)) = (self.last_block(), self.first_block()) else {
            return hashes;
        };
        let mut height = tip.height as i64;
        let mut step = 1i64;
        while height > root.height as i64 {
            if let Some(block) = self.blocks.get(&(height as u32)) {
                hashes.push(*block.hash());
            }
            if hashes.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        hashes.push(*root.hash());
        hashes
    }

    // ---- transactions ----

    pub fn transaction(&self, hash: &Hash) -> Option<&Transaction> {
        self.transaction_index.get(hash).map(|position| &self.transactions[*position])
    }

    pub fn transaction_exists(&self, hash: &Hash) -> bool {
        self.transaction_index.contains_key(hash)
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Insert or replace a transaction, keeping the spent-output index current.
    pub fn save_transaction(&mut self, transaction: Transaction) -> Result<(), StorageError> {
        for input in &transaction.inputs {
            if let Some(spender) = self.spent_outputs.get(&input.previous_output) {
                if spender != &transaction.hash {
                    return Err(StorageError::Constraint(format!(
                        "output {}:{} already spent by {}",
                        hash_to_hex(&input.previous_output.hash),
                        input.previous_output.index,
                        hash_to_hex(spender)
                    )));
                }
            }
        }
        for input in &transaction.inputs {
            self.spent_outputs.insert(input.previous_output, transaction.hash);
        }
        self.journal.push(Change::Transaction(transaction.clone()));
        match self.transaction_index.get(&transaction.hash) {
            Some(position) => self.transactions[*position] = transaction,
            None => {
                self.transaction_index.insert(transaction.hash, self.transactions.len());
                self.transactions.push(transaction);
            }
        }
        Ok(())
    }

    pub fn delete_transaction(&mut self, hash: &Hash) -> Option<Transaction> {
        let position = self.transaction_index.get(hash).copied()?;
        let removed = self.transactions.remove(position);
        self.sent_transactions.retain(|sent| &sent.hash != hash);
        self.journal.push(Change::TransactionDeleted(*hash));
        self.reindex();
        Some(removed)
    }

    /// Hash of the transaction spending `outpoint`, if any.
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<&Hash> {
        self.spent_outputs.get(outpoint)
    }

    pub fn previous_output(&self, outpoint: &OutPoint) -> Option<&TransactionOutput> {
        self.transaction(&outpoint.hash)
            .and_then(|tx| tx.outputs.iter().find(|output| output.index == outpoint.index))
    }

    /// Locally created transactions not yet seen in a block.
    pub fn pending_outgoing_transactions(&self) -> Vec<&Transaction> {
        self.transactions
            .iter()
            .filter(|tx| tx.is_outgoing && tx.block_hash.is_none() && tx.status != TransactionStatus::Invalid)
            .collect()
    }

    pub fn next_transaction_order(&self) -> u32 {
        self.transactions.iter().map(|tx| tx.order + 1).max().unwrap_or(0)
    }

    /// Owned outputs with no spending input.
    pub fn unspent_outputs(&self) -> Vec<UnspentOutput> {
        let mut unspent = Vec::new();
        for tx in &self.transactions {
            if tx.status == TransactionStatus::Invalid {
                continue;
            }
            let block_height = tx.block_hash.and_then(|hash| self.block(&hash)).map(|block| block.height);
            for output in &tx.outputs {
                let Some(path) = &output.public_key_path else { continue };
                let outpoint = OutPoint {
                    hash: tx.hash,
                    index: output.index,
                };
                if self.spent_outputs.contains_key(&outpoint) {
                    continue;
                }
                if let Some(public_key) = self.public_keys.get(path) {
                    unspent.push(UnspentOutput {
                        output: output.clone(),
                        transaction_hash: tx.hash,
                        block_height,
                        is_outgoing: tx.is_outgoing,
                        public_key: public_key.clone(),
                    });
                }
            }
        }
        unspent
    }

    // ---- keys ----

    pub fn public_keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.public_keys.values()
    }

    pub fn public_key(&self, path: &str) -> Option<&PublicKey> {
        self.public_keys.get(path)
    }

    pub fn add_public_keys(&mut self, keys: Vec<PublicKey>) {
        for key in keys {
            if !self.public_keys.contains_key(&key.path) {
                self.journal.push(Change::PublicKey(key.clone()));
                self.public_keys.insert(key.path.clone(), key);
            }
        }
    }

    /// Find the key whose public key, key hash or wrapped-segwit script hash equals `data`.
    pub fn public_key_by_hash(&self, data: &[u8]) -> Option<&PublicKey> {
        self.public_keys.values().find(|key| {
            key.public_key_hash == data || key.public_key == data || key.script_hash_p2wpkh == data
        })
    }

    pub fn mark_key_used(&mut self, path: &str) -> bool {
        let inserted = self.used_key_paths.insert(path.to_string());
        if inserted {
            self.journal.push(Change::KeyUsed(path.to_string()));
        }
        inserted
    }

    pub fn is_key_used(&self, path: &str) -> bool {
        self.used_key_paths.contains(path)
    }

    // ---- broadcast bookkeeping ----

    pub fn sent_transaction(&self, hash: &Hash) -> Option<&SentTransaction> {
        self.sent_transactions.iter().find(|sent| &sent.hash == hash)
    }

    pub fn save_sent_transaction(&mut self, sent: SentTransaction) {
        self.journal.push(Change::SentTransaction(sent.clone()));
        match self.sent_transactions.iter_mut().find(|existing| existing.hash == sent.hash) {
            Some(existing) => *existing = sent,
            None => self.sent_transactions.push(sent),
        }
    }

    // ---- peer address pool ----

    pub fn peer_addresses(&self) -> impl Iterator<Item = &PeerAddress> {
        self.peer_addresses.values()
    }

    pub fn peer_address(&self, ip: &str) -> Option<&PeerAddress> {
        self.peer_addresses.get(ip)
    }

    pub fn save_peer_address(&mut self, address: PeerAddress) {
        self.journal.push(Change::PeerAddress(address.clone()));
        self.peer_addresses.insert(address.ip.clone(), address);
    }

    pub fn remove_peer_address(&mut self, ip: &str) {
        if self.peer_addresses.remove(ip).is_some() {
            self.journal.push(Change::PeerAddressRemoved(ip.to_string()));
        }
    }

    // ---- misc ----

    pub fn fee_rate(&self) -> Option<FeeRate> {
        self.fee_rate
    }

    pub fn set_fee_rate(&mut self, fee_rate: FeeRate) {
        self.journal.push(Change::FeeRate(fee_rate));
        self.fee_rate = Some(fee_rate);
    }

    pub fn initial_restored(&self) -> bool {
        self.initial_restored
    }

    pub fn set_initial_restored(&mut self, restored: bool) {
        if self.initial_restored != restored {
            self.journal.push(Change::InitialRestored(restored));
        }
        self.initial_restored = restored;
    }
}

impl BlockLookup for WalletRecords {
    fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.block(hash).cloned()
    }

    fn block_by_height(&self, height: u32) -> Option<Block> {
        self.block_at(height).cloned()
    }
}

/// Where committed state goes. Keyed by network plus wallet identifier.
///
/// `append` persists one commit's changes; `save` replaces everything stored
/// under `key` with a full snapshot and discards appended changes.
pub trait StorageBackend: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<WalletRecords>, StorageError>;
    fn save(&self, key: &str, records: &WalletRecords) -> Result<(), StorageError>;
    fn append(&self, key: &str, changes: &[Change]) -> Result<(), StorageError>;
    fn clear(&self, key: &str) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct MemoryBackend {
    snapshots: Mutex<HashMap<String, WalletRecords>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self, key: &str) -> Result<Option<WalletRecords>, StorageError> {
        Ok(self.snapshots.lock().get(key).cloned())
    }

    fn save(&self, key: &str, records: &WalletRecords) -> Result<(), StorageError> {
        self.snapshots.lock().insert(key.to_string(), records.clone());
        Ok(())
    }

    fn append(&self, key: &str, changes: &[Change]) -> Result<(), StorageError> {
        let mut snapshots = self.snapshots.lock();
        let records = snapshots.entry(key.to_string()).or_default();
        records.replay(changes.iter().cloned());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), StorageError> {
        self.snapshots.lock().remove(key);
        Ok(())
    }
}

fn backend_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Per wallet under `directory`: a `<key>.json` snapshot and a `<key>.log`
/// of commits since that snapshot, one JSON array of changes per line.
pub struct FileBackend {
    directory: PathBuf,
}

impl FileBackend {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let directory = directory.into();
        std::fs::create_dir_all(&directory).map_err(backend_error)?;
        Ok(FileBackend { directory })
    }

    fn snapshot_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{}.json", key))
    }

    fn log_path(&self, key: &str) -> PathBuf {
        self.directory.join(format!("{}.log", key))
    }

    /// Replay the change log on top of `records`. A torn final line is a
    /// commit that never finished and is dropped.
    fn replay_log(&self, key: &str, records: &mut WalletRecords) -> Result<bool, StorageError> {
        let path = self.log_path(key);
        if !path.exists() {
            return Ok(false);
        }
        let data = std::fs::read_to_string(&path).map_err(backend_error)?;
        let lines: Vec<&str> = data.lines().filter(|line| !line.is_empty()).collect();
        for (position, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Vec<Change>>(line) {
                Ok(changes) => records.replay(changes),
                Err(e) if position + 1 == lines.len() => {
                    warn!(key, error = %e, "dropping torn change log entry");
                }
                Err(e) => return Err(backend_error(e)),
            }
        }
        Ok(true)
    }
}

impl StorageBackend for FileBackend {
    fn load(&self, key: &str) -> Result<Option<WalletRecords>, StorageError> {
        let path = self.snapshot_path(key);
        let snapshot = if path.exists() {
            let data = std::fs::read(&path).map_err(backend_error)?;
            Some(serde_json::from_slice(&data).map_err(backend_error)?)
        } else {
            None
        };
        let found = snapshot.is_some();
        let mut records: WalletRecords = snapshot.unwrap_or_default();
        let logged = self.replay_log(key, &mut records)?;
        Ok((found || logged).then_some(records))
    }

    fn save(&self, key: &str, records: &WalletRecords) -> Result<(), StorageError> {
        let data = serde_json::to_vec(records).map_err(backend_error)?;
        let path = self.snapshot_path(key);
        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, data).map_err(backend_error)?;
        std::fs::rename(&temp, &path).map_err(backend_error)?;
        let log = self.log_path(key);
        if log.exists() {
            std::fs::remove_file(log).map_err(backend_error)?;
        }
        Ok(())
    }

    fn append(&self, key: &str, changes: &[Change]) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(changes).map_err(backend_error)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(key))
            .map_err(backend_error)?;
        file.write_all(&line).map_err(backend_error)?;
        file.sync_data().map_err(backend_error)
    }

    fn clear(&self, key: &str) -> Result<(), StorageError> {
        for path in [self.snapshot_path(key), self.log_path(key)] {
            if path.exists() {
                std::fs::remove_file(path).map_err(backend_error)?;
            }
        }
        Ok(())
    }
}

/// Committed wallet state plus the backend that persists it.
pub struct Storage {
    key: String,
    backend: Arc<dyn StorageBackend>,
    records: RwLock<WalletRecords>,
    /// Held by the active writer; counts changes appended since the last snapshot.
    writer: Mutex<usize>,
}

impl Storage {
    pub fn open(backend: Arc<dyn StorageBackend>, key: impl Into<String>) -> Result<Self, StorageError> {
        let key = key.into();
        let mut records = backend.load(&key)?.unwrap_or_default();
        records.reindex();
        debug!(key = %key, blocks = records.blocks_count(), "storage opened");
        Ok(Storage {
            key,
            backend,
            records: RwLock::new(records),
            writer: Mutex::new(0),
        })
    }

    pub fn in_memory(key: impl Into<String>) -> Self {
        Storage {
            key: key.into(),
            backend: Arc::new(MemoryBackend::new()),
            records: RwLock::new(WalletRecords::default()),
            writer: Mutex::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Run `f` against the last committed snapshot.
    pub fn read<R>(&self, f: impl FnOnce(&WalletRecords) -> R) -> R {
        f(&self.records.read())
    }

    /// WithTransaction: (WalletRecords → T | E) → T | E
    ///
    /// 1. Serialize writers
    /// 2. Apply `f` to a private copy of the committed records
    /// 3. On error discard the copy
    /// 4. On success hand the journaled changes to the backend, or a full
    ///    snapshot once the change log outgrows the records, then publish
    pub fn with_transaction<T, E>(&self, f: impl FnOnce(&mut WalletRecords) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let mut appended = self.writer.lock();
        let mut working = self.records.read().clone();
        let value = f(&mut working)?;
        let changes = working.take_journal();
        if !changes.is_empty() {
            let logged = *appended + changes.len();
            if logged > MIN_COMPACTION_CHANGES.max(working.entries_count()) {
                self.backend.save(&self.key, &working)?;
                debug!(key = %self.key, folded = logged, "change log compacted");
                *appended = 0;
            } else {
                self.backend.append(&self.key, &changes)?;
                *appended = logged;
            }
        }
        *self.records.write() = working;
        Ok(value)
    }

    /// Drop all state for this wallet.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut appended = self.writer.lock();
        self.backend.clear(&self.key)?;
        *appended = 0;
        *self.records.write() = WalletRecords::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::HeaderHasher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn header(prev: Hash, nonce: u32) -> Header {
        Header::new(1, prev, [0; 32], 0, 0x207fffff, nonce, &HeaderHasher::double_sha256())
    }

    fn chain(records: &mut WalletRecords, length: u32) -> Vec<Hash> {
        let mut prev = [0; 32];
        let mut hashes = Vec::new();
        for height in 0..length {
            let block = Block::new(header(prev, height), height);
            prev = *block.hash();
            hashes.push(prev);
            records.add_block(block).unwrap();
        }
        hashes
    }

    #[test]
    fn test_block_requires_known_previous() {
        let mut records = WalletRecords::default();
        chain(&mut records, 2);
        let orphan = Block::new(header([7; 32], 0), 2);
        assert!(matches!(records.add_block(orphan), Err(StorageError::Constraint(_))));
        assert_eq!(records.blocks_count(), 2);
    }

    #[test]
    fn test_last_downloaded_block_is_contiguous() {
        let mut records = WalletRecords::default();
        let hashes = chain(&mut records, 4);
        records.set_block_has_transactions(&hashes[0]).unwrap();
        records.set_block_has_transactions(&hashes[2]).unwrap();
        assert_eq!(records.last_downloaded_block().unwrap().height, 0);
        assert_eq!(records.block_hashes_to_download(10), vec![hashes[1], hashes[3]]);
        assert_eq!(records.last_block().unwrap().height, 3);
    }

    #[test]
    fn test_locator_starts_at_tip_and_ends_at_root() {
        let mut records = WalletRecords::default();
        let hashes = chain(&mut records, 40);
        let locator = records.block_locator_hashes();
        assert_eq!(locator.first(), hashes.last());
        assert_eq!(locator.last(), hashes.first());
        assert!(locator.len() < 20);
    }

    #[test]
    fn test_output_spent_once() {
        let mut records = WalletRecords::default();
        let outpoint = OutPoint { hash: [1; 32], index: 0 };
        let spend = |lock_time| {
            Transaction::new(1, vec![TransactionInput::new(outpoint, vec![], 0)], vec![], lock_time)
        };
        records.save_transaction(spend(0)).unwrap();
        assert!(records.save_transaction(spend(0)).is_ok());
        assert!(matches!(records.save_transaction(spend(1)), Err(StorageError::Constraint(_))));
        assert!(records.spender_of(&outpoint).is_some());
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let storage = Storage::in_memory("test");
        let result: Result<(), StorageError> = storage.with_transaction(|records| {
            records.set_initial_restored(true);
            Err(StorageError::Constraint("abort".into()))
        });
        assert!(result.is_err());
        assert!(!storage.read(|records| records.initial_restored()));

        storage
            .with_transaction(|records| {
                records.set_initial_restored(true);
                Ok::<_, StorageError>(())
            })
            .unwrap();
        assert!(storage.read(|records| records.initial_restored()));
    }

    /// Counts what each commit hands to the wrapped backend.
    #[derive(Default)]
    struct CountingBackend {
        inner: MemoryBackend,
        snapshots: AtomicUsize,
        appends: Mutex<Vec<usize>>,
    }

    impl StorageBackend for CountingBackend {
        fn load(&self, key: &str) -> Result<Option<WalletRecords>, StorageError> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, records: &WalletRecords) -> Result<(), StorageError> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            self.inner.save(key, records)
        }

        fn append(&self, key: &str, changes: &[Change]) -> Result<(), StorageError> {
            self.appends.lock().push(changes.len());
            self.inner.append(key, changes)
        }

        fn clear(&self, key: &str) -> Result<(), StorageError> {
            self.inner.clear(key)
        }
    }

    /// One header commit and one merkle-block commit per height.
    fn sync_blocks(storage: &Storage, from: u32, to: u32) {
        for height in from..to {
            let hash = storage
                .with_transaction(|records| {
                    let prev = records.last_block().map_or([0; 32], |block| *block.hash());
                    let block = Block::new(header(prev, height), height);
                    let hash = *block.hash();
                    records.add_block(block)?;
                    Ok::<_, StorageError>(hash)
                })
                .unwrap();
            storage
                .with_transaction(|records| records.set_block_has_transactions(&hash))
                .unwrap();
        }
    }

    #[test]
    fn test_commits_persist_only_their_changes() {
        let backend = Arc::new(CountingBackend::default());
        let storage = Storage::open(backend.clone(), "RegTest-w1").unwrap();
        sync_blocks(&storage, 0, 200);

        assert_eq!(backend.snapshots.load(Ordering::SeqCst), 0);
        let appends = backend.appends.lock().clone();
        assert_eq!(appends.len(), 400);
        assert!(appends.iter().all(|count| *count == 1));

        // read-only and no-op commits write nothing
        storage.with_transaction(|records| Ok::<_, StorageError>(records.blocks_count())).unwrap();
        let tip = storage.read(|records| *records.last_block().unwrap().hash());
        storage.with_transaction(|records| records.set_block_has_transactions(&tip)).unwrap();
        assert_eq!(backend.appends.lock().len(), 400);

        let reopened = Storage::open(backend, "RegTest-w1").unwrap();
        assert_eq!(reopened.read(|records| records.last_downloaded_block().map(|b| b.height)), Some(199));
        assert_eq!(reopened.read(|records| records.block(&tip).map(|b| b.height)), Some(199));
    }

    #[test]
    fn test_change_log_compacts_into_snapshot() {
        let backend = Arc::new(CountingBackend::default());
        let storage = Storage::open(backend.clone(), "RegTest-w1").unwrap();
        sync_blocks(&storage, 0, 600);

        // the 1025th logged change, the header at height 512, exceeds the threshold
        assert_eq!(backend.snapshots.load(Ordering::SeqCst), 1);
        assert_eq!(backend.appends.lock().len(), 1199);

        let reopened = Storage::open(backend, "RegTest-w1").unwrap();
        assert_eq!(reopened.read(|records| records.last_downloaded_block().map(|b| b.height)), Some(599));
    }

    #[test]
    fn test_file_backend_replays_change_log() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(dir.path()).unwrap());
        let kept = Transaction::new(1, vec![], vec![], 0);
        let dropped = Transaction::new(1, vec![], vec![], 1);
        {
            let storage = Storage::open(backend.clone(), "RegTest-w1").unwrap();
            sync_blocks(&storage, 0, 3);
            storage
                .with_transaction(|records| {
                    records.save_transaction(kept.clone())?;
                    records.save_transaction(dropped.clone())?;
                    records.mark_key_used("0/1/0");
                    Ok::<_, StorageError>(())
                })
                .unwrap();
            storage
                .with_transaction(|records| {
                    records.delete_transaction(&dropped.hash);
                    Ok::<_, StorageError>(())
                })
                .unwrap();
        }
        assert!(!dir.path().join("RegTest-w1.json").exists());

        // a commit cut off mid-write is ignored
        let mut log = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("RegTest-w1.log"))
            .unwrap();
        log.write_all(b"[{\"KeyUsed\":").unwrap();

        let reopened = Storage::open(backend, "RegTest-w1").unwrap();
        reopened.read(|records| {
            assert_eq!(records.last_downloaded_block().map(|b| b.height), Some(2));
            assert!(records.transaction_exists(&kept.hash));
            assert!(!records.transaction_exists(&dropped.hash));
            assert!(records.is_key_used("0/1/0"));
        });
    }

    #[test]
    fn test_file_backend_persists_and_reindexes() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(dir.path()).unwrap());
        let hashes = {
            let storage = Storage::open(backend.clone(), "RegTest-w1").unwrap();
            storage
                .with_transaction(|records| Ok::<_, StorageError>(chain(records, 3)))
                .unwrap()
        };

        let reopened = Storage::open(backend.clone(), "RegTest-w1").unwrap();
        assert_eq!(reopened.read(|records| records.block(&hashes[2]).map(|b| b.height)), Some(2));

        let other = Storage::open(backend.clone(), "RegTest-w2").unwrap();
        assert_eq!(other.read(|records| records.blocks_count()), 0);

        reopened.clear().unwrap();
        assert!(Storage::open(backend, "RegTest-w1").unwrap().read(|records| records.blocks_count() == 0));
    }
}
