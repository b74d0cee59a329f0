//! One-time wallet bootstrap from an address history API
//!
//! Before the first P2P sync of a restored wallet, keys are derived in
//! gap-limit batches and checked against an external history service. The
//! discovered keys are persisted and the chain is rooted at the highest
//! checkpoint below the wallet's first activity, so merkle block download
//! covers all of its history. New wallets skip discovery entirely.

use crate::address::AddressConverterChain;
use crate::address_manager::AddressManager;
use crate::block_syncer::BlockSyncer;
use crate::crypto::HeaderHasher;
use crate::error::{Result, SpvError};
use crate::keys::KeyProvider;
use crate::params::{NetworkKind, NetworkParams};
use crate::storage::Storage;
use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// One confirmed transaction known to the history service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiTransaction {
    /// Display-order hex
    pub block_hash: String,
    pub block_height: u32,
    pub output_addresses: Vec<String>,
}

#[async_trait]
pub trait BootstrapApi: Send + Sync {
    async fn transactions(&self, addresses: &[String]) -> Result<Vec<ApiTransaction>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHash {
    pub hash: Hash,
    pub height: u32,
}

pub struct BlockHashFetcher {
    api: Arc<dyn BootstrapApi>,
    converters: Arc<AddressConverterChain>,
}

impl BlockHashFetcher {
    pub fn new(api: Arc<dyn BootstrapApi>, converters: Arc<AddressConverterChain>) -> Self {
        BlockHashFetcher { api, converters }
    }

    /// Every address form a key can be paid to on this network.
    fn address_variants(&self, key: &PublicKey) -> Vec<String> {
        [
            (&key.public_key_hash, ScriptType::P2PKH),
            (&key.public_key_hash, ScriptType::P2WPKH),
            (&key.script_hash_p2wpkh, ScriptType::P2WPKHSH),
        ]
        .into_iter()
        .filter_map(|(hash, script_type)| self.converters.convert(hash, script_type).ok())
        .map(|address| address.string)
        .collect()
    }

    /// BlockHashes: keys → (blocks with activity, index of the last used key or -1)
    pub async fn block_hashes(&self, keys: &[PublicKey]) -> Result<(Vec<BlockHash>, i64)> {
        let variants: Vec<Vec<String>> = keys.iter().map(|key| self.address_variants(key)).collect();
        let addresses: Vec<String> = variants.iter().flatten().cloned().collect();
        let transactions = self.api.transactions(&addresses).await?;
        if transactions.is_empty() {
            return Ok((Vec::new(), -1));
        }

        let paid: HashSet<&str> = transactions
            .iter()
            .flat_map(|tx| tx.output_addresses.iter().map(String::as_str))
            .collect();
        let last_used_index = variants
            .iter()
            .rposition(|addresses| addresses.iter().any(|address| paid.contains(address.as_str())))
            .map_or(-1, |index| index as i64);

        let block_hashes = transactions
            .iter()
            .map(|tx| {
                hash_from_hex(&tx.block_hash)
                    .map(|hash| BlockHash {
                        hash,
                        height: tx.block_height,
                    })
                    .ok_or_else(|| SpvError::Api(format!("bad block hash {}", tx.block_hash)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((block_hashes, last_used_index))
    }
}

/// Gap-limited key discovery for one (account, branch).
pub struct BlockDiscoveryBatch {
    keys: Arc<dyn KeyProvider>,
    fetcher: BlockHashFetcher,
    gap_limit: u32,
}

impl BlockDiscoveryBatch {
    pub fn new(keys: Arc<dyn KeyProvider>, fetcher: BlockHashFetcher, gap_limit: u32) -> Self {
        BlockDiscoveryBatch {
            keys,
            fetcher,
            gap_limit,
        }
    }

    /// DiscoverBlockHashes: account × branch → (derived keys, block hashes)
    ///
    /// 1. Derive `gap_limit` keys and ask for their history
    /// 2. While some key in the batch was used, derive just enough more keys to
    ///    keep `gap_limit` unused keys after the last used one, and repeat
    pub async fn discover(&self, account: u32, external: bool) -> Result<(Vec<PublicKey>, Vec<BlockHash>)> {
        let mut public_keys = Vec::new();
        let mut block_hashes = Vec::new();
        let mut start = 0u32;
        let mut count = self.gap_limit;
        loop {
            let batch = (start..start + count)
                .map(|index| self.keys.public_key(account, index, external))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(SpvError::from)?;
            let (hashes, last_used_index) = self.fetcher.block_hashes(&batch).await?;
            block_hashes.extend(hashes);
            public_keys.extend(batch);
            if last_used_index < 0 {
                break;
            }
            let unused_after = count - last_used_index as u32 - 1;
            start += count;
            count = self.gap_limit - unused_after;
        }
        debug!(account, external, keys = public_keys.len(), blocks = block_hashes.len(), "key discovery done");
        Ok((public_keys, block_hashes))
    }
}

pub struct InitialSyncer {
    storage: Arc<Storage>,
    params: NetworkParams,
    hasher: HeaderHasher,
    discovery: BlockDiscoveryBatch,
    address_manager: Arc<AddressManager>,
    block_syncer: Arc<BlockSyncer>,
    new_wallet: bool,
}

impl InitialSyncer {
    pub fn new(
        storage: Arc<Storage>,
        params: NetworkParams,
        hasher: HeaderHasher,
        discovery: BlockDiscoveryBatch,
        address_manager: Arc<AddressManager>,
        block_syncer: Arc<BlockSyncer>,
        new_wallet: bool,
    ) -> Self {
        InitialSyncer {
            storage,
            params,
            hasher,
            discovery,
            address_manager,
            block_syncer,
            new_wallet,
        }
    }

    /// Regtest has no history service; new wallets have nothing to find.
    pub fn is_restored(&self) -> bool {
        self.new_wallet || self.params.kind == NetworkKind::RegTest || self.storage.read(|records| records.initial_restored())
    }

    /// Sync: discover keys and choose the chain root; a no-op once restored.
    pub async fn sync(&self) -> Result<()> {
        if self.is_restored() {
            self.finish(Vec::new(), None)?;
            return Ok(());
        }

        let mut keys = Vec::new();
        let mut first_height: Option<u32> = None;
        for account in 0u32.. {
            let (external_keys, external_hashes) = self.discovery.discover(account, true).await?;
            let (internal_keys, internal_hashes) = self.discovery.discover(account, false).await?;
            keys.extend(external_keys);
            keys.extend(internal_keys);
            if external_hashes.is_empty() && internal_hashes.is_empty() {
                break;
            }
            let lowest = external_hashes.iter().chain(&internal_hashes).map(|hash| hash.height).min();
            first_height = first_height.into_iter().chain(lowest).min();
        }
        info!(keys = keys.len(), first_height = ?first_height, "wallet history discovered");
        self.finish(keys, first_height)
    }

    fn finish(&self, keys: Vec<PublicKey>, first_height: Option<u32>) -> Result<()> {
        let checkpoint = match first_height {
            Some(height) => self.params.checkpoint_for_height(height),
            None => self.params.last_checkpoint(),
        }
        .ok_or_else(|| SpvError::Api(format!("no checkpoint for {}", self.params.kind)))?;
        self.block_syncer.ensure_checkpoint(checkpoint.to_block(&self.hasher))?;

        self.storage.with_transaction(|records| {
            records.add_public_keys(keys);
            self.address_manager.fill_gap(records)?;
            records.set_initial_restored(true);
            Ok::<_, SpvError>(())
        })
    }
}
