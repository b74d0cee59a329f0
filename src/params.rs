//! Per-network parameter table
//!
//! Networks differ only in data: magic bytes, ports, seeds, address
//! prefixes, the header hash algorithm and the header validation rules.

use crate::constants::*;
use crate::crypto::HeaderHasher;
use crate::types::{hash_from_hex, Block, Hash, Header};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkKind {
    MainNet,
    TestNet,
    RegTest,
    MainNetBitcoinCash,
    MainNetDash,
    TestNetDash,
}

impl NetworkKind {
    pub fn is_dash(&self) -> bool {
        matches!(self, NetworkKind::MainNetDash | NetworkKind::TestNetDash)
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    DoubleSha256,
    X11,
}

/// Header validation rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorKind {
    /// Retarget every 2016 blocks, unchanged bits in between, proof of work
    Legacy,
    /// Legacy retarget, but minimum-difficulty blocks allowed after 20 minutes
    Testnet,
    /// Linkage only
    Relaxed,
    /// Linkage plus a bound on the compact target
    CheckpointOnly,
}

/// Address text encoding used for segwit outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEncoding {
    Bech32,
    CashAddress,
    None,
}

/// Trusted chain root. Header hash is computed once the hasher is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub version: i32,
    pub prev_block_hash: &'static str,
    pub merkle_root: &'static str,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl Checkpoint {
    pub fn to_block(&self, hasher: &HeaderHasher) -> Block {
        let prev: Hash = hash_from_hex(self.prev_block_hash).unwrap_or([0; 32]);
        let merkle: Hash = hash_from_hex(self.merkle_root).unwrap_or([0; 32]);
        let header = Header::new(self.version, prev, merkle, self.timestamp, self.bits, self.nonce, hasher);
        let mut block = Block::new(header, self.height);
        block.has_transactions = true;
        block
    }
}

#[derive(Debug, Clone)]
pub struct NetworkParams {
    pub kind: NetworkKind,
    pub magic: u32,
    pub port: u16,
    pub protocol_version: u32,
    pub dns_seeds: Vec<&'static str>,
    pub address_version: u8,
    pub script_version: u8,
    pub address_encoding: AddressEncoding,
    /// bech32 human-readable part or cash-address prefix
    pub address_hrp: &'static str,
    pub coin_type: u32,
    pub hash_algorithm: HashAlgorithm,
    pub validator: ValidatorKind,
    pub max_target_bits: u32,
    /// Sign with SIGHASH_FORKID (Bitcoin Cash replay protection)
    pub sighash_fork_id: bool,
    /// Typed transactions carry an extra payload after lock time (Dash)
    pub special_transactions: bool,
    pub default_peer_size: usize,
    pub checkpoints: Vec<Checkpoint>,
}

impl NetworkParams {
    /// NetworkParams: NetworkKind → parameter row
    pub fn for_network(kind: NetworkKind) -> Self {
        match kind {
            NetworkKind::MainNet => NetworkParams {
                kind,
                magic: 0xd9b4bef9,
                port: 8333,
                protocol_version: 70014,
                dns_seeds: vec![
                    "seed.bitcoin.sipa.be",
                    "dnsseed.bluematt.me",
                    "dnsseed.bitcoin.dashjr.org",
                    "seed.bitcoinstats.com",
                    "seed.bitcoin.jonasschnelli.ch",
                    "seed.btc.petertodd.org",
                    "seed.bitcoin.sprovoost.nl",
                ],
                address_version: 0,
                script_version: 5,
                address_encoding: AddressEncoding::Bech32,
                address_hrp: "bc",
                coin_type: 0,
                hash_algorithm: HashAlgorithm::DoubleSha256,
                validator: ValidatorKind::Legacy,
                max_target_bits: MAX_TARGET_BITS,
                sighash_fork_id: false,
                special_transactions: false,
                default_peer_size: DEFAULT_PEER_SIZE,
                checkpoints: vec![Checkpoint {
                    height: 564480,
                    version: 536870912,
                    prev_block_hash: "00000000000000000017e5c36734296b27065045f181e028c0d91cebb336d50c",
                    merkle_root: "2f9963d6eb332a0dd03ad806f504981e6180226dbca4385dc801db8974b2c17b",
                    timestamp: 1551026038,
                    bits: 388914000,
                    nonce: 1427093839,
                }],
            },
            NetworkKind::TestNet => NetworkParams {
                kind,
                magic: 0x0709110b,
                port: 18333,
                protocol_version: 70014,
                dns_seeds: vec![
                    "testnet-seed.bitcoin.petertodd.org",
                    "testnet-seed.bitcoin.jonasschnelli.ch",
                    "testnet-seed.bluematt.me",
                    "testnet-seed.bitcoin.schildbach.de",
                    "bitcoin-testnet.bloqseeds.net",
                ],
                address_version: 111,
                script_version: 196,
                address_encoding: AddressEncoding::Bech32,
                address_hrp: "tb",
                coin_type: 1,
                hash_algorithm: HashAlgorithm::DoubleSha256,
                validator: ValidatorKind::Testnet,
                max_target_bits: MAX_TARGET_BITS,
                sighash_fork_id: false,
                special_transactions: false,
                default_peer_size: DEFAULT_PEER_SIZE,
                checkpoints: vec![Checkpoint {
                    height: 1479744,
                    version: 2079170560,
                    prev_block_hash: "00000000000007524a71cc81cadbd1ddf9d38848fa8081ad2a72eade4b70d1c1",
                    merkle_root: "975b76235d1a9b97fbf4a4f203a762728fb404d568dd33921e328e2d5a712c46",
                    timestamp: 1550688527,
                    bits: 436465680,
                    nonce: 489544448,
                }],
            },
            NetworkKind::RegTest => NetworkParams {
                kind,
                magic: 0xdab5bffa,
                port: 18444,
                protocol_version: 70014,
                dns_seeds: vec![
                    "btc-regtest.horizontalsystems.xyz",
                    "btc01-regtest.horizontalsystems.xyz",
                    "btc02-regtest.horizontalsystems.xyz",
                    "btc03-regtest.horizontalsystems.xyz",
                ],
                address_version: 111,
                script_version: 196,
                address_encoding: AddressEncoding::Bech32,
                address_hrp: "tb",
                coin_type: 1,
                hash_algorithm: HashAlgorithm::DoubleSha256,
                validator: ValidatorKind::Relaxed,
                max_target_bits: REGTEST_MAX_TARGET_BITS,
                sighash_fork_id: false,
                special_transactions: false,
                default_peer_size: DEFAULT_PEER_SIZE,
                checkpoints: vec![Checkpoint {
                    height: 0,
                    version: 1,
                    prev_block_hash: "0000000000000000000000000000000000000000000000000000000000000000",
                    merkle_root: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
                    timestamp: 1296688602,
                    bits: 545259519,
                    nonce: 2,
                }],
            },
            NetworkKind::MainNetBitcoinCash => NetworkParams {
                kind,
                magic: 0xe8f3e1e3,
                port: 8333,
                protocol_version: 70014,
                dns_seeds: vec![
                    "seed.bitcoinabc.org",
                    "seed-abc.bitcoinforks.org",
                    "btccash-seeder.bitcoinunlimited.info",
                    "seed.bitprim.org",
                    "seed.deadalnix.me",
                    "seeder.criptolayer.net",
                ],
                address_version: 0,
                script_version: 5,
                address_encoding: AddressEncoding::CashAddress,
                address_hrp: "bitcoincash",
                coin_type: 0,
                hash_algorithm: HashAlgorithm::DoubleSha256,
                validator: ValidatorKind::CheckpointOnly,
                max_target_bits: MAX_TARGET_BITS,
                sighash_fork_id: true,
                special_transactions: false,
                default_peer_size: DEFAULT_PEER_SIZE,
                checkpoints: vec![Checkpoint {
                    height: 571268,
                    version: 549453824,
                    prev_block_hash: "000000000000000002e4009667ba236d52f605cd44c12ebd79208c14b520968e",
                    merkle_root: "65822e3caa2a4709abd37df7de6464a58830da0f8e308af44586114e1c73914f",
                    timestamp: 1551084121,
                    bits: 403013590,
                    nonce: 2244691553,
                }],
            },
            NetworkKind::MainNetDash => NetworkParams {
                kind,
                magic: 0xbd6b0cbf,
                port: 9999,
                protocol_version: 70213,
                dns_seeds: vec!["dnsseed.dash.org", "dnsseed.dashdot.io", "dnsseed.masternode.io"],
                address_version: 76,
                script_version: 16,
                address_encoding: AddressEncoding::None,
                address_hrp: "",
                coin_type: 5,
                hash_algorithm: HashAlgorithm::X11,
                validator: ValidatorKind::CheckpointOnly,
                max_target_bits: 0x1e0fffff,
                sighash_fork_id: false,
                special_transactions: true,
                default_peer_size: 2,
                checkpoints: vec![Checkpoint {
                    height: 1030968,
                    version: 536870912,
                    prev_block_hash: "000000000000000992e45d7b6d5204e40b24474db7c107e7b1e4884f3e76462c",
                    merkle_root: "61694834cfd431c70975645849caff2e1bfb4c487706cf217129fd4371cd7a79",
                    timestamp: 1551689319,
                    bits: 0x193f7bf8,
                    nonce: 2813674015,
                }],
            },
            NetworkKind::TestNetDash => NetworkParams {
                kind,
                magic: 0xffcae2ce,
                port: 19999,
                protocol_version: 70213,
                dns_seeds: vec!["testnet-seed.dashdot.io", "test.dnsseed.masternode.io"],
                address_version: 140,
                script_version: 19,
                address_encoding: AddressEncoding::None,
                address_hrp: "",
                coin_type: 1,
                hash_algorithm: HashAlgorithm::X11,
                validator: ValidatorKind::CheckpointOnly,
                max_target_bits: 0x1e0fffff,
                sighash_fork_id: false,
                special_transactions: true,
                default_peer_size: 2,
                checkpoints: vec![Checkpoint {
                    height: 55032,
                    version: 536870912,
                    prev_block_hash: "00000025a533a276a43aaacc27d44f1e599f07fde18b8348c1355a9bcf0ea339",
                    merkle_root: "fe39bdb86999ba1eaca10e56bf12528c9cce278c8dde66f399605d8e79e12fe6",
                    timestamp: 1551699279,
                    bits: 0x1d312d59,
                    nonce: 4281733120,
                }],
            },
        }
    }

    /// Storage namespace: network identifier plus wallet identifier
    pub fn storage_key(&self, wallet_id: &str) -> String {
        format!("{}-{}", self.kind, wallet_id)
    }

    /// Highest checkpoint at or below `height`, falling back to the lowest one.
    pub fn checkpoint_for_height(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .filter(|checkpoint| checkpoint.height <= height)
            .max_by_key(|checkpoint| checkpoint.height)
            .or_else(|| self.checkpoints.iter().min_by_key(|checkpoint| checkpoint.height))
    }

    pub fn last_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.iter().max_by_key(|checkpoint| checkpoint.height)
    }
}
