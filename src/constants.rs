//! Protocol constants and engine defaults

/// Size of the wire message header: magic, command, length, checksum
pub const MESSAGE_HEADER_SIZE: usize = 24;

/// Command field width in the message header
pub const COMMAND_SIZE: usize = 12;

/// Largest payload accepted from a peer: 4 MiB
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// Maximum headers in a headers message
pub const MAX_HEADERS: usize = 2000;

/// Maximum inventory items in inv/getdata messages
pub const MAX_INV_ITEMS: usize = 50_000;

/// Maximum addresses in an addr message
pub const MAX_ADDR_ADDRESSES: usize = 1000;

/// Node service bits
pub const NODE_NETWORK: u64 = 1;
pub const NODE_BLOOM: u64 = 1 << 2;

/// Protocol version that introduced bloom filters
pub const BLOOM_FILTER_PROTOCOL_VERSION: u32 = 70_000;

/// Difficulty adjustment interval: 2016 blocks
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u32 = 2016;

/// Target time per block: 10 minutes
pub const TARGET_TIME_PER_BLOCK: u32 = 600;

/// Target timespan of one adjustment interval: 2 weeks
pub const TARGET_TIMESPAN: u32 = DIFFICULTY_ADJUSTMENT_INTERVAL * TARGET_TIME_PER_BLOCK;

/// Maximum target (minimum difficulty)
pub const MAX_TARGET_BITS: u32 = 0x1d00ffff;

/// Regtest maximum target
pub const REGTEST_MAX_TARGET_BITS: u32 = 0x207fffff;

/// Sequence number for final transaction
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_FORKID: u32 = 0x40;

/// Outputs below this value are not relayed
pub const DUST_LIMIT: u64 = 546;

/// Blocks requested per merkle-block task
pub const MERKLE_BLOCKS_BATCH: usize = 500;

/// Satoshis per byte used before the first fee-rate refresh
pub const DEFAULT_FEE_RATE: u64 = 20;

/// Bloom filter limits (BIP37)
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
pub const MAX_BLOOM_HASH_FUNCS: u32 = 50;
pub const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.00005;
pub const BLOOM_UPDATE_ALL: u8 = 1;

// Engine defaults, overridable through `SpvConfig`
pub const DEFAULT_PEER_SIZE: usize = 10;
pub const DEFAULT_GAP_LIMIT: u32 = 20;
pub const DEFAULT_CONFIRMATIONS_THRESHOLD: u32 = 6;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RETRY_WINDOW_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_CONNECT_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_FEE_RATE_REFRESH_SECS: u64 = 180;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_USER_AGENT: &str = "/spv-engine:0.1.0/";

/// Base backoff applied to a failed host, doubled per consecutive failure
pub const PEER_BACKOFF_BASE_SECS: u64 = 30;
pub const PEER_BACKOFF_MAX_SECS: u64 = 60 * 60;
