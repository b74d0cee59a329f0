//! Error types for the sync engine and the transaction pipeline

use thiserror::Error;

/// Malformed wire data or a peer that broke the protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Bad magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("Bad checksum for command '{0}'")]
    BadChecksum(String),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unexpected end of data")]
    UnexpectedEof,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Task timed out: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    Io(String),
}

/// A header or merkle block that does not satisfy the chain rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Previous block {0} is not known")]
    NoPreviousBlock(String),

    #[error("Interval start block at height {0} is not known")]
    NoIntervalStart(u32),

    #[error("Difficulty bits mismatch: expected {expected:#010x}, got {actual:#010x}")]
    NotDifficultyTransitionEqualBits { expected: u32, actual: u32 },

    #[error("Difficulty bits {0:#010x} exceed the network maximum")]
    TargetTooLarge(u32),

    #[error("Invalid compact target {0:#010x}")]
    InvalidCompactTarget(u32),

    #[error("Header hash above target")]
    InvalidProofOfWork,

    #[error("Merkle root mismatch")]
    WrongMerkleRoot,

    #[error("Invalid partial merkle tree: {0}")]
    InvalidPartialMerkleTree(String),

    #[error("Another block is already stored at height {0}")]
    ConflictingBlock(u32),

    #[error("Invalid masternode list: {0}")]
    InvalidMasternodeList(String),
}

/// Reasons an outgoing transaction cannot be built.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionCreationError {
    #[error("Insufficient funds: need {required}, have {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Transaction {0} already exists")]
    TransactionAlreadyExists(String),

    #[error("No unused public key available")]
    NoUnusedPublicKey,

    #[error("Amount {0} is below the dust limit")]
    Dust(u64),

    #[error("Fee exceeds the amount")]
    FeeMoreThanValue,

    #[error("Peers not ready: {0}")]
    PeersNotReady(#[from] PeerGroupError),
}

/// Why the peer group refuses to broadcast.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerGroupError {
    #[error("No peers connected")]
    NoConnectedPeers,

    #[error("Peers not synced yet")]
    PeersNotSynced,

    #[error("Peer group is not running")]
    NotRunning,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend failure: {0}")]
    Backend(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violated: {0}")]
    Constraint(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Unknown address format: {0}")]
    UnknownFormat(String),

    #[error("Wrong address prefix: {0}")]
    WrongPrefix(String),

    #[error("Bad address checksum")]
    BadChecksum,

    #[error("Unsupported script type for address: {0}")]
    UnsupportedScriptType(String),

    #[error("Invalid address payload: {0}")]
    InvalidPayload(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("No private key for input {0}")]
    NoPrivateKey(usize),

    #[error("No previous output for input {0}")]
    NoPreviousOutput(usize),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Unsupported script type for signing: {0}")]
    UnsupportedScriptType(String),
}

/// Umbrella error returned by the public API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpvError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    TransactionCreation(#[from] TransactionCreationError),

    #[error(transparent)]
    PeerGroup(#[from] PeerGroupError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("Bootstrap API failure: {0}")]
    Api(String),
}

pub type Result<T> = std::result::Result<T, SpvError>;
