//! Engine configuration
//!
//! One validated value consumed by `SpvKit::new`. Every tunable has a default;
//! `from_env` applies `SPV_*` overrides on top of them.

use crate::constants::*;
use crate::crypto::HeaderHasher;
use crate::error::ConfigError;
use crate::params::{NetworkKind, NetworkParams};
use crate::transaction_syncer::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Shortest seed BIP32 accepts.
const MIN_SEED_BYTES: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpvConfig {
    #[serde(default = "default_network")]
    pub network: NetworkKind,
    #[serde(default = "default_wallet_id")]
    pub wallet_id: String,
    /// Hex encoded BIP32 seed
    #[serde(default, skip_serializing)]
    pub seed: String,
    /// JSON file storage directory; in-memory when unset
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    /// Network default when unset
    #[serde(default)]
    pub peer_size: Option<usize>,
    /// Replaces the network's DNS seeds
    #[serde(default)]
    pub dns_seeds: Option<Vec<String>>,
    /// Replaces the network's default port
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,
    #[serde(default = "default_confirmations_threshold")]
    pub confirmations_threshold: u32,
    /// Skip history discovery; nothing can have been paid to a fresh seed
    #[serde(default)]
    pub new_wallet: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_connect_interval_ms")]
    pub connect_interval_ms: u64,
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_fee_rate_refresh_secs")]
    pub fee_rate_refresh_secs: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// `tracing` filter directive; `RUST_LOG` wins when set
    #[serde(default)]
    pub log_filter: Option<String>,
    /// Required for X11 networks
    #[serde(skip)]
    pub header_hasher: Option<HeaderHasher>,
}

fn default_network() -> NetworkKind {
    NetworkKind::MainNet
}

fn default_wallet_id() -> String {
    "wallet".to_string()
}

fn default_gap_limit() -> u32 {
    DEFAULT_GAP_LIMIT
}

fn default_confirmations_threshold() -> u32 {
    DEFAULT_CONFIRMATIONS_THRESHOLD
}

fn default_connect_interval_ms() -> u64 {
    DEFAULT_CONNECT_INTERVAL_MS
}

fn default_task_queue_capacity() -> usize {
    DEFAULT_TASK_QUEUE_CAPACITY
}

fn default_handshake_timeout_secs() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_SECS
}

fn default_task_timeout_secs() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

fn default_fee_rate_refresh_secs() -> u64 {
    DEFAULT_FEE_RATE_REFRESH_SECS
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Default for SpvConfig {
    fn default() -> Self {
        SpvConfig {
            network: default_network(),
            wallet_id: default_wallet_id(),
            seed: String::new(),
            storage_dir: None,
            peer_size: None,
            dns_seeds: None,
            port: None,
            gap_limit: default_gap_limit(),
            confirmations_threshold: default_confirmations_threshold(),
            new_wallet: false,
            retry: RetryPolicy::default(),
            connect_interval_ms: default_connect_interval_ms(),
            task_queue_capacity: default_task_queue_capacity(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            fee_rate_refresh_secs: default_fee_rate_refresh_secs(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            user_agent: default_user_agent(),
            log_filter: None,
            header_hasher: None,
        }
    }
}

impl SpvConfig {
    pub fn new(network: NetworkKind, seed: impl Into<String>) -> Self {
        SpvConfig {
            network,
            seed: seed.into(),
            ..SpvConfig::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidField {
            field: "json",
            reason: e.to_string(),
        })
    }

    /// Defaults with `SPV_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = SpvConfig::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Only variables that are set and non-empty override; unparsable values are errors.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = env_value("SPV_NETWORK") {
            self.network = parse_network(&value)?;
        }
        if let Some(value) = env_value("SPV_WALLET_ID") {
            self.wallet_id = value;
        }
        if let Some(value) = env_value("SPV_SEED") {
            self.seed = value;
        }
        if let Some(value) = env_value("SPV_STORAGE_DIR") {
            self.storage_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = env_value("SPV_DNS_SEEDS") {
            let seeds: Vec<String> = value
                .split(',')
                .map(|seed| seed.trim().to_string())
                .filter(|seed| !seed.is_empty())
                .collect();
            if !seeds.is_empty() {
                self.dns_seeds = Some(seeds);
            }
        }
        if let Some(value) = env_parse("SPV_PEER_SIZE")? {
            self.peer_size = Some(value);
        }
        if let Some(value) = env_parse("SPV_PORT")? {
            self.port = Some(value);
        }
        if let Some(value) = env_parse("SPV_GAP_LIMIT")? {
            self.gap_limit = value;
        }
        if let Some(value) = env_parse("SPV_CONFIRMATIONS_THRESHOLD")? {
            self.confirmations_threshold = value;
        }
        if let Some(value) = env_parse("SPV_NEW_WALLET")? {
            self.new_wallet = value;
        }
        if let Some(value) = env_parse("SPV_FEE_RATE_REFRESH_SECS")? {
            self.fee_rate_refresh_secs = value;
        }
        if let Some(value) = env_value("SPV_USER_AGENT") {
            self.user_agent = value;
        }
        if let Some(value) = env_value("SPV_LOG") {
            self.log_filter = Some(value);
        }
        Ok(())
    }

    /// Validate: first invalid field wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| {
            Err(ConfigError::InvalidField {
                field,
                reason: reason.to_string(),
            })
        };
        if self.wallet_id.trim().is_empty() {
            return invalid("wallet_id", "must not be empty");
        }
        self.seed_bytes()?;
        if self.gap_limit == 0 {
            return invalid("gap_limit", "must be at least 1");
        }
        if self.peer_size == Some(0) {
            return invalid("peer_size", "must be at least 1");
        }
        if self.task_queue_capacity == 0 {
            return invalid("task_queue_capacity", "must be at least 1");
        }
        if self.handshake_timeout_secs == 0 || self.task_timeout_secs == 0 {
            return invalid("timeouts", "must be positive");
        }
        if self.network.is_dash() && self.header_hasher.is_none() {
            return Err(ConfigError::MissingField("header_hasher"));
        }
        Ok(())
    }

    pub fn seed_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        if self.seed.is_empty() {
            return Err(ConfigError::MissingField("seed"));
        }
        let seed = hex::decode(self.seed.trim()).map_err(|e| ConfigError::InvalidField {
            field: "seed",
            reason: e.to_string(),
        })?;
        if seed.len() < MIN_SEED_BYTES {
            return Err(ConfigError::InvalidField {
                field: "seed",
                reason: format!("{} bytes, need at least {}", seed.len(), MIN_SEED_BYTES),
            });
        }
        Ok(seed)
    }

    pub fn params(&self) -> NetworkParams {
        NetworkParams::for_network(self.network)
    }

    pub fn peer_size(&self, params: &NetworkParams) -> usize {
        self.peer_size.unwrap_or(params.default_peer_size)
    }

    /// The configured hasher, else double SHA-256.
    pub fn header_hasher(&self) -> HeaderHasher {
        self.header_hasher.clone().unwrap_or_else(HeaderHasher::double_sha256)
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn fee_rate_refresh(&self) -> Duration {
        Duration::from_secs(self.fee_rate_refresh_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    env_value(key)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidField {
                field: key,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_network(value: &str) -> Result<NetworkKind, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "mainnet" | "bitcoin" => Ok(NetworkKind::MainNet),
        "testnet" => Ok(NetworkKind::TestNet),
        "regtest" => Ok(NetworkKind::RegTest),
        "bitcoincash" | "mainnetbitcoincash" => Ok(NetworkKind::MainNetBitcoinCash),
        "dash" | "mainnetdash" => Ok(NetworkKind::MainNetDash),
        "dashtestnet" | "testnetdash" => Ok(NetworkKind::TestNetDash),
        other => Err(ConfigError::InvalidField {
            field: "network",
            reason: format!("unknown network {other}"),
        }),
    }
}
