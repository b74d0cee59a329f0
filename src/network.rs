//! P2P message model, framing and the ordered parser chain

use crate::bloom::BloomFilter;
use crate::constants::*;
use crate::crypto::{double_sha256, HeaderHasher};
use crate::dash::{MasternodeListDiff, TransactionLockVote};
use crate::error::ProtocolError;
use crate::serialization::{serialize_transaction, Decoder, Encoder};
use crate::types::*;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

type Result<T> = std::result::Result<T, ProtocolError>;

/// Messages exchanged with peers, including the Dash extensions
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkMessage {
    Version(VersionMessage),
    VerAck,
    Addr(Vec<NetworkAddress>),
    GetAddr,
    Inv(Vec<InventoryItem>),
    GetData(Vec<InventoryItem>),
    NotFound(Vec<InventoryItem>),
    GetHeaders(GetHeadersMessage),
    Headers(Vec<Header>),
    MerkleBlock(MerkleBlockMessage),
    Tx(Transaction),
    Ping(u64),
    Pong(u64),
    MemPool,
    FilterLoad(BloomFilter),
    Reject(RejectMessage),
    /// Dash instant-send lock request ("ix")
    TransactionLock(Transaction),
    /// Dash instant-send vote ("txlvote")
    TransactionLockVote(TransactionLockVote),
    GetMasternodeListDiff { base_block_hash: Hash, block_hash: Hash },
    MasternodeListDiff(MasternodeListDiff),
    Unknown { command: String, payload: Vec<u8> },
}

/// Version message for initial handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn has_block_chain(&self) -> bool {
        self.services & NODE_NETWORK != 0
    }

    pub fn supports_bloom_filter(&self) -> bool {
        self.version >= BLOOM_FILTER_PROTOCOL_VERSION
    }
}

/// Network address structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Only present on the wire inside addr messages
    pub timestamp: u32,
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn from_socket(addr: &SocketAddr, services: u64) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        NetworkAddress {
            timestamp: 0,
            services,
            ip: ip.octets(),
            port: addr.port(),
        }
    }

    pub fn unspecified() -> Self {
        NetworkAddress {
            timestamp: 0,
            services: 0,
            ip: [0; 16],
            port: 0,
        }
    }

    pub fn ip_string(&self) -> String {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub block_locator_hashes: Vec<Hash>,
    pub hash_stop: Hash,
}

/// Header plus partial merkle tree, as received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlockMessage {
    pub header: Header,
    pub total_transactions: u32,
    pub hashes: Vec<Hash>,
    pub flags: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMessage {
    pub message: String,
    pub code: u8,
    pub reason: String,
    pub data: Option<Hash>,
}

impl NetworkMessage {
    pub fn command(&self) -> &str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::VerAck => "verack",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::GetHeaders(_) => "getheaders",
            NetworkMessage::Headers(_) => "headers",
            NetworkMessage::MerkleBlock(_) => "merkleblock",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::Ping(_) => "ping",
            NetworkMessage::Pong(_) => "pong",
            NetworkMessage::MemPool => "mempool",
            NetworkMessage::FilterLoad(_) => "filterload",
            NetworkMessage::Reject(_) => "reject",
            NetworkMessage::TransactionLock(_) => "ix",
            NetworkMessage::TransactionLockVote(_) => "txlvote",
            NetworkMessage::GetMasternodeListDiff { .. } => "getmnlistd",
            NetworkMessage::MasternodeListDiff(_) => "mnlistdiff",
            NetworkMessage::Unknown { command, .. } => command,
        }
    }

    /// EncodePayload: NetworkMessage → bytes
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            NetworkMessage::Version(version) => {
                encoder
                    .write_i32(version.version as i32)
                    .write_u64(version.services)
                    .write_i64(version.timestamp);
                write_network_address(&mut encoder, &version.addr_recv, false);
                write_network_address(&mut encoder, &version.addr_from, false);
                encoder
                    .write_u64(version.nonce)
                    .write_var_string(&version.user_agent)
                    .write_i32(version.start_height)
                    .write_u8(version.relay as u8);
            }
            NetworkMessage::VerAck | NetworkMessage::GetAddr | NetworkMessage::MemPool => {}
            NetworkMessage::Addr(addresses) => {
                encoder.write_var_int(addresses.len() as u64);
                for address in addresses {
                    write_network_address(&mut encoder, address, true);
                }
            }
            NetworkMessage::Inv(items) | NetworkMessage::GetData(items) | NetworkMessage::NotFound(items) => {
                write_inventory(&mut encoder, items);
            }
            NetworkMessage::GetHeaders(message) => {
                encoder
                    .write_u32(message.version)
                    .write_var_int(message.block_locator_hashes.len() as u64);
                for hash in &message.block_locator_hashes {
                    encoder.write_bytes(hash);
                }
                encoder.write_bytes(&message.hash_stop);
            }
            NetworkMessage::Headers(headers) => {
                encoder.write_var_int(headers.len() as u64);
                for header in headers {
                    encoder.write_bytes(&header.serialize()).write_var_int(0);
                }
            }
            NetworkMessage::MerkleBlock(message) => {
                encoder
                    .write_bytes(&message.header.serialize())
                    .write_u32(message.total_transactions)
                    .write_var_int(message.hashes.len() as u64);
                for hash in &message.hashes {
                    encoder.write_bytes(hash);
                }
                encoder.write_var_bytes(&message.flags);
            }
            NetworkMessage::Tx(transaction) | NetworkMessage::TransactionLock(transaction) => {
                encoder.write_bytes(&serialize_transaction(transaction, true));
            }
            NetworkMessage::Ping(nonce) | NetworkMessage::Pong(nonce) => {
                encoder.write_u64(*nonce);
            }
            NetworkMessage::FilterLoad(filter) => {
                encoder
                    .write_var_bytes(filter.data())
                    .write_u32(filter.hash_funcs())
                    .write_u32(filter.tweak())
                    .write_u8(filter.flags());
            }
            NetworkMessage::Reject(reject) => {
                encoder
                    .write_var_string(&reject.message)
                    .write_u8(reject.code)
                    .write_var_string(&reject.reason);
                if let Some(data) = &reject.data {
                    encoder.write_bytes(data);
                }
            }
            NetworkMessage::TransactionLockVote(vote) => {
                vote.encode(&mut encoder);
            }
            NetworkMessage::GetMasternodeListDiff { base_block_hash, block_hash } => {
                encoder.write_bytes(base_block_hash).write_bytes(block_hash);
            }
            NetworkMessage::MasternodeListDiff(diff) => {
                diff.encode(&mut encoder);
            }
            NetworkMessage::Unknown { payload, .. } => {
                encoder.write_bytes(payload);
            }
        }
        encoder.into_inner()
    }
}

fn write_network_address(encoder: &mut Encoder, address: &NetworkAddress, with_time: bool) {
    if with_time {
        encoder.write_u32(address.timestamp);
    }
    encoder
        .write_u64(address.services)
        .write_bytes(&address.ip)
        .write_u16_be(address.port);
}

fn read_network_address(decoder: &mut Decoder<'_>, with_time: bool) -> Result<NetworkAddress> {
    let timestamp = if with_time { decoder.read_u32()? } else { 0 };
    Ok(NetworkAddress {
        timestamp,
        services: decoder.read_u64()?,
        ip: decoder.read_array()?,
        port: decoder.read_u16_be()?,
    })
}

fn write_inventory(encoder: &mut Encoder, items: &[InventoryItem]) {
    encoder.write_var_int(items.len() as u64);
    for item in items {
        encoder.write_u32(item.inv_type).write_bytes(&item.hash);
    }
}

fn read_inventory(decoder: &mut Decoder<'_>) -> Result<Vec<InventoryItem>> {
    let count = decoder.read_count(MAX_INV_ITEMS)?;
    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        let inv_type = decoder.read_u32()?;
        let hash = decoder.read_hash()?;
        items.push(InventoryItem::new(inv_type, hash));
    }
    Ok(items)
}

/// What a parser needs to know about the network it is decoding for.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub hasher: HeaderHasher,
    pub special_transactions: bool,
}

/// One link of the parser chain. Returns `None` when the command is not
/// handled, letting the next parser try.
pub trait MessageParser: Send + Sync {
    fn parse(&self, command: &str, payload: &[u8], context: &MessageContext) -> Option<Result<NetworkMessage>>;
}

/// Generic Bitcoin parser; handles every standard command and wraps anything else as `Unknown`.
pub struct BitcoinMessageParser;

impl MessageParser for BitcoinMessageParser {
    fn parse(&self, command: &str, payload: &[u8], context: &MessageContext) -> Option<Result<NetworkMessage>> {
        Some(parse_bitcoin_message(command, payload, context))
    }
}

fn parse_bitcoin_message(command: &str, payload: &[u8], context: &MessageContext) -> Result<NetworkMessage> {
    let mut decoder = Decoder::new(payload);
    let message = match command {
        "version" => {
            let version = decoder.read_i32()? as u32;
            let services = decoder.read_u64()?;
            let timestamp = decoder.read_i64()?;
            let addr_recv = read_network_address(&mut decoder, false)?;
            let addr_from = read_network_address(&mut decoder, false)?;
            let nonce = decoder.read_u64()?;
            let user_agent = decoder.read_var_string()?;
            let start_height = decoder.read_i32()?;
            let relay = if decoder.is_empty() { true } else { decoder.read_u8()? != 0 };
            NetworkMessage::Version(VersionMessage {
                version,
                services,
                timestamp,
                addr_recv,
                addr_from,
                nonce,
                user_agent,
                start_height,
                relay,
            })
        }
        "verack" => NetworkMessage::VerAck,
        "getaddr" => NetworkMessage::GetAddr,
        "mempool" => NetworkMessage::MemPool,
        "addr" => {
            let count = decoder.read_count(MAX_ADDR_ADDRESSES)?;
            let mut addresses = Vec::with_capacity(count);
            for _ in 0..count {
                addresses.push(read_network_address(&mut decoder, true)?);
            }
            NetworkMessage::Addr(addresses)
        }
        "inv" => NetworkMessage::Inv(read_inventory(&mut decoder)?),
        "getdata" => NetworkMessage::GetData(read_inventory(&mut decoder)?),
        "notfound" => NetworkMessage::NotFound(read_inventory(&mut decoder)?),
        "getheaders" => {
            let version = decoder.read_u32()?;
            let count = decoder.read_count(MAX_HEADERS)?;
            let mut block_locator_hashes = Vec::with_capacity(count);
            for _ in 0..count {
                block_locator_hashes.push(decoder.read_hash()?);
            }
            let hash_stop = decoder.read_hash()?;
            NetworkMessage::GetHeaders(GetHeadersMessage {
                version,
                block_locator_hashes,
                hash_stop,
            })
        }
        "headers" => {
            let count = decoder.read_count(MAX_HEADERS)?;
            let mut headers = Vec::with_capacity(count);
            for _ in 0..count {
                headers.push(decoder.read_header(&context.hasher)?);
                // Transaction count, always zero in headers messages
                decoder.read_var_int()?;
            }
            NetworkMessage::Headers(headers)
        }
        "merkleblock" => {
            let header = decoder.read_header(&context.hasher)?;
            let total_transactions = decoder.read_u32()?;
            let count = decoder.read_count(decoder.remaining() / 32)?;
            let mut hashes = Vec::with_capacity(count);
            for _ in 0..count {
                hashes.push(decoder.read_hash()?);
            }
            let flags = decoder.read_var_bytes()?;
            NetworkMessage::MerkleBlock(MerkleBlockMessage {
                header,
                total_transactions,
                hashes,
                flags,
            })
        }
        "tx" => NetworkMessage::Tx(decoder.read_transaction(context.special_transactions)?),
        "ping" => NetworkMessage::Ping(if decoder.is_empty() { 0 } else { decoder.read_u64()? }),
        "pong" => NetworkMessage::Pong(decoder.read_u64()?),
        "filterload" => {
            let data = decoder.read_var_bytes()?;
            let hash_funcs = decoder.read_u32()?;
            let tweak = decoder.read_u32()?;
            let flags = decoder.read_u8()?;
            NetworkMessage::FilterLoad(BloomFilter::from_parts(data, hash_funcs, tweak, flags))
        }
        "reject" => {
            let message = decoder.read_var_string()?;
            let code = decoder.read_u8()?;
            let reason = decoder.read_var_string()?;
            let data = if decoder.remaining() >= 32 { Some(decoder.read_hash()?) } else { None };
            NetworkMessage::Reject(RejectMessage {
                message,
                code,
                reason,
                data,
            })
        }
        other => NetworkMessage::Unknown {
            command: other.to_string(),
            payload: payload.to_vec(),
        },
    };
    Ok(message)
}

/// Ordered parsers; the first one that claims the command wins.
pub struct MessageParserChain {
    parsers: Vec<Box<dyn MessageParser>>,
}

impl MessageParserChain {
    /// Chain ending with the generic Bitcoin parser.
    pub fn new() -> Self {
        MessageParserChain {
            parsers: vec![Box::new(BitcoinMessageParser)],
        }
    }

    /// Insert a network-specific parser ahead of the existing ones.
    pub fn prepend(&mut self, parser: Box<dyn MessageParser>) {
        self.parsers.insert(0, parser);
    }

    pub fn parse(&self, command: &str, payload: &[u8], context: &MessageContext) -> Result<NetworkMessage> {
        for parser in &self.parsers {
            if let Some(result) = parser.parse(command, payload, context) {
                return result;
            }
        }
        Ok(NetworkMessage::Unknown {
            command: command.to_string(),
            payload: payload.to_vec(),
        })
    }
}

impl Default for MessageParserChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed 24-byte frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: String,
    pub length: usize,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    /// DecodeFrameHeader: bytes[24] × magic → FrameHeader
    ///
    /// 1. Magic must match the network
    /// 2. Command is NUL-padded ASCII
    /// 3. Length must not exceed MAX_PAYLOAD_SIZE
    pub fn decode(bytes: &[u8; MESSAGE_HEADER_SIZE], magic: u32) -> Result<Self> {
        let actual = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if actual != magic {
            return Err(ProtocolError::BadMagic { expected: magic, actual });
        }
        let raw_command = &bytes[4..4 + COMMAND_SIZE];
        let end = raw_command.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
        if raw_command[end..].iter().any(|b| *b != 0) {
            return Err(ProtocolError::Malformed("command not NUL padded".into()));
        }
        let command = std::str::from_utf8(&raw_command[..end])
            .map_err(|_| ProtocolError::Malformed("command is not ASCII".into()))?
            .to_string();
        let length = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(length));
        }
        let checksum = [bytes[20], bytes[21], bytes[22], bytes[23]];
        Ok(FrameHeader { command, length, checksum })
    }

    pub fn verify(&self, payload: &[u8]) -> Result<()> {
        if checksum(payload) != self.checksum {
            return Err(ProtocolError::BadChecksum(self.command.clone()));
        }
        Ok(())
    }
}

pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Frame a message: magic, command, length, checksum, payload.
pub fn encode_frame(magic: u32, message: &NetworkMessage) -> Vec<u8> {
    let payload = message.encode_payload();
    let mut command = [0u8; COMMAND_SIZE];
    let name = message.command().as_bytes();
    let len = name.len().min(COMMAND_SIZE);
    command[..len].copy_from_slice(&name[..len]);

    let mut encoder = Encoder::new();
    encoder
        .write_u32(magic)
        .write_bytes(&command)
        .write_u32(payload.len() as u32)
        .write_bytes(&checksum(&payload))
        .write_bytes(&payload);
    encoder.into_inner()
}
