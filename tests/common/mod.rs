//! Loopback node speaking just enough of the P2P protocol to drive a kit

#![allow(dead_code)]

use async_trait::async_trait;
use spv_engine::constants::*;
use spv_engine::merkle::{merkle_root, PartialMerkleTree};
use spv_engine::network::{
    encode_frame, FrameHeader, MerkleBlockMessage, MessageContext, MessageParserChain, NetworkAddress, NetworkMessage,
    VersionMessage,
};
use spv_engine::script::p2pkh_script;
use spv_engine::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const SEED: &str = "000102030405060708090a0b0c0d0e0f";

pub struct NoHistory;

#[async_trait]
impl BootstrapApi for NoHistory {
    async fn transactions(&self, _addresses: &[String]) -> Result<Vec<ApiTransaction>> {
        Ok(Vec::new())
    }
}

/// Blocks the node serves on top of the wallet's chain root.
#[derive(Clone, Default)]
pub struct ServedChain {
    pub root: Hash,
    pub headers: Vec<Header>,
    pub blocks: HashMap<Hash, (MerkleBlockMessage, Vec<Transaction>)>,
}

impl ServedChain {
    pub fn new(root: Hash) -> Self {
        ServedChain {
            root,
            ..ServedChain::default()
        }
    }

    pub fn tip(&self) -> Hash {
        self.headers.last().map_or(self.root, |header| *header.hash())
    }

    /// Append a block holding `transactions`; those flagged in `matches` go into the merkle block.
    pub fn push_block(&mut self, transactions: Vec<Transaction>, matches: &[bool], bits: u32) -> Header {
        let txids: Vec<Hash> = transactions.iter().map(|tx| tx.hash).collect();
        let root = merkle_root(&txids).unwrap_or([0; 32]);
        let timestamp = 1_700_000_000 + self.headers.len() as u32 * 600;
        let header = Header::new(1, self.tip(), root, timestamp, bits, 0, &HeaderHasher::double_sha256());
        let tree = PartialMerkleTree::from_transactions(&txids, matches);
        let matched = transactions
            .into_iter()
            .zip(matches)
            .filter(|(_, matched)| **matched)
            .map(|(tx, _)| tx)
            .collect();
        self.blocks.insert(
            *header.hash(),
            (
                MerkleBlockMessage {
                    header: header.clone(),
                    total_transactions: tree.total_transactions,
                    hashes: tree.hashes,
                    flags: tree.flags,
                },
                matched,
            ),
        );
        self.headers.push(header.clone());
        header
    }

    /// Headers after the first locator hash the node knows.
    fn headers_after(&self, locator: &[Hash]) -> Vec<Header> {
        for hash in locator {
            if *hash == self.root {
                return self.headers.clone();
            }
            if let Some(position) = self.headers.iter().position(|header| header.hash() == hash) {
                return self.headers[position + 1..].to_vec();
            }
        }
        Vec::new()
    }
}

#[derive(Debug)]
pub enum NodeEvent {
    Message(NetworkMessage),
    Closed,
}

pub struct FakeNode {
    pub port: u16,
    pub events: mpsc::UnboundedReceiver<NodeEvent>,
    task: JoinHandle<()>,
}

impl FakeNode {
    pub async fn start(params: &NetworkParams, chain: ServedChain) -> FakeNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events_tx, events) = mpsc::unbounded_channel();
        let magic = params.magic;
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let chain = chain.clone();
                let events = events_tx.clone();
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.into_split();
                    let context = MessageContext {
                        hasher: HeaderHasher::double_sha256(),
                        special_transactions: false,
                    };
                    let parsers = MessageParserChain::new();
                    loop {
                        let Some(message) = read_frame(&mut reader, magic, &parsers, &context).await else {
                            let _ = events.send(NodeEvent::Closed);
                            return;
                        };
                        for reply in respond(&chain, &message) {
                            if writer.write_all(&encode_frame(magic, &reply)).await.is_err() {
                                let _ = events.send(NodeEvent::Closed);
                                return;
                            }
                        }
                        let _ = events.send(NodeEvent::Message(message));
                    }
                });
            }
        });
        FakeNode { port, events, task }
    }

    /// Next message the predicate accepts, skipping the rest.
    pub async fn expect(&mut self, predicate: impl Fn(&NetworkMessage) -> bool) -> NetworkMessage {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(NodeEvent::Message(message)) if predicate(&message) => return message,
                    Some(_) => continue,
                    None => panic!("node stopped"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(20), wait)
            .await
            .expect("timed out waiting for message")
    }

    pub async fn expect_closed(&mut self) {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Some(NodeEvent::Closed) | None => return,
                    Some(NodeEvent::Message(_)) => continue,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(20), wait)
            .await
            .expect("timed out waiting for disconnect")
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_frame(
    reader: &mut OwnedReadHalf,
    magic: u32,
    parsers: &MessageParserChain,
    context: &MessageContext,
) -> Option<NetworkMessage> {
    let mut header = [0u8; MESSAGE_HEADER_SIZE];
    reader.read_exact(&mut header).await.ok()?;
    let header = FrameHeader::decode(&header, magic).ok()?;
    let mut payload = vec![0u8; header.length];
    reader.read_exact(&mut payload).await.ok()?;
    header.verify(&payload).ok()?;
    parsers.parse(&header.command, &payload, context).ok()
}

fn respond(chain: &ServedChain, message: &NetworkMessage) -> Vec<NetworkMessage> {
    match message {
        NetworkMessage::Version(_) => vec![
            NetworkMessage::Version(VersionMessage {
                version: 70015,
                services: NODE_NETWORK | NODE_BLOOM,
                timestamp: unix_time() as i64,
                addr_recv: NetworkAddress::unspecified(),
                addr_from: NetworkAddress::unspecified(),
                nonce: 7,
                user_agent: "/fake-node:0.1/".into(),
                start_height: chain.headers.len() as i32,
                relay: true,
            }),
            NetworkMessage::VerAck,
        ],
        NetworkMessage::GetHeaders(request) => {
            vec![NetworkMessage::Headers(chain.headers_after(&request.block_locator_hashes))]
        }
        NetworkMessage::GetData(items) => {
            let mut replies = Vec::new();
            for item in items.iter().filter(|item| item.inv_type == INV_MSG_FILTERED_BLOCK) {
                if let Some((merkle_block, transactions)) = chain.blocks.get(&item.hash) {
                    replies.push(NetworkMessage::MerkleBlock(merkle_block.clone()));
                    replies.extend(transactions.iter().cloned().map(NetworkMessage::Tx));
                }
            }
            replies
        }
        NetworkMessage::Inv(items) => {
            let wanted: Vec<InventoryItem> = items.iter().filter(|item| item.inv_type == INV_MSG_TX).cloned().collect();
            if wanted.is_empty() {
                Vec::new()
            } else {
                vec![NetworkMessage::GetData(wanted)]
            }
        }
        NetworkMessage::Ping(nonce) => vec![NetworkMessage::Pong(*nonce)],
        _ => Vec::new(),
    }
}

/// Regtest config pointed at a loopback node.
pub fn loopback_config(network: NetworkKind, port: u16) -> SpvConfig {
    let mut config = SpvConfig::new(network, SEED);
    config.dns_seeds = Some(vec!["127.0.0.1".to_string()]);
    config.port = Some(port);
    config.peer_size = Some(1);
    config.new_wallet = true;
    config.confirmations_threshold = 1;
    config.connect_interval_ms = 100;
    config
}

/// Key the wallet issues first on the external branch.
pub fn first_receive_key(params: &NetworkParams) -> PublicKey {
    let wallet = spv_engine::keys::HdWallet::new(&hex::decode(SEED).unwrap(), params.coin_type).unwrap();
    spv_engine::keys::KeyProvider::public_key(&wallet, 0, 0, true).unwrap()
}

pub fn payment_to(key: &PublicKey, value: u64, seed: u8) -> Transaction {
    Transaction::new(
        1,
        vec![TransactionInput::new(
            OutPoint {
                hash: [seed; 32],
                index: 0,
            },
            vec![0x51],
            SEQUENCE_FINAL,
        )],
        vec![TransactionOutput::new(value, p2pkh_script(&key.public_key_hash), 0)],
        0,
    )
}

pub fn unrelated_transaction(seed: u8) -> Transaction {
    Transaction::new(
        1,
        vec![TransactionInput::new(
            OutPoint {
                hash: [seed; 32],
                index: 1,
            },
            vec![0x51],
            SEQUENCE_FINAL,
        )],
        vec![TransactionOutput::new(1_000, p2pkh_script(&[seed; 20]), 0)],
        0,
    )
}

pub async fn wait_for_state(kit: &SpvKit, wanted: SyncState) {
    let mut states = kit.subscribe_sync_state();
    let wait = async {
        loop {
            if *states.borrow_and_update() == wanted {
                return;
            }
            if states.changed().await.is_err() {
                panic!("sync manager dropped");
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(20), wait)
        .await
        .expect("timed out waiting for sync state");
}

pub fn kit(config: SpvConfig) -> Arc<SpvKit> {
    Arc::new(SpvKit::new(config, Arc::new(NoHistory), None).unwrap())
}
