//! One peer connection: handshake, framing, and the in-flight task
//!
//! A peer runs as two tokio tasks. The reader decodes frames into messages;
//! the driver owns the write half, the task queue and the idle timer, and
//! reports everything upstream as `PeerEvent`s. The peer group talks back
//! only through `PeerHandle` commands.

use crate::bloom::BloomFilter;
use crate::constants::*;
use crate::error::ProtocolError;
use crate::network::*;
use crate::peer_task::{PeerTask, TaskStep};
use crate::types::*;
use anyhow::{anyhow, Context};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Everything a connection needs to know about the network and about us.
#[derive(Clone)]
pub struct PeerSettings {
    pub magic: u32,
    pub port: u16,
    pub protocol_version: u32,
    pub user_agent: String,
    pub local_best_height: u32,
    pub handshake_timeout: Duration,
    pub task_timeout: Duration,
    pub parsers: Arc<MessageParserChain>,
    pub context: MessageContext,
}

#[derive(Debug)]
pub enum PeerCommand {
    AddTask(PeerTask),
    FilterLoad(BloomFilter),
    SendMessage(NetworkMessage),
    Close,
}

#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake finished
    Connected { host: String, best_height: u32 },
    /// No task in flight or queued
    Ready { host: String },
    TaskCompleted { host: String, task: PeerTask },
    MerkleBlock { host: String, merkle_block: MerkleBlock },
    Inventory { host: String, items: Vec<InventoryItem> },
    Addresses { host: String, addresses: Vec<String> },
    Disconnected { host: String, error: Option<String> },
}

/// Sending side of a peer's command channel.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    host: String,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    pub fn new(host: impl Into<String>, commands: mpsc::UnboundedSender<PeerCommand>) -> Self {
        PeerHandle {
            host: host.into(),
            commands,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn send(&self, command: PeerCommand) {
        if self.commands.send(command).is_err() {
            debug!(peer = %self.host, "command dropped, peer gone");
        }
    }

    pub fn add_task(&self, task: PeerTask) {
        self.send(PeerCommand::AddTask(task));
    }

    pub fn filter_load(&self, filter: BloomFilter) {
        self.send(PeerCommand::FilterLoad(filter));
    }

    pub fn send_message(&self, message: NetworkMessage) {
        self.send(PeerCommand::SendMessage(message));
    }

    pub fn close(&self) {
        self.send(PeerCommand::Close);
    }
}

/// Start a connection to `host` on the network port.
pub fn spawn_peer(host: String, settings: PeerSettings, events: mpsc::Sender<PeerEvent>) -> PeerHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let handle = PeerHandle::new(host.clone(), commands_tx);
    tokio::spawn(async move {
        let result = run_peer(host.clone(), settings, commands_rx, events.clone()).await;
        let error = match result {
            Ok(()) => {
                info!(peer = %host, "peer disconnected");
                None
            }
            Err(e) => {
                warn!(peer = %host, error = %format!("{e:#}"), "peer disconnected with error");
                Some(format!("{e:#}"))
            }
        };
        let _ = events.send(PeerEvent::Disconnected { host, error }).await;
    });
    handle
}

async fn run_peer(
    host: String,
    settings: PeerSettings,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    events: mpsc::Sender<PeerEvent>,
) -> anyhow::Result<()> {
    let stream = timeout(settings.handshake_timeout, TcpStream::connect((host.as_str(), settings.port)))
        .await
        .map_err(|_| anyhow!(ProtocolError::Timeout("connect".into())))?
        .with_context(|| format!("connecting to {}", host))?;
    let remote = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let (messages_tx, messages_rx) = mpsc::channel(64);
    let reader_task = tokio::spawn(read_messages(reader, settings.clone(), messages_tx));

    let mut connection = Connection {
        host,
        settings,
        writer,
        messages: messages_rx,
        commands,
        events,
        tasks: VecDeque::new(),
        current: None,
        deadline: None,
    };
    let result = connection.run(remote).await;
    reader_task.abort();
    result
}

/// Reader loop: frames off the socket until an error or EOF.
async fn read_messages(
    mut reader: OwnedReadHalf,
    settings: PeerSettings,
    messages: mpsc::Sender<Result<NetworkMessage, ProtocolError>>,
) {
    loop {
        let result = read_message(&mut reader, &settings).await;
        let stop = result.is_err();
        if messages.send(result).await.is_err() || stop {
            return;
        }
    }
}

async fn read_message(reader: &mut OwnedReadHalf, settings: &PeerSettings) -> Result<NetworkMessage, ProtocolError> {
    let mut header_bytes = [0u8; MESSAGE_HEADER_SIZE];
    reader
        .read_exact(&mut header_bytes)
        .await
        .map_err(|e| ProtocolError::Io(e.to_string()))?;
    let header = FrameHeader::decode(&header_bytes, settings.magic)?;
    let mut payload = vec![0u8; header.length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| ProtocolError::Io(e.to_string()))?;
    header.verify(&payload)?;
    settings.parsers.parse(&header.command, &payload, &settings.context)
}

struct Connection {
    host: String,
    settings: PeerSettings,
    writer: OwnedWriteHalf,
    messages: mpsc::Receiver<Result<NetworkMessage, ProtocolError>>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    events: mpsc::Sender<PeerEvent>,
    tasks: VecDeque<PeerTask>,
    current: Option<PeerTask>,
    deadline: Option<Instant>,
}

impl Connection {
    async fn send(&mut self, message: &NetworkMessage) -> anyhow::Result<()> {
        debug!(peer = %self.host, command = message.command(), "send");
        self.writer
            .write_all(&encode_frame(self.settings.magic, message))
            .await
            .with_context(|| format!("writing {}", message.command()))
    }

    async fn emit(&self, event: PeerEvent) -> anyhow::Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| anyhow!("peer group stopped"))
    }

    async fn next_message(&mut self) -> anyhow::Result<NetworkMessage> {
        match self.messages.recv().await {
            Some(result) => Ok(result?),
            None => Err(anyhow!(ProtocolError::Io("connection closed".into()))),
        }
    }

    fn version_message(&self, remote: Option<SocketAddr>) -> NetworkMessage {
        NetworkMessage::Version(VersionMessage {
            version: self.settings.protocol_version,
            services: 0,
            timestamp: unix_time() as i64,
            addr_recv: remote
                .map(|address| NetworkAddress::from_socket(&address, NODE_NETWORK))
                .unwrap_or_else(NetworkAddress::unspecified),
            addr_from: NetworkAddress::unspecified(),
            nonce: rand::random(),
            user_agent: self.settings.user_agent.clone(),
            start_height: self.settings.local_best_height as i32,
            relay: false,
        })
    }

    /// version → (version, verack) → verack, bounded by the handshake timeout.
    async fn handshake(&mut self, remote: Option<SocketAddr>) -> anyhow::Result<u32> {
        let version = self.version_message(remote);
        self.send(&version).await?;

        let deadline = Instant::now() + self.settings.handshake_timeout;
        let mut best_height = None;
        let mut verack = false;
        while best_height.is_none() || !verack {
            let message = timeout(deadline.saturating_duration_since(Instant::now()), self.next_message())
                .await
                .map_err(|_| anyhow!(ProtocolError::Handshake("timed out".into())))??;
            match message {
                NetworkMessage::Version(version) => {
                    if !version.has_block_chain() {
                        return Err(ProtocolError::Handshake("peer does not serve blocks".into()).into());
                    }
                    if !version.supports_bloom_filter() {
                        return Err(ProtocolError::Handshake(format!("protocol {} lacks bloom filters", version.version)).into());
                    }
                    best_height = Some(version.start_height.max(0) as u32);
                    self.send(&NetworkMessage::VerAck).await?;
                }
                NetworkMessage::VerAck => verack = true,
                other => debug!(peer = %self.host, command = other.command(), "ignored before handshake"),
            }
        }
        Ok(best_height.unwrap_or_default())
    }

    async fn run(&mut self, remote: Option<SocketAddr>) -> anyhow::Result<()> {
        let best_height = self.handshake(remote).await.context("handshake")?;
        info!(peer = %self.host, best_height, "peer connected");
        self.emit(PeerEvent::Connected {
            host: self.host.clone(),
            best_height,
        })
        .await?;
        self.emit(PeerEvent::Ready { host: self.host.clone() }).await?;

        loop {
            let deadline = self.deadline;
            tokio::select! {
                message = self.messages.recv() => match message {
                    Some(message) => self.handle_message(message?).await?,
                    None => return Err(ProtocolError::Io("connection closed".into()).into()),
                },
                command = self.commands.recv() => match command {
                    Some(PeerCommand::AddTask(task)) => {
                        self.tasks.push_back(task);
                        if self.current.is_none() {
                            self.start_next_task().await?;
                        }
                    }
                    Some(PeerCommand::FilterLoad(filter)) => self.send(&NetworkMessage::FilterLoad(filter)).await?,
                    Some(PeerCommand::SendMessage(message)) => self.send(&message).await?,
                    Some(PeerCommand::Close) | None => return Ok(()),
                },
                _ = async { sleep_until(deadline.unwrap_or_else(Instant::now)).await }, if deadline.is_some() => {
                    self.handle_timeout().await?;
                }
            }
        }
    }

    /// Run queued tasks until one stays in flight or the queue is empty.
    async fn start_next_task(&mut self) -> anyhow::Result<()> {
        loop {
            let Some(mut task) = self.tasks.pop_front() else {
                self.deadline = None;
                return self.emit(PeerEvent::Ready { host: self.host.clone() }).await;
            };
            debug!(peer = %self.host, task = task.name(), "task started");
            let step = task.start();
            self.current = Some(task);
            self.deadline = Some(Instant::now() + self.settings.task_timeout);
            if !self.apply_step(step).await? {
                return Ok(());
            }
            self.finish_current().await?;
        }
    }

    async fn finish_current(&mut self) -> anyhow::Result<()> {
        if let Some(task) = self.current.take() {
            debug!(peer = %self.host, task = task.name(), "task completed");
            self.emit(PeerEvent::TaskCompleted {
                host: self.host.clone(),
                task,
            })
            .await?;
        }
        Ok(())
    }

    async fn complete_current(&mut self) -> anyhow::Result<()> {
        self.finish_current().await?;
        self.start_next_task().await
    }

    /// Send and emit what the step produced; true when the task is done.
    async fn apply_step(&mut self, step: TaskStep) -> anyhow::Result<bool> {
        for message in &step.outgoing {
            self.send(message).await?;
        }
        for merkle_block in step.merkle_blocks {
            self.emit(PeerEvent::MerkleBlock {
                host: self.host.clone(),
                merkle_block,
            })
            .await?;
        }
        if step.handled {
            self.deadline = Some(Instant::now() + self.settings.task_timeout);
        }
        Ok(step.completed)
    }

    async fn handle_timeout(&mut self) -> anyhow::Result<()> {
        let Some(task) = self.current.as_mut() else {
            self.deadline = None;
            return Ok(());
        };
        task.handle_timeout()?;
        self.complete_current().await
    }

    async fn handle_message(&mut self, message: NetworkMessage) -> anyhow::Result<()> {
        match message {
            NetworkMessage::Ping(nonce) => self.send(&NetworkMessage::Pong(nonce)).await,
            NetworkMessage::Inv(items) => {
                self.emit(PeerEvent::Inventory {
                    host: self.host.clone(),
                    items,
                })
                .await
            }
            NetworkMessage::Addr(addresses) => {
                self.emit(PeerEvent::Addresses {
                    host: self.host.clone(),
                    addresses: addresses.iter().map(NetworkAddress::ip_string).collect(),
                })
                .await
            }
            NetworkMessage::Reject(reject) => {
                warn!(peer = %self.host, message = %reject.message, reason = %reject.reason, "reject received");
                Ok(())
            }
            NetworkMessage::Version(_) | NetworkMessage::VerAck => Ok(()),
            other => {
                let Some(task) = self.current.as_mut() else {
                    debug!(peer = %self.host, command = other.command(), "no task for message");
                    return Ok(());
                };
                let step = task.handle_message(&other).context("task rejected message")?;
                if !step.handled && step.outgoing.is_empty() {
                    debug!(peer = %self.host, command = other.command(), "unsolicited message");
                }
                if self.apply_step(step).await? {
                    self.complete_current().await?;
                }
                Ok(())
            }
        }
    }
}
