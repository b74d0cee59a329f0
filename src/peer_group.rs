//! Peer pool: connection lifecycle, sync peer election and task routing
//!
//! All peer events funnel into one `PeerGroup::run` loop, so the registry,
//! the sync peer choice and the block syncer's download counters are only
//! ever changed from that task. Application code reaches the loop through a
//! cloneable `PeerGroupHandle`.

use crate::block_syncer::BlockSyncer;
use crate::bloom::BloomFilter;
use crate::constants::*;
use crate::error::PeerGroupError;
use crate::network::NetworkMessage;
use crate::peer::{spawn_peer, PeerEvent, PeerSettings};
use crate::peer_address_manager::PeerAddressManager;
use crate::peer_manager::{PeerInfo, PeerManager};
use crate::peer_task::PeerTask;
use crate::types::*;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const PEER_EVENT_CAPACITY: usize = 256;

/// Follow-up work requested by handlers and listeners, applied by the loop.
#[derive(Debug, Default)]
pub struct GroupActions {
    /// Tasks for one specific peer
    pub peer_tasks: Vec<(String, PeerTask)>,
    /// Tasks for whichever peer is ready next
    pub group_tasks: Vec<PeerTask>,
    /// Tasks sent to every connected peer
    pub broadcast: Vec<PeerTask>,
    /// Peers to drop, with the reason
    pub disconnects: Vec<(String, String)>,
}

/// Claims completed tasks. Handlers are tried in order; the first returning
/// true wins.
pub trait PeerTaskHandler: Send + Sync {
    fn handle_completed_task(&self, host: &str, task: &PeerTask, actions: &mut GroupActions) -> bool;
}

/// Sees every inv announcement.
pub trait InventoryItemsHandler: Send + Sync {
    fn handle_inventory_items(&self, host: &str, items: &[InventoryItem], actions: &mut GroupActions);
}

pub trait PeerGroupListener: Send + Sync {
    fn on_peer_connect(&self, _host: &str) {}
    fn on_peer_disconnect(&self, _host: &str, _error: Option<&str>) {}
    fn on_peer_ready(&self, _host: &str) {}
    fn on_sync_peer_elected(&self, _host: &str, _best_height: u32) {}
    fn on_peer_synced(&self, _host: &str) {}
    fn on_all_peers_synced(&self, _actions: &mut GroupActions) {}
}

#[derive(Debug)]
pub enum GroupCommand {
    AddPeerTask { host: String, task: PeerTask },
    Broadcast(PeerTask),
    Stop,
}

/// Cloneable entry point into a running peer group.
#[derive(Clone)]
pub struct PeerGroupHandle {
    registry: Arc<Mutex<PeerManager>>,
    tasks: mpsc::Sender<PeerTask>,
    commands: mpsc::UnboundedSender<GroupCommand>,
}

/// Receiving ends consumed by `PeerGroup::new`.
pub struct PeerGroupInbox {
    registry: Arc<Mutex<PeerManager>>,
    tasks: mpsc::Receiver<PeerTask>,
    commands: mpsc::UnboundedReceiver<GroupCommand>,
}

impl PeerGroupHandle {
    /// Handle plus inbox; at most `capacity` tasks wait for a ready peer.
    pub fn channel(capacity: usize) -> (Self, PeerGroupInbox) {
        let registry = Arc::new(Mutex::new(PeerManager::new()));
        let (tasks_tx, tasks_rx) = mpsc::channel(capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (
            PeerGroupHandle {
                registry: registry.clone(),
                tasks: tasks_tx,
                commands: commands_tx,
            },
            PeerGroupInbox {
                registry,
                tasks: tasks_rx,
                commands: commands_rx,
            },
        )
    }

    /// Queue a task for the next ready peer. Waits while the queue is full.
    pub async fn add_task(&self, task: PeerTask) -> Result<(), PeerGroupError> {
        self.tasks.send(task).await.map_err(|_| PeerGroupError::NotRunning)
    }

    pub fn add_peer_task(&self, host: &str, task: PeerTask) -> Result<(), PeerGroupError> {
        self.commands
            .send(GroupCommand::AddPeerTask {
                host: host.to_string(),
                task,
            })
            .map_err(|_| PeerGroupError::NotRunning)
    }

    pub fn broadcast(&self, task: PeerTask) -> Result<(), PeerGroupError> {
        self.commands
            .send(GroupCommand::Broadcast(task))
            .map_err(|_| PeerGroupError::NotRunning)
    }

    pub fn stop(&self) {
        let _ = self.commands.send(GroupCommand::Stop);
    }

    pub fn check_peers_synced(&self) -> Result<(), PeerGroupError> {
        self.registry.lock().check_peers_synced()
    }

    pub fn connected_peers_count(&self) -> usize {
        self.registry.lock().connected().len()
    }
}

#[cfg(test)]
impl PeerGroupHandle {
    pub(crate) fn registry(&self) -> &Arc<Mutex<PeerManager>> {
        &self.registry
    }
}

#[cfg(test)]
impl PeerGroupInbox {
    pub(crate) fn try_next_task(&mut self) -> Option<PeerTask> {
        self.tasks.try_recv().ok()
    }

    pub(crate) fn try_next_command(&mut self) -> Option<GroupCommand> {
        self.commands.try_recv().ok()
    }
}

#[derive(Clone)]
pub struct PeerGroupSettings {
    pub peer_size: usize,
    pub connect_interval: Duration,
    pub peer: PeerSettings,
}

pub struct PeerGroup {
    settings: PeerGroupSettings,
    registry: Arc<Mutex<PeerManager>>,
    inbox_tasks: mpsc::Receiver<PeerTask>,
    inbox_commands: mpsc::UnboundedReceiver<GroupCommand>,
    events_tx: mpsc::Sender<PeerEvent>,
    events: mpsc::Receiver<PeerEvent>,
    address_manager: Arc<PeerAddressManager>,
    block_syncer: Arc<BlockSyncer>,
    bloom: watch::Receiver<Option<BloomFilter>>,
    connectivity: watch::Receiver<bool>,
    task_handlers: Vec<Arc<dyn PeerTaskHandler>>,
    inventory_handlers: Vec<Arc<dyn InventoryItemsHandler>>,
    listeners: Vec<Arc<dyn PeerGroupListener>>,
    deferred: VecDeque<PeerTask>,
    /// Why we closed a peer, reported once its task exits
    close_reasons: HashMap<String, String>,
}

impl PeerGroup {
    pub fn new(
        inbox: PeerGroupInbox,
        settings: PeerGroupSettings,
        address_manager: Arc<PeerAddressManager>,
        block_syncer: Arc<BlockSyncer>,
        bloom: watch::Receiver<Option<BloomFilter>>,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        let (events_tx, events) = mpsc::channel(PEER_EVENT_CAPACITY);
        PeerGroup {
            settings,
            registry: inbox.registry,
            inbox_tasks: inbox.tasks,
            inbox_commands: inbox.commands,
            events_tx,
            events,
            address_manager,
            block_syncer,
            bloom,
            connectivity,
            task_handlers: Vec::new(),
            inventory_handlers: Vec::new(),
            listeners: Vec::new(),
            deferred: VecDeque::new(),
            close_reasons: HashMap::new(),
        }
    }

    pub fn add_task_handler(&mut self, handler: Arc<dyn PeerTaskHandler>) {
        self.task_handlers.push(handler);
    }

    pub fn add_inventory_handler(&mut self, handler: Arc<dyn InventoryItemsHandler>) {
        self.inventory_handlers.push(handler);
    }

    pub fn add_listener(&mut self, listener: Arc<dyn PeerGroupListener>) {
        self.listeners.push(listener);
    }

    /// Event sender for peers started outside the connect loop.
    pub fn events_sender(&self) -> mpsc::Sender<PeerEvent> {
        self.events_tx.clone()
    }

    /// Run until stopped. All peers are closed on exit.
    pub async fn run(mut self) {
        info!(peer_size = self.settings.peer_size, "peer group started");
        let mut connect_tick = tokio::time::interval(self.settings.connect_interval);
        connect_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let has_ready_peer = self.registry.lock().has_ready_peer();
            tokio::select! {
                _ = connect_tick.tick() => self.connect_next_peer(),
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(task) = self.inbox_tasks.recv(), if has_ready_peer => self.dispatch(task),
                command = self.inbox_commands.recv() => match command {
                    Some(GroupCommand::AddPeerTask { host, task }) => self.send_to_peer(&host, task),
                    Some(GroupCommand::Broadcast(task)) => self.broadcast(task),
                    Some(GroupCommand::Stop) | None => break,
                },
                Ok(()) = self.bloom.changed() => self.reload_filter_if_changed(),
                Ok(()) = self.connectivity.changed() => self.connectivity_changed(),
            }
            self.flush_deferred();
        }

        self.registry.lock().disconnect_all();
        info!("peer group stopped");
    }

    fn connect_next_peer(&mut self) {
        if !*self.connectivity.borrow() {
            return;
        }
        if self.registry.lock().peers_count() >= self.settings.peer_size {
            return;
        }
        match self.address_manager.get_ip() {
            Some(ip) => {
                let mut settings = self.settings.peer.clone();
                settings.local_best_height = self.block_syncer.local_known_best_height();
                debug!(peer = %ip, "connecting");
                let handle = spawn_peer(ip, settings, self.events_tx.clone());
                self.registry.lock().add(PeerInfo::new(handle));
            }
            None => {
                let manager = self.address_manager.clone();
                tokio::spawn(async move {
                    manager.resolve_seeds().await;
                });
            }
        }
    }

    fn connectivity_changed(&mut self) {
        let connected = *self.connectivity.borrow_and_update();
        if connected {
            info!("network available, resuming");
        } else {
            info!("network lost, disconnecting peers");
            self.registry.lock().disconnect_all();
        }
    }

    /// Push a new filter to every connected peer before any further requests.
    fn reload_filter_if_changed(&mut self) {
        if !self.bloom.has_changed().unwrap_or(false) {
            return;
        }
        let Some(filter) = self.bloom.borrow_and_update().clone() else {
            return;
        };
        let registry = self.registry.lock();
        for peer in registry.connected() {
            peer.handle.filter_load(filter.clone());
        }
    }

    pub(crate) fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { host, best_height } => self.on_connected(&host, best_height),
            PeerEvent::Ready { host } => {
                for listener in &self.listeners {
                    listener.on_peer_ready(&host);
                }
                if self.registry.lock().is_sync_peer(&host) {
                    self.download_blocks(&host);
                }
            }
            PeerEvent::TaskCompleted { host, task } => self.on_task_completed(&host, task),
            PeerEvent::MerkleBlock { host, merkle_block } => {
                if let Err(e) = self.block_syncer.handle_merkle_block(merkle_block) {
                    self.disconnect(&host, e.to_string());
                }
            }
            PeerEvent::Inventory { host, items } => self.on_inventory(&host, &items),
            PeerEvent::Addresses { addresses, .. } => self.address_manager.add_ips(addresses),
            PeerEvent::Disconnected { host, error } => self.on_disconnected(&host, error),
        }
    }

    fn on_connected(&mut self, host: &str, best_height: u32) {
        {
            let mut registry = self.registry.lock();
            let Some(peer) = registry.get_mut(host) else {
                return;
            };
            peer.connected = true;
            peer.best_height = best_height;
            if let Some(filter) = self.bloom.borrow().clone() {
                peer.handle.filter_load(filter);
            }
        }
        for listener in &self.listeners {
            listener.on_peer_connect(host);
        }
        self.elect_sync_peer();
    }

    fn on_task_completed(&mut self, host: &str, task: PeerTask) {
        if let Some(peer) = self.registry.lock().get_mut(host) {
            peer.pending_tasks = peer.pending_tasks.saturating_sub(1);
        }

        match &task {
            PeerTask::GetBlockHashes(completed) => match self.block_syncer.handle_headers(&completed.headers) {
                Ok(_) => {
                    if completed.headers.len() < MAX_HEADERS {
                        if let Some(peer) = self.registry.lock().get_mut(host) {
                            peer.blocks_synced = true;
                        }
                    }
                }
                Err(e) => {
                    self.disconnect(host, e.to_string());
                    return;
                }
            },
            PeerTask::GetMerkleBlocks(_) => self.block_syncer.download_iteration_completed(),
            _ => {
                let mut actions = GroupActions::default();
                let claimed = self
                    .task_handlers
                    .iter()
                    .any(|handler| handler.handle_completed_task(host, &task, &mut actions));
                if !claimed {
                    debug!(peer = %host, task = task.name(), "completed task not claimed");
                }
                self.apply(actions);
            }
        }

        if self.registry.lock().is_sync_peer(host) {
            self.download_blocks(host);
        }
    }

    fn on_inventory(&mut self, host: &str, items: &[InventoryItem]) {
        let new_block = items
            .iter()
            .any(|item| item.inv_type == INV_MSG_BLOCK && self.block_syncer.should_request(&item.hash));
        if new_block {
            let resync = {
                let mut registry = self.registry.lock();
                match registry.get_mut(host) {
                    Some(peer) if peer.synced => {
                        peer.synced = false;
                        peer.blocks_synced = false;
                        true
                    }
                    _ => false,
                }
            };
            if resync {
                debug!(peer = %host, "new block announced");
                self.elect_sync_peer();
            }
        }

        let mut actions = GroupActions::default();
        for handler in &self.inventory_handlers {
            handler.handle_inventory_items(host, items, &mut actions);
        }
        self.apply(actions);
    }

    fn on_disconnected(&mut self, host: &str, error: Option<String>) {
        let error = error.or_else(|| self.close_reasons.remove(host));
        self.close_reasons.remove(host);
        let was_sync_peer = {
            let mut registry = self.registry.lock();
            let was_sync_peer = registry.is_sync_peer(host);
            registry.remove(host);
            was_sync_peer
        };

        match &error {
            None => self.address_manager.mark_success(host),
            Some(reason) => {
                warn!(peer = %host, reason = %reason, "peer failed");
                self.address_manager.mark_failed(host);
            }
        }
        for listener in &self.listeners {
            listener.on_peer_disconnect(host, error.as_deref());
        }
        if was_sync_peer {
            self.block_syncer.download_failed();
            self.elect_sync_peer();
        }
    }

    fn disconnect(&mut self, host: &str, reason: String) {
        warn!(peer = %host, reason = %reason, "disconnecting peer");
        if let Some(peer) = self.registry.lock().get(host) {
            peer.handle.close();
        }
        self.close_reasons.insert(host.to_string(), reason);
    }

    /// Pick the next connected peer that still needs syncing. With none left
    /// and at least one peer connected, everything is synced.
    fn elect_sync_peer(&mut self) {
        let elected = {
            let mut registry = self.registry.lock();
            if registry.sync_peer().is_some() {
                return;
            }
            match registry.non_synced_peer().map(|peer| (peer.host.clone(), peer.best_height)) {
                Some((host, best_height)) => {
                    registry.set_sync_peer(Some(host.clone()));
                    Some((host, best_height))
                }
                None if registry.connected().is_empty() => return,
                None => None,
            }
        };

        match elected {
            Some((host, best_height)) => {
                info!(peer = %host, best_height, "sync peer elected");
                self.block_syncer.prepare_for_download();
                self.block_syncer.download_started(best_height);
                for listener in &self.listeners {
                    listener.on_sync_peer_elected(&host, best_height);
                }
                self.download_blocks(&host);
            }
            None => {
                debug!("all peers synced");
                let mut actions = GroupActions::default();
                for listener in &self.listeners {
                    listener.on_all_peers_synced(&mut actions);
                }
                self.apply(actions);
            }
        }
    }

    /// Next round for the sync peer: merkle blocks for stored headers, more
    /// headers until the peer runs out. With neither left the peer is synced.
    fn download_blocks(&mut self, host: &str) {
        let Some(peer) = self.registry.lock().get(host).cloned() else {
            return;
        };
        if !peer.ready() {
            return;
        }
        self.reload_filter_if_changed();

        let hashes = self.block_syncer.get_block_hashes(MERKLE_BLOCKS_BATCH);
        let mut requested = false;
        if !hashes.is_empty() {
            self.send_to_peer(host, PeerTask::get_merkle_blocks(hashes));
            requested = true;
        }
        if !peer.blocks_synced {
            let locator = self.block_syncer.block_locator_hashes();
            self.send_to_peer(host, PeerTask::get_block_hashes(self.settings.peer.protocol_version, locator));
            requested = true;
        }
        if requested {
            return;
        }

        {
            let mut registry = self.registry.lock();
            if let Some(peer) = registry.get_mut(host) {
                peer.synced = true;
                peer.handle.send_message(NetworkMessage::MemPool);
            }
            registry.set_sync_peer(None);
        }
        info!(peer = %host, height = self.block_syncer.local_downloaded_best_height(), "peer synced");
        self.block_syncer.download_completed();
        for listener in &self.listeners {
            listener.on_peer_synced(host);
        }
        self.elect_sync_peer();
    }

    fn send_to_peer(&mut self, host: &str, task: PeerTask) {
        let mut registry = self.registry.lock();
        match registry.get_mut(host) {
            Some(peer) if peer.connected => {
                peer.pending_tasks += 1;
                peer.handle.add_task(task);
            }
            _ => debug!(peer = %host, task = task.name(), "task dropped, peer gone"),
        }
    }

    fn broadcast(&mut self, task: PeerTask) {
        let hosts: Vec<String> = self
            .registry
            .lock()
            .connected()
            .iter()
            .map(|peer| peer.host.clone())
            .collect();
        for host in hosts {
            self.send_to_peer(&host, task.clone());
        }
    }

    /// Hand a queued task to a ready peer, or keep it until one is.
    fn dispatch(&mut self, task: PeerTask) {
        let host = self.registry.lock().some_ready_peers().first().map(|peer| peer.host.clone());
        match host {
            Some(host) => self.send_to_peer(&host, task),
            None => self.deferred.push_back(task),
        }
    }

    fn flush_deferred(&mut self) {
        while !self.deferred.is_empty() && self.registry.lock().has_ready_peer() {
            if let Some(task) = self.deferred.pop_front() {
                self.dispatch(task);
            }
        }
    }

    fn apply(&mut self, actions: GroupActions) {
        for (host, task) in actions.peer_tasks {
            self.send_to_peer(&host, task);
        }
        self.deferred.extend(actions.group_tasks);
        for task in actions.broadcast {
            self.broadcast(task);
        }
        for (host, reason) in actions.disconnects {
            self.disconnect(&host, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressConverterChain;
    use crate::address_manager::AddressManager;
    use crate::bloom::BloomFilterManager;
    use crate::crypto::HeaderHasher;
    use crate::error::SpvError;
    use crate::keys::HdWallet;
    use crate::listener::{DataProvider, ListenerDispatcher};
    use crate::network::{MessageContext, MessageParserChain};
    use crate::params::{NetworkKind, NetworkParams};
    use crate::peer::{PeerCommand, PeerHandle};
    use crate::storage::Storage;
    use crate::transaction_extractor::TransactionExtractor;
    use crate::transaction_processor::TransactionProcessor;
    use crate::unspent::UnspentOutputProvider;
    use crate::validator::BlockValidator;

    #[derive(Default)]
    struct Recorder {
        synced: Mutex<Vec<String>>,
        all_synced: Mutex<usize>,
    }

    impl PeerGroupListener for Recorder {
        fn on_peer_synced(&self, host: &str) {
            self.synced.lock().push(host.to_string());
        }

        fn on_all_peers_synced(&self, _actions: &mut GroupActions) {
            *self.all_synced.lock() += 1;
        }
    }

    struct Fixture {
        group: PeerGroup,
        handle: PeerGroupHandle,
        storage: Arc<Storage>,
        recorder: Arc<Recorder>,
        _connectivity: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let params = NetworkParams::for_network(NetworkKind::RegTest);
        let hasher = HeaderHasher::double_sha256();
        let storage = Arc::new(Storage::in_memory("group"));
        let converters = Arc::new(AddressConverterChain::for_network(&params).unwrap());
        let manager = Arc::new(AddressManager::new(
            Arc::new(HdWallet::new(&[2u8; 32], params.coin_type).unwrap()),
            converters.clone(),
            2,
        ));
        storage
            .with_transaction(|records| manager.fill_gap(records).map_err(SpvError::from))
            .unwrap();
        let bloom = Arc::new(BloomFilterManager::new());
        let data_provider = Arc::new(DataProvider::new(
            storage.clone(),
            UnspentOutputProvider::new(1),
            Arc::new(ListenerDispatcher::new()),
        ));
        let block_syncer = Arc::new(BlockSyncer::new(
            storage.clone(),
            BlockValidator::new(&params),
            Arc::new(TransactionProcessor::new(TransactionExtractor::new(converters), manager.clone())),
            manager,
            bloom.clone(),
            data_provider,
        ));
        block_syncer
            .ensure_checkpoint(Block::new(Header::new(1, [0; 32], [0; 32], 1_600_000_000, 0x207fffff, 0, &hasher), 100))
            .unwrap();

        let (handle, inbox) = PeerGroupHandle::channel(DEFAULT_TASK_QUEUE_CAPACITY);
        let (connectivity_tx, connectivity_rx) = watch::channel(true);
        let settings = PeerGroupSettings {
            peer_size: 2,
            connect_interval: Duration::from_millis(DEFAULT_CONNECT_INTERVAL_MS),
            peer: PeerSettings {
                magic: params.magic,
                port: params.port,
                protocol_version: params.protocol_version,
                user_agent: DEFAULT_USER_AGENT.into(),
                local_best_height: 0,
                handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
                task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
                parsers: Arc::new(MessageParserChain::new()),
                context: MessageContext {
                    hasher,
                    special_transactions: false,
                },
            },
        };
        let mut group = PeerGroup::new(
            inbox,
            settings,
            Arc::new(PeerAddressManager::new(storage.clone(), vec![], params.port)),
            block_syncer,
            bloom.subscribe(),
            connectivity_rx,
        );
        let recorder = Arc::new(Recorder::default());
        group.add_listener(recorder.clone());
        Fixture {
            group,
            handle,
            storage,
            recorder,
            _connectivity: connectivity_tx,
        }
    }

    fn add_peer(group: &PeerGroup, host: &str) -> mpsc::UnboundedReceiver<PeerCommand> {
        let (sender, receiver) = mpsc::unbounded_channel();
        group.registry.lock().add(PeerInfo::new(PeerHandle::new(host, sender)));
        receiver
    }

    fn next_task(commands: &mut mpsc::UnboundedReceiver<PeerCommand>) -> PeerTask {
        loop {
            match commands.try_recv() {
                Ok(PeerCommand::AddTask(task)) => return task,
                Ok(_) => continue,
                Err(e) => panic!("no task queued: {e}"),
            }
        }
    }

    fn headers_after(storage: &Storage, count: u32) -> Vec<Header> {
        let mut prev = storage.read(|records| *records.last_block().unwrap().hash());
        (0..count)
            .map(|i| {
                let header = Header::new(1, prev, [0; 32], 1_600_000_600 + i, 0x207fffff, 0, &HeaderHasher::double_sha256());
                prev = *header.hash();
                header
            })
            .collect()
    }

    #[test]
    fn test_sync_peer_downloads_headers_then_merkle_blocks() {
        let mut fixture = fixture();
        let mut commands = add_peer(&fixture.group, "10.0.0.1");
        fixture.group.handle_event(PeerEvent::Connected {
            host: "10.0.0.1".into(),
            best_height: 102,
        });
        assert!(fixture.group.registry.lock().is_sync_peer("10.0.0.1"));

        let PeerTask::GetBlockHashes(mut get_headers) = next_task(&mut commands) else {
            panic!("expected getheaders first");
        };
        get_headers.headers = headers_after(&fixture.storage, 2);
        let merkle_headers = get_headers.headers.clone();
        fixture.group.handle_event(PeerEvent::TaskCompleted {
            host: "10.0.0.1".into(),
            task: PeerTask::GetBlockHashes(get_headers),
        });

        let PeerTask::GetMerkleBlocks(get_blocks) = next_task(&mut commands) else {
            panic!("expected merkle block request");
        };
        assert_eq!(get_blocks.block_hashes.len(), 2);
        for header in merkle_headers {
            fixture.group.handle_event(PeerEvent::MerkleBlock {
                host: "10.0.0.1".into(),
                merkle_block: MerkleBlock::new(header, vec![]),
            });
        }
        fixture.group.handle_event(PeerEvent::TaskCompleted {
            host: "10.0.0.1".into(),
            task: PeerTask::GetMerkleBlocks(get_blocks),
        });

        assert!(matches!(commands.try_recv(), Ok(PeerCommand::SendMessage(NetworkMessage::MemPool))));
        assert_eq!(*fixture.recorder.synced.lock(), vec!["10.0.0.1".to_string()]);
        assert_eq!(*fixture.recorder.all_synced.lock(), 1);
        assert_eq!(fixture.handle.check_peers_synced(), Ok(()));
    }

    #[test]
    fn test_bad_headers_disconnect_sync_peer() {
        let mut fixture = fixture();
        let mut commands = add_peer(&fixture.group, "10.0.0.2");
        fixture.group.handle_event(PeerEvent::Connected {
            host: "10.0.0.2".into(),
            best_height: 200,
        });
        let PeerTask::GetBlockHashes(mut get_headers) = next_task(&mut commands) else {
            panic!("expected getheaders");
        };
        get_headers.headers = vec![Header::new(1, [7; 32], [0; 32], 1, 0x207fffff, 0, &HeaderHasher::double_sha256())];
        fixture.group.handle_event(PeerEvent::TaskCompleted {
            host: "10.0.0.2".into(),
            task: PeerTask::GetBlockHashes(get_headers),
        });
        assert!(matches!(commands.try_recv(), Ok(PeerCommand::Close)));

        fixture.group.handle_event(PeerEvent::Disconnected {
            host: "10.0.0.2".into(),
            error: None,
        });
        assert_eq!(fixture.group.registry.lock().peers_count(), 0);
        assert!(fixture.group.registry.lock().sync_peer().is_none());
    }

    #[test]
    fn test_block_announcement_resyncs_synced_peer() {
        let mut fixture = fixture();
        let _commands = add_peer(&fixture.group, "10.0.0.3");
        {
            let mut registry = fixture.group.registry.lock();
            let peer = registry.get_mut("10.0.0.3").unwrap();
            peer.connected = true;
            peer.synced = true;
            peer.blocks_synced = true;
        }
        fixture.group.handle_event(PeerEvent::Inventory {
            host: "10.0.0.3".into(),
            items: vec![InventoryItem::new(INV_MSG_BLOCK, [5; 32])],
        });
        let registry = fixture.group.registry.lock();
        assert!(registry.is_sync_peer("10.0.0.3"));
        assert!(!registry.get("10.0.0.3").unwrap().synced);
    }

    #[test]
    fn test_queued_task_waits_for_ready_peer() {
        let mut fixture = fixture();
        fixture.group.dispatch(PeerTask::request_transactions(vec![[1; 32]]));
        assert_eq!(fixture.group.deferred.len(), 1);

        let mut commands = add_peer(&fixture.group, "10.0.0.4");
        fixture.group.registry.lock().get_mut("10.0.0.4").unwrap().connected = true;
        fixture.group.flush_deferred();
        assert!(fixture.group.deferred.is_empty());
        assert!(matches!(next_task(&mut commands), PeerTask::RequestTransactions(_)));
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_group() {
        let (handle, inbox) = PeerGroupHandle::channel(1);
        drop(inbox);
        assert_eq!(
            handle.add_task(PeerTask::request_transactions(vec![])).await,
            Err(PeerGroupError::NotRunning)
        );
        assert_eq!(handle.check_peers_synced(), Err(PeerGroupError::NoConnectedPeers));
    }
}
