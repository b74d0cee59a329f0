//! Top-level sync state and engine lifecycle

use crate::block_syncer::BlockSyncListener;
use crate::bloom::BloomFilterManager;
use crate::error::{PeerGroupError, Result};
use crate::fee_rate::FeeRateSyncer;
use crate::initial_syncer::InitialSyncer;
use crate::listener::DataProvider;
use crate::peer_group::{GroupActions, PeerGroup, PeerGroupHandle, PeerGroupListener};
use crate::storage::Storage;
use crate::types::SyncState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Default)]
struct Workers {
    peer_group: Option<JoinHandle<()>>,
    fee_rate: Option<JoinHandle<()>>,
}

pub struct SyncManager {
    state: watch::Sender<SyncState>,
    connectivity: watch::Sender<bool>,
    storage: Arc<Storage>,
    initial_syncer: Arc<InitialSyncer>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    fee_rate_syncer: Option<Arc<FeeRateSyncer>>,
    data_provider: Arc<DataProvider>,
    peer_group: PeerGroupHandle,
    shutdown_timeout: Duration,
    /// Built but not yet running; taken by `start`
    pending: Mutex<Option<PeerGroup>>,
    workers: Mutex<Workers>,
}

impl SyncManager {
    pub fn new(
        storage: Arc<Storage>,
        initial_syncer: Arc<InitialSyncer>,
        bloom_filter_manager: Arc<BloomFilterManager>,
        fee_rate_syncer: Option<Arc<FeeRateSyncer>>,
        data_provider: Arc<DataProvider>,
        peer_group: PeerGroupHandle,
        shutdown_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::NotSynced);
        let (connectivity, _) = watch::channel(true);
        SyncManager {
            state,
            connectivity,
            storage,
            initial_syncer,
            bloom_filter_manager,
            fee_rate_syncer,
            data_provider,
            peer_group,
            shutdown_timeout,
            pending: Mutex::new(None),
            workers: Mutex::new(Workers::default()),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Connectivity feed for the peer group and the fee rate refresh.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.subscribe()
    }

    /// Loss pauses peer connections; state is kept and sync resumes from the
    /// stored height once connectivity returns.
    pub fn set_connectivity(&self, connected: bool) {
        let changed = self.connectivity.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
        if changed {
            info!(connected, "connectivity changed");
            if !connected {
                self.set_state(SyncState::NotSynced);
            }
        }
    }

    /// Hand over the peer group `start` will run. Its listeners and handlers
    /// must already be registered.
    pub fn attach(&self, peer_group: PeerGroup) {
        *self.pending.lock() = Some(peer_group);
    }

    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .peer_group
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    fn set_state(&self, state: SyncState) {
        let changed = self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            info!(?state, "sync state changed");
            self.data_provider.on_kit_state_changed(state);
        }
    }

    /// Start: bootstrap the wallet, then run the peer group and the fee refresh.
    ///
    /// The bloom filter is built before the first peer connects so every peer
    /// is loaded with it right after the handshake.
    ///
    /// A failed bootstrap keeps the peer group attached so `start` can be
    /// retried. A stopped group cannot be started again.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if self.pending.lock().is_none() {
            return Err(PeerGroupError::NotRunning.into());
        }
        self.set_state(SyncState::Syncing(0.0));
        if let Err(e) = self.initial_syncer.sync().await {
            warn!(error = %e, "initial sync failed");
            self.set_state(SyncState::NotSynced);
            return Err(e);
        }
        self.storage.read(|records| self.bloom_filter_manager.regenerate(records));

        let Some(peer_group) = self.pending.lock().take() else {
            return Err(PeerGroupError::NotRunning.into());
        };
        let mut workers = self.workers.lock();
        workers.peer_group = Some(tokio::spawn(peer_group.run()));
        if let Some(fee_rate_syncer) = &self.fee_rate_syncer {
            workers.fee_rate = Some(fee_rate_syncer.clone().spawn(self.connectivity()));
        }
        Ok(())
    }

    /// Stop: end the peer group loop, waiting at most the shutdown timeout.
    pub async fn stop(&self) {
        self.peer_group.stop();
        let workers = std::mem::take(&mut *self.workers.lock());
        if let Some(fee_rate) = workers.fee_rate {
            fee_rate.abort();
        }
        if let Some(mut peer_group) = workers.peer_group {
            if tokio::time::timeout(self.shutdown_timeout, &mut peer_group).await.is_err() {
                warn!("peer group did not stop in time");
                peer_group.abort();
            }
        }
        self.set_state(SyncState::NotSynced);
    }
}

impl SyncManager {
    fn downloaded_height(&self) -> u32 {
        self.storage
            .read(|records| records.last_downloaded_block().map_or(0, |block| block.height))
    }
}

impl BlockSyncListener for SyncManager {
    fn on_best_block_height_update(&self, downloaded_height: u32, best_height: u32) {
        if best_height == 0 || downloaded_height >= best_height {
            return;
        }
        let progress = (downloaded_height as f64 / best_height as f64).clamp(0.0, 1.0);
        self.set_state(SyncState::Syncing(progress));
    }
}

impl PeerGroupListener for SyncManager {
    fn on_sync_peer_elected(&self, _host: &str, best_height: u32) {
        match self.state() {
            SyncState::Syncing(_) => {}
            SyncState::Synced if self.downloaded_height() >= best_height => {}
            _ => self.set_state(SyncState::Syncing(0.0)),
        }
    }

    fn on_peer_disconnect(&self, _host: &str, _error: Option<&str>) {
        if self.peer_group.connected_peers_count() == 0 {
            self.set_state(SyncState::NotSynced);
        }
    }

    fn on_all_peers_synced(&self, _actions: &mut GroupActions) {
        self.set_state(SyncState::Synced);
    }
}
