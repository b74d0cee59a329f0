//! Registry of live peers and their sync flags

use crate::error::PeerGroupError;
use crate::peer::PeerHandle;

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub host: String,
    pub handle: PeerHandle,
    /// Handshake finished
    pub connected: bool,
    /// Headers and merkle blocks both caught up with this peer
    pub synced: bool,
    /// Headers caught up; merkle blocks may still be outstanding
    pub blocks_synced: bool,
    pub best_height: u32,
    pub pending_tasks: usize,
}

impl PeerInfo {
    pub fn new(handle: PeerHandle) -> Self {
        PeerInfo {
            host: handle.host().to_string(),
            handle,
            connected: false,
            synced: false,
            blocks_synced: false,
            best_height: 0,
            pending_tasks: 0,
        }
    }

    pub fn ready(&self) -> bool {
        self.connected && self.pending_tasks == 0
    }
}

#[derive(Debug, Default)]
pub struct PeerManager {
    peers: Vec<PeerInfo>,
    sync_peer: Option<String>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: PeerInfo) {
        self.peers.push(peer);
    }

    /// Drop a peer; forgets the sync peer when it was this one.
    pub fn remove(&mut self, host: &str) -> Option<PeerInfo> {
        let position = self.peers.iter().position(|peer| peer.host == host)?;
        if self.is_sync_peer(host) {
            self.sync_peer = None;
        }
        Some(self.peers.remove(position))
    }

    pub fn get(&self, host: &str) -> Option<&PeerInfo> {
        self.peers.iter().find(|peer| peer.host == host)
    }

    pub fn get_mut(&mut self, host: &str) -> Option<&mut PeerInfo> {
        self.peers.iter_mut().find(|peer| peer.host == host)
    }

    pub fn peers_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected(&self) -> Vec<&PeerInfo> {
        self.peers.iter().filter(|peer| peer.connected).collect()
    }

    pub fn some_ready_peers(&self) -> Vec<&PeerInfo> {
        self.peers.iter().filter(|peer| peer.ready()).collect()
    }

    pub fn has_ready_peer(&self) -> bool {
        self.peers.iter().any(PeerInfo::ready)
    }

    /// First connected peer we have not finished syncing with.
    pub fn non_synced_peer(&self) -> Option<&PeerInfo> {
        self.peers.iter().find(|peer| peer.connected && !peer.synced)
    }

    pub fn sync_peer(&self) -> Option<&PeerInfo> {
        self.sync_peer.as_deref().and_then(|host| self.get(host))
    }

    pub fn set_sync_peer(&mut self, host: Option<String>) {
        self.sync_peer = host;
    }

    pub fn is_sync_peer(&self, host: &str) -> bool {
        self.sync_peer.as_deref() == Some(host)
    }

    /// At least half of all known peers are connected and synced.
    pub fn is_half_synced(&self) -> bool {
        let synced = self.peers.iter().filter(|peer| peer.connected && peer.synced).count();
        synced > 0 && synced >= self.peers.len() / 2
    }

    pub fn disconnect_all(&mut self) {
        for peer in &self.peers {
            peer.handle.close();
        }
    }

    /// Broadcast precondition: a connected peer exists and every connected peer is synced.
    pub fn check_peers_synced(&self) -> Result<(), PeerGroupError> {
        if self.connected().is_empty() {
            return Err(PeerGroupError::NoConnectedPeers);
        }
        if self.non_synced_peer().is_some() {
            return Err(PeerGroupError::PeersNotSynced);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerCommand;
    use tokio::sync::mpsc;

    fn peer(host: &str) -> (PeerInfo, mpsc::UnboundedReceiver<PeerCommand>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (PeerInfo::new(PeerHandle::new(host, sender)), receiver)
    }

    fn connected(host: &str, synced: bool) -> PeerInfo {
        let (mut info, _) = peer(host);
        info.connected = true;
        info.synced = synced;
        info
    }

    #[test]
    fn test_add_and_remove() {
        let mut manager = PeerManager::new();
        manager.add(connected("a", false));
        manager.add(connected("b", false));
        manager.set_sync_peer(Some("a".into()));
        assert_eq!(manager.peers_count(), 2);

        assert!(manager.remove("a").is_some());
        assert!(manager.remove("a").is_none());
        assert_eq!(manager.peers_count(), 1);
        assert!(manager.sync_peer().is_none());
    }

    #[test]
    fn test_disconnect_all_closes_every_peer() {
        let mut manager = PeerManager::new();
        let (first, mut first_rx) = peer("a");
        let (second, mut second_rx) = peer("b");
        manager.add(first);
        manager.add(second);
        manager.disconnect_all();
        assert!(matches!(first_rx.try_recv(), Ok(PeerCommand::Close)));
        assert!(matches!(second_rx.try_recv(), Ok(PeerCommand::Close)));
    }

    #[test]
    fn test_some_ready_peers() {
        let mut manager = PeerManager::new();
        let mut busy = connected("busy", false);
        busy.pending_tasks = 1;
        let (not_connected, _) = peer("new");
        manager.add(busy);
        manager.add(not_connected);
        manager.add(connected("idle", false));

        let ready: Vec<&str> = manager.some_ready_peers().iter().map(|peer| peer.host.as_str()).collect();
        assert_eq!(ready, vec!["idle"]);
        assert!(manager.has_ready_peer());
    }

    #[test]
    fn test_connected_and_non_synced() {
        let mut manager = PeerManager::new();
        let (pending, _) = peer("pending");
        manager.add(pending);
        manager.add(connected("synced", true));
        manager.add(connected("behind", false));

        assert_eq!(manager.connected().len(), 2);
        assert_eq!(manager.non_synced_peer().map(|peer| peer.host.as_str()), Some("behind"));
    }

    #[test]
    fn test_half_synced() {
        let mut manager = PeerManager::new();
        manager.add(connected("a", true));
        manager.add(connected("b", false));
        manager.add(connected("c", false));
        manager.add(connected("d", false));
        manager.add(connected("e", false));
        assert!(!manager.is_half_synced());

        manager.get_mut("b").unwrap().synced = true;
        assert!(manager.is_half_synced());
    }

    #[test]
    fn test_one_lagging_peer_blocks_broadcast() {
        let mut manager = PeerManager::new();
        manager.add(connected("a", true));
        manager.add(connected("b", false));
        assert_eq!(manager.check_peers_synced(), Err(PeerGroupError::PeersNotSynced));

        manager.get_mut("b").unwrap().synced = true;
        assert_eq!(manager.check_peers_synced(), Ok(()));

        let (pending, _) = peer("handshaking");
        manager.add(pending);
        assert_eq!(manager.check_peers_synced(), Ok(()));
    }

    #[test]
    fn test_no_connected_peers() {
        let mut manager = PeerManager::new();
        let (pending, _) = peer("pending");
        manager.add(pending);
        assert_eq!(manager.check_peers_synced(), Err(PeerGroupError::NoConnectedPeers));
    }
}
