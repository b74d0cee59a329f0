//! Candidate host pool fed by DNS seeds and addr gossip
//!
//! Hosts are persisted with a score and a retry backoff. Hosts handed out for
//! a connection attempt stay reserved until marked success or failure.

use crate::constants::{PEER_BACKOFF_BASE_SECS, PEER_BACKOFF_MAX_SECS};
use crate::error::StorageError;
use crate::storage::Storage;
use crate::types::{unix_time, PeerAddress};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PeerAddressManager {
    storage: Arc<Storage>,
    dns_seeds: Vec<String>,
    port: u16,
    in_use: Mutex<HashSet<String>>,
    resolving: AtomicBool,
}

impl PeerAddressManager {
    pub fn new(storage: Arc<Storage>, dns_seeds: Vec<String>, port: u16) -> Self {
        PeerAddressManager {
            storage,
            dns_seeds,
            port,
            in_use: Mutex::new(HashSet::new()),
            resolving: AtomicBool::new(false),
        }
    }

    fn save(&self, f: impl FnOnce(&mut crate::storage::WalletRecords)) {
        let result = self.storage.with_transaction(|records| {
            f(records);
            Ok::<_, StorageError>(())
        });
        if let Err(e) = result {
            warn!(error = %e, "failed to persist peer address pool");
        }
    }

    /// GetIp: best-scored host that is not reserved and not backing off.
    pub fn get_ip(&self) -> Option<String> {
        self.get_ip_at(unix_time())
    }

    pub fn get_ip_at(&self, now: u64) -> Option<String> {
        let mut in_use = self.in_use.lock();
        let ip = self.storage.read(|records| {
            records
                .peer_addresses()
                .filter(|address| address.backoff_until <= now && !in_use.contains(&address.ip))
                .max_by_key(|address| address.score)
                .map(|address| address.ip.clone())
        })?;
        in_use.insert(ip.clone());
        Some(ip)
    }

    /// Add hosts not already in the pool.
    pub fn add_ips(&self, ips: Vec<String>) {
        let new_ips: Vec<String> = self.storage.read(|records| {
            let mut seen = HashSet::new();
            ips.into_iter()
                .filter(|ip| records.peer_address(ip).is_none() && seen.insert(ip.clone()))
                .collect()
        });
        if new_ips.is_empty() {
            return;
        }
        debug!(count = new_ips.len(), "peer addresses added");
        self.save(|records| {
            for ip in new_ips {
                records.save_peer_address(PeerAddress::new(ip));
            }
        });
    }

    /// Clean disconnect: raise the score and clear any backoff.
    pub fn mark_success(&self, ip: &str) {
        self.in_use.lock().remove(ip);
        let Some(mut address) = self.storage.read(|records| records.peer_address(ip).cloned()) else {
            return;
        };
        address.score += 1;
        address.failures = 0;
        address.backoff_until = 0;
        self.save(|records| records.save_peer_address(address));
    }

    pub fn mark_failed(&self, ip: &str) {
        self.mark_failed_at(ip, unix_time());
    }

    /// Failed connection: lower the score and back off exponentially.
    pub fn mark_failed_at(&self, ip: &str, now: u64) {
        self.in_use.lock().remove(ip);
        let Some(mut address) = self.storage.read(|records| records.peer_address(ip).cloned()) else {
            return;
        };
        address.failures += 1;
        address.score -= 1;
        let backoff = PEER_BACKOFF_BASE_SECS
            .saturating_mul(1u64 << (address.failures - 1).min(16))
            .min(PEER_BACKOFF_MAX_SECS);
        address.backoff_until = now + backoff;
        debug!(peer = %ip, failures = address.failures, backoff, "peer backing off");
        self.save(|records| records.save_peer_address(address));
    }

    /// Resolve every DNS seed and add the results. Concurrent calls are dropped.
    pub async fn resolve_seeds(&self) -> usize {
        if self.resolving.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let mut ips = Vec::new();
        for seed in &self.dns_seeds {
            match tokio::net::lookup_host((seed.as_str(), self.port)).await {
                Ok(addresses) => ips.extend(addresses.map(|address| address.ip().to_string())),
                Err(e) => warn!(seed = %seed, error = %e, "dns seed lookup failed"),
            }
        }
        let count = ips.len();
        info!(count, "dns seeds resolved");
        self.add_ips(ips);
        self.resolving.store(false, Ordering::SeqCst);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PeerAddressManager {
        PeerAddressManager::new(Arc::new(Storage::in_memory("peers")), vec![], 8333)
    }

    #[test]
    fn test_hosts_are_reserved_until_released() {
        let manager = manager();
        manager.add_ips(vec!["1.1.1.1".into(), "2.2.2.2".into(), "1.1.1.1".into()]);
        let first = manager.get_ip_at(0).unwrap();
        let second = manager.get_ip_at(0).unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.get_ip_at(0), None);

        manager.mark_success(&first);
        assert_eq!(manager.get_ip_at(0), Some(first));
    }

    #[test]
    fn test_failed_host_backs_off() {
        let manager = manager();
        manager.add_ips(vec!["3.3.3.3".into()]);
        let ip = manager.get_ip_at(100).unwrap();
        manager.mark_failed_at(&ip, 100);
        assert_eq!(manager.get_ip_at(100 + PEER_BACKOFF_BASE_SECS - 1), None);
        assert_eq!(manager.get_ip_at(100 + PEER_BACKOFF_BASE_SECS), Some(ip.clone()));

        manager.mark_failed_at(&ip, 200);
        assert_eq!(manager.get_ip_at(200 + PEER_BACKOFF_BASE_SECS), None);
        assert_eq!(manager.get_ip_at(200 + 2 * PEER_BACKOFF_BASE_SECS), Some(ip));
    }

    #[test]
    fn test_successful_hosts_preferred() {
        let manager = manager();
        manager.add_ips(vec!["4.4.4.4".into(), "5.5.5.5".into()]);
        let a = manager.get_ip_at(0).unwrap();
        let b = manager.get_ip_at(0).unwrap();
        manager.mark_success(&b);
        manager.mark_failed_at(&a, 0);
        assert_eq!(manager.get_ip_at(10_000), Some(b));
    }
}
