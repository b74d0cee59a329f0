//! BIP37 bloom filters and the manager that keeps peers' copies current

use crate::constants::*;
use crate::storage::WalletRecords;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

const LN2: f64 = std::f64::consts::LN_2;
const HASH_SEED_MULTIPLIER: u32 = 0xfba4c795;

/// MurmurHash3 (x86, 32-bit) as used by BIP37.
pub fn murmur3(seed: u32, data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    let mut k1 = 0u32;
    if tail.len() >= 3 {
        k1 ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 ^= tail[0] as u32;
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85ebca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2ae35);
    h1 ^= h1 >> 16;
    h1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// NewBloomFilter: elements × falsePositiveRate → BloomFilter
    ///
    /// 1. size = -n·ln(p) / ln²2 bits, capped at MAX_BLOOM_FILTER_SIZE bytes
    /// 2. hashFuncs = size·8/n · ln2, capped at MAX_BLOOM_HASH_FUNCS
    pub fn new(elements: usize, false_positive_rate: f64, tweak: u32, flags: u8) -> Self {
        let elements = elements.max(1) as f64;
        let size = (-1.0 / (LN2 * LN2) * elements * false_positive_rate.ln() / 8.0)
            .clamp(1.0, MAX_BLOOM_FILTER_SIZE as f64) as usize;
        let hash_funcs = ((size * 8) as f64 / elements * LN2).clamp(1.0, MAX_BLOOM_HASH_FUNCS as f64) as u32;
        BloomFilter {
            data: vec![0; size],
            hash_funcs,
            tweak,
            flags,
        }
    }

    pub fn from_parts(data: Vec<u8>, hash_funcs: u32, tweak: u32, flags: u8) -> Self {
        BloomFilter {
            data,
            hash_funcs,
            tweak,
            flags,
        }
    }

    fn bit_index(&self, function: u32, element: &[u8]) -> usize {
        let seed = function.wrapping_mul(HASH_SEED_MULTIPLIER).wrapping_add(self.tweak);
        murmur3(seed, element) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, element: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for function in 0..self.hash_funcs {
            let index = self.bit_index(function, element);
            self.data[index >> 3] |= 1 << (index & 7);
        }
    }

    pub fn contains(&self, element: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|function| {
            let index = self.bit_index(function, element);
            self.data[index >> 3] & (1 << (index & 7)) != 0
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn hash_funcs(&self) -> u32 {
        self.hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }
}

/// Everything the wallet wants peers to match: every key form and every unspent outpoint.
pub fn watched_elements(records: &WalletRecords) -> Vec<Vec<u8>> {
    let mut elements = Vec::new();
    for key in records.public_keys() {
        elements.push(key.public_key_hash.clone());
        elements.push(key.public_key.clone());
        elements.push(key.script_hash_p2wpkh.clone());
    }
    for unspent in records.unspent_outputs() {
        let mut outpoint = unspent.transaction_hash.to_vec();
        outpoint.extend_from_slice(&unspent.output.index.to_le_bytes());
        elements.push(outpoint);
    }
    elements
}

/// Rebuilds the filter from wallet state and publishes it to subscribers (the peer group).
pub struct BloomFilterManager {
    tweak: u32,
    sender: watch::Sender<Option<BloomFilter>>,
    element_count: Mutex<usize>,
}

impl BloomFilterManager {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        BloomFilterManager {
            tweak: rand::random(),
            sender,
            element_count: Mutex::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BloomFilter>> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> Option<BloomFilter> {
        self.sender.borrow().clone()
    }

    pub fn element_count(&self) -> usize {
        *self.element_count.lock()
    }

    /// Regenerate: WalletRecords → BloomFilter
    ///
    /// 1. Collect watched elements
    /// 2. Build a fresh filter sized for them
    /// 3. Publish it; every subscriber reloads
    pub fn regenerate(&self, records: &WalletRecords) -> BloomFilter {
        let elements = watched_elements(records);
        let mut filter = BloomFilter::new(elements.len(), BLOOM_FALSE_POSITIVE_RATE, self.tweak, BLOOM_UPDATE_ALL);
        for element in &elements {
            filter.insert(element);
        }
        *self.element_count.lock() = elements.len();
        debug!(elements = elements.len(), size = filter.data().len(), "bloom filter regenerated");
        self.sender.send_replace(Some(filter.clone()));
        filter
    }
}

impl Default for BloomFilterManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PublicKey;

    #[test]
    fn test_murmur3_vectors() {
        assert_eq!(murmur3(0, b""), 0);
        assert_eq!(murmur3(0xfba4c795, b""), 0x6a396f08);
        assert_eq!(murmur3(0, &[0x00]), 0x514e28b7);
        assert_eq!(murmur3(0xfba4c795, &[0x00]), 0xea3f0b17);
        assert_eq!(murmur3(0, &[0x21, 0x43, 0x65, 0x87]), 0xf55b516b);
    }

    #[test]
    fn test_filter_contains_inserted_elements() {
        let mut filter = BloomFilter::new(3, 0.01, 0, BLOOM_UPDATE_ALL);
        let present = hex::decode("99108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap();
        filter.insert(&present);
        assert!(filter.contains(&present));
        assert!(!filter.contains(&hex::decode("19108ad8ed9bb6274d3980bab5a85c048f0950c8").unwrap()));
    }

    #[test]
    fn test_filter_size_is_capped() {
        let filter = BloomFilter::new(10_000_000, 0.0001, 0, 0);
        assert_eq!(filter.data().len(), MAX_BLOOM_FILTER_SIZE);
        assert!(filter.hash_funcs() <= MAX_BLOOM_HASH_FUNCS);
    }

    #[test]
    fn test_manager_publishes_regenerated_filter() {
        let manager = BloomFilterManager::new();
        let mut receiver = manager.subscribe();
        assert!(receiver.borrow().is_none());

        let mut records = WalletRecords::default();
        let key = PublicKey::new(0, true, 0, vec![2; 33]);
        records.add_public_keys(vec![key.clone()]);
        let filter = manager.regenerate(&records);

        assert!(receiver.has_changed().unwrap());
        let published = receiver.borrow_and_update().clone().unwrap();
        assert_eq!(published, filter);
        assert!(published.contains(&key.public_key_hash));
        assert!(published.contains(&key.script_hash_p2wpkh));
        assert_eq!(manager.element_count(), 3);
    }
}
