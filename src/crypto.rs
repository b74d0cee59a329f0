//! Hashing helpers and the pluggable header hash function

use crate::types::Hash;
use bitcoin_hashes::{sha256d, Hash as BitcoinHash};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    hash
}

pub fn double_sha256(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let digest = Ripemd160::digest(sha);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&digest);
    hash
}

/// Header hash function chosen per network.
///
/// Bitcoin and its forks use double SHA-256; Dash uses X11, which is
/// supplied by the embedding application.
#[derive(Clone)]
pub struct HeaderHasher {
    name: &'static str,
    func: Arc<dyn Fn(&[u8]) -> Hash + Send + Sync>,
}

impl HeaderHasher {
    pub fn double_sha256() -> Self {
        HeaderHasher {
            name: "sha256d",
            func: Arc::new(double_sha256),
        }
    }

    pub fn custom(name: &'static str, func: impl Fn(&[u8]) -> Hash + Send + Sync + 'static) -> Self {
        HeaderHasher {
            name,
            func: Arc::new(func),
        }
    }

    pub fn hash(&self, data: &[u8]) -> Hash {
        (self.func)(data)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for HeaderHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderHasher").field("name", &self.name).finish()
    }
}
