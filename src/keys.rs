//! Hierarchical deterministic keys (BIP32) laid out as BIP44 accounts

use crate::error::SigningError;
use crate::types::PublicKey;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use secp256k1::{All, Scalar, Secp256k1, SecretKey};
use sha2::Sha512;
use std::collections::HashMap;

type HmacSha512 = Hmac<Sha512>;

pub const HARDENED: u32 = 0x8000_0000;

/// Source of wallet keys. Public keys are created at `(account, external, index)`;
/// private keys are looked up by the path stored on a `PublicKey`.
pub trait KeyProvider: Send + Sync {
    fn public_key(&self, account: u32, index: u32, external: bool) -> Result<PublicKey, SigningError>;
    fn private_key(&self, path: &str) -> Result<SecretKey, SigningError>;
}

#[derive(Clone)]
struct ExtendedKey {
    secret: SecretKey,
    chain_code: [u8; 32],
}

impl ExtendedKey {
    fn from_hmac(key: &[u8], data: &[u8]) -> Result<([u8; 32], [u8; 32]), SigningError> {
        let mut mac = HmacSha512::new_from_slice(key).map_err(|e| SigningError::KeyDerivation(e.to_string()))?;
        mac.update(data);
        let output = mac.finalize().into_bytes();
        let mut left = [0u8; 32];
        let mut right = [0u8; 32];
        left.copy_from_slice(&output[..32]);
        right.copy_from_slice(&output[32..]);
        Ok((left, right))
    }

    fn master(seed: &[u8]) -> Result<Self, SigningError> {
        let (left, chain_code) = Self::from_hmac(b"Bitcoin seed", seed)?;
        let secret = SecretKey::from_slice(&left).map_err(|e| SigningError::KeyDerivation(e.to_string()))?;
        Ok(ExtendedKey { secret, chain_code })
    }

    /// CKDpriv: (k, c) × i → (k', c')
    fn child(&self, secp: &Secp256k1<All>, index: u32) -> Result<Self, SigningError> {
        let mut data = Vec::with_capacity(37);
        if index >= HARDENED {
            data.push(0);
            data.extend_from_slice(&self.secret.secret_bytes());
        } else {
            data.extend_from_slice(&self.secret.public_key(secp).serialize());
        }
        data.extend_from_slice(&index.to_be_bytes());

        let (left, chain_code) = Self::from_hmac(&self.chain_code, &data)?;
        let tweak = Scalar::from_be_bytes(left).map_err(|e| SigningError::KeyDerivation(e.to_string()))?;
        let secret = self
            .secret
            .add_tweak(&tweak)
            .map_err(|e| SigningError::KeyDerivation(e.to_string()))?;
        Ok(ExtendedKey { secret, chain_code })
    }
}

/// BIP32 wallet deriving `m/44'/coin'/account'/branch/index`.
pub struct HdWallet {
    secp: Secp256k1<All>,
    master: ExtendedKey,
    coin_type: u32,
    branches: Mutex<HashMap<(u32, bool), ExtendedKey>>,
}

impl HdWallet {
    pub fn new(seed: &[u8], coin_type: u32) -> Result<Self, SigningError> {
        Ok(HdWallet {
            secp: Secp256k1::new(),
            master: ExtendedKey::master(seed)?,
            coin_type,
            branches: Mutex::new(HashMap::new()),
        })
    }

    fn derive(&self, path: &[u32]) -> Result<ExtendedKey, SigningError> {
        path.iter()
            .try_fold(self.master.clone(), |key, index| key.child(&self.secp, *index))
    }

    fn branch(&self, account: u32, external: bool) -> Result<ExtendedKey, SigningError> {
        if let Some(branch) = self.branches.lock().get(&(account, external)) {
            return Ok(branch.clone());
        }
        let branch = self.derive(&[
            44 | HARDENED,
            self.coin_type | HARDENED,
            account | HARDENED,
            if external { 0 } else { 1 },
        ])?;
        self.branches.lock().insert((account, external), branch.clone());
        Ok(branch)
    }

    fn key_at(&self, account: u32, external: bool, index: u32) -> Result<SecretKey, SigningError> {
        Ok(self.branch(account, external)?.child(&self.secp, index)?.secret)
    }

    /// Compressed public key at an arbitrary BIP32 path.
    pub fn public_key_at_path(&self, path: &[u32]) -> Result<[u8; 33], SigningError> {
        Ok(self.derive(path)?.secret.public_key(&self.secp).serialize())
    }
}

fn parse_path(path: &str) -> Result<(u32, bool, u32), SigningError> {
    let parts: Vec<u32> = path
        .split('/')
        .map(|part| part.parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|_| SigningError::KeyDerivation(format!("bad path {}", path)))?;
    match parts.as_slice() {
        [account, 0, index] => Ok((*account, true, *index)),
        [account, 1, index] => Ok((*account, false, *index)),
        _ => Err(SigningError::KeyDerivation(format!("bad path {}", path))),
    }
}

impl KeyProvider for HdWallet {
    fn public_key(&self, account: u32, index: u32, external: bool) -> Result<PublicKey, SigningError> {
        let secret = self.key_at(account, external, index)?;
        let public = secret.public_key(&self.secp).serialize().to_vec();
        Ok(PublicKey::new(account, external, index, public))
    }

    fn private_key(&self, path: &str) -> Result<SecretKey, SigningError> {
        let (account, external, index) = parse_path(path)?;
        self.key_at(account, external, index)
    }
}
