//! Address formats and the converter chain
//!
//! Converters are tried in order; the first one that accepts the input wins.
//! Base58Check is always present and always last.

use crate::error::AddressError;
use crate::params::{AddressEncoding, NetworkParams};
use crate::script;
use crate::types::{ByteString, ScriptType};
use bech32::{Fe32, Hrp};
use std::fmt;

type Result<T> = std::result::Result<T, AddressError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub script_type: ScriptType,
    /// Key hash, script hash or witness program
    pub hash: ByteString,
    pub string: String,
}

impl Address {
    pub fn locking_script(&self) -> Result<ByteString> {
        script::locking_script(self.script_type, &self.hash)
            .ok_or_else(|| AddressError::UnsupportedScriptType(self.script_type.to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string)
    }
}

pub trait AddressConverter: Send + Sync {
    /// Parse a textual address.
    fn convert_string(&self, address: &str) -> Result<Address>;

    /// Render `hash` of the given script type as an address.
    fn convert(&self, hash: &[u8], script_type: ScriptType) -> Result<Address>;
}

/// Legacy version-byte prefixed addresses.
pub struct Base58AddressConverter {
    address_version: u8,
    script_version: u8,
}

impl Base58AddressConverter {
    pub fn new(address_version: u8, script_version: u8) -> Self {
        Base58AddressConverter {
            address_version,
            script_version,
        }
    }
}

impl AddressConverter for Base58AddressConverter {
    fn convert_string(&self, address: &str) -> Result<Address> {
        let data = bs58::decode(address).with_check(None).into_vec().map_err(|e| match e {
            bs58::decode::Error::InvalidChecksum { .. } => AddressError::BadChecksum,
            other => AddressError::UnknownFormat(other.to_string()),
        })?;
        if data.len() != 21 {
            return Err(AddressError::InvalidPayload(format!("{} bytes", data.len())));
        }
        let script_type = match data[0] {
            version if version == self.address_version => ScriptType::P2PKH,
            version if version == self.script_version => ScriptType::P2SH,
            version => return Err(AddressError::WrongPrefix(version.to_string())),
        };
        Ok(Address {
            script_type,
            hash: data[1..].to_vec(),
            string: address.to_string(),
        })
    }

    fn convert(&self, hash: &[u8], script_type: ScriptType) -> Result<Address> {
        let version = match script_type {
            ScriptType::P2PKH | ScriptType::P2PK => self.address_version,
            ScriptType::P2SH | ScriptType::P2WPKHSH => self.script_version,
            other => return Err(AddressError::UnsupportedScriptType(other.to_string())),
        };
        let mut payload = vec![version];
        payload.extend_from_slice(hash);
        Ok(Address {
            script_type,
            hash: hash.to_vec(),
            string: bs58::encode(payload).with_check().into_string(),
        })
    }
}

/// Bech32 version 0 witness programs.
pub struct SegwitAddressConverter {
    hrp: Hrp,
}

impl SegwitAddressConverter {
    pub fn new(hrp: &str) -> Result<Self> {
        let hrp = Hrp::parse(hrp).map_err(|e| AddressError::WrongPrefix(e.to_string()))?;
        Ok(SegwitAddressConverter { hrp })
    }
}

impl AddressConverter for SegwitAddressConverter {
    fn convert_string(&self, address: &str) -> Result<Address> {
        let (hrp, version, program) =
            bech32::segwit::decode(address).map_err(|e| AddressError::UnknownFormat(e.to_string()))?;
        if hrp != self.hrp {
            return Err(AddressError::WrongPrefix(hrp.to_string()));
        }
        if version != Fe32::Q {
            return Err(AddressError::UnsupportedScriptType(format!("witness version {}", version.to_u8())));
        }
        let script_type = match program.len() {
            20 => ScriptType::P2WPKH,
            32 => ScriptType::P2WSH,
            len => return Err(AddressError::InvalidPayload(format!("{} byte program", len))),
        };
        Ok(Address {
            script_type,
            hash: program,
            string: address.to_string(),
        })
    }

    fn convert(&self, hash: &[u8], script_type: ScriptType) -> Result<Address> {
        if !matches!(script_type, ScriptType::P2WPKH | ScriptType::P2WSH) {
            return Err(AddressError::UnsupportedScriptType(script_type.to_string()));
        }
        let string = bech32::segwit::encode(self.hrp, Fe32::Q, hash)
            .map_err(|e| AddressError::InvalidPayload(e.to_string()))?;
        Ok(Address {
            script_type,
            hash: hash.to_vec(),
            string,
        })
    }
}

const CASH_CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

fn cash_polymod(values: &[u8]) -> u64 {
    const GENERATORS: [u64; 5] = [0x98f2bc8e61, 0x79b76d99e2, 0xf33e5fb3c4, 0xae2eabe2a8, 0x1e4f43e470];
    let mut checksum: u64 = 1;
    for value in values {
        let top = checksum >> 35;
        checksum = ((checksum & 0x07ffffffff) << 5) ^ *value as u64;
        for (bit, generator) in GENERATORS.iter().enumerate() {
            if (top >> bit) & 1 == 1 {
                checksum ^= generator;
            }
        }
    }
    checksum ^ 1
}

/// Regroup bits; `pad` fills a partial trailing group with zeros.
fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Option<Vec<u8>> {
    let mut accumulator: u32 = 0;
    let mut bits = 0;
    let max = (1u32 << to) - 1;
    let mut result = Vec::new();
    for value in data {
        if (*value as u32) >> from != 0 {
            return None;
        }
        accumulator = (accumulator << from) | *value as u32;
        bits += from;
        while bits >= to {
            bits -= to;
            result.push(((accumulator >> bits) & max) as u8);
        }
    }
    if pad {
        if bits > 0 {
            result.push(((accumulator << (to - bits)) & max) as u8);
        }
    } else if bits >= from || ((accumulator << (to - bits)) & max) != 0 {
        return None;
    }
    Some(result)
}

/// Bitcoin Cash "prefix:payload" addresses.
pub struct CashAddressConverter {
    prefix: String,
}

impl CashAddressConverter {
    pub fn new(prefix: &str) -> Self {
        CashAddressConverter {
            prefix: prefix.to_lowercase(),
        }
    }

    fn checksum_input(&self, payload: &[u8]) -> Vec<u8> {
        let mut values: Vec<u8> = self.prefix.bytes().map(|b| b & 0x1f).collect();
        values.push(0);
        values.extend_from_slice(payload);
        values
    }
}

impl AddressConverter for CashAddressConverter {
    fn convert_string(&self, address: &str) -> Result<Address> {
        let lower = address.to_lowercase();
        if lower != address && address.to_uppercase() != address {
            return Err(AddressError::UnknownFormat("mixed case".into()));
        }
        let body = match lower.split_once(':') {
            Some((prefix, body)) if prefix == self.prefix => body,
            Some((prefix, _)) => return Err(AddressError::WrongPrefix(prefix.to_string())),
            None => lower.as_str(),
        };
        let values = body
            .bytes()
            .map(|c| CASH_CHARSET.iter().position(|x| *x == c).map(|p| p as u8))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| AddressError::UnknownFormat(address.to_string()))?;
        if values.len() < 8 {
            return Err(AddressError::UnknownFormat(address.to_string()));
        }
        if cash_polymod(&self.checksum_input(&values)) != 0 {
            return Err(AddressError::BadChecksum);
        }
        let data = convert_bits(&values[..values.len() - 8], 5, 8, false)
            .ok_or_else(|| AddressError::InvalidPayload("bad padding".into()))?;
        let (version, hash) = data
            .split_first()
            .ok_or_else(|| AddressError::InvalidPayload("empty".into()))?;
        let script_type = match version >> 3 {
            0 => ScriptType::P2PKH,
            1 => ScriptType::P2SH,
            other => return Err(AddressError::UnsupportedScriptType(format!("cash address type {}", other))),
        };
        if hash.len() != 20 {
            return Err(AddressError::InvalidPayload(format!("{} byte hash", hash.len())));
        }
        Ok(Address {
            script_type,
            hash: hash.to_vec(),
            string: format!("{}:{}", self.prefix, body),
        })
    }

    fn convert(&self, hash: &[u8], script_type: ScriptType) -> Result<Address> {
        let type_bits = match script_type {
            ScriptType::P2PKH | ScriptType::P2PK => 0u8,
            ScriptType::P2SH => 1,
            other => return Err(AddressError::UnsupportedScriptType(other.to_string())),
        };
        if hash.len() != 20 {
            return Err(AddressError::InvalidPayload(format!("{} byte hash", hash.len())));
        }
        let mut data = vec![type_bits << 3];
        data.extend_from_slice(hash);
        let mut payload = convert_bits(&data, 8, 5, true)
            .ok_or_else(|| AddressError::InvalidPayload("cannot regroup".into()))?;

        let mut checked = self.checksum_input(&payload);
        checked.extend_from_slice(&[0; 8]);
        let checksum = cash_polymod(&checked);
        payload.extend((0..8).map(|i| ((checksum >> (5 * (7 - i))) & 0x1f) as u8));

        let body: String = payload.iter().map(|v| CASH_CHARSET[*v as usize] as char).collect();
        Ok(Address {
            script_type,
            hash: hash.to_vec(),
            string: format!("{}:{}", self.prefix, body),
        })
    }
}

/// Ordered converters for a network.
pub struct AddressConverterChain {
    converters: Vec<Box<dyn AddressConverter>>,
}

impl AddressConverterChain {
    pub fn new(converters: Vec<Box<dyn AddressConverter>>) -> Self {
        AddressConverterChain { converters }
    }

    /// Network-specific format first, Base58Check last.
    pub fn for_network(params: &NetworkParams) -> Result<Self> {
        let mut converters: Vec<Box<dyn AddressConverter>> = Vec::new();
        match params.address_encoding {
            AddressEncoding::Bech32 => converters.push(Box::new(SegwitAddressConverter::new(params.address_hrp)?)),
            AddressEncoding::CashAddress => converters.push(Box::new(CashAddressConverter::new(params.address_hrp))),
            AddressEncoding::None => {}
        }
        converters.push(Box::new(Base58AddressConverter::new(
            params.address_version,
            params.script_version,
        )));
        Ok(AddressConverterChain { converters })
    }

    pub fn convert_string(&self, address: &str) -> Result<Address> {
        let mut last_error = AddressError::UnknownFormat(address.to_string());
        for converter in &self.converters {
            match converter.convert_string(address) {
                Ok(parsed) => return Ok(parsed),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    pub fn convert(&self, hash: &[u8], script_type: ScriptType) -> Result<Address> {
        let mut last_error = AddressError::UnsupportedScriptType(script_type.to_string());
        for converter in &self.converters {
            match converter.convert(hash, script_type) {
                Ok(address) => return Ok(address),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::NetworkKind;

    #[test]
    fn test_base58_mainnet_p2pkh() {
        let converter = Base58AddressConverter::new(0, 5);
        let hash = hex::decode("62e907b15cbf27d5425399ebf6f0fb50ebb88f18").unwrap();
        let address = converter.convert(&hash, ScriptType::P2PKH).unwrap();
        assert_eq!(address.string, "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa");
        assert_eq!(converter.convert_string(&address.string).unwrap(), address);
    }

    #[test]
    fn test_base58_rejects_bad_checksum_and_prefix() {
        let converter = Base58AddressConverter::new(0, 5);
        assert_eq!(
            converter.convert_string("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNb"),
            Err(AddressError::BadChecksum)
        );
        let testnet = Base58AddressConverter::new(111, 196);
        assert!(matches!(
            testnet.convert_string("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"),
            Err(AddressError::WrongPrefix(_))
        ));
    }

    #[test]
    fn test_segwit_p2wpkh() {
        let converter = SegwitAddressConverter::new("bc").unwrap();
        let program = hex::decode("751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
        let address = converter.convert(&program, ScriptType::P2WPKH).unwrap();
        assert_eq!(address.string, "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");
        let parsed = converter.convert_string("BC1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4").unwrap();
        assert_eq!(parsed.hash, program);
        assert_eq!(parsed.script_type, ScriptType::P2WPKH);
    }

    #[test]
    fn test_cash_address() {
        let converter = CashAddressConverter::new("bitcoincash");
        let hash = hex::decode("76a04053bda0a88bda5177b86a15c3b29f559873").unwrap();
        let address = converter.convert(&hash, ScriptType::P2PKH).unwrap();
        assert_eq!(address.string, "bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a");
        assert_eq!(converter.convert_string(&address.string).unwrap(), address);
        assert_eq!(
            converter.convert_string("qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a").unwrap().hash,
            hash
        );
        assert_eq!(
            converter.convert_string("bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6q"),
            Err(AddressError::BadChecksum)
        );
        // 'b' is outside the cash-address alphabet
        assert!(matches!(
            converter.convert_string("bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6b"),
            Err(AddressError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_chain_tries_network_format_first() {
        let chain = AddressConverterChain::for_network(&NetworkParams::for_network(NetworkKind::MainNet)).unwrap();
        let hash = [3u8; 20];
        assert!(chain.convert(&hash, ScriptType::P2WPKH).unwrap().string.starts_with("bc1"));
        assert!(chain.convert(&hash, ScriptType::P2PKH).unwrap().string.starts_with('1'));
        assert_eq!(
            chain.convert_string("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa").unwrap().script_type,
            ScriptType::P2PKH
        );
        assert!(chain.convert_string("nonsense").is_err());
    }
}
