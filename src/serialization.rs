//! Little-endian wire encoding: integers, varints, headers and transactions

use crate::crypto::HeaderHasher;
use crate::error::ProtocolError;
use crate::types::*;

type Result<T> = std::result::Result<T, ProtocolError>;

/// Cursor over a received payload.
pub struct Decoder<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Decoder { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::UnexpectedEof);
        }
        let slice = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16_be(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> Result<Hash> {
        self.read_array()
    }

    pub fn read_var_int(&mut self) -> Result<u64> {
        match self.read_u8()? {
            0xfd => Ok(self.read_u16()? as u64),
            0xfe => Ok(self.read_u32()? as u64),
            0xff => self.read_u64(),
            value => Ok(value as u64),
        }
    }

    /// Varint count bounded by `max` so a hostile length cannot force a huge allocation.
    pub fn read_count(&mut self, max: usize) -> Result<usize> {
        let count = self.read_var_int()?;
        if count > max as u64 {
            return Err(ProtocolError::Malformed(format!("count {} exceeds {}", count, max)));
        }
        Ok(count as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_count(self.remaining())?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_var_string(&mut self) -> Result<String> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn read_header(&mut self, hasher: &HeaderHasher) -> Result<Header> {
        let version = self.read_i32()?;
        let prev_block_hash = self.read_hash()?;
        let merkle_root = self.read_hash()?;
        let timestamp = self.read_u32()?;
        let bits = self.read_u32()?;
        let nonce = self.read_u32()?;
        Ok(Header::new(version, prev_block_hash, merkle_root, timestamp, bits, nonce, hasher))
    }

    /// Read a transaction, segwit-aware. `special_payload` enables the
    /// typed-transaction payload that follows lock time on Dash.
    pub fn read_transaction(&mut self, special_payload: bool) -> Result<Transaction> {
        let version = self.read_i32()?;

        let mut input_count = self.read_var_int()?;
        let mut segwit = false;
        if input_count == 0 {
            let flag = self.read_u8()?;
            if flag != 1 {
                return Err(ProtocolError::Malformed(format!("bad segwit flag {}", flag)));
            }
            segwit = true;
            input_count = self.read_var_int()?;
        }
        if input_count > self.remaining() as u64 {
            return Err(ProtocolError::Malformed("input count exceeds payload".into()));
        }

        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let hash = self.read_hash()?;
            let index = self.read_u32()?;
            let signature_script = self.read_var_bytes()?;
            let sequence = self.read_u32()?;
            inputs.push(TransactionInput::new(OutPoint { hash, index }, signature_script, sequence));
        }

        let output_count = self.read_count(self.remaining())?;
        let mut outputs = Vec::with_capacity(output_count);
        for index in 0..output_count {
            let value = self.read_u64()?;
            let locking_script = self.read_var_bytes()?;
            outputs.push(TransactionOutput::new(value, locking_script, index as u32));
        }

        if segwit {
            for input in inputs.iter_mut() {
                let items = self.read_count(self.remaining())?;
                for _ in 0..items {
                    input.witness.push(self.read_var_bytes()?);
                }
            }
        }

        let lock_time = self.read_u32()?;

        let mut transaction = Transaction::new(version, inputs, outputs, lock_time);
        if special_payload && is_special_version(version) {
            transaction.extra_payload = Some(self.read_var_bytes()?);
            transaction.update_hash();
        }
        Ok(transaction)
    }
}

/// Dash typed transaction: version 3 with a non-zero type in the high half.
fn is_special_version(version: i32) -> bool {
    let version = version as u32;
    (version & 0xffff) >= 3 && (version >> 16) != 0
}

/// Growable output buffer.
#[derive(Default)]
pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder { buffer: Vec::new() }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(bytes);
        self
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.push(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u16_be(&mut self, value: u16) -> &mut Self {
        self.write_bytes(&value.to_be_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_var_int(&mut self, value: u64) -> &mut Self {
        match value {
            0..=0xfc => self.write_u8(value as u8),
            0xfd..=0xffff => self.write_u8(0xfd).write_u16(value as u16),
            0x10000..=0xffff_ffff => self.write_u8(0xfe).write_u32(value as u32),
            _ => self.write_u8(0xff).write_u64(value),
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_var_int(bytes.len() as u64).write_bytes(bytes)
    }

    pub fn write_var_string(&mut self, value: &str) -> &mut Self {
        self.write_var_bytes(value.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

pub fn var_int_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// SerializeTransaction: Transaction × bool → bytes
///
/// 1. version
/// 2. segwit marker and flag when `with_witness` and any input carries witness data
/// 3. inputs, outputs
/// 4. witness stacks
/// 5. lock time, then the special payload if present
pub fn serialize_transaction(transaction: &Transaction, with_witness: bool) -> Vec<u8> {
    let witness = with_witness && transaction.inputs.iter().any(|input| !input.witness.is_empty());
    let mut encoder = Encoder::new();
    encoder.write_i32(transaction.version);
    if witness {
        encoder.write_u8(0).write_u8(1);
    }
    encoder.write_var_int(transaction.inputs.len() as u64);
    for input in &transaction.inputs {
        encoder
            .write_bytes(&input.previous_output.hash)
            .write_u32(input.previous_output.index)
            .write_var_bytes(&input.signature_script)
            .write_u32(input.sequence);
    }
    encoder.write_var_int(transaction.outputs.len() as u64);
    for output in &transaction.outputs {
        encoder.write_u64(output.value).write_var_bytes(&output.locking_script);
    }
    if witness {
        for input in &transaction.inputs {
            encoder.write_var_int(input.witness.len() as u64);
            for item in &input.witness {
                encoder.write_var_bytes(item);
            }
        }
    }
    encoder.write_u32(transaction.lock_time);
    if let Some(payload) = &transaction.extra_payload {
        encoder.write_var_bytes(payload);
    }
    encoder.into_inner()
}

pub fn deserialize_transaction(bytes: &[u8], special_payload: bool) -> Result<Transaction> {
    let mut decoder = Decoder::new(bytes);
    let transaction = decoder.read_transaction(special_payload)?;
    if !decoder.is_empty() {
        return Err(ProtocolError::Malformed(format!("{} trailing bytes", decoder.remaining())));
    }
    Ok(transaction)
}
