//! Raw transaction types and their deterministic wire serialization.
//!
//! The encoding is the standard Bitcoin format: little-endian integers,
//! compact-size counts, and scripts as length-prefixed byte strings. The
//! transaction id is the double SHA-256 of the serialization.
//!
//! Decoding enforces bounded reads: every length is validated against the
//! remaining buffer before allocation.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hash::Hash32;

/// Largest script length accepted when decoding. Anything above this is a
/// malformed or hostile transaction.
const MAX_SCRIPT_LEN: usize = 1 << 22;

/// Largest input/output count accepted when decoding.
const MAX_ITEM_COUNT: u64 = 1 << 20;

/// Errors from transaction decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    /// Buffer ended before the structure was complete.
    #[error("transaction truncated")]
    Truncated,

    /// A count or length exceeds sane bounds.
    #[error("transaction field too large: {0}")]
    TooLarge(u64),
}

/// A reference to a previous transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// The transaction being spent.
    pub txid: Hash32,
    /// The output index within that transaction.
    pub index: u32,
}

/// A transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// The output being spent.
    pub previous_output: OutPoint,
    /// The unlocking script.
    pub sig_script: Vec<u8>,
    /// Sequence number.
    pub sequence: u32,
}

impl TxInput {
    /// An input spending `outpoint` with an empty unlocking script and
    /// final sequence.
    #[must_use]
    pub fn new(outpoint: OutPoint) -> Self {
        TxInput {
            previous_output: outpoint,
            sig_script: Vec::new(),
            sequence: 0xffff_ffff,
        }
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: u64,
    /// The locking script.
    pub lock_script: Vec<u8>,
}

impl TxOutput {
    /// Serializes this output alone (used by BIP143 hashing).
    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.put_u64_le(self.value);
        put_compact_size(out, self.lock_script.len() as u64);
        out.put_slice(&self.lock_script);
    }
}

/// A raw transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Format version.
    pub version: u32,
    /// Inputs.
    pub inputs: Vec<TxInput>,
    /// Outputs.
    pub outputs: Vec<TxOutput>,
    /// Lock time.
    pub lock_time: u32,
}

impl Transaction {
    /// A new version-1 transaction with no inputs or outputs.
    #[must_use]
    pub fn new() -> Self {
        Transaction {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        }
    }

    /// The transaction id: double SHA-256 of the serialization.
    #[must_use]
    pub fn txid(&self) -> Hash32 {
        Hash32::hash(&self.serialize())
    }

    /// Serializes to the wire format.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.estimated_size());
        out.put_u32_le(self.version);

        put_compact_size(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.put_slice(input.previous_output.txid.as_bytes());
            out.put_u32_le(input.previous_output.index);
            put_compact_size(&mut out, input.sig_script.len() as u64);
            out.put_slice(&input.sig_script);
            out.put_u32_le(input.sequence);
        }

        put_compact_size(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            output.serialize_into(&mut out);
        }

        out.put_u32_le(self.lock_time);
        out
    }

    /// Decodes from the wire format, consuming exactly one transaction from
    /// the front of `buf`.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, TxError> {
        let version = get_u32_le(buf)?;

        let input_count = get_compact_size(buf)?;
        if input_count > MAX_ITEM_COUNT {
            return Err(TxError::TooLarge(input_count));
        }
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let txid = get_hash(buf)?;
            let index = get_u32_le(buf)?;
            let sig_script = get_var_bytes(buf)?;
            let sequence = get_u32_le(buf)?;
            inputs.push(TxInput {
                previous_output: OutPoint { txid, index },
                sig_script,
                sequence,
            });
        }

        let output_count = get_compact_size(buf)?;
        if output_count > MAX_ITEM_COUNT {
            return Err(TxError::TooLarge(output_count));
        }
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let value = get_u64_le(buf)?;
            let lock_script = get_var_bytes(buf)?;
            outputs.push(TxOutput { value, lock_script });
        }

        let lock_time = get_u32_le(buf)?;

        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Decodes a transaction that must span the whole buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TxError> {
        let mut cursor = bytes;
        let tx = Self::deserialize(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(TxError::TooLarge(cursor.len() as u64));
        }
        Ok(tx)
    }

    /// Rough serialized size for fee estimation and buffer sizing.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        let inputs: usize = self
            .inputs
            .iter()
            .map(|i| 40 + 5 + i.sig_script.len().max(107))
            .sum();
        let outputs: usize = self.outputs.iter().map(|o| 13 + o.lock_script.len()).sum();
        10 + inputs + outputs
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a Bitcoin compact-size count.
pub(crate) fn put_compact_size(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.put_u8(value as u8);
    } else if value <= u64::from(u16::MAX) {
        out.put_u8(0xfd);
        out.put_u16_le(value as u16);
    } else if value <= u64::from(u32::MAX) {
        out.put_u8(0xfe);
        out.put_u32_le(value as u32);
    } else {
        out.put_u8(0xff);
        out.put_u64_le(value);
    }
}

fn get_compact_size(buf: &mut &[u8]) -> Result<u64, TxError> {
    if buf.is_empty() {
        return Err(TxError::Truncated);
    }
    let first = buf.get_u8();
    Ok(match first {
        0xfd => u64::from(get_u16_le(buf)?),
        0xfe => u64::from(get_u32_le(buf)?),
        0xff => get_u64_le(buf)?,
        direct => u64::from(direct),
    })
}

fn get_u16_le(buf: &mut &[u8]) -> Result<u16, TxError> {
    if buf.len() < 2 {
        return Err(TxError::Truncated);
    }
    Ok(buf.get_u16_le())
}

fn get_u32_le(buf: &mut &[u8]) -> Result<u32, TxError> {
    if buf.len() < 4 {
        return Err(TxError::Truncated);
    }
    Ok(buf.get_u32_le())
}

fn get_u64_le(buf: &mut &[u8]) -> Result<u64, TxError> {
    if buf.len() < 8 {
        return Err(TxError::Truncated);
    }
    Ok(buf.get_u64_le())
}

fn get_hash(buf: &mut &[u8]) -> Result<Hash32, TxError> {
    if buf.len() < 32 {
        return Err(TxError::Truncated);
    }
    let mut bytes = [0u8; 32];
    buf.copy_to_slice(&mut bytes);
    Ok(Hash32(bytes))
}

fn get_var_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, TxError> {
    let len = get_compact_size(buf)?;
    if len as usize > MAX_SCRIPT_LEN {
        return Err(TxError::TooLarge(len));
    }
    if buf.len() < len as usize {
        return Err(TxError::Truncated);
    }
    let mut bytes = vec![0u8; len as usize];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}
