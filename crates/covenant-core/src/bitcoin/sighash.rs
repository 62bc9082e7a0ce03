//! BIP143 signature hashing with a per-transaction cache.
//!
//! Signatures cover the value of the spent output in addition to the
//! transaction body, and the FORKID bit is mandatory for every spend
//! signature on this chain.
//!
//! The cache memoizes the three aggregate digests (previous outputs,
//! sequences, outputs) so signing N inputs of one transaction costs O(N)
//! instead of O(N²). Clear the cache if the transaction changes.

use bytes::BufMut;

use super::hash::double_sha256;
use super::tx::{put_compact_size, Transaction};

/// Hash-type bits trailing a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigHashType(pub u32);

impl SigHashType {
    /// Sign all inputs and outputs.
    pub const ALL: SigHashType = SigHashType(0x01);
    /// Sign no outputs.
    pub const NONE: SigHashType = SigHashType(0x02);
    /// Sign the output matching the input index.
    pub const SINGLE: SigHashType = SigHashType(0x03);
    /// Sign only this input.
    pub const ANYONE_CAN_PAY: SigHashType = SigHashType(0x80);
    /// Replay-protection bit, mandatory on this chain.
    pub const FORK_ID: SigHashType = SigHashType(0x40);

    const MASK: u32 = 0x1f;

    /// Combines hash-type bits.
    #[must_use]
    pub const fn with(self, other: SigHashType) -> SigHashType {
        SigHashType(self.0 | other.0)
    }

    const fn base(self) -> u32 {
        self.0 & Self::MASK
    }

    const fn anyone_can_pay(self) -> bool {
        self.0 & Self::ANYONE_CAN_PAY.0 != 0
    }
}

/// Memoized aggregate digests reused across the inputs of one transaction.
#[derive(Debug, Default)]
pub struct SigHashCache {
    hash_prev_outs: Option<[u8; 32]>,
    hash_sequence: Option<[u8; 32]>,
    hash_outputs: Option<[u8; 32]>,
}

impl SigHashCache {
    /// A fresh, empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets all memoized digests. Required after any change to the
    /// transaction being signed.
    pub fn clear(&mut self) {
        self.hash_prev_outs = None;
        self.hash_sequence = None;
        self.hash_outputs = None;
    }

    /// Digest of all previous outpoints.
    pub fn hash_prev_outs(&mut self, tx: &Transaction) -> [u8; 32] {
        if let Some(hash) = self.hash_prev_outs {
            return hash;
        }
        let mut data = Vec::with_capacity(tx.inputs.len() * 36);
        for input in &tx.inputs {
            data.put_slice(input.previous_output.txid.as_bytes());
            data.put_u32_le(input.previous_output.index);
        }
        let hash = double_sha256(&data);
        self.hash_prev_outs = Some(hash);
        hash
    }

    /// Digest of all input sequence numbers.
    pub fn hash_sequence(&mut self, tx: &Transaction) -> [u8; 32] {
        if let Some(hash) = self.hash_sequence {
            return hash;
        }
        let mut data = Vec::with_capacity(tx.inputs.len() * 4);
        for input in &tx.inputs {
            data.put_u32_le(input.sequence);
        }
        let hash = double_sha256(&data);
        self.hash_sequence = Some(hash);
        hash
    }

    /// Digest of all outputs in wire form.
    pub fn hash_outputs(&mut self, tx: &Transaction) -> [u8; 32] {
        if let Some(hash) = self.hash_outputs {
            return hash;
        }
        let mut data = Vec::new();
        for output in &tx.outputs {
            output.serialize_into(&mut data);
        }
        let hash = double_sha256(&data);
        self.hash_outputs = Some(hash);
        hash
    }
}

/// Computes the BIP143 digest for signing `tx.inputs[index]`.
///
/// `lock_script` and `value` describe the output being spent. The FORKID
/// bit is forced on regardless of the bits in `hash_type`. Returns `None`
/// if `index` is out of range.
#[must_use]
pub fn signature_hash(
    tx: &Transaction,
    index: usize,
    lock_script: &[u8],
    value: u64,
    hash_type: SigHashType,
    cache: &mut SigHashCache,
) -> Option<[u8; 32]> {
    let input = tx.inputs.get(index)?;
    let zero = [0u8; 32];

    let mut data = Vec::with_capacity(160 + lock_script.len());
    data.put_u32_le(tx.version);

    if hash_type.anyone_can_pay() {
        data.put_slice(&zero);
    } else {
        data.put_slice(&cache.hash_prev_outs(tx));
    }

    if !hash_type.anyone_can_pay()
        && hash_type.base() != SigHashType::SINGLE.0
        && hash_type.base() != SigHashType::NONE.0
    {
        data.put_slice(&cache.hash_sequence(tx));
    } else {
        data.put_slice(&zero);
    }

    data.put_slice(input.previous_output.txid.as_bytes());
    data.put_u32_le(input.previous_output.index);

    put_compact_size(&mut data, lock_script.len() as u64);
    data.put_slice(lock_script);

    data.put_u64_le(value);
    data.put_u32_le(input.sequence);

    if hash_type.base() != SigHashType::SINGLE.0 && hash_type.base() != SigHashType::NONE.0 {
        data.put_slice(&cache.hash_outputs(tx));
    } else if hash_type.base() == SigHashType::SINGLE.0 && index < tx.outputs.len() {
        let mut single = Vec::new();
        tx.outputs[index].serialize_into(&mut single);
        data.put_slice(&double_sha256(&single));
    } else {
        data.put_slice(&zero);
    }

    data.put_u32_le(tx.lock_time);
    data.put_u32_le(hash_type.with(SigHashType::FORK_ID).0);

    Some(double_sha256(&data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::hash::Hash32;
    use crate::bitcoin::tx::{OutPoint, TxInput, TxOutput};

    fn two_input_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![
                TxInput::new(OutPoint {
                    txid: Hash32::hash(b"a"),
                    index: 0,
                }),
                TxInput::new(OutPoint {
                    txid: Hash32::hash(b"b"),
                    index: 3,
                }),
            ],
            outputs: vec![TxOutput {
                value: 1000,
                lock_script: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn digest_is_deterministic_and_cache_neutral() {
        let tx = two_input_tx();
        let lock = vec![0x76, 0xa9];

        let mut cache = SigHashCache::new();
        let first =
            signature_hash(&tx, 0, &lock, 500, SigHashType::ALL, &mut cache).unwrap();

        // Reusing the cache for input 1 and recomputing with a fresh cache
        // must agree.
        let cached =
            signature_hash(&tx, 1, &lock, 700, SigHashType::ALL, &mut cache).unwrap();
        let mut fresh = SigHashCache::new();
        let uncached =
            signature_hash(&tx, 1, &lock, 700, SigHashType::ALL, &mut fresh).unwrap();
        assert_eq!(cached, uncached);
        assert_ne!(first, cached);
    }

    #[test]
    fn fork_id_always_applied() {
        let tx = two_input_tx();
        let mut a = SigHashCache::new();
        let mut b = SigHashCache::new();
        let with = signature_hash(
            &tx,
            0,
            &[],
            1,
            SigHashType::ALL.with(SigHashType::FORK_ID),
            &mut a,
        )
        .unwrap();
        let without = signature_hash(&tx, 0, &[], 1, SigHashType::ALL, &mut b).unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn value_binds_into_digest() {
        let tx = two_input_tx();
        let mut cache = SigHashCache::new();
        let one = signature_hash(&tx, 0, &[], 1, SigHashType::ALL, &mut cache).unwrap();
        cache.clear();
        let two = signature_hash(&tx, 0, &[], 2, SigHashType::ALL, &mut cache).unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn out_of_range_index() {
        let tx = two_input_tx();
        let mut cache = SigHashCache::new();
        assert!(signature_hash(&tx, 5, &[], 1, SigHashType::ALL, &mut cache).is_none());
    }
}
