//! Bitcoin-family primitives.
//!
//! Everything the agent needs to read and produce transactions on a
//! Bitcoin-family chain: hashing, address encoding, locking-script
//! templates, raw transaction serialization, key handling, and the BIP143
//! signature-hash algorithm with its per-transaction cache.

mod address;
mod hash;
mod keys;
mod script;
mod sighash;
mod tx;

pub use address::{Address, AddressError, Network};
pub use hash::{double_sha256, hash160, Hash20, Hash32};
pub use keys::{KeyError, PrivateKey, PublicKey, Signature};
pub use script::{
    data_output_payload, is_data_output, parse_push_data, push_data, push_number, ScriptError,
    MAX_SINGLE_BYTE_PUSH, OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_FALSE, OP_HASH160,
    OP_PUSHDATA1, OP_PUSHDATA2, OP_PUSHDATA4, OP_RETURN,
};

pub use script::{
    OP_1, OP_1ADD, OP_3, OP_CHECKSIGVERIFY, OP_DROP, OP_ENDIF, OP_FROMALTSTACK,
    OP_GREATERTHANOREQUAL, OP_IF, OP_NIP, OP_SPLIT, OP_SWAP, OP_TOALTSTACK,
};
pub use sighash::{signature_hash, SigHashCache, SigHashType};
pub use tx::{OutPoint, Transaction, TxError, TxInput, TxOutput};
