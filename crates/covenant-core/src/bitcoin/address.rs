//! Address encoding and locking-script templates.
//!
//! Addresses are a closed sum of the four locking-script templates the agent
//! recognizes: pay-to-public-key-hash, pay-to-script-hash, the experimental
//! multi-PKH accumulator script, and the R-puzzle hash script.
//!
//! Byte form: a one-byte network/type tag followed by type-specific bytes.
//! Text form: Base58 over the byte form plus a 4-byte double-SHA256
//! checksum.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::hash::double_sha256;
use super::script::{
    self, parse_push_data, push_data, push_number, OP_1, OP_1ADD, OP_3, OP_CHECKSIG,
    OP_CHECKSIGVERIFY, OP_DROP, OP_DUP, OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY, OP_FALSE,
    OP_FROMALTSTACK, OP_GREATERTHANOREQUAL, OP_HASH160, OP_IF, OP_NIP, OP_SPLIT, OP_SWAP,
    OP_TOALTSTACK,
};

const HASH_LEN: usize = 20;

const TYPE_MAIN_PKH: u8 = 0x00;
const TYPE_MAIN_SH: u8 = 0x05;
const TYPE_MAIN_MULTI_PKH: u8 = 0x10;
const TYPE_MAIN_RPH: u8 = 0x20;
const TYPE_TEST_PKH: u8 = 0x6f;
const TYPE_TEST_SH: u8 = 0xc4;
const TYPE_TEST_MULTI_PKH: u8 = 0xd0;
const TYPE_TEST_RPH: u8 = 0xe0;

/// Errors from address decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// Address type tag is not one of the defined values.
    #[error("unknown address type")]
    BadType,

    /// A 20-byte hash field has the wrong length.
    #[error("script hash has invalid length")]
    BadHashLength,

    /// Base58 text form failed its checksum.
    #[error("address has bad checksum")]
    BadChecksum,

    /// The locking script does not match a known template.
    #[error("unknown script template")]
    UnknownScriptTemplate,
}

/// Network an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Production chain.
    Main,
    /// Any test chain.
    Test,
}

/// The four locking-script templates expressed as address data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum AddressKind {
    /// Pay to public key hash.
    Pkh([u8; HASH_LEN]),
    /// Pay to script hash.
    Sh([u8; HASH_LEN]),
    /// Accumulator multi-PKH: `required` of the listed key hashes must sign.
    MultiPkh {
        required: u16,
        hashes: Vec<[u8; HASH_LEN]>,
    },
    /// R-puzzle hash.
    Rph([u8; HASH_LEN]),
}

/// An on-chain address: a script template plus the network it lives on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    net: Network,
    kind: AddressKind,
}

// Ord/Hash need Network to participate; it has no natural order so map
// through the tag byte.
impl PartialOrd for Network {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Network {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl std::hash::Hash for Network {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (*self as u8).hash(state);
    }
}

impl Address {
    /// Creates a pay-to-public-key-hash address.
    pub fn pkh(hash: [u8; HASH_LEN], net: Network) -> Self {
        Address {
            net,
            kind: AddressKind::Pkh(hash),
        }
    }

    /// Creates a pay-to-script-hash address.
    pub fn sh(hash: [u8; HASH_LEN], net: Network) -> Self {
        Address {
            net,
            kind: AddressKind::Sh(hash),
        }
    }

    /// Creates a multi-PKH address.
    pub fn multi_pkh(required: u16, hashes: Vec<[u8; HASH_LEN]>, net: Network) -> Self {
        Address {
            net,
            kind: AddressKind::MultiPkh { required, hashes },
        }
    }

    /// Creates an R-puzzle-hash address.
    pub fn rph(hash: [u8; HASH_LEN], net: Network) -> Self {
        Address {
            net,
            kind: AddressKind::Rph(hash),
        }
    }

    /// The network this address belongs to.
    #[must_use]
    pub const fn network(&self) -> Network {
        self.net
    }

    /// Returns the public key hash when this is a PKH address.
    #[must_use]
    pub fn pkh_bytes(&self) -> Option<&[u8; HASH_LEN]> {
        match &self.kind {
            AddressKind::Pkh(h) => Some(h),
            _ => None,
        }
    }

    fn type_byte(&self) -> u8 {
        match (&self.kind, self.net) {
            (AddressKind::Pkh(_), Network::Main) => TYPE_MAIN_PKH,
            (AddressKind::Sh(_), Network::Main) => TYPE_MAIN_SH,
            (AddressKind::MultiPkh { .. }, Network::Main) => TYPE_MAIN_MULTI_PKH,
            (AddressKind::Rph(_), Network::Main) => TYPE_MAIN_RPH,
            (AddressKind::Pkh(_), Network::Test) => TYPE_TEST_PKH,
            (AddressKind::Sh(_), Network::Test) => TYPE_TEST_SH,
            (AddressKind::MultiPkh { .. }, Network::Test) => TYPE_TEST_MULTI_PKH,
            (AddressKind::Rph(_), Network::Test) => TYPE_TEST_RPH,
        }
    }

    /// Serializes to the type-tagged byte form used for persistence and
    /// transport.
    ///
    /// Multi-PKH carries an explicit hash count so the form is usable
    /// mid-stream, not only where the total length is known.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.type_byte()];
        match &self.kind {
            AddressKind::Pkh(h) | AddressKind::Sh(h) | AddressKind::Rph(h) => {
                out.extend_from_slice(h);
            }
            AddressKind::MultiPkh { required, hashes } => {
                out.extend_from_slice(&required.to_le_bytes());
                out.extend_from_slice(&(hashes.len() as u16).to_le_bytes());
                for h in hashes {
                    out.extend_from_slice(h);
                }
            }
        }
        out
    }

    /// Decodes the type-tagged byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddressError> {
        let (&tag, body) = bytes.split_first().ok_or(AddressError::BadType)?;

        let (net, multi) = match tag {
            TYPE_MAIN_PKH | TYPE_MAIN_SH | TYPE_MAIN_RPH => (Network::Main, false),
            TYPE_MAIN_MULTI_PKH => (Network::Main, true),
            TYPE_TEST_PKH | TYPE_TEST_SH | TYPE_TEST_RPH => (Network::Test, false),
            TYPE_TEST_MULTI_PKH => (Network::Test, true),
            _ => return Err(AddressError::BadType),
        };

        if multi {
            if body.len() < 4 {
                return Err(AddressError::BadHashLength);
            }
            let required = u16::from_le_bytes([body[0], body[1]]);
            let count = u16::from_le_bytes([body[2], body[3]]) as usize;
            let rest = &body[4..];
            if rest.len() != count * HASH_LEN {
                return Err(AddressError::BadHashLength);
            }
            let hashes = rest
                .chunks_exact(HASH_LEN)
                .map(|c| c.try_into().expect("chunk length fixed"))
                .collect();
            return Ok(Address {
                net,
                kind: AddressKind::MultiPkh { required, hashes },
            });
        }

        let hash: [u8; HASH_LEN] = body.try_into().map_err(|_| AddressError::BadHashLength)?;
        let kind = match tag {
            TYPE_MAIN_PKH | TYPE_TEST_PKH => AddressKind::Pkh(hash),
            TYPE_MAIN_SH | TYPE_TEST_SH => AddressKind::Sh(hash),
            _ => AddressKind::Rph(hash),
        };
        Ok(Address { net, kind })
    }

    /// Encodes the Base58Check text form.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut data = self.to_bytes();
        let checksum = double_sha256(&data);
        data.extend_from_slice(&checksum[..4]);
        bs58::encode(data).into_string()
    }

    /// Decodes the Base58Check text form.
    pub fn decode(text: &str) -> Result<Self, AddressError> {
        let data = bs58::decode(text)
            .into_vec()
            .map_err(|_| AddressError::BadChecksum)?;
        if data.len() < 5 {
            return Err(AddressError::BadChecksum);
        }
        let (payload, checksum) = data.split_at(data.len() - 4);
        if double_sha256(payload)[..4] != *checksum {
            return Err(AddressError::BadChecksum);
        }
        Self::from_bytes(payload)
    }

    /// Builds the locking script paying to this address.
    #[must_use]
    pub fn locking_script(&self) -> Vec<u8> {
        match &self.kind {
            AddressKind::Pkh(h) => {
                let mut out = vec![OP_DUP, OP_HASH160];
                out.extend(push_data(HASH_LEN));
                out.extend_from_slice(h);
                out.push(OP_EQUALVERIFY);
                out.push(OP_CHECKSIG);
                out
            }
            AddressKind::Sh(h) => {
                let mut out = vec![OP_HASH160];
                out.extend(push_data(HASH_LEN));
                out.extend_from_slice(h);
                out.push(OP_EQUAL);
                out
            }
            AddressKind::MultiPkh { required, hashes } => {
                // Accumulator script: count valid signatures on the alt
                // stack, then require the accumulated count to reach
                // `required`.
                let mut out = vec![OP_FALSE, OP_TOALTSTACK];
                for h in hashes {
                    out.push(OP_IF);
                    out.push(OP_DUP);
                    out.push(OP_HASH160);
                    out.extend(push_data(HASH_LEN));
                    out.extend_from_slice(h);
                    out.push(OP_EQUALVERIFY);
                    out.push(OP_CHECKSIGVERIFY);
                    out.push(OP_FROMALTSTACK);
                    out.push(OP_1ADD);
                    out.push(OP_TOALTSTACK);
                    out.push(OP_ENDIF);
                }
                out.push(OP_FROMALTSTACK);
                out.extend(push_number(i64::from(*required)));
                out.push(OP_GREATERTHANOREQUAL);
                out
            }
            AddressKind::Rph(h) => {
                let mut out = vec![
                    OP_DUP,
                    OP_3,
                    OP_SPLIT,
                    OP_NIP,
                    OP_1,
                    OP_SPLIT,
                    OP_SWAP,
                    OP_SPLIT,
                    OP_DROP,
                    OP_HASH160,
                ];
                out.extend(push_data(HASH_LEN));
                out.extend_from_slice(h);
                out.push(OP_EQUALVERIFY);
                out.push(OP_CHECKSIG);
                out
            }
        }
    }

    /// Classifies a locking script into an address.
    ///
    /// Returns [`AddressError::UnknownScriptTemplate`] for anything that is
    /// not one of the four templates (data outputs included).
    pub fn from_locking_script(script: &[u8], net: Network) -> Result<Self, AddressError> {
        // P2PKH: OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
        if script.len() == 25
            && script[0] == OP_DUP
            && script[1] == OP_HASH160
            && script[2] == HASH_LEN as u8
            && script[23] == OP_EQUALVERIFY
            && script[24] == OP_CHECKSIG
        {
            let hash: [u8; HASH_LEN] = script[3..23].try_into().expect("length checked");
            return Ok(Address::pkh(hash, net));
        }

        // P2SH: OP_HASH160 <20> OP_EQUAL
        if script.len() == 23
            && script[0] == OP_HASH160
            && script[1] == HASH_LEN as u8
            && script[22] == OP_EQUAL
        {
            let hash: [u8; HASH_LEN] = script[2..22].try_into().expect("length checked");
            return Ok(Address::sh(hash, net));
        }

        // RPH: fixed 10-opcode prefix, hash, OP_EQUALVERIFY OP_CHECKSIG
        const RPH_PREFIX: [u8; 10] = [
            OP_DUP, OP_3, OP_SPLIT, OP_NIP, OP_1, OP_SPLIT, OP_SWAP, OP_SPLIT, OP_DROP, OP_HASH160,
        ];
        if script.len() == 33
            && script[..10] == RPH_PREFIX
            && script[10] == HASH_LEN as u8
            && script[31] == OP_EQUALVERIFY
            && script[32] == OP_CHECKSIG
        {
            let hash: [u8; HASH_LEN] = script[11..31].try_into().expect("length checked");
            return Ok(Address::rph(hash, net));
        }

        // Multi-PKH accumulator.
        if script.len() > 2 && script[0] == OP_FALSE && script[1] == OP_TOALTSTACK {
            return Self::multi_pkh_from_script(&script[2..], net);
        }

        Err(AddressError::UnknownScriptTemplate)
    }

    fn multi_pkh_from_script(mut rest: &[u8], net: Network) -> Result<Self, AddressError> {
        let mut hashes: Vec<[u8; HASH_LEN]> = Vec::new();

        while rest.first() == Some(&OP_IF) {
            if rest.len() < 4 + HASH_LEN + 6 || rest[1] != OP_DUP || rest[2] != OP_HASH160 {
                return Err(AddressError::UnknownScriptTemplate);
            }
            if rest[3] != HASH_LEN as u8 {
                return Err(AddressError::UnknownScriptTemplate);
            }
            let hash: [u8; HASH_LEN] = rest[4..4 + HASH_LEN].try_into().expect("length checked");
            let tail = &rest[4 + HASH_LEN..];
            const BLOCK_TAIL: [u8; 6] = [
                OP_EQUALVERIFY,
                OP_CHECKSIGVERIFY,
                OP_FROMALTSTACK,
                OP_1ADD,
                OP_TOALTSTACK,
                OP_ENDIF,
            ];
            if tail.len() < 6 || tail[..6] != BLOCK_TAIL {
                return Err(AddressError::UnknownScriptTemplate);
            }
            hashes.push(hash);
            rest = &tail[6..];
        }

        if hashes.is_empty() || rest.first() != Some(&OP_FROMALTSTACK) {
            return Err(AddressError::UnknownScriptTemplate);
        }
        rest = &rest[1..];

        // The required count is a number push followed by the comparison.
        if rest.last() != Some(&OP_GREATERTHANOREQUAL) {
            return Err(AddressError::UnknownScriptTemplate);
        }
        let number = &rest[..rest.len() - 1];
        let required = parse_script_number(number)?;

        Ok(Address::multi_pkh(required, hashes, net))
    }
}

fn parse_script_number(encoded: &[u8]) -> Result<u16, AddressError> {
    let first = *encoded.first().ok_or(AddressError::UnknownScriptTemplate)?;
    if first == OP_FALSE && encoded.len() == 1 {
        return Ok(0);
    }
    if (0x51..=0x60).contains(&first) && encoded.len() == 1 {
        return Ok(u16::from(first - 0x50));
    }
    let len = first as usize;
    if len == 0 || len > 2 || encoded.len() != len + 1 {
        return Err(AddressError::UnknownScriptTemplate);
    }
    let mut value: u16 = 0;
    for (i, b) in encoded[1..].iter().enumerate() {
        value |= u16::from(*b) << (8 * i);
    }
    Ok(value)
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Address::decode(&text).map_err(D::Error::custom)
    }
}

// Keep the script module's error type reachable for callers matching on
// template failures during input resolution.
impl From<script::ScriptError> for AddressError {
    fn from(_: script::ScriptError) -> Self {
        AddressError::UnknownScriptTemplate
    }
}
