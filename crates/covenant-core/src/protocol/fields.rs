//! Composite field types shared across actions.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::bitcoin::{Address, Hash32};

use super::wire::{
    read_address, read_bool, read_hash, read_timestamp, read_u16, read_u32, read_u64, read_u8,
    read_var_bytes, read_var_char, write_address, write_bool, write_hash, write_timestamp,
    write_var_bytes, write_var_char, Timestamp, WireError,
};

/// Plurality vote: the option with the most votes wins.
pub const VOTE_TYPE_PLURALITY: u8 = b'P';
/// Absolute threshold: an option needs `threshold`% of all eligible tokens.
pub const VOTE_TYPE_ABSOLUTE: u8 = b'A';
/// Relative threshold: an option needs `threshold`% of the votes cast.
pub const VOTE_TYPE_RELATIVE: u8 = b'R';

/// A voting system a contract offers for proposals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingSystem {
    /// Display name.
    pub name: String,
    /// Tally method: one of the `VOTE_TYPE_*` codes.
    pub vote_type: u8,
    /// Threshold percentage for threshold methods, 0–100.
    pub threshold_percentage: u8,
    /// Whether asset vote multipliers apply under this system.
    pub vote_multiplier_permitted: bool,
    /// Fee a holder pays to raise a proposal under this system.
    pub holder_proposal_fee: u64,
}

impl VotingSystem {
    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        write_var_char(out, &self.name, 255)?;
        out.put_u8(self.vote_type);
        out.put_u8(self.threshold_percentage);
        write_bool(out, self.vote_multiplier_permitted);
        out.put_u64_le(self.holder_proposal_fee);
        Ok(())
    }

    pub(crate) fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(VotingSystem {
            name: read_var_char(buf, 255)?,
            vote_type: read_u8(buf)?,
            threshold_percentage: read_u8(buf)?,
            vote_multiplier_permitted: read_bool(buf)?,
            holder_proposal_fee: read_u64(buf)?,
        })
    }

    /// Serializes to standalone bytes (amendment element data).
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    /// Deserializes from standalone bytes, requiring full consumption.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let value = Self::read(&mut buf)?;
        if !buf.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(value)
    }

    /// Checks the tally method and threshold are well formed.
    pub fn validate(&self) -> Result<(), WireError> {
        match self.vote_type {
            VOTE_TYPE_PLURALITY => Ok(()),
            VOTE_TYPE_ABSOLUTE | VOTE_TYPE_RELATIVE => {
                if self.threshold_percentage == 0 || self.threshold_percentage > 100 {
                    return Err(WireError::InvalidValue("voting threshold"));
                }
                Ok(())
            }
            _ => Err(WireError::InvalidValue("vote type")),
        }
    }
}

/// An identity oracle registered on a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Oracle {
    /// Display name.
    pub name: String,
    /// Service URL.
    pub url: String,
    /// Compressed secp256k1 public key.
    pub public_key: Vec<u8>,
}

impl Oracle {
    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        write_var_char(out, &self.name, 255)?;
        write_var_char(out, &self.url, 255)?;
        write_var_bytes(out, &self.public_key, 255)
    }

    pub(crate) fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Oracle {
            name: read_var_char(buf, 255)?,
            url: read_var_char(buf, 255)?,
            public_key: read_var_bytes(buf, 255)?,
        })
    }

    /// Serializes to standalone bytes (amendment element data).
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    /// Deserializes from standalone bytes, requiring full consumption.
    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let value = Self::read(&mut buf)?;
        if !buf.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(value)
    }
}

/// Amendment operation: replace the field value.
pub const AMENDMENT_OP_MODIFY: u8 = 0;
/// Amendment operation: append a list element.
pub const AMENDMENT_OP_ADD: u8 = 1;
/// Amendment operation: delete a list element.
pub const AMENDMENT_OP_DELETE: u8 = 2;

/// A single field amendment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amendment {
    /// Index of the amended field in the subject's field enumeration.
    pub field_index: u8,
    /// One of the `AMENDMENT_OP_*` codes.
    pub operation: u8,
    /// List element index for add/modify/delete on list fields.
    pub element: u16,
    /// New serialized field value; empty for deletions.
    pub data: Vec<u8>,
}

impl Amendment {
    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        out.put_u8(self.field_index);
        out.put_u8(self.operation);
        out.put_u16_le(self.element);
        write_var_bytes(out, &self.data, u16::MAX as usize)
    }

    pub(crate) fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        let amendment = Amendment {
            field_index: read_u8(buf)?,
            operation: read_u8(buf)?,
            element: read_u16(buf)?,
            data: read_var_bytes(buf, u16::MAX as usize)?,
        };
        if amendment.operation > AMENDMENT_OP_DELETE {
            return Err(WireError::InvalidValue("amendment operation"));
        }
        Ok(amendment)
    }
}

/// An address paired with a token quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAddress {
    /// The target party.
    pub address: Address,
    /// Token quantity.
    pub quantity: u64,
}

impl TargetAddress {
    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        write_address(out, &self.address)?;
        out.put_u64_le(self.quantity);
        Ok(())
    }

    pub(crate) fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(TargetAddress {
            address: read_address(buf)?,
            quantity: read_u64(buf)?,
        })
    }
}

/// A transaction-relative index paired with a token quantity.
///
/// In requests the index points at a transaction input; in responses it
/// points at an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityIndex {
    /// Input or output index.
    pub index: u16,
    /// Token quantity.
    pub quantity: u64,
}

impl QuantityIndex {
    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.put_u16_le(self.index);
        out.put_u64_le(self.quantity);
    }

    pub(crate) fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(QuantityIndex {
            index: read_u16(buf)?,
            quantity: read_u64(buf)?,
        })
    }
}

/// A sender entry in a transfer: an input index and the quantity it sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSender {
    /// Index of the transfer-tx input holding the sender's signature.
    pub index: u16,
    /// Quantity sent.
    pub quantity: u64,
}

impl TransferSender {
    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.put_u16_le(self.index);
        out.put_u64_le(self.quantity);
    }

    pub(crate) fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(TransferSender {
            index: read_u16(buf)?,
            quantity: read_u64(buf)?,
        })
    }
}

/// A receiver entry in a transfer, optionally carrying an identity-oracle
/// attestation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceiver {
    /// Receiving party.
    pub address: Address,
    /// Quantity received.
    pub quantity: u64,
    /// Index into the contract's oracle list; meaningful only when a
    /// signature is present.
    pub oracle_index: u8,
    /// Signature algorithm; 0 means no attestation.
    pub oracle_sig_algorithm: u8,
    /// DER attestation signature.
    pub oracle_confirmation_sig: Vec<u8>,
    /// Height of the block hash the attestation commits to.
    pub oracle_sig_block_height: u32,
    /// Attestation expiry.
    pub oracle_sig_expiry: Timestamp,
}

impl TransferReceiver {
    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        write_address(out, &self.address)?;
        out.put_u64_le(self.quantity);
        out.put_u8(self.oracle_index);
        out.put_u8(self.oracle_sig_algorithm);
        write_var_bytes(out, &self.oracle_confirmation_sig, 255)?;
        out.put_u32_le(self.oracle_sig_block_height);
        write_timestamp(out, self.oracle_sig_expiry);
        Ok(())
    }

    pub(crate) fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(TransferReceiver {
            address: read_address(buf)?,
            quantity: read_u64(buf)?,
            oracle_index: read_u8(buf)?,
            oracle_sig_algorithm: read_u8(buf)?,
            oracle_confirmation_sig: read_var_bytes(buf, 255)?,
            oracle_sig_block_height: read_u32(buf)?,
            oracle_sig_expiry: read_timestamp(buf)?,
        })
    }

    /// Whether this receiver carries an oracle attestation.
    #[must_use]
    pub fn has_oracle_sig(&self) -> bool {
        self.oracle_sig_algorithm != 0
    }
}

/// One asset's movement within a transfer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetTransfer {
    /// Index of the transfer-tx output paying the authoritative contract.
    pub contract_index: u16,
    /// Asset type code.
    pub asset_type: String,
    /// Asset code; zero is reserved.
    pub asset_code: Hash32,
    /// Ordered senders.
    pub senders: Vec<TransferSender>,
    /// Ordered receivers.
    pub receivers: Vec<TransferReceiver>,
}

impl AssetTransfer {
    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        out.put_u16_le(self.contract_index);
        super::wire::write_fixed_char(out, &self.asset_type, 3)?;
        write_hash(out, &self.asset_code);
        out.put_u8(self.senders.len().try_into().map_err(|_| WireError::TooLong {
            len: self.senders.len(),
            max: 255,
        })?);
        for sender in &self.senders {
            sender.write(out);
        }
        out.put_u8(
            self.receivers
                .len()
                .try_into()
                .map_err(|_| WireError::TooLong {
                    len: self.receivers.len(),
                    max: 255,
                })?,
        );
        for receiver in &self.receivers {
            receiver.write(out)?;
        }
        Ok(())
    }

    pub(crate) fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        let contract_index = read_u16(buf)?;
        let asset_type = super::wire::read_fixed_char(buf, 3)?;
        let asset_code = read_hash(buf)?;
        let sender_count = read_u8(buf)?;
        let mut senders = Vec::with_capacity(sender_count as usize);
        for _ in 0..sender_count {
            senders.push(TransferSender::read(buf)?);
        }
        let receiver_count = read_u8(buf)?;
        let mut receivers = Vec::with_capacity(receiver_count as usize);
        for _ in 0..receiver_count {
            receivers.push(TransferReceiver::read(buf)?);
        }
        Ok(AssetTransfer {
            contract_index,
            asset_type,
            asset_code,
            senders,
            receivers,
        })
    }
}

/// One asset's resulting balances within a settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSettlement {
    /// Index of the settlement-tx input signed by the authoritative
    /// contract.
    pub contract_index: u16,
    /// Asset type code.
    pub asset_type: String,
    /// Asset code.
    pub asset_code: Hash32,
    /// New finalized balances: output index → balance.
    pub settlements: Vec<QuantityIndex>,
}

impl AssetSettlement {
    pub(crate) fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        out.put_u16_le(self.contract_index);
        super::wire::write_fixed_char(out, &self.asset_type, 3)?;
        write_hash(out, &self.asset_code);
        out.put_u16_le(
            self.settlements
                .len()
                .try_into()
                .map_err(|_| WireError::TooLong {
                    len: self.settlements.len(),
                    max: u16::MAX as usize,
                })?,
        );
        for entry in &self.settlements {
            entry.write(out);
        }
        Ok(())
    }

    pub(crate) fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        let contract_index = read_u16(buf)?;
        let asset_type = super::wire::read_fixed_char(buf, 3)?;
        let asset_code = read_hash(buf)?;
        let count = read_u16(buf)?;
        let mut settlements = Vec::with_capacity(count as usize);
        for _ in 0..count {
            settlements.push(QuantityIndex::read(buf)?);
        }
        Ok(AssetSettlement {
            contract_index,
            asset_type,
            asset_code,
            settlements,
        })
    }
}
