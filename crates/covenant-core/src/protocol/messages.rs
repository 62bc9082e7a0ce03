//! Payloads carried inside the `M01` Message action.
//!
//! The message code selects the payload shape. Codes below 1000 are
//! user-facing; codes from 1000 are agent-to-agent plumbing used by the
//! multi-contract transfer protocol.

use serde::{Deserialize, Serialize};

use crate::bitcoin::Hash32;

use super::fields::TargetAddress;
use super::wire::{
    read_hash, read_timestamp, read_u8, read_var_bytes, read_var_char, write_hash, write_timestamp,
    write_var_bytes, write_var_char, Timestamp, WireError,
};

/// Public plain-text message.
pub const MSG_CODE_PUBLIC: u16 = 2;
/// Private encrypted message.
pub const MSG_CODE_PRIVATE: u16 = 3;
/// Off-chain offer wrapper.
pub const MSG_CODE_OFFER: u16 = 1001;
/// Request for signatures over an embedded transaction.
pub const MSG_CODE_SIGNATURE_REQUEST: u16 = 1002;
/// Settlement-request hop in a multi-contract transfer.
pub const MSG_CODE_SETTLEMENT_REQUEST: u16 = 1003;

/// Public plain-text message payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublicMessage {
    /// Payload format version.
    pub version: u8,
    /// Sender time.
    pub timestamp: Timestamp,
    /// Message text.
    pub public_message: String,
}

/// Private message payload; body is opaque to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrivateMessage {
    /// Payload format version.
    pub version: u8,
    /// Sender time.
    pub timestamp: Timestamp,
    /// Encrypted body.
    pub private_message: Vec<u8>,
}

/// An off-chain offer: a serialized transaction proposed for completion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Offer {
    /// Payload format version.
    pub version: u8,
    /// Sender time.
    pub timestamp: Timestamp,
    /// Serialized proposed transaction.
    pub payload: Vec<u8>,
}

/// A request for the recipient to sign an embedded transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignatureRequest {
    /// Payload format version.
    pub version: u8,
    /// Sender time.
    pub timestamp: Timestamp,
    /// Serialized transaction awaiting signatures.
    pub payload: Vec<u8>,
}

/// A settlement-request hop: the partially composed settlement for a
/// transfer, forwarded agent to agent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SettlementRequest {
    /// Payload format version.
    pub version: u8,
    /// Sender time.
    pub timestamp: Timestamp,
    /// The transfer tx this settlement realizes.
    pub transfer_tx_id: Hash32,
    /// Contract fees owed per participating contract.
    pub contract_fees: Vec<TargetAddress>,
    /// The partially composed settlement transaction.
    pub settlement: Vec<u8>,
}

/// A payload carried in an `M01` Message, keyed by message code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    /// Code 2.
    Public(PublicMessage),
    /// Code 3.
    Private(PrivateMessage),
    /// Code 1001.
    Offer(Offer),
    /// Code 1002.
    SignatureRequest(SignatureRequest),
    /// Code 1003.
    SettlementRequest(SettlementRequest),
}

impl MessagePayload {
    /// The message code selecting this payload shape.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            MessagePayload::Public(_) => MSG_CODE_PUBLIC,
            MessagePayload::Private(_) => MSG_CODE_PRIVATE,
            MessagePayload::Offer(_) => MSG_CODE_OFFER,
            MessagePayload::SignatureRequest(_) => MSG_CODE_SIGNATURE_REQUEST,
            MessagePayload::SettlementRequest(_) => MSG_CODE_SETTLEMENT_REQUEST,
        }
    }

    /// Serializes the payload body.
    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        match self {
            MessagePayload::Public(m) => {
                out.push(m.version);
                write_timestamp(&mut out, m.timestamp);
                write_var_char(&mut out, &m.public_message, u32::MAX as usize)?;
            }
            MessagePayload::Private(m) => {
                out.push(m.version);
                write_timestamp(&mut out, m.timestamp);
                write_var_bytes(&mut out, &m.private_message, u32::MAX as usize)?;
            }
            MessagePayload::Offer(m) => {
                out.push(m.version);
                write_timestamp(&mut out, m.timestamp);
                write_var_bytes(&mut out, &m.payload, u32::MAX as usize)?;
            }
            MessagePayload::SignatureRequest(m) => {
                out.push(m.version);
                write_timestamp(&mut out, m.timestamp);
                write_var_bytes(&mut out, &m.payload, u32::MAX as usize)?;
            }
            MessagePayload::SettlementRequest(m) => {
                out.push(m.version);
                write_timestamp(&mut out, m.timestamp);
                write_hash(&mut out, &m.transfer_tx_id);
                let count: u8 =
                    m.contract_fees
                        .len()
                        .try_into()
                        .map_err(|_| WireError::TooLong {
                            len: m.contract_fees.len(),
                            max: 255,
                        })?;
                out.push(count);
                for fee in &m.contract_fees {
                    fee.write(&mut out)?;
                }
                write_var_bytes(&mut out, &m.settlement, u32::MAX as usize)?;
            }
        }
        Ok(out)
    }

    /// Deserializes a payload body for `code`, requiring full consumption.
    pub fn deserialize(code: u16, data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let payload = match code {
            MSG_CODE_PUBLIC => MessagePayload::Public(PublicMessage {
                version: read_u8(&mut buf)?,
                timestamp: read_timestamp(&mut buf)?,
                public_message: read_var_char(&mut buf, u32::MAX as usize)?,
            }),
            MSG_CODE_PRIVATE => MessagePayload::Private(PrivateMessage {
                version: read_u8(&mut buf)?,
                timestamp: read_timestamp(&mut buf)?,
                private_message: read_var_bytes(&mut buf, u32::MAX as usize)?,
            }),
            MSG_CODE_OFFER => MessagePayload::Offer(Offer {
                version: read_u8(&mut buf)?,
                timestamp: read_timestamp(&mut buf)?,
                payload: read_var_bytes(&mut buf, u32::MAX as usize)?,
            }),
            MSG_CODE_SIGNATURE_REQUEST => MessagePayload::SignatureRequest(SignatureRequest {
                version: read_u8(&mut buf)?,
                timestamp: read_timestamp(&mut buf)?,
                payload: read_var_bytes(&mut buf, u32::MAX as usize)?,
            }),
            MSG_CODE_SETTLEMENT_REQUEST => {
                let version = read_u8(&mut buf)?;
                let timestamp = read_timestamp(&mut buf)?;
                let transfer_tx_id = read_hash(&mut buf)?;
                let count = read_u8(&mut buf)?;
                let mut contract_fees = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    contract_fees.push(TargetAddress::read(&mut buf)?);
                }
                let settlement = read_var_bytes(&mut buf, u32::MAX as usize)?;
                MessagePayload::SettlementRequest(SettlementRequest {
                    version,
                    timestamp,
                    transfer_tx_id,
                    contract_fees,
                    settlement,
                })
            }
            _ => return Err(WireError::InvalidValue("message code")),
        };
        if !buf.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::{Address, Network};

    fn payload_bytes(n: usize) -> Vec<u8> {
        (0..n).map(|i| (67 + i) as u8).collect()
    }

    #[test]
    fn offer_round_trip() {
        let msg = MessagePayload::Offer(Offer {
            version: 0,
            timestamp: Timestamp(1),
            payload: payload_bytes(32),
        });
        let bytes = msg.serialize().unwrap();
        let back = MessagePayload::deserialize(MSG_CODE_OFFER, &bytes).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.serialize().unwrap(), bytes);
    }

    #[test]
    fn signature_request_round_trip() {
        let msg = MessagePayload::SignatureRequest(SignatureRequest {
            version: 0,
            timestamp: Timestamp(2),
            payload: payload_bytes(32),
        });
        let bytes = msg.serialize().unwrap();
        assert_eq!(
            MessagePayload::deserialize(MSG_CODE_SIGNATURE_REQUEST, &bytes).unwrap(),
            msg
        );
    }

    #[test]
    fn settlement_request_round_trip() {
        let msg = MessagePayload::SettlementRequest(SettlementRequest {
            version: 0,
            timestamp: Timestamp(3),
            transfer_tx_id: Hash32::hash(b"transfer"),
            contract_fees: vec![
                TargetAddress {
                    address: Address::pkh([1; 20], Network::Test),
                    quantity: 2_000,
                },
                TargetAddress {
                    address: Address::pkh([2; 20], Network::Test),
                    quantity: 1_000,
                },
            ],
            settlement: payload_bytes(64),
        });
        let bytes = msg.serialize().unwrap();
        let back = MessagePayload::deserialize(MSG_CODE_SETTLEMENT_REQUEST, &bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn public_and_private_round_trip() {
        let public = MessagePayload::Public(PublicMessage {
            version: 0,
            timestamp: Timestamp(4),
            public_message: "Text 2".to_string(),
        });
        let bytes = public.serialize().unwrap();
        assert_eq!(
            MessagePayload::deserialize(MSG_CODE_PUBLIC, &bytes).unwrap(),
            public
        );

        let private = MessagePayload::Private(PrivateMessage {
            version: 0,
            timestamp: Timestamp(5),
            private_message: payload_bytes(32),
        });
        let bytes = private.serialize().unwrap();
        assert_eq!(
            MessagePayload::deserialize(MSG_CODE_PRIVATE, &bytes).unwrap(),
            private
        );
    }

    #[test]
    fn unknown_code_rejected() {
        assert!(MessagePayload::deserialize(9999, &[0u8; 9]).is_err());
    }
}
