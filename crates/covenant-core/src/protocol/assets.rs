//! Polymorphic asset payloads.
//!
//! Every asset carries a payload whose shape is selected by the 3-character
//! asset type code. Payloads serialize independently of the enclosing
//! action and are opaque bytes at the transaction level.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use super::wire::{
    read_fixed_char, read_timestamp, read_u64, read_u8, read_var_char, write_fixed_char,
    write_timestamp, write_var_char, Timestamp, WireError,
};

/// Coupon asset type code.
pub const ASSET_TYPE_COUPON: &str = "COU";
/// Currency asset type code.
pub const ASSET_TYPE_CURRENCY: &str = "CUR";
/// Loyalty points asset type code.
pub const ASSET_TYPE_LOYALTY: &str = "LOY";
/// Membership asset type code.
pub const ASSET_TYPE_MEMBERSHIP: &str = "MEM";
/// Common share asset type code.
pub const ASSET_TYPE_SHARE_COMMON: &str = "SHC";
/// Admission ticket asset type code.
pub const ASSET_TYPE_TICKET: &str = "TIC";

const TRADING_RESTRICTION_LEN: usize = 5;
const AGE_RESTRICTION_LEN: usize = 5;

fn read_fixed_bytes<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], WireError> {
    if buf.len() < N {
        return Err(WireError::Truncated);
    }
    let (head, rest) = buf.split_at(N);
    let mut out = [0u8; N];
    out.copy_from_slice(head);
    *buf = rest;
    Ok(out)
}

/// Coupon payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Coupon {
    /// Payload format version.
    pub version: u8,
    /// Jurisdiction restriction code, NUL padded.
    pub trading_restriction: [u8; TRADING_RESTRICTION_LEN],
    /// Entity that redeems the coupon.
    pub redeeming_entity: String,
    /// Issue time.
    pub issue_date: Timestamp,
    /// Expiry time, zero for none.
    pub expiry_date: Timestamp,
    /// Face value in `currency` minor units.
    pub value: u64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Free-form description.
    pub description: String,
}

/// Currency payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Currency {
    /// Payload format version.
    pub version: u8,
    /// Jurisdiction restriction code, NUL padded.
    pub trading_restriction: [u8; TRADING_RESTRICTION_LEN],
    /// ISO-4217 code.
    pub iso_code: String,
    /// Issuing monetary authority.
    pub monetary_authority: String,
    /// Free-form description.
    pub description: String,
}

/// Loyalty points payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoyaltyPoints {
    /// Payload format version.
    pub version: u8,
    /// Jurisdiction restriction code, NUL padded.
    pub trading_restriction: [u8; TRADING_RESTRICTION_LEN],
    /// Age restriction code, NUL padded.
    pub age_restriction: [u8; AGE_RESTRICTION_LEN],
    /// Offer class byte.
    pub offer_type: u8,
    /// Offer display name.
    pub offer_name: String,
    /// First valid time.
    pub valid_from: Timestamp,
    /// Expiration time, zero for none.
    pub expiration: Timestamp,
    /// Free-form description.
    pub description: String,
}

/// Membership payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Membership {
    /// Payload format version.
    pub version: u8,
    /// Jurisdiction restriction code, NUL padded.
    pub trading_restriction: [u8; TRADING_RESTRICTION_LEN],
    /// Age restriction code, NUL padded.
    pub age_restriction: [u8; AGE_RESTRICTION_LEN],
    /// First valid time.
    pub valid_from: Timestamp,
    /// Expiration time, zero for none.
    pub expiration: Timestamp,
    /// External membership id.
    pub id: String,
    /// Class of membership. `Owner` and `Administrator` classes are limited
    /// to one asset per contract.
    pub membership_class: String,
    /// Kind of membership.
    pub membership_type: String,
    /// Free-form description.
    pub description: String,
}

impl Membership {
    /// True when this class is limited to a single asset per contract.
    #[must_use]
    pub fn is_admin_class(&self) -> bool {
        self.membership_class == "Owner" || self.membership_class == "Administrator"
    }
}

/// Common share payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShareCommon {
    /// Payload format version.
    pub version: u8,
    /// Jurisdiction restriction code, NUL padded.
    pub trading_restriction: [u8; TRADING_RESTRICTION_LEN],
    /// Earliest transfer time, zero for none.
    pub transfer_lockout: Timestamp,
    /// Exchange ticker.
    pub ticker: String,
    /// ISIN identifier.
    pub isin: String,
    /// Free-form description.
    pub description: String,
}

/// Admission ticket payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TicketAdmission {
    /// Payload format version.
    pub version: u8,
    /// Jurisdiction restriction code, NUL padded.
    pub trading_restriction: [u8; TRADING_RESTRICTION_LEN],
    /// Age restriction code, NUL padded.
    pub age_restriction: [u8; AGE_RESTRICTION_LEN],
    /// Admission class code.
    pub admission_type: String,
    /// Venue name.
    pub venue: String,
    /// Seating class.
    pub class: String,
    /// Venue area.
    pub area: String,
    /// Seat identifier.
    pub seat: String,
    /// Event start time.
    pub start_time: Timestamp,
    /// First valid time.
    pub valid_from: Timestamp,
    /// Expiration time, zero for none.
    pub expiration: Timestamp,
    /// Free-form description.
    pub description: String,
}

/// An asset payload, tagged by its 3-character type code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetPayload {
    /// `COU`
    Coupon(Coupon),
    /// `CUR`
    Currency(Currency),
    /// `LOY`
    LoyaltyPoints(LoyaltyPoints),
    /// `MEM`
    Membership(Membership),
    /// `SHC`
    ShareCommon(ShareCommon),
    /// `TIC`
    TicketAdmission(TicketAdmission),
}

impl AssetPayload {
    /// The 3-character asset type code.
    #[must_use]
    pub fn asset_type(&self) -> &'static str {
        match self {
            AssetPayload::Coupon(_) => ASSET_TYPE_COUPON,
            AssetPayload::Currency(_) => ASSET_TYPE_CURRENCY,
            AssetPayload::LoyaltyPoints(_) => ASSET_TYPE_LOYALTY,
            AssetPayload::Membership(_) => ASSET_TYPE_MEMBERSHIP,
            AssetPayload::ShareCommon(_) => ASSET_TYPE_SHARE_COMMON,
            AssetPayload::TicketAdmission(_) => ASSET_TYPE_TICKET,
        }
    }

    /// Serializes the payload body.
    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        match self {
            AssetPayload::Coupon(m) => {
                out.put_u8(m.version);
                out.put_slice(&m.trading_restriction);
                write_var_char(&mut out, &m.redeeming_entity, 255)?;
                write_timestamp(&mut out, m.issue_date);
                write_timestamp(&mut out, m.expiry_date);
                out.put_u64_le(m.value);
                write_fixed_char(&mut out, &m.currency, 3)?;
                write_var_char(&mut out, &m.description, 255)?;
            }
            AssetPayload::Currency(m) => {
                out.put_u8(m.version);
                out.put_slice(&m.trading_restriction);
                write_fixed_char(&mut out, &m.iso_code, 3)?;
                write_var_char(&mut out, &m.monetary_authority, 255)?;
                write_var_char(&mut out, &m.description, 255)?;
            }
            AssetPayload::LoyaltyPoints(m) => {
                out.put_u8(m.version);
                out.put_slice(&m.trading_restriction);
                out.put_slice(&m.age_restriction);
                out.put_u8(m.offer_type);
                write_var_char(&mut out, &m.offer_name, 255)?;
                write_timestamp(&mut out, m.valid_from);
                write_timestamp(&mut out, m.expiration);
                write_var_char(&mut out, &m.description, 255)?;
            }
            AssetPayload::Membership(m) => {
                out.put_u8(m.version);
                out.put_slice(&m.trading_restriction);
                out.put_slice(&m.age_restriction);
                write_timestamp(&mut out, m.valid_from);
                write_timestamp(&mut out, m.expiration);
                write_var_char(&mut out, &m.id, 255)?;
                write_var_char(&mut out, &m.membership_class, 255)?;
                write_var_char(&mut out, &m.membership_type, 255)?;
                write_var_char(&mut out, &m.description, 255)?;
            }
            AssetPayload::ShareCommon(m) => {
                out.put_u8(m.version);
                out.put_slice(&m.trading_restriction);
                write_timestamp(&mut out, m.transfer_lockout);
                write_fixed_char(&mut out, &m.ticker, 5)?;
                write_fixed_char(&mut out, &m.isin, 12)?;
                write_var_char(&mut out, &m.description, 113)?;
            }
            AssetPayload::TicketAdmission(m) => {
                out.put_u8(m.version);
                out.put_slice(&m.trading_restriction);
                out.put_slice(&m.age_restriction);
                write_fixed_char(&mut out, &m.admission_type, 3)?;
                write_var_char(&mut out, &m.venue, 255)?;
                write_var_char(&mut out, &m.class, 255)?;
                write_var_char(&mut out, &m.area, 255)?;
                write_var_char(&mut out, &m.seat, 255)?;
                write_timestamp(&mut out, m.start_time);
                write_timestamp(&mut out, m.valid_from);
                write_timestamp(&mut out, m.expiration);
                write_var_char(&mut out, &m.description, 255)?;
            }
        }
        Ok(out)
    }

    /// Deserializes a payload body for `asset_type`. The body must be fully
    /// consumed.
    pub fn deserialize(asset_type: &str, data: &[u8]) -> Result<Self, WireError> {
        let mut buf = data;
        let payload = match asset_type {
            ASSET_TYPE_COUPON => AssetPayload::Coupon(Coupon {
                version: read_u8(&mut buf)?,
                trading_restriction: read_fixed_bytes(&mut buf)?,
                redeeming_entity: read_var_char(&mut buf, 255)?,
                issue_date: read_timestamp(&mut buf)?,
                expiry_date: read_timestamp(&mut buf)?,
                value: read_u64(&mut buf)?,
                currency: read_fixed_char(&mut buf, 3)?,
                description: read_var_char(&mut buf, 255)?,
            }),
            ASSET_TYPE_CURRENCY => AssetPayload::Currency(Currency {
                version: read_u8(&mut buf)?,
                trading_restriction: read_fixed_bytes(&mut buf)?,
                iso_code: read_fixed_char(&mut buf, 3)?,
                monetary_authority: read_var_char(&mut buf, 255)?,
                description: read_var_char(&mut buf, 255)?,
            }),
            ASSET_TYPE_LOYALTY => AssetPayload::LoyaltyPoints(LoyaltyPoints {
                version: read_u8(&mut buf)?,
                trading_restriction: read_fixed_bytes(&mut buf)?,
                age_restriction: read_fixed_bytes(&mut buf)?,
                offer_type: read_u8(&mut buf)?,
                offer_name: read_var_char(&mut buf, 255)?,
                valid_from: read_timestamp(&mut buf)?,
                expiration: read_timestamp(&mut buf)?,
                description: read_var_char(&mut buf, 255)?,
            }),
            ASSET_TYPE_MEMBERSHIP => AssetPayload::Membership(Membership {
                version: read_u8(&mut buf)?,
                trading_restriction: read_fixed_bytes(&mut buf)?,
                age_restriction: read_fixed_bytes(&mut buf)?,
                valid_from: read_timestamp(&mut buf)?,
                expiration: read_timestamp(&mut buf)?,
                id: read_var_char(&mut buf, 255)?,
                membership_class: read_var_char(&mut buf, 255)?,
                membership_type: read_var_char(&mut buf, 255)?,
                description: read_var_char(&mut buf, 255)?,
            }),
            ASSET_TYPE_SHARE_COMMON => AssetPayload::ShareCommon(ShareCommon {
                version: read_u8(&mut buf)?,
                trading_restriction: read_fixed_bytes(&mut buf)?,
                transfer_lockout: read_timestamp(&mut buf)?,
                ticker: read_fixed_char(&mut buf, 5)?,
                isin: read_fixed_char(&mut buf, 12)?,
                description: read_var_char(&mut buf, 113)?,
            }),
            ASSET_TYPE_TICKET => AssetPayload::TicketAdmission(TicketAdmission {
                version: read_u8(&mut buf)?,
                trading_restriction: read_fixed_bytes(&mut buf)?,
                age_restriction: read_fixed_bytes(&mut buf)?,
                admission_type: read_fixed_char(&mut buf, 3)?,
                venue: read_var_char(&mut buf, 255)?,
                class: read_var_char(&mut buf, 255)?,
                area: read_var_char(&mut buf, 255)?,
                seat: read_var_char(&mut buf, 255)?,
                start_time: read_timestamp(&mut buf)?,
                valid_from: read_timestamp(&mut buf)?,
                expiration: read_timestamp(&mut buf)?,
                description: read_var_char(&mut buf, 255)?,
            }),
            _ => return Err(WireError::InvalidValue("asset type")),
        };
        if !buf.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(payload)
    }

    /// Checks the payload's own field constraints.
    pub fn validate(&self) -> Result<(), WireError> {
        match self {
            AssetPayload::Coupon(m) => {
                if m.currency.len() != 3 {
                    return Err(WireError::InvalidValue("coupon currency code"));
                }
            }
            AssetPayload::Currency(m) => {
                if m.iso_code.len() != 3 {
                    return Err(WireError::InvalidValue("currency iso code"));
                }
            }
            AssetPayload::ShareCommon(m) => {
                if m.ticker.is_empty() {
                    return Err(WireError::InvalidValue("share ticker"));
                }
            }
            AssetPayload::Membership(m) => {
                if m.membership_type.is_empty() {
                    return Err(WireError::InvalidValue("membership type"));
                }
            }
            AssetPayload::LoyaltyPoints(_) | AssetPayload::TicketAdmission(_) => {}
        }
        Ok(())
    }

    /// Applies a payload amendment: the amendment data is a full
    /// re-serialized payload of the same asset type.
    ///
    /// The asset type itself is immutable; a type change is a malformed
    /// amendment.
    pub fn apply_amendment(&self, data: &[u8]) -> Result<AssetPayload, WireError> {
        let amended = AssetPayload::deserialize(self.asset_type(), data)?;
        amended.validate()?;
        Ok(amended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payloads() -> Vec<AssetPayload> {
        vec![
            AssetPayload::Coupon(Coupon {
                version: 0,
                trading_restriction: *b"AUS\0\0",
                redeeming_entity: "Corner Cafe".to_string(),
                issue_date: Timestamp(1_000),
                expiry_date: Timestamp(2_000),
                value: 500,
                currency: "AUD".to_string(),
                description: "Free coffee".to_string(),
            }),
            AssetPayload::Currency(Currency {
                version: 0,
                trading_restriction: *b"GBR\0\0",
                iso_code: "GBP".to_string(),
                monetary_authority: "Bank of England".to_string(),
                description: String::new(),
            }),
            AssetPayload::LoyaltyPoints(LoyaltyPoints {
                version: 0,
                trading_restriction: [0; 5],
                age_restriction: [0; 5],
                offer_type: b'P',
                offer_name: "Points".to_string(),
                valid_from: Timestamp(10),
                expiration: Timestamp::ZERO,
                description: "points".to_string(),
            }),
            AssetPayload::Membership(Membership {
                version: 0,
                trading_restriction: [0; 5],
                age_restriction: [0; 5],
                valid_from: Timestamp(0),
                expiration: Timestamp(0),
                id: "M-1".to_string(),
                membership_class: "Owner".to_string(),
                membership_type: "Full".to_string(),
                description: String::new(),
            }),
            AssetPayload::ShareCommon(ShareCommon {
                version: 0,
                trading_restriction: [0; 5],
                transfer_lockout: Timestamp::ZERO,
                ticker: "CVN".to_string(),
                isin: "AU0000CVN012".to_string(),
                description: "ordinary shares".to_string(),
            }),
            AssetPayload::TicketAdmission(TicketAdmission {
                version: 0,
                trading_restriction: [0; 5],
                age_restriction: *b"18+\0\0",
                admission_type: "GA".to_string(),
                venue: "Town Hall".to_string(),
                class: "A".to_string(),
                area: String::new(),
                seat: String::new(),
                start_time: Timestamp(500),
                valid_from: Timestamp(100),
                expiration: Timestamp(600),
                description: String::new(),
            }),
        ]
    }

    #[test]
    fn round_trip_every_type() {
        for payload in sample_payloads() {
            let bytes = payload.serialize().unwrap();
            let back = AssetPayload::deserialize(payload.asset_type(), &bytes).unwrap();
            assert_eq!(back, payload);
            // Re-serialization is byte-exact.
            assert_eq!(back.serialize().unwrap(), bytes);
        }
    }

    #[test]
    fn unknown_type_rejected() {
        assert!(AssetPayload::deserialize("XXX", &[0u8; 32]).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let payload = &sample_payloads()[1];
        let mut bytes = payload.serialize().unwrap();
        bytes.push(0);
        assert!(AssetPayload::deserialize(payload.asset_type(), &bytes).is_err());
    }

    #[test]
    fn membership_admin_class() {
        let AssetPayload::Membership(m) = &sample_payloads()[3] else {
            panic!("expected membership");
        };
        assert!(m.is_admin_class());
        let mut plain = m.clone();
        plain.membership_class = "Member".to_string();
        assert!(!plain.is_admin_class());
    }

    #[test]
    fn amendment_cannot_change_type() {
        let currency = &sample_payloads()[1];
        let coupon_bytes = sample_payloads()[0].serialize().unwrap();
        assert!(currency.apply_amendment(&coupon_bytes).is_err());
    }

    #[test]
    fn validate_flags_bad_currency() {
        let payload = AssetPayload::Currency(Currency {
            iso_code: "TOOLONG".to_string(),
            ..Currency::default()
        });
        // Over-long codes fail at serialize time; an empty one fails
        // validation.
        assert!(payload.serialize().is_err());
        let payload = AssetPayload::Currency(Currency::default());
        assert!(payload.validate().is_err());
    }
}
