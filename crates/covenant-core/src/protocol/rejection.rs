//! The on-chain rejection-code table.
//!
//! Codes are stable wire values: new codes may be appended but existing
//! discriminants never change.

use serde::{Deserialize, Serialize};

/// Reason codes carried by an on-chain Rejection action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum RejectCode {
    Ok = 0,
    InsufficientValue = 1,
    IssuerAddress = 2,
    DuplicateAssetId = 3,
    FixedQuantity = 4,
    ContractExists = 5,
    ContractNotDynamic = 6,
    ContractQtyReduction = 7,
    AuthFlags = 8,
    ContractExpired = 9,
    ContractFrozen = 10,
    ContractMoved = 11,
    ContractRevision = 12,
    AssetRevision = 13,
    VoteExists = 14,
    VoteNotFound = 15,
    VoteClosed = 16,
    AssetNotFound = 17,
    InsufficientAssets = 18,
    TransferSelf = 19,
    ReceiverUnspecified = 20,
    UnknownAddress = 21,
    Frozen = 22,
    InvalidValue = 23,
    BallotExists = 24,
    MsgMalformed = 25,
    InvalidSignature = 26,
    NotAdministration = 27,
    NotOperator = 28,
    ContractBothOperatorsRequired = 29,
    ContractPermissions = 30,
    AssetPermissions = 31,
    AssetNotPermitted = 32,
    InsufficientQuantity = 33,
    TxMalformed = 34,
    TimedOut = 35,
}

impl RejectCode {
    /// Decodes a wire value. Unknown values are `None`; callers treat them
    /// as malformed.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        use RejectCode::*;
        Some(match value {
            0 => Ok,
            1 => InsufficientValue,
            2 => IssuerAddress,
            3 => DuplicateAssetId,
            4 => FixedQuantity,
            5 => ContractExists,
            6 => ContractNotDynamic,
            7 => ContractQtyReduction,
            8 => AuthFlags,
            9 => ContractExpired,
            10 => ContractFrozen,
            11 => ContractMoved,
            12 => ContractRevision,
            13 => AssetRevision,
            14 => VoteExists,
            15 => VoteNotFound,
            16 => VoteClosed,
            17 => AssetNotFound,
            18 => InsufficientAssets,
            19 => TransferSelf,
            20 => ReceiverUnspecified,
            21 => UnknownAddress,
            22 => Frozen,
            23 => InvalidValue,
            24 => BallotExists,
            25 => MsgMalformed,
            26 => InvalidSignature,
            27 => NotAdministration,
            28 => NotOperator,
            29 => ContractBothOperatorsRequired,
            30 => ContractPermissions,
            31 => AssetPermissions,
            32 => AssetNotPermitted,
            33 => InsufficientQuantity,
            34 => TxMalformed,
            35 => TimedOut,
            _ => return None,
        })
    }

    /// The wire value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_round_trip() {
        for value in 0u8..=35 {
            let code = RejectCode::from_u8(value).unwrap();
            assert_eq!(code.as_u8(), value);
        }
        assert_eq!(RejectCode::from_u8(200), None);
    }

    #[test]
    fn stable_discriminants() {
        assert_eq!(RejectCode::Ok.as_u8(), 0);
        assert_eq!(RejectCode::MsgMalformed.as_u8(), 25);
        assert_eq!(RejectCode::TimedOut.as_u8(), 35);
    }
}
