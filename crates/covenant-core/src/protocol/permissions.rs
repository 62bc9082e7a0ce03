//! The per-field permission matrix.
//!
//! Contracts and assets carry a permission entry for every amendable field:
//! whether the field may change without a proposal, through an
//! administration proposal, through a holder proposal, or only as an
//! administrative matter, plus an allow list over the contract's voting
//! systems.
//!
//! Encoding is byte-aligned per field: one flag byte followed by
//! ceil(V/8) bytes of voting-system allow mask, where V is the number of
//! voting systems. A 21-field matrix with no voting systems is exactly
//! 21 bytes.

use serde::{Deserialize, Serialize};

use super::wire::WireError;

/// Number of amendable contract fields.
pub const CONTRACT_FIELD_COUNT: usize = 21;

/// Number of amendable asset fields.
pub const ASSET_FIELD_COUNT: usize = 7;

const FLAG_PERMITTED: u8 = 1 << 0;
const FLAG_ADMINISTRATION_PROPOSAL: u8 = 1 << 1;
const FLAG_HOLDER_PROPOSAL: u8 = 1 << 2;
const FLAG_ADMINISTRATIVE_MATTER: u8 = 1 << 3;
const FLAG_MASK: u8 = 0x0f;

/// Permission entry for one amendable field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permission {
    /// The field may be amended directly, without a proposal.
    pub permitted: bool,
    /// The field may be amended through an administration proposal.
    pub administration_proposal: bool,
    /// The field may be amended through a holder proposal.
    pub holder_proposal: bool,
    /// The field is an administrative matter decided by ballot but applied
    /// by the administration.
    pub administrative_matter: bool,
    /// Which of the contract's voting systems may carry a proposal for this
    /// field. Length equals the contract's voting-system count.
    pub voting_systems_allowed: Vec<bool>,
}

/// A full permission matrix: one entry per amendable field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions(pub Vec<Permission>);

impl Permissions {
    /// A matrix of `field_count` all-denied entries.
    #[must_use]
    pub fn denied(field_count: usize, voting_systems: usize) -> Self {
        Permissions(vec![
            Permission {
                voting_systems_allowed: vec![false; voting_systems],
                ..Permission::default()
            };
            field_count
        ])
    }

    /// Decodes a matrix, validating the exact expected length.
    pub fn from_bytes(
        data: &[u8],
        field_count: usize,
        voting_systems: usize,
    ) -> Result<Self, WireError> {
        let mask_len = voting_systems.div_ceil(8);
        let entry_len = 1 + mask_len;
        if data.len() != field_count * entry_len {
            return Err(WireError::InvalidValue("permission matrix length"));
        }

        let mut entries = Vec::with_capacity(field_count);
        for chunk in data.chunks_exact(entry_len) {
            let flags = chunk[0];
            if flags & !FLAG_MASK != 0 {
                return Err(WireError::InvalidValue("permission flag bits"));
            }
            let mut allowed = Vec::with_capacity(voting_systems);
            for i in 0..voting_systems {
                let byte = chunk[1 + i / 8];
                allowed.push(byte & (1 << (i % 8)) != 0);
            }
            entries.push(Permission {
                permitted: flags & FLAG_PERMITTED != 0,
                administration_proposal: flags & FLAG_ADMINISTRATION_PROPOSAL != 0,
                holder_proposal: flags & FLAG_HOLDER_PROPOSAL != 0,
                administrative_matter: flags & FLAG_ADMINISTRATIVE_MATTER != 0,
                voting_systems_allowed: allowed,
            });
        }
        Ok(Permissions(entries))
    }

    /// Encodes the matrix. Every entry must carry `voting_systems` allow
    /// bits.
    pub fn to_bytes(&self, voting_systems: usize) -> Result<Vec<u8>, WireError> {
        let mask_len = voting_systems.div_ceil(8);
        let mut out = Vec::with_capacity(self.0.len() * (1 + mask_len));
        for entry in &self.0 {
            if entry.voting_systems_allowed.len() != voting_systems {
                return Err(WireError::InvalidValue("permission allow-list length"));
            }
            let mut flags = 0u8;
            if entry.permitted {
                flags |= FLAG_PERMITTED;
            }
            if entry.administration_proposal {
                flags |= FLAG_ADMINISTRATION_PROPOSAL;
            }
            if entry.holder_proposal {
                flags |= FLAG_HOLDER_PROPOSAL;
            }
            if entry.administrative_matter {
                flags |= FLAG_ADMINISTRATIVE_MATTER;
            }
            out.push(flags);

            let mut mask = vec![0u8; mask_len];
            for (i, allowed) in entry.voting_systems_allowed.iter().enumerate() {
                if *allowed {
                    mask[i / 8] |= 1 << (i % 8);
                }
            }
            out.extend_from_slice(&mask);
        }
        Ok(out)
    }

    /// The entry for `field_index`, if in range.
    #[must_use]
    pub fn field(&self, field_index: usize) -> Option<&Permission> {
        self.0.get(field_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_matrix_length_matches_field_count() {
        let matrix = Permissions::denied(CONTRACT_FIELD_COUNT, 0);
        let bytes = matrix.to_bytes(0).unwrap();
        assert_eq!(bytes.len(), CONTRACT_FIELD_COUNT);
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn round_trip_with_voting_systems() {
        let mut matrix = Permissions::denied(ASSET_FIELD_COUNT, 3);
        matrix.0[0].permitted = true;
        matrix.0[2].holder_proposal = true;
        matrix.0[2].voting_systems_allowed = vec![true, false, true];
        matrix.0[6].administrative_matter = true;

        let bytes = matrix.to_bytes(3).unwrap();
        let back = Permissions::from_bytes(&bytes, ASSET_FIELD_COUNT, 3).unwrap();
        assert_eq!(back, matrix);
    }

    #[test]
    fn wrong_length_rejected() {
        let bytes = vec![0u8; CONTRACT_FIELD_COUNT - 1];
        assert!(Permissions::from_bytes(&bytes, CONTRACT_FIELD_COUNT, 0).is_err());
    }

    #[test]
    fn undefined_flag_bits_rejected() {
        let mut bytes = vec![0u8; ASSET_FIELD_COUNT];
        bytes[3] = 0x80;
        assert!(Permissions::from_bytes(&bytes, ASSET_FIELD_COUNT, 0).is_err());
    }
}
