//! Digest builders for oracle and authority signatures.
//!
//! These signatures live inside protocol messages, not in transaction
//! inputs, so they have their own digests. Each digest is a double SHA-256
//! over a fixed-order field serialization.

use bytes::BufMut;

use crate::bitcoin::{double_sha256, Address, Hash32};

use super::actions::Order;
use super::wire::Timestamp;

/// Digest an identity oracle signs to approve a transfer receiver.
///
/// Commits to the authoritative contract, the asset, the receiver, a recent
/// block hash, the attestation expiry, and the approval flag.
#[must_use]
pub fn transfer_oracle_sig_hash(
    contract_address: &Address,
    asset_code: &Hash32,
    receiver_address: &Address,
    block_hash: &Hash32,
    expiry: Timestamp,
    approved: bool,
) -> [u8; 32] {
    let mut data = Vec::new();
    data.put_slice(&contract_address.to_bytes());
    data.put_slice(asset_code.as_bytes());
    data.put_slice(&receiver_address.to_bytes());
    data.put_slice(block_hash.as_bytes());
    data.put_u64_le(expiry.nanos());
    data.put_u8(u8::from(approved));
    double_sha256(&data)
}

/// Digest an enforcement authority signs over an order.
///
/// Covers the order body except the signature fields themselves.
#[must_use]
pub fn order_authority_sig_hash(contract_address: &Address, order: &Order) -> [u8; 32] {
    let mut data = Vec::new();
    data.put_slice(&contract_address.to_bytes());
    data.put_u8(order.compliance_action);
    data.put_slice(order.asset_type.as_bytes());
    data.put_slice(order.asset_code.as_bytes());
    for target in &order.target_addresses {
        data.put_slice(&target.address.to_bytes());
        data.put_u64_le(target.quantity);
    }
    data.put_slice(order.freeze_tx_id.as_bytes());
    data.put_u64_le(order.freeze_period.nanos());
    if let Some(deposit) = &order.deposit_address {
        data.put_slice(&deposit.to_bytes());
    }
    double_sha256(&data)
}

/// Digest an admin oracle signs to endorse a contract's administration.
///
/// Commits to the administration address, the operator address when
/// present, and a recent block hash.
#[must_use]
pub fn contract_oracle_sig_hash(
    admin_address: &Address,
    operator_address: Option<&Address>,
    block_hash: &Hash32,
) -> [u8; 32] {
    let mut data = Vec::new();
    data.put_slice(&admin_address.to_bytes());
    if let Some(operator) = operator_address {
        data.put_slice(&operator.to_bytes());
    }
    data.put_slice(block_hash.as_bytes());
    double_sha256(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::Network;

    fn addr(seed: u8) -> Address {
        Address::pkh([seed; 20], Network::Test)
    }

    #[test]
    fn transfer_digest_binds_every_field() {
        let base = transfer_oracle_sig_hash(
            &addr(1),
            &Hash32::hash(b"asset"),
            &addr(2),
            &Hash32::hash(b"block"),
            Timestamp(100),
            true,
        );

        let other_receiver = transfer_oracle_sig_hash(
            &addr(1),
            &Hash32::hash(b"asset"),
            &addr(3),
            &Hash32::hash(b"block"),
            Timestamp(100),
            true,
        );
        assert_ne!(base, other_receiver);

        let not_approved = transfer_oracle_sig_hash(
            &addr(1),
            &Hash32::hash(b"asset"),
            &addr(2),
            &Hash32::hash(b"block"),
            Timestamp(100),
            false,
        );
        assert_ne!(base, not_approved);
    }

    #[test]
    fn order_digest_excludes_signature_fields() {
        let mut order = Order {
            compliance_action: super::super::actions::COMPLIANCE_FREEZE,
            asset_type: "SHC".to_string(),
            asset_code: Hash32::hash(b"asset"),
            ..Order::default()
        };
        let before = order_authority_sig_hash(&addr(1), &order);
        order.order_signature = vec![1, 2, 3];
        order.authority_public_key = vec![4, 5, 6];
        let after = order_authority_sig_hash(&addr(1), &order);
        assert_eq!(before, after);

        order.compliance_action = super::super::actions::COMPLIANCE_THAW;
        assert_ne!(before, order_authority_sig_hash(&addr(1), &order));
    }

    #[test]
    fn contract_digest_depends_on_operator() {
        let with = contract_oracle_sig_hash(&addr(1), Some(&addr(2)), &Hash32::hash(b"b"));
        let without = contract_oracle_sig_hash(&addr(1), None, &Hash32::hash(b"b"));
        assert_ne!(with, without);
    }
}
