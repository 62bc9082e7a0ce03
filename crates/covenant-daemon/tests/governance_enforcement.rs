//! Governance and enforcement scenarios: the proposal → vote → ballot →
//! result → amendment chain, and freeze/thaw holding statuses.

mod common;

use std::sync::Arc;

use covenant_core::protocol::{
    Action, Amendment, AssetDefinition, AssetTerms, BallotCast, ContractAmendment, ContractOffer,
    ContractTerms, Order, Proposal, RejectCode, TargetAddress, Timestamp, VotingSystem,
    COMPLIANCE_FREEZE, COMPLIANCE_THAW, INITIATOR_ADMINISTRATION, VOTE_TYPE_RELATIVE,
};

use covenant_daemon::external::MemoryTxSource;
use covenant_daemon::scheduler::JobPayload;

use common::*;

/// A contract whose name (field 0) is amendable through administration
/// proposals under voting system 0, with one relative-majority system.
fn governed_offer() -> Action {
    // Per-field entry with one voting system: flags byte + one mask byte.
    let mut permissions = vec![0u8; 21 * 2];
    permissions[0] = 0b0000_0010; // field 0: administration proposal
    permissions[1] = 0b0000_0001; // ...under voting system 0

    Action::ContractOffer(ContractOffer {
        terms: ContractTerms {
            contract_name: "Governed".to_string(),
            contract_permissions: permissions,
            voting_systems: vec![VotingSystem {
                name: "Relative majority".to_string(),
                vote_type: VOTE_TYPE_RELATIVE,
                threshold_percentage: 50,
                vote_multiplier_permitted: false,
                holder_proposal_fee: 0,
            }],
            ..ContractTerms::default()
        },
    })
}

fn voting_asset(qty: u64) -> Action {
    let payload =
        covenant_core::protocol::AssetPayload::Currency(covenant_core::protocol::Currency {
            version: 0,
            trading_restriction: [0; 5],
            iso_code: "AUD".to_string(),
            monetary_authority: "Test".to_string(),
            description: String::new(),
        });
    Action::AssetDefinition(AssetDefinition {
        terms: AssetTerms {
            asset_type: "CUR".to_string(),
            asset_permissions: vec![0u8; 7 * 2],
            transfers_permitted: true,
            enforcement_orders_permitted: true,
            voting_rights: true,
            vote_multiplier: 1,
            token_qty: qty,
            asset_payload: payload.serialize().unwrap(),
        },
    })
}

fn name_amendment() -> Vec<Amendment> {
    vec![Amendment {
        field_index: 0,
        operation: 0,
        element: 0,
        data: b"Renamed by ballot".to_vec(),
    }]
}

#[test]
fn proposal_ballot_result_amendment_chain() {
    let source = Arc::new(MemoryTxSource::new());
    let agent = TestAgent::new(0x41, Arc::clone(&source));
    let admin = key(0xA1);

    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &governed_offer(),
    );
    deliver_and_pump(&[&agent], &request);
    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &voting_asset(1_000),
    );
    deliver_and_pump(&[&agent], &request);

    // Proposal opens a vote.
    let proposal = Action::Proposal(Proposal {
        initiator: INITIATOR_ADMINISTRATION,
        vote_system: 0,
        asset_specific_vote: false,
        asset_type: String::new(),
        asset_code: covenant_core::bitcoin::Hash32::ZERO,
        specific: true,
        proposed_amendments: name_amendment(),
        vote_options: "AR".to_string(),
        vote_max: 1,
        proposal_description: "Rename the contract".to_string(),
        vote_cut_off_timestamp: future(),
    });
    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &proposal,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);
    let (vote_index, _) = find_action(&broadcast, |a| matches!(a, Action::Vote(_))).unwrap();
    let vote_tx_id = broadcast[vote_index].txid();

    let vote = agent.ctx.repos.vote(&agent.contract, &vote_tx_id).unwrap();
    assert!(!vote.is_closed());
    assert_eq!(vote.token_qty_at_start, 1_000);

    // The administration (holding all tokens) votes Accept.
    let ballot = Action::BallotCast(BallotCast {
        vote_tx_id,
        vote: "A".to_string(),
    });
    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &ballot,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);
    assert!(find_action(&broadcast, |a| matches!(a, Action::BallotCounted(_))).is_some());

    // A second ballot from the same voter is refused.
    let ballot = Action::BallotCast(BallotCast {
        vote_tx_id,
        vote: "R".to_string(),
    });
    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &ballot,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);
    let (_, action) = find_action(&broadcast, |a| matches!(a, Action::Rejection(_))).unwrap();
    let Action::Rejection(rejection) = action else {
        unreachable!()
    };
    assert_eq!(rejection.rejection_code, RejectCode::BallotExists.as_u8());

    // The finalizer tallies and emits the result.
    agent
        .dispatcher
        .reprocess(&agent.contract, &JobPayload::FinalizeVote { vote_tx_id })
        .unwrap();
    let broadcast = pump(&[&agent]);
    let (result_index, action) =
        find_action(&broadcast, |a| matches!(a, Action::Result(_))).unwrap();
    let Action::Result(result) = action else {
        unreachable!()
    };
    assert_eq!(result.result, "A");
    let result_tx_id = broadcast[result_index].txid();

    let vote = agent.ctx.repos.vote(&agent.contract, &vote_tx_id).unwrap();
    assert!(vote.is_closed());

    // A ballot after close is refused.
    let ballot = Action::BallotCast(BallotCast {
        vote_tx_id,
        vote: "A".to_string(),
    });
    let request = request_tx(
        &source,
        &[&key(0xB7)],
        &[(agent.contract.clone(), 60_000)],
        &ballot,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);
    let (_, action) = find_action(&broadcast, |a| matches!(a, Action::Rejection(_))).unwrap();
    let Action::Rejection(rejection) = action else {
        unreachable!()
    };
    assert_eq!(rejection.rejection_code, RejectCode::VoteClosed.as_u8());

    // The amendment referencing the result applies.
    let amendment = Action::ContractAmendment(ContractAmendment {
        contract_revision: 0,
        ref_tx_id: result_tx_id,
        amendments: name_amendment(),
        ..ContractAmendment::default()
    });
    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &amendment,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);
    assert!(find_action(&broadcast, |a| matches!(a, Action::ContractFormation(_))).is_some());

    let contract = agent.ctx.repos.contract(&agent.contract).unwrap();
    assert_eq!(contract.contract_name, "Renamed by ballot");
    assert_eq!(contract.revision, 1);

    // The vote records what applied it.
    let vote = agent.ctx.repos.vote(&agent.contract, &vote_tx_id).unwrap();
    assert!(!vote.applied_at.is_zero());
}

#[test]
fn amendment_without_accepted_vote_is_refused() {
    let source = Arc::new(MemoryTxSource::new());
    let agent = TestAgent::new(0x42, Arc::clone(&source));
    let admin = key(0xA1);

    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &governed_offer(),
    );
    deliver_and_pump(&[&agent], &request);

    // Direct amendment of a proposal-gated field: refused on permissions.
    let amendment = Action::ContractAmendment(ContractAmendment {
        contract_revision: 0,
        amendments: name_amendment(),
        ..ContractAmendment::default()
    });
    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &amendment,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);
    let (_, action) = find_action(&broadcast, |a| matches!(a, Action::Rejection(_))).unwrap();
    let Action::Rejection(rejection) = action else {
        unreachable!()
    };
    assert_eq!(
        rejection.rejection_code,
        RejectCode::ContractPermissions.as_u8()
    );
}

// ============================================================================
// Enforcement
// ============================================================================

#[test]
fn freeze_blocks_transfers_and_thaw_restores() {
    let source = Arc::new(MemoryTxSource::new());
    let agent = TestAgent::new(0x43, Arc::clone(&source));
    let admin = key(0xA1);
    let alice = key(0xAA);

    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &governed_offer(),
    );
    deliver_and_pump(&[&agent], &request);
    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &voting_asset(1_000),
    );
    let broadcast = deliver_and_pump(&[&agent], &request);
    let (_, action) = find_action(&broadcast, |a| matches!(a, Action::AssetCreation(_))).unwrap();
    let Action::AssetCreation(creation) = action else {
        unreachable!()
    };
    let asset = creation.asset_code;

    // Give Alice a balance, then freeze 600 of the administration's
    // remaining holding.
    let seed = Action::Transfer(covenant_core::protocol::Transfer {
        assets: vec![covenant_core::protocol::AssetTransfer {
            contract_index: 0,
            asset_type: "CUR".to_string(),
            asset_code: asset,
            senders: vec![covenant_core::protocol::TransferSender {
                index: 0,
                quantity: 100,
            }],
            receivers: vec![covenant_core::protocol::TransferReceiver {
                address: alice.address(),
                quantity: 100,
                oracle_index: 0,
                oracle_sig_algorithm: 0,
                oracle_confirmation_sig: vec![],
                oracle_sig_block_height: 0,
                oracle_sig_expiry: Timestamp::ZERO,
            }],
        }],
        offer_expiry: Timestamp::ZERO,
    });
    let request = request_tx(&source, &[&admin], &[(agent.contract.clone(), 60_000)], &seed);
    deliver_and_pump(&[&agent], &request);
    assert_eq!(agent.balance(&asset, &alice.address()), 100);

    let order = Action::Order(Order {
        compliance_action: COMPLIANCE_FREEZE,
        asset_type: "CUR".to_string(),
        asset_code: asset,
        target_addresses: vec![TargetAddress {
            address: alice.address(),
            quantity: 100,
        }],
        freeze_period: future(),
        ..Order::default()
    });
    let request = request_tx(&source, &[&admin], &[(agent.contract.clone(), 60_000)], &order);
    let broadcast = deliver_and_pump(&[&agent], &request);
    let (freeze_index, _) = find_action(&broadcast, |a| matches!(a, Action::Freeze(_))).unwrap();
    let freeze_tx_id = broadcast[freeze_index].txid();

    // Alice's whole balance is frozen; a transfer from her is refused.
    let spend = Action::Transfer(covenant_core::protocol::Transfer {
        assets: vec![covenant_core::protocol::AssetTransfer {
            contract_index: 0,
            asset_type: "CUR".to_string(),
            asset_code: asset,
            senders: vec![covenant_core::protocol::TransferSender {
                index: 0,
                quantity: 50,
            }],
            receivers: vec![covenant_core::protocol::TransferReceiver {
                address: key(0xBB).address(),
                quantity: 50,
                oracle_index: 0,
                oracle_sig_algorithm: 0,
                oracle_confirmation_sig: vec![],
                oracle_sig_block_height: 0,
                oracle_sig_expiry: Timestamp::ZERO,
            }],
        }],
        offer_expiry: Timestamp::ZERO,
    });
    let request = request_tx(&source, &[&alice], &[(agent.contract.clone(), 60_000)], &spend);
    let broadcast = deliver_and_pump(&[&agent], &request);
    let (_, action) = find_action(&broadcast, |a| matches!(a, Action::Rejection(_))).unwrap();
    let Action::Rejection(rejection) = action else {
        unreachable!()
    };
    assert_eq!(
        rejection.rejection_code,
        RejectCode::InsufficientAssets.as_u8()
    );

    // Thaw referencing the freeze clears exactly its statuses.
    let thaw_order = Action::Order(Order {
        compliance_action: COMPLIANCE_THAW,
        asset_type: "CUR".to_string(),
        asset_code: asset,
        freeze_tx_id,
        ..Order::default()
    });
    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &thaw_order,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);
    assert!(find_action(&broadcast, |a| matches!(a, Action::Thaw(_))).is_some());

    // Spendable again: the transfer now settles.
    let request = request_tx(&source, &[&alice], &[(agent.contract.clone(), 60_000)], &spend);
    let broadcast = deliver_and_pump(&[&agent], &request);
    assert!(find_action(&broadcast, |a| matches!(a, Action::Settlement(_))).is_some());
    assert_eq!(agent.balance(&asset, &alice.address()), 50);
    assert_eq!(agent.balance(&asset, &key(0xBB).address()), 50);
}
