//! Transfer scenarios: single-contract settlement, the two-contract
//! boomerang, timeout recovery, and settlement replay idempotence.

mod common;

use std::sync::Arc;

use covenant_core::bitcoin::Hash32;
use covenant_core::protocol::{
    Action, AssetDefinition, AssetTerms, AssetTransfer, ContractOffer, ContractTerms, RejectCode,
    Timestamp, Transfer, TransferReceiver, TransferSender,
};

use covenant_daemon::external::MemoryTxSource;
use covenant_daemon::inspector::InspectorTx;
use covenant_daemon::scheduler::JobPayload;

use common::*;

// ============================================================================
// Setup helpers
// ============================================================================

fn plain_offer(name: &str) -> Action {
    Action::ContractOffer(ContractOffer {
        terms: ContractTerms {
            contract_name: name.to_string(),
            contract_permissions: vec![0u8; 21],
            ..ContractTerms::default()
        },
    })
}

fn currency_terms(qty: u64) -> AssetTerms {
    let payload =
        covenant_core::protocol::AssetPayload::Currency(covenant_core::protocol::Currency {
            version: 0,
            trading_restriction: [0; 5],
            iso_code: "AUD".to_string(),
            monetary_authority: "Test".to_string(),
            description: String::new(),
        });
    AssetTerms {
        asset_type: "CUR".to_string(),
        asset_permissions: vec![0u8; 7],
        transfers_permitted: true,
        enforcement_orders_permitted: true,
        voting_rights: false,
        vote_multiplier: 0,
        token_qty: qty,
        asset_payload: payload.serialize().unwrap(),
    }
}

/// Offers a contract and defines a currency asset; returns the asset code.
fn setup_contract_with_asset(
    agent: &TestAgent,
    admin: &covenant_core::bitcoin::PrivateKey,
    qty: u64,
) -> Hash32 {
    let request = request_tx(
        &agent.source,
        &[admin],
        &[(agent.contract.clone(), 60_000)],
        &plain_offer("T"),
    );
    deliver_and_pump(&[agent], &request);

    let definition = Action::AssetDefinition(AssetDefinition {
        terms: currency_terms(qty),
    });
    let request = request_tx(
        &agent.source,
        &[admin],
        &[(agent.contract.clone(), 60_000)],
        &definition,
    );
    let broadcast = deliver_and_pump(&[agent], &request);
    let (_, action) = find_action(&broadcast, |a| matches!(a, Action::AssetCreation(_))).unwrap();
    let Action::AssetCreation(creation) = action else {
        unreachable!()
    };
    creation.asset_code
}

/// Moves `qty` of `asset` from the administration to `party` so transfer
/// tests start from a funded holder.
fn seed_balance(
    agent: &TestAgent,
    admin: &covenant_core::bitcoin::PrivateKey,
    asset: Hash32,
    party: &covenant_core::bitcoin::Address,
    qty: u64,
) {
    let transfer = Action::Transfer(Transfer {
        assets: vec![AssetTransfer {
            contract_index: 0,
            asset_type: "CUR".to_string(),
            asset_code: asset,
            senders: vec![TransferSender {
                index: 0,
                quantity: qty,
            }],
            receivers: vec![TransferReceiver {
                address: party.clone(),
                quantity: qty,
                oracle_index: 0,
                oracle_sig_algorithm: 0,
                oracle_confirmation_sig: vec![],
                oracle_sig_block_height: 0,
                oracle_sig_expiry: Timestamp::ZERO,
            }],
        }],
        offer_expiry: Timestamp::ZERO,
    });
    let request = request_tx(
        &agent.source,
        &[admin],
        &[(agent.contract.clone(), 60_000)],
        &transfer,
    );
    let broadcast = deliver_and_pump(&[agent], &request);
    assert!(
        find_action(&broadcast, |a| matches!(a, Action::Settlement(_))).is_some(),
        "seeding settlement missing"
    );
    assert_eq!(agent.balance(&asset, party), qty);
}

// ============================================================================
// Single-contract settlement
// ============================================================================

#[test]
fn single_contract_transfer_settles_and_conserves() {
    let source = Arc::new(MemoryTxSource::new());
    let agent = TestAgent::new(0x21, Arc::clone(&source));
    let admin = key(0xA1);
    let alice = key(0xAA);
    let bob = key(0xBB);

    let asset = setup_contract_with_asset(&agent, &admin, 1_000);
    seed_balance(&agent, &admin, asset, &alice.address(), 10);

    let before: u64 = agent.balance(&asset, &admin.address())
        + agent.balance(&asset, &alice.address())
        + agent.balance(&asset, &bob.address());

    // Alice sends her 10 to Bob.
    let transfer = Action::Transfer(Transfer {
        assets: vec![AssetTransfer {
            contract_index: 0,
            asset_type: "CUR".to_string(),
            asset_code: asset,
            senders: vec![TransferSender {
                index: 0,
                quantity: 10,
            }],
            receivers: vec![TransferReceiver {
                address: bob.address(),
                quantity: 10,
                oracle_index: 0,
                oracle_sig_algorithm: 0,
                oracle_confirmation_sig: vec![],
                oracle_sig_block_height: 0,
                oracle_sig_expiry: Timestamp::ZERO,
            }],
        }],
        offer_expiry: Timestamp::ZERO,
    });
    let request = request_tx(
        &source,
        &[&alice],
        &[(agent.contract.clone(), 60_000)],
        &transfer,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);

    assert!(find_action(&broadcast, |a| matches!(a, Action::Settlement(_))).is_some());
    assert_eq!(agent.balance(&asset, &alice.address()), 0);
    assert_eq!(agent.balance(&asset, &bob.address()), 10);

    // Per-asset conservation.
    let after: u64 = agent.balance(&asset, &admin.address())
        + agent.balance(&asset, &alice.address())
        + agent.balance(&asset, &bob.address());
    assert_eq!(before, after);

    // No reservations left behind.
    assert_eq!(agent.pending_debits(&asset, &alice.address()), 0);
}

#[test]
fn overdrawn_sender_is_rejected() {
    let source = Arc::new(MemoryTxSource::new());
    let agent = TestAgent::new(0x22, Arc::clone(&source));
    let admin = key(0xA1);
    let alice = key(0xAA);

    let asset = setup_contract_with_asset(&agent, &admin, 1_000);
    seed_balance(&agent, &admin, asset, &alice.address(), 5);

    let transfer = Action::Transfer(Transfer {
        assets: vec![AssetTransfer {
            contract_index: 0,
            asset_type: "CUR".to_string(),
            asset_code: asset,
            senders: vec![TransferSender {
                index: 0,
                quantity: 50,
            }],
            receivers: vec![TransferReceiver {
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
    let request = request_tx(
        &source,
        &[&alice],
        &[(agent.contract.clone(), 60_000)],
        &transfer,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);

    let (_, action) = find_action(&broadcast, |a| matches!(a, Action::Rejection(_))).unwrap();
    let Action::Rejection(rejection) = action else {
        unreachable!()
    };
    assert_eq!(
        rejection.rejection_code,
        RejectCode::InsufficientAssets.as_u8()
    );
    assert_eq!(agent.balance(&asset, &alice.address()), 5);
    assert_eq!(agent.pending_debits(&asset, &alice.address()), 0);
}

#[test]
fn settlement_replay_is_idempotent() {
    let source = Arc::new(MemoryTxSource::new());
    let agent = TestAgent::new(0x23, Arc::clone(&source));
    let admin = key(0xA1);
    let alice = key(0xAA);
    let bob = key(0xBB);

    let asset = setup_contract_with_asset(&agent, &admin, 1_000);
    seed_balance(&agent, &admin, asset, &alice.address(), 10);

    let transfer = Action::Transfer(Transfer {
        assets: vec![AssetTransfer {
            contract_index: 0,
            asset_type: "CUR".to_string(),
            asset_code: asset,
            senders: vec![TransferSender {
                index: 0,
                quantity: 10,
            }],
            receivers: vec![TransferReceiver {
                address: bob.address(),
                quantity: 10,
                oracle_index: 0,
                oracle_sig_algorithm: 0,
                oracle_confirmation_sig: vec![],
                oracle_sig_block_height: 0,
                oracle_sig_expiry: Timestamp::ZERO,
            }],
        }],
        offer_expiry: Timestamp::ZERO,
    });
    let request = request_tx(
        &source,
        &[&alice],
        &[(agent.contract.clone(), 60_000)],
        &transfer,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);

    let (index, _) = find_action(&broadcast, |a| matches!(a, Action::Settlement(_))).unwrap();
    let settlement_tx = broadcast[index].clone();

    // Replay the settlement as if the network showed it again.
    for _ in 0..3 {
        let mut itx = InspectorTx::from_tx(settlement_tx.clone(), true);
        itx.promote(source.as_ref(), covenant_core::bitcoin::Network::Test)
            .unwrap();
        agent.dispatcher.process_tx(&itx).unwrap();
    }

    assert_eq!(agent.balance(&asset, &alice.address()), 0);
    assert_eq!(agent.balance(&asset, &bob.address()), 10);
}

// ============================================================================
// Two-contract boomerang
// ============================================================================

struct TwoContracts {
    source: Arc<MemoryTxSource>,
    leader: TestAgent,
    follower: TestAgent,
    asset_one: Hash32,
    asset_two: Hash32,
}

fn setup_two_contracts(alice_balance: u64, carol_balance: u64) -> TwoContracts {
    let source = Arc::new(MemoryTxSource::new());
    let leader = TestAgent::new(0x31, Arc::clone(&source));
    let follower = TestAgent::new(0x32, Arc::clone(&source));
    let admin = key(0xA1);

    let asset_one = setup_contract_with_asset(&leader, &admin, 1_000);
    let asset_two = setup_contract_with_asset(&follower, &admin, 1_000);

    if alice_balance > 0 {
        seed_balance(&leader, &admin, asset_one, &key(0xAA).address(), alice_balance);
    }
    if carol_balance > 0 {
        seed_balance(&follower, &admin, asset_two, &key(0xCC).address(), carol_balance);
    }

    TwoContracts {
        source,
        leader,
        follower,
        asset_one,
        asset_two,
    }
}

/// A transfer moving asset one (Alice → Bob, 10) on the leader and asset
/// two (Carol → Dave, 5) on the follower.
fn two_contract_transfer(t: &TwoContracts, carol_claims: u64) -> covenant_core::bitcoin::Transaction {
    let action = Action::Transfer(Transfer {
        assets: vec![
            AssetTransfer {
                contract_index: 0,
                asset_type: "CUR".to_string(),
                asset_code: t.asset_one,
                senders: vec![TransferSender {
                    index: 0,
                    quantity: 10,
                }],
                receivers: vec![TransferReceiver {
                    address: key(0xBB).address(),
                    quantity: 10,
                    oracle_index: 0,
                    oracle_sig_algorithm: 0,
                    oracle_confirmation_sig: vec![],
                    oracle_sig_block_height: 0,
                    oracle_sig_expiry: Timestamp::ZERO,
                }],
            },
            AssetTransfer {
                contract_index: 1,
                asset_type: "CUR".to_string(),
                asset_code: t.asset_two,
                senders: vec![TransferSender {
                    index: 1,
                    quantity: carol_claims,
                }],
                receivers: vec![TransferReceiver {
                    address: key(0xDD).address(),
                    quantity: carol_claims,
                    oracle_index: 0,
                    oracle_sig_algorithm: 0,
                    oracle_confirmation_sig: vec![],
                    oracle_sig_block_height: 0,
                    oracle_sig_expiry: Timestamp::ZERO,
                }],
            },
        ],
        offer_expiry: Timestamp::ZERO,
    });

    let alice = key(0xAA);
    let carol = key(0xCC);
    request_tx(
        &t.source,
        &[&alice, &carol],
        &[
            (t.leader.contract.clone(), 8_000),
            (t.follower.contract.clone(), 8_000),
            (t.leader.contract.clone(), 120_000),
        ],
        &action,
    )
}

#[test]
fn two_contract_transfer_settles_atomically() {
    let t = setup_two_contracts(10, 5);
    let transfer_tx = two_contract_transfer(&t, 5);

    let agents = [&t.leader, &t.follower];
    let broadcast = deliver_and_pump(&agents, &transfer_tx);

    // The boomerang ended in a broadcast settlement with both inputs
    // signed.
    let (index, action) =
        find_action(&broadcast, |a| matches!(a, Action::Settlement(_))).unwrap();
    let Action::Settlement(settlement) = action else {
        unreachable!()
    };
    assert_eq!(settlement.assets.len(), 2);
    let settlement_tx = &broadcast[index];
    assert_eq!(settlement_tx.inputs.len(), 2);
    assert!(settlement_tx.inputs.iter().all(|i| !i.sig_script.is_empty()));
    // The settlement spends the transfer, binding every signature to it.
    assert!(settlement_tx
        .inputs
        .iter()
        .all(|i| i.previous_output.txid == transfer_tx.txid()));

    // Both legs committed.
    assert_eq!(t.leader.balance(&t.asset_one, &key(0xAA).address()), 0);
    assert_eq!(t.leader.balance(&t.asset_one, &key(0xBB).address()), 10);
    assert_eq!(t.follower.balance(&t.asset_two, &key(0xCC).address()), 0);
    assert_eq!(t.follower.balance(&t.asset_two, &key(0xDD).address()), 5);

    // Reservations are gone on both sides.
    assert_eq!(t.leader.pending_debits(&t.asset_one, &key(0xAA).address()), 0);
    assert_eq!(
        t.follower.pending_debits(&t.asset_two, &key(0xCC).address()),
        0
    );
}

#[test]
fn follower_shortfall_rejects_and_leader_times_out_once() {
    // Carol holds 2 but the transfer claims 5.
    let t = setup_two_contracts(10, 2);
    let transfer_tx = two_contract_transfer(&t, 5);
    let transfer_tx_id = transfer_tx.txid();

    let agents = [&t.leader, &t.follower];
    let broadcast = deliver_and_pump(&agents, &transfer_tx);

    // The follower rejected with InsufficientAssets; no settlement
    // appeared.
    let (_, action) = find_action(&broadcast, |a| {
        matches!(a, Action::Rejection(r) if r.rejection_code == RejectCode::InsufficientAssets.as_u8())
    })
    .unwrap();
    drop(action);
    assert!(find_action(&broadcast, |a| matches!(a, Action::Settlement(_))).is_none());

    // The leader still holds its reservation.
    assert_eq!(
        t.leader.pending_debits(&t.asset_one, &key(0xAA).address()),
        10
    );

    // The timeout fires: exactly one TimedOut rejection, reservations
    // released.
    t.leader
        .dispatcher
        .reprocess(
            &t.leader.contract,
            &JobPayload::TransferTimeout { transfer_tx_id },
        )
        .unwrap();
    let broadcast = pump(&agents);
    let timed_out = broadcast
        .iter()
        .filter_map(|tx| {
            find_action(std::slice::from_ref(tx), |a| {
                matches!(a, Action::Rejection(r) if r.rejection_code == RejectCode::TimedOut.as_u8())
            })
        })
        .count();
    assert_eq!(timed_out, 1);

    assert_eq!(t.leader.pending_debits(&t.asset_one, &key(0xAA).address()), 0);
    assert_eq!(t.leader.balance(&t.asset_one, &key(0xAA).address()), 10);
    assert!(t
        .leader
        .ctx
        .repos
        .transfer(&t.leader.contract, &transfer_tx_id)
        .is_err());

    // Firing the timeout again emits nothing new.
    t.leader
        .dispatcher
        .reprocess(
            &t.leader.contract,
            &JobPayload::TransferTimeout { transfer_tx_id },
        )
        .unwrap();
    assert!(pump(&agents).is_empty());
}
