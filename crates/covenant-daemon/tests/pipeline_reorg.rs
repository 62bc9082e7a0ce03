//! Ingest-pipeline scenarios: safe deferral, reorg revert/re-confirm
//! equivalence, and reservation release on cancelled transfers.

mod common;

use std::sync::Arc;

use covenant_core::protocol::{
    Action, AssetTransfer, ContractOffer, ContractTerms, Timestamp, Transfer, TransferReceiver,
    TransferSender,
};

use covenant_daemon::dispatch::Dispatcher;
use covenant_daemon::external::MemoryTxSource;
use covenant_daemon::pipeline::{Pipeline, TxState};

use common::*;

fn pipeline_for(agent: &TestAgent) -> (Arc<Pipeline>, tokio::sync::watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&agent.ctx)));
    let pipeline = Arc::new(Pipeline::new(
        dispatcher,
        agent.source.clone(),
        shutdown_rx,
    ));
    (pipeline, shutdown_tx)
}

/// Feeds every broadcast tx back through the pipeline as seen + safe until
/// quiet.
async fn pump_pipeline(agent: &TestAgent, pipeline: &Pipeline) {
    loop {
        let fresh = agent.broadcaster.drain();
        if fresh.is_empty() {
            break;
        }
        for tx in fresh {
            agent.source.add(tx.clone());
            let txid = tx.txid();
            if pipeline.handle_tx(tx).unwrap() {
                pipeline.handle_tx_state(txid, TxState::Safe).await.unwrap();
            }
            pipeline.drain().await;
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn revert_then_reconfirm_equals_commit_once() {
    let source = Arc::new(MemoryTxSource::new());
    let agent = TestAgent::new(0x51, Arc::clone(&source));
    let (pipeline, _shutdown) = pipeline_for(&agent);
    let admin = key(0xA1);

    let offer = Action::ContractOffer(ContractOffer {
        terms: ContractTerms {
            contract_name: "Reorged".to_string(),
            contract_permissions: vec![0u8; 21],
            ..ContractTerms::default()
        },
    });
    let request = request_tx(&source, &[&admin], &[(agent.contract.clone(), 60_000)], &offer);
    let request_txid = request.txid();

    // Seen but not yet safe: nothing happens.
    assert!(pipeline.handle_tx(request.clone()).unwrap());
    pipeline.drain().await;
    assert_eq!(agent.broadcaster.count(), 0);

    // Safe: the formation goes out and commits.
    pipeline
        .handle_tx_state(request_txid, TxState::Safe)
        .await
        .unwrap();
    pipeline.drain().await;
    pump_pipeline(&agent, &pipeline).await;

    let contract = agent.ctx.repos.contract(&agent.contract).unwrap();
    assert_eq!(contract.contract_name, "Reorged");

    // Reverted, then safe again after the reorg: state is unchanged and
    // no duplicate response appears.
    pipeline
        .handle_tx_state(request_txid, TxState::Reverted)
        .await
        .unwrap();
    pipeline.drain().await;
    pipeline
        .handle_tx_state(request_txid, TxState::Safe)
        .await
        .unwrap();
    pipeline.drain().await;

    assert_eq!(agent.broadcaster.count(), 0);
    let contract = agent.ctx.repos.contract(&agent.contract).unwrap();
    assert_eq!(contract.contract_name, "Reorged");
    assert_eq!(contract.revision, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsafe_tx_waits_for_confirmation() {
    let source = Arc::new(MemoryTxSource::new());
    let agent = TestAgent::new(0x52, Arc::clone(&source));
    let (pipeline, _shutdown) = pipeline_for(&agent);
    let admin = key(0xA1);

    let offer = Action::ContractOffer(ContractOffer {
        terms: ContractTerms {
            contract_name: "Contested".to_string(),
            contract_permissions: vec![0u8; 21],
            ..ContractTerms::default()
        },
    });
    let request = request_tx(&source, &[&admin], &[(agent.contract.clone(), 60_000)], &offer);
    let request_txid = request.txid();

    assert!(pipeline.handle_tx(request).unwrap());
    pipeline
        .handle_tx_state(request_txid, TxState::Unsafe)
        .await
        .unwrap();
    pipeline.drain().await;
    assert_eq!(agent.broadcaster.count(), 0);

    // Confirmation rescues it.
    pipeline
        .handle_tx_state(request_txid, TxState::Confirmed(500))
        .await
        .unwrap();
    pipeline.drain().await;
    assert!(agent.broadcaster.count() > 0);

    // The relevance index recorded the confirmation height.
    assert!(agent.ctx.tx_index.contains(&request_txid, 500).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_freeze_withdraws_statuses() {
    use covenant_core::protocol::{Order, TargetAddress, COMPLIANCE_FREEZE};
    use covenant_daemon::holdings::HoldingKey;

    let source = Arc::new(MemoryTxSource::new());
    let agent = TestAgent::new(0x55, Arc::clone(&source));
    let (pipeline, _shutdown) = pipeline_for(&agent);
    let admin = key(0xA1);
    let alice = key(0xAA);

    let offer = Action::ContractOffer(ContractOffer {
        terms: ContractTerms {
            contract_name: "E".to_string(),
            contract_permissions: vec![0u8; 21],
            ..ContractTerms::default()
        },
    });
    let request = request_tx(&source, &[&admin], &[(agent.contract.clone(), 60_000)], &offer);
    deliver_and_pump(&[&agent], &request);

    let payload =
        covenant_core::protocol::AssetPayload::Currency(covenant_core::protocol::Currency {
            version: 0,
            trading_restriction: [0; 5],
            iso_code: "AUD".to_string(),
            monetary_authority: "Test".to_string(),
            description: String::new(),
        });
    let definition = Action::AssetDefinition(covenant_core::protocol::AssetDefinition {
        terms: covenant_core::protocol::AssetTerms {
            asset_type: "CUR".to_string(),
            asset_permissions: vec![0u8; 7],
            transfers_permitted: true,
            enforcement_orders_permitted: true,
            voting_rights: false,
            vote_multiplier: 0,
            token_qty: 1_000,
            asset_payload: payload.serialize().unwrap(),
        },
    });
    let request = request_tx(
        &source,
        &[&admin],
        &[(agent.contract.clone(), 60_000)],
        &definition,
    );
    let broadcast = deliver_and_pump(&[&agent], &request);
    let (_, action) = find_action(&broadcast, |a| matches!(a, Action::AssetCreation(_))).unwrap();
    let Action::AssetCreation(creation) = action else {
        unreachable!()
    };
    let asset = creation.asset_code;

    let seed = Action::Transfer(Transfer {
        assets: vec![AssetTransfer {
            contract_index: 0,
            asset_type: "CUR".to_string(),
            asset_code: asset,
            senders: vec![TransferSender {
                index: 0,
                quantity: 50,
            }],
            receivers: vec![TransferReceiver {
                address: alice.address(),
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
    let request = request_tx(&source, &[&admin], &[(agent.contract.clone(), 60_000)], &seed);
    deliver_and_pump(&[&agent], &request);

    // Freeze Alice's whole balance and let the response commit.
    let order = Action::Order(Order {
        compliance_action: COMPLIANCE_FREEZE,
        asset_type: "CUR".to_string(),
        asset_code: asset,
        target_addresses: vec![TargetAddress {
            address: alice.address(),
            quantity: 50,
        }],
        freeze_period: Timestamp::now().plus_secs(3_600),
        ..Order::default()
    });
    let request = request_tx(&source, &[&admin], &[(agent.contract.clone(), 60_000)], &order);
    let broadcast = deliver_and_pump(&[&agent], &request);
    let (freeze_index, _) = find_action(&broadcast, |a| matches!(a, Action::Freeze(_))).unwrap();
    let freeze_txid = broadcast[freeze_index].txid();

    let holding_key = HoldingKey {
        contract: agent.contract.clone(),
        asset,
        party: alice.address(),
    };
    let holding = agent.ctx.holdings.get(&holding_key).unwrap();
    assert_eq!(holding.frozen_quantity(Timestamp::now()), 50);

    // The network double-spends the freeze response away: its statuses
    // come back out and the applied history forgets it, so a replacement
    // freeze can land cleanly.
    pipeline
        .handle_tx_state(freeze_txid, TxState::Cancelled)
        .await
        .unwrap();
    pipeline.drain().await;

    let holding = agent.ctx.holdings.get(&holding_key).unwrap();
    assert_eq!(holding.frozen_quantity(Timestamp::now()), 0);
    assert!(!holding.was_applied(&freeze_txid));
    assert!(holding.statuses.is_empty());

    // The cache no longer serves the cancelled freeze to thaws.
    assert!(agent.ctx.tx_cache.get(&freeze_txid).is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_transfer_releases_reservations() {
    let source = Arc::new(MemoryTxSource::new());
    // Two contracts, but only the follower runs a pipeline here: it
    // reserves on the transfer and must release when the network cancels
    // it.
    let leader = TestAgent::new(0x53, Arc::clone(&source));
    let follower = TestAgent::new(0x54, Arc::clone(&source));
    let admin = key(0xA1);
    let carol = key(0xCC);

    // The follower owns an asset and Carol holds 50 of it.
    let offer = Action::ContractOffer(ContractOffer {
        terms: ContractTerms {
            contract_name: "F".to_string(),
            contract_permissions: vec![0u8; 21],
            ..ContractTerms::default()
        },
    });
    let request = request_tx(
        &source,
        &[&admin],
        &[(follower.contract.clone(), 60_000)],
        &offer,
    );
    deliver_and_pump(&[&follower], &request);

    let payload =
        covenant_core::protocol::AssetPayload::Currency(covenant_core::protocol::Currency {
            version: 0,
            trading_restriction: [0; 5],
            iso_code: "AUD".to_string(),
            monetary_authority: "Test".to_string(),
            description: String::new(),
        });
    let definition = Action::AssetDefinition(covenant_core::protocol::AssetDefinition {
        terms: covenant_core::protocol::AssetTerms {
            asset_type: "CUR".to_string(),
            asset_permissions: vec![0u8; 7],
            transfers_permitted: true,
            enforcement_orders_permitted: true,
            voting_rights: false,
            vote_multiplier: 0,
            token_qty: 1_000,
            asset_payload: payload.serialize().unwrap(),
        },
    });
    let request = request_tx(
        &source,
        &[&admin],
        &[(follower.contract.clone(), 60_000)],
        &definition,
    );
    let broadcast = deliver_and_pump(&[&follower], &request);
    let (_, action) = find_action(&broadcast, |a| matches!(a, Action::AssetCreation(_))).unwrap();
    let Action::AssetCreation(creation) = action else {
        unreachable!()
    };
    let asset = creation.asset_code;

    let seed = Action::Transfer(Transfer {
        assets: vec![AssetTransfer {
            contract_index: 0,
            asset_type: "CUR".to_string(),
            asset_code: asset,
            senders: vec![TransferSender {
                index: 0,
                quantity: 50,
            }],
            receivers: vec![TransferReceiver {
                address: carol.address(),
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
        &[&admin],
        &[(follower.contract.clone(), 60_000)],
        &seed,
    );
    deliver_and_pump(&[&follower], &request);
    assert_eq!(follower.balance(&asset, &carol.address()), 50);

    // A two-contract transfer where the follower is second: it reserves
    // and waits.
    let transfer = Action::Transfer(Transfer {
        assets: vec![
            AssetTransfer {
                contract_index: 0,
                asset_type: "CUR".to_string(),
                asset_code: covenant_core::bitcoin::Hash32::hash(b"foreign asset"),
                senders: vec![TransferSender {
                    index: 0,
                    quantity: 1,
                }],
                receivers: vec![TransferReceiver {
                    address: key(0xBB).address(),
                    quantity: 1,
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
                asset_code: asset,
                senders: vec![TransferSender {
                    index: 0,
                    quantity: 30,
                }],
                receivers: vec![TransferReceiver {
                    address: key(0xDD).address(),
                    quantity: 30,
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
    let transfer_tx = request_tx(
        &source,
        &[&carol],
        &[
            (leader.contract.clone(), 8_000),
            (follower.contract.clone(), 8_000),
        ],
        &transfer,
    );
    let transfer_txid = transfer_tx.txid();

    let (pipeline, _shutdown) = pipeline_for(&follower);
    assert!(pipeline.handle_tx(transfer_tx).unwrap());
    pipeline
        .handle_tx_state(transfer_txid, TxState::Safe)
        .await
        .unwrap();
    pipeline.drain().await;

    assert_eq!(follower.pending_debits(&asset, &carol.address()), 30);

    // The network double-spends the transfer away.
    pipeline
        .handle_tx_state(transfer_txid, TxState::Cancelled)
        .await
        .unwrap();
    pipeline.drain().await;

    assert_eq!(follower.pending_debits(&asset, &carol.address()), 0);
    assert!(follower
        .ctx
        .repos
        .transfer(&follower.contract, &transfer_txid)
        .is_err());
}
