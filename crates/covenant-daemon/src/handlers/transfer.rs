//! The transfer coordinator.
//!
//! A transfer names one or more assets, each with an authoritative
//! contract. When a single contract covers every asset the agent settles
//! in one shot. When several contracts participate the settlement is a
//! multi-party atomic swap built as a boomerang:
//!
//! ```text
//! leader ──SettlementRequest──▶ follower ──…──▶ last
//!                                                │ signs own input
//! leader ◀──SignatureRequest── follower ◀──…─────┘
//!   │ signs, broadcasts Settlement
//!   ▼
//! chain confirms; every agent commits its rows
//! ```
//!
//! Every agent reserves balances the moment it validates the transfer and
//! schedules a timeout that releases the reservations and emits a
//! `TimedOut` rejection exactly once if the settlement never lands.
//!
//! The settlement candidate spends the transfer tx's contract outputs, so
//! every collected signature binds to the transfer's hash.

use std::collections::BTreeMap;

use tracing::{info, warn};

use covenant_core::bitcoin::{Address, Hash32, OutPoint, Transaction, TxInput, TxOutput};
use covenant_core::protocol::{
    self, transfer_oracle_sig_hash, Action, AssetSettlement, Message, MessagePayload,
    QuantityIndex, RejectCode, Settlement, SettlementRequest, Timestamp, Transfer,
};

use crate::builder::ResponseOutput;
use crate::holdings::HoldingKey;
use crate::inspector::InspectorTx;
use crate::scheduler::Job;
use crate::scheduler::JobPayload;
use crate::state::{PendingEntry, PendingTransfer, Reservation, TransferState};
use crate::store::StoreError;

use super::{contract_preamble, emit_rejection, reject, HandlerContext, HandlerError, HandlerResponse};

/// A participating contract: its address and the transfer-tx output that
/// both funds and identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Contract address.
    pub address: Address,
    /// Transfer-tx output index paying this contract.
    pub t_output_index: u32,
}

/// Resolves the ordered, de-duplicated participating contracts.
pub fn participants(
    itx: &InspectorTx,
    transfer: &Transfer,
) -> Result<Vec<Participant>, HandlerError> {
    let mut list: Vec<Participant> = Vec::new();
    for asset in &transfer.assets {
        let output = itx
            .output_at(u32::from(asset.contract_index))
            .ok_or_else(|| {
                reject(
                    RejectCode::MsgMalformed,
                    "transfer contract index out of range",
                )
            })?;
        if !list.iter().any(|p| p.address == output.address) {
            list.push(Participant {
                address: output.address.clone(),
                t_output_index: output.index,
            });
        }
    }
    Ok(list)
}

/// Handles `T01` Transfer.
///
/// Validates and reserves the local legs, then either settles (single
/// contract), starts the boomerang (leader), or waits for the settlement
/// request (follower).
pub fn transfer_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let contract = contract_preamble(ctx, itx, contract_address, false)?;

    let Some(Action::Transfer(transfer)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a transfer"));
    };

    let now = ctx.now();
    if !transfer.offer_expiry.is_zero() && transfer.offer_expiry < now {
        return Err(reject(RejectCode::MsgMalformed, "transfer offer expired"));
    }

    // Re-delivery of a transfer already reserved is a no-op.
    match ctx.repos.transfer(contract_address, &itx.txid) {
        Ok(_) => return Ok(None),
        Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    let participants = participants(itx, transfer)?;
    let our_position = participants
        .iter()
        .position(|p| p.address == *contract_address)
        .ok_or_else(|| {
            reject(
                RejectCode::UnknownAddress,
                "transfer does not involve this contract",
            )
        })?;
    let is_leader = our_position == 0;

    let reservations = validate_and_reserve(ctx, &contract, itx, transfer, now)?;

    // The transfer tx funds the settlement and the timeout rejection.
    ctx.tx_cache.save(itx)?;

    let timeout = now.plus_secs(ctx.transfer_timeout_secs);
    let mut pending = PendingTransfer {
        transfer_tx_id: itx.txid,
        timeout,
        state: TransferState::Reserved,
        is_leader,
        reservations,
        settlement_request: None,
        oracle_sigs: Vec::new(),
        created_at: now,
        updated_at: now,
    };

    ctx.scheduler
        .schedule(Job {
            id: Job::transfer_id(&itx.txid),
            contract: contract_address.clone(),
            due: timeout,
            payload: JobPayload::TransferTimeout {
                transfer_tx_id: itx.txid,
            },
        })
        .map_err(|e| HandlerError::Fatal(format!("cannot schedule transfer timeout: {e}")))?;

    if participants.len() == 1 {
        // Degenerate case: leader and last in one; settle immediately.
        let (outputs, rows) = compose_rows(ctx, contract_address, itx, transfer, 0)?;
        pending.state = TransferState::AwaitingSignatures;
        ctx.repos.save_transfer(contract_address, &pending)?;

        info!(contract = %contract_address, transfer = %itx.txid, "settling single-contract transfer");
        return Ok(Some(HandlerResponse {
            action: Action::Settlement(Settlement {
                assets: rows,
                timestamp: now,
            }),
            outputs,
            change: Some(contract_address.clone()),
            exclude_outputs: Vec::new(),
        }));
    }

    if is_leader {
        let settlement_tx =
            compose_leader_settlement(ctx, contract_address, itx, transfer, &participants, now)?;
        let next = &participants[1];

        let payload = MessagePayload::SettlementRequest(SettlementRequest {
            version: 0,
            timestamp: now,
            transfer_tx_id: itx.txid,
            contract_fees: Vec::new(),
            settlement: settlement_tx.serialize(),
        });

        pending.state = TransferState::AwaitingSignatures;
        pending.settlement_request = Some(settlement_tx.serialize());
        ctx.repos.save_transfer(contract_address, &pending)?;

        info!(
            contract = %contract_address,
            transfer = %itx.txid,
            next = %next.address,
            "forwarding settlement request"
        );

        // The settlement-bound outputs stay unspent for the settlement
        // itself.
        let exclude: Vec<u32> = participants.iter().map(|p| p.t_output_index).collect();
        return Ok(Some(HandlerResponse {
            action: Action::Message(Message {
                sender_indexes: Vec::new(),
                receiver_indexes: vec![0],
                message_code: payload.code(),
                message_payload: payload.serialize()?,
            }),
            outputs: vec![ResponseOutput {
                address: next.address.clone(),
                value: hop_funding(ctx, participants.len()),
            }],
            change: Some(contract_address.clone()),
            exclude_outputs: exclude,
        }));
    }

    // Follower: hold the reservations until the settlement request hop
    // arrives.
    pending.state = TransferState::AwaitingSettlementRequest;
    ctx.repos.save_transfer(contract_address, &pending)?;
    info!(contract = %contract_address, transfer = %itx.txid, "reserved; awaiting settlement request");
    Ok(None)
}

/// Satoshis a boomerang hop forwards so every later hop stays funded.
fn hop_funding(ctx: &HandlerContext, participant_count: usize) -> u64 {
    let hops = participant_count.saturating_mul(2) as u64;
    ctx.fees.dust_limit * 4 * hops + 2_000 * hops
}

/// Validates the local legs of a transfer and attaches the reservations.
///
/// Validation of every local asset completes before any reservation is
/// written, so a rejection never leaves partial reservations behind.
fn validate_and_reserve(
    ctx: &HandlerContext,
    contract: &crate::state::Contract,
    itx: &InspectorTx,
    transfer: &Transfer,
    now: Timestamp,
) -> Result<Vec<Reservation>, HandlerError> {
    let contract_address = &contract.address;
    let mut planned: Vec<Reservation> = Vec::new();

    for asset_transfer in &transfer.assets {
        let authoritative = itx
            .output_at(u32::from(asset_transfer.contract_index))
            .is_some_and(|o| o.address == *contract_address);
        if !authoritative {
            continue;
        }

        let asset = match ctx.repos.asset(contract_address, &asset_transfer.asset_code) {
            Ok(asset) => asset,
            Err(StoreError::NotFound) => {
                return Err(reject(RejectCode::AssetNotFound, "asset not found"))
            }
            Err(e) => return Err(e.into()),
        };

        if !asset.transfers_permitted {
            return Err(reject(
                RejectCode::AssetNotPermitted,
                "asset does not permit transfers",
            ));
        }
        if asset.freeze_period > now {
            return Err(reject(RejectCode::Frozen, "asset frozen"));
        }

        // Duplicate sender inputs aggregate for the reservation.
        let mut sender_totals: BTreeMap<String, (Address, u64)> = BTreeMap::new();
        let mut sent_total = 0u64;
        for sender in &asset_transfer.senders {
            let input = itx.inputs.get(sender.index as usize).ok_or_else(|| {
                reject(RejectCode::MsgMalformed, "sender input index out of range")
            })?;
            if sender.quantity == 0 {
                return Err(reject(RejectCode::MsgMalformed, "zero-quantity sender"));
            }
            let entry = sender_totals
                .entry(input.address.encode())
                .or_insert_with(|| (input.address.clone(), 0));
            entry.1 += sender.quantity;
            sent_total += sender.quantity;
        }

        let mut received_total = 0u64;
        for receiver in &asset_transfer.receivers {
            if receiver.quantity == 0 {
                return Err(reject(RejectCode::ReceiverUnspecified, "zero-quantity receiver"));
            }
            received_total += receiver.quantity;
        }
        if sent_total != received_total {
            return Err(reject(
                RejectCode::MsgMalformed,
                "sender and receiver quantities differ",
            ));
        }

        // Sending everything back to yourself is not a transfer.
        let receiver_set: Vec<String> = asset_transfer
            .receivers
            .iter()
            .map(|r| r.address.encode())
            .collect();
        if sender_totals.keys().all(|s| receiver_set.contains(s))
            && receiver_set.iter().all(|r| sender_totals.contains_key(r))
        {
            return Err(reject(RejectCode::TransferSelf, "transfer to self"));
        }

        // Oracle attestations.
        for receiver in &asset_transfer.receivers {
            if !receiver.has_oracle_sig() {
                continue;
            }
            verify_receiver_oracle(
                ctx,
                contract,
                &asset_transfer.asset_code,
                receiver,
                now,
            )?;
        }

        // Balance checks against spendable (net of freezes and pending
        // debits).
        for (_, (address, quantity)) in &sender_totals {
            let key = HoldingKey {
                contract: contract_address.clone(),
                asset: asset_transfer.asset_code,
                party: address.clone(),
            };
            let holding = ctx.holdings.get(&key)?;
            if holding.spendable(now) < *quantity {
                return Err(reject(
                    RejectCode::InsufficientAssets,
                    format!("sender {address} holds too little"),
                ));
            }
        }

        for (_, (address, quantity)) in sender_totals {
            planned.push(Reservation {
                asset_code: asset_transfer.asset_code,
                party: address,
                amount: quantity,
                is_debit: true,
            });
        }
        for receiver in &asset_transfer.receivers {
            planned.push(Reservation {
                asset_code: asset_transfer.asset_code,
                party: receiver.address.clone(),
                amount: receiver.quantity,
                is_debit: false,
            });
        }
    }

    if planned.is_empty() {
        return Err(reject(
            RejectCode::UnknownAddress,
            "no local asset in this transfer",
        ));
    }

    // Every check passed; attach the reservations.
    let tx_key = itx.txid.to_string();
    for reservation in &planned {
        let key = HoldingKey {
            contract: contract_address.clone(),
            asset: reservation.asset_code,
            party: reservation.party.clone(),
        };
        let mut holding = ctx.holdings.get(&key)?;
        if reservation.is_debit {
            holding.pending_debits.insert(
                tx_key.clone(),
                PendingEntry {
                    amount: reservation.amount,
                    timestamp: now,
                },
            );
        } else {
            let entry = holding
                .pending_credits
                .entry(tx_key.clone())
                .or_insert(PendingEntry {
                    amount: 0,
                    timestamp: now,
                });
            entry.amount += reservation.amount;
        }
        holding.updated_at = now;
        ctx.holdings.put(key, holding);
    }

    Ok(planned)
}

fn verify_receiver_oracle(
    ctx: &HandlerContext,
    contract: &crate::state::Contract,
    asset_code: &Hash32,
    receiver: &covenant_core::protocol::TransferReceiver,
    now: Timestamp,
) -> Result<(), HandlerError> {
    if receiver.oracle_sig_algorithm != 1 {
        return Err(reject(
            RejectCode::InvalidSignature,
            "unknown oracle signature algorithm",
        ));
    }
    let oracle = contract
        .oracles
        .get(receiver.oracle_index as usize)
        .ok_or_else(|| reject(RejectCode::InvalidSignature, "oracle index out of range"))?;
    let key = covenant_core::bitcoin::PublicKey::from_bytes(&oracle.public_key)
        .map_err(|_| reject(RejectCode::InvalidSignature, "registered oracle key invalid"))?;

    if !receiver.oracle_sig_expiry.is_zero() && receiver.oracle_sig_expiry < now {
        return Err(reject(RejectCode::InvalidSignature, "attestation expired"));
    }

    let tip = ctx.headers.tip_height();
    if receiver.oracle_sig_block_height + ctx.oracle_recency_blocks < tip {
        return Err(reject(
            RejectCode::InvalidSignature,
            "attestation block hash too old",
        ));
    }
    let block_hash = ctx
        .headers
        .hash(receiver.oracle_sig_block_height)
        .map_err(|_| reject(RejectCode::InvalidSignature, "attestation block unknown"))?;

    let digest = transfer_oracle_sig_hash(
        &contract.address,
        asset_code,
        &receiver.address,
        &block_hash,
        receiver.oracle_sig_expiry,
        true,
    );
    let signature = covenant_core::bitcoin::Signature::from_der(&receiver.oracle_confirmation_sig)
        .map_err(|_| reject(RejectCode::InvalidSignature, "attestation not DER"))?;
    if !key.verify(&digest, &signature) {
        return Err(reject(
            RejectCode::InvalidSignature,
            "attestation does not verify",
        ));
    }
    Ok(())
}

/// Computes this contract's settlement rows and the dust outputs backing
/// them.
///
/// `existing_outputs` is how many non-data outputs the settlement already
/// carries; new outputs are appended after them.
pub fn compose_rows(
    ctx: &HandlerContext,
    contract_address: &Address,
    itx: &InspectorTx,
    transfer: &Transfer,
    existing_outputs: usize,
) -> Result<(Vec<ResponseOutput>, Vec<AssetSettlement>), HandlerError> {
    let mut outputs: Vec<ResponseOutput> = Vec::new();
    let mut rows = Vec::new();

    for asset_transfer in &transfer.assets {
        let authoritative = itx
            .output_at(u32::from(asset_transfer.contract_index))
            .is_some_and(|o| o.address == *contract_address);
        if !authoritative {
            continue;
        }

        // Net balance change per party.
        let mut deltas: BTreeMap<String, (Address, i128)> = BTreeMap::new();
        for sender in &asset_transfer.senders {
            let input = itx.inputs.get(sender.index as usize).ok_or_else(|| {
                reject(RejectCode::MsgMalformed, "sender input index out of range")
            })?;
            let entry = deltas
                .entry(input.address.encode())
                .or_insert_with(|| (input.address.clone(), 0));
            entry.1 -= i128::from(sender.quantity);
        }
        for receiver in &asset_transfer.receivers {
            let entry = deltas
                .entry(receiver.address.encode())
                .or_insert_with(|| (receiver.address.clone(), 0));
            entry.1 += i128::from(receiver.quantity);
        }

        let mut settlements = Vec::new();
        for (_, (address, delta)) in deltas {
            let holding = ctx.holdings.get(&HoldingKey {
                contract: contract_address.clone(),
                asset: asset_transfer.asset_code,
                party: address.clone(),
            })?;
            let new_balance = i128::from(holding.finalized_balance) + delta;
            if new_balance < 0 {
                return Err(reject(
                    RejectCode::InsufficientAssets,
                    format!("settlement would take {address} negative"),
                ));
            }

            let output_index = (existing_outputs + outputs.len()) as u16;
            outputs.push(ResponseOutput {
                address,
                value: 0,
            });
            settlements.push(QuantityIndex {
                index: output_index,
                quantity: new_balance as u64,
            });
        }

        rows.push(AssetSettlement {
            contract_index: asset_transfer.contract_index,
            asset_type: asset_transfer.asset_type.clone(),
            asset_code: asset_transfer.asset_code,
            settlements,
        });
    }

    Ok((outputs, rows))
}

/// Builds the leader's settlement candidate: inputs spending the transfer
/// tx's contract outputs (in participant order), the leader's dust
/// outputs, and the partial settlement data output last.
fn compose_leader_settlement(
    ctx: &HandlerContext,
    contract_address: &Address,
    itx: &InspectorTx,
    transfer: &Transfer,
    participants: &[Participant],
    now: Timestamp,
) -> Result<Transaction, HandlerError> {
    let mut tx = Transaction::new();
    for participant in participants {
        tx.inputs.push(TxInput::new(OutPoint {
            txid: itx.txid,
            index: participant.t_output_index,
        }));
    }

    let (outputs, rows) = compose_rows(ctx, contract_address, itx, transfer, 0)?;
    for output in &outputs {
        tx.outputs.push(TxOutput {
            value: ctx.fees.dust_limit,
            lock_script: output.address.locking_script(),
        });
    }

    let settlement = Settlement {
        assets: rows,
        timestamp: now,
    };
    tx.outputs.push(TxOutput {
        value: 0,
        lock_script: protocol::serialize(&Action::Settlement(settlement), ctx.is_test)?,
    });

    Ok(tx)
}

/// Commits `T02` Settlement: applies this contract's rows and clears the
/// reservation bookkeeping.
pub fn settlement_response(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::Settlement(settlement)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a settlement"));
    };

    // The settlement spends the transfer tx's contract outputs.
    let transfer_tx_id = itx
        .inputs
        .first()
        .map(|i| i.outpoint.txid)
        .ok_or_else(|| HandlerError::Fatal("settlement has no inputs".to_string()))?;

    let now = ctx.now();
    let pending_key = transfer_tx_id.to_string();

    for row in &settlement.assets {
        // Only rows whose asset this contract owns apply here.
        if ctx.repos.asset(contract_address, &row.asset_code).is_err() {
            continue;
        }

        for entry in &row.settlements {
            let output = itx.output_at(u32::from(entry.index)).ok_or_else(|| {
                HandlerError::Fatal("settlement row index out of range".to_string())
            })?;
            let key = HoldingKey {
                contract: contract_address.clone(),
                asset: row.asset_code,
                party: output.address.clone(),
            };
            let mut holding = ctx.holdings.get(&key)?;
            if holding.was_applied(&itx.txid) {
                continue;
            }
            holding.finalized_balance = entry.quantity;
            holding.pending_debits.remove(&pending_key);
            holding.pending_credits.remove(&pending_key);
            holding.mark_applied(itx.txid);
            holding.updated_at = now;
            ctx.holdings.put(key, holding);
        }
    }

    // The pending transfer is settled exactly once.
    match ctx.repos.transfer(contract_address, &transfer_tx_id) {
        Ok(_) => {
            ctx.repos.remove_transfer(contract_address, &transfer_tx_id)?;
            ctx.scheduler.cancel(&Job::transfer_id(&transfer_tx_id)).ok();
        }
        Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    info!(contract = %contract_address, transfer = %transfer_tx_id, "settlement committed");
    Ok(())
}

/// Runs the scheduled transfer timeout: emits a `TimedOut` rejection and
/// releases the reservations, exactly once.
pub fn transfer_timeout(
    ctx: &HandlerContext,
    contract_address: &Address,
    transfer_tx_id: &Hash32,
) -> Result<(), HandlerError> {
    let pending = match ctx.repos.transfer(contract_address, transfer_tx_id) {
        Ok(pending) => pending,
        Err(StoreError::NotFound) => return Ok(()), // settled or already aborted
        Err(e) => return Err(e.into()),
    };

    warn!(contract = %contract_address, transfer = %transfer_tx_id, state = %pending.state, "transfer timed out");

    release_reservations(ctx, contract_address, &pending)?;
    ctx.repos.remove_transfer(contract_address, transfer_tx_id)?;

    if let Ok(transfer_tx) = ctx.tx_cache.get(transfer_tx_id) {
        emit_rejection(
            ctx,
            &transfer_tx,
            contract_address,
            RejectCode::TimedOut,
            "settlement did not arrive before the timeout",
        )?;
    }

    Ok(())
}

/// Releases every pending credit/debit a transfer attached.
pub fn release_reservations(
    ctx: &HandlerContext,
    contract_address: &Address,
    pending: &PendingTransfer,
) -> Result<(), HandlerError> {
    let key = pending.transfer_tx_id.to_string();
    let now = ctx.now();
    for reservation in &pending.reservations {
        let holding_key = HoldingKey {
            contract: contract_address.clone(),
            asset: reservation.asset_code,
            party: reservation.party.clone(),
        };
        let mut holding = ctx.holdings.get(&holding_key)?;
        if reservation.is_debit {
            holding.pending_debits.remove(&key);
        } else {
            holding.pending_credits.remove(&key);
        }
        holding.updated_at = now;
        ctx.holdings.put(holding_key, holding);
    }
    Ok(())
}

/// Aborts a pending transfer whose request was cancelled or reverted by
/// the network.
pub fn abort_transfer(
    ctx: &HandlerContext,
    contract_address: &Address,
    transfer_tx_id: &Hash32,
) -> Result<(), HandlerError> {
    let pending = match ctx.repos.transfer(contract_address, transfer_tx_id) {
        Ok(pending) => pending,
        Err(StoreError::NotFound) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    release_reservations(ctx, contract_address, &pending)?;
    ctx.repos.remove_transfer(contract_address, transfer_tx_id)?;
    ctx.scheduler.cancel(&Job::transfer_id(transfer_tx_id)).ok();
    info!(contract = %contract_address, transfer = %transfer_tx_id, "transfer aborted; reservations released");
    Ok(())
}
