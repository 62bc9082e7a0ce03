//! Message handling: the settlement boomerang hops and rejection
//! observation.
//!
//! `M01` messages between agents carry the multi-contract transfer
//! plumbing: SettlementRequest hops travel leader → last adding rows, and
//! SignatureRequest hops travel back collecting SIGHASH-ALL signatures
//! until the leader broadcasts.

use tracing::{debug, info, warn};

use covenant_core::bitcoin::{
    push_data, signature_hash, Address, SigHashCache, SigHashType, Transaction,
};
use covenant_core::protocol::{
    self, Action, Message, MessagePayload, RejectCode, Settlement, SettlementRequest,
    SignatureRequest, Transfer,
};

use crate::builder::ResponseOutput;
use crate::inspector::InspectorTx;
use crate::state::TransferState;
use crate::store::StoreError;

use super::transfer::{compose_rows, participants, Participant};
use super::{reject, HandlerContext, HandlerError, HandlerResponse};

/// Handles `M01` Message requests addressed to this contract.
pub fn process_message(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<Option<HandlerResponse>, HandlerError> {
    if let Some(code) = itx.reject_code {
        return Err(reject(code, "message failed codec validation"));
    }

    let Some(Action::Message(message)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a message"));
    };

    let payload = MessagePayload::deserialize(message.message_code, &message.message_payload)
        .map_err(|e| reject(RejectCode::MsgMalformed, format!("bad message payload: {e}")))?;

    match payload {
        MessagePayload::SettlementRequest(request) => {
            handle_settlement_request(ctx, itx, contract_address, &request)
        }
        MessagePayload::SignatureRequest(request) => {
            handle_signature_request(ctx, itx, contract_address, &request)
        }
        MessagePayload::Public(m) => {
            info!(contract = %contract_address, "public message: {}", m.public_message);
            Ok(None)
        }
        MessagePayload::Private(_) | MessagePayload::Offer(_) => {
            debug!(contract = %contract_address, code = message.message_code, "message noted");
            Ok(None)
        }
    }
}

/// The transfer behind a boomerang hop, revalidated from the cache.
fn load_transfer_leg(
    ctx: &HandlerContext,
    contract_address: &Address,
    transfer_tx_id: &covenant_core::bitcoin::Hash32,
) -> Result<(InspectorTx, Transfer, Vec<Participant>, usize), HandlerError> {
    let transfer_itx = ctx
        .tx_cache
        .get(transfer_tx_id)
        .map_err(|_| reject(RejectCode::MsgMalformed, "transfer tx not known"))?;
    let Some(Action::Transfer(transfer)) = transfer_itx.action.clone() else {
        return Err(reject(RejectCode::MsgMalformed, "ref tx is not a transfer"));
    };
    let list = participants(&transfer_itx, &transfer)?;
    let position = list
        .iter()
        .position(|p| p.address == *contract_address)
        .ok_or_else(|| {
            reject(
                RejectCode::UnknownAddress,
                "this contract is not a transfer participant",
            )
        })?;
    Ok((transfer_itx, transfer, list, position))
}

fn parse_embedded_settlement(
    data: &[u8],
) -> Result<(Transaction, Settlement), HandlerError> {
    let tx = Transaction::from_bytes(data)
        .map_err(|_| reject(RejectCode::MsgMalformed, "embedded settlement unparsable"))?;
    let last = tx
        .outputs
        .last()
        .ok_or_else(|| reject(RejectCode::MsgMalformed, "settlement has no outputs"))?;
    // The data output's protocol id follows the daemon's test flag; try
    // both to stay tolerant during verification.
    let action = protocol::deserialize(&last.lock_script, true)
        .or_else(|_| protocol::deserialize(&last.lock_script, false))
        .map_err(|_| reject(RejectCode::MsgMalformed, "settlement data output missing"))?;
    let Action::Settlement(settlement) = action else {
        return Err(reject(
            RejectCode::MsgMalformed,
            "settlement data output is not a settlement",
        ));
    };
    Ok((tx, settlement))
}

fn handle_settlement_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
    request: &SettlementRequest,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let (transfer_itx, transfer, list, position) =
        load_transfer_leg(ctx, contract_address, &request.transfer_tx_id)?;

    let mut pending = ctx
        .repos
        .transfer(contract_address, &request.transfer_tx_id)
        .map_err(|_| {
            reject(
                RejectCode::MsgMalformed,
                "no reservation for this transfer",
            )
        })?;
    if pending.state != TransferState::AwaitingSettlementRequest {
        debug!(transfer = %request.transfer_tx_id, state = %pending.state, "settlement request replayed; ignored");
        return Ok(None);
    }

    let (mut settlement_tx, mut settlement) = parse_embedded_settlement(&request.settlement)?;

    // The candidate must spend the transfer's contract outputs, one per
    // participant, in order.
    if settlement_tx.inputs.len() != list.len()
        || !settlement_tx
            .inputs
            .iter()
            .all(|i| i.previous_output.txid == transfer_itx.txid)
    {
        return Err(reject(
            RejectCode::MsgMalformed,
            "settlement does not spend the transfer",
        ));
    }
    for (input, participant) in settlement_tx.inputs.iter().zip(&list) {
        if input.previous_output.index != participant.t_output_index {
            return Err(reject(
                RejectCode::MsgMalformed,
                "settlement inputs out of participant order",
            ));
        }
    }

    // Every asset owned by an earlier contract must already carry rows.
    for asset in &transfer.assets {
        let owner = transfer_itx
            .output_at(u32::from(asset.contract_index))
            .map(|o| o.address.clone());
        let Some(owner) = owner else { continue };
        let owner_position = list.iter().position(|p| p.address == owner);
        if owner_position.is_some_and(|p| p < position)
            && !settlement
                .assets
                .iter()
                .any(|row| row.asset_code == asset.asset_code)
        {
            return Err(reject(
                RejectCode::MsgMalformed,
                "settlement request is missing earlier rows",
            ));
        }
    }

    // Add this contract's rows: strip the data output, append our dust
    // outputs, re-append the grown settlement.
    settlement_tx.outputs.pop();
    let existing = settlement_tx.outputs.len();
    let (new_outputs, new_rows) =
        compose_rows(ctx, contract_address, &transfer_itx, &transfer, existing)?;
    for output in &new_outputs {
        settlement_tx.outputs.push(
            covenant_core::bitcoin::TxOutput {
                value: ctx.fees.dust_limit,
                lock_script: output.address.locking_script(),
            },
        );
    }
    settlement.assets.extend(new_rows);
    settlement.timestamp = ctx.now();
    settlement_tx.outputs.push(covenant_core::bitcoin::TxOutput {
        value: 0,
        lock_script: protocol::serialize(&Action::Settlement(settlement), ctx.is_test)?,
    });

    let last = position == list.len() - 1;
    if last {
        // Sign our input; the boomerang turns around.
        sign_own_input(ctx, &mut settlement_tx, contract_address, &transfer_itx, &list, position)?;
    }

    pending.state = TransferState::AwaitingSignatures;
    pending.settlement_request = Some(settlement_tx.serialize());
    pending.updated_at = ctx.now();
    ctx.repos.save_transfer(contract_address, &pending)?;

    let (target, payload) = if last {
        let previous = &list[position - 1];
        info!(contract = %contract_address, transfer = %request.transfer_tx_id, "settlement complete; collecting signatures");
        (
            previous.address.clone(),
            MessagePayload::SignatureRequest(SignatureRequest {
                version: 0,
                timestamp: ctx.now(),
                payload: settlement_tx.serialize(),
            }),
        )
    } else {
        let next = &list[position + 1];
        info!(contract = %contract_address, transfer = %request.transfer_tx_id, next = %next.address, "forwarding settlement request");
        (
            next.address.clone(),
            MessagePayload::SettlementRequest(SettlementRequest {
                version: 0,
                timestamp: ctx.now(),
                transfer_tx_id: request.transfer_tx_id,
                contract_fees: request.contract_fees.clone(),
                settlement: settlement_tx.serialize(),
            }),
        )
    };

    Ok(Some(HandlerResponse {
        action: Action::Message(Message {
            sender_indexes: Vec::new(),
            receiver_indexes: vec![0],
            message_code: payload.code(),
            message_payload: payload.serialize()?,
        }),
        outputs: vec![ResponseOutput {
            address: target,
            value: forwarding_budget(ctx, itx, contract_address),
        }],
        change: Some(contract_address.clone()),
        exclude_outputs: Vec::new(),
    }))
}

fn handle_signature_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
    request: &SignatureRequest,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let (mut settlement_tx, settlement) = parse_embedded_settlement(&request.payload)?;

    let transfer_tx_id = settlement_tx
        .inputs
        .first()
        .map(|i| i.previous_output.txid)
        .ok_or_else(|| reject(RejectCode::MsgMalformed, "settlement has no inputs"))?;

    let (transfer_itx, transfer, list, position) =
        load_transfer_leg(ctx, contract_address, &transfer_tx_id)?;

    let mut pending = ctx
        .repos
        .transfer(contract_address, &transfer_tx_id)
        .map_err(|_| reject(RejectCode::MsgMalformed, "no reservation for this transfer"))?;

    // Verify our rows were not tampered with on the way around.
    verify_own_rows(ctx, contract_address, &transfer_itx, &transfer, &settlement_tx, &settlement)?;

    sign_own_input(ctx, &mut settlement_tx, contract_address, &transfer_itx, &list, position)?;

    pending.state = TransferState::AwaitingSignatures;
    pending.settlement_request = Some(settlement_tx.serialize());
    pending.updated_at = ctx.now();
    ctx.repos.save_transfer(contract_address, &pending)?;

    if position == 0 {
        // Leader: every input is signed; release the settlement.
        if settlement_tx.inputs.iter().any(|i| i.sig_script.is_empty()) {
            return Err(reject(
                RejectCode::MsgMalformed,
                "signature request reached the leader unsigned",
            ));
        }
        info!(contract = %contract_address, transfer = %transfer_tx_id, "broadcasting settlement");
        ctx.broadcaster.broadcast(&settlement_tx)?;
        return Ok(None);
    }

    let previous = &list[position - 1];
    info!(contract = %contract_address, transfer = %transfer_tx_id, previous = %previous.address, "forwarding signature request");
    let payload = MessagePayload::SignatureRequest(SignatureRequest {
        version: 0,
        timestamp: ctx.now(),
        payload: settlement_tx.serialize(),
    });
    Ok(Some(HandlerResponse {
        action: Action::Message(Message {
            sender_indexes: Vec::new(),
            receiver_indexes: vec![0],
            message_code: payload.code(),
            message_payload: payload.serialize()?,
        }),
        outputs: vec![ResponseOutput {
            address: previous.address.clone(),
            value: forwarding_budget(ctx, itx, contract_address),
        }],
        change: Some(contract_address.clone()),
        exclude_outputs: Vec::new(),
    }))
}

/// How much a hop response forwards: everything the incoming message paid
/// us, minus a fee margin.
fn forwarding_budget(ctx: &HandlerContext, itx: &InspectorTx, contract_address: &Address) -> u64 {
    let received: u64 = itx
        .outputs
        .iter()
        .filter(|o| o.address == *contract_address)
        .map(|o| o.value)
        .sum();
    let margin = 2_000 + ctx.fees.dust_limit;
    received.saturating_sub(margin).max(ctx.fees.dust_limit)
}

/// Signs this contract's settlement input (SIGHASH ALL with FORKID).
fn sign_own_input(
    ctx: &HandlerContext,
    settlement_tx: &mut Transaction,
    contract_address: &Address,
    transfer_itx: &InspectorTx,
    list: &[Participant],
    position: usize,
) -> Result<(), HandlerError> {
    let participant = &list[position];
    let funding = transfer_itx
        .output_at(participant.t_output_index)
        .ok_or_else(|| {
            HandlerError::Fatal("transfer output backing the settlement input missing".to_string())
        })?;

    let key = ctx.key(contract_address)?;
    let lock_script = contract_address.locking_script();
    let hash_type = SigHashType::ALL.with(SigHashType::FORK_ID);
    let mut cache = SigHashCache::new();
    let digest = signature_hash(
        settlement_tx,
        position,
        &lock_script,
        funding.value,
        hash_type,
        &mut cache,
    )
    .ok_or_else(|| HandlerError::Fatal("settlement input index out of range".to_string()))?;

    let signature = key
        .sign(&digest)
        .map_err(|e| HandlerError::Fatal(format!("settlement signing failed: {e}")))?;
    let mut sig_bytes = signature.to_der();
    sig_bytes.push(hash_type.0 as u8);
    let pubkey = key.public_key().to_bytes();

    let mut script = Vec::with_capacity(sig_bytes.len() + pubkey.len() + 4);
    script.extend(push_data(sig_bytes.len()));
    script.extend_from_slice(&sig_bytes);
    script.extend(push_data(pubkey.len()));
    script.extend_from_slice(&pubkey);
    settlement_tx.inputs[position].sig_script = script;
    Ok(())
}

/// Checks that the rows for this contract's assets match what it would
/// compose itself.
fn verify_own_rows(
    ctx: &HandlerContext,
    contract_address: &Address,
    transfer_itx: &InspectorTx,
    transfer: &Transfer,
    settlement_tx: &Transaction,
    settlement: &Settlement,
) -> Result<(), HandlerError> {
    for asset_transfer in &transfer.assets {
        let ours = transfer_itx
            .output_at(u32::from(asset_transfer.contract_index))
            .is_some_and(|o| o.address == *contract_address);
        if !ours {
            continue;
        }

        let row = settlement
            .assets
            .iter()
            .find(|row| row.asset_code == asset_transfer.asset_code)
            .ok_or_else(|| {
                reject(RejectCode::MsgMalformed, "settlement dropped this contract's rows")
            })?;

        for entry in &row.settlements {
            let output = settlement_tx.outputs.get(entry.index as usize).ok_or_else(|| {
                reject(RejectCode::MsgMalformed, "settlement row index out of range")
            })?;
            let party = Address::from_locking_script(&output.lock_script, ctx.net)
                .map_err(|_| reject(RejectCode::MsgMalformed, "settlement row pays no address"))?;

            let holding = ctx.holdings.get(&crate::holdings::HoldingKey {
                contract: contract_address.clone(),
                asset: asset_transfer.asset_code,
                party: party.clone(),
            })?;
            let pending_key = transfer_itx.txid.to_string();
            let debit = holding
                .pending_debits
                .get(&pending_key)
                .map(|e| e.amount)
                .unwrap_or(0);
            let credit = holding
                .pending_credits
                .get(&pending_key)
                .map(|e| e.amount)
                .unwrap_or(0);
            let expected = (holding.finalized_balance + credit).saturating_sub(debit);

            if entry.quantity != expected {
                warn!(
                    contract = %contract_address,
                    party = %party,
                    expected,
                    got = entry.quantity,
                    "settlement row mismatch"
                );
                return Err(reject(
                    RejectCode::MsgMalformed,
                    "settlement row balance tampered",
                ));
            }
        }
    }
    Ok(())
}

/// Commits an observed `M02` Rejection: a rejection of a transfer this
/// agent tracks releases its reservations.
pub fn process_rejection(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::Rejection(rejection)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a rejection"));
    };

    for input in &itx.inputs {
        let request_tx_id = input.outpoint.txid;
        match ctx.repos.transfer(contract_address, &request_tx_id) {
            Ok(_) => {
                warn!(
                    contract = %contract_address,
                    transfer = %request_tx_id,
                    code = rejection.rejection_code,
                    "transfer rejected by a participant"
                );
                super::transfer::abort_transfer(ctx, contract_address, &request_tx_id)?;
            }
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
