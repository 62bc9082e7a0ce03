//! Enforcement orders: Freeze, Thaw, Confiscation, Reconciliation.
//!
//! An `E01` Order carries the compliance action; the matching response
//! (`E02`..`E05`) is what actually mutates holdings when it commits.
//! Contract-wide freezes are encoded as a zero asset code with the
//! contract address as the single target.

use tracing::{info, warn};

use covenant_core::bitcoin::{Address, PublicKey, Signature};
use covenant_core::protocol::{
    order_authority_sig_hash, Action, Confiscation, Freeze, Order, QuantityIndex, Reconciliation,
    RejectCode, Thaw, Timestamp, COMPLIANCE_CONFISCATION, COMPLIANCE_FREEZE,
    COMPLIANCE_RECONCILIATION, COMPLIANCE_THAW,
};

use crate::builder::ResponseOutput;
use crate::holdings::HoldingKey;
use crate::inspector::InspectorTx;
use crate::state::{HoldingStatus, HOLDING_STATUS_FREEZE};
use crate::store::StoreError;

use super::{contract_preamble, reject, HandlerContext, HandlerError, HandlerResponse};

/// Handles `E01` Order, dispatching on the compliance action.
pub fn order_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let _contract = contract_preamble(ctx, itx, contract_address, true)?;

    let Some(Action::Order(order)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not an order"));
    };

    // Authority signature, when present, must verify over the order
    // digest.
    if !order.authority_public_key.is_empty() {
        if order.signature_algorithm != 1 {
            return Err(reject(
                RejectCode::MsgMalformed,
                "unknown authority signature algorithm",
            ));
        }
        let key = PublicKey::from_bytes(&order.authority_public_key)
            .map_err(|_| reject(RejectCode::MsgMalformed, "bad authority public key"))?;
        let signature = Signature::from_der(&order.order_signature)
            .map_err(|_| reject(RejectCode::MsgMalformed, "bad authority signature"))?;
        let digest = order_authority_sig_hash(contract_address, order);
        if !key.verify(&digest, &signature) {
            return Err(reject(
                RejectCode::InvalidSignature,
                "authority signature does not verify",
            ));
        }
    }

    info!(contract = %contract_address, action = %(order.compliance_action as char), "order request");

    match order.compliance_action {
        COMPLIANCE_FREEZE => freeze_order(ctx, contract_address, order),
        COMPLIANCE_THAW => thaw_order(ctx, contract_address, order),
        COMPLIANCE_CONFISCATION => confiscation_order(ctx, contract_address, order),
        COMPLIANCE_RECONCILIATION => reconciliation_order(ctx, contract_address, order),
        other => Err(reject(
            RejectCode::MsgMalformed,
            format!("unknown compliance action {other:#04x}"),
        )),
    }
}

/// True when the order is a contract-wide freeze: one target, the contract
/// itself.
fn is_full_freeze(order: &Order, contract_address: &Address) -> bool {
    order.target_addresses.len() == 1 && order.target_addresses[0].address == *contract_address
}

fn require_enforcement_permitted(
    ctx: &HandlerContext,
    contract_address: &Address,
    order: &Order,
) -> Result<crate::state::Asset, HandlerError> {
    let asset = match ctx.repos.asset(contract_address, &order.asset_code) {
        Ok(asset) => asset,
        Err(StoreError::NotFound) => {
            return Err(reject(RejectCode::AssetNotFound, "asset not found"))
        }
        Err(e) => return Err(e.into()),
    };
    if !asset.enforcement_orders_permitted {
        return Err(reject(
            RejectCode::AssetNotPermitted,
            "asset does not permit enforcement orders",
        ));
    }
    Ok(asset)
}

fn freeze_order(
    ctx: &HandlerContext,
    contract_address: &Address,
    order: &Order,
) -> Result<Option<HandlerResponse>, HandlerError> {
    if order.target_addresses.is_empty() {
        return Err(reject(RejectCode::MsgMalformed, "freeze without targets"));
    }

    let full = is_full_freeze(order, contract_address);
    let mut outputs = Vec::new();
    let mut quantities = Vec::new();

    if order.asset_code.is_zero() {
        if !full {
            return Err(reject(
                RejectCode::MsgMalformed,
                "zero asset code outside a contract-wide freeze",
            ));
        }
        outputs.push(ResponseOutput {
            address: contract_address.clone(),
            value: 0,
        });
        quantities.push(QuantityIndex {
            index: 0,
            quantity: 0,
        });
    } else {
        require_enforcement_permitted(ctx, contract_address, order)?;
        for (index, target) in order.target_addresses.iter().enumerate() {
            if target.quantity == 0 {
                return Err(reject(
                    RejectCode::MsgMalformed,
                    "zero-quantity freeze target",
                ));
            }
            let holding = ctx.holdings.get(&HoldingKey {
                contract: contract_address.clone(),
                asset: order.asset_code,
                party: target.address.clone(),
            })?;
            if holding.finalized_balance == 0 {
                return Err(reject(
                    RejectCode::InsufficientAssets,
                    format!("no holding for target {}", target.address),
                ));
            }
            outputs.push(ResponseOutput {
                address: target.address.clone(),
                value: 0,
            });
            quantities.push(QuantityIndex {
                index: index as u16,
                quantity: target.quantity,
            });
        }
    }

    let freeze = Freeze {
        asset_type: order.asset_type.clone(),
        asset_code: order.asset_code,
        quantities,
        freeze_period: order.freeze_period,
        timestamp: ctx.now(),
    };
    Ok(Some(HandlerResponse {
        action: Action::Freeze(freeze),
        outputs,
        change: Some(contract_address.clone()),
        exclude_outputs: Vec::new(),
    }))
}

fn thaw_order(
    ctx: &HandlerContext,
    contract_address: &Address,
    order: &Order,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let freeze_tx = ctx
        .tx_cache
        .get(&order.freeze_tx_id)
        .map_err(|_| reject(RejectCode::MsgMalformed, "freeze tx not found"))?;
    let Some(Action::Freeze(freeze)) = &freeze_tx.action else {
        return Err(reject(RejectCode::MsgMalformed, "ref tx is not a freeze"));
    };

    if freeze.quantities.is_empty() {
        return Err(reject(RejectCode::MsgMalformed, "freeze had no targets"));
    }

    let full = freeze.quantities.len() == 1
        && freeze_tx
            .output_at(u32::from(freeze.quantities[0].index))
            .is_some_and(|o| o.address == *contract_address);

    let mut outputs = Vec::new();
    if freeze.asset_code.is_zero() {
        if !full {
            return Err(reject(
                RejectCode::MsgMalformed,
                "zero asset code outside a contract-wide freeze",
            ));
        }
        outputs.push(ResponseOutput {
            address: contract_address.clone(),
            value: 0,
        });
    } else {
        for quantity in &freeze.quantities {
            let output = freeze_tx
                .output_at(u32::from(quantity.index))
                .ok_or_else(|| {
                    reject(RejectCode::MsgMalformed, "freeze quantity index out of range")
                })?;
            outputs.push(ResponseOutput {
                address: output.address.clone(),
                value: 0,
            });
        }
    }

    let thaw = Thaw {
        freeze_tx_id: order.freeze_tx_id,
        timestamp: ctx.now(),
    };
    Ok(Some(HandlerResponse {
        action: Action::Thaw(thaw),
        outputs,
        change: Some(contract_address.clone()),
        exclude_outputs: Vec::new(),
    }))
}

fn confiscation_order(
    ctx: &HandlerContext,
    contract_address: &Address,
    order: &Order,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let _ = require_enforcement_permitted(ctx, contract_address, order)?;
    let deposit_address = order
        .deposit_address
        .clone()
        .ok_or_else(|| reject(RejectCode::MsgMalformed, "confiscation without deposit"))?;

    let mut outputs = Vec::new();
    let mut quantities = Vec::new();
    let mut deposit_qty = ctx
        .holdings
        .get(&HoldingKey {
            contract: contract_address.clone(),
            asset: order.asset_code,
            party: deposit_address.clone(),
        })?
        .finalized_balance;

    for (index, target) in order.target_addresses.iter().enumerate() {
        if target.quantity == 0 {
            return Err(reject(
                RejectCode::MsgMalformed,
                "zero-quantity confiscation target",
            ));
        }
        let holding = ctx.holdings.get(&HoldingKey {
            contract: contract_address.clone(),
            asset: order.asset_code,
            party: target.address.clone(),
        })?;
        if target.quantity > holding.finalized_balance {
            return Err(reject(
                RejectCode::InsufficientAssets,
                format!("target {} holds too little", target.address),
            ));
        }
        quantities.push(QuantityIndex {
            index: index as u16,
            quantity: holding.finalized_balance - target.quantity,
        });
        deposit_qty += target.quantity;
        outputs.push(ResponseOutput {
            address: target.address.clone(),
            value: 0,
        });
    }

    // Deposit output follows the targets.
    outputs.push(ResponseOutput {
        address: deposit_address,
        value: 0,
    });

    let confiscation = Confiscation {
        asset_type: order.asset_type.clone(),
        asset_code: order.asset_code,
        quantities,
        deposit_qty,
        timestamp: ctx.now(),
    };
    Ok(Some(HandlerResponse {
        action: Action::Confiscation(confiscation),
        outputs,
        change: Some(contract_address.clone()),
        exclude_outputs: Vec::new(),
    }))
}

fn reconciliation_order(
    ctx: &HandlerContext,
    contract_address: &Address,
    order: &Order,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let _ = require_enforcement_permitted(ctx, contract_address, order)?;

    let mut outputs = Vec::new();
    let mut quantities = Vec::new();
    for (index, target) in order.target_addresses.iter().enumerate() {
        if target.quantity == 0 {
            return Err(reject(
                RejectCode::MsgMalformed,
                "zero-quantity reconciliation target",
            ));
        }
        let holding = ctx.holdings.get(&HoldingKey {
            contract: contract_address.clone(),
            asset: order.asset_code,
            party: target.address.clone(),
        })?;
        if target.quantity > holding.finalized_balance {
            return Err(reject(
                RejectCode::InsufficientAssets,
                format!("target {} holds too little", target.address),
            ));
        }
        quantities.push(QuantityIndex {
            index: index as u16,
            quantity: holding.finalized_balance - target.quantity,
        });
        outputs.push(ResponseOutput {
            address: target.address.clone(),
            value: 0,
        });
    }

    // Optional bitcoin payouts ride the target outputs.
    for dispersion in &order.bitcoin_dispersions {
        if let Some(output) = outputs.get_mut(dispersion.index as usize) {
            output.value += dispersion.quantity;
        }
    }

    let reconciliation = Reconciliation {
        asset_type: order.asset_type.clone(),
        asset_code: order.asset_code,
        quantities,
        timestamp: ctx.now(),
    };
    Ok(Some(HandlerResponse {
        action: Action::Reconciliation(reconciliation),
        outputs,
        change: Some(contract_address.clone()),
        exclude_outputs: Vec::new(),
    }))
}

/// Commits `E02` Freeze: records status entries, or a contract/asset-wide
/// freeze period.
pub fn freeze_response(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::Freeze(freeze)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a freeze"));
    };
    require_from_self(itx, contract_address, "freeze")?;

    if freeze.quantities.is_empty() {
        return Err(HandlerError::Fatal("freeze with no targets".to_string()));
    }
    let full = freeze.quantities.len() == 1
        && itx
            .output_at(u32::from(freeze.quantities[0].index))
            .is_some_and(|o| o.address == *contract_address);

    let now = ctx.now();
    if freeze.asset_code.is_zero() {
        if !full {
            return Err(HandlerError::Fatal(
                "zero asset code outside a contract-wide freeze".to_string(),
            ));
        }
        let mut contract = ctx.repos.contract(contract_address)?;
        contract.freeze_period = freeze.freeze_period;
        contract.updated_at = now;
        ctx.repos.save_contract(&contract)?;
        info!(contract = %contract_address, "contract-wide freeze");
    } else if full {
        let mut asset = ctx.repos.asset(contract_address, &freeze.asset_code)?;
        asset.freeze_period = freeze.freeze_period;
        asset.updated_at = now;
        ctx.repos.save_asset(contract_address, &asset)?;
        info!(contract = %contract_address, asset = %freeze.asset_code, "asset-wide freeze");
    } else {
        for quantity in &freeze.quantities {
            let output = itx.output_at(u32::from(quantity.index)).ok_or_else(|| {
                HandlerError::Fatal("freeze quantity index out of range".to_string())
            })?;
            let key = HoldingKey {
                contract: contract_address.clone(),
                asset: freeze.asset_code,
                party: output.address.clone(),
            };
            let mut holding = ctx.holdings.get(&key)?;
            if holding.was_applied(&itx.txid) {
                continue;
            }
            holding.statuses.push(HoldingStatus {
                code: HOLDING_STATUS_FREEZE,
                expires: freeze.freeze_period,
                balance: quantity.quantity,
                tx_id: itx.txid,
            });
            holding.mark_applied(itx.txid);
            holding.updated_at = now;
            ctx.holdings.put(key, holding);
        }
    }

    // Retained so a later thaw can reference it.
    ctx.tx_cache.save(itx)?;
    Ok(())
}

/// Commits `E03` Thaw: clears exactly the statuses created by the
/// referenced freeze tx.
pub fn thaw_response(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::Thaw(thaw)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a thaw"));
    };
    require_from_self(itx, contract_address, "thaw")?;

    let freeze_tx = match ctx.tx_cache.get(&thaw.freeze_tx_id) {
        Ok(tx) => tx,
        Err(_) => {
            warn!(freeze = %thaw.freeze_tx_id, "freeze tx missing; thaw is a no-op");
            return Ok(());
        }
    };
    let Some(Action::Freeze(freeze)) = &freeze_tx.action else {
        return Err(HandlerError::Fatal("thaw references a non-freeze".to_string()));
    };

    let full = freeze.quantities.len() == 1
        && freeze_tx
            .output_at(u32::from(freeze.quantities[0].index))
            .is_some_and(|o| o.address == *contract_address);

    let now = ctx.now();
    if freeze.asset_code.is_zero() {
        let mut contract = ctx.repos.contract(contract_address)?;
        contract.freeze_period = Timestamp::ZERO;
        contract.updated_at = now;
        ctx.repos.save_contract(&contract)?;
        info!(contract = %contract_address, "contract-wide thaw");
    } else if full {
        let mut asset = ctx.repos.asset(contract_address, &freeze.asset_code)?;
        asset.freeze_period = Timestamp::ZERO;
        asset.updated_at = now;
        ctx.repos.save_asset(contract_address, &asset)?;
    } else {
        for quantity in &freeze.quantities {
            let Some(output) = freeze_tx.output_at(u32::from(quantity.index)) else {
                continue;
            };
            let key = HoldingKey {
                contract: contract_address.clone(),
                asset: freeze.asset_code,
                party: output.address.clone(),
            };
            let mut holding = ctx.holdings.get(&key)?;
            // Clearing is scoped to the statuses this freeze created; a
            // stale thaw cannot lift a later freeze.
            holding.statuses.retain(|s| s.tx_id != freeze_tx.txid);
            holding.mark_applied(itx.txid);
            holding.updated_at = now;
            ctx.holdings.put(key, holding);
        }
    }

    ctx.tx_cache.remove(&freeze_tx.txid)?;
    Ok(())
}

/// Commits `E04` Confiscation: sets target balances and the deposit
/// balance in one atomic pass.
pub fn confiscation_response(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::Confiscation(confiscation)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a confiscation"));
    };
    require_from_self(itx, contract_address, "confiscation")?;

    let now = ctx.now();
    let mut highest = 0u16;
    for quantity in &confiscation.quantities {
        let output = itx.output_at(u32::from(quantity.index)).ok_or_else(|| {
            HandlerError::Fatal("confiscation quantity index out of range".to_string())
        })?;
        apply_balance(
            ctx,
            contract_address,
            &confiscation.asset_code,
            &output.address,
            quantity.quantity,
            itx,
            now,
        )?;
        highest = highest.max(quantity.index);
    }

    let deposit_output = itx
        .output_at(u32::from(highest) + 1)
        .ok_or_else(|| HandlerError::Fatal("confiscation deposit output missing".to_string()))?;
    apply_balance(
        ctx,
        contract_address,
        &confiscation.asset_code,
        &deposit_output.address,
        confiscation.deposit_qty,
        itx,
        now,
    )?;

    info!(contract = %contract_address, asset = %confiscation.asset_code, "processed confiscation");
    Ok(())
}

/// Commits `E05` Reconciliation: sets target balances.
pub fn reconciliation_response(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::Reconciliation(reconciliation)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a reconciliation"));
    };
    require_from_self(itx, contract_address, "reconciliation")?;

    let now = ctx.now();
    for quantity in &reconciliation.quantities {
        let output = itx.output_at(u32::from(quantity.index)).ok_or_else(|| {
            HandlerError::Fatal("reconciliation quantity index out of range".to_string())
        })?;
        apply_balance(
            ctx,
            contract_address,
            &reconciliation.asset_code,
            &output.address,
            quantity.quantity,
            itx,
            now,
        )?;
    }

    info!(contract = %contract_address, asset = %reconciliation.asset_code, "processed reconciliation");
    Ok(())
}

/// Undoes a cancelled Freeze response: the network replaced the tx, so
/// the statuses and freeze periods it set come back out. A replacement
/// freeze carries a new tx id and applies independently.
pub fn revert_freeze(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::Freeze(freeze)) = &itx.action else {
        return Ok(());
    };

    let full = freeze.quantities.len() == 1
        && itx
            .output_at(u32::from(freeze.quantities[0].index))
            .is_some_and(|o| o.address == *contract_address);

    let now = ctx.now();
    if freeze.asset_code.is_zero() {
        if full {
            let mut contract = ctx.repos.contract(contract_address)?;
            contract.freeze_period = Timestamp::ZERO;
            contract.updated_at = now;
            ctx.repos.save_contract(&contract)?;
        }
    } else if full {
        let mut asset = ctx.repos.asset(contract_address, &freeze.asset_code)?;
        asset.freeze_period = Timestamp::ZERO;
        asset.updated_at = now;
        ctx.repos.save_asset(contract_address, &asset)?;
    } else {
        for quantity in &freeze.quantities {
            let Some(output) = itx.output_at(u32::from(quantity.index)) else {
                continue;
            };
            let key = HoldingKey {
                contract: contract_address.clone(),
                asset: freeze.asset_code,
                party: output.address.clone(),
            };
            let mut holding = ctx.holdings.get(&key)?;
            holding.statuses.retain(|s| s.tx_id != itx.txid);
            holding.unmark_applied(&itx.txid);
            holding.updated_at = now;
            ctx.holdings.put(key, holding);
        }
    }

    ctx.tx_cache.remove(&itx.txid)?;
    warn!(contract = %contract_address, freeze = %itx.txid, "cancelled freeze withdrawn");
    Ok(())
}

fn apply_balance(
    ctx: &HandlerContext,
    contract_address: &Address,
    asset_code: &covenant_core::bitcoin::Hash32,
    party: &Address,
    balance: u64,
    itx: &InspectorTx,
    now: Timestamp,
) -> Result<(), HandlerError> {
    let key = HoldingKey {
        contract: contract_address.clone(),
        asset: *asset_code,
        party: party.clone(),
    };
    let mut holding = ctx.holdings.get(&key)?;
    if holding.was_applied(&itx.txid) {
        return Ok(());
    }
    holding.finalized_balance = balance;
    holding.mark_applied(itx.txid);
    holding.updated_at = now;
    ctx.holdings.put(key, holding);
    Ok(())
}

fn require_from_self(
    itx: &InspectorTx,
    contract_address: &Address,
    what: &str,
) -> Result<(), HandlerError> {
    let from_self = itx
        .inputs
        .first()
        .is_some_and(|i| i.address == *contract_address);
    if !from_self {
        return Err(HandlerError::Fatal(format!("{what} not from contract")));
    }
    Ok(())
}
