//! Asset lifecycle: Definition, Modification, Creation.

use tracing::info;

use covenant_core::bitcoin::{double_sha256, Address, Hash32};
use covenant_core::protocol::{
    Action, Amendment, AssetCreation, AssetPayload, AssetTerms, Permissions, RejectCode,
    AMENDMENT_OP_MODIFY, ASSET_FIELD_COUNT,
};

use crate::holdings::HoldingKey;
use crate::inspector::InspectorTx;
use crate::state::Asset;
use crate::store::StoreError;

use super::{
    check_amendment_permissions, check_proposal_ref, contract_preamble, reject, HandlerContext,
    HandlerError, HandlerResponse,
};

const FIELD_ASSET_PERMISSIONS: u8 = 0;
const FIELD_TRANSFERS_PERMITTED: u8 = 1;
const FIELD_ENFORCEMENT_PERMITTED: u8 = 2;
const FIELD_VOTING_RIGHTS: u8 = 3;
const FIELD_VOTE_MULTIPLIER: u8 = 4;
const FIELD_TOKEN_QTY: u8 = 5;
const FIELD_ASSET_PAYLOAD: u8 = 6;

/// Deterministic asset code: double SHA-256 of the contract address bytes
/// and the asset's position in the contract.
#[must_use]
pub fn asset_code(contract_address: &Address, index: u64) -> Hash32 {
    let mut data = contract_address.to_bytes();
    data.extend_from_slice(&index.to_le_bytes());
    Hash32(double_sha256(&data))
}

/// Handles `A01` AssetDefinition; responds with an AssetCreation at
/// revision zero.
pub fn definition_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let contract = contract_preamble(ctx, itx, contract_address, false)?;

    let Some(Action::AssetDefinition(definition)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not an asset definition"));
    };

    // Only the administration defines assets.
    let sender_is_admin = itx
        .inputs
        .first()
        .is_some_and(|i| i.address == contract.admin_address);
    if !sender_is_admin {
        return Err(reject(
            RejectCode::NotAdministration,
            "only the administration can define assets",
        ));
    }

    let terms = &definition.terms;
    if Permissions::from_bytes(
        &terms.asset_permissions,
        ASSET_FIELD_COUNT,
        contract.voting_systems.len(),
    )
    .is_err()
    {
        return Err(reject(
            RejectCode::MsgMalformed,
            "invalid asset permission matrix",
        ));
    }

    let code = asset_code(contract_address, contract.asset_codes.len() as u64);
    match ctx.repos.asset(contract_address, &code) {
        Ok(_) => {
            return Err(reject(RejectCode::DuplicateAssetId, "asset already exists"));
        }
        Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    if !contract.can_have_more_assets() {
        return Err(reject(
            RejectCode::FixedQuantity,
            "contract asset count limit reached",
        ));
    }

    let payload = AssetPayload::deserialize(&terms.asset_type, &terms.asset_payload)
        .map_err(|e| reject(RejectCode::MsgMalformed, format!("bad asset payload: {e}")))?;
    payload
        .validate()
        .map_err(|e| reject(RejectCode::MsgMalformed, format!("invalid payload: {e}")))?;

    // One Owner/Administrator membership asset per contract.
    if let AssetPayload::Membership(membership) = &payload {
        if membership.is_admin_class() && !contract.admin_member_asset.is_zero() {
            return Err(reject(
                RejectCode::AssetNotPermitted,
                "contract already has an owner/administrator membership asset",
            ));
        }
    }

    info!(contract = %contract_address, asset = %code, "accepting asset definition");

    let creation = AssetCreation {
        terms: terms.clone(),
        asset_code: code,
        asset_index: contract.asset_codes.len() as u64,
        asset_revision: 0,
        timestamp: ctx.now(),
    };
    Ok(Some(HandlerResponse::to_contract(
        Action::AssetCreation(creation),
        contract_address,
    )))
}

/// Handles `A03` AssetModification; responds with an AssetCreation at the
/// next revision.
pub fn modification_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let contract = contract_preamble(ctx, itx, contract_address, true)?;

    let Some(Action::AssetModification(modification)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not an asset modification"));
    };

    let asset = match ctx.repos.asset(contract_address, &modification.asset_code) {
        Ok(asset) => asset,
        Err(StoreError::NotFound) => {
            return Err(reject(RejectCode::AssetNotFound, "asset not found"))
        }
        Err(e) => return Err(e.into()),
    };

    if asset.revision != modification.asset_revision {
        return Err(reject(
            RejectCode::AssetRevision,
            format!(
                "revision mismatch: specified {} current {}",
                modification.asset_revision, asset.revision
            ),
        ));
    }

    let mut proposed = false;
    let mut initiator = 0u8;
    let mut vote_system = 0u8;
    if !modification.ref_tx_id.is_zero() {
        let vote = check_proposal_ref(
            ctx,
            contract_address,
            &modification.ref_tx_id,
            &modification.amendments,
            Some(&modification.asset_code),
        )?;
        proposed = true;
        initiator = vote.initiator;
        vote_system = vote.vote_system;
    }

    let permissions = Permissions::from_bytes(
        &asset.permissions,
        ASSET_FIELD_COUNT,
        contract.voting_systems.len(),
    )
    .map_err(|_| HandlerError::Fatal("stored asset permission matrix corrupt".to_string()))?;

    check_amendment_permissions(
        &permissions,
        &modification.amendments,
        proposed,
        initiator,
        vote_system,
        RejectCode::AssetPermissions,
    )?;

    let mut terms = terms_from_asset(&asset);
    apply_asset_amendments(&mut terms, &modification.amendments, contract.voting_systems.len())?;

    // A quantity reduction debits the administration holding; it must
    // cover the difference.
    if terms.token_qty < asset.token_qty {
        let admin_holding = ctx.holdings.get(&HoldingKey {
            contract: contract_address.clone(),
            asset: asset.asset_code,
            party: contract.admin_address.clone(),
        })?;
        let cut = asset.token_qty - terms.token_qty;
        if admin_holding.spendable(ctx.now()) < cut {
            return Err(reject(
                RejectCode::InsufficientQuantity,
                "administration holding cannot cover the quantity reduction",
            ));
        }
    }

    info!(contract = %contract_address, asset = %asset.asset_code, "accepting asset modification");

    let creation = AssetCreation {
        terms,
        asset_code: asset.asset_code,
        asset_index: contract
            .asset_codes
            .iter()
            .position(|c| *c == asset.asset_code)
            .unwrap_or(0) as u64,
        asset_revision: asset.revision + 1,
        timestamp: ctx.now(),
    };
    Ok(Some(HandlerResponse::to_contract(
        Action::AssetCreation(creation),
        contract_address,
    )))
}

/// Commits `A02` AssetCreation: creates or updates the asset and adjusts
/// the administration holding.
pub fn creation_response(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::AssetCreation(creation)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not an asset creation"));
    };

    let from_self = itx
        .inputs
        .first()
        .is_some_and(|i| i.address == *contract_address);
    if !from_self {
        return Err(HandlerError::Fatal(
            "asset creation not from contract".to_string(),
        ));
    }

    let mut contract = ctx.repos.contract(contract_address)?;
    let now = ctx.now();
    let admin_key = HoldingKey {
        contract: contract_address.clone(),
        asset: creation.asset_code,
        party: contract.admin_address.clone(),
    };

    match ctx.repos.asset(contract_address, &creation.asset_code) {
        Err(StoreError::NotFound) => {
            // Creation: the full quantity starts in the administration
            // holding.
            let asset = asset_from_terms(&creation.terms, creation.asset_code, 0, now);
            ctx.repos.save_asset(contract_address, &asset)?;

            let mut holding = ctx.holdings.get(&admin_key)?;
            if !holding.was_applied(&itx.txid) {
                holding.finalized_balance = creation.terms.token_qty;
                holding.mark_applied(itx.txid);
                holding.updated_at = now;
                ctx.holdings.put(admin_key, holding);
            }

            contract.asset_codes.push(creation.asset_code);
            if let Ok(AssetPayload::Membership(m)) =
                AssetPayload::deserialize(&creation.terms.asset_type, &creation.terms.asset_payload)
            {
                if m.is_admin_class() {
                    contract.admin_member_asset = creation.asset_code;
                }
            }
            contract.updated_at = now;
            ctx.repos.save_contract(&contract)?;
            info!(contract = %contract_address, asset = %creation.asset_code, "created asset");
        }
        Ok(mut asset) => {
            if asset.revision >= creation.asset_revision {
                return Ok(()); // replayed response
            }

            let old_qty = asset.token_qty;
            update_asset_from_terms(&mut asset, &creation.terms);
            asset.revision = creation.asset_revision;
            asset.updated_at = now;

            let mut holding = ctx.holdings.get(&admin_key)?;
            if !holding.was_applied(&itx.txid) {
                if creation.terms.token_qty >= old_qty {
                    holding.finalized_balance += creation.terms.token_qty - old_qty;
                } else {
                    let cut = old_qty - creation.terms.token_qty;
                    if holding.finalized_balance < cut {
                        return Err(HandlerError::Fatal(
                            "administration holding underfunded for quantity reduction"
                                .to_string(),
                        ));
                    }
                    holding.finalized_balance -= cut;
                }
                holding.mark_applied(itx.txid);
                holding.updated_at = now;
                ctx.holdings.put(admin_key, holding);
            }

            ctx.repos.save_asset(contract_address, &asset)?;

            // Mark the proposal applied when the modification referenced a
            // Result.
            let request_tx_id = itx.inputs.first().map(|i| i.outpoint.txid);
            if let Some(request_tx_id) = request_tx_id {
                if let Ok(request) = ctx.tx_cache.get(&request_tx_id) {
                    if let Some(Action::AssetModification(modification)) = request.action {
                        if !modification.ref_tx_id.is_zero() {
                            super::contract::mark_applied_for_ref(
                                ctx,
                                contract_address,
                                &modification.ref_tx_id,
                                &request.txid,
                            )?;
                        }
                    }
                }
            }

            info!(contract = %contract_address, asset = %creation.asset_code, revision = asset.revision, "updated asset");
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

fn terms_from_asset(asset: &Asset) -> AssetTerms {
    AssetTerms {
        asset_type: asset.asset_type.clone(),
        asset_permissions: asset.permissions.clone(),
        transfers_permitted: asset.transfers_permitted,
        enforcement_orders_permitted: asset.enforcement_orders_permitted,
        voting_rights: asset.voting_rights,
        vote_multiplier: asset.vote_multiplier,
        token_qty: asset.token_qty,
        asset_payload: asset.payload.clone(),
    }
}

fn asset_from_terms(
    terms: &AssetTerms,
    code: Hash32,
    revision: u32,
    now: covenant_core::protocol::Timestamp,
) -> Asset {
    Asset {
        asset_code: code,
        revision,
        asset_type: terms.asset_type.clone(),
        permissions: terms.asset_permissions.clone(),
        transfers_permitted: terms.transfers_permitted,
        enforcement_orders_permitted: terms.enforcement_orders_permitted,
        voting_rights: terms.voting_rights,
        vote_multiplier: terms.vote_multiplier,
        token_qty: terms.token_qty,
        payload: terms.asset_payload.clone(),
        freeze_period: covenant_core::protocol::Timestamp::ZERO,
        created_at: now,
        updated_at: now,
    }
}

fn update_asset_from_terms(asset: &mut Asset, terms: &AssetTerms) {
    asset.permissions = terms.asset_permissions.clone();
    asset.transfers_permitted = terms.transfers_permitted;
    asset.enforcement_orders_permitted = terms.enforcement_orders_permitted;
    asset.voting_rights = terms.voting_rights;
    asset.vote_multiplier = terms.vote_multiplier;
    asset.token_qty = terms.token_qty;
    asset.payload = terms.asset_payload.clone();
}

/// Applies amendments to asset terms in place.
pub fn apply_asset_amendments(
    terms: &mut AssetTerms,
    amendments: &[Amendment],
    voting_systems: usize,
) -> Result<(), HandlerError> {
    for amendment in amendments {
        if amendment.operation != AMENDMENT_OP_MODIFY {
            return Err(reject(
                RejectCode::MsgMalformed,
                "asset fields only support modify amendments",
            ));
        }
        let data = &amendment.data;
        match amendment.field_index {
            FIELD_ASSET_PERMISSIONS => terms.asset_permissions = data.clone(),
            FIELD_TRANSFERS_PERMITTED => terms.transfers_permitted = bool_byte(data)?,
            FIELD_ENFORCEMENT_PERMITTED => terms.enforcement_orders_permitted = bool_byte(data)?,
            FIELD_VOTING_RIGHTS => terms.voting_rights = bool_byte(data)?,
            FIELD_VOTE_MULTIPLIER => {
                let byte: [u8; 1] = data.as_slice().try_into().map_err(|_| {
                    reject(RejectCode::MsgMalformed, "vote multiplier is one byte")
                })?;
                terms.vote_multiplier = byte[0];
            }
            FIELD_TOKEN_QTY => {
                let bytes: [u8; 8] = data.as_slice().try_into().map_err(|_| {
                    reject(RejectCode::MsgMalformed, "token quantity is eight bytes")
                })?;
                terms.token_qty = u64::from_le_bytes(bytes);
            }
            FIELD_ASSET_PAYLOAD => {
                let payload = AssetPayload::deserialize(&terms.asset_type, data)
                    .map_err(|_| reject(RejectCode::MsgMalformed, "amended payload invalid"))?;
                payload
                    .validate()
                    .map_err(|_| reject(RejectCode::MsgMalformed, "amended payload invalid"))?;
                terms.asset_payload = data.clone();
            }
            other => {
                return Err(reject(
                    RejectCode::MsgMalformed,
                    format!("asset field {other} is not amendable"),
                ))
            }
        }
    }

    Permissions::from_bytes(&terms.asset_permissions, ASSET_FIELD_COUNT, voting_systems).map_err(
        |_| {
            reject(
                RejectCode::MsgMalformed,
                "asset permission matrix invalid after amendments",
            )
        },
    )?;
    Ok(())
}

fn bool_byte(data: &[u8]) -> Result<bool, HandlerError> {
    match data {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(reject(RejectCode::MsgMalformed, "bool amendment invalid")),
    }
}
