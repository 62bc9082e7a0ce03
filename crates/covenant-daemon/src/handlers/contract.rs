//! Contract lifecycle: Offer, Amendment, Formation, AddressChange.

use tracing::info;

use covenant_core::bitcoin::{Address, Hash32, PublicKey, Signature};
use covenant_core::protocol::{
    contract_oracle_sig_hash, Action, Amendment, ContractAmendment, ContractFormation,
    ContractTerms, Oracle, Permissions, RejectCode, VotingSystem, AMENDMENT_OP_ADD,
    AMENDMENT_OP_DELETE, AMENDMENT_OP_MODIFY, CONTRACT_FIELD_COUNT,
};

use crate::inspector::InspectorTx;
use crate::state::Contract;
use crate::store::StoreError;

use super::{
    check_amendment_permissions, check_proposal_ref, contract_preamble, reject, HandlerContext,
    HandlerError, HandlerResponse,
};

// Amendable contract fields. Indexes 13..21 are reserved; the permission
// matrix still spans the full count.
const FIELD_CONTRACT_NAME: u8 = 0;
const FIELD_CONTRACT_TYPE: u8 = 1;
const FIELD_CONTRACT_URI: u8 = 2;
const FIELD_CONTRACT_EXPIRATION: u8 = 3;
const FIELD_CONTRACT_PERMISSIONS: u8 = 4;
const FIELD_VOTING_SYSTEMS: u8 = 5;
const FIELD_ORACLES: u8 = 6;
const FIELD_MASTER_ADDRESS: u8 = 7;
const FIELD_RESTRICTED_QTY_ASSETS: u8 = 8;
const FIELD_CONTRACT_FEE: u8 = 9;
const FIELD_ADMIN_ORACLE: u8 = 10;
const FIELD_ADMIN_ORACLE_SIGNATURE: u8 = 11;
const FIELD_ADMIN_ORACLE_SIG_BLOCK_HEIGHT: u8 = 12;

/// Handles `C01` ContractOffer; responds with a ContractFormation at
/// revision zero.
pub fn offer_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<Option<HandlerResponse>, HandlerError> {
    if let Some(code) = itx.reject_code {
        return Err(reject(code, "offer failed codec validation"));
    }

    let Some(Action::ContractOffer(offer)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a contract offer"));
    };

    match ctx.repos.contract(contract_address) {
        Ok(_) => {
            return Err(reject(
                RejectCode::ContractExists,
                "contract already exists",
            ))
        }
        Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    let terms = &offer.terms;
    let now = ctx.now();

    if !terms.contract_expiration.is_zero() && terms.contract_expiration < now {
        return Err(reject(
            RejectCode::MsgMalformed,
            "expiration already passed",
        ));
    }

    if Permissions::from_bytes(
        &terms.contract_permissions,
        CONTRACT_FIELD_COUNT,
        terms.voting_systems.len(),
    )
    .is_err()
    {
        return Err(reject(
            RejectCode::MsgMalformed,
            "invalid contract permission matrix",
        ));
    }

    for system in &terms.voting_systems {
        if system.validate().is_err() {
            return Err(reject(RejectCode::MsgMalformed, "invalid voting system"));
        }
    }

    if terms.operator_included && itx.inputs.len() < 2 {
        return Err(reject(
            RejectCode::TxMalformed,
            "operator included but absent from inputs",
        ));
    }

    // An offered admin-oracle endorsement must cover the offer's
    // administration and operator inputs.
    if terms.admin_oracle.is_some() {
        let admin = itx
            .inputs
            .first()
            .map(|i| i.address.clone())
            .ok_or_else(|| reject(RejectCode::TxMalformed, "offer has no inputs"))?;
        let operator = if terms.operator_included {
            itx.inputs.get(1).map(|i| i.address.clone())
        } else {
            None
        };
        verify_admin_oracle_sig(ctx, &admin, operator.as_ref(), terms)?;
    }

    info!(contract = %contract_address, name = %terms.contract_name, "accepting contract offer");

    let formation = ContractFormation {
        terms: terms.clone(),
        contract_revision: 0,
        timestamp: now,
    };
    Ok(Some(HandlerResponse::to_contract(
        Action::ContractFormation(formation),
        contract_address,
    )))
}

/// Handles `C03` ContractAmendment; responds with a ContractFormation at
/// the next revision.
pub fn amendment_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let contract = contract_preamble(ctx, itx, contract_address, true)?;

    let Some(Action::ContractAmendment(amendment)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a contract amendment"));
    };

    if contract.revision != amendment.contract_revision {
        return Err(reject(
            RejectCode::ContractRevision,
            format!(
                "revision mismatch: specified {} current {}",
                amendment.contract_revision, contract.revision
            ),
        ));
    }

    // A Result reference turns on the proposal path.
    let mut proposed = false;
    let mut initiator = 0u8;
    let mut vote_system = 0u8;
    if !amendment.ref_tx_id.is_zero() {
        let vote = check_proposal_ref(
            ctx,
            contract_address,
            &amendment.ref_tx_id,
            &amendment.amendments,
            None,
        )?;
        proposed = true;
        initiator = vote.initiator;
        vote_system = vote.vote_system;
    }

    if amendment.change_administration_address || amendment.change_operator_address {
        require_all_operators(&contract, itx)?;
    }

    let permissions = Permissions::from_bytes(
        &contract.permissions,
        CONTRACT_FIELD_COUNT,
        contract.voting_systems.len(),
    )
    .map_err(|_| HandlerError::Fatal("stored permission matrix corrupt".to_string()))?;

    check_amendment_permissions(
        &permissions,
        &amendment.amendments,
        proposed,
        initiator,
        vote_system,
        RejectCode::ContractPermissions,
    )?;

    let mut terms = terms_from_contract(&contract);
    apply_contract_amendments(&mut terms, &amendment.amendments)?;

    // A contract endorsed by an admin oracle cannot change administration
    // or operator without a fresh endorsement signature in the same
    // amendment set, and whatever endorsement the amended terms carry must
    // still verify against the amended administration.
    if contract.admin_oracle.is_some()
        && (amendment.change_administration_address || amendment.change_operator_address)
    {
        let sig_included = amendment
            .amendments
            .iter()
            .any(|a| a.field_index == FIELD_ADMIN_ORACLE_SIGNATURE);
        if !sig_included {
            return Err(reject(
                RejectCode::InvalidSignature,
                "new admin oracle signature required to change administration or operator",
            ));
        }
    }
    if terms.admin_oracle.is_some() {
        let (admin, operator) = amended_operators(&contract, amendment, itx)?;
        verify_admin_oracle_sig(ctx, &admin, operator.as_ref(), &terms)?;
    }

    // Reducing the asset cap below the live asset count is refused.
    if terms.restricted_qty_assets > 0
        && terms.restricted_qty_assets < contract.asset_codes.len() as u64
    {
        return Err(reject(
            RejectCode::ContractQtyReduction,
            "cannot reduce allowable assets below existing number",
        ));
    }

    info!(contract = %contract_address, name = %contract.contract_name, "accepting contract amendment");

    let formation = ContractFormation {
        terms,
        contract_revision: contract.revision + 1,
        timestamp: ctx.now(),
    };
    Ok(Some(HandlerResponse::to_contract(
        Action::ContractFormation(formation),
        contract_address,
    )))
}

/// Commits `C02` ContractFormation: creates or updates the contract record.
pub fn formation_response(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::ContractFormation(formation)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a contract formation"));
    };

    let from_self = itx
        .inputs
        .first()
        .is_some_and(|i| i.address == *contract_address);
    if !from_self {
        return Err(HandlerError::Fatal(
            "contract formation not from contract".to_string(),
        ));
    }

    // The request is the tx whose output this response spends.
    let request_tx_id = itx
        .inputs
        .first()
        .map(|i| i.outpoint.txid)
        .ok_or_else(|| HandlerError::Fatal("formation has no inputs".to_string()))?;
    let request = ctx.tx_cache.get(&request_tx_id).ok();

    let existing = match ctx.repos.contract(contract_address) {
        Ok(contract) => Some(contract),
        Err(StoreError::NotFound) => None,
        Err(e) => return Err(e.into()),
    };

    let now = ctx.now();
    match existing {
        None => {
            // Creation: administration and operator come from the offer's
            // inputs.
            let request = request.ok_or_else(|| {
                HandlerError::Fatal(format!("offer tx {request_tx_id} not cached"))
            })?;
            let admin_address = request
                .inputs
                .first()
                .map(|i| i.address.clone())
                .ok_or_else(|| HandlerError::Fatal("offer tx has no inputs".to_string()))?;
            let operator_address = if formation.terms.operator_included {
                request.inputs.get(1).map(|i| i.address.clone())
            } else {
                None
            };

            let contract = contract_from_terms(
                contract_address.clone(),
                &formation.terms,
                admin_address,
                operator_address,
                formation.contract_revision,
                now,
            );
            ctx.repos.save_contract(&contract)?;
            info!(contract = %contract_address, name = %contract.contract_name, "created contract");
        }
        Some(mut contract) => {
            if contract.revision >= formation.contract_revision
                && formation.contract_revision != 0
            {
                return Ok(()); // replayed response; already applied
            }
            if formation.contract_revision == 0 {
                return Ok(()); // replayed creation
            }

            update_contract_from_terms(&mut contract, &formation.terms);
            contract.revision = formation.contract_revision;
            contract.updated_at = now;

            // Administration/operator changes ride the amendment inputs.
            if let Some(request) = &request {
                if let Some(Action::ContractAmendment(amendment)) = &request.action {
                    let mut input_index = 1;
                    if contract.operator_address.is_some() {
                        input_index += 1;
                    }
                    if amendment.change_administration_address {
                        let input = request.inputs.get(input_index).ok_or_else(|| {
                            HandlerError::Fatal(
                                "new administration not included in inputs".to_string(),
                            )
                        })?;
                        contract.admin_address = input.address.clone();
                        input_index += 1;
                    }
                    if amendment.change_operator_address {
                        let input = request.inputs.get(input_index).ok_or_else(|| {
                            HandlerError::Fatal("new operator not included in inputs".to_string())
                        })?;
                        contract.operator_address = Some(input.address.clone());
                    }

                    if !amendment.ref_tx_id.is_zero() {
                        mark_applied_for_ref(ctx, contract_address, &amendment.ref_tx_id, &request.txid)?;
                    }
                }
            }

            ctx.repos.save_contract(&contract)?;
            info!(contract = %contract_address, revision = contract.revision, "updated contract");
        }
    }

    Ok(())
}

/// Handles `C04` ContractAddressChange. The move commits directly; there
/// is no response action.
pub fn address_change_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<Option<HandlerResponse>, HandlerError> {
    if let Some(code) = itx.reject_code {
        return Err(reject(code, "address change failed codec validation"));
    }

    let Some(Action::ContractAddressChange(change)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not an address change"));
    };

    let mut contract = match ctx.repos.contract(contract_address) {
        Ok(contract) => contract,
        Err(StoreError::NotFound) => {
            return Err(reject(RejectCode::UnknownAddress, "no contract here"))
        }
        Err(e) => return Err(e.into()),
    };

    let master = contract.master_address.clone().ok_or_else(|| {
        reject(RejectCode::TxMalformed, "contract has no master address")
    })?;
    let sender_ok = itx.inputs.first().is_some_and(|i| i.address == master);
    if !sender_ok {
        return Err(reject(
            RejectCode::TxMalformed,
            "address change must come from the master address",
        ));
    }

    let to_current = itx.outputs.iter().any(|o| o.address == *contract_address);
    let to_new = itx
        .outputs
        .iter()
        .any(|o| o.address == change.new_contract_address);
    if !to_current || !to_new {
        return Err(reject(
            RejectCode::TxMalformed,
            "address change must pay the current and the new address",
        ));
    }

    contract.moved_to = Some(change.new_contract_address.clone());
    contract.updated_at = ctx.now();
    ctx.repos.save_contract(&contract)?;
    info!(contract = %contract_address, to = %change.new_contract_address, "contract moved");
    Ok(None)
}

fn require_all_operators(contract: &Contract, itx: &InspectorTx) -> Result<(), HandlerError> {
    if contract.operator_address.is_some() {
        let both_present = itx.inputs.len() >= 2
            && itx.inputs[0].address != itx.inputs[1].address
            && contract.is_operator(&itx.inputs[0].address)
            && contract.is_operator(&itx.inputs[1].address);
        if !both_present {
            return Err(reject(
                RejectCode::ContractBothOperatorsRequired,
                "all operators required for operator change",
            ));
        }
    } else if !itx
        .inputs
        .first()
        .is_some_and(|i| contract.is_operator(&i.address))
    {
        return Err(reject(
            RejectCode::ContractBothOperatorsRequired,
            "administration required for operator change",
        ));
    }
    Ok(())
}

/// Resolves the administration and operator the amendment leaves in
/// place, pulling replacements from the request inputs the way the
/// formation committer will.
fn amended_operators(
    contract: &Contract,
    amendment: &ContractAmendment,
    itx: &InspectorTx,
) -> Result<(Address, Option<Address>), HandlerError> {
    let mut admin = contract.admin_address.clone();
    let mut operator = contract.operator_address.clone();

    let mut input_index = 1 + usize::from(contract.operator_address.is_some());
    if amendment.change_administration_address {
        let input = itx.inputs.get(input_index).ok_or_else(|| {
            reject(
                RejectCode::TxMalformed,
                "new administration not included in inputs",
            )
        })?;
        admin = input.address.clone();
        input_index += 1;
    }
    if amendment.change_operator_address {
        let input = itx.inputs.get(input_index).ok_or_else(|| {
            reject(RejectCode::TxMalformed, "new operator not included in inputs")
        })?;
        operator = Some(input.address.clone());
    }
    Ok((admin, operator))
}

/// Verifies the terms' admin-oracle endorsement over the given
/// administration and operator.
fn verify_admin_oracle_sig(
    ctx: &HandlerContext,
    admin: &Address,
    operator: Option<&Address>,
    terms: &ContractTerms,
) -> Result<(), HandlerError> {
    let Some(oracle) = &terms.admin_oracle else {
        return Ok(());
    };

    let key = PublicKey::from_bytes(&oracle.public_key)
        .map_err(|_| reject(RejectCode::InvalidSignature, "admin oracle key invalid"))?;
    let signature = Signature::from_der(&terms.admin_oracle_signature)
        .map_err(|_| reject(RejectCode::InvalidSignature, "admin oracle signature not DER"))?;
    let block_hash = ctx
        .headers
        .hash(terms.admin_oracle_sig_block_height)
        .map_err(|_| reject(RejectCode::InvalidSignature, "endorsement block unknown"))?;

    let digest = contract_oracle_sig_hash(admin, operator, &block_hash);
    if !key.verify(&digest, &signature) {
        return Err(reject(
            RejectCode::InvalidSignature,
            "admin oracle signature does not verify",
        ));
    }
    Ok(())
}

/// Marks the vote behind a Result reference as applied by `applied_by`.
pub(crate) fn mark_applied_for_ref(
    ctx: &HandlerContext,
    contract_address: &Address,
    ref_tx_id: &Hash32,
    applied_by: &Hash32,
) -> Result<(), HandlerError> {
    let Ok(result_tx) = ctx.tx_cache.get(ref_tx_id) else {
        return Ok(()); // reference already validated at request time
    };
    let Some(Action::Result(result)) = result_tx.action else {
        return Ok(());
    };
    let Ok(mut vote) = ctx.repos.vote(contract_address, &result.vote_tx_id) else {
        return Ok(());
    };
    if !vote.applied_at.is_zero() {
        return Ok(());
    }
    vote.applied_at = ctx.now();
    vote.applied_by = *applied_by;
    vote.updated_at = vote.applied_at;
    ctx.repos.save_vote(contract_address, &vote)?;
    info!(vote = %vote.vote_tx_id, "marked vote applied");
    Ok(())
}

/// The wire terms equivalent to the stored contract state.
pub fn terms_from_contract(contract: &Contract) -> ContractTerms {
    ContractTerms {
        contract_name: contract.contract_name.clone(),
        contract_type: contract.contract_type.clone(),
        contract_uri: contract.contract_uri.clone(),
        contract_expiration: contract.expiration,
        contract_permissions: contract.permissions.clone(),
        voting_systems: contract.voting_systems.clone(),
        oracles: contract.oracles.clone(),
        admin_oracle: contract.admin_oracle.clone(),
        admin_oracle_signature: contract.admin_oracle_signature.clone(),
        admin_oracle_sig_block_height: contract.admin_oracle_sig_block_height,
        master_address: contract.master_address.clone(),
        operator_included: contract.operator_address.is_some(),
        restricted_qty_assets: contract.restricted_qty_assets,
        contract_fee: contract.contract_fee,
    }
}

fn contract_from_terms(
    address: Address,
    terms: &ContractTerms,
    admin_address: Address,
    operator_address: Option<Address>,
    revision: u32,
    now: covenant_core::protocol::Timestamp,
) -> Contract {
    Contract {
        address,
        revision,
        admin_address,
        operator_address,
        master_address: terms.master_address.clone(),
        moved_to: None,
        contract_name: terms.contract_name.clone(),
        contract_type: terms.contract_type.clone(),
        contract_uri: terms.contract_uri.clone(),
        expiration: terms.contract_expiration,
        permissions: terms.contract_permissions.clone(),
        voting_systems: terms.voting_systems.clone(),
        oracles: terms.oracles.clone(),
        admin_oracle: terms.admin_oracle.clone(),
        admin_oracle_signature: terms.admin_oracle_signature.clone(),
        admin_oracle_sig_block_height: terms.admin_oracle_sig_block_height,
        restricted_qty_assets: terms.restricted_qty_assets,
        contract_fee: terms.contract_fee,
        freeze_period: covenant_core::protocol::Timestamp::ZERO,
        asset_codes: Vec::new(),
        admin_member_asset: Hash32::ZERO,
        created_at: now,
        updated_at: now,
    }
}

fn update_contract_from_terms(contract: &mut Contract, terms: &ContractTerms) {
    contract.contract_name = terms.contract_name.clone();
    contract.contract_type = terms.contract_type.clone();
    contract.contract_uri = terms.contract_uri.clone();
    contract.expiration = terms.contract_expiration;
    contract.permissions = terms.contract_permissions.clone();
    contract.voting_systems = terms.voting_systems.clone();
    contract.oracles = terms.oracles.clone();
    contract.admin_oracle = terms.admin_oracle.clone();
    contract.admin_oracle_signature = terms.admin_oracle_signature.clone();
    contract.admin_oracle_sig_block_height = terms.admin_oracle_sig_block_height;
    contract.master_address = terms.master_address.clone();
    contract.restricted_qty_assets = terms.restricted_qty_assets;
    contract.contract_fee = terms.contract_fee;
}

/// Applies amendments to contract terms in place.
pub fn apply_contract_amendments(
    terms: &mut ContractTerms,
    amendments: &[Amendment],
) -> Result<(), HandlerError> {
    for amendment in amendments {
        apply_one(terms, amendment)?;
    }

    // The matrix must still decode against the possibly changed voting
    // systems.
    Permissions::from_bytes(
        &terms.contract_permissions,
        CONTRACT_FIELD_COUNT,
        terms.voting_systems.len(),
    )
    .map_err(|_| {
        reject(
            RejectCode::MsgMalformed,
            "permission matrix invalid after amendments",
        )
    })?;
    Ok(())
}

fn apply_one(terms: &mut ContractTerms, amendment: &Amendment) -> Result<(), HandlerError> {
    let data = &amendment.data;
    match amendment.field_index {
        FIELD_CONTRACT_NAME => terms.contract_name = utf8(data)?,
        FIELD_CONTRACT_TYPE => terms.contract_type = utf8(data)?,
        FIELD_CONTRACT_URI => terms.contract_uri = utf8(data)?,
        FIELD_CONTRACT_EXPIRATION => {
            terms.contract_expiration = covenant_core::protocol::Timestamp(u64_le(data)?);
        }
        FIELD_CONTRACT_PERMISSIONS => terms.contract_permissions = data.clone(),
        FIELD_VOTING_SYSTEMS => apply_list(
            &mut terms.voting_systems,
            amendment,
            VotingSystem::from_bytes,
        )?,
        FIELD_ORACLES => apply_list(&mut terms.oracles, amendment, Oracle::from_bytes)?,
        FIELD_MASTER_ADDRESS => {
            terms.master_address = if data.is_empty() {
                None
            } else {
                Some(Address::from_bytes(data).map_err(|_| {
                    reject(RejectCode::MsgMalformed, "master address amendment invalid")
                })?)
            };
        }
        FIELD_RESTRICTED_QTY_ASSETS => terms.restricted_qty_assets = u64_le(data)?,
        FIELD_CONTRACT_FEE => terms.contract_fee = u64_le(data)?,
        FIELD_ADMIN_ORACLE => {
            terms.admin_oracle = if data.is_empty() {
                None
            } else {
                let oracle = Oracle::from_bytes(data).map_err(|_| {
                    reject(RejectCode::MsgMalformed, "admin oracle amendment invalid")
                })?;
                if PublicKey::from_bytes(&oracle.public_key).is_err() {
                    return Err(reject(
                        RejectCode::MsgMalformed,
                        "admin oracle public key invalid",
                    ));
                }
                Some(oracle)
            };
        }
        FIELD_ADMIN_ORACLE_SIGNATURE => {
            if Signature::from_der(data).is_err() {
                return Err(reject(
                    RejectCode::MsgMalformed,
                    "admin oracle signature amendment not DER",
                ));
            }
            terms.admin_oracle_signature = data.clone();
        }
        FIELD_ADMIN_ORACLE_SIG_BLOCK_HEIGHT => {
            let bytes: [u8; 4] = data.as_slice().try_into().map_err(|_| {
                reject(RejectCode::MsgMalformed, "endorsement height is four bytes")
            })?;
            terms.admin_oracle_sig_block_height = u32::from_le_bytes(bytes);
        }
        other => {
            return Err(reject(
                RejectCode::MsgMalformed,
                format!("contract field {other} is not amendable"),
            ))
        }
    }
    Ok(())
}

fn apply_list<T>(
    list: &mut Vec<T>,
    amendment: &Amendment,
    parse: impl Fn(&[u8]) -> Result<T, covenant_core::protocol::WireError>,
) -> Result<(), HandlerError> {
    let element = amendment.element as usize;
    match amendment.operation {
        AMENDMENT_OP_MODIFY => {
            if element >= list.len() {
                return Err(reject(
                    RejectCode::MsgMalformed,
                    "amendment element out of range",
                ));
            }
            list[element] = parse(&amendment.data)
                .map_err(|_| reject(RejectCode::MsgMalformed, "amendment element invalid"))?;
        }
        AMENDMENT_OP_ADD => {
            list.push(
                parse(&amendment.data)
                    .map_err(|_| reject(RejectCode::MsgMalformed, "amendment element invalid"))?,
            );
        }
        AMENDMENT_OP_DELETE => {
            if element >= list.len() {
                return Err(reject(
                    RejectCode::MsgMalformed,
                    "amendment element out of range",
                ));
            }
            list.remove(element);
        }
        _ => {
            return Err(reject(
                RejectCode::MsgMalformed,
                "unknown amendment operation",
            ))
        }
    }
    Ok(())
}

fn utf8(data: &[u8]) -> Result<String, HandlerError> {
    String::from_utf8(data.to_vec())
        .map_err(|_| reject(RejectCode::MsgMalformed, "amendment value is not utf-8"))
}

fn u64_le(data: &[u8]) -> Result<u64, HandlerError> {
    let bytes: [u8; 8] = data
        .try_into()
        .map_err(|_| reject(RejectCode::MsgMalformed, "amendment value is wrong size"))?;
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amendments_apply_in_order() {
        let mut terms = ContractTerms {
            contract_name: "Old".to_string(),
            contract_permissions: vec![0; CONTRACT_FIELD_COUNT],
            ..ContractTerms::default()
        };
        let amendments = vec![
            Amendment {
                field_index: FIELD_CONTRACT_NAME,
                operation: AMENDMENT_OP_MODIFY,
                element: 0,
                data: b"New".to_vec(),
            },
            Amendment {
                field_index: FIELD_CONTRACT_FEE,
                operation: AMENDMENT_OP_MODIFY,
                element: 0,
                data: 5_000u64.to_le_bytes().to_vec(),
            },
        ];
        apply_contract_amendments(&mut terms, &amendments).unwrap();
        assert_eq!(terms.contract_name, "New");
        assert_eq!(terms.contract_fee, 5_000);
    }

    #[test]
    fn list_amendment_add_and_delete() {
        let mut terms = ContractTerms {
            contract_permissions: vec![0; CONTRACT_FIELD_COUNT],
            ..ContractTerms::default()
        };
        let system = VotingSystem {
            name: "majority".to_string(),
            vote_type: covenant_core::protocol::VOTE_TYPE_PLURALITY,
            threshold_percentage: 0,
            vote_multiplier_permitted: false,
            holder_proposal_fee: 0,
        };
        // Adding a voting system invalidates a zero-width matrix, so grow
        // the matrix in the same amendment set.
        let mut matrix_with_one = vec![0u8; CONTRACT_FIELD_COUNT * 2];
        matrix_with_one.truncate(CONTRACT_FIELD_COUNT * 2);
        let amendments = vec![
            Amendment {
                field_index: FIELD_VOTING_SYSTEMS,
                operation: AMENDMENT_OP_ADD,
                element: 0,
                data: system.to_bytes().unwrap(),
            },
            Amendment {
                field_index: FIELD_CONTRACT_PERMISSIONS,
                operation: AMENDMENT_OP_MODIFY,
                element: 0,
                data: matrix_with_one,
            },
        ];
        apply_contract_amendments(&mut terms, &amendments).unwrap();
        assert_eq!(terms.voting_systems.len(), 1);

        let amendments = vec![
            Amendment {
                field_index: FIELD_VOTING_SYSTEMS,
                operation: AMENDMENT_OP_DELETE,
                element: 0,
                data: vec![],
            },
            Amendment {
                field_index: FIELD_CONTRACT_PERMISSIONS,
                operation: AMENDMENT_OP_MODIFY,
                element: 0,
                data: vec![0u8; CONTRACT_FIELD_COUNT],
            },
        ];
        apply_contract_amendments(&mut terms, &amendments).unwrap();
        assert!(terms.voting_systems.is_empty());
    }

    #[test]
    fn admin_oracle_fields_apply() {
        use covenant_core::bitcoin::{Network, PrivateKey};

        let mut terms = ContractTerms {
            contract_permissions: vec![0; CONTRACT_FIELD_COUNT],
            ..ContractTerms::default()
        };

        let oracle_key = PrivateKey::from_bytes(&[7; 32], Network::Test).unwrap();
        let oracle = Oracle {
            name: "Registry".to_string(),
            url: "https://oracle.example".to_string(),
            public_key: oracle_key.public_key().to_bytes(),
        };
        let signature = oracle_key
            .sign(&covenant_core::bitcoin::double_sha256(b"endorsement"))
            .unwrap();

        let amendments = vec![
            Amendment {
                field_index: FIELD_ADMIN_ORACLE,
                operation: AMENDMENT_OP_MODIFY,
                element: 0,
                data: oracle.to_bytes().unwrap(),
            },
            Amendment {
                field_index: FIELD_ADMIN_ORACLE_SIGNATURE,
                operation: AMENDMENT_OP_MODIFY,
                element: 0,
                data: signature.to_der(),
            },
            Amendment {
                field_index: FIELD_ADMIN_ORACLE_SIG_BLOCK_HEIGHT,
                operation: AMENDMENT_OP_MODIFY,
                element: 0,
                data: 42u32.to_le_bytes().to_vec(),
            },
        ];
        apply_contract_amendments(&mut terms, &amendments).unwrap();
        assert_eq!(terms.admin_oracle, Some(oracle));
        assert_eq!(terms.admin_oracle_sig_block_height, 42);

        // Clearing the oracle takes empty data; a garbage signature is
        // malformed.
        let clear = Amendment {
            field_index: FIELD_ADMIN_ORACLE,
            operation: AMENDMENT_OP_MODIFY,
            element: 0,
            data: vec![],
        };
        apply_contract_amendments(&mut terms, &[clear]).unwrap();
        assert_eq!(terms.admin_oracle, None);

        let bad_sig = Amendment {
            field_index: FIELD_ADMIN_ORACLE_SIGNATURE,
            operation: AMENDMENT_OP_MODIFY,
            element: 0,
            data: vec![0xff, 0x01],
        };
        assert!(apply_contract_amendments(&mut terms, &[bad_sig]).is_err());
    }

    #[test]
    fn reserved_field_rejected() {
        let mut terms = ContractTerms {
            contract_permissions: vec![0; CONTRACT_FIELD_COUNT],
            ..ContractTerms::default()
        };
        let amendment = Amendment {
            field_index: 15,
            operation: AMENDMENT_OP_MODIFY,
            element: 0,
            data: vec![],
        };
        assert!(apply_contract_amendments(&mut terms, &[amendment]).is_err());
    }

    #[test]
    fn wrong_size_scalar_rejected() {
        let mut terms = ContractTerms {
            contract_permissions: vec![0; CONTRACT_FIELD_COUNT],
            ..ContractTerms::default()
        };
        let amendment = Amendment {
            field_index: FIELD_CONTRACT_FEE,
            operation: AMENDMENT_OP_MODIFY,
            element: 0,
            data: vec![1, 2, 3],
        };
        assert!(apply_contract_amendments(&mut terms, &[amendment]).is_err());
    }
}
