//! Governance: Proposal, Vote, BallotCast, BallotCounted, Result, and the
//! scheduled vote finalizer.

use std::collections::BTreeMap;

use tracing::{info, warn};

use covenant_core::bitcoin::{Address, Hash32};
use covenant_core::protocol::{
    Action, BallotCounted, Permissions, RejectCode, Vote, VoteResult, VotingSystem,
    ASSET_FIELD_COUNT, CONTRACT_FIELD_COUNT, INITIATOR_ADMINISTRATION, INITIATOR_HOLDER,
    VOTE_TYPE_ABSOLUTE, VOTE_TYPE_PLURALITY, VOTE_TYPE_RELATIVE,
};

use crate::holdings::HoldingKey;
use crate::inspector::InspectorTx;
use crate::scheduler::{Job, JobPayload};
use crate::state::{Ballot, Contract, VoteRecord};
use crate::store::StoreError;

use super::{
    check_amendment_permissions, contract_preamble, reject, HandlerContext, HandlerError,
    HandlerResponse,
};

/// Handles `G01` Proposal; responds with a Vote opening the ballot.
pub fn proposal_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let contract = contract_preamble(ctx, itx, contract_address, false)?;

    let Some(Action::Proposal(proposal)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a proposal"));
    };

    if contract.voting_systems.is_empty() {
        return Err(reject(
            RejectCode::MsgMalformed,
            "contract offers no voting systems",
        ));
    }
    if contract
        .voting_systems
        .get(proposal.vote_system as usize)
        .is_none()
    {
        return Err(reject(
            RejectCode::MsgMalformed,
            "voting system index out of range",
        ));
    }

    let sender = itx
        .inputs
        .first()
        .map(|i| i.address.clone())
        .ok_or_else(|| reject(RejectCode::TxMalformed, "proposal has no inputs"))?;

    match proposal.initiator {
        INITIATOR_ADMINISTRATION => {
            if !contract.is_operator(&sender) {
                return Err(reject(
                    RejectCode::NotAdministration,
                    "administration proposal not from administration",
                ));
            }
        }
        INITIATOR_HOLDER => {
            if voting_balance(ctx, &contract, &sender, None, true)? == 0 {
                return Err(reject(
                    RejectCode::InsufficientAssets,
                    "holder proposal from a non-holder",
                ));
            }
        }
        _ => return Err(reject(RejectCode::MsgMalformed, "unknown initiator")),
    }

    let now = ctx.now();
    if proposal.vote_cut_off_timestamp <= now {
        return Err(reject(
            RejectCode::MsgMalformed,
            "vote cut-off already passed",
        ));
    }

    // Specific amendments must be permitted for this initiator under this
    // voting system.
    if proposal.specific {
        if proposal.asset_specific_vote {
            let asset = match ctx.repos.asset(contract_address, &proposal.asset_code) {
                Ok(asset) => asset,
                Err(StoreError::NotFound) => {
                    return Err(reject(RejectCode::AssetNotFound, "asset not found"))
                }
                Err(e) => return Err(e.into()),
            };
            let permissions = Permissions::from_bytes(
                &asset.permissions,
                ASSET_FIELD_COUNT,
                contract.voting_systems.len(),
            )
            .map_err(|_| HandlerError::Fatal("stored asset permissions corrupt".to_string()))?;
            check_amendment_permissions(
                &permissions,
                &proposal.proposed_amendments,
                true,
                proposal.initiator,
                proposal.vote_system,
                RejectCode::AssetPermissions,
            )?;
        } else {
            let permissions = Permissions::from_bytes(
                &contract.permissions,
                CONTRACT_FIELD_COUNT,
                contract.voting_systems.len(),
            )
            .map_err(|_| HandlerError::Fatal("stored permissions corrupt".to_string()))?;
            check_amendment_permissions(
                &permissions,
                &proposal.proposed_amendments,
                true,
                proposal.initiator,
                proposal.vote_system,
                RejectCode::ContractPermissions,
            )?;
        }
    }

    // An open vote over the same amendments blocks a duplicate.
    for vote in ctx.repos.list_votes(contract_address)? {
        if !vote.is_closed() && vote.proposed_amendments == proposal.proposed_amendments {
            return Err(reject(
                RejectCode::VoteExists,
                "an open vote already covers these amendments",
            ));
        }
    }

    info!(contract = %contract_address, "accepting proposal");

    Ok(Some(HandlerResponse::to_contract(
        Action::Vote(Vote { timestamp: now }),
        contract_address,
    )))
}

/// Commits `G02` Vote: creates the vote record and schedules its
/// finalizer.
pub fn vote_response(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::Vote(_)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a vote"));
    };

    match ctx.repos.vote(contract_address, &itx.txid) {
        Ok(_) => return Ok(()), // replayed response
        Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    let request_tx_id = itx
        .inputs
        .first()
        .map(|i| i.outpoint.txid)
        .ok_or_else(|| HandlerError::Fatal("vote has no inputs".to_string()))?;
    let request = ctx
        .tx_cache
        .get(&request_tx_id)
        .map_err(|_| HandlerError::Fatal(format!("proposal tx {request_tx_id} not cached")))?;
    let Some(Action::Proposal(proposal)) = &request.action else {
        return Err(HandlerError::Fatal("vote request is not a proposal".to_string()));
    };

    let contract = ctx.repos.contract(contract_address)?;
    let multiplier_permitted = contract
        .voting_systems
        .get(proposal.vote_system as usize)
        .map(|s| s.vote_multiplier_permitted)
        .unwrap_or(false);

    let token_qty_at_start = eligible_token_qty(
        ctx,
        &contract,
        if proposal.asset_specific_vote {
            Some(&proposal.asset_code)
        } else {
            None
        },
        multiplier_permitted,
    )?;

    let now = ctx.now();
    let record = VoteRecord {
        vote_tx_id: itx.txid,
        proposal_tx_id: request.txid,
        initiator: proposal.initiator,
        vote_system: proposal.vote_system,
        asset_specific: proposal.asset_specific_vote,
        asset_code: proposal.asset_code,
        specific: proposal.specific,
        proposed_amendments: proposal.proposed_amendments.clone(),
        vote_options: proposal.vote_options.clone(),
        vote_max: proposal.vote_max,
        expires: proposal.vote_cut_off_timestamp,
        ballots: BTreeMap::new(),
        option_tally: vec![0; proposal.vote_options.len()],
        token_qty_at_start,
        result: None,
        completed_at: covenant_core::protocol::Timestamp::ZERO,
        applied_at: covenant_core::protocol::Timestamp::ZERO,
        applied_by: Hash32::ZERO,
        created_at: now,
        updated_at: now,
    };
    ctx.repos.save_vote(contract_address, &record)?;

    // The vote tx funds the eventual Result response.
    ctx.tx_cache.save(itx)?;

    ctx.scheduler
        .schedule(Job {
            id: Job::vote_id(&itx.txid),
            contract: contract_address.clone(),
            due: record.expires,
            payload: JobPayload::FinalizeVote {
                vote_tx_id: itx.txid,
            },
        })
        .map_err(|e| HandlerError::Fatal(format!("cannot schedule vote finalizer: {e}")))?;

    info!(contract = %contract_address, vote = %itx.txid, "vote opened");
    Ok(())
}

/// Handles `G03` BallotCast; responds with a BallotCounted.
pub fn ballot_cast_request(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<Option<HandlerResponse>, HandlerError> {
    let contract = contract_preamble(ctx, itx, contract_address, false)?;

    let Some(Action::BallotCast(cast)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a ballot cast"));
    };

    let vote = match ctx.repos.vote(contract_address, &cast.vote_tx_id) {
        Ok(vote) => vote,
        Err(StoreError::NotFound) => {
            return Err(reject(RejectCode::VoteNotFound, "vote not found"))
        }
        Err(e) => return Err(e.into()),
    };

    if vote.is_closed() {
        return Err(reject(RejectCode::VoteClosed, "vote already closed"));
    }

    if cast.vote.is_empty()
        || cast.vote.len() > vote.vote_max as usize
        || !cast.vote.chars().all(|c| vote.vote_options.contains(c))
    {
        return Err(reject(RejectCode::MsgMalformed, "ballot options invalid"));
    }

    let voter = itx
        .inputs
        .first()
        .map(|i| i.address.clone())
        .ok_or_else(|| reject(RejectCode::TxMalformed, "ballot has no inputs"))?;

    if vote.ballots.contains_key(&voter.encode()) {
        return Err(reject(RejectCode::BallotExists, "ballot already counted"));
    }

    let multiplier_permitted = contract
        .voting_systems
        .get(vote.vote_system as usize)
        .map(|s| s.vote_multiplier_permitted)
        .unwrap_or(false);
    let weight = voting_balance(
        ctx,
        &contract,
        &voter,
        if vote.asset_specific {
            Some(&vote.asset_code)
        } else {
            None
        },
        multiplier_permitted,
    )?;
    if weight == 0 {
        return Err(reject(
            RejectCode::InsufficientAssets,
            "voter holds no voting balance",
        ));
    }

    info!(contract = %contract_address, vote = %cast.vote_tx_id, voter = %voter, "counting ballot");

    Ok(Some(HandlerResponse::to_contract(
        Action::BallotCounted(BallotCounted {
            vote_tx_id: cast.vote_tx_id,
            vote: cast.vote.clone(),
            quantity: weight,
            timestamp: ctx.now(),
        }),
        contract_address,
    )))
}

/// Commits `G04` BallotCounted: records the ballot and accumulates the
/// tally.
pub fn ballot_counted_response(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::BallotCounted(counted)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a ballot counted"));
    };

    let request_tx_id = itx
        .inputs
        .first()
        .map(|i| i.outpoint.txid)
        .ok_or_else(|| HandlerError::Fatal("ballot counted has no inputs".to_string()))?;
    let request = ctx
        .tx_cache
        .get(&request_tx_id)
        .map_err(|_| HandlerError::Fatal(format!("ballot tx {request_tx_id} not cached")))?;
    let voter = request
        .inputs
        .first()
        .map(|i| i.address.clone())
        .ok_or_else(|| HandlerError::Fatal("ballot tx has no inputs".to_string()))?;

    let mut vote = ctx.repos.vote(contract_address, &counted.vote_tx_id)?;
    if vote.ballots.contains_key(&voter.encode()) {
        return Ok(()); // replayed response
    }
    if vote.is_closed() {
        warn!(vote = %counted.vote_tx_id, "ballot counted after close; ignored");
        return Ok(());
    }

    let now = ctx.now();
    vote.ballots.insert(
        voter.encode(),
        Ballot {
            vote: counted.vote.clone(),
            quantity: counted.quantity,
            timestamp: now,
        },
    );
    for option in counted.vote.chars() {
        if let Some(position) = vote.vote_options.chars().position(|c| c == option) {
            vote.option_tally[position] += counted.quantity;
        }
    }
    vote.updated_at = now;
    ctx.repos.save_vote(contract_address, &vote)?;
    Ok(())
}

/// Runs the scheduled finalizer: tallies and emits the Result.
pub fn finalize_vote(
    ctx: &HandlerContext,
    contract_address: &Address,
    vote_tx_id: &Hash32,
) -> Result<(), HandlerError> {
    let vote = ctx.repos.vote(contract_address, vote_tx_id)?;
    if vote.is_closed() {
        return Ok(()); // already tallied
    }

    let contract = ctx.repos.contract(contract_address)?;
    let system = contract
        .voting_systems
        .get(vote.vote_system as usize)
        .ok_or_else(|| HandlerError::Fatal("vote references unknown voting system".to_string()))?;

    let result_letter = tally(&vote, system);

    // The Vote response tx funds the Result.
    let vote_tx = ctx
        .tx_cache
        .get(vote_tx_id)
        .map_err(|_| HandlerError::Fatal(format!("vote tx {vote_tx_id} not cached")))?;

    let result = VoteResult {
        asset_specific_vote: vote.asset_specific,
        asset_type: String::new(),
        asset_code: vote.asset_code,
        proposed_amendments: vote.proposed_amendments.clone(),
        vote_tx_id: *vote_tx_id,
        option_tally: vote.option_tally.clone(),
        result: result_letter.clone(),
        timestamp: ctx.now(),
    };

    info!(contract = %contract_address, vote = %vote_tx_id, result = %result_letter, "finalizing vote");

    super::respond(
        ctx,
        &vote_tx,
        contract_address,
        HandlerResponse::to_contract(Action::Result(result), contract_address),
    )
}

/// Commits `G05` Result: closes the vote.
pub fn result_response(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    let Some(Action::Result(result)) = &itx.action else {
        return Err(reject(RejectCode::MsgMalformed, "not a result"));
    };

    let mut vote = ctx.repos.vote(contract_address, &result.vote_tx_id)?;
    if vote.is_closed() {
        return Ok(()); // replayed response
    }

    let now = ctx.now();
    vote.result = Some(result.result.clone());
    vote.option_tally = result.option_tally.clone();
    vote.completed_at = now;
    vote.updated_at = now;
    ctx.repos.save_vote(contract_address, &vote)?;

    // The result tx is what amendments will reference.
    ctx.tx_cache.save(itx)?;

    ctx.scheduler
        .cancel(&Job::vote_id(&result.vote_tx_id))
        .ok();

    info!(contract = %contract_address, vote = %result.vote_tx_id, result = %result.result, "vote closed");
    Ok(())
}

/// Undoes a cancelled Vote response: drops the record it opened and its
/// finalizer. A vote that already closed stays on the books and is
/// flagged for the operator.
pub fn revert_vote(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
) -> Result<(), HandlerError> {
    match ctx.repos.vote(contract_address, &itx.txid) {
        Ok(vote) if !vote.is_closed() => {
            ctx.repos.remove_vote(contract_address, &itx.txid)?;
            ctx.scheduler.cancel(&Job::vote_id(&itx.txid)).ok();
            info!(contract = %contract_address, vote = %itx.txid, "cancelled vote withdrawn");
        }
        Ok(_) => {
            warn!(contract = %contract_address, vote = %itx.txid, "cancelled vote was already tallied; record retained");
        }
        Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Applies the voting system's tally rule. Returns the winning option
/// letter or `R` when nothing carries.
fn tally(vote: &VoteRecord, system: &VotingSystem) -> String {
    let options: Vec<char> = vote.vote_options.chars().collect();
    let best = vote
        .option_tally
        .iter()
        .enumerate()
        .max_by_key(|(_, tally)| **tally);

    let Some((best_index, best_tally)) = best else {
        return "R".to_string();
    };
    if *best_tally == 0 {
        return "R".to_string();
    }

    // Ties never carry.
    let tied = vote
        .option_tally
        .iter()
        .filter(|t| **t == *best_tally)
        .count()
        > 1;
    if tied {
        return "R".to_string();
    }

    let carried = match system.vote_type {
        VOTE_TYPE_PLURALITY => true,
        VOTE_TYPE_ABSOLUTE => {
            *best_tally * 100 >= u64::from(system.threshold_percentage) * vote.token_qty_at_start
        }
        VOTE_TYPE_RELATIVE => {
            let cast: u64 = vote.option_tally.iter().sum();
            // No option over the threshold of votes cast rejects.
            cast > 0 && *best_tally * 100 >= u64::from(system.threshold_percentage) * cast
        }
        _ => false,
    };

    if carried {
        options
            .get(best_index)
            .map(|c| c.to_string())
            .unwrap_or_else(|| "R".to_string())
    } else {
        "R".to_string()
    }
}

/// A party's voting balance: over one asset, or across every voting asset
/// of the contract.
fn voting_balance(
    ctx: &HandlerContext,
    contract: &Contract,
    party: &Address,
    asset_code: Option<&Hash32>,
    multiplier_permitted: bool,
) -> Result<u64, HandlerError> {
    let mut total = 0u64;
    for code in &contract.asset_codes {
        if let Some(filter) = asset_code {
            if filter != code {
                continue;
            }
        }
        let asset = match ctx.repos.asset(&contract.address, code) {
            Ok(asset) => asset,
            Err(StoreError::NotFound) => continue,
            Err(e) => return Err(e.into()),
        };
        if !asset.voting_rights {
            continue;
        }
        let holding = ctx.holdings.get(&HoldingKey {
            contract: contract.address.clone(),
            asset: *code,
            party: party.clone(),
        })?;
        let multiplier = if multiplier_permitted {
            u64::from(asset.vote_multiplier.max(1))
        } else {
            1
        };
        total += holding.finalized_balance * multiplier;
    }
    Ok(total)
}

/// Total eligible voting quantity across the contract (or one asset).
fn eligible_token_qty(
    ctx: &HandlerContext,
    contract: &Contract,
    asset_code: Option<&Hash32>,
    multiplier_permitted: bool,
) -> Result<u64, HandlerError> {
    let mut total = 0u64;
    for code in &contract.asset_codes {
        if let Some(filter) = asset_code {
            if filter != code {
                continue;
            }
        }
        let asset = match ctx.repos.asset(&contract.address, code) {
            Ok(asset) => asset,
            Err(StoreError::NotFound) => continue,
            Err(e) => return Err(e.into()),
        };
        if !asset.voting_rights {
            continue;
        }
        let multiplier = if multiplier_permitted {
            u64::from(asset.vote_multiplier.max(1))
        } else {
            1
        };
        total += asset.token_qty * multiplier;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use covenant_core::protocol::Timestamp;

    fn vote_with_tally(options: &str, tally: Vec<u64>, eligible: u64) -> VoteRecord {
        VoteRecord {
            vote_tx_id: Hash32::hash(b"vote"),
            proposal_tx_id: Hash32::hash(b"proposal"),
            initiator: INITIATOR_ADMINISTRATION,
            vote_system: 0,
            asset_specific: false,
            asset_code: Hash32::ZERO,
            specific: false,
            proposed_amendments: vec![],
            vote_options: options.to_string(),
            vote_max: 1,
            expires: Timestamp(100),
            ballots: BTreeMap::new(),
            option_tally: tally,
            token_qty_at_start: eligible,
            result: None,
            completed_at: Timestamp::ZERO,
            applied_at: Timestamp::ZERO,
            applied_by: Hash32::ZERO,
            created_at: Timestamp(1),
            updated_at: Timestamp(1),
        }
    }

    fn system(vote_type: u8, threshold: u8) -> VotingSystem {
        VotingSystem {
            name: "s".to_string(),
            vote_type,
            threshold_percentage: threshold,
            vote_multiplier_permitted: false,
            holder_proposal_fee: 0,
        }
    }

    #[test]
    fn plurality_picks_the_leader() {
        let vote = vote_with_tally("AR", vec![700, 300], 1_000);
        assert_eq!(tally(&vote, &system(VOTE_TYPE_PLURALITY, 0)), "A");

        let vote = vote_with_tally("AR", vec![300, 700], 1_000);
        assert_eq!(tally(&vote, &system(VOTE_TYPE_PLURALITY, 0)), "R");
    }

    #[test]
    fn absolute_threshold_counts_eligible_tokens() {
        // 600 of 1000 eligible = 60%.
        let vote = vote_with_tally("AR", vec![600, 100], 1_000);
        assert_eq!(tally(&vote, &system(VOTE_TYPE_ABSOLUTE, 60)), "A");
        assert_eq!(tally(&vote, &system(VOTE_TYPE_ABSOLUTE, 61)), "R");
    }

    #[test]
    fn relative_threshold_counts_votes_cast() {
        // 600 of 700 cast = ~86%.
        let vote = vote_with_tally("AR", vec![600, 100], 100_000);
        assert_eq!(tally(&vote, &system(VOTE_TYPE_RELATIVE, 85)), "A");
        assert_eq!(tally(&vote, &system(VOTE_TYPE_RELATIVE, 90)), "R");
    }

    #[test]
    fn relative_threshold_multi_option_nothing_carries() {
        // Three options, none reaching 50% of cast votes: reject.
        let vote = vote_with_tally("ABC", vec![40, 35, 25], 1_000);
        assert_eq!(tally(&vote, &system(VOTE_TYPE_RELATIVE, 50)), "R");
    }

    #[test]
    fn empty_and_tied_votes_reject() {
        let vote = vote_with_tally("AR", vec![0, 0], 1_000);
        assert_eq!(tally(&vote, &system(VOTE_TYPE_PLURALITY, 0)), "R");

        let vote = vote_with_tally("AR", vec![500, 500], 1_000);
        assert_eq!(tally(&vote, &system(VOTE_TYPE_PLURALITY, 0)), "R");
    }
}
