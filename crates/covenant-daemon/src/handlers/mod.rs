//! Request validation and response commitment.
//!
//! Each protocol action has a request handler (validate the request
//! against current state, produce the response action) and, for responses,
//! a committer (apply the observed response to durable state). The
//! dispatcher routes between them; everything here is synchronous and runs
//! under the contract's serialization.
//!
//! Request handlers never mutate durable contract state. State changes
//! happen only in committers, when the network shows the agent its own
//! response — so local state always reflects what the chain saw.

pub mod asset;
pub mod contract;
pub mod enforcement;
pub mod governance;
pub mod message;
pub mod transfer;

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use covenant_core::bitcoin::{Address, Network, PrivateKey};
use covenant_core::protocol::{
    Action, Amendment, Permissions, RejectCode, Rejection, Timestamp, INITIATOR_ADMINISTRATION,
    INITIATOR_HOLDER,
};

use crate::builder::{build_response, BuildError, ResponseOutput};
use crate::config::FeeConfig;
use crate::external::{BlockHeaders, ExternalError, TxBroadcaster};
use crate::holdings::HoldingsCache;
use crate::inspector::InspectorTx;
use crate::scheduler::Scheduler;
use crate::state::Contract;
use crate::store::{Repositories, StoreError, TxCache, TxIndex};
use crate::wallet::{Wallet, WalletError};

/// Errors from request handling and response commitment.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The request is refused; an on-chain Rejection is emitted.
    #[error("rejected: {code} {reason}")]
    Reject {
        /// Rejection code.
        code: RejectCode,
        /// Log/reason text.
        reason: String,
    },

    /// Repository failure.
    #[error("store: {0}")]
    Store(#[from] StoreError),

    /// Response construction failure.
    #[error("build: {0}")]
    Build(#[from] BuildError),

    /// Collaborator failure; retried by the pipeline.
    #[error("external: {0}")]
    External(#[from] ExternalError),

    /// Wallet failure.
    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),

    /// An invariant would be violated by committing. The daemon refuses
    /// the commit and exits rather than diverge silently.
    #[error("invariant violation: {0}")]
    Fatal(String),
}

impl From<crate::storage::StorageError> for HandlerError {
    fn from(e: crate::storage::StorageError) -> Self {
        HandlerError::Store(StoreError::from(e))
    }
}

impl From<covenant_core::protocol::WireError> for HandlerError {
    fn from(e: covenant_core::protocol::WireError) -> Self {
        HandlerError::Build(BuildError::Encode(e))
    }
}

/// Shorthand for a rejection error.
pub fn reject(code: RejectCode, reason: impl Into<String>) -> HandlerError {
    HandlerError::Reject {
        code,
        reason: reason.into(),
    }
}

/// A request handler's answer: the response action and its notification
/// outputs.
pub struct HandlerResponse {
    /// The response message to put on chain.
    pub action: Action,
    /// Notification outputs in order; indexes are what response messages
    /// reference.
    pub outputs: Vec<ResponseOutput>,
    /// Change address; the contract address when `None`.
    pub change: Option<Address>,
    /// Request output indexes the response must not spend (settlement
    /// inputs bound to the request).
    pub exclude_outputs: Vec<u32>,
}

impl HandlerResponse {
    /// A response notifying only the contract itself.
    pub fn to_contract(action: Action, contract: &Address) -> Self {
        HandlerResponse {
            action,
            outputs: vec![ResponseOutput {
                address: contract.clone(),
                value: 0,
            }],
            change: None,
            exclude_outputs: Vec::new(),
        }
    }
}

/// Everything handlers need.
pub struct HandlerContext {
    /// Chain network.
    pub net: Network,
    /// Test protocol identifier in use.
    pub is_test: bool,
    /// Fee policy.
    pub fees: FeeConfig,
    /// Where contract fees go.
    pub fee_address: Option<Address>,
    /// Pending-transfer timeout.
    pub transfer_timeout_secs: u64,
    /// Oracle attestation recency window in blocks.
    pub oracle_recency_blocks: u32,
    /// State repositories.
    pub repos: Arc<Repositories>,
    /// Enriched-tx cache.
    pub tx_cache: Arc<TxCache>,
    /// Reorg index.
    pub tx_index: Arc<TxIndex>,
    /// Key store.
    pub wallet: Arc<Wallet>,
    /// Holdings cache.
    pub holdings: Arc<HoldingsCache>,
    /// Job scheduler.
    pub scheduler: Arc<Scheduler>,
    /// Header access for attestation recency.
    pub headers: Arc<dyn BlockHeaders>,
    /// Response broadcast.
    pub broadcaster: Arc<dyn TxBroadcaster>,
}

impl HandlerContext {
    /// Server time.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    /// The signing key for a controlled contract address.
    pub fn key(&self, contract: &Address) -> Result<PrivateKey, HandlerError> {
        Ok(self.wallet.get(contract)?)
    }
}

/// Runs the common request-validation preamble for an existing contract:
/// moved, frozen, expired, and (optionally) operator authority.
///
/// Offer requests skip this; they require the contract to not exist.
pub fn contract_preamble(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
    require_operator: bool,
) -> Result<Contract, HandlerError> {
    if let Some(code) = itx.reject_code {
        return Err(reject(code, "request failed codec validation"));
    }

    let contract = match ctx.repos.contract(contract_address) {
        Ok(contract) => contract,
        Err(StoreError::NotFound) => {
            return Err(reject(
                RejectCode::UnknownAddress,
                "no contract at this address",
            ))
        }
        Err(e) => return Err(e.into()),
    };

    // A moved contract answers nobody but its recorded master address.
    if contract.moved_to.is_some() {
        let from_master = match (&contract.master_address, itx.inputs.first()) {
            (Some(master), Some(input)) => input.address == *master,
            _ => false,
        };
        if !from_master {
            return Err(reject(RejectCode::ContractMoved, "contract address changed"));
        }
    }

    let now = ctx.now();
    if contract.freeze_period > now {
        return Err(reject(RejectCode::ContractFrozen, "contract frozen"));
    }

    if !contract.expiration.is_zero() && contract.expiration < now {
        return Err(reject(RejectCode::ContractExpired, "contract expired"));
    }

    if require_operator {
        let sender = itx
            .inputs
            .first()
            .map(|i| &i.address)
            .ok_or_else(|| reject(RejectCode::TxMalformed, "request has no inputs"))?;
        if !contract.is_operator(sender) {
            return Err(reject(
                RejectCode::NotOperator,
                "requestor is not administration or operator",
            ));
        }
    }

    Ok(contract)
}

/// Builds, signs, and broadcasts a response; caches the request tx so the
/// response committer can find it later.
pub fn respond(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
    response: HandlerResponse,
) -> Result<(), HandlerError> {
    ctx.tx_cache.save(itx)?;

    let key = ctx.key(contract_address)?;
    let contract_fee = match ctx.repos.contract(contract_address) {
        Ok(contract) => contract.contract_fee,
        Err(StoreError::NotFound) => match &response.action {
            // The formation for a fresh offer charges the offered fee.
            Action::ContractFormation(f) => f.terms.contract_fee,
            _ => 0,
        },
        Err(e) => return Err(e.into()),
    };

    let tx = build_response(
        itx,
        contract_address,
        &key,
        &response.action,
        &response.outputs,
        response.change.as_ref(),
        &ctx.fees,
        ctx.fee_address.as_ref(),
        contract_fee,
        &response.exclude_outputs,
        ctx.is_test,
    )?;

    ctx.broadcaster.broadcast(&tx)?;
    Ok(())
}

/// Emits an on-chain rejection for a request, exactly once per request tx.
pub fn emit_rejection(
    ctx: &HandlerContext,
    itx: &InspectorTx,
    contract_address: &Address,
    code: RejectCode,
    reason: &str,
) -> Result<(), HandlerError> {
    let marker = format!("rejections/{}", itx.txid);
    if ctx.repos.storage().read(&marker).is_ok() {
        return Ok(()); // already rejected
    }

    warn!(tx = %itx.txid, code = %code, reason, "rejecting request");

    let requester = match itx.inputs.first() {
        Some(input) => input.address.clone(),
        None => return Ok(()), // nothing to pay; nothing to say
    };

    let action = Action::Rejection(Rejection {
        reject_address_index: 0,
        rejection_code: code.as_u8(),
        message: reason.to_string(),
        timestamp: ctx.now(),
    });

    let key = ctx.key(contract_address)?;
    match build_response(
        itx,
        contract_address,
        &key,
        &action,
        &[ResponseOutput {
            address: requester,
            value: 0,
        }],
        None,
        &ctx.fees,
        None,
        0,
        &[],
        ctx.is_test,
    ) {
        Ok(tx) => ctx.broadcaster.broadcast(&tx)?,
        Err(e) => {
            // A request that does not fund the contract gets no on-chain
            // answer; the marker still suppresses retries.
            warn!(tx = %itx.txid, error = %e, "cannot fund rejection");
        }
    }

    ctx.repos
        .storage()
        .write(&marker, code.as_u8().to_string().as_bytes())?;
    Ok(())
}

/// Checks the permission matrix for a set of amendments.
///
/// `proposed` selects the proposal path (with `initiator` and
/// `vote_system`); otherwise the direct `permitted` flag decides.
/// `denied_code` is the rejection emitted on refusal (contract vs asset
/// permissions).
pub fn check_amendment_permissions(
    permissions: &Permissions,
    amendments: &[Amendment],
    proposed: bool,
    initiator: u8,
    vote_system: u8,
    denied_code: RejectCode,
) -> Result<(), HandlerError> {
    for amendment in amendments {
        let entry = permissions.field(amendment.field_index as usize).ok_or_else(|| {
            reject(
                RejectCode::MsgMalformed,
                format!("amendment field index {} out of range", amendment.field_index),
            )
        })?;

        if proposed {
            let allowed = match initiator {
                INITIATOR_ADMINISTRATION => entry.administration_proposal,
                INITIATOR_HOLDER => entry.holder_proposal,
                _ => false,
            };
            if !allowed {
                return Err(reject(
                    denied_code,
                    format!(
                        "field {} not amendable by initiator {}",
                        amendment.field_index, initiator
                    ),
                ));
            }
            match entry.voting_systems_allowed.get(vote_system as usize) {
                Some(true) => {}
                _ => {
                    return Err(reject(
                        denied_code,
                        format!(
                            "field {} not amendable under voting system {}",
                            amendment.field_index, vote_system
                        ),
                    ))
                }
            }
        } else if !entry.permitted {
            return Err(reject(
                denied_code,
                format!(
                    "field {} not amendable without a proposal",
                    amendment.field_index
                ),
            ));
        }
    }
    Ok(())
}

/// Resolves and checks the Result reference of a proposal-gated amendment.
///
/// Verifies the referenced tx is a completed accepting Result of this
/// contract whose amendments match byte for byte, and returns the vote for
/// later `MarkApplied`.
pub fn check_proposal_ref(
    ctx: &HandlerContext,
    contract_address: &Address,
    ref_tx_id: &covenant_core::bitcoin::Hash32,
    amendments: &[Amendment],
    expect_asset: Option<&covenant_core::bitcoin::Hash32>,
) -> Result<crate::state::VoteRecord, HandlerError> {
    let result_tx = ctx
        .tx_cache
        .get(ref_tx_id)
        .map_err(|_| reject(RejectCode::MsgMalformed, "result tx not found"))?;

    let Some(Action::Result(result)) = result_tx.action else {
        return Err(reject(RejectCode::MsgMalformed, "ref tx is not a result"));
    };

    let vote = ctx
        .repos
        .vote(contract_address, &result.vote_tx_id)
        .map_err(|_| reject(RejectCode::VoteNotFound, "vote not found"))?;

    if !vote.is_closed() {
        return Err(reject(RejectCode::MsgMalformed, "vote not complete"));
    }
    if vote.result.as_deref() != Some("A") {
        return Err(reject(RejectCode::MsgMalformed, "vote did not accept"));
    }
    if !vote.specific {
        return Err(reject(
            RejectCode::MsgMalformed,
            "vote was not for specific amendments",
        ));
    }

    match expect_asset {
        None => {
            if vote.asset_specific {
                return Err(reject(
                    RejectCode::MsgMalformed,
                    "vote was asset-specific, amendment is not",
                ));
            }
        }
        Some(code) => {
            if !vote.asset_specific || vote.asset_code != *code {
                return Err(reject(
                    RejectCode::MsgMalformed,
                    "vote does not cover this asset",
                ));
            }
        }
    }

    if vote.proposed_amendments.len() != amendments.len() {
        return Err(reject(
            RejectCode::MsgMalformed,
            "amendment count differs from proposal",
        ));
    }
    for (proposed, requested) in vote.proposed_amendments.iter().zip(amendments) {
        if proposed != requested {
            return Err(reject(
                RejectCode::MsgMalformed,
                "amendment differs from proposal",
            ));
        }
    }

    Ok(vote)
}
