//! Action routing.
//!
//! Two tables keyed by action code: requests route to validators that
//! produce responses, responses route to committers that mutate state.
//! Processing is always two-phase per tx: committers run first so local
//! state reflects what the network saw, then request validators run.
//!
//! Scheduled events re-enter through [`Dispatcher::reprocess`]; txs the
//! network cancelled for good land on [`Dispatcher::revert`].

use std::sync::Arc;

use tracing::{debug, warn};

use covenant_core::bitcoin::Address;
use covenant_core::protocol::{Action, ActionCode};

use crate::handlers::{self, HandlerContext, HandlerError};
use crate::inspector::InspectorTx;
use crate::scheduler::JobPayload;

/// Why a tx is being run through the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchCause {
    /// The tx reached a processable ingest state.
    See,
    /// A scheduled job re-entered the pipeline.
    Reprocess,
    /// The network took the tx back; undo its effects.
    Revert,
}

/// The router.
pub struct Dispatcher {
    ctx: Arc<HandlerContext>,
}

impl Dispatcher {
    /// Builds a dispatcher over the shared handler context.
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Dispatcher { ctx }
    }

    /// The shared handler context.
    #[must_use]
    pub fn context(&self) -> &Arc<HandlerContext> {
        &self.ctx
    }

    /// Routes a tx by its dispatch cause.
    pub fn dispatch(&self, cause: DispatchCause, itx: &InspectorTx) -> Result<(), HandlerError> {
        match cause {
            DispatchCause::See => self.process_tx(itx),
            DispatchCause::Revert => self.revert(itx),
            // Reprocess events carry a job payload, not a tx; they enter
            // through `reprocess`.
            DispatchCause::Reprocess => Ok(()),
        }
    }

    /// Runs a processable tx through both phases.
    pub fn process_tx(&self, itx: &InspectorTx) -> Result<(), HandlerError> {
        if itx.is_response() {
            self.run_responses(itx)?;
        }
        if itx.is_request() {
            self.run_requests(itx)?;
        }
        Ok(())
    }

    /// Phase 1: commit observed responses.
    fn run_responses(&self, itx: &InspectorTx) -> Result<(), HandlerError> {
        let Some(action) = &itx.action else {
            return Ok(());
        };
        let code = action.code();

        // Settlements and rejections concern every controlled contract
        // they touch; other responses are strictly self-produced.
        let targets: Vec<Address> = match code {
            ActionCode::SETTLEMENT => {
                let mut targets = Vec::new();
                for input in &itx.inputs {
                    if self.ctx.wallet.controls(&input.address)
                        && !targets.contains(&input.address)
                    {
                        targets.push(input.address.clone());
                    }
                }
                targets
            }
            ActionCode::REJECTION => self.ctx.wallet.addresses(),
            _ => itx
                .inputs
                .first()
                .map(|i| i.address.clone())
                .filter(|a| self.ctx.wallet.controls(a))
                .into_iter()
                .collect(),
        };

        for contract in targets {
            let result = match code {
                ActionCode::CONTRACT_FORMATION => {
                    handlers::contract::formation_response(&self.ctx, itx, &contract)
                }
                ActionCode::ASSET_CREATION => {
                    handlers::asset::creation_response(&self.ctx, itx, &contract)
                }
                ActionCode::SETTLEMENT => {
                    handlers::transfer::settlement_response(&self.ctx, itx, &contract)
                }
                ActionCode::VOTE => handlers::governance::vote_response(&self.ctx, itx, &contract),
                ActionCode::BALLOT_COUNTED => {
                    handlers::governance::ballot_counted_response(&self.ctx, itx, &contract)
                }
                ActionCode::RESULT => {
                    handlers::governance::result_response(&self.ctx, itx, &contract)
                }
                ActionCode::FREEZE => {
                    handlers::enforcement::freeze_response(&self.ctx, itx, &contract)
                }
                ActionCode::THAW => handlers::enforcement::thaw_response(&self.ctx, itx, &contract),
                ActionCode::CONFISCATION => {
                    handlers::enforcement::confiscation_response(&self.ctx, itx, &contract)
                }
                ActionCode::RECONCILIATION => {
                    handlers::enforcement::reconciliation_response(&self.ctx, itx, &contract)
                }
                ActionCode::REJECTION => {
                    handlers::message::process_rejection(&self.ctx, itx, &contract)
                }
                ActionCode::MESSAGE => Ok(()), // handled on the request side
                other => {
                    debug!(code = %other, "no response committer");
                    Ok(())
                }
            };

            match result {
                Ok(()) => {}
                Err(HandlerError::Reject { code, reason }) => {
                    // Response commits do not reject; a malformed observed
                    // response is logged and skipped.
                    warn!(tx = %itx.txid, code = %code, reason, "response commit skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Phase 2: validate requests and emit responses.
    fn run_requests(&self, itx: &InspectorTx) -> Result<(), HandlerError> {
        let Some(action) = &itx.action else {
            return Ok(());
        };
        let code = action.code();

        for contract in itx.contract_addresses() {
            if !self.ctx.wallet.controls(&contract) {
                continue;
            }

            let result = match code {
                ActionCode::CONTRACT_OFFER => {
                    handlers::contract::offer_request(&self.ctx, itx, &contract)
                }
                ActionCode::CONTRACT_AMENDMENT => {
                    handlers::contract::amendment_request(&self.ctx, itx, &contract)
                }
                ActionCode::CONTRACT_ADDRESS_CHANGE => {
                    handlers::contract::address_change_request(&self.ctx, itx, &contract)
                }
                ActionCode::ASSET_DEFINITION => {
                    handlers::asset::definition_request(&self.ctx, itx, &contract)
                }
                ActionCode::ASSET_MODIFICATION => {
                    handlers::asset::modification_request(&self.ctx, itx, &contract)
                }
                ActionCode::TRANSFER => {
                    handlers::transfer::transfer_request(&self.ctx, itx, &contract)
                }
                ActionCode::PROPOSAL => {
                    handlers::governance::proposal_request(&self.ctx, itx, &contract)
                }
                ActionCode::BALLOT_CAST => {
                    handlers::governance::ballot_cast_request(&self.ctx, itx, &contract)
                }
                ActionCode::ORDER => {
                    handlers::enforcement::order_request(&self.ctx, itx, &contract)
                }
                ActionCode::MESSAGE => {
                    handlers::message::process_message(&self.ctx, itx, &contract)
                }
                other => {
                    debug!(code = %other, "no request handler");
                    Ok(None)
                }
            };

            match result {
                Ok(Some(response)) => handlers::respond(&self.ctx, itx, &contract, response)?,
                Ok(None) => {}
                Err(HandlerError::Reject { code, reason }) => {
                    handlers::emit_rejection(&self.ctx, itx, &contract, code, &reason)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Routes a scheduled job through the same committers.
    pub fn reprocess(&self, contract: &Address, payload: &JobPayload) -> Result<(), HandlerError> {
        match payload {
            JobPayload::FinalizeVote { vote_tx_id } => {
                handlers::governance::finalize_vote(&self.ctx, contract, vote_tx_id)
            }
            JobPayload::TransferTimeout { transfer_tx_id } => {
                handlers::transfer::transfer_timeout(&self.ctx, contract, transfer_tx_id)
            }
        }
    }

    /// Undoes the effects of a tx the network cancelled for good.
    ///
    /// Transfers release their reservations; freezes withdraw their
    /// status entries; votes drop the record and finalizer they opened.
    /// Settlement, confiscation, and reconciliation rows carry absolute
    /// resulting balances, so a replacement response self-corrects when it
    /// commits; formations and creations are revision-guarded and a
    /// cancelled one that already applied is flagged for the operator.
    pub fn revert(&self, itx: &InspectorTx) -> Result<(), HandlerError> {
        let Some(action) = &itx.action else {
            return Ok(());
        };

        match action {
            Action::Transfer(_) => {
                for contract in itx.contract_addresses() {
                    if self.ctx.wallet.controls(&contract) {
                        handlers::transfer::abort_transfer(&self.ctx, &contract, &itx.txid)?;
                    }
                }
            }
            Action::Freeze(_) => {
                if let Some(contract) = self.self_produced_target(itx) {
                    handlers::enforcement::revert_freeze(&self.ctx, itx, &contract)?;
                }
            }
            Action::Vote(_) => {
                if let Some(contract) = self.self_produced_target(itx) {
                    handlers::governance::revert_vote(&self.ctx, itx, &contract)?;
                }
            }
            _ if action.code().is_response() => {
                warn!(
                    tx = %itx.txid,
                    code = %action.code(),
                    "cancelled response retained in state; a replacement commit supersedes it"
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// The controlled contract a self-produced response came from.
    fn self_produced_target(&self, itx: &InspectorTx) -> Option<Address> {
        itx.inputs
            .first()
            .map(|i| i.address.clone())
            .filter(|a| self.ctx.wallet.controls(a))
    }
}
