//! Durable state records.
//!
//! These are the blobs the repositories persist, serialized as JSON. Wire
//! types from `covenant-core` are embedded directly where they already have
//! serde implementations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use covenant_core::bitcoin::{Address, Hash32};
use covenant_core::protocol::{Amendment, Oracle, Timestamp, VotingSystem};

/// Status code: holding frozen by an enforcement order.
pub const HOLDING_STATUS_FREEZE: char = 'F';
/// Status code: holding held by an administrative action.
pub const HOLDING_STATUS_HOLD: char = 'H';

/// A contract controlled by this agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    /// The agent-controlled address the contract lives at.
    pub address: Address,
    /// Revision, bumped by each applied amendment.
    pub revision: u32,
    /// The administration address (first input of the accepted offer).
    pub admin_address: Address,
    /// Optional operator address (second input of the accepted offer).
    pub operator_address: Option<Address>,
    /// Optional master address allowed to move the contract.
    pub master_address: Option<Address>,
    /// Successor address after a contract move; requests are rejected while
    /// set.
    pub moved_to: Option<Address>,
    /// Display name.
    pub contract_name: String,
    /// Kind of agreement.
    pub contract_type: String,
    /// Off-chain document URI.
    pub contract_uri: String,
    /// Expiry; zero for perpetual.
    pub expiration: Timestamp,
    /// Serialized permission matrix over the contract fields.
    pub permissions: Vec<u8>,
    /// Offered voting systems.
    pub voting_systems: Vec<VotingSystem>,
    /// Registered identity oracles.
    pub oracles: Vec<Oracle>,
    /// Oracle endorsing the administration and operator, if any.
    pub admin_oracle: Option<Oracle>,
    /// DER signature by the admin oracle over the administration digest.
    pub admin_oracle_signature: Vec<u8>,
    /// Height of the block hash the endorsement commits to.
    pub admin_oracle_sig_block_height: u32,
    /// Asset-count limit; zero means unlimited.
    pub restricted_qty_assets: u64,
    /// Fee in satoshis charged per responded request.
    pub contract_fee: u64,
    /// Contract-wide freeze expiry; zero when not frozen.
    pub freeze_period: Timestamp,
    /// Codes of the contract's assets, in creation order.
    pub asset_codes: Vec<Hash32>,
    /// Code of the Owner/Administrator membership asset, if one exists.
    pub admin_member_asset: Hash32,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

impl Contract {
    /// True when `address` is the administration or the operator.
    #[must_use]
    pub fn is_operator(&self, address: &Address) -> bool {
        *address == self.admin_address || Some(address) == self.operator_address.as_ref()
    }

    /// True when another asset may still be defined.
    #[must_use]
    pub fn can_have_more_assets(&self) -> bool {
        self.restricted_qty_assets == 0
            || (self.asset_codes.len() as u64) < self.restricted_qty_assets
    }
}

/// An asset under a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Deterministic asset code.
    pub asset_code: Hash32,
    /// Revision, bumped by each applied modification.
    pub revision: u32,
    /// Asset type code.
    pub asset_type: String,
    /// Serialized permission matrix over the asset fields.
    pub permissions: Vec<u8>,
    /// Whether holders may transfer the asset.
    pub transfers_permitted: bool,
    /// Whether enforcement orders apply.
    pub enforcement_orders_permitted: bool,
    /// Whether holdings carry voting weight.
    pub voting_rights: bool,
    /// Per-token vote multiplier.
    pub vote_multiplier: u8,
    /// Total token quantity.
    pub token_qty: u64,
    /// Serialized asset payload.
    pub payload: Vec<u8>,
    /// Asset-wide freeze expiry; zero when not frozen.
    pub freeze_period: Timestamp,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

/// A tentative balance adjustment keyed by its request tx.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    /// Adjustment amount.
    pub amount: u64,
    /// When the adjustment was reserved.
    pub timestamp: Timestamp,
}

/// A freeze or hold recorded against a holding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingStatus {
    /// `F` freeze or `H` hold.
    pub code: char,
    /// Expiry; zero holds until explicitly cleared.
    pub expires: Timestamp,
    /// Quantity covered by the status.
    pub balance: u64,
    /// The tx that created the status (the Freeze response).
    pub tx_id: Hash32,
}

/// How many applied response tx ids a holding remembers for replay
/// idempotence.
const APPLIED_HISTORY: usize = 32;

/// One party's balance in one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    /// The holding party.
    pub address: Address,
    /// Balance as of the last committed response.
    pub finalized_balance: u64,
    /// Tentative credits keyed by request tx id (hex).
    pub pending_credits: BTreeMap<String, PendingEntry>,
    /// Tentative debits keyed by request tx id (hex).
    pub pending_debits: BTreeMap<String, PendingEntry>,
    /// Active freezes and holds.
    pub statuses: Vec<HoldingStatus>,
    /// Recently applied response tx ids, newest last.
    pub applied: Vec<Hash32>,
    /// Last update time.
    pub updated_at: Timestamp,
}

impl Holding {
    /// A fresh, empty holding for `address`.
    #[must_use]
    pub fn new(address: Address) -> Self {
        Holding {
            address,
            finalized_balance: 0,
            pending_credits: BTreeMap::new(),
            pending_debits: BTreeMap::new(),
            statuses: Vec::new(),
            applied: Vec::new(),
            updated_at: Timestamp::ZERO,
        }
    }

    /// Sum of pending debits.
    #[must_use]
    pub fn pending_debit_total(&self) -> u64 {
        self.pending_debits.values().map(|e| e.amount).sum()
    }

    /// Quantity covered by unexpired statuses at `now`.
    #[must_use]
    pub fn frozen_quantity(&self, now: Timestamp) -> u64 {
        self.statuses
            .iter()
            .filter(|s| s.expires.is_zero() || s.expires > now)
            .map(|s| s.balance)
            .sum()
    }

    /// Balance available to spend at `now`: finalized minus frozen minus
    /// pending debits, saturating at zero.
    #[must_use]
    pub fn spendable(&self, now: Timestamp) -> u64 {
        self.finalized_balance
            .saturating_sub(self.frozen_quantity(now))
            .saturating_sub(self.pending_debit_total())
    }

    /// True when the response tx has already been applied to this holding.
    #[must_use]
    pub fn was_applied(&self, tx_id: &Hash32) -> bool {
        self.applied.contains(tx_id)
    }

    /// Records an applied response tx, keeping bounded history.
    pub fn mark_applied(&mut self, tx_id: Hash32) {
        if self.applied.contains(&tx_id) {
            return;
        }
        self.applied.push(tx_id);
        if self.applied.len() > APPLIED_HISTORY {
            self.applied.remove(0);
        }
    }

    /// Forgets an applied response tx after the network cancelled it, so a
    /// replacement response is free to apply.
    pub fn unmark_applied(&mut self, tx_id: &Hash32) {
        self.applied.retain(|id| id != tx_id);
    }
}

/// A ballot counted in a vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    /// Options as cast, in preference order.
    pub vote: String,
    /// Weight counted.
    pub quantity: u64,
    /// When the ballot was counted.
    pub timestamp: Timestamp,
}

/// An open or completed vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    /// The Vote response tx that opened the vote.
    pub vote_tx_id: Hash32,
    /// The Proposal request tx.
    pub proposal_tx_id: Hash32,
    /// `INITIATOR_ADMINISTRATION` or `INITIATOR_HOLDER`.
    pub initiator: u8,
    /// Index into the contract's voting systems.
    pub vote_system: u8,
    /// Whether the vote is scoped to one asset.
    pub asset_specific: bool,
    /// Asset code when asset-specific.
    pub asset_code: Hash32,
    /// Whether the proposal carries specific amendments.
    pub specific: bool,
    /// The amendments voted on.
    pub proposed_amendments: Vec<Amendment>,
    /// Ballot option letters.
    pub vote_options: String,
    /// Maximum options one ballot may rank.
    pub vote_max: u8,
    /// Voting deadline.
    pub expires: Timestamp,
    /// Counted ballots keyed by voter address (base58).
    pub ballots: BTreeMap<String, Ballot>,
    /// Running tally per option, in option order.
    pub option_tally: Vec<u64>,
    /// Total token quantity eligible when the vote opened.
    pub token_qty_at_start: u64,
    /// Result letter once tallied (`A`, `R`, or a winning option).
    pub result: Option<String>,
    /// When tallying completed; zero while open.
    pub completed_at: Timestamp,
    /// When a later amendment applied the result; zero until then.
    pub applied_at: Timestamp,
    /// Tx id of the amendment that applied the result.
    pub applied_by: Hash32,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

impl VoteRecord {
    /// True once the vote has been tallied.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.completed_at.is_zero()
    }
}

/// Lifecycle of a pending multi-contract transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Balances reserved; waiting to act.
    Reserved,
    /// Follower waiting for the settlement request hop.
    AwaitingSettlementRequest,
    /// Leader waiting for signatures or the final settlement broadcast.
    AwaitingSignatures,
    /// Settlement observed and committed.
    Settled,
    /// Timed out; rejection emitted and reservations released.
    TimedOut,
    /// Rejected by a participant; reservations released.
    Rejected,
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TransferState::Reserved => "reserved",
            TransferState::AwaitingSettlementRequest => "awaiting_settlement_request",
            TransferState::AwaitingSignatures => "awaiting_signatures",
            TransferState::Settled => "settled",
            TransferState::TimedOut => "timed_out",
            TransferState::Rejected => "rejected",
        };
        write!(f, "{text}")
    }
}

/// A reservation attached to a holding for a pending transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Asset the reservation is against.
    pub asset_code: Hash32,
    /// Holding party.
    pub party: Address,
    /// Reserved amount.
    pub amount: u64,
    /// True for a pending debit, false for a pending credit.
    pub is_debit: bool,
}

/// A multi-contract transfer awaiting settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransfer {
    /// The transfer request tx.
    pub transfer_tx_id: Hash32,
    /// When the transfer times out.
    pub timeout: Timestamp,
    /// Current lifecycle state.
    pub state: TransferState,
    /// Whether this agent is the first participating contract.
    pub is_leader: bool,
    /// Reservations this agent attached, for release on abort.
    pub reservations: Vec<Reservation>,
    /// The latest settlement-request blob received or produced.
    pub settlement_request: Option<Vec<u8>>,
    /// Collected oracle signatures for this transfer's receivers.
    pub oracle_sigs: Vec<Vec<u8>>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last update time.
    pub updated_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use covenant_core::bitcoin::Network;

    fn holding() -> Holding {
        Holding::new(Address::pkh([1; 20], Network::Test))
    }

    #[test]
    fn spendable_subtracts_freezes_and_debits() {
        let mut h = holding();
        h.finalized_balance = 100;
        h.statuses.push(HoldingStatus {
            code: HOLDING_STATUS_FREEZE,
            expires: Timestamp(1_000),
            balance: 30,
            tx_id: Hash32::hash(b"freeze"),
        });
        h.pending_debits.insert(
            Hash32::hash(b"transfer").to_string(),
            PendingEntry {
                amount: 20,
                timestamp: Timestamp(1),
            },
        );

        assert_eq!(h.spendable(Timestamp(500)), 50);
        // The freeze expired.
        assert_eq!(h.spendable(Timestamp(2_000)), 80);
    }

    #[test]
    fn spendable_saturates() {
        let mut h = holding();
        h.finalized_balance = 10;
        h.statuses.push(HoldingStatus {
            code: HOLDING_STATUS_FREEZE,
            expires: Timestamp::ZERO,
            balance: 50,
            tx_id: Hash32::hash(b"freeze"),
        });
        assert_eq!(h.spendable(Timestamp(1)), 0);
    }

    #[test]
    fn applied_history_is_bounded_and_idempotent() {
        let mut h = holding();
        let tx = Hash32::hash(b"settlement");
        h.mark_applied(tx);
        h.mark_applied(tx);
        assert_eq!(h.applied.len(), 1);
        assert!(h.was_applied(&tx));

        for i in 0..100u32 {
            h.mark_applied(Hash32::hash(&i.to_le_bytes()));
        }
        assert!(h.applied.len() <= 32);
    }

    #[test]
    fn contract_asset_cap() {
        let addr = Address::pkh([2; 20], Network::Test);
        let mut contract = Contract {
            address: addr.clone(),
            revision: 0,
            admin_address: addr.clone(),
            operator_address: None,
            master_address: None,
            moved_to: None,
            contract_name: String::new(),
            contract_type: String::new(),
            contract_uri: String::new(),
            expiration: Timestamp::ZERO,
            permissions: vec![],
            voting_systems: vec![],
            oracles: vec![],
            admin_oracle: None,
            admin_oracle_signature: vec![],
            admin_oracle_sig_block_height: 0,
            restricted_qty_assets: 1,
            contract_fee: 0,
            freeze_period: Timestamp::ZERO,
            asset_codes: vec![],
            admin_member_asset: Hash32::ZERO,
            created_at: Timestamp::ZERO,
            updated_at: Timestamp::ZERO,
        };
        assert!(contract.can_have_more_assets());
        contract.asset_codes.push(Hash32::hash(b"a"));
        assert!(!contract.can_have_more_assets());
        contract.restricted_qty_assets = 0;
        assert!(contract.can_have_more_assets());
    }
}
