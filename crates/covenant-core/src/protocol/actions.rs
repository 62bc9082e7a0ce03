//! Protocol actions and the data-output envelope.
//!
//! Every tokenized message travels in a single data-only transaction
//! output: `OP_FALSE OP_RETURN PUSH(payload)` where the payload is a
//! 4-byte protocol identifier, a 3-character action code, and the action's
//! fixed-order field serialization.
//!
//! Round-trip serialize/deserialize is byte-exact for every action; any
//! decode failure is a [`WireError`] and maps to the `MsgMalformed`
//! rejection.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::bitcoin::{self, Address, Hash32};

use super::fields::{
    Amendment, AssetSettlement, AssetTransfer, Oracle, QuantityIndex, TargetAddress, VotingSystem,
};
use super::wire::{
    read_bool, read_hash, read_opt_address, read_timestamp, read_u16, read_u32, read_u64, read_u8,
    read_var_bytes, read_var_char, write_bool, write_hash, write_opt_address, write_timestamp,
    write_var_bytes, write_var_char, Timestamp, WireError,
};

/// Protocol identifier on the production chain.
pub const PROTOCOL_ID: [u8; 4] = *b"CVNT";
/// Protocol identifier on test chains.
pub const TEST_PROTOCOL_ID: [u8; 4] = *b"cvnt";

/// Compliance action: freeze holdings.
pub const COMPLIANCE_FREEZE: u8 = b'F';
/// Compliance action: reverse a prior freeze.
pub const COMPLIANCE_THAW: u8 = b'T';
/// Compliance action: confiscate holdings to a deposit address.
pub const COMPLIANCE_CONFISCATION: u8 = b'C';
/// Compliance action: reconcile holdings downward.
pub const COMPLIANCE_RECONCILIATION: u8 = b'R';

/// Proposal raised by the administration.
pub const INITIATOR_ADMINISTRATION: u8 = 0;
/// Proposal raised by a token holder.
pub const INITIATOR_HOLDER: u8 = 1;

/// A 3-character action code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionCode(pub [u8; 3]);

macro_rules! action_codes {
    ($($(#[$doc:meta])* $name:ident = $code:literal),* $(,)?) => {
        impl ActionCode {
            $($(#[$doc])* pub const $name: ActionCode = ActionCode(*$code);)*
        }
    };
}

action_codes! {
    /// Contract offer request.
    CONTRACT_OFFER = b"C01",
    /// Contract formation response.
    CONTRACT_FORMATION = b"C02",
    /// Contract amendment request.
    CONTRACT_AMENDMENT = b"C03",
    /// Contract address change request.
    CONTRACT_ADDRESS_CHANGE = b"C04",
    /// Asset definition request.
    ASSET_DEFINITION = b"A01",
    /// Asset creation response.
    ASSET_CREATION = b"A02",
    /// Asset modification request.
    ASSET_MODIFICATION = b"A03",
    /// Transfer request.
    TRANSFER = b"T01",
    /// Settlement response.
    SETTLEMENT = b"T02",
    /// Governance proposal request.
    PROPOSAL = b"G01",
    /// Vote response.
    VOTE = b"G02",
    /// Ballot cast request.
    BALLOT_CAST = b"G03",
    /// Ballot counted response.
    BALLOT_COUNTED = b"G04",
    /// Vote result response.
    RESULT = b"G05",
    /// Enforcement order request.
    ORDER = b"E01",
    /// Freeze response.
    FREEZE = b"E02",
    /// Thaw response.
    THAW = b"E03",
    /// Confiscation response.
    CONFISCATION = b"E04",
    /// Reconciliation response.
    RECONCILIATION = b"E05",
    /// Administrative message (request and response).
    MESSAGE = b"M01",
    /// Rejection response.
    REJECTION = b"M02",
}

impl ActionCode {
    /// True when the code belongs to the request set.
    #[must_use]
    pub fn is_request(&self) -> bool {
        matches!(
            *self,
            ActionCode::CONTRACT_OFFER
                | ActionCode::CONTRACT_AMENDMENT
                | ActionCode::CONTRACT_ADDRESS_CHANGE
                | ActionCode::ASSET_DEFINITION
                | ActionCode::ASSET_MODIFICATION
                | ActionCode::TRANSFER
                | ActionCode::PROPOSAL
                | ActionCode::BALLOT_CAST
                | ActionCode::ORDER
                | ActionCode::MESSAGE
        )
    }

    /// True when the code belongs to the response set.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(
            *self,
            ActionCode::CONTRACT_FORMATION
                | ActionCode::ASSET_CREATION
                | ActionCode::SETTLEMENT
                | ActionCode::VOTE
                | ActionCode::BALLOT_COUNTED
                | ActionCode::RESULT
                | ActionCode::FREEZE
                | ActionCode::THAW
                | ActionCode::CONFISCATION
                | ActionCode::RECONCILIATION
                | ActionCode::REJECTION
                | ActionCode::MESSAGE
        )
    }
}

impl std::fmt::Display for ActionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => write!(f, "{text}"),
            Err(_) => write!(f, "{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2]),
        }
    }
}

/// Terms shared by `ContractOffer` and `ContractFormation`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContractTerms {
    /// Display name.
    pub contract_name: String,
    /// Kind of agreement.
    pub contract_type: String,
    /// Off-chain document URI.
    pub contract_uri: String,
    /// Expiry; zero for perpetual.
    pub contract_expiration: Timestamp,
    /// Serialized permission matrix over the 21 contract fields.
    pub contract_permissions: Vec<u8>,
    /// Offered voting systems.
    pub voting_systems: Vec<VotingSystem>,
    /// Registered identity oracles.
    pub oracles: Vec<Oracle>,
    /// Oracle endorsing the administration and operator; `None` when the
    /// contract carries no endorsement.
    pub admin_oracle: Option<Oracle>,
    /// DER signature by the admin oracle over the administration digest.
    pub admin_oracle_signature: Vec<u8>,
    /// Height of the block hash the endorsement commits to.
    pub admin_oracle_sig_block_height: u32,
    /// Off-ramp address authorized to move the contract; `None` disables
    /// address changes.
    pub master_address: Option<Address>,
    /// Whether the second request input is a contract operator.
    pub operator_included: bool,
    /// Asset-count limit; zero means unlimited.
    pub restricted_qty_assets: u64,
    /// Fee in satoshis the contract charges per responded request.
    pub contract_fee: u64,
}

impl ContractTerms {
    fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        write_var_char(out, &self.contract_name, 255)?;
        write_var_char(out, &self.contract_type, 255)?;
        write_var_char(out, &self.contract_uri, 255)?;
        write_timestamp(out, self.contract_expiration);
        write_var_bytes(out, &self.contract_permissions, u16::MAX as usize)?;
        write_list_u8(out, &self.voting_systems, |out, v| v.write(out))?;
        write_list_u8(out, &self.oracles, |out, o| o.write(out))?;
        match &self.admin_oracle {
            Some(oracle) => {
                write_bool(out, true);
                oracle.write(out)?;
            }
            None => write_bool(out, false),
        }
        write_var_bytes(out, &self.admin_oracle_signature, 255)?;
        out.put_u32_le(self.admin_oracle_sig_block_height);
        write_opt_address(out, self.master_address.as_ref())?;
        write_bool(out, self.operator_included);
        out.put_u64_le(self.restricted_qty_assets);
        out.put_u64_le(self.contract_fee);
        Ok(())
    }

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(ContractTerms {
            contract_name: read_var_char(buf, 255)?,
            contract_type: read_var_char(buf, 255)?,
            contract_uri: read_var_char(buf, 255)?,
            contract_expiration: read_timestamp(buf)?,
            contract_permissions: read_var_bytes(buf, u16::MAX as usize)?,
            voting_systems: read_list_u8(buf, VotingSystem::read)?,
            oracles: read_list_u8(buf, Oracle::read)?,
            admin_oracle: if read_bool(buf)? {
                Some(Oracle::read(buf)?)
            } else {
                None
            },
            admin_oracle_signature: read_var_bytes(buf, 255)?,
            admin_oracle_sig_block_height: read_u32(buf)?,
            master_address: read_opt_address(buf)?,
            operator_included: read_bool(buf)?,
            restricted_qty_assets: read_u64(buf)?,
            contract_fee: read_u64(buf)?,
        })
    }
}

/// `C01` — a request to form a new contract at the agent's address.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContractOffer {
    /// Proposed terms.
    pub terms: ContractTerms,
}

/// `C02` — the agent's authoritative statement of contract terms.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContractFormation {
    /// Accepted terms.
    pub terms: ContractTerms,
    /// Revision, starting at zero and incremented per amendment.
    pub contract_revision: u32,
    /// Server time of acceptance.
    pub timestamp: Timestamp,
}

/// `C03` — a request to amend contract terms.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContractAmendment {
    /// The next request input replaces the administration address.
    pub change_administration_address: bool,
    /// A further request input replaces the operator address.
    pub change_operator_address: bool,
    /// Revision this amendment is based on; must equal current.
    pub contract_revision: u32,
    /// Result tx authorizing proposal-gated amendments; zero when direct.
    pub ref_tx_id: Hash32,
    /// Ordered amendments.
    pub amendments: Vec<Amendment>,
}

/// `C04` — moves a contract to a new address; only the master address may
/// request it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAddressChange {
    /// The successor contract address.
    pub new_contract_address: Address,
    /// Request time.
    pub timestamp: Timestamp,
}

/// Terms shared by `AssetDefinition` and `AssetCreation`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetTerms {
    /// Asset type code selecting the payload shape.
    pub asset_type: String,
    /// Serialized permission matrix over the 7 asset fields.
    pub asset_permissions: Vec<u8>,
    /// Whether holders may transfer the asset.
    pub transfers_permitted: bool,
    /// Whether enforcement orders apply to the asset.
    pub enforcement_orders_permitted: bool,
    /// Whether holdings carry voting weight.
    pub voting_rights: bool,
    /// Per-token vote multiplier.
    pub vote_multiplier: u8,
    /// Total token quantity.
    pub token_qty: u64,
    /// Serialized asset payload.
    pub asset_payload: Vec<u8>,
}

impl AssetTerms {
    fn write(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        super::wire::write_fixed_char(out, &self.asset_type, 3)?;
        write_var_bytes(out, &self.asset_permissions, u16::MAX as usize)?;
        write_bool(out, self.transfers_permitted);
        write_bool(out, self.enforcement_orders_permitted);
        write_bool(out, self.voting_rights);
        out.put_u8(self.vote_multiplier);
        out.put_u64_le(self.token_qty);
        write_var_bytes(out, &self.asset_payload, u16::MAX as usize)
    }

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(AssetTerms {
            asset_type: super::wire::read_fixed_char(buf, 3)?,
            asset_permissions: read_var_bytes(buf, u16::MAX as usize)?,
            transfers_permitted: read_bool(buf)?,
            enforcement_orders_permitted: read_bool(buf)?,
            voting_rights: read_bool(buf)?,
            vote_multiplier: read_u8(buf)?,
            token_qty: read_u64(buf)?,
            asset_payload: read_var_bytes(buf, u16::MAX as usize)?,
        })
    }
}

/// `A01` — a request to define a new asset under a contract.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetDefinition {
    /// Proposed terms.
    pub terms: AssetTerms,
}

/// `A02` — the agent's authoritative statement of asset terms.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetCreation {
    /// Accepted terms.
    pub terms: AssetTerms,
    /// Deterministic asset code.
    pub asset_code: Hash32,
    /// Position in the contract's asset list.
    pub asset_index: u64,
    /// Revision, starting at zero and incremented per modification.
    pub asset_revision: u32,
    /// Server time of acceptance.
    pub timestamp: Timestamp,
}

/// `A03` — a request to modify asset terms.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetModification {
    /// The asset being modified.
    pub asset_code: Hash32,
    /// Revision this modification is based on; must equal current.
    pub asset_revision: u32,
    /// Result tx authorizing proposal-gated amendments; zero when direct.
    pub ref_tx_id: Hash32,
    /// Ordered amendments.
    pub amendments: Vec<Amendment>,
}

/// `T01` — a request to move assets, possibly across contracts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transfer {
    /// Per-asset movements; `contract_index` names the authoritative agent
    /// for each.
    pub assets: Vec<AssetTransfer>,
    /// Time after which the request lapses; zero for none.
    pub offer_expiry: Timestamp,
}

/// `T02` — the settlement realizing a transfer atomically.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Settlement {
    /// Per-asset resulting balances.
    pub assets: Vec<AssetSettlement>,
    /// Server time of settlement.
    pub timestamp: Timestamp,
}

/// `G01` — raises a vote.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Proposal {
    /// `INITIATOR_ADMINISTRATION` or `INITIATOR_HOLDER`.
    pub initiator: u8,
    /// Index into the contract's voting systems.
    pub vote_system: u8,
    /// Whether the vote is scoped to one asset.
    pub asset_specific_vote: bool,
    /// Asset type when asset-specific.
    pub asset_type: String,
    /// Asset code when asset-specific.
    pub asset_code: Hash32,
    /// True when the proposal carries specific amendments to apply.
    pub specific: bool,
    /// Amendments an accepting Result authorizes.
    pub proposed_amendments: Vec<Amendment>,
    /// Ballot option letters, e.g. `AR`.
    pub vote_options: String,
    /// Maximum options one ballot may rank.
    pub vote_max: u8,
    /// Statement of the matter voted on.
    pub proposal_description: String,
    /// Voting deadline.
    pub vote_cut_off_timestamp: Timestamp,
}

/// `G02` — the agent's acknowledgement opening a vote.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Vote {
    /// Server time the vote opened.
    pub timestamp: Timestamp,
}

/// `G03` — a holder's ballot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BallotCast {
    /// The vote being answered (the Vote response tx id).
    pub vote_tx_id: Hash32,
    /// Chosen option letters in preference order.
    pub vote: String,
}

/// `G04` — acknowledges a counted ballot with its weight.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BallotCounted {
    /// The vote being answered.
    pub vote_tx_id: Hash32,
    /// The ballot's options as cast.
    pub vote: String,
    /// Weight counted for the ballot.
    pub quantity: u64,
    /// Server time of counting.
    pub timestamp: Timestamp,
}

/// `G05` — the tallied outcome of a vote.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoteResult {
    /// Whether the vote was scoped to one asset.
    pub asset_specific_vote: bool,
    /// Asset type when asset-specific.
    pub asset_type: String,
    /// Asset code when asset-specific.
    pub asset_code: Hash32,
    /// The amendments the vote covered.
    pub proposed_amendments: Vec<Amendment>,
    /// The vote this result closes.
    pub vote_tx_id: Hash32,
    /// Tally per option, in option order.
    pub option_tally: Vec<u64>,
    /// Winning option letter, or `R` when rejected.
    pub result: String,
    /// Server time of tallying.
    pub timestamp: Timestamp,
}

/// `E01` — an enforcement order carrying a compliance action.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Order {
    /// One of the `COMPLIANCE_*` codes.
    pub compliance_action: u8,
    /// Asset type; empty with a zero code for contract-wide freezes.
    pub asset_type: String,
    /// Asset code; zero for contract-wide freezes.
    pub asset_code: Hash32,
    /// Targets and quantities.
    pub target_addresses: Vec<TargetAddress>,
    /// For thaws: the freeze tx being reversed.
    pub freeze_tx_id: Hash32,
    /// For freezes: expiry of the freeze; zero holds until thawed.
    pub freeze_period: Timestamp,
    /// For confiscations: where balances move.
    pub deposit_address: Option<Address>,
    /// Ordering authority display name.
    pub authority_name: String,
    /// Ordering authority public key; empty when unsigned.
    pub authority_public_key: Vec<u8>,
    /// Signature algorithm; 1 = secp256k1 ECDSA.
    pub signature_algorithm: u8,
    /// DER signature over the order digest.
    pub order_signature: Vec<u8>,
    /// For reconciliations: satoshis paid out per target index.
    pub bitcoin_dispersions: Vec<QuantityIndex>,
    /// Free-form order message.
    pub message: String,
}

/// `E02` — freezes holdings or a whole contract.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Freeze {
    /// Asset type; empty for contract-wide.
    pub asset_type: String,
    /// Asset code; zero for contract-wide.
    pub asset_code: Hash32,
    /// Frozen quantity per output index.
    pub quantities: Vec<QuantityIndex>,
    /// Freeze expiry; zero holds until thawed.
    pub freeze_period: Timestamp,
    /// Server time.
    pub timestamp: Timestamp,
}

/// `E03` — reverses a prior freeze.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Thaw {
    /// The freeze tx being reversed.
    pub freeze_tx_id: Hash32,
    /// Server time.
    pub timestamp: Timestamp,
}

/// `E04` — moves holdings to a deposit address.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Confiscation {
    /// Asset type.
    pub asset_type: String,
    /// Asset code.
    pub asset_code: Hash32,
    /// Remaining balance per target output index.
    pub quantities: Vec<QuantityIndex>,
    /// Resulting deposit-address balance.
    pub deposit_qty: u64,
    /// Server time.
    pub timestamp: Timestamp,
}

/// `E05` — administratively adjusts holdings downward.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reconciliation {
    /// Asset type.
    pub asset_type: String,
    /// Asset code.
    pub asset_code: Hash32,
    /// Remaining balance per target output index.
    pub quantities: Vec<QuantityIndex>,
    /// Server time.
    pub timestamp: Timestamp,
}

/// `M01` — an administrative envelope between agents and clients.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Input indexes of the senders this message concerns.
    pub sender_indexes: Vec<u16>,
    /// Output indexes of the receivers this message concerns.
    pub receiver_indexes: Vec<u16>,
    /// Selects the payload shape; see `protocol::messages`.
    pub message_code: u16,
    /// Serialized message payload.
    pub message_payload: Vec<u8>,
}

/// `M02` — an on-chain rejection of a request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rejection {
    /// Output index paying the rejected requester.
    pub reject_address_index: u16,
    /// Rejection code; see [`super::RejectCode`].
    pub rejection_code: u8,
    /// Optional reason text.
    pub message: String,
    /// Server time.
    pub timestamp: Timestamp,
}

/// Any protocol action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Action {
    ContractOffer(ContractOffer),
    ContractFormation(ContractFormation),
    ContractAmendment(ContractAmendment),
    ContractAddressChange(ContractAddressChange),
    AssetDefinition(AssetDefinition),
    AssetCreation(AssetCreation),
    AssetModification(AssetModification),
    Transfer(Transfer),
    Settlement(Settlement),
    Proposal(Proposal),
    Vote(Vote),
    BallotCast(BallotCast),
    BallotCounted(BallotCounted),
    Result(VoteResult),
    Order(Order),
    Freeze(Freeze),
    Thaw(Thaw),
    Confiscation(Confiscation),
    Reconciliation(Reconciliation),
    Message(Message),
    Rejection(Rejection),
}

fn write_list_u8<T>(
    out: &mut Vec<u8>,
    items: &[T],
    write: impl Fn(&mut Vec<u8>, &T) -> Result<(), WireError>,
) -> Result<(), WireError> {
    let count: u8 = items.len().try_into().map_err(|_| WireError::TooLong {
        len: items.len(),
        max: 255,
    })?;
    out.put_u8(count);
    for item in items {
        write(out, item)?;
    }
    Ok(())
}

fn read_list_u8<T>(
    buf: &mut &[u8],
    read: impl Fn(&mut &[u8]) -> Result<T, WireError>,
) -> Result<Vec<T>, WireError> {
    let count = read_u8(buf)?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(read(buf)?);
    }
    Ok(items)
}

fn write_list_u16<T>(
    out: &mut Vec<u8>,
    items: &[T],
    write: impl Fn(&mut Vec<u8>, &T) -> Result<(), WireError>,
) -> Result<(), WireError> {
    let count: u16 = items.len().try_into().map_err(|_| WireError::TooLong {
        len: items.len(),
        max: u16::MAX as usize,
    })?;
    out.put_u16_le(count);
    for item in items {
        write(out, item)?;
    }
    Ok(())
}

fn read_list_u16<T>(
    buf: &mut &[u8],
    read: impl Fn(&mut &[u8]) -> Result<T, WireError>,
) -> Result<Vec<T>, WireError> {
    let count = read_u16(buf)?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(read(buf)?);
    }
    Ok(items)
}

impl Action {
    /// The action's 3-character code.
    #[must_use]
    pub fn code(&self) -> ActionCode {
        match self {
            Action::ContractOffer(_) => ActionCode::CONTRACT_OFFER,
            Action::ContractFormation(_) => ActionCode::CONTRACT_FORMATION,
            Action::ContractAmendment(_) => ActionCode::CONTRACT_AMENDMENT,
            Action::ContractAddressChange(_) => ActionCode::CONTRACT_ADDRESS_CHANGE,
            Action::AssetDefinition(_) => ActionCode::ASSET_DEFINITION,
            Action::AssetCreation(_) => ActionCode::ASSET_CREATION,
            Action::AssetModification(_) => ActionCode::ASSET_MODIFICATION,
            Action::Transfer(_) => ActionCode::TRANSFER,
            Action::Settlement(_) => ActionCode::SETTLEMENT,
            Action::Proposal(_) => ActionCode::PROPOSAL,
            Action::Vote(_) => ActionCode::VOTE,
            Action::BallotCast(_) => ActionCode::BALLOT_CAST,
            Action::BallotCounted(_) => ActionCode::BALLOT_COUNTED,
            Action::Result(_) => ActionCode::RESULT,
            Action::Order(_) => ActionCode::ORDER,
            Action::Freeze(_) => ActionCode::FREEZE,
            Action::Thaw(_) => ActionCode::THAW,
            Action::Confiscation(_) => ActionCode::CONFISCATION,
            Action::Reconciliation(_) => ActionCode::RECONCILIATION,
            Action::Message(_) => ActionCode::MESSAGE,
            Action::Rejection(_) => ActionCode::REJECTION,
        }
    }

    /// Serializes the action body (without protocol id and code).
    pub fn serialize_body(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::new();
        match self {
            Action::ContractOffer(m) => m.terms.write(&mut out)?,
            Action::ContractFormation(m) => {
                m.terms.write(&mut out)?;
                out.put_u32_le(m.contract_revision);
                write_timestamp(&mut out, m.timestamp);
            }
            Action::ContractAmendment(m) => {
                write_bool(&mut out, m.change_administration_address);
                write_bool(&mut out, m.change_operator_address);
                out.put_u32_le(m.contract_revision);
                write_hash(&mut out, &m.ref_tx_id);
                write_list_u8(&mut out, &m.amendments, |out, a| a.write(out))?;
            }
            Action::ContractAddressChange(m) => {
                super::wire::write_address(&mut out, &m.new_contract_address)?;
                write_timestamp(&mut out, m.timestamp);
            }
            Action::AssetDefinition(m) => m.terms.write(&mut out)?,
            Action::AssetCreation(m) => {
                m.terms.write(&mut out)?;
                write_hash(&mut out, &m.asset_code);
                out.put_u64_le(m.asset_index);
                out.put_u32_le(m.asset_revision);
                write_timestamp(&mut out, m.timestamp);
            }
            Action::AssetModification(m) => {
                write_hash(&mut out, &m.asset_code);
                out.put_u32_le(m.asset_revision);
                write_hash(&mut out, &m.ref_tx_id);
                write_list_u8(&mut out, &m.amendments, |out, a| a.write(out))?;
            }
            Action::Transfer(m) => {
                write_list_u8(&mut out, &m.assets, |out, a| a.write(out))?;
                write_timestamp(&mut out, m.offer_expiry);
            }
            Action::Settlement(m) => {
                write_list_u8(&mut out, &m.assets, |out, a| a.write(out))?;
                write_timestamp(&mut out, m.timestamp);
            }
            Action::Proposal(m) => {
                out.put_u8(m.initiator);
                out.put_u8(m.vote_system);
                write_bool(&mut out, m.asset_specific_vote);
                super::wire::write_fixed_char(&mut out, &m.asset_type, 3)?;
                write_hash(&mut out, &m.asset_code);
                write_bool(&mut out, m.specific);
                write_list_u8(&mut out, &m.proposed_amendments, |out, a| a.write(out))?;
                write_var_char(&mut out, &m.vote_options, 255)?;
                out.put_u8(m.vote_max);
                write_var_char(&mut out, &m.proposal_description, u16::MAX as usize)?;
                write_timestamp(&mut out, m.vote_cut_off_timestamp);
            }
            Action::Vote(m) => write_timestamp(&mut out, m.timestamp),
            Action::BallotCast(m) => {
                write_hash(&mut out, &m.vote_tx_id);
                write_var_char(&mut out, &m.vote, 255)?;
            }
            Action::BallotCounted(m) => {
                write_hash(&mut out, &m.vote_tx_id);
                write_var_char(&mut out, &m.vote, 255)?;
                out.put_u64_le(m.quantity);
                write_timestamp(&mut out, m.timestamp);
            }
            Action::Result(m) => {
                write_bool(&mut out, m.asset_specific_vote);
                super::wire::write_fixed_char(&mut out, &m.asset_type, 3)?;
                write_hash(&mut out, &m.asset_code);
                write_list_u8(&mut out, &m.proposed_amendments, |out, a| a.write(out))?;
                write_hash(&mut out, &m.vote_tx_id);
                write_list_u8(&mut out, &m.option_tally, |out, t| {
                    out.put_u64_le(*t);
                    Ok(())
                })?;
                write_var_char(&mut out, &m.result, 255)?;
                write_timestamp(&mut out, m.timestamp);
            }
            Action::Order(m) => {
                out.put_u8(m.compliance_action);
                super::wire::write_fixed_char(&mut out, &m.asset_type, 3)?;
                write_hash(&mut out, &m.asset_code);
                write_list_u16(&mut out, &m.target_addresses, |out, t| t.write(out))?;
                write_hash(&mut out, &m.freeze_tx_id);
                write_timestamp(&mut out, m.freeze_period);
                write_opt_address(&mut out, m.deposit_address.as_ref())?;
                write_var_char(&mut out, &m.authority_name, 255)?;
                write_var_bytes(&mut out, &m.authority_public_key, 255)?;
                out.put_u8(m.signature_algorithm);
                write_var_bytes(&mut out, &m.order_signature, 255)?;
                write_list_u16(&mut out, &m.bitcoin_dispersions, |out, q| {
                    q.write(out);
                    Ok(())
                })?;
                write_var_char(&mut out, &m.message, u16::MAX as usize)?;
            }
            Action::Freeze(m) => {
                super::wire::write_fixed_char(&mut out, &m.asset_type, 3)?;
                write_hash(&mut out, &m.asset_code);
                write_list_u16(&mut out, &m.quantities, |out, q| {
                    q.write(out);
                    Ok(())
                })?;
                write_timestamp(&mut out, m.freeze_period);
                write_timestamp(&mut out, m.timestamp);
            }
            Action::Thaw(m) => {
                write_hash(&mut out, &m.freeze_tx_id);
                write_timestamp(&mut out, m.timestamp);
            }
            Action::Confiscation(m) => {
                super::wire::write_fixed_char(&mut out, &m.asset_type, 3)?;
                write_hash(&mut out, &m.asset_code);
                write_list_u16(&mut out, &m.quantities, |out, q| {
                    q.write(out);
                    Ok(())
                })?;
                out.put_u64_le(m.deposit_qty);
                write_timestamp(&mut out, m.timestamp);
            }
            Action::Reconciliation(m) => {
                super::wire::write_fixed_char(&mut out, &m.asset_type, 3)?;
                write_hash(&mut out, &m.asset_code);
                write_list_u16(&mut out, &m.quantities, |out, q| {
                    q.write(out);
                    Ok(())
                })?;
                write_timestamp(&mut out, m.timestamp);
            }
            Action::Message(m) => {
                write_list_u8(&mut out, &m.sender_indexes, |out, i| {
                    out.put_u16_le(*i);
                    Ok(())
                })?;
                write_list_u8(&mut out, &m.receiver_indexes, |out, i| {
                    out.put_u16_le(*i);
                    Ok(())
                })?;
                out.put_u16_le(m.message_code);
                write_var_bytes(&mut out, &m.message_payload, u32::MAX as usize)?;
            }
            Action::Rejection(m) => {
                out.put_u16_le(m.reject_address_index);
                out.put_u8(m.rejection_code);
                write_var_char(&mut out, &m.message, u16::MAX as usize)?;
                write_timestamp(&mut out, m.timestamp);
            }
        }
        Ok(out)
    }

    /// Deserializes an action body for `code`, requiring full consumption.
    pub fn deserialize_body(code: ActionCode, body: &[u8]) -> Result<Self, WireError> {
        let mut buf = body;
        let action = match code {
            ActionCode::CONTRACT_OFFER => Action::ContractOffer(ContractOffer {
                terms: ContractTerms::read(&mut buf)?,
            }),
            ActionCode::CONTRACT_FORMATION => Action::ContractFormation(ContractFormation {
                terms: ContractTerms::read(&mut buf)?,
                contract_revision: read_u32(&mut buf)?,
                timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::CONTRACT_AMENDMENT => Action::ContractAmendment(ContractAmendment {
                change_administration_address: read_bool(&mut buf)?,
                change_operator_address: read_bool(&mut buf)?,
                contract_revision: read_u32(&mut buf)?,
                ref_tx_id: read_hash(&mut buf)?,
                amendments: read_list_u8(&mut buf, Amendment::read)?,
            }),
            ActionCode::CONTRACT_ADDRESS_CHANGE => {
                Action::ContractAddressChange(ContractAddressChange {
                    new_contract_address: super::wire::read_address(&mut buf)?,
                    timestamp: read_timestamp(&mut buf)?,
                })
            }
            ActionCode::ASSET_DEFINITION => Action::AssetDefinition(AssetDefinition {
                terms: AssetTerms::read(&mut buf)?,
            }),
            ActionCode::ASSET_CREATION => Action::AssetCreation(AssetCreation {
                terms: AssetTerms::read(&mut buf)?,
                asset_code: read_hash(&mut buf)?,
                asset_index: read_u64(&mut buf)?,
                asset_revision: read_u32(&mut buf)?,
                timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::ASSET_MODIFICATION => Action::AssetModification(AssetModification {
                asset_code: read_hash(&mut buf)?,
                asset_revision: read_u32(&mut buf)?,
                ref_tx_id: read_hash(&mut buf)?,
                amendments: read_list_u8(&mut buf, Amendment::read)?,
            }),
            ActionCode::TRANSFER => Action::Transfer(Transfer {
                assets: read_list_u8(&mut buf, AssetTransfer::read)?,
                offer_expiry: read_timestamp(&mut buf)?,
            }),
            ActionCode::SETTLEMENT => Action::Settlement(Settlement {
                assets: read_list_u8(&mut buf, AssetSettlement::read)?,
                timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::PROPOSAL => Action::Proposal(Proposal {
                initiator: read_u8(&mut buf)?,
                vote_system: read_u8(&mut buf)?,
                asset_specific_vote: read_bool(&mut buf)?,
                asset_type: super::wire::read_fixed_char(&mut buf, 3)?,
                asset_code: read_hash(&mut buf)?,
                specific: read_bool(&mut buf)?,
                proposed_amendments: read_list_u8(&mut buf, Amendment::read)?,
                vote_options: read_var_char(&mut buf, 255)?,
                vote_max: read_u8(&mut buf)?,
                proposal_description: read_var_char(&mut buf, u16::MAX as usize)?,
                vote_cut_off_timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::VOTE => Action::Vote(Vote {
                timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::BALLOT_CAST => Action::BallotCast(BallotCast {
                vote_tx_id: read_hash(&mut buf)?,
                vote: read_var_char(&mut buf, 255)?,
            }),
            ActionCode::BALLOT_COUNTED => Action::BallotCounted(BallotCounted {
                vote_tx_id: read_hash(&mut buf)?,
                vote: read_var_char(&mut buf, 255)?,
                quantity: read_u64(&mut buf)?,
                timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::RESULT => Action::Result(VoteResult {
                asset_specific_vote: read_bool(&mut buf)?,
                asset_type: super::wire::read_fixed_char(&mut buf, 3)?,
                asset_code: read_hash(&mut buf)?,
                proposed_amendments: read_list_u8(&mut buf, Amendment::read)?,
                vote_tx_id: read_hash(&mut buf)?,
                option_tally: read_list_u8(&mut buf, |buf| read_u64(buf))?,
                result: read_var_char(&mut buf, 255)?,
                timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::ORDER => Action::Order(Order {
                compliance_action: read_u8(&mut buf)?,
                asset_type: super::wire::read_fixed_char(&mut buf, 3)?,
                asset_code: read_hash(&mut buf)?,
                target_addresses: read_list_u16(&mut buf, TargetAddress::read)?,
                freeze_tx_id: read_hash(&mut buf)?,
                freeze_period: read_timestamp(&mut buf)?,
                deposit_address: read_opt_address(&mut buf)?,
                authority_name: read_var_char(&mut buf, 255)?,
                authority_public_key: read_var_bytes(&mut buf, 255)?,
                signature_algorithm: read_u8(&mut buf)?,
                order_signature: read_var_bytes(&mut buf, 255)?,
                bitcoin_dispersions: read_list_u16(&mut buf, QuantityIndex::read)?,
                message: read_var_char(&mut buf, u16::MAX as usize)?,
            }),
            ActionCode::FREEZE => Action::Freeze(Freeze {
                asset_type: super::wire::read_fixed_char(&mut buf, 3)?,
                asset_code: read_hash(&mut buf)?,
                quantities: read_list_u16(&mut buf, QuantityIndex::read)?,
                freeze_period: read_timestamp(&mut buf)?,
                timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::THAW => Action::Thaw(Thaw {
                freeze_tx_id: read_hash(&mut buf)?,
                timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::CONFISCATION => Action::Confiscation(Confiscation {
                asset_type: super::wire::read_fixed_char(&mut buf, 3)?,
                asset_code: read_hash(&mut buf)?,
                quantities: read_list_u16(&mut buf, QuantityIndex::read)?,
                deposit_qty: read_u64(&mut buf)?,
                timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::RECONCILIATION => Action::Reconciliation(Reconciliation {
                asset_type: super::wire::read_fixed_char(&mut buf, 3)?,
                asset_code: read_hash(&mut buf)?,
                quantities: read_list_u16(&mut buf, QuantityIndex::read)?,
                timestamp: read_timestamp(&mut buf)?,
            }),
            ActionCode::MESSAGE => Action::Message(Message {
                sender_indexes: read_list_u8(&mut buf, |buf| read_u16(buf))?,
                receiver_indexes: read_list_u8(&mut buf, |buf| read_u16(buf))?,
                message_code: read_u16(&mut buf)?,
                message_payload: read_var_bytes(&mut buf, u32::MAX as usize)?,
            }),
            ActionCode::REJECTION => Action::Rejection(Rejection {
                reject_address_index: read_u16(&mut buf)?,
                rejection_code: read_u8(&mut buf)?,
                message: read_var_char(&mut buf, u16::MAX as usize)?,
                timestamp: read_timestamp(&mut buf)?,
            }),
            _ => return Err(WireError::UnknownActionCode),
        };
        if !buf.is_empty() {
            return Err(WireError::TrailingBytes);
        }
        Ok(action)
    }

    /// Structural validation applied immediately after decoding.
    pub fn validate(&self) -> Result<(), WireError> {
        match self {
            Action::ContractOffer(m) => validate_terms(&m.terms),
            Action::ContractFormation(m) => validate_terms(&m.terms),
            Action::Transfer(m) => {
                if m.assets.is_empty() {
                    return Err(WireError::InvalidValue("transfer without assets"));
                }
                for asset in &m.assets {
                    if asset.senders.is_empty() || asset.receivers.is_empty() {
                        return Err(WireError::InvalidValue("transfer without parties"));
                    }
                }
                Ok(())
            }
            Action::Proposal(m) => {
                if m.initiator > INITIATOR_HOLDER {
                    return Err(WireError::InvalidValue("proposal initiator"));
                }
                if m.vote_options.is_empty() || m.vote_max == 0 {
                    return Err(WireError::InvalidValue("proposal options"));
                }
                Ok(())
            }
            Action::Order(m) => {
                match m.compliance_action {
                    COMPLIANCE_FREEZE | COMPLIANCE_THAW | COMPLIANCE_CONFISCATION
                    | COMPLIANCE_RECONCILIATION => {}
                    _ => return Err(WireError::InvalidValue("compliance action")),
                }
                if m.compliance_action == COMPLIANCE_CONFISCATION && m.deposit_address.is_none() {
                    return Err(WireError::InvalidValue("confiscation deposit address"));
                }
                Ok(())
            }
            Action::Rejection(m) => {
                if super::RejectCode::from_u8(m.rejection_code).is_none() {
                    return Err(WireError::InvalidValue("rejection code"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn validate_terms(terms: &ContractTerms) -> Result<(), WireError> {
    for system in &terms.voting_systems {
        system.validate()?;
    }
    for oracle in &terms.oracles {
        if bitcoin::PublicKey::from_bytes(&oracle.public_key).is_err() {
            return Err(WireError::InvalidValue("oracle public key"));
        }
    }
    if let Some(oracle) = &terms.admin_oracle {
        if bitcoin::PublicKey::from_bytes(&oracle.public_key).is_err() {
            return Err(WireError::InvalidValue("admin oracle public key"));
        }
        if bitcoin::Signature::from_der(&terms.admin_oracle_signature).is_err() {
            return Err(WireError::InvalidValue("admin oracle signature"));
        }
    }
    Ok(())
}

/// Serializes an action into a complete data-output locking script.
pub fn serialize(action: &Action, is_test: bool) -> Result<Vec<u8>, WireError> {
    let body = action.serialize_body()?;
    let id = if is_test { TEST_PROTOCOL_ID } else { PROTOCOL_ID };

    let mut payload = Vec::with_capacity(7 + body.len());
    payload.extend_from_slice(&id);
    payload.extend_from_slice(&action.code().0);
    payload.extend_from_slice(&body);

    let mut script = vec![bitcoin::OP_FALSE, bitcoin::OP_RETURN];
    script.extend(bitcoin::push_data(payload.len()));
    script.extend_from_slice(&payload);
    Ok(script)
}

/// Attempts to decode a locking script as a protocol action.
///
/// Non-data outputs and foreign protocols return `UnknownProtocol`; a
/// recognized protocol with a bad body returns the specific decode error.
pub fn deserialize(script: &[u8], is_test: bool) -> Result<Action, WireError> {
    let payload = bitcoin::data_output_payload(script).ok_or(WireError::UnknownProtocol)?;
    if payload.len() < 7 {
        return Err(WireError::UnknownProtocol);
    }
    let expected = if is_test { TEST_PROTOCOL_ID } else { PROTOCOL_ID };
    if payload[..4] != expected {
        return Err(WireError::UnknownProtocol);
    }
    let code = ActionCode([payload[4], payload[5], payload[6]]);
    Action::deserialize_body(code, &payload[7..])
}
