//! The tokenized wire protocol.
//!
//! Messages are carried in a single data-only transaction output. The
//! payload layout is:
//!
//! ```text
//! +---------------+---------------+---------------------------+
//! | protocol id   | action code   | field serialization       |
//! | (4 bytes)     | (3 chars)     | (per action, fixed order) |
//! +---------------+---------------+---------------------------+
//! ```
//!
//! Decoding is strict: unknown codes, truncated bodies, out-of-range
//! lengths, and trailing bytes are all malformed, and malformed messages
//! map to the `MsgMalformed` rejection code.

mod actions;
mod assets;
mod fields;
mod messages;
mod permissions;
mod rejection;
mod sig_hashes;
mod wire;

pub use actions::{
    deserialize, serialize, Action, ActionCode, AssetCreation, AssetDefinition, AssetModification,
    AssetTerms, BallotCast, BallotCounted, Confiscation, ContractAddressChange, ContractAmendment,
    ContractFormation, ContractOffer, ContractTerms, Freeze, Message, Order, Proposal,
    Reconciliation, Rejection, Settlement, Thaw, Transfer, Vote, VoteResult,
    COMPLIANCE_CONFISCATION, COMPLIANCE_FREEZE, COMPLIANCE_RECONCILIATION, COMPLIANCE_THAW,
    INITIATOR_ADMINISTRATION, INITIATOR_HOLDER, PROTOCOL_ID, TEST_PROTOCOL_ID,
};
pub use assets::{
    AssetPayload, Coupon, Currency, LoyaltyPoints, Membership, ShareCommon, TicketAdmission,
    ASSET_TYPE_COUPON, ASSET_TYPE_CURRENCY, ASSET_TYPE_LOYALTY, ASSET_TYPE_MEMBERSHIP,
    ASSET_TYPE_SHARE_COMMON, ASSET_TYPE_TICKET,
};
pub use fields::{
    Amendment, AssetSettlement, AssetTransfer, Oracle, QuantityIndex, TargetAddress,
    TransferReceiver, TransferSender, VotingSystem, AMENDMENT_OP_ADD, AMENDMENT_OP_DELETE,
    AMENDMENT_OP_MODIFY, VOTE_TYPE_ABSOLUTE, VOTE_TYPE_PLURALITY, VOTE_TYPE_RELATIVE,
};
pub use messages::{
    MessagePayload, Offer, PrivateMessage, PublicMessage, SettlementRequest, SignatureRequest,
    MSG_CODE_OFFER, MSG_CODE_PRIVATE, MSG_CODE_PUBLIC, MSG_CODE_SETTLEMENT_REQUEST,
    MSG_CODE_SIGNATURE_REQUEST,
};
pub use permissions::{Permission, Permissions, ASSET_FIELD_COUNT, CONTRACT_FIELD_COUNT};
pub use rejection::RejectCode;
pub use sig_hashes::{contract_oracle_sig_hash, order_authority_sig_hash, transfer_oracle_sig_hash};
pub use wire::{Timestamp, WireError};
