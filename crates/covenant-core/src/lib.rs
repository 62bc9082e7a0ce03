//! # covenant-core
//!
//! Core library for the covenant agent — a smart-contract daemon that
//! observes a Bitcoin-family chain and answers tokenized protocol requests.
//!
//! This crate holds everything that does not require a running daemon:
//!
//! - **Bitcoin primitives**: hashes, addresses, locking scripts, raw
//!   transactions, and BIP143 signature hashing with a reusable cache.
//! - **Wire protocol**: the tokenized message codec carried in data-only
//!   transaction outputs, including asset payloads, message payloads,
//!   the permission matrix, and the rejection-code table.
//!
//! The daemon crate (`covenant-daemon`) layers state, persistence, and the
//! protocol state machine on top of these types.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bitcoin;
pub mod protocol;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bitcoin::{Address, Hash20, Hash32, Network, PrivateKey, PublicKey, Transaction};
    pub use crate::protocol::{Action, ActionCode, RejectCode};
}
