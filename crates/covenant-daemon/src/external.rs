//! Interfaces to the external collaborators.
//!
//! The ingestion node, the full-node RPC, and the broadcast path are all
//! outside this daemon; these traits are their seams. The in-memory
//! implementations back the integration tests and double as loop-back
//! plumbing between co-located test agents.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use thiserror::Error;

use covenant_core::bitcoin::{Hash32, Transaction};

/// Errors from collaborator calls.
#[derive(Debug, Error)]
pub enum ExternalError {
    /// The requested record is unknown to the collaborator.
    #[error("not found")]
    NotFound,

    /// Transient failure; the caller retries with bounded backoff.
    #[error("transient: {0}")]
    Transient(String),
}

/// Ancestor-transaction retrieval (full-node RPC).
pub trait TxRetriever: Send + Sync + 'static {
    /// Fetches a raw transaction by id.
    fn get_tx(&self, tx_id: &Hash32) -> Result<Transaction, ExternalError>;
}

/// Block-header access used to validate oracle attestation recency.
pub trait BlockHeaders: Send + Sync + 'static {
    /// The hash of the block at `height`.
    fn hash(&self, height: u32) -> Result<Hash32, ExternalError>;

    /// The current tip height.
    fn tip_height(&self) -> u32;
}

/// Response-transaction broadcast.
pub trait TxBroadcaster: Send + Sync + 'static {
    /// Submits a signed transaction to the network.
    fn broadcast(&self, tx: &Transaction) -> Result<(), ExternalError>;
}

/// In-memory transaction source for tests and loop-back wiring.
#[derive(Default)]
pub struct MemoryTxSource {
    txs: RwLock<HashMap<Hash32, Transaction>>,
}

impl MemoryTxSource {
    /// An empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a transaction, keyed by its id.
    pub fn add(&self, tx: Transaction) {
        let mut txs = self.txs.write().expect("tx source lock poisoned");
        txs.insert(tx.txid(), tx);
    }
}

impl TxRetriever for MemoryTxSource {
    fn get_tx(&self, tx_id: &Hash32) -> Result<Transaction, ExternalError> {
        let txs = self.txs.read().expect("tx source lock poisoned");
        txs.get(tx_id).cloned().ok_or(ExternalError::NotFound)
    }
}

/// Deterministic header chain for tests.
pub struct MemoryHeaders {
    tip: RwLock<u32>,
}

impl MemoryHeaders {
    /// A chain whose tip is at `tip` height.
    #[must_use]
    pub fn new(tip: u32) -> Self {
        MemoryHeaders {
            tip: RwLock::new(tip),
        }
    }

    /// Advances the tip.
    pub fn set_tip(&self, tip: u32) {
        *self.tip.write().expect("headers lock poisoned") = tip;
    }
}

impl BlockHeaders for MemoryHeaders {
    fn hash(&self, height: u32) -> Result<Hash32, ExternalError> {
        if height > self.tip_height() {
            return Err(ExternalError::NotFound);
        }
        Ok(Hash32::hash(&height.to_le_bytes()))
    }

    fn tip_height(&self) -> u32 {
        *self.tip.read().expect("headers lock poisoned")
    }
}

/// Broadcast sink that records submitted transactions.
#[derive(Default)]
pub struct MemoryBroadcaster {
    sent: Mutex<Vec<Transaction>>,
}

impl MemoryBroadcaster {
    /// An empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains every transaction broadcast so far.
    pub fn drain(&self) -> Vec<Transaction> {
        let mut sent = self.sent.lock().expect("broadcaster lock poisoned");
        std::mem::take(&mut *sent)
    }

    /// Number of transactions broadcast so far.
    pub fn count(&self) -> usize {
        self.sent.lock().expect("broadcaster lock poisoned").len()
    }
}

impl TxBroadcaster for MemoryBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<(), ExternalError> {
        let mut sent = self.sent.lock().expect("broadcaster lock poisoned");
        sent.push(tx.clone());
        Ok(())
    }
}
