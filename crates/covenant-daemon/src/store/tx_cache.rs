//! Cache of enriched transactions the agent may need to cross-reference
//! later: requests awaiting their response commit, freezes referenced by
//! thaws, and emitted rejections for duplicate suppression.

use std::sync::Arc;

use covenant_core::bitcoin::{Hash32, Network};

use crate::inspector::{InspectorTx, InspectorTxRecord};
use crate::storage::{Storage, StorageError};

use super::StoreError;

/// The tx cache.
pub struct TxCache {
    storage: Arc<dyn Storage>,
    net: Network,
    is_test: bool,
}

fn cache_key(tx_id: &Hash32) -> String {
    format!("txcache/{tx_id}")
}

impl TxCache {
    /// Builds the cache over `storage`.
    pub fn new(storage: Arc<dyn Storage>, net: Network, is_test: bool) -> Self {
        TxCache {
            storage,
            net,
            is_test,
        }
    }

    /// Stores an enriched tx.
    pub fn save(&self, itx: &InspectorTx) -> Result<(), StoreError> {
        let record = itx.to_record();
        let data = serde_json::to_vec(&record).map_err(StoreError::Encode)?;
        self.storage.write(&cache_key(&itx.txid), &data)?;
        Ok(())
    }

    /// Fetches an enriched tx.
    pub fn get(&self, tx_id: &Hash32) -> Result<InspectorTx, StoreError> {
        let key = cache_key(tx_id);
        let data = self.storage.read(&key)?;
        let record: InspectorTxRecord =
            serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
                key: key.clone(),
                source,
            })?;
        InspectorTx::from_record(&record, self.net, self.is_test).map_err(|_| {
            StoreError::Storage(StorageError::InvalidKey(format!("{key} holds a bad tx")))
        })
    }

    /// True when the tx is cached.
    pub fn contains(&self, tx_id: &Hash32) -> Result<bool, StoreError> {
        match self.storage.read(&cache_key(tx_id)) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops a cached tx. Dropping a missing tx is not an error.
    pub fn remove(&self, tx_id: &Hash32) -> Result<(), StoreError> {
        match self.storage.remove(&cache_key(tx_id)) {
            Ok(()) | Err(StorageError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
