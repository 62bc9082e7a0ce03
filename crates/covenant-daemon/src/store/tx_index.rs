//! Per-block index of relevant tx ids, used to drive reorg rollback.
//!
//! Each confirmed height owns one blob of concatenated 32-byte tx ids.
//! Height -1 collects unconfirmed ids. On a reverted block the pipeline
//! reads the block's ids and undoes their commits in reverse order.

use std::sync::{Arc, Mutex};

use covenant_core::bitcoin::Hash32;

use crate::storage::{Storage, StorageError};

use super::StoreError;

/// Marker height for unconfirmed txs.
pub const UNCONFIRMED: i32 = -1;

/// The per-height relevant-tx index.
pub struct TxIndex {
    storage: Arc<dyn Storage>,
    write_lock: Mutex<()>,
}

fn block_key(height: i32) -> String {
    if height == UNCONFIRMED {
        "txs/unconfirmed".to_string()
    } else {
        format!("txs/{height:08x}")
    }
}

impl TxIndex {
    /// Builds the index over `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        TxIndex {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Records a relevant tx id at `height`. Returns true when the id was
    /// not already present.
    pub fn add(&self, tx_id: &Hash32, height: i32) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().expect("tx index lock poisoned");
        let key = block_key(height);

        let mut data = match self.storage.read(&key) {
            Ok(data) => data,
            Err(StorageError::NotFound) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        for chunk in data.chunks_exact(32) {
            if chunk == tx_id.as_bytes() {
                return Ok(false);
            }
        }

        data.extend_from_slice(tx_id.as_bytes());
        self.storage.write(&key, &data)?;
        Ok(true)
    }

    /// True when the tx id is recorded at `height`.
    pub fn contains(&self, tx_id: &Hash32, height: i32) -> Result<bool, StoreError> {
        let data = match self.storage.read(&block_key(height)) {
            Ok(data) => data,
            Err(StorageError::NotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(data.chunks_exact(32).any(|c| c == tx_id.as_bytes()))
    }

    /// All relevant tx ids at `height`, in recording order.
    pub fn block(&self, height: i32) -> Result<Vec<Hash32>, StoreError> {
        let key = block_key(height);
        let data = match self.storage.read(&key) {
            Ok(data) => data,
            Err(StorageError::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if data.len() % 32 != 0 {
            return Err(StoreError::Storage(StorageError::InvalidKey(format!(
                "{key} has invalid size {}",
                data.len()
            ))));
        }
        Ok(data
            .chunks_exact(32)
            .map(|c| Hash32::from_slice(c).expect("chunk length fixed"))
            .collect())
    }

    /// Replaces the ids at `height`; an empty set removes the blob.
    pub fn set_block(&self, tx_ids: &[Hash32], height: i32) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("tx index lock poisoned");
        let key = block_key(height);
        if tx_ids.is_empty() {
            match self.storage.remove(&key) {
                Ok(()) | Err(StorageError::NotFound) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        let mut data = Vec::with_capacity(tx_ids.len() * 32);
        for id in tx_ids {
            data.extend_from_slice(id.as_bytes());
        }
        self.storage.write(&key, &data)?;
        Ok(())
    }

    /// Drops the ids recorded at `height`.
    pub fn remove_block(&self, height: i32) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("tx index lock poisoned");
        match self.storage.remove(&block_key(height)) {
            Ok(()) | Err(StorageError::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
