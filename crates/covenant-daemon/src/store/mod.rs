//! State repositories over the blob store.
//!
//! Blob key layout:
//!
//! ```text
//! contracts/<addr>
//! contracts/<addr>/assets/<code>
//! contracts/<addr>/assets/<code>/holdings/<party>
//! contracts/<addr>/votes/<vote-tx-id>
//! contracts/<addr>/transfers/<tx-id>
//! txcache/<tx-id>
//! txs/<height-8hex>            (height -1 -> txs/unconfirmed)
//! scheduler/<job-id>
//! ```
//!
//! All writes for one logical update run under the contract's mutex
//! ([`Repositories::lock`]); reads are lock-free snapshots. Records are
//! JSON blobs.

mod tx_cache;
mod tx_index;

pub use tx_cache::TxCache;
pub use tx_index::{TxIndex, UNCONFIRMED};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use covenant_core::bitcoin::{Address, Hash32};

use crate::state::{Asset, Contract, Holding, PendingTransfer, VoteRecord};
use crate::storage::{Storage, StorageError};

/// Errors from repository operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record does not exist.
    #[error("record not found")]
    NotFound,

    /// Blob store failure.
    #[error("storage: {0}")]
    Storage(StorageError),

    /// A stored blob did not decode; state is corrupt.
    #[error("corrupt record under {key}: {source}")]
    Corrupt {
        /// The offending key.
        key: String,
        /// Decode failure.
        source: serde_json::Error,
    },

    /// A record failed to encode.
    #[error("encode record: {0}")]
    Encode(serde_json::Error),
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => StoreError::NotFound,
            other => StoreError::Storage(other),
        }
    }
}

/// All repositories, sharing one blob store.
pub struct Repositories {
    storage: Arc<dyn Storage>,
    locks: Mutex<HashMap<Address, Arc<AsyncMutex<()>>>>,
}

fn contract_key(address: &Address) -> String {
    format!("contracts/{address}")
}

fn asset_key(address: &Address, code: &Hash32) -> String {
    format!("contracts/{address}/assets/{code}")
}

fn holding_key(address: &Address, code: &Hash32, party: &Address) -> String {
    format!("contracts/{address}/assets/{code}/holdings/{party}")
}

fn vote_key(address: &Address, vote_tx_id: &Hash32) -> String {
    format!("contracts/{address}/votes/{vote_tx_id}")
}

fn transfer_key(address: &Address, tx_id: &Hash32) -> String {
    format!("contracts/{address}/transfers/{tx_id}")
}

impl Repositories {
    /// Builds repositories over `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Repositories {
            storage,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying blob store.
    #[must_use]
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// The serialized read-modify-write mutex for one contract.
    ///
    /// Hold the guard across every read-check-write sequence that must be
    /// atomic for the contract.
    pub fn lock(&self, address: &Address) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        Arc::clone(
            locks
                .entry(address.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    fn get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let data = self.storage.read(key)?;
        serde_json::from_slice(&data).map_err(|source| StoreError::Corrupt {
            key: key.to_string(),
            source,
        })
    }

    fn put<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let data = serde_json::to_vec(value).map_err(StoreError::Encode)?;
        self.storage.write(key, &data)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Contracts
    // ------------------------------------------------------------------

    /// Fetches a contract.
    pub fn contract(&self, address: &Address) -> Result<Contract, StoreError> {
        self.get(&contract_key(address))
    }

    /// Persists a contract.
    pub fn save_contract(&self, contract: &Contract) -> Result<(), StoreError> {
        self.put(&contract_key(&contract.address), contract)
    }

    // ------------------------------------------------------------------
    // Assets
    // ------------------------------------------------------------------

    /// Fetches an asset.
    pub fn asset(&self, address: &Address, code: &Hash32) -> Result<Asset, StoreError> {
        self.get(&asset_key(address, code))
    }

    /// Persists an asset.
    pub fn save_asset(&self, address: &Address, asset: &Asset) -> Result<(), StoreError> {
        self.put(&asset_key(address, &asset.asset_code), asset)
    }

    // ------------------------------------------------------------------
    // Holdings
    // ------------------------------------------------------------------

    /// Fetches a holding, or a fresh zero holding when none exists.
    pub fn holding(
        &self,
        address: &Address,
        code: &Hash32,
        party: &Address,
    ) -> Result<Holding, StoreError> {
        match self.get(&holding_key(address, code, party)) {
            Ok(holding) => Ok(holding),
            Err(StoreError::NotFound) => Ok(Holding::new(party.clone())),
            Err(e) => Err(e),
        }
    }

    /// Persists a holding.
    pub fn save_holding(
        &self,
        address: &Address,
        code: &Hash32,
        holding: &Holding,
    ) -> Result<(), StoreError> {
        self.put(&holding_key(address, code, &holding.address), holding)
    }

    /// Lists every holding of one asset.
    pub fn list_holdings(
        &self,
        address: &Address,
        code: &Hash32,
    ) -> Result<Vec<Holding>, StoreError> {
        let prefix = format!("contracts/{address}/assets/{code}/holdings/");
        let mut holdings = Vec::new();
        for key in self.storage.list(&prefix)? {
            holdings.push(self.get(&key)?);
        }
        Ok(holdings)
    }

    // ------------------------------------------------------------------
    // Votes
    // ------------------------------------------------------------------

    /// Fetches a vote.
    pub fn vote(&self, address: &Address, vote_tx_id: &Hash32) -> Result<VoteRecord, StoreError> {
        self.get(&vote_key(address, vote_tx_id))
    }

    /// Persists a vote.
    pub fn save_vote(&self, address: &Address, vote: &VoteRecord) -> Result<(), StoreError> {
        self.put(&vote_key(address, &vote.vote_tx_id), vote)
    }

    /// Removes a vote record whose opening response was cancelled.
    pub fn remove_vote(&self, address: &Address, vote_tx_id: &Hash32) -> Result<(), StoreError> {
        self.storage.remove(&vote_key(address, vote_tx_id))?;
        Ok(())
    }

    /// Lists every vote of one contract.
    pub fn list_votes(&self, address: &Address) -> Result<Vec<VoteRecord>, StoreError> {
        let prefix = format!("contracts/{address}/votes/");
        let mut votes = Vec::new();
        for key in self.storage.list(&prefix)? {
            votes.push(self.get(&key)?);
        }
        Ok(votes)
    }

    // ------------------------------------------------------------------
    // Pending transfers
    // ------------------------------------------------------------------

    /// Fetches a pending transfer.
    pub fn transfer(
        &self,
        address: &Address,
        tx_id: &Hash32,
    ) -> Result<PendingTransfer, StoreError> {
        self.get(&transfer_key(address, tx_id))
    }

    /// Persists a pending transfer.
    pub fn save_transfer(
        &self,
        address: &Address,
        transfer: &PendingTransfer,
    ) -> Result<(), StoreError> {
        self.put(&transfer_key(address, &transfer.transfer_tx_id), transfer)
    }

    /// Removes a settled or aborted pending transfer.
    pub fn remove_transfer(&self, address: &Address, tx_id: &Hash32) -> Result<(), StoreError> {
        self.storage.remove(&transfer_key(address, tx_id))?;
        Ok(())
    }

    /// Lists every pending transfer of one contract.
    pub fn list_transfers(&self, address: &Address) -> Result<Vec<PendingTransfer>, StoreError> {
        let prefix = format!("contracts/{address}/transfers/");
        let mut transfers = Vec::new();
        for key in self.storage.list(&prefix)? {
            transfers.push(self.get(&key)?);
        }
        Ok(transfers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use covenant_core::bitcoin::Network;
    use covenant_core::protocol::Timestamp;

    fn repos() -> Repositories {
        Repositories::new(Arc::new(MemoryStorage::new()))
    }

    fn addr(seed: u8) -> Address {
        Address::pkh([seed; 20], Network::Test)
    }

    fn contract(address: Address) -> Contract {
        Contract {
            admin_address: address.clone(),
            address,
            revision: 0,
            operator_address: None,
            master_address: None,
            moved_to: None,
            contract_name: "C".to_string(),
            contract_type: String::new(),
            contract_uri: String::new(),
            expiration: Timestamp::ZERO,
            permissions: vec![0; 21],
            voting_systems: vec![],
            oracles: vec![],
            admin_oracle: None,
            admin_oracle_signature: vec![],
            admin_oracle_sig_block_height: 0,
            restricted_qty_assets: 0,
            contract_fee: 0,
            freeze_period: Timestamp::ZERO,
            asset_codes: vec![],
            admin_member_asset: Hash32::ZERO,
            created_at: Timestamp(1),
            updated_at: Timestamp(1),
        }
    }

    #[test]
    fn contract_round_trip() {
        let repos = repos();
        let c = contract(addr(1));
        assert!(matches!(
            repos.contract(&c.address),
            Err(StoreError::NotFound)
        ));
        repos.save_contract(&c).unwrap();
        assert_eq!(repos.contract(&c.address).unwrap(), c);
    }

    #[test]
    fn missing_holding_is_zero() {
        let repos = repos();
        let h = repos
            .holding(&addr(1), &Hash32::hash(b"asset"), &addr(2))
            .unwrap();
        assert_eq!(h.finalized_balance, 0);
        assert_eq!(h.address, addr(2));
    }

    #[test]
    fn holdings_list_by_asset() {
        let repos = repos();
        let code = Hash32::hash(b"asset");
        for seed in [2u8, 3, 4] {
            let mut h = Holding::new(addr(seed));
            h.finalized_balance = u64::from(seed);
            repos.save_holding(&addr(1), &code, &h).unwrap();
        }
        // Another asset's holding must not appear.
        repos
            .save_holding(&addr(1), &Hash32::hash(b"other"), &Holding::new(addr(9)))
            .unwrap();

        let listed = repos.list_holdings(&addr(1), &code).unwrap();
        assert_eq!(listed.len(), 3);
    }

    #[test]
    fn transfer_remove() {
        let repos = repos();
        let t = PendingTransfer {
            transfer_tx_id: Hash32::hash(b"t"),
            timeout: Timestamp(10),
            state: crate::state::TransferState::Reserved,
            is_leader: true,
            reservations: vec![],
            settlement_request: None,
            oracle_sigs: vec![],
            created_at: Timestamp(1),
            updated_at: Timestamp(1),
        };
        repos.save_transfer(&addr(1), &t).unwrap();
        assert_eq!(repos.transfer(&addr(1), &t.transfer_tx_id).unwrap(), t);
        repos.remove_transfer(&addr(1), &t.transfer_tx_id).unwrap();
        assert!(matches!(
            repos.transfer(&addr(1), &t.transfer_tx_id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn per_contract_lock_is_stable() {
        let repos = repos();
        let a = repos.lock(&addr(1));
        let b = repos.lock(&addr(1));
        assert!(Arc::ptr_eq(&a, &b));
        let c = repos.lock(&addr(2));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
