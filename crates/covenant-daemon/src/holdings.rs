//! Write-behind holdings cache.
//!
//! Hot-path holding mutations land in memory and mark the key dirty on a
//! coalescing channel; the background flusher writes at most one record
//! per key per batch. Per-key order is preserved because the cache always
//! flushes the latest in-memory state. The applied-tx history persisted
//! inside each holding keeps crash replay idempotent.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error};

use covenant_core::bitcoin::{Address, Hash32};

use crate::state::Holding;
use crate::store::{Repositories, StoreError};

/// Identifies one holding across all contracts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HoldingKey {
    /// Contract address.
    pub contract: Address,
    /// Asset code.
    pub asset: Hash32,
    /// Holding party.
    pub party: Address,
}

/// The cache and its flusher feed.
pub struct HoldingsCache {
    repos: Arc<Repositories>,
    cache: Mutex<HashMap<HoldingKey, Holding>>,
    dirty: Mutex<HashSet<HoldingKey>>,
    feed: mpsc::UnboundedSender<HoldingKey>,
}

impl HoldingsCache {
    /// Builds the cache; the returned receiver feeds [`run_flusher`].
    pub fn new(repos: Arc<Repositories>) -> (Arc<Self>, mpsc::UnboundedReceiver<HoldingKey>) {
        let (feed, rx) = mpsc::unbounded_channel();
        let cache = Arc::new(HoldingsCache {
            repos,
            cache: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            feed,
        });
        (cache, rx)
    }

    /// Reads a holding through the cache.
    pub fn get(&self, key: &HoldingKey) -> Result<Holding, StoreError> {
        {
            let cache = self.cache.lock().expect("holdings cache poisoned");
            if let Some(holding) = cache.get(key) {
                return Ok(holding.clone());
            }
        }
        let holding = self
            .repos
            .holding(&key.contract, &key.asset, &key.party)?;
        let mut cache = self.cache.lock().expect("holdings cache poisoned");
        cache.insert(key.clone(), holding.clone());
        Ok(holding)
    }

    /// Writes a holding into the cache and marks it dirty.
    pub fn put(&self, key: HoldingKey, holding: Holding) {
        {
            let mut cache = self.cache.lock().expect("holdings cache poisoned");
            cache.insert(key.clone(), holding);
        }
        let mut dirty = self.dirty.lock().expect("holdings dirty set poisoned");
        if dirty.insert(key.clone()) {
            // Coalesced: a key already dirty is flushed once.
            let _ = self.feed.send(key);
        }
    }

    /// Synchronously flushes every dirty holding. Used at shutdown and at
    /// commit boundaries that must be durable.
    pub fn flush_all(&self) -> Result<(), StoreError> {
        let keys: Vec<HoldingKey> = {
            let mut dirty = self.dirty.lock().expect("holdings dirty set poisoned");
            dirty.drain().collect()
        };
        for key in keys {
            self.flush_one(&key)?;
        }
        Ok(())
    }

    fn flush_one(&self, key: &HoldingKey) -> Result<(), StoreError> {
        let holding = {
            let cache = self.cache.lock().expect("holdings cache poisoned");
            match cache.get(key) {
                Some(holding) => holding.clone(),
                None => return Ok(()), // evicted before flush; nothing newer to write
            }
        };
        self.repos.save_holding(&key.contract, &key.asset, &holding)
    }

    fn clear_dirty(&self, key: &HoldingKey) {
        let mut dirty = self.dirty.lock().expect("holdings dirty set poisoned");
        dirty.remove(key);
    }
}

/// Drains the dirty-key feed, writing the latest state of each key.
///
/// Exits when the feed closes (all senders dropped) after a final
/// flush.
pub async fn run_flusher(cache: Arc<HoldingsCache>, mut feed: mpsc::UnboundedReceiver<HoldingKey>) {
    while let Some(key) = feed.recv().await {
        cache.clear_dirty(&key);
        match cache.flush_one(&key) {
            Ok(()) => debug!(party = %key.party, "holding flushed"),
            Err(e) => error!(error = %e, "holding flush failed"),
        }
    }
    if let Err(e) = cache.flush_all() {
        error!(error = %e, "final holdings flush failed");
    }
}
