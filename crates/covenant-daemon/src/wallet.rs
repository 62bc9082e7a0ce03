//! The agent's key store.
//!
//! Maps the contract addresses this agent controls to their signing keys.
//! Read-mostly: registration happens at startup, lookups on every tx.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use covenant_core::bitcoin::{Address, KeyError, Network, PrivateKey};

/// Errors from wallet operations.
#[derive(Debug, Error)]
pub enum WalletError {
    /// No key is registered for the address.
    #[error("key not found")]
    KeyNotFound,

    /// A WIF string failed to import.
    #[error("bad key: {0}")]
    BadKey(#[from] KeyError),

    /// The key's network does not match the daemon's.
    #[error("key network mismatch")]
    NetworkMismatch,
}

/// The key store.
#[derive(Default)]
pub struct Wallet {
    keys: RwLock<HashMap<Address, PrivateKey>>,
}

impl Wallet {
    /// An empty wallet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a private key from its WIF form.
    pub fn register(&self, wif: &str, net: Network) -> Result<Address, WalletError> {
        let key = PrivateKey::from_wif(wif)?;
        if key.network() != net {
            return Err(WalletError::NetworkMismatch);
        }
        let address = key.address();
        let mut keys = self.keys.write().expect("wallet lock poisoned");
        keys.insert(address.clone(), key);
        Ok(address)
    }

    /// The signing key for a controlled address.
    pub fn get(&self, address: &Address) -> Result<PrivateKey, WalletError> {
        let keys = self.keys.read().expect("wallet lock poisoned");
        keys.get(address).cloned().ok_or(WalletError::KeyNotFound)
    }

    /// True when the agent controls `address`.
    #[must_use]
    pub fn controls(&self, address: &Address) -> bool {
        let keys = self.keys.read().expect("wallet lock poisoned");
        keys.contains_key(address)
    }

    /// Every controlled address.
    #[must_use]
    pub fn addresses(&self) -> Vec<Address> {
        let keys = self.keys.read().expect("wallet lock poisoned");
        keys.keys().cloned().collect()
    }
}
