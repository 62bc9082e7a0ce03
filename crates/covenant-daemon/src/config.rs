//! Daemon configuration.
//!
//! The daemon takes no command-line arguments; every setting comes from a
//! `COVENANT_`-prefixed environment variable. Validation happens once at
//! startup and a bad value exits with the configuration error code.

use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use thiserror::Error;

use covenant_core::bitcoin::Network;

/// Process exit code: success.
pub const EXIT_OK: i32 = 0;
/// Process exit code: generic runtime error.
pub const EXIT_ERROR: i32 = 1;
/// Process exit code: configuration error.
pub const EXIT_CONFIG: i32 = 2;
/// Process exit code: network error.
pub const EXIT_NETWORK: i32 = 3;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required variable is missing.
    #[error("missing environment variable: {0}")]
    Missing(&'static str),

    /// A variable's value did not parse.
    #[error("invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Fee and dust policy for response transactions.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    /// Address receiving contract fees.
    pub fee_address: String,
    /// Fee rate in satoshis per byte.
    pub fee_rate: u64,
    /// Dust limit in satoshis for notification outputs.
    pub dust_limit: u64,
}

/// Full daemon configuration.
#[derive(Debug)]
pub struct Config {
    /// Chain the agent observes.
    pub net: Network,
    /// Whether the test protocol identifier is used.
    pub is_test: bool,
    /// WIF keys of the contract addresses this agent controls.
    pub contract_keys: Secret<String>,
    /// Fee policy.
    pub fees: FeeConfig,
    /// Root directory for the blob store.
    pub storage_root: String,
    /// Seconds a pending multi-contract transfer may wait for settlement.
    pub transfer_timeout_secs: u64,
    /// Seconds a vote finalizer may lag its cut-off before it is considered
    /// missed at startup.
    pub vote_grace_secs: u64,
    /// How many blocks old an oracle attestation's block hash may be.
    pub oracle_recency_blocks: u32,
}

fn var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn var_or(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

impl Config {
    /// Loads configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let net = match var_or("COVENANT_NETWORK", "test").as_str() {
            "main" => Network::Main,
            "test" => Network::Test,
            other => {
                return Err(ConfigError::Invalid {
                    name: "COVENANT_NETWORK",
                    reason: format!("unknown network {other:?}"),
                })
            }
        };

        let is_test = match var_or("COVENANT_IS_TEST", "true").as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            other => {
                return Err(ConfigError::Invalid {
                    name: "COVENANT_IS_TEST",
                    reason: format!("expected bool, got {other:?}"),
                })
            }
        };

        let contract_keys = Secret::new(var("COVENANT_CONTRACT_KEYS")?);
        if contract_keys.expose_secret().is_empty() {
            return Err(ConfigError::Invalid {
                name: "COVENANT_CONTRACT_KEYS",
                reason: "empty key list".to_string(),
            });
        }

        let fees = FeeConfig {
            fee_address: var("COVENANT_FEE_ADDRESS")?,
            fee_rate: parse("COVENANT_FEE_RATE", &var_or("COVENANT_FEE_RATE", "1"))?,
            dust_limit: parse("COVENANT_DUST_LIMIT", &var_or("COVENANT_DUST_LIMIT", "546"))?,
        };

        Ok(Config {
            net,
            is_test,
            contract_keys,
            fees,
            storage_root: var("COVENANT_STORAGE_ROOT")?,
            transfer_timeout_secs: parse(
                "COVENANT_TRANSFER_TIMEOUT_SECS",
                &var_or("COVENANT_TRANSFER_TIMEOUT_SECS", "60"),
            )?,
            vote_grace_secs: parse(
                "COVENANT_VOTE_GRACE_SECS",
                &var_or("COVENANT_VOTE_GRACE_SECS", "300"),
            )?,
            oracle_recency_blocks: parse(
                "COVENANT_ORACLE_RECENCY_BLOCKS",
                &var_or("COVENANT_ORACLE_RECENCY_BLOCKS", "12"),
            )?,
        })
    }

    /// The comma-separated WIF list.
    #[must_use]
    pub fn contract_wifs(&self) -> Vec<String> {
        self.contract_keys
            .expose_secret()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wif_list_splits_and_trims() {
        let config = Config {
            net: Network::Test,
            is_test: true,
            contract_keys: Secret::new(" a , b ,, c".to_string()),
            fees: FeeConfig {
                fee_address: String::new(),
                fee_rate: 1,
                dust_limit: 546,
            },
            storage_root: "/tmp/x".to_string(),
            transfer_timeout_secs: 60,
            vote_grace_secs: 300,
            oracle_recency_blocks: 12,
        };
        assert_eq!(config.contract_wifs(), vec!["a", "b", "c"]);
    }
}
