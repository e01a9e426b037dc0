//! Engine configuration.
//!
//! Collects the addresses, network, and timing parameters the engine needs at
//! startup. Missing required addresses are a fatal configuration error: the
//! engine must refuse to start rather than start into a broken state where
//! every ledger call is guaranteed to fail.

use crate::ledger::ChainId;

use std::time::Duration;

/// Error types for engine configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Configuration for the commitment engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// HTTP endpoint of the commitment gateway.
    pub gateway_url: String,
    /// Address of the commitment contract.
    pub contract_address: String,
    /// Address of the token contract.
    pub token_address: String,
    /// The chain the engine is allowed to operate on.
    pub required_chain: ChainId,
    /// Interval between reconciliation reads, measured from read completion.
    pub poll_interval: Duration,
    /// Base delay for read-retry backoff.
    pub backoff_base: Duration,
    /// Automatic read retries stop once this many attempts have failed.
    pub max_retry_attempts: u32,
}

impl EngineConfig {
    /// Build a configuration from environment variables.
    ///
    /// `COMMITMENT_GATEWAY_URL`, `COMMITMENT_CONTRACT_ADDRESS` and
    /// `COMMITMENT_TOKEN_ADDRESS` are required; the rest fall back to
    /// defaults. Returns a `ConfigError` if a required value is missing or a
    /// numeric value does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let gateway_url = require_env("COMMITMENT_GATEWAY_URL")?;
        let contract_address = require_env("COMMITMENT_CONTRACT_ADDRESS")?;
        let token_address = require_env("COMMITMENT_TOKEN_ADDRESS")?;

        let required_chain = ChainId(parse_env("COMMITMENT_CHAIN_ID", 1)?);
        let poll_interval = Duration::from_secs(parse_env("COMMITMENT_POLL_INTERVAL_SECS", 30)?);
        let backoff_base = Duration::from_secs(parse_env("COMMITMENT_BACKOFF_BASE_SECS", 1)?);
        let max_retry_attempts = parse_env("COMMITMENT_MAX_RETRY_ATTEMPTS", 3)?;

        let config = Self {
            gateway_url,
            contract_address,
            token_address,
            required_chain,
            poll_interval,
            backoff_base,
            max_retry_attempts,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate address fields.
    ///
    /// Contract and token addresses must be 0x-prefixed hex; anything else is
    /// a deployment mistake that would make every call fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_address("COMMITMENT_CONTRACT_ADDRESS", &self.contract_address)?;
        validate_address("COMMITMENT_TOKEN_ADDRESS", &self.token_address)?;
        Ok(())
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse::<T>().map_err(|_| ConfigError::Invalid {
            name,
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn validate_address(name: &'static str, address: &str) -> Result<(), ConfigError> {
    let stripped = address.strip_prefix("0x").ok_or_else(|| ConfigError::Invalid {
        name,
        value: address.to_string(),
    })?;

    if stripped.is_empty() || hex::decode(stripped).is_err() {
        return Err(ConfigError::Invalid {
            name,
            value: address.to_string(),
        });
    }

    Ok(())
}
