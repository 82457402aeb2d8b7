use std::{fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;

use crate::{chain::bitcoin::Chain, reconciler::ReconcileSettings};

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:25202";
pub const DEFAULT_ETHERSCAN_API_URL: &str = "https://api.etherscan.io/v2/api";
pub const DEFAULT_ETHEREUM_CHAIN_ID: u64 = 11155111;
pub const DEFAULT_USDC_CONTRACT: &str = "0x5425890298aed601595a70AB815c96711a31Bc65";
pub const DEFAULT_BLOCKCYPHER_API_URL: &str = "https://api.blockcypher.com/v1";
pub const DEFAULT_BITCOIN_WALLET_NAME: &str = "payments";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub ethereum_rpc_url: Option<String>,
    pub etherscan_api_key: Option<String>,
    pub etherscan_api_url: String,
    pub ethereum_chain_id: u64,
    pub usdc_contract: String,
    pub blockcypher_api_url: String,
    pub blockcypher_token: Option<String>,
    pub bitcoin_chain: Chain,
    /// Bound on every single adapter call.
    pub call_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WalletConfig {
    pub mnemonic: Option<String>,
    pub bitcoin_rpc_url: Option<String>,
    pub bitcoin_rpc_cookie: Option<String>,
    pub bitcoin_wallet_name: String,
    pub bitcoin_chain: Chain,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub chains: ChainConfig,
    pub wallet: WalletConfig,
    pub reconcile: ReconcileSettings,
    pub reconcile_interval: Duration,
    pub sweep_interval: Duration,
    pub webhook_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let bitcoin_chain = parse(or("BITCOIN_CHAIN", "mainnet"), "BITCOIN_CHAIN")?;

        let chains = ChainConfig {
            ethereum_rpc_url: get("ETHEREUM_RPC_URL"),
            etherscan_api_key: get("ETHERSCAN_API_KEY"),
            etherscan_api_url: or("ETHERSCAN_API_URL", DEFAULT_ETHERSCAN_API_URL),
            ethereum_chain_id: parse(
                or("ETHEREUM_CHAIN_ID", &DEFAULT_ETHEREUM_CHAIN_ID.to_string()),
                "ETHEREUM_CHAIN_ID",
            )?,
            usdc_contract: or("USDC_CONTRACT_ADDRESS", DEFAULT_USDC_CONTRACT),
            blockcypher_api_url: or("BLOCKCYPHER_API_URL", DEFAULT_BLOCKCYPHER_API_URL),
            blockcypher_token: get("BLOCKCYPHER_TOKEN"),
            bitcoin_chain,
            call_timeout: seconds(or("CHAIN_TIMEOUT_SECS", "10"), "CHAIN_TIMEOUT_SECS")?,
        };

        let wallet = WalletConfig {
            mnemonic: get("WALLET_MNEMONIC"),
            bitcoin_rpc_url: get("BITCOIN_RPC_URL"),
            bitcoin_rpc_cookie: get("BITCOIN_RPC_COOKIE"),
            bitcoin_wallet_name: or("BITCOIN_WALLET_NAME", DEFAULT_BITCOIN_WALLET_NAME),
            bitcoin_chain,
        };

        let reconcile = ReconcileSettings {
            min_confirmations: positive(or("MIN_CONFIRMATIONS", "1"), "MIN_CONFIRMATIONS")?,
            max_concurrency: positive(or("MAX_CONCURRENT_CHECKS", "8"), "MAX_CONCURRENT_CHECKS")?,
        };

        Ok(Self {
            database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            bind_address: or("BIND_ADDRESS", DEFAULT_BIND_ADDRESS),
            chains,
            wallet,
            reconcile,
            reconcile_interval: seconds(
                or("RECONCILE_INTERVAL_SECS", "60"),
                "RECONCILE_INTERVAL_SECS",
            )?,
            sweep_interval: seconds(or("SWEEP_INTERVAL_SECS", "300"), "SWEEP_INTERVAL_SECS")?,
            webhook_timeout: seconds(or("WEBHOOK_TIMEOUT_SECS", "5"), "WEBHOOK_TIMEOUT_SECS")?,
        })
    }
}

fn parse<T>(value: String, key: &'static str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}

fn positive<T>(value: String, key: &'static str) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq,
    T::Err: Display,
{
    let parsed: T = parse(value.clone(), key)?;
    if parsed == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}

fn seconds(value: String, key: &'static str) -> Result<Duration, ConfigError> {
    positive::<u64>(value, key).map(Duration::from_secs)
}
