use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy::{
    primitives::Address,
    providers::{Provider, ProviderBuilder},
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use crate::{config::ChainConfig, db::repositories::models::payment::Currency};

pub mod bitcoin;
pub mod ethereum;
pub mod units;
pub mod usdc;

use bitcoin::{BitcoinAdapter, BlockCypherClient};
use ethereum::{EthereumAdapter, EtherscanClient};
use units::UnitError;
use usdc::{Erc20Client, UsdcAdapter};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rpc call failed: {0}")]
    Rpc(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Units(#[from] UnitError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no chain adapter registered for {0}")]
    Unsupported(Currency),
}

/// What an adapter observed for one address during one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Observed amount reached the expected amount.
    pub received: bool,
    pub amount: Decimal,
    pub tx_hash: Option<String>,
    pub confirmations: u64,
    /// Balance was sufficient but no matching transfer was located, so
    /// `tx_hash` and `confirmations` are placeholders.
    pub balance_only: bool,
}

impl Detection {
    pub fn not_received() -> Self {
        Self {
            received: false,
            amount: Decimal::ZERO,
            tx_hash: None,
            confirmations: 0,
            balance_only: false,
        }
    }

    /// Whether this observation is enough to complete the payment.
    pub fn settles(&self, min_confirmations: u64) -> bool {
        self.received
            && self.tx_hash.is_some()
            && (self.balance_only || self.confirmations >= min_confirmations)
    }
}

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn currency(&self) -> Currency;

    async fn detect(&self, address: &str, expected: Decimal) -> Result<Detection, ChainError>;
}

/// Per-currency dispatch. This is the failure boundary of the chain layer:
/// transport errors and timeouts come out as [`Detection::not_received`].
pub struct AdapterRegistry {
    adapters: HashMap<Currency, Arc<dyn ChainAdapter>>,
    call_timeout: Duration,
}

impl AdapterRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            adapters: HashMap::new(),
            call_timeout,
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        info!("Registering chain adapter for {}", adapter.currency());
        self.adapters.insert(adapter.currency(), adapter);
    }

    pub fn supports(&self, currency: Currency) -> bool {
        self.adapters.contains_key(&currency)
    }

    pub async fn detect(
        &self,
        currency: Currency,
        address: &str,
        expected: Decimal,
    ) -> Result<Detection, DispatchError> {
        let adapter = self
            .adapters
            .get(&currency)
            .ok_or(DispatchError::Unsupported(currency))?;

        match tokio::time::timeout(self.call_timeout, adapter.detect(address, expected)).await {
            Ok(Ok(detection)) => Ok(detection),
            Ok(Err(e)) => {
                warn!("[{}] Error checking payment for {}: {}", currency, address, e);
                Ok(Detection::not_received())
            }
            Err(_) => {
                warn!(
                    "[{}] Checking payment for {} timed out after {:?}",
                    currency, address, self.call_timeout
                );
                Ok(Detection::not_received())
            }
        }
    }

    /// Builds the production adapters. ETH and USDC need a JSON-RPC node; ETH
    /// additionally needs an Etherscan key. BTC only needs BlockCypher.
    pub fn from_config(config: &ChainConfig) -> Result<Self, ChainError> {
        let mut registry = Self::new(config.call_timeout);
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()?;

        match &config.ethereum_rpc_url {
            Some(rpc_url) => {
                let url = rpc_url
                    .parse::<reqwest::Url>()
                    .map_err(|e| ChainError::Rpc(format!("invalid ETHEREUM_RPC_URL: {e}")))?;
                let provider = ProviderBuilder::new().connect_http(url).erased();

                match &config.etherscan_api_key {
                    Some(api_key) => {
                        let client = EtherscanClient::new(
                            http.clone(),
                            &config.etherscan_api_url,
                            api_key,
                            config.ethereum_chain_id,
                            provider.clone(),
                        );
                        registry.register(Arc::new(EthereumAdapter::new(client)));
                    }
                    None => warn!("ETHERSCAN_API_KEY not set, ETH payments stay pending"),
                }

                let token = config
                    .usdc_contract
                    .parse::<Address>()
                    .map_err(|_| ChainError::InvalidAddress(config.usdc_contract.clone()))?;
                registry.register(Arc::new(UsdcAdapter::new(Erc20Client::new(provider, token))));
            }
            None => warn!("ETHEREUM_RPC_URL not set, ETH and USDC payments stay pending"),
        }

        let client = BlockCypherClient::new(
            http,
            &config.blockcypher_api_url,
            config.bitcoin_chain,
            config.blockcypher_token.clone(),
        );
        registry.register(Arc::new(BitcoinAdapter::new(client)));

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct SlowAdapter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChainAdapter for SlowAdapter {
        fn currency(&self) -> Currency {
            Currency::Btc
        }

        async fn detect(&self, _: &str, _: Decimal) -> Result<Detection, ChainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Detection {
                received: true,
                amount: Decimal::ONE,
                tx_hash: Some("late".to_string()),
                confirmations: 6,
                balance_only: false,
            })
        }
    }

    struct FailingAdapter;

    #[async_trait]
    impl ChainAdapter for FailingAdapter {
        fn currency(&self) -> Currency {
            Currency::Eth
        }

        async fn detect(&self, _: &str, _: Decimal) -> Result<Detection, ChainError> {
            Err(ChainError::Malformed("rate limited".to_string()))
        }
    }

    #[test]
    fn settlement_predicate() {
        let mut detection = Detection {
            received: true,
            amount: Decimal::ONE,
            tx_hash: Some("0x1".to_string()),
            confirmations: 0,
            balance_only: false,
        };
        assert!(!detection.settles(1));

        detection.confirmations = 1;
        assert!(detection.settles(1));

        detection.received = false;
        assert!(!detection.settles(1));

        let fallback = Detection {
            received: true,
            amount: Decimal::TEN,
            tx_hash: Some("usdc_transfer".to_string()),
            confirmations: 1,
            balance_only: true,
        };
        assert!(fallback.settles(3));
        assert!(!Detection::not_received().settles(0));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_become_not_received() {
        let adapter = Arc::new(SlowAdapter {
            calls: AtomicUsize::new(0),
        });
        let mut registry = AdapterRegistry::new(Duration::from_secs(10));
        registry.register(adapter.clone());

        let detection = registry
            .detect(Currency::Btc, "bc1q", Decimal::ONE)
            .await
            .unwrap();

        assert_eq!(detection, Detection::not_received());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn adapter_errors_stay_inside_the_registry() {
        let mut registry = AdapterRegistry::new(Duration::from_secs(10));
        registry.register(Arc::new(FailingAdapter));

        let detection = registry
            .detect(Currency::Eth, "0xabc", Decimal::ONE)
            .await
            .unwrap();
        assert!(!detection.received);
    }

    #[tokio::test]
    async fn missing_adapter_is_a_dispatch_error() {
        let registry = AdapterRegistry::new(Duration::from_secs(10));
        let res = registry.detect(Currency::Usdc, "0xabc", Decimal::ONE).await;
        assert_eq!(res, Err(DispatchError::Unsupported(Currency::Usdc)));
    }
}
