//! BTC detection through the BlockCypher address endpoint.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use bitcoincore_rpc::bitcoin::Network;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{
    units::{from_base_units, BTC_DECIMALS},
    ChainAdapter, ChainError, Detection,
};
use crate::db::repositories::models::payment::Currency;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Mainnet,
    Testnet,
    Regtest,
}

impl Chain {
    pub(crate) fn default_rpc_port(self) -> u16 {
        match self {
            Self::Mainnet => 8332,
            Self::Testnet => 18332,
            Self::Regtest => 18443,
        }
    }

    pub(crate) fn network(self) -> Network {
        match self {
            Self::Mainnet => Network::Bitcoin,
            Self::Testnet => Network::Testnet,
            Self::Regtest => Network::Regtest,
        }
    }

    /// BlockCypher coin/chain path segment. Regtest maps to BlockCypher's own test chain.
    pub(crate) fn blockcypher_path(self) -> &'static str {
        match self {
            Self::Mainnet => "btc/main",
            Self::Testnet => "btc/test3",
            Self::Regtest => "bcy/test",
        }
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            _ => Err(format!("unknown chain: {}", s)),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        })
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AddressInfo {
    /// Confirmed balance in satoshi.
    #[serde(default)]
    pub balance: u64,
    /// Confirmed transaction references, most recent first.
    #[serde(default)]
    pub txrefs: Vec<TxRef>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TxRef {
    pub tx_hash: String,
    #[serde(default)]
    pub confirmations: u64,
}

#[async_trait]
pub trait AddressIndex: Send + Sync {
    async fn address_info(&self, address: &str) -> Result<AddressInfo, ChainError>;
}

pub struct BitcoinAdapter<C> {
    client: C,
}

impl<C: AddressIndex> BitcoinAdapter<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: AddressIndex> ChainAdapter for BitcoinAdapter<C> {
    fn currency(&self) -> Currency {
        Currency::Btc
    }

    async fn detect(&self, address: &str, expected: Decimal) -> Result<Detection, ChainError> {
        let info = self.client.address_info(address).await?;
        let amount = from_base_units(u128::from(info.balance), BTC_DECIMALS)?;
        let last = info.txrefs.first();

        Ok(Detection {
            received: amount >= expected,
            amount,
            tx_hash: last.map(|tx| tx.tx_hash.clone()),
            confirmations: last.map(|tx| tx.confirmations).unwrap_or(0),
            balance_only: false,
        })
    }
}

pub struct BlockCypherClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BlockCypherClient {
    pub fn new(http: reqwest::Client, api_url: &str, chain: Chain, token: Option<String>) -> Self {
        Self {
            http,
            base_url: format!(
                "{}/{}/addrs",
                api_url.trim_end_matches('/'),
                chain.blockcypher_path()
            ),
            token,
        }
    }
}

#[async_trait]
impl AddressIndex for BlockCypherClient {
    async fn address_info(&self, address: &str) -> Result<AddressInfo, ChainError> {
        let mut req = self.http.get(format!("{}/{}", self.base_url, address));
        if let Some(token) = &self.token {
            req = req.query(&[("token", token.as_str())]);
        }

        Ok(req
            .send()
            .await?
            .error_for_status()?
            .json::<AddressInfo>()
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct FakeIndex(AddressInfo);

    #[async_trait]
    impl AddressIndex for FakeIndex {
        async fn address_info(&self, _: &str) -> Result<AddressInfo, ChainError> {
            Ok(self.0.clone())
        }
    }

    fn info(balance: u64, txrefs: &[(&str, u64)]) -> AddressInfo {
        AddressInfo {
            balance,
            txrefs: txrefs
                .iter()
                .map(|(hash, confirmations)| TxRef {
                    tx_hash: hash.to_string(),
                    confirmations: *confirmations,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn one_bitcoin_in_satoshi_completes_one_bitcoin() {
        let adapter = BitcoinAdapter::new(FakeIndex(info(100_000_000, &[("abc", 3), ("old", 90)])));

        let detection = adapter.detect("bc1qxyz", Decimal::ONE).await.unwrap();

        assert!(detection.received);
        assert_eq!(detection.tx_hash.as_deref(), Some("abc"));
        assert_eq!(detection.confirmations, 3);
        assert!(detection.settles(1));
    }

    #[tokio::test]
    async fn one_satoshi_short_is_not_received() {
        let adapter = BitcoinAdapter::new(FakeIndex(info(99_999_999, &[("abc", 3)])));

        let detection = adapter.detect("bc1qxyz", Decimal::ONE).await.unwrap();
        assert!(!detection.received);
    }

    #[tokio::test]
    async fn missing_txrefs_mean_zero_confirmations() {
        let adapter = BitcoinAdapter::new(FakeIndex(info(100_000_000, &[])));

        let detection = adapter.detect("bc1qxyz", Decimal::ONE).await.unwrap();

        assert!(detection.received);
        assert_eq!(detection.confirmations, 0);
        assert!(!detection.settles(1));
    }

    #[test]
    fn decodes_blockcypher_address_body() {
        let body = json!({
            "address": "bc1qxyz",
            "total_received": 150000000,
            "total_sent": 0,
            "balance": 150000000,
            "unconfirmed_balance": 0,
            "final_balance": 150000000,
            "n_tx": 1,
            "txrefs": [{
                "tx_hash": "f854aebae95150b379cc1187d848d58225f3c4157fe992bcd166f58bd5063449",
                "block_height": 302013,
                "tx_input_n": -1,
                "tx_output_n": 0,
                "value": 150000000,
                "spent": false,
                "confirmations": 87238
            }]
        });
        let info: AddressInfo = serde_json::from_value(body).unwrap();
        assert_eq!(info.balance, 150_000_000);
        assert_eq!(info.txrefs[0].confirmations, 87_238);

        let fresh: AddressInfo = serde_json::from_value(json!({ "address": "bc1qnew" })).unwrap();
        assert_eq!(fresh.balance, 0);
        assert!(fresh.txrefs.is_empty());
    }

    #[test]
    fn chain_paths() {
        assert_eq!("testnet".parse::<Chain>(), Ok(Chain::Testnet));
        assert!("signet".parse::<Chain>().is_err());
        assert_eq!(Chain::Mainnet.blockcypher_path(), "btc/main");
        assert_eq!(Chain::Testnet.network(), Network::Testnet);
    }
}
