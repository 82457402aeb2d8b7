//! Native ETH detection: Etherscan transaction history plus the node's block height.

use alloy::providers::{DynProvider, Provider};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use super::{
    units::{parse_base_units, ETH_DECIMALS},
    ChainAdapter, ChainError, Detection,
};
use crate::db::repositories::models::payment::Currency;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthTransaction {
    pub hash: String,
    pub to: Option<String>,
    /// Value in ETH.
    pub value: Decimal,
    /// `None` while the transaction is not mined.
    pub block_number: Option<u64>,
    pub failed: bool,
}

#[async_trait]
pub trait EthHistory: Send + Sync {
    /// Transactions touching `address`, oldest first.
    async fn history(&self, address: &str) -> Result<Vec<EthTransaction>, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;
}

pub struct EthereumAdapter<C> {
    client: C,
}

impl<C: EthHistory> EthereumAdapter<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

/// The most recent successful transfer into `address`.
fn latest_incoming<'a>(address: &str, history: &'a [EthTransaction]) -> Option<&'a EthTransaction> {
    history.iter().rev().find(|tx| {
        !tx.failed
            && tx
                .to
                .as_deref()
                .is_some_and(|to| to.eq_ignore_ascii_case(address))
    })
}

#[async_trait]
impl<C: EthHistory> ChainAdapter for EthereumAdapter<C> {
    fn currency(&self) -> Currency {
        Currency::Eth
    }

    async fn detect(&self, address: &str, expected: Decimal) -> Result<Detection, ChainError> {
        let history = self.client.history(address).await?;

        let tx = match latest_incoming(address, &history) {
            Some(tx) => tx,
            None => return Ok(Detection::not_received()),
        };
        let tx_block = match tx.block_number {
            Some(block) => block,
            None => {
                debug!("[ETH] Transaction {} for {} not mined yet", tx.hash, address);
                return Ok(Detection::not_received());
            }
        };

        let latest = self.client.block_number().await?;

        Ok(Detection {
            received: tx.value >= expected,
            amount: tx.value,
            tx_hash: Some(tx.hash.clone()),
            confirmations: latest.saturating_sub(tx_block),
            balance_only: false,
        })
    }
}

#[derive(Debug, Deserialize)]
struct EtherscanResponse {
    status: String,
    message: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtherscanTransaction {
    hash: String,
    #[serde(default)]
    block_number: String,
    #[serde(default)]
    to: String,
    value: String,
    #[serde(default)]
    is_error: String,
}

impl TryFrom<EtherscanTransaction> for EthTransaction {
    type Error = ChainError;

    fn try_from(tx: EtherscanTransaction) -> Result<Self, Self::Error> {
        Ok(EthTransaction {
            value: parse_base_units(&tx.value, ETH_DECIMALS)?,
            hash: tx.hash,
            to: Some(tx.to).filter(|to| !to.is_empty()),
            block_number: tx.block_number.parse::<u64>().ok().filter(|b| *b > 0),
            failed: tx.is_error == "1",
        })
    }
}

/// Decodes an Etherscan `account/txlist` body. An empty history comes back as
/// status "0" with "No transactions found"; anything else with status "0" is
/// an error (rate limit, bad key).
fn parse_txlist(body: EtherscanResponse) -> Result<Vec<EthTransaction>, ChainError> {
    if body.status != "1" {
        if body.message.starts_with("No transactions found") {
            return Ok(Vec::new());
        }
        return Err(ChainError::Malformed(format!(
            "etherscan: {} ({})",
            body.message, body.result
        )));
    }

    let txs: Vec<EtherscanTransaction> = serde_json::from_value(body.result)
        .map_err(|e| ChainError::Malformed(format!("etherscan txlist: {e}")))?;

    txs.into_iter().map(EthTransaction::try_from).collect()
}

pub struct EtherscanClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    chain_id: u64,
    provider: DynProvider,
}

impl EtherscanClient {
    pub fn new(
        http: reqwest::Client,
        api_url: &str,
        api_key: &str,
        chain_id: u64,
        provider: DynProvider,
    ) -> Self {
        Self {
            http,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            chain_id,
            provider,
        }
    }
}

#[async_trait]
impl EthHistory for EtherscanClient {
    async fn history(&self, address: &str) -> Result<Vec<EthTransaction>, ChainError> {
        let chain_id = self.chain_id.to_string();
        let body = self
            .http
            .get(&self.api_url)
            .query(&[
                ("chainid", chain_id.as_str()),
                ("module", "account"),
                ("action", "txlist"),
                ("address", address),
                ("startblock", "0"),
                ("endblock", "99999999"),
                ("sort", "asc"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json::<EtherscanResponse>()
            .await?;

        parse_txlist(body)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(format!("eth_blockNumber failed: {e}")))
    }
}
