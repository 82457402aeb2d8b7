//! ERC-20 (USDC) detection: token balance, then a bounded scan of `Transfer` logs.

use alloy::{
    primitives::Address,
    providers::{DynProvider, Provider},
    rpc::types::Filter,
    sol,
    sol_types::SolEvent,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;

use super::{
    units::{from_base_units, USDC_DECIMALS},
    ChainAdapter, ChainError, Detection,
};
use crate::db::repositories::models::payment::Currency;

/// Blocks behind the head searched for a matching `Transfer`.
pub const TRANSFER_SCAN_WINDOW: u64 = 100;

/// Reported as the transaction when the balance covers the payment but no
/// transfer shows up inside the scan window.
pub const PLACEHOLDER_TX_HASH: &str = "usdc_transfer";

sol! {
    #[sol(rpc)]
    interface ERC20 {
        function balanceOf(address owner) external view returns (uint256);
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub tx_hash: String,
    pub block_number: u64,
}

#[async_trait]
pub trait TokenLedger: Send + Sync {
    /// Balance in the token's smallest unit.
    async fn balance_of(&self, owner: &str) -> Result<u128, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Transfers into `owner` within `from_block..=to_block`, oldest first.
    async fn transfers_to(
        &self,
        owner: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TokenTransfer>, ChainError>;
}

pub struct UsdcAdapter<C> {
    client: C,
}

impl<C: TokenLedger> UsdcAdapter<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: TokenLedger> ChainAdapter for UsdcAdapter<C> {
    fn currency(&self) -> Currency {
        Currency::Usdc
    }

    async fn detect(&self, address: &str, expected: Decimal) -> Result<Detection, ChainError> {
        let balance = from_base_units(self.client.balance_of(address).await?, USDC_DECIMALS)?;

        if balance < expected {
            return Ok(Detection {
                amount: balance,
                ..Detection::not_received()
            });
        }

        let latest = self.client.block_number().await?;
        let transfers = self
            .client
            .transfers_to(address, latest.saturating_sub(TRANSFER_SCAN_WINDOW), latest)
            .await?;

        let detection = match transfers.last() {
            Some(transfer) => Detection {
                received: true,
                amount: balance,
                tx_hash: Some(transfer.tx_hash.clone()),
                confirmations: latest.saturating_sub(transfer.block_number),
                balance_only: false,
            },
            None => {
                debug!(
                    "[USDC] Balance of {} covers {} but no transfer in the last {} blocks",
                    address, expected, TRANSFER_SCAN_WINDOW
                );
                Detection {
                    received: true,
                    amount: balance,
                    tx_hash: Some(PLACEHOLDER_TX_HASH.to_string()),
                    confirmations: 1,
                    balance_only: true,
                }
            }
        };

        Ok(detection)
    }
}

pub struct Erc20Client {
    provider: DynProvider,
    token: Address,
}

impl Erc20Client {
    pub fn new(provider: DynProvider, token: Address) -> Self {
        Self { provider, token }
    }
}

fn parse_address(address: &str) -> Result<Address, ChainError> {
    address
        .parse::<Address>()
        .map_err(|_| ChainError::InvalidAddress(address.to_string()))
}

#[async_trait]
impl TokenLedger for Erc20Client {
    async fn balance_of(&self, owner: &str) -> Result<u128, ChainError> {
        let owner = parse_address(owner)?;
        let contract = ERC20::new(self.token, &self.provider);
        let balance = contract
            .balanceOf(owner)
            .call()
            .await
            .map_err(|e| ChainError::Rpc(format!("balanceOf failed: {e}")))?;

        balance
            .to_string()
            .parse::<u128>()
            .map_err(|_| ChainError::Malformed(format!("token balance {balance} out of range")))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| ChainError::Rpc(format!("eth_blockNumber failed: {e}")))
    }

    async fn transfers_to(
        &self,
        owner: &str,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TokenTransfer>, ChainError> {
        let owner = parse_address(owner)?;
        let filter = Filter::new()
            .address(self.token)
            .event_signature(ERC20::Transfer::SIGNATURE_HASH)
            .topic2(owner.into_word())
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| ChainError::Rpc(format!("eth_getLogs failed: {e}")))?;

        Ok(logs
            .into_iter()
            .filter_map(|log| {
                Some(TokenTransfer {
                    tx_hash: log.transaction_hash?.to_string(),
                    block_number: log.block_number?,
                })
            })
            .collect())
    }
}
