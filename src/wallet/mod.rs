//! Receiving address generation for new payments.

use std::sync::Arc;

use alloy::signers::local::{coins_bip39::English, MnemonicBuilder};
use bitcoincore_rpc::{json::AddressType, Auth, Client, RpcApi};
use thiserror::Error;
use tracing::debug;

use crate::{
    chain::bitcoin::Chain,
    config::WalletConfig,
    db::{repositories::models::payment::Currency, PaymentRepository},
};

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("no wallet backend configured for {0}")]
    Unavailable(Currency),

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("bitcoin rpc error: {0}")]
    Rpc(#[from] bitcoincore_rpc::Error),

    #[error("address not valid for the configured network: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedAddress {
    pub address: String,
    pub derivation_path: String,
}

/// BIP-44 account for ETH and ERC-20 receiving addresses.
pub struct EvmHdWallet {
    mnemonic: String,
}

impl EvmHdWallet {
    pub fn new(mnemonic: impl Into<String>) -> Self {
        Self {
            mnemonic: mnemonic.into(),
        }
    }

    pub fn derive(&self, index: u32) -> Result<GeneratedAddress, WalletError> {
        let path = format!("m/44'/60'/0'/0/{}", index);
        let signer = MnemonicBuilder::<English>::default()
            .phrase(self.mnemonic.as_str())
            .derivation_path(path.as_str())
            .map_err(|e| WalletError::Derivation(e.to_string()))?
            .build()
            .map_err(|e| WalletError::Derivation(e.to_string()))?;

        Ok(GeneratedAddress {
            address: signer.address().to_checksum(None),
            derivation_path: path,
        })
    }
}

pub struct BitcoinRpcWallet {
    rpc: Arc<Client>,
    chain: Chain,
    wallet_name: String,
}

impl BitcoinRpcWallet {
    pub fn connect(
        rpc_url: &str,
        cookie: &str,
        wallet_name: &str,
        chain: Chain,
    ) -> Result<Self, WalletError> {
        let url = format!("{}/wallet/{}", rpc_url.trim_end_matches('/'), wallet_name);
        let rpc = Client::new(&url, Auth::CookieFile(cookie.into()))?;

        Ok(Self {
            rpc: Arc::new(rpc),
            chain,
            wallet_name: wallet_name.to_string(),
        })
    }

    pub async fn new_address(&self) -> Result<GeneratedAddress, WalletError> {
        let rpc = self.rpc.clone();
        let network = self.chain.network();
        let fallback_path = format!("wallet:{}", self.wallet_name);

        // bitcoincore-rpc is blocking
        tokio::task::spawn_blocking(move || {
            let address = rpc
                .get_new_address(None, Some(AddressType::Bech32))?
                .require_network(network)
                .map_err(|e| WalletError::Network(e.to_string()))?;

            let derivation_path = rpc
                .get_address_info(&address)?
                .hd_key_path
                .map(|path| path.to_string())
                .unwrap_or(fallback_path);

            Ok(GeneratedAddress {
                address: address.to_string(),
                derivation_path,
            })
        })
        .await
        .map_err(|e| WalletError::Network(format!("address task failed: {}", e)))?
    }
}

/// Address backends per currency; either may be absent.
#[derive(Default)]
pub struct Wallets {
    evm: Option<EvmHdWallet>,
    btc: Option<BitcoinRpcWallet>,
}

impl Wallets {
    pub fn new(evm: Option<EvmHdWallet>, btc: Option<BitcoinRpcWallet>) -> Self {
        Self { evm, btc }
    }

    pub fn from_config(config: &WalletConfig) -> Result<Self, WalletError> {
        let evm = config.mnemonic.as_deref().map(EvmHdWallet::new);

        let btc = match &config.bitcoin_rpc_cookie {
            Some(cookie) => {
                let url = config.bitcoin_rpc_url.clone().unwrap_or_else(|| {
                    format!(
                        "http://127.0.0.1:{}",
                        config.bitcoin_chain.default_rpc_port()
                    )
                });
                Some(BitcoinRpcWallet::connect(
                    &url,
                    cookie,
                    &config.bitcoin_wallet_name,
                    config.bitcoin_chain,
                )?)
            }
            None => None,
        };

        Ok(Self { evm, btc })
    }

    pub fn supports(&self, currency: Currency) -> bool {
        match currency {
            Currency::Eth | Currency::Usdc => self.evm.is_some(),
            Currency::Btc => self.btc.is_some(),
        }
    }

    pub async fn generate<R: PaymentRepository>(
        &self,
        repository: &R,
        currency: Currency,
    ) -> Result<GeneratedAddress, WalletError> {
        let generated = match currency {
            Currency::Eth | Currency::Usdc => {
                let wallet = self.evm.as_ref().ok_or(WalletError::Unavailable(currency))?;
                let index = repository.next_derivation_index().await?;
                wallet.derive(index)?
            }
            Currency::Btc => {
                let wallet = self.btc.as_ref().ok_or(WalletError::Unavailable(currency))?;
                wallet.new_address().await?
            }
        };

        debug!(
            "Generated {} address {} ({})",
            currency, generated.address, generated.derivation_path
        );
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRepository;

    const TEST_MNEMONIC: &str = "test test test test test test test test test test test junk";

    #[test]
    fn derives_the_well_known_first_account() {
        let wallet = EvmHdWallet::new(TEST_MNEMONIC);

        let first = wallet.derive(0).unwrap();
        assert_eq!(
            first.address.to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
        assert_eq!(first.derivation_path, "m/44'/60'/0'/0/0");

        let second = wallet.derive(1).unwrap();
        assert_eq!(
            second.address.to_lowercase(),
            "0x70997970c51812dc3a010c7d01b50e0d17dc79c8"
        );
    }

    #[test]
    fn bad_mnemonic_is_a_derivation_error() {
        let wallet = EvmHdWallet::new("not a mnemonic");
        assert!(matches!(wallet.derive(0), Err(WalletError::Derivation(_))));
    }

    #[tokio::test]
    async fn consecutive_evm_payments_get_distinct_addresses() {
        let repository = MemoryRepository::new();
        let wallets = Wallets::new(Some(EvmHdWallet::new(TEST_MNEMONIC)), None);

        let a = wallets.generate(&repository, Currency::Eth).await.unwrap();
        let b = wallets.generate(&repository, Currency::Usdc).await.unwrap();

        assert_ne!(a.address, b.address);
        assert_eq!(b.derivation_path, "m/44'/60'/0'/0/1");
    }

    #[tokio::test]
    async fn unconfigured_backend_is_unavailable() {
        let repository = MemoryRepository::new();
        let wallets = Wallets::default();

        let err = wallets.generate(&repository, Currency::Btc).await.unwrap_err();
        assert!(matches!(err, WalletError::Unavailable(Currency::Btc)));
        assert!(!wallets.supports(Currency::Eth));
    }
}
