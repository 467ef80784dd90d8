//! Chain client with multi-RPC support and automatic failover

use super::{ChainClient, FeeEstimate, FeeHistory};
use crate::config::{ChainConfig, WalletConfig};
use crate::error::{CoordinatorError, CoordinatorResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Multi-provider ethers client that signs with a local wallet
pub struct EthersChainClient {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Signing wallet, bound to this chain's id
    wallet: LocalWallet,
}

impl fmt::Debug for EthersChainClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EthersChainClient")
            .field("chain_id", &self.config.chain_id)
            .field("name", &self.config.name)
            .field("providers", &self.http_providers.len())
            .field("wallet", &self.wallet.address())
            .finish()
    }
}

impl EthersChainClient {
    /// Create a new chain client
    pub async fn new(config: ChainConfig, wallet: LocalWallet) -> CoordinatorResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(CoordinatorError::Chain {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        match http_providers[0].get_chainid().await {
            Ok(remote) if remote != U256::from(config.chain_id) => {
                return Err(CoordinatorError::Config(format!(
                    "Chain {} RPC reports chain id {}",
                    config.name, remote
                )));
            }
            Ok(_) => {}
            Err(e) => warn!("Could not verify chain id for {}: {}", config.name, e),
        }

        let wallet = wallet.with_chain_id(config.chain_id);
        info!(
            "Chain client for {} (ID: {}) ready with wallet {:?}",
            config.name,
            config.chain_id,
            wallet.address()
        );

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            wallet,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Address of the signing wallet
    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    fn chain_error(&self, e: impl Display) -> CoordinatorError {
        CoordinatorError::Chain {
            chain_id: self.config.chain_id,
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    fn signer_address(&self) -> Option<Address> {
        Some(self.wallet.address())
    }

    async fn get_pending_nonce(&self, address: Address) -> CoordinatorResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self
                .http()
                .get_transaction_count(address, Some(BlockNumber::Pending.into()))
                .await
            {
                Ok(nonce) => return Ok(nonce.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get pending nonce from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.chain_error("All providers failed to return a pending nonce"))
    }

    async fn get_fee_history(
        &self,
        block_count: u64,
        percentiles: &[f64],
    ) -> CoordinatorResult<FeeHistory> {
        let history = self
            .http()
            .fee_history(block_count, BlockNumber::Latest, percentiles)
            .await
            .map_err(|e| CoordinatorError::FeeHistoryUnavailable {
                chain_id: self.config.chain_id,
                message: e.to_string(),
            })?;

        Ok(FeeHistory {
            base_fee_per_gas: history.base_fee_per_gas,
            reward: history.reward,
        })
    }

    async fn get_fee_estimate(&self) -> CoordinatorResult<FeeEstimate> {
        match self.http().estimate_eip1559_fees(None).await {
            Ok((max_fee_per_gas, max_priority_fee_per_gas)) => Ok(FeeEstimate::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }),
            Err(e) => {
                // Chains without a base fee only answer eth_gasPrice
                debug!(
                    "EIP-1559 estimation unavailable on chain {}: {}",
                    self.config.chain_id, e
                );
                let gas_price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| self.chain_error(e))?;
                Ok(FeeEstimate::Legacy { gas_price })
            }
        }
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> CoordinatorResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| CoordinatorError::GasEstimation(e.to_string()))
    }

    async fn send_transaction(&self, tx: &TypedTransaction) -> CoordinatorResult<H256> {
        let mut tx = tx.clone();
        tx.set_chain_id(self.config.chain_id);

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| CoordinatorError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| self.chain_error(e))?;

        Ok(pending.tx_hash())
    }

    async fn get_receipt(&self, tx_hash: H256) -> CoordinatorResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.chain_error(e))
    }

    async fn get_mempool_tx(&self, tx_hash: H256) -> CoordinatorResult<Option<Transaction>> {
        let tx = self
            .http()
            .get_transaction(tx_hash)
            .await
            .map_err(|e| self.chain_error(e))?;

        // Mined transactions are no longer in the mempool
        Ok(tx.filter(|tx| tx.block_number.is_none()))
    }
}

/// Load the signing wallet from the environment variable named in config
pub fn load_wallet(config: &WalletConfig) -> CoordinatorResult<LocalWallet> {
    let var = config
        .private_key_env
        .as_deref()
        .unwrap_or("COORDINATOR_PRIVATE_KEY");

    let key = std::env::var(var).map_err(|_| {
        CoordinatorError::Wallet(format!("No wallet configured. Set {}", var))
    })?;

    key.trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| CoordinatorError::Wallet(format!("Invalid private key: {}", e)))
}
