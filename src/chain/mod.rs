//! Chain module - the ledger operations consumed by nonce coordination
//!
//! The chain is treated as the source of truth for nonces but also as an
//! untrusted, sometimes-inconsistent oracle: every call may fail and callers
//! decide whether that failure is fatal.

pub mod provider;

pub use provider::EthersChainClient;

use crate::error::CoordinatorResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Transaction, TransactionReceipt, H256, U256};

/// Historical fee data over a window of recent blocks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeeHistory {
    /// Base fee per block, oldest first; the final entry is the next block's base fee
    pub base_fee_per_gas: Vec<U256>,
    /// Priority fee rewards per block, one entry per requested percentile
    pub reward: Vec<Vec<U256>>,
}

/// The chain's own fee suggestion
#[derive(Debug, Clone, PartialEq)]
pub enum FeeEstimate {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

/// Operations the coordinator needs from a blockchain node
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Account that `send_transaction` signs as; `None` when the client does not sign
    fn signer_address(&self) -> Option<Address> {
        None
    }

    /// Nonce including transactions still in the mempool
    async fn get_pending_nonce(&self, address: Address) -> CoordinatorResult<u64>;

    async fn get_fee_history(
        &self,
        block_count: u64,
        percentiles: &[f64],
    ) -> CoordinatorResult<FeeHistory>;

    async fn get_fee_estimate(&self) -> CoordinatorResult<FeeEstimate>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> CoordinatorResult<U256>;

    /// Sign and broadcast, returning the transaction hash
    async fn send_transaction(&self, tx: &TypedTransaction) -> CoordinatorResult<H256>;

    async fn get_receipt(&self, tx_hash: H256) -> CoordinatorResult<Option<TransactionReceipt>>;

    /// Look a transaction up by hash; `None` once the node no longer knows it
    async fn get_mempool_tx(&self, tx_hash: H256) -> CoordinatorResult<Option<Transaction>>;
}
