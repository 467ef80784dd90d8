//! Coordination store - durable records and the session-scoped wallet lock
//!
//! Handles:
//! - Pending transaction records keyed by (wallet, chain, nonce)
//! - Wallet lock metadata for observability and stale-holder detection
//! - Per-chain gas policy overrides
//! - Dedicated connections carrying the advisory lock itself

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::gas::ChainGasOverride;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Replaced,
    Dropped,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Replaced => "replaced",
            TransactionStatus::Dropped => "dropped",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "confirmed" => Ok(TransactionStatus::Confirmed),
            "replaced" => Ok(TransactionStatus::Replaced),
            "dropped" => Ok(TransactionStatus::Dropped),
            other => Err(CoordinatorError::Internal(format!(
                "Unknown transaction status: {}",
                other
            ))),
        }
    }
}

/// One row per (wallet, chain, nonce); a resubmission at the same nonce overwrites it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransactionRecord {
    pub wallet_address: String,
    pub chain_id: u64,
    pub nonce: u64,
    pub tx_hash: String,
    pub execution_id: String,
    pub workflow_id: Option<String>,
    /// Serialized fee parameters the transaction was priced with
    pub gas_price: String,
    pub status: TransactionStatus,
    pub submitted_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Who holds the lock for a (wallet, chain) pair, as last written by the holder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletLockRecord {
    pub wallet_address: String,
    pub chain_id: u64,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

/// A single, non-pooled connection holding session-scoped advisory locks
///
/// Locks are released when the connection ends, whether through `close`,
/// drop, or the process dying.
#[async_trait]
pub trait LockConnection: Send + Sync {
    /// Non-blocking, non-reentrant acquire
    async fn try_lock(&mut self, key: i32) -> CoordinatorResult<bool>;

    async fn unlock(&mut self, key: i32) -> CoordinatorResult<bool>;

    async fn close(self: Box<Self>) -> CoordinatorResult<()>;
}

/// Durable storage shared by every process coordinating the same wallets
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Open a dedicated connection for advisory locking
    async fn connect_dedicated(&self) -> CoordinatorResult<Box<dyn LockConnection>>;

    async fn get_wallet_lock(
        &self,
        wallet_address: &str,
        chain_id: u64,
    ) -> CoordinatorResult<Option<WalletLockRecord>>;

    async fn upsert_wallet_lock(
        &self,
        wallet_address: &str,
        chain_id: u64,
        locked_by: &str,
    ) -> CoordinatorResult<()>;

    /// Remove the lock row; with `locked_by` set, only if that holder wrote it
    async fn clear_wallet_lock(
        &self,
        wallet_address: &str,
        chain_id: u64,
        locked_by: Option<&str>,
    ) -> CoordinatorResult<()>;

    async fn upsert_pending_transaction(
        &self,
        record: &PendingTransactionRecord,
    ) -> CoordinatorResult<()>;

    /// Records still in `pending` status, ordered by nonce
    async fn get_pending_transactions(
        &self,
        wallet_address: &str,
        chain_id: u64,
    ) -> CoordinatorResult<Vec<PendingTransactionRecord>>;

    async fn get_transaction(
        &self,
        wallet_address: &str,
        chain_id: u64,
        nonce: u64,
    ) -> CoordinatorResult<Option<PendingTransactionRecord>>;

    async fn update_transaction_status(
        &self,
        wallet_address: &str,
        chain_id: u64,
        nonce: u64,
        status: TransactionStatus,
    ) -> CoordinatorResult<()>;

    /// Mark the record carrying this hash as confirmed
    async fn confirm_transaction(&self, tx_hash: &str) -> CoordinatorResult<()>;

    async fn get_chain_gas_override(
        &self,
        chain_id: u64,
    ) -> CoordinatorResult<Option<ChainGasOverride>>;

    async fn health_check(&self) -> CoordinatorResult<()>;

    /// Release pooled resources
    async fn close(&self);
}
