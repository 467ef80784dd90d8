//! Error types for the transaction coordinator

use thiserror::Error;

/// Main error type for nonce coordination, gas pricing and submission
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain error for chain {chain_id}: {message}")]
    Chain { chain_id: u64, message: String },

    #[error("Failed to acquire nonce lock for wallet {wallet} on chain {chain_id} after {attempts} attempts")]
    LockAcquisition {
        wallet: String,
        chain_id: u64,
        attempts: u32,
    },

    #[error("Reconciliation failed for wallet {wallet} on chain {chain_id}: {message}")]
    Reconciliation {
        wallet: String,
        chain_id: u64,
        message: String,
    },

    #[error("Transaction submission failed on chain {chain_id} at nonce {nonce}: {message}")]
    TransactionSubmission {
        chain_id: u64,
        nonce: u64,
        message: String,
    },

    #[error("Transaction stuck for wallet {wallet} on chain {chain_id} at nonce {nonce}: last hash {tx_hash} after {attempts} attempts")]
    StuckTransaction {
        wallet: String,
        chain_id: u64,
        nonce: u64,
        tx_hash: String,
        attempts: u32,
    },

    #[error("Transaction {tx_hash} reverted on chain {chain_id} at nonce {nonce}")]
    TransactionReverted {
        chain_id: u64,
        nonce: u64,
        tx_hash: String,
    },

    #[error("Fee history unavailable for chain {chain_id}: {message}")]
    FeeHistoryUnavailable { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::Chain { .. } | CoordinatorError::FeeHistoryUnavailable { .. }
        )
    }

    /// Check if error should trigger an alert
    ///
    /// Stuck and reverted transactions may need manual on-chain intervention.
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            CoordinatorError::StuckTransaction { .. }
                | CoordinatorError::TransactionReverted { .. }
                | CoordinatorError::Reconciliation { .. }
                | CoordinatorError::Wallet(_)
        )
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
