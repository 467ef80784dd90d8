//! Reconciliation of recorded-but-unconfirmed transactions against chain state

use crate::chain::ChainClient;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::store::{CoordinationStore, PendingTransactionRecord, TransactionStatus};

use ethers::types::H256;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Why a pending record deserves attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// The nonce was consumed on-chain by a different transaction
    Replaced,
    /// Still in the mempool at the chain's next nonce; may block new submissions
    BlockingMempool,
    /// Vanished from the mempool without being mined
    Dropped,
    /// Recorded above the chain nonce, which correct operation never produces
    AheadOfChain,
}

/// Non-fatal finding attached to a started session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationWarning {
    pub nonce: u64,
    pub tx_hash: String,
    pub kind: WarningKind,
}

impl fmt::Display for ReconciliationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WarningKind::Replaced => write!(
                f,
                "nonce {} was used by another transaction; {} marked replaced",
                self.nonce, self.tx_hash
            ),
            WarningKind::BlockingMempool => write!(
                f,
                "tx {} at nonce {} is still in the mempool and may block new submissions",
                self.tx_hash, self.nonce
            ),
            WarningKind::Dropped => write!(
                f,
                "tx {} at nonce {} was dropped from the mempool",
                self.tx_hash, self.nonce
            ),
            WarningKind::AheadOfChain => write!(
                f,
                "tx {} recorded at nonce {} is ahead of the chain nonce",
                self.tx_hash, self.nonce
            ),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReconcileReport {
    pub reconciled_count: usize,
    pub warnings: Vec<ReconciliationWarning>,
}

/// Walk every pending record for the wallet and settle what the chain already decided
pub(crate) async fn reconcile(
    store: &dyn CoordinationStore,
    chain: &dyn ChainClient,
    wallet: &str,
    chain_id: u64,
    chain_nonce: u64,
) -> CoordinatorResult<ReconcileReport> {
    let failed = |e: CoordinatorError| CoordinatorError::Reconciliation {
        wallet: wallet.to_string(),
        chain_id,
        message: e.to_string(),
    };

    let records = store
        .get_pending_transactions(wallet, chain_id)
        .await
        .map_err(failed)?;

    let mut report = ReconcileReport::default();

    for record in records {
        let status = match settle(chain, &record, chain_nonce, &mut report.warnings)
            .await
            .map_err(failed)?
        {
            Some(status) => status,
            None => continue,
        };

        store
            .update_transaction_status(wallet, chain_id, record.nonce, status)
            .await
            .map_err(failed)?;
        report.reconciled_count += 1;
        crate::metrics::record_reconciled(chain_id, status.as_str());
        debug!(
            "Reconciled nonce {} on chain {} as {}",
            record.nonce, chain_id, status
        );
    }

    for warning in &report.warnings {
        warn!("Wallet {} on chain {}: {}", wallet, chain_id, warning);
    }

    Ok(report)
}

/// New status for the record, if the chain has settled it
async fn settle(
    chain: &dyn ChainClient,
    record: &PendingTransactionRecord,
    chain_nonce: u64,
    warnings: &mut Vec<ReconciliationWarning>,
) -> CoordinatorResult<Option<TransactionStatus>> {
    let mut warn_with = |kind| {
        warnings.push(ReconciliationWarning {
            nonce: record.nonce,
            tx_hash: record.tx_hash.clone(),
            kind,
        })
    };

    let Ok(tx_hash) = record.tx_hash.parse::<H256>() else {
        warn_with(WarningKind::Dropped);
        return Ok(Some(TransactionStatus::Dropped));
    };

    if record.nonce < chain_nonce {
        if chain.get_receipt(tx_hash).await?.is_some() {
            return Ok(Some(TransactionStatus::Confirmed));
        }
        warn_with(WarningKind::Replaced);
        Ok(Some(TransactionStatus::Replaced))
    } else if record.nonce == chain_nonce {
        if chain.get_mempool_tx(tx_hash).await?.is_some() {
            warn_with(WarningKind::BlockingMempool);
            return Ok(None);
        }
        warn_with(WarningKind::Dropped);
        Ok(Some(TransactionStatus::Dropped))
    } else {
        // Left untouched: issuance restarts from the chain nonce regardless
        warn_with(WarningKind::AheadOfChain);
        Ok(None)
    }
}
