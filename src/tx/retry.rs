//! Stuck transaction escalation
//!
//! Each attempt is `Submitted -> Confirmed | StillPending | stuck`. A stuck
//! attempt is replaced at the same nonce with fees scaled by the escalation
//! factor, until one confirms or the attempt cap is reached.

use super::{apply_gas, ExecutionContext, TransactionManager};
use crate::chain::ChainClient;
use crate::config::RetryConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::gas::{escalate_fees, GasConfig};
use crate::nonce::{format_hash, NonceSession};

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{TransactionReceipt, H256};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Poll every submitted hash until one has a receipt or the stuck threshold passes
///
/// Each lookup is bounded by the time left, so a hung node cannot hold the
/// attempt past its deadline.
pub(crate) async fn wait_for_receipt(
    chain: &dyn ChainClient,
    submitted: &[H256],
    retry: &RetryConfig,
) -> Option<(H256, TransactionReceipt)> {
    let deadline = Instant::now() + retry.stuck_threshold();

    loop {
        // Newest first; an earlier, cheaper attempt may still win
        for tx_hash in submitted.iter().rev() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, chain.get_receipt(*tx_hash)).await {
                Ok(Ok(Some(receipt))) => return Some((*tx_hash, receipt)),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!("Receipt lookup for {:?} failed: {}", tx_hash, e),
                Err(_) => {
                    debug!("Receipt lookup for {:?} timed out", tx_hash);
                    return None;
                }
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        tokio::time::sleep(retry.check_interval().min(deadline - now)).await;
    }
}

/// One bounded pass over the submitted hashes
async fn check_once(
    chain: &dyn ChainClient,
    hashes: &[H256],
    limit: Duration,
) -> Option<(H256, TransactionReceipt)> {
    for tx_hash in hashes.iter().rev() {
        if let Ok(Ok(Some(receipt))) = timeout(limit, chain.get_receipt(*tx_hash)).await {
            return Some((*tx_hash, receipt));
        }
    }
    None
}

impl TransactionManager {
    /// Sign, send and record one attempt at `nonce`
    async fn submit_attempt(
        &self,
        ctx: &ExecutionContext,
        session: &NonceSession,
        chain: &dyn ChainClient,
        nonce: u64,
        tx: &mut TypedTransaction,
        gas: &GasConfig,
    ) -> CoordinatorResult<H256> {
        apply_gas(tx, gas);

        let submission_failed = |message: String| CoordinatorError::TransactionSubmission {
            chain_id: session.chain_id(),
            nonce,
            message,
        };
        let tx_hash = match timeout(self.retry.send_timeout(), chain.send_transaction(tx)).await {
            Ok(Ok(tx_hash)) => tx_hash,
            Ok(Err(e)) => return Err(submission_failed(e.to_string())),
            Err(_) => {
                return Err(submission_failed(format!(
                    "send timed out after {}ms",
                    self.retry.send_timeout_ms
                )))
            }
        };
        crate::metrics::record_tx_submitted(session.chain_id());

        // Already broadcast: a bookkeeping failure must not abandon confirmation
        if let Err(e) = self
            .nonce_manager
            .record_transaction(session, nonce, tx_hash, gas, ctx.workflow_id.as_deref())
            .await
        {
            warn!("Failed to record tx {:?} at nonce {}: {}", tx_hash, nonce, e);
        }

        info!(
            "Transaction sent: {:?} from {} at nonce {} on chain {}",
            tx_hash,
            session.wallet_address(),
            nonce,
            session.chain_id()
        );
        Ok(tx_hash)
    }

    /// Resubmit `tx` at `nonce` with fees escalated from `previous`
    pub async fn replace_transaction(
        &self,
        ctx: &ExecutionContext,
        session: &NonceSession,
        chain: &dyn ChainClient,
        nonce: u64,
        tx: &mut TypedTransaction,
        previous: &GasConfig,
    ) -> CoordinatorResult<(H256, GasConfig)> {
        let gas = escalate_fees(previous, self.retry.escalation_factor);
        warn!(
            "Replacing stuck transaction at nonce {} on chain {}: max fee {} -> {}",
            nonce,
            session.chain_id(),
            previous.max_fee_per_gas,
            gas.max_fee_per_gas
        );
        crate::metrics::record_escalation(session.chain_id());

        let tx_hash = self
            .submit_attempt(ctx, session, chain, nonce, tx, &gas)
            .await?;
        Ok((tx_hash, gas))
    }

    /// Submit and keep escalating until confirmed or out of attempts
    pub(crate) async fn send_until_confirmed(
        &self,
        ctx: &ExecutionContext,
        session: &NonceSession,
        chain: &dyn ChainClient,
        nonce: u64,
        mut tx: TypedTransaction,
        gas: GasConfig,
    ) -> CoordinatorResult<(H256, TransactionReceipt)> {
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts: Vec<(H256, GasConfig)> = Vec::new();

        for attempt in 1..=max_attempts {
            let sent = match attempts.last() {
                None => self
                    .submit_attempt(ctx, session, chain, nonce, &mut tx, &gas)
                    .await
                    .map(|tx_hash| (tx_hash, gas.clone())),
                Some((_, previous)) => {
                    self.replace_transaction(ctx, session, chain, nonce, &mut tx, previous)
                        .await
                }
            };

            match sent {
                Ok(sent) => attempts.push(sent),
                Err(e) if !attempts.is_empty() => {
                    // A rejected replacement often means an earlier attempt was mined
                    let hashes: Vec<H256> = attempts.iter().map(|(h, _)| *h).collect();
                    if let Some(found) = check_once(chain, &hashes, self.retry.send_timeout()).await {
                        return self.settle_winner(ctx, session, nonce, &attempts, found, started).await;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }

            let hashes: Vec<H256> = attempts.iter().map(|(h, _)| *h).collect();
            if let Some(found) = wait_for_receipt(chain, &hashes, &self.retry).await {
                return self.settle_winner(ctx, session, nonce, &attempts, found, started).await;
            }

            warn!(
                "Transaction at nonce {} on chain {} unconfirmed after {}ms (attempt {}/{})",
                nonce,
                session.chain_id(),
                self.retry.stuck_threshold_ms,
                attempt,
                max_attempts
            );
        }

        let last_hash = attempts
            .last()
            .map(|(h, _)| format_hash(h))
            .unwrap_or_default();
        crate::metrics::record_stuck(session.chain_id());
        error!(
            "Transaction stuck for {} at nonce {} on chain {}: last hash {} after {} attempts",
            session.wallet_address(),
            nonce,
            session.chain_id(),
            last_hash,
            max_attempts
        );

        Err(CoordinatorError::StuckTransaction {
            wallet: session.wallet_address().to_string(),
            chain_id: session.chain_id(),
            nonce,
            tx_hash: last_hash,
            attempts: max_attempts,
        })
    }

    /// Point the record at whichever attempt was mined
    async fn settle_winner(
        &self,
        ctx: &ExecutionContext,
        session: &NonceSession,
        nonce: u64,
        attempts: &[(H256, GasConfig)],
        found: (H256, TransactionReceipt),
        started: Instant,
    ) -> CoordinatorResult<(H256, TransactionReceipt)> {
        let (tx_hash, receipt) = found;

        let latest = attempts.last().map(|(h, _)| *h);
        if latest != Some(tx_hash) {
            if let Some((_, gas)) = attempts.iter().find(|(h, _)| *h == tx_hash) {
                info!(
                    "Earlier attempt {:?} at nonce {} was mined instead of its replacement",
                    tx_hash, nonce
                );
                if let Err(e) = self
                    .nonce_manager
                    .record_transaction(session, nonce, tx_hash, gas, ctx.workflow_id.as_deref())
                    .await
                {
                    warn!("Failed to record mined tx {:?}: {}", tx_hash, e);
                }
            }
        }

        crate::metrics::record_tx_latency(session.chain_id(), started.elapsed().as_secs_f64());
        Ok((tx_hash, receipt))
    }
}
