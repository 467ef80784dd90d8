//! Transaction submission within nonce sessions
//!
//! A transaction runs: allocate nonce -> build -> estimate -> price ->
//! send (escalating while stuck) -> confirm. Failures are reported in the
//! outcome rather than raised, so one bad transaction does not end the session.

mod retry;

use crate::chain::ChainClient;
use crate::config::RetryConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::gas::{GasConfig, GasStrategy, TriggerType};
use crate::nonce::{NonceManager, NonceSession};

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionReceipt, H256, U256};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Who is sending, and how urgently
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub workflow_id: Option<String>,
    pub chain_id: u64,
    pub trigger_type: TriggerType,
    /// Replaces the policy's gas limit multiplier when set
    pub gas_limit_multiplier: Option<f64>,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>, chain_id: u64, trigger_type: TriggerType) -> Self {
        Self {
            execution_id: execution_id.into(),
            workflow_id: None,
            chain_id,
            trigger_type,
            gas_limit_multiplier: None,
        }
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_gas_limit_multiplier(mut self, multiplier: f64) -> Self {
        self.gas_limit_multiplier = Some(multiplier);
        self
    }
}

/// Result of one transaction inside a session
#[derive(Debug)]
pub enum TransactionOutcome {
    Confirmed {
        tx_hash: H256,
        receipt: TransactionReceipt,
        nonce: u64,
    },
    /// The nonce stays consumed; the next transaction gets the one after it
    Failed { error: CoordinatorError, nonce: u64 },
}

impl TransactionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransactionOutcome::Confirmed { .. })
    }

    pub fn nonce(&self) -> u64 {
        match self {
            TransactionOutcome::Confirmed { nonce, .. } | TransactionOutcome::Failed { nonce, .. } => {
                *nonce
            }
        }
    }

    pub fn tx_hash(&self) -> Option<H256> {
        match self {
            TransactionOutcome::Confirmed { tx_hash, .. } => Some(*tx_hash),
            TransactionOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&CoordinatorError> {
        match self {
            TransactionOutcome::Confirmed { .. } => None,
            TransactionOutcome::Failed { error, .. } => Some(error),
        }
    }
}

/// A call to an already-encoded contract function
#[derive(Debug, Clone)]
pub struct ContractCall {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

impl ContractCall {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            data: data.into(),
            value: U256::zero(),
        }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }
}

/// Write the priced gas fields into a transaction of any envelope
pub(crate) fn apply_gas(tx: &mut TypedTransaction, gas: &GasConfig) {
    tx.set_gas(gas.gas_limit);
    if let TypedTransaction::Eip1559(inner) = tx {
        inner.max_fee_per_gas = Some(gas.max_fee_per_gas);
        inner.max_priority_fee_per_gas = Some(gas.max_priority_fee_per_gas);
    } else {
        tx.set_gas_price(gas.max_fee_per_gas);
    }
}

/// Runs transactions through nonce sessions with priced, escalating submission
#[derive(Clone)]
pub struct TransactionManager {
    nonce_manager: Arc<NonceManager>,
    gas_strategy: Arc<GasStrategy>,
    retry: RetryConfig,
}

impl TransactionManager {
    pub fn new(
        nonce_manager: Arc<NonceManager>,
        gas_strategy: Arc<GasStrategy>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            nonce_manager,
            gas_strategy,
            retry,
        }
    }

    pub fn nonce_manager(&self) -> &Arc<NonceManager> {
        &self.nonce_manager
    }

    pub fn gas_strategy(&self) -> &Arc<GasStrategy> {
        &self.gas_strategy
    }

    /// Allocate a nonce, build, price, send and wait for the transaction
    pub async fn execute_transaction<F>(
        &self,
        ctx: &ExecutionContext,
        wallet: Address,
        build_tx: F,
        session: &mut NonceSession,
        chain: &dyn ChainClient,
    ) -> TransactionOutcome
    where
        F: FnOnce(u64) -> TypedTransaction + Send,
    {
        if let Err(error) = check_session(ctx, wallet, session, chain) {
            error!("Refusing transaction for {}: {}", ctx.execution_id, error);
            return TransactionOutcome::Failed {
                error,
                nonce: session.current_nonce(),
            };
        }

        let nonce = self.nonce_manager.get_next_nonce(session);
        let tx = build_tx(nonce);

        match self.submit_and_confirm(ctx, session, chain, nonce, tx).await {
            Ok((tx_hash, receipt)) => {
                crate::metrics::record_tx_confirmed(session.chain_id());
                info!(
                    "Transaction {:?} confirmed at nonce {} on chain {} in block {:?}",
                    tx_hash,
                    nonce,
                    session.chain_id(),
                    receipt.block_number
                );
                TransactionOutcome::Confirmed {
                    tx_hash,
                    receipt,
                    nonce,
                }
            }
            Err(error) => {
                crate::metrics::record_tx_failed(session.chain_id());
                if error.should_alert() {
                    error!(
                        "Transaction at nonce {} on chain {} failed: {}",
                        nonce,
                        session.chain_id(),
                        error
                    );
                } else {
                    warn!(
                        "Transaction at nonce {} on chain {} failed: {}",
                        nonce,
                        session.chain_id(),
                        error
                    );
                }
                TransactionOutcome::Failed { error, nonce }
            }
        }
    }

    /// Send calldata to a contract as an EIP-1559 transaction
    pub async fn execute_contract_transaction(
        &self,
        ctx: &ExecutionContext,
        wallet: Address,
        call: ContractCall,
        session: &mut NonceSession,
        chain: &dyn ChainClient,
    ) -> TransactionOutcome {
        debug!(
            "Contract call to {:?} with {} bytes of calldata",
            call.to,
            call.data.len()
        );
        let build = move |nonce: u64| -> TypedTransaction {
            Eip1559TransactionRequest::new()
                .to(call.to)
                .data(call.data)
                .value(call.value)
                .nonce(nonce)
                .into()
        };
        self.execute_transaction(ctx, wallet, build, session, chain)
            .await
    }

    /// Run `f` inside a session that is always ended afterwards
    ///
    /// A panic inside `f` drops the session, which releases the lock with the
    /// dedicated connection.
    pub async fn with_nonce_session<T, F>(
        &self,
        ctx: &ExecutionContext,
        wallet: Address,
        chain: &dyn ChainClient,
        f: F,
    ) -> CoordinatorResult<T>
    where
        F: for<'s> FnOnce(&'s mut NonceSession) -> BoxFuture<'s, CoordinatorResult<T>>,
    {
        let (mut session, validation) = self
            .nonce_manager
            .start_session(wallet, ctx.chain_id, &ctx.execution_id, chain)
            .await?;

        if !validation.valid {
            warn!(
                "Session for {} started with {} reconciliation warnings",
                session.wallet_address(),
                validation.warnings.len()
            );
        }

        let result = f(&mut session).await;
        self.nonce_manager.end_session(&mut session).await;
        result
    }

    async fn submit_and_confirm(
        &self,
        ctx: &ExecutionContext,
        session: &NonceSession,
        chain: &dyn ChainClient,
        nonce: u64,
        mut tx: TypedTransaction,
    ) -> CoordinatorResult<(H256, TransactionReceipt)> {
        tx.set_nonce(nonce);
        tx.set_from(session.address());
        tx.set_chain_id(session.chain_id());

        let estimated_gas = chain.estimate_gas(&tx).await.map_err(|e| {
            CoordinatorError::GasEstimation(format!("nonce {}: {}", nonce, e))
        })?;

        let gas = self
            .gas_strategy
            .get_gas_config(
                chain,
                ctx.trigger_type,
                estimated_gas,
                session.chain_id(),
                ctx.gas_limit_multiplier,
            )
            .await?;

        let (tx_hash, receipt) = self
            .send_until_confirmed(ctx, session, chain, nonce, tx, gas)
            .await?;

        // Mined either way; the record must not stay pending
        if let Err(e) = self.nonce_manager.confirm_transaction(tx_hash).await {
            warn!("Failed to mark {:?} confirmed: {}", tx_hash, e);
        }

        if receipt.status.map(|s| s.as_u64()) == Some(0) {
            return Err(CoordinatorError::TransactionReverted {
                chain_id: session.chain_id(),
                nonce,
                tx_hash: format!("{:?}", tx_hash),
            });
        }

        Ok((tx_hash, receipt))
    }
}

fn check_session(
    ctx: &ExecutionContext,
    wallet: Address,
    session: &NonceSession,
    chain: &dyn ChainClient,
) -> CoordinatorResult<()> {
    if !session.is_active() {
        return Err(CoordinatorError::Internal(format!(
            "nonce session for {} has already ended",
            session.wallet_address()
        )));
    }
    if session.address() != wallet {
        return Err(CoordinatorError::Wallet(format!(
            "session holds {} but transaction is from {:?}",
            session.wallet_address(),
            wallet
        )));
    }
    // The session's nonce and lock belong to its wallet; another signer would spend them
    if let Some(signer) = chain.signer_address() {
        if signer != session.address() {
            return Err(CoordinatorError::Wallet(format!(
                "chain client signs as {:?} but the session holds {}",
                signer,
                session.wallet_address()
            )));
        }
    }
    if session.chain_id() != ctx.chain_id {
        return Err(CoordinatorError::Internal(format!(
            "session is on chain {} but execution targets chain {}",
            session.chain_id(),
            ctx.chain_id
        )));
    }
    Ok(())
}
