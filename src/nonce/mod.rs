//! Nonce sessions for shared wallets
//!
//! Handles:
//! - Cross-process mutual exclusion per (wallet, chain) via a session-scoped lock
//! - Chain-derived nonce sequencing within a session
//! - Reconciliation of earlier submissions before new ones go out

mod reconcile;

pub use reconcile::{ReconciliationWarning, WarningKind};

use crate::chain::ChainClient;
use crate::config::NonceConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::gas::GasConfig;
use crate::store::{CoordinationStore, LockConnection, PendingTransactionRecord, TransactionStatus};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lowercase 0x-prefixed hex, the form used in every durable record
pub fn normalize_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}

/// Advisory lock key for a (wallet, chain) pair
///
/// The first four address bytes XOR the low 32 bits of the chain id, with the
/// sign bit cleared. Collisions only serialize unrelated wallets; nonces are
/// always re-read from the chain.
pub fn derive_lock_key(address: &Address, chain_id: u64) -> i32 {
    let b = address.as_bytes();
    let prefix = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
    ((prefix ^ chain_id as u32) & 0x7fff_ffff) as i32
}

pub(crate) fn format_hash(tx_hash: &H256) -> String {
    format!("{:?}", tx_hash)
}

/// Exclusive access to one wallet on one chain
///
/// The dedicated lock connection lives inside the session; dropping the
/// session without `end_session` still releases the lock.
pub struct NonceSession {
    address: Address,
    wallet_address: String,
    chain_id: u64,
    execution_id: String,
    current_nonce: u64,
    started_at: DateTime<Utc>,
    lock_key: i32,
    connection: Option<Box<dyn LockConnection>>,
}

impl NonceSession {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Next nonce that will be handed out
    pub fn current_nonce(&self) -> u64 {
        self.current_nonce
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_some()
    }
}

impl fmt::Debug for NonceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceSession")
            .field("wallet_address", &self.wallet_address)
            .field("chain_id", &self.chain_id)
            .field("execution_id", &self.execution_id)
            .field("current_nonce", &self.current_nonce)
            .field("started_at", &self.started_at)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Outcome of reconciling prior submissions at session start
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    /// True only when reconciliation produced no warnings
    pub valid: bool,
    pub chain_nonce: u64,
    /// Records still pending after reconciliation
    pub pending_count: usize,
    pub reconciled_count: usize,
    pub warnings: Vec<ReconciliationWarning>,
}

/// Owns lock lifecycle, nonce sequencing and pending-record bookkeeping
pub struct NonceManager {
    store: Arc<dyn CoordinationStore>,
    config: NonceConfig,
}

impl NonceManager {
    /// Create a new nonce manager
    pub fn new(store: Arc<dyn CoordinationStore>, config: NonceConfig) -> Self {
        Self { store, config }
    }

    /// Lock the wallet, read its pending nonce and reconcile earlier submissions
    pub async fn start_session(
        &self,
        address: Address,
        chain_id: u64,
        execution_id: &str,
        chain: &dyn ChainClient,
    ) -> CoordinatorResult<(NonceSession, ValidationResult)> {
        let wallet = normalize_address(&address);
        let lock_key = derive_lock_key(&address, chain_id);

        let mut connection = self.acquire_lock(&wallet, chain_id, lock_key).await?;

        let validation = match self
            .initialize(address, &wallet, chain_id, execution_id, chain)
            .await
        {
            Ok(validation) => validation,
            Err(e) => {
                warn!(
                    "Session start failed for {} on chain {}, releasing lock: {}",
                    wallet, chain_id, e
                );
                if let Err(clear_err) = self
                    .store
                    .clear_wallet_lock(&wallet, chain_id, Some(execution_id))
                    .await
                {
                    warn!("Failed to clear lock metadata for {}: {}", wallet, clear_err);
                }
                if let Err(unlock_err) = connection.unlock(lock_key).await {
                    warn!("Failed to unlock {}: {}", wallet, unlock_err);
                }
                // Closing the connection releases the lock even if unlock failed
                if let Err(close_err) = connection.close().await {
                    warn!("Failed to close lock connection: {}", close_err);
                }
                return Err(e);
            }
        };

        let session = NonceSession {
            address,
            wallet_address: wallet,
            chain_id,
            execution_id: execution_id.to_string(),
            current_nonce: validation.chain_nonce,
            started_at: Utc::now(),
            lock_key,
            connection: Some(connection),
        };

        crate::metrics::record_session_started(chain_id);
        info!(
            "Nonce session started for {} on chain {} by {} at nonce {} ({} pending, {} reconciled)",
            session.wallet_address,
            chain_id,
            execution_id,
            validation.chain_nonce,
            validation.pending_count,
            validation.reconciled_count
        );

        Ok((session, validation))
    }

    /// Poll the advisory lock until acquired, clearing stale metadata on the way
    async fn acquire_lock(
        &self,
        wallet: &str,
        chain_id: u64,
        lock_key: i32,
    ) -> CoordinatorResult<Box<dyn LockConnection>> {
        let mut connection = self.store.connect_dedicated().await?;
        let max_attempts = self.config.max_lock_retries;

        for attempt in 1..=max_attempts {
            match connection.try_lock(lock_key).await {
                Ok(true) => {
                    debug!(
                        "Acquired lock {} for {} on chain {} (attempt {})",
                        lock_key, wallet, chain_id, attempt
                    );
                    return Ok(connection);
                }
                Ok(false) => {}
                Err(e) => {
                    if let Err(close_err) = connection.close().await {
                        warn!("Failed to close lock connection: {}", close_err);
                    }
                    return Err(e);
                }
            }

            crate::metrics::record_lock_contention(chain_id);
            if attempt == max_attempts {
                break;
            }

            if self.clear_if_stale(wallet, chain_id).await {
                continue;
            }
            tokio::time::sleep(self.config.lock_retry_delay()).await;
        }

        if let Err(e) = connection.close().await {
            warn!("Failed to close lock connection: {}", e);
        }
        crate::metrics::record_lock_failure(chain_id);
        Err(CoordinatorError::LockAcquisition {
            wallet: wallet.to_string(),
            chain_id,
            attempts: max_attempts,
        })
    }

    /// Clear the lock row if its holder looks crashed
    async fn clear_if_stale(&self, wallet: &str, chain_id: u64) -> bool {
        let record = match self.store.get_wallet_lock(wallet, chain_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                debug!("Could not read lock metadata for {}: {}", wallet, e);
                return false;
            }
        };

        let age = Utc::now().signed_duration_since(record.locked_at);
        let stale = age
            .to_std()
            .map(|age| age > self.config.lock_timeout())
            .unwrap_or(false);
        if !stale {
            return false;
        }

        warn!(
            "Lock on {} chain {} held by {} since {} looks stale, clearing",
            wallet, chain_id, record.locked_by, record.locked_at
        );
        crate::metrics::record_stale_lock(chain_id);
        if let Err(e) = self.store.clear_wallet_lock(wallet, chain_id, None).await {
            warn!("Failed to clear stale lock for {}: {}", wallet, e);
        }
        true
    }

    async fn initialize(
        &self,
        address: Address,
        wallet: &str,
        chain_id: u64,
        execution_id: &str,
        chain: &dyn ChainClient,
    ) -> CoordinatorResult<ValidationResult> {
        if let Err(e) = self
            .store
            .upsert_wallet_lock(wallet, chain_id, execution_id)
            .await
        {
            warn!("Failed to write lock metadata for {}: {}", wallet, e);
        }

        let chain_nonce = chain.get_pending_nonce(address).await?;

        let report =
            reconcile::reconcile(self.store.as_ref(), chain, wallet, chain_id, chain_nonce).await?;

        let pending_count = self
            .store
            .get_pending_transactions(wallet, chain_id)
            .await
            .map_err(|e| CoordinatorError::Reconciliation {
                wallet: wallet.to_string(),
                chain_id,
                message: e.to_string(),
            })?
            .len();

        Ok(ValidationResult {
            valid: report.warnings.is_empty(),
            chain_nonce,
            pending_count,
            reconciled_count: report.reconciled_count,
            warnings: report.warnings,
        })
    }

    /// Hand out the session's next nonce; no I/O
    pub fn get_next_nonce(&self, session: &mut NonceSession) -> u64 {
        let nonce = session.current_nonce;
        session.current_nonce += 1;
        debug!(
            "Allocated nonce {} for {} on chain {}",
            nonce, session.wallet_address, session.chain_id
        );
        nonce
    }

    /// Upsert the pending record for a submission at `nonce`
    pub async fn record_transaction(
        &self,
        session: &NonceSession,
        nonce: u64,
        tx_hash: H256,
        gas: &GasConfig,
        workflow_id: Option<&str>,
    ) -> CoordinatorResult<()> {
        let gas_price = serde_json::to_string(gas)
            .map_err(|e| CoordinatorError::Internal(e.to_string()))?;

        self.store
            .upsert_pending_transaction(&PendingTransactionRecord {
                wallet_address: session.wallet_address.clone(),
                chain_id: session.chain_id,
                nonce,
                tx_hash: format_hash(&tx_hash),
                execution_id: session.execution_id.clone(),
                workflow_id: workflow_id.map(str::to_string),
                gas_price,
                status: TransactionStatus::Pending,
                submitted_at: Utc::now(),
                confirmed_at: None,
            })
            .await
    }

    pub async fn confirm_transaction(&self, tx_hash: H256) -> CoordinatorResult<()> {
        self.store.confirm_transaction(&format_hash(&tx_hash)).await
    }

    /// Release the wallet; calling it again is a no-op
    pub async fn end_session(&self, session: &mut NonceSession) {
        let Some(mut connection) = session.connection.take() else {
            debug!(
                "Session for {} on chain {} already ended",
                session.wallet_address, session.chain_id
            );
            return;
        };

        if let Err(e) = self
            .store
            .clear_wallet_lock(
                &session.wallet_address,
                session.chain_id,
                Some(&session.execution_id),
            )
            .await
        {
            warn!(
                "Failed to clear lock metadata for {}: {}",
                session.wallet_address, e
            );
        }

        match connection.unlock(session.lock_key).await {
            Ok(true) => {}
            Ok(false) => warn!(
                "Lock {} for {} was not held at session end",
                session.lock_key, session.wallet_address
            ),
            Err(e) => warn!("Failed to unlock {}: {}", session.wallet_address, e),
        }
        // Closing the connection releases the lock even if unlock failed
        if let Err(e) = connection.close().await {
            warn!("Failed to close lock connection: {}", e);
        }

        let held = Utc::now().signed_duration_since(session.started_at);
        crate::metrics::record_session_duration(
            session.chain_id,
            held.num_milliseconds() as f64 / 1000.0,
        );
        info!(
            "Nonce session ended for {} on chain {} at nonce {}",
            session.wallet_address, session.chain_id, session.current_nonce
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::{hash, receipt, wallet, MockChain};
    use ethers::types::{Transaction, U256};

    fn test_config() -> NonceConfig {
        NonceConfig {
            lock_timeout_ms: 60_000,
            lock_retry_delay_ms: 1,
            max_lock_retries: 3,
        }
    }

    fn manager(store: &MemoryStore) -> NonceManager {
        NonceManager::new(Arc::new(store.clone()), test_config())
    }

    fn chain_at(nonce: u64) -> MockChain {
        let mut chain = MockChain::new();
        chain
            .expect_get_pending_nonce()
            .returning(move |_| Ok(nonce));
        chain
    }

    fn pending(nonce: u64, tx_hash: H256) -> PendingTransactionRecord {
        PendingTransactionRecord {
            wallet_address: normalize_address(&wallet()),
            chain_id: 1,
            nonce,
            tx_hash: format_hash(&tx_hash),
            execution_id: "earlier".to_string(),
            workflow_id: None,
            gas_price: "{}".to_string(),
            status: TransactionStatus::Pending,
            submitted_at: Utc::now(),
            confirmed_at: None,
        }
    }

    #[test]
    fn test_lock_key_masks_sign_bit() {
        let addr: Address = "0xffffffff00000000000000000000000000000000".parse().unwrap();
        assert_eq!(derive_lock_key(&addr, 1), 0x7fff_fffe);
        assert!(derive_lock_key(&wallet(), 8453) >= 0);
        assert_ne!(derive_lock_key(&wallet(), 1), derive_lock_key(&wallet(), 10));
    }

    #[test]
    fn test_address_is_lowercased() {
        assert_eq!(
            normalize_address(&wallet()),
            "0xabcdef0123456789abcdef0123456789abcdef01"
        );
    }

    #[tokio::test]
    async fn test_nonces_increase_from_chain_nonce() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        let chain = chain_at(5);

        let (mut session, validation) = manager
            .start_session(wallet(), 1, "exec-1", &chain)
            .await
            .unwrap();
        assert!(validation.valid);
        assert_eq!(validation.chain_nonce, 5);

        let nonces: Vec<u64> = (0..4).map(|_| manager.get_next_nonce(&mut session)).collect();
        assert_eq!(nonces, vec![5, 6, 7, 8]);
        assert_eq!(session.current_nonce(), 9);

        manager.end_session(&mut session).await;
    }

    #[tokio::test]
    async fn test_second_session_waits_then_fails() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        let chain = chain_at(0);

        let (mut first, _) = manager
            .start_session(wallet(), 1, "exec-1", &chain)
            .await
            .unwrap();

        let err = manager
            .start_session(wallet(), 1, "exec-2", &chain)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::LockAcquisition { attempts: 3, chain_id: 1, .. }
        ));

        manager.end_session(&mut first).await;
        let (mut second, _) = manager
            .start_session(wallet(), 1, "exec-2", &chain)
            .await
            .unwrap();
        manager.end_session(&mut second).await;
    }

    #[tokio::test]
    async fn test_concurrent_starts_admit_one() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        let chain = chain_at(0);

        let (a, b) = tokio::join!(
            manager.start_session(wallet(), 1, "exec-a", &chain),
            manager.start_session(wallet(), 1, "exec-b", &chain),
        );

        let mut winners: Vec<NonceSession> = [a, b]
            .into_iter()
            .filter_map(|r| r.ok().map(|(s, _)| s))
            .collect();
        assert_eq!(winners.len(), 1);
        manager.end_session(&mut winners[0]).await;
    }

    #[tokio::test]
    async fn test_different_chains_do_not_contend() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        let chain = chain_at(0);

        let (mut mainnet, _) = manager
            .start_session(wallet(), 1, "exec-1", &chain)
            .await
            .unwrap();
        let (mut base, _) = manager
            .start_session(wallet(), 8453, "exec-2", &chain)
            .await
            .unwrap();

        manager.end_session(&mut mainnet).await;
        manager.end_session(&mut base).await;
    }

    #[tokio::test]
    async fn test_crashed_holder_releases_lock() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        let chain = chain_at(0);

        let (crashed, _) = manager
            .start_session(wallet(), 1, "exec-crashed", &chain)
            .await
            .unwrap();
        // Connection loss without end_session
        drop(crashed);

        let (mut next, _) = manager
            .start_session(wallet(), 1, "exec-next", &chain)
            .await
            .unwrap();
        let lock = store
            .get_wallet_lock(next.wallet_address(), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lock.locked_by, "exec-next");
        manager.end_session(&mut next).await;
    }

    #[tokio::test]
    async fn test_stale_metadata_is_cleared() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        let chain = chain_at(0);
        let wallet_address = normalize_address(&wallet());

        // Some other connection still holds the lock
        let mut holder = store.connect_dedicated().await.unwrap();
        assert!(holder.try_lock(derive_lock_key(&wallet(), 1)).await.unwrap());
        store.set_wallet_lock(crate::store::WalletLockRecord {
            wallet_address: wallet_address.clone(),
            chain_id: 1,
            locked_by: "exec-ghost".to_string(),
            locked_at: Utc::now() - chrono::Duration::minutes(10),
        });

        let err = manager
            .start_session(wallet(), 1, "exec-1", &chain)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::LockAcquisition { .. }));
        assert!(store
            .get_wallet_lock(&wallet_address, 1)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failure_after_lock_releases_it() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        let mut chain = MockChain::new();
        chain.expect_get_pending_nonce().returning(|_| {
            Err(CoordinatorError::Chain {
                chain_id: 1,
                message: "connection refused".to_string(),
            })
        });

        let err = manager
            .start_session(wallet(), 1, "exec-1", &chain)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Chain { .. }));
        assert!(!store.is_locked(derive_lock_key(&wallet(), 1)));
        assert!(store
            .get_wallet_lock(&normalize_address(&wallet()), 1)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        let chain = chain_at(0);

        let (mut first, _) = manager
            .start_session(wallet(), 1, "exec-1", &chain)
            .await
            .unwrap();
        let (mut other, _) = manager
            .start_session(wallet(), 10, "exec-2", &chain)
            .await
            .unwrap();

        manager.end_session(&mut first).await;
        manager.end_session(&mut first).await;
        assert!(!first.is_active());

        assert!(other.is_active());
        assert!(store.is_locked(derive_lock_key(&wallet(), 10)));
        manager.end_session(&mut other).await;
    }

    #[tokio::test]
    async fn test_reconciliation_settles_consumed_nonces() {
        let store = MemoryStore::new();
        for (nonce, h) in [(3, hash(3)), (4, hash(4)), (5, hash(5)), (7, hash(7))] {
            store.upsert_pending_transaction(&pending(nonce, h)).await.unwrap();
        }
        let manager = manager(&store);

        let mut chain = chain_at(5);
        chain.expect_get_receipt().returning(|h| {
            Ok(if h == hash(3) { Some(receipt(h, true)) } else { None })
        });
        chain
            .expect_get_mempool_tx()
            .returning(|_| Ok(Some(Transaction::default())));

        let (mut session, validation) = manager
            .start_session(wallet(), 1, "exec-1", &chain)
            .await
            .unwrap();

        assert!(!validation.valid);
        assert_eq!(validation.chain_nonce, 5);
        assert_eq!(validation.reconciled_count, 2);
        assert_eq!(validation.pending_count, 2);
        let kinds: Vec<WarningKind> = validation.warnings.iter().map(|w| w.kind).collect();
        assert_eq!(
            kinds,
            vec![
                WarningKind::Replaced,
                WarningKind::BlockingMempool,
                WarningKind::AheadOfChain
            ]
        );

        let wallet_address = session.wallet_address().to_string();
        let status = |n| {
            let store = store.clone();
            let wallet_address = wallet_address.clone();
            async move {
                store
                    .get_transaction(&wallet_address, 1, n)
                    .await
                    .unwrap()
                    .unwrap()
                    .status
            }
        };
        assert_eq!(status(3).await, TransactionStatus::Confirmed);
        assert_eq!(status(4).await, TransactionStatus::Replaced);
        assert_eq!(status(5).await, TransactionStatus::Pending);
        assert_eq!(status(7).await, TransactionStatus::Pending);

        manager.end_session(&mut session).await;
    }

    #[tokio::test]
    async fn test_vanished_next_nonce_is_dropped() {
        let store = MemoryStore::new();
        store.upsert_pending_transaction(&pending(5, hash(5))).await.unwrap();
        let manager = manager(&store);

        let mut chain = chain_at(5);
        chain.expect_get_mempool_tx().returning(|_| Ok(None));

        let (mut session, validation) = manager
            .start_session(wallet(), 1, "exec-1", &chain)
            .await
            .unwrap();
        assert_eq!(validation.reconciled_count, 1);
        assert_eq!(validation.pending_count, 0);
        assert_eq!(validation.warnings[0].kind, WarningKind::Dropped);

        let record = store
            .get_transaction(session.wallet_address(), 1, 5)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, TransactionStatus::Dropped);
        manager.end_session(&mut session).await;
    }

    #[tokio::test]
    async fn test_resubmission_overwrites_record() {
        let store = MemoryStore::new();
        let manager = manager(&store);
        let chain = chain_at(9);
        let gas = GasConfig {
            gas_limit: U256::from(21_000),
            max_fee_per_gas: U256::from(10),
            max_priority_fee_per_gas: U256::from(1),
        };

        let (mut session, _) = manager
            .start_session(wallet(), 1, "exec-1", &chain)
            .await
            .unwrap();
        let nonce = manager.get_next_nonce(&mut session);
        manager
            .record_transaction(&session, nonce, hash(1), &gas, Some("wf-1"))
            .await
            .unwrap();
        manager
            .record_transaction(&session, nonce, hash(2), &gas, Some("wf-1"))
            .await
            .unwrap();
        manager.confirm_transaction(hash(2)).await.unwrap();

        let records = store.all_transactions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tx_hash, format_hash(&hash(2)));
        assert_eq!(records[0].status, TransactionStatus::Confirmed);
        assert!(records[0].confirmed_at.is_some());
        manager.end_session(&mut session).await;
    }
}
