//! Process-wide wiring of store, nonce manager, gas strategy and transaction manager
//!
//! Construct one per process and pass it (or its parts) to whatever runs
//! workflows. Tests build their own with a `MemoryStore`.

use crate::chain::provider::load_wallet;
use crate::chain::EthersChainClient;
use crate::config::Settings;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::gas::GasStrategy;
use crate::nonce::NonceManager;
use crate::store::{CoordinationStore, PgStore};
use crate::tx::TransactionManager;

use std::sync::Arc;
use tracing::{info, warn};

pub struct Coordinator {
    settings: Settings,
    store: Arc<dyn CoordinationStore>,
    nonce_manager: Arc<NonceManager>,
    gas_strategy: Arc<GasStrategy>,
    transaction_manager: TransactionManager,
}

impl Coordinator {
    /// Wire the components around an existing store
    pub fn new(store: Arc<dyn CoordinationStore>, settings: &Settings) -> Self {
        let nonce_manager = Arc::new(NonceManager::new(store.clone(), settings.nonce.clone()));
        let gas_strategy = Arc::new(GasStrategy::new(store.clone(), settings.gas.clone()));
        let transaction_manager = TransactionManager::new(
            nonce_manager.clone(),
            gas_strategy.clone(),
            settings.retry.clone(),
        );

        Self {
            settings: settings.clone(),
            store,
            nonce_manager,
            gas_strategy,
            transaction_manager,
        }
    }

    /// Connect to PostgreSQL, create tables and wire everything
    pub async fn connect(settings: &Settings) -> CoordinatorResult<Self> {
        let store = PgStore::new(&settings.database).await?;
        info!("Database connection established");

        store.run_migrations().await?;

        Ok(Self::new(Arc::new(store), settings))
    }

    /// Build a signing chain client for a configured chain
    pub async fn connect_chain(&self, chain_id: u64) -> CoordinatorResult<EthersChainClient> {
        let chain = self
            .settings
            .get_chain_by_id(chain_id)
            .filter(|c| c.enabled)
            .ok_or_else(|| {
                CoordinatorError::Config(format!("Chain {} is not configured or disabled", chain_id))
            })?;

        let wallet = load_wallet(&self.settings.wallet)?;
        EthersChainClient::new(chain.clone(), wallet).await
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn nonce_manager(&self) -> &Arc<NonceManager> {
        &self.nonce_manager
    }

    pub fn gas_strategy(&self) -> &Arc<GasStrategy> {
        &self.gas_strategy
    }

    pub fn transaction_manager(&self) -> &TransactionManager {
        &self.transaction_manager
    }

    pub async fn health_check(&self) -> CoordinatorResult<()> {
        self.store.health_check().await
    }

    /// Release pooled connections; sessions still open keep their own
    pub async fn shutdown(&self) {
        if let Err(e) = self.store.health_check().await {
            warn!("Store unhealthy at shutdown: {}", e);
        }
        self.store.close().await;
        info!("Transaction coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::TriggerType;
    use crate::store::MemoryStore;
    use crate::test_utils::{receipt, wallet, MockChain};
    use crate::tx::ExecutionContext;
    use ethers::types::{Eip1559TransactionRequest, H256, U256};

    const CONFIG: &str = r#"
[database]
url = "postgres://localhost/coordinator"
max_connections = 4
min_connections = 1

[retry]
check_interval_ms = 1
stuck_threshold_ms = 5

[chains.sepolia]
chain_id = 11155111
name = "Sepolia"
rpc_urls = ["http://localhost:8545"]
enabled = false
"#;

    #[tokio::test]
    async fn test_disabled_chain_is_rejected() {
        let settings = Settings::parse(CONFIG).unwrap();
        let coordinator = Coordinator::new(Arc::new(MemoryStore::new()), &settings);

        let err = coordinator.connect_chain(11155111).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));
        let err = coordinator.connect_chain(1).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));
    }

    #[tokio::test]
    async fn test_components_share_the_store() {
        let settings = Settings::parse(CONFIG).unwrap();
        let store = MemoryStore::new();
        let coordinator = Coordinator::new(Arc::new(store.clone()), &settings);

        let mut chain = MockChain::new();
        chain.expect_get_pending_nonce().returning(|_| Ok(0));
        chain
            .expect_estimate_gas()
            .returning(|_| Ok(U256::from(21_000)));
        chain.expect_get_fee_estimate().returning(|| {
            Ok(crate::chain::FeeEstimate::Legacy {
                gas_price: U256::exp10(9),
            })
        });
        chain
            .expect_send_transaction()
            .returning(|_| Ok(H256::repeat_byte(0x11)));
        chain
            .expect_get_receipt()
            .returning(|h| Ok(Some(receipt(h, true))));

        let ctx = ExecutionContext::new("exec-9", 11155111, TriggerType::Webhook);
        let (mut session, validation) = coordinator
            .nonce_manager()
            .start_session(wallet(), 11155111, &ctx.execution_id, &chain)
            .await
            .unwrap();
        assert!(validation.valid);

        let outcome = coordinator
            .transaction_manager()
            .execute_transaction(
                &ctx,
                wallet(),
                |nonce| Eip1559TransactionRequest::new().nonce(nonce).into(),
                &mut session,
                &chain,
            )
            .await;
        assert!(outcome.is_success());
        coordinator.nonce_manager().end_session(&mut session).await;

        assert_eq!(store.all_transactions().len(), 1);
        coordinator.health_check().await.unwrap();
        coordinator.shutdown().await;
    }
}
