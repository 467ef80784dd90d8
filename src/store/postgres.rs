//! PostgreSQL coordination store

use super::{
    CoordinationStore, LockConnection, PendingTransactionRecord, TransactionStatus,
    WalletLockRecord,
};
use crate::config::DatabaseConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::gas::ChainGasOverride;

use async_trait::async_trait;
use ethers::types::U256;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Connection, Row};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// PostgreSQL store: a pool for durable tables, fresh connections for locks
pub struct PgStore {
    pool: PgPool,
    /// Kept so lock connections bypass the pool
    database_url: String,
}

impl PgStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> CoordinatorResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self {
            pool,
            database_url: config.url.clone(),
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_transactions (
                wallet_address VARCHAR(66) NOT NULL,
                chain_id BIGINT NOT NULL,
                nonce BIGINT NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                execution_id TEXT NOT NULL,
                workflow_id TEXT,
                gas_price TEXT NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                confirmed_at TIMESTAMPTZ,
                PRIMARY KEY (wallet_address, chain_id, nonce)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_transactions_status
            ON pending_transactions (wallet_address, chain_id, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_pending_transactions_hash
            ON pending_transactions (tx_hash)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_locks (
                wallet_address VARCHAR(66) NOT NULL,
                chain_id BIGINT NOT NULL,
                locked_by TEXT NOT NULL,
                locked_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (wallet_address, chain_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_gas_configs (
                chain_id BIGINT PRIMARY KEY,
                gas_limit_multiplier DOUBLE PRECISION,
                conservative_gas_limit_multiplier DOUBLE PRECISION,
                volatility_threshold DOUBLE PRECISION,
                min_percentile DOUBLE PRECISION,
                max_percentile DOUBLE PRECISION,
                min_priority_fee_wei TEXT,
                max_priority_fee_wei TEXT,
                max_fee_multiplier DOUBLE PRECISION,
                fee_history_blocks BIGINT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> CoordinatorResult<PendingTransactionRecord> {
    let status: String = row.try_get("status")?;
    Ok(PendingTransactionRecord {
        wallet_address: row.try_get("wallet_address")?,
        chain_id: row.try_get::<i64, _>("chain_id")? as u64,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        tx_hash: row.try_get("tx_hash")?,
        execution_id: row.try_get("execution_id")?,
        workflow_id: row.try_get("workflow_id")?,
        gas_price: row.try_get("gas_price")?,
        status: status.parse()?,
        submitted_at: row.try_get("submitted_at")?,
        confirmed_at: row.try_get("confirmed_at")?,
    })
}

fn parse_wei(value: Option<String>) -> CoordinatorResult<Option<U256>> {
    value
        .map(|v| {
            U256::from_dec_str(v.trim())
                .map_err(|e| CoordinatorError::Config(format!("Invalid wei amount {}: {}", v, e)))
        })
        .transpose()
}

const RECORD_COLUMNS: &str = "wallet_address, chain_id, nonce, tx_hash, execution_id, \
     workflow_id, gas_price, status, submitted_at, confirmed_at";

#[async_trait]
impl CoordinationStore for PgStore {
    async fn connect_dedicated(&self) -> CoordinatorResult<Box<dyn LockConnection>> {
        let conn = PgConnection::connect(&self.database_url).await?;
        Ok(Box::new(PgLockConnection {
            conn: Mutex::new(conn),
        }))
    }

    async fn get_wallet_lock(
        &self,
        wallet_address: &str,
        chain_id: u64,
    ) -> CoordinatorResult<Option<WalletLockRecord>> {
        let row = sqlx::query(
            "SELECT locked_by, locked_at FROM wallet_locks WHERE wallet_address = $1 AND chain_id = $2",
        )
        .bind(wallet_address)
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(WalletLockRecord {
                wallet_address: wallet_address.to_string(),
                chain_id,
                locked_by: r.try_get("locked_by")?,
                locked_at: r.try_get("locked_at")?,
            })
        })
        .transpose()
    }

    async fn upsert_wallet_lock(
        &self,
        wallet_address: &str,
        chain_id: u64,
        locked_by: &str,
    ) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_locks (wallet_address, chain_id, locked_by, locked_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (wallet_address, chain_id)
            DO UPDATE SET locked_by = $3, locked_at = NOW()
            "#,
        )
        .bind(wallet_address)
        .bind(chain_id as i64)
        .bind(locked_by)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_wallet_lock(
        &self,
        wallet_address: &str,
        chain_id: u64,
        locked_by: Option<&str>,
    ) -> CoordinatorResult<()> {
        match locked_by {
            Some(holder) => {
                sqlx::query(
                    "DELETE FROM wallet_locks WHERE wallet_address = $1 AND chain_id = $2 AND locked_by = $3",
                )
                .bind(wallet_address)
                .bind(chain_id as i64)
                .bind(holder)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM wallet_locks WHERE wallet_address = $1 AND chain_id = $2")
                    .bind(wallet_address)
                    .bind(chain_id as i64)
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(())
    }

    async fn upsert_pending_transaction(
        &self,
        record: &PendingTransactionRecord,
    ) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_transactions
                (wallet_address, chain_id, nonce, tx_hash, execution_id, workflow_id,
                 gas_price, status, submitted_at, confirmed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (wallet_address, chain_id, nonce)
            DO UPDATE SET tx_hash = $4, execution_id = $5, workflow_id = $6,
                          gas_price = $7, status = $8, submitted_at = $9, confirmed_at = $10
            "#,
        )
        .bind(&record.wallet_address)
        .bind(record.chain_id as i64)
        .bind(record.nonce as i64)
        .bind(&record.tx_hash)
        .bind(&record.execution_id)
        .bind(&record.workflow_id)
        .bind(&record.gas_price)
        .bind(record.status.as_str())
        .bind(record.submitted_at)
        .bind(record.confirmed_at)
        .execute(&self.pool)
        .await?;

        debug!(
            "Recorded tx {} for {} at nonce {} on chain {}",
            record.tx_hash, record.wallet_address, record.nonce, record.chain_id
        );
        Ok(())
    }

    async fn get_pending_transactions(
        &self,
        wallet_address: &str,
        chain_id: u64,
    ) -> CoordinatorResult<Vec<PendingTransactionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pending_transactions \
             WHERE wallet_address = $1 AND chain_id = $2 AND status = 'pending' \
             ORDER BY nonce",
            RECORD_COLUMNS
        ))
        .bind(wallet_address)
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn get_transaction(
        &self,
        wallet_address: &str,
        chain_id: u64,
        nonce: u64,
    ) -> CoordinatorResult<Option<PendingTransactionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pending_transactions \
             WHERE wallet_address = $1 AND chain_id = $2 AND nonce = $3",
            RECORD_COLUMNS
        ))
        .bind(wallet_address)
        .bind(chain_id as i64)
        .bind(nonce as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn update_transaction_status(
        &self,
        wallet_address: &str,
        chain_id: u64,
        nonce: u64,
        status: TransactionStatus,
    ) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            UPDATE pending_transactions
            SET status = $4,
                confirmed_at = CASE WHEN $4 = 'confirmed' THEN NOW() ELSE confirmed_at END
            WHERE wallet_address = $1 AND chain_id = $2 AND nonce = $3
            "#,
        )
        .bind(wallet_address)
        .bind(chain_id as i64)
        .bind(nonce as i64)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn confirm_transaction(&self, tx_hash: &str) -> CoordinatorResult<()> {
        sqlx::query(
            r#"
            UPDATE pending_transactions
            SET status = 'confirmed', confirmed_at = NOW()
            WHERE tx_hash = $1
            "#,
        )
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_chain_gas_override(
        &self,
        chain_id: u64,
    ) -> CoordinatorResult<Option<ChainGasOverride>> {
        let row = sqlx::query(
            r#"
            SELECT gas_limit_multiplier, conservative_gas_limit_multiplier, volatility_threshold,
                   min_percentile, max_percentile, min_priority_fee_wei, max_priority_fee_wei,
                   max_fee_multiplier, fee_history_blocks
            FROM chain_gas_configs
            WHERE chain_id = $1
            "#,
        )
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ChainGasOverride {
            gas_limit_multiplier: row.try_get("gas_limit_multiplier")?,
            conservative_gas_limit_multiplier: row.try_get("conservative_gas_limit_multiplier")?,
            volatility_threshold: row.try_get("volatility_threshold")?,
            min_percentile: row.try_get("min_percentile")?,
            max_percentile: row.try_get("max_percentile")?,
            min_priority_fee: parse_wei(row.try_get("min_priority_fee_wei")?)?,
            max_priority_fee: parse_wei(row.try_get("max_priority_fee_wei")?)?,
            max_fee_multiplier: row.try_get("max_fee_multiplier")?,
            fee_history_blocks: row
                .try_get::<Option<i64>, _>("fee_history_blocks")?
                .map(|b| b as u64),
        }))
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Advisory locks live exactly as long as this connection
struct PgLockConnection {
    // Only reached through &mut self; the mutex makes the session shareable by reference
    conn: Mutex<PgConnection>,
}

#[async_trait]
impl LockConnection for PgLockConnection {
    async fn try_lock(&mut self, key: i32) -> CoordinatorResult<bool> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key as i64)
            .fetch_one(self.conn.get_mut())
            .await?;
        Ok(acquired)
    }

    async fn unlock(&mut self, key: i32) -> CoordinatorResult<bool> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key as i64)
            .fetch_one(self.conn.get_mut())
            .await?;
        Ok(released)
    }

    async fn close(self: Box<Self>) -> CoordinatorResult<()> {
        self.conn.into_inner().close().await?;
        Ok(())
    }
}
