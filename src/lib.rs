//! Transaction coordinator - nonce sessions, adaptive gas pricing and
//! stuck-transaction recovery for wallets shared by concurrent workflow runs.
//!
//! Processes coordinate through a shared PostgreSQL database: a session-scoped
//! advisory lock serializes each (wallet, chain) pair, nonces are always derived
//! from the chain, and every submission is recorded so the next session can
//! reconcile it.

pub mod chain;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gas;
pub mod metrics;
pub mod nonce;
pub mod store;
pub mod tx;

#[cfg(test)]
mod test_utils;

pub use chain::{ChainClient, EthersChainClient, FeeEstimate, FeeHistory};
pub use config::Settings;
pub use coordinator::Coordinator;
pub use error::{CoordinatorError, CoordinatorResult};
pub use gas::{GasConfig, GasStrategy, TriggerType};
pub use nonce::{NonceManager, NonceSession, ReconciliationWarning, ValidationResult};
pub use store::{CoordinationStore, MemoryStore, PgStore};
pub use tx::{ContractCall, ExecutionContext, TransactionManager, TransactionOutcome};

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the default filter; `LOG_FORMAT=json` switches to JSON
/// lines. A subscriber installed earlier by the host is left in place.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tx_coordinator=debug,sqlx=warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
