//! Adaptive gas pricing
//!
//! Gas limits come from the node's estimate scaled by a per-chain multiplier.
//! Fees are conservative (chain suggestion plus a buffer) for urgent triggers
//! and volatile networks, and percentile-based from fee history otherwise.

mod policy;
mod strategy;
mod volatility;

pub use policy::{chain_policy, resolve_policy, ChainGasOverride, ChainGasPolicy};
pub use strategy::{calculate_gas_limit, escalate_fees, GasConfig, GasStrategy, TriggerType};
pub use volatility::{measure_volatility, select_percentile, VolatilityMetrics};
