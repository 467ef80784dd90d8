//! Per-chain gas policy
//!
//! Resolution order: database override, then the built-in chain table, then
//! the global default. Overrides merge field by field.

use ethers::types::U256;
use serde::{Deserialize, Serialize};

const GWEI: u64 = 1_000_000_000;
const MWEI: u64 = 1_000_000;

/// Tunables that drive a single pricing decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainGasPolicy {
    pub gas_limit_multiplier: f64,
    /// Used for urgency-sensitive triggers
    pub conservative_gas_limit_multiplier: f64,
    /// Coefficient of variation at or above which the network counts as volatile
    pub volatility_threshold: f64,
    pub min_percentile: f64,
    pub max_percentile: f64,
    pub min_priority_fee: U256,
    pub max_priority_fee: U256,
    pub max_fee_multiplier: f64,
    pub fee_history_blocks: u64,
}

impl Default for ChainGasPolicy {
    fn default() -> Self {
        Self {
            gas_limit_multiplier: 2.0,
            conservative_gas_limit_multiplier: 2.5,
            volatility_threshold: 0.3,
            min_percentile: 10.0,
            max_percentile: 60.0,
            min_priority_fee: U256::from(100 * MWEI),
            max_priority_fee: U256::from(100 * GWEI),
            max_fee_multiplier: 2.0,
            fee_history_blocks: 10,
        }
    }
}

/// Nullable columns from the `chain_gas_configs` table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainGasOverride {
    pub gas_limit_multiplier: Option<f64>,
    pub conservative_gas_limit_multiplier: Option<f64>,
    pub volatility_threshold: Option<f64>,
    pub min_percentile: Option<f64>,
    pub max_percentile: Option<f64>,
    pub min_priority_fee: Option<U256>,
    pub max_priority_fee: Option<U256>,
    pub max_fee_multiplier: Option<f64>,
    pub fee_history_blocks: Option<u64>,
}

impl ChainGasOverride {
    /// Layer this override on top of a base policy
    pub fn apply(&self, base: ChainGasPolicy) -> ChainGasPolicy {
        ChainGasPolicy {
            gas_limit_multiplier: self
                .gas_limit_multiplier
                .unwrap_or(base.gas_limit_multiplier),
            conservative_gas_limit_multiplier: self
                .conservative_gas_limit_multiplier
                .unwrap_or(base.conservative_gas_limit_multiplier),
            volatility_threshold: self
                .volatility_threshold
                .unwrap_or(base.volatility_threshold),
            min_percentile: self.min_percentile.unwrap_or(base.min_percentile),
            max_percentile: self.max_percentile.unwrap_or(base.max_percentile),
            min_priority_fee: self.min_priority_fee.unwrap_or(base.min_priority_fee),
            max_priority_fee: self.max_priority_fee.unwrap_or(base.max_priority_fee),
            max_fee_multiplier: self.max_fee_multiplier.unwrap_or(base.max_fee_multiplier),
            fee_history_blocks: self.fee_history_blocks.unwrap_or(base.fee_history_blocks),
        }
    }
}

/// Built-in policy for known chains, if any
pub fn chain_policy(chain_id: u64) -> Option<ChainGasPolicy> {
    let defaults = ChainGasPolicy::default();
    match chain_id {
        // Ethereum mainnet, Sepolia
        1 | 11155111 => Some(ChainGasPolicy {
            gas_limit_multiplier: 1.5,
            conservative_gas_limit_multiplier: 2.0,
            min_priority_fee: U256::from(GWEI),
            max_priority_fee: U256::from(500 * GWEI),
            fee_history_blocks: 20,
            ..defaults
        }),
        // Base, Base Sepolia, Optimism
        8453 | 84532 | 10 => Some(ChainGasPolicy {
            volatility_threshold: 0.4,
            min_priority_fee: U256::from(MWEI),
            max_priority_fee: U256::from(10 * GWEI),
            ..defaults
        }),
        // Arbitrum One
        42161 => Some(ChainGasPolicy {
            conservative_gas_limit_multiplier: 3.0,
            volatility_threshold: 0.4,
            min_priority_fee: U256::zero(),
            max_priority_fee: U256::from(10 * GWEI),
            ..defaults
        }),
        // Polygon PoS enforces a 30 gwei priority floor
        137 => Some(ChainGasPolicy {
            min_priority_fee: U256::from(30 * GWEI),
            max_priority_fee: U256::from(1_000 * GWEI),
            max_fee_multiplier: 2.5,
            ..defaults
        }),
        _ => None,
    }
}

/// Chain table (or default) with the database override layered on top
pub fn resolve_policy(chain_id: u64, db_override: Option<&ChainGasOverride>) -> ChainGasPolicy {
    let base = chain_policy(chain_id).unwrap_or_default();
    match db_override {
        Some(o) => o.apply(base),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_chain_uses_default() {
        assert_eq!(resolve_policy(999_999, None), ChainGasPolicy::default());
    }

    #[test]
    fn test_override_merges_over_chain_table() {
        let o = ChainGasOverride {
            volatility_threshold: Some(0.5),
            ..Default::default()
        };
        let policy = resolve_policy(137, Some(&o));
        assert_eq!(policy.volatility_threshold, 0.5);
        assert_eq!(policy.min_priority_fee, U256::from(30 * GWEI));
        assert_eq!(policy.max_fee_multiplier, 2.5);
    }
}
