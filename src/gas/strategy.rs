//! Gas limit and fee selection

use super::policy::{resolve_policy, ChainGasPolicy};
use super::volatility::{measure_volatility, select_percentile};
use crate::chain::{ChainClient, FeeEstimate};
use crate::config::GasStrategyConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::store::CoordinationStore;

use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Multipliers are converted to basis points before touching wei
const BASIS_POINTS: u64 = 10_000;

/// Spacing of the percentiles requested from fee history
const PERCENTILE_STEP: f64 = 5.0;

/// Fee parameters for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasConfig {
    pub gas_limit: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// What started the workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Schedule,
    Webhook,
    Event,
}

impl TriggerType {
    /// Event-driven triggers react to something time-sensitive
    pub fn is_urgency_sensitive(&self) -> bool {
        matches!(self, TriggerType::Webhook | TriggerType::Event)
    }
}

fn to_basis_points(multiplier: f64) -> U256 {
    U256::from((multiplier * BASIS_POINTS as f64).round().max(0.0) as u64)
}

fn scale(value: U256, multiplier: f64) -> U256 {
    value.saturating_mul(to_basis_points(multiplier)) / U256::from(BASIS_POINTS)
}

fn apply_buffer(value: U256, percent: u64) -> U256 {
    value.saturating_mul(U256::from(100 + percent)) / U256::from(100)
}

fn clamp_priority_fee(fee: U256, policy: &ChainGasPolicy) -> U256 {
    if fee < policy.min_priority_fee {
        policy.min_priority_fee
    } else if fee > policy.max_priority_fee {
        policy.max_priority_fee.max(policy.min_priority_fee)
    } else {
        fee
    }
}

/// `estimated_gas × multiplier` in exact integer arithmetic
pub fn calculate_gas_limit(estimated_gas: U256, multiplier: f64) -> U256 {
    scale(estimated_gas, multiplier)
}

/// Scale both fee components for a replacement transaction
pub fn escalate_fees(gas: &GasConfig, factor: f64) -> GasConfig {
    GasConfig {
        gas_limit: gas.gas_limit,
        max_fee_per_gas: scale(gas.max_fee_per_gas, factor),
        max_priority_fee_per_gas: scale(gas.max_priority_fee_per_gas, factor),
    }
}

fn percentile_grid(min: f64, max: f64) -> Vec<f64> {
    if min >= max {
        return vec![min];
    }
    let mut grid = Vec::new();
    let mut p = min;
    while p < max {
        grid.push(p);
        p += PERCENTILE_STEP;
    }
    grid.push(max);
    grid
}

fn nearest_index(grid: &[f64], target: f64) -> usize {
    grid.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - target)
                .abs()
                .partial_cmp(&(*b - target).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Prices transactions from chain fee data and per-chain policy
pub struct GasStrategy {
    store: Arc<dyn CoordinationStore>,
    config: GasStrategyConfig,
}

impl GasStrategy {
    pub fn new(store: Arc<dyn CoordinationStore>, config: GasStrategyConfig) -> Self {
        Self { store, config }
    }

    /// Read fresh on every call so operators can retune through the database
    pub async fn resolve_policy(&self, chain_id: u64) -> ChainGasPolicy {
        match self.store.get_chain_gas_override(chain_id).await {
            Ok(db_override) => resolve_policy(chain_id, db_override.as_ref()),
            Err(e) => {
                warn!(
                    "Failed to load gas override for chain {}, using built-in policy: {}",
                    chain_id, e
                );
                resolve_policy(chain_id, None)
            }
        }
    }

    /// Gas limit and fees for a transaction with the given node estimate
    pub async fn get_gas_config(
        &self,
        chain: &dyn ChainClient,
        trigger: TriggerType,
        estimated_gas: U256,
        chain_id: u64,
        limit_multiplier_override: Option<f64>,
    ) -> CoordinatorResult<GasConfig> {
        let policy = self.resolve_policy(chain_id).await;

        let multiplier = match limit_multiplier_override {
            Some(m) if m > 0.0 => m,
            _ if trigger.is_urgency_sensitive() => policy.conservative_gas_limit_multiplier,
            _ => policy.gas_limit_multiplier,
        };
        let gas_limit = calculate_gas_limit(estimated_gas, multiplier);

        let (max_fee_per_gas, max_priority_fee_per_gas) = if trigger.is_urgency_sensitive() {
            crate::metrics::record_fee_path(chain_id, "conservative");
            self.conservative_fees(chain, &policy).await?
        } else {
            match self.percentile_fees(chain, &policy, chain_id).await {
                Ok(Some(fees)) => {
                    crate::metrics::record_fee_path(chain_id, "percentile");
                    fees
                }
                Ok(None) => {
                    crate::metrics::record_fee_path(chain_id, "conservative");
                    self.conservative_fees(chain, &policy).await?
                }
                Err(e) => {
                    warn!(
                        "Fee history unusable on chain {}, using conservative fees: {}",
                        chain_id, e
                    );
                    crate::metrics::record_fee_path(chain_id, "fallback");
                    self.conservative_fees(chain, &policy).await?
                }
            }
        };

        let gas = GasConfig {
            gas_limit,
            max_fee_per_gas,
            max_priority_fee_per_gas,
        };
        debug!("Gas config for chain {} ({:?}): {:?}", chain_id, trigger, gas);
        Ok(gas)
    }

    /// Chain suggestion plus a fixed buffer
    async fn conservative_fees(
        &self,
        chain: &dyn ChainClient,
        policy: &ChainGasPolicy,
    ) -> CoordinatorResult<(U256, U256)> {
        let buffer = self.config.conservative_buffer_percent;

        match chain.get_fee_estimate().await? {
            FeeEstimate::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let priority = clamp_priority_fee(apply_buffer(max_priority_fee_per_gas, buffer), policy);
                let max_fee = apply_buffer(max_fee_per_gas, buffer).max(priority);
                Ok((max_fee, priority))
            }
            FeeEstimate::Legacy { gas_price } => {
                let max_fee = apply_buffer(gas_price, buffer);
                let priority = max_fee.saturating_mul(U256::from(self.config.legacy_priority_fee_percent))
                    / U256::from(100);
                Ok((max_fee, priority))
            }
        }
    }

    /// Percentile-based fees, or `None` when the network is too volatile
    async fn percentile_fees(
        &self,
        chain: &dyn ChainClient,
        policy: &ChainGasPolicy,
        chain_id: u64,
    ) -> CoordinatorResult<Option<(U256, U256)>> {
        let unavailable = |message: &str| CoordinatorError::FeeHistoryUnavailable {
            chain_id,
            message: message.to_string(),
        };

        let grid = percentile_grid(policy.min_percentile, policy.max_percentile);
        let history = chain
            .get_fee_history(policy.fee_history_blocks, &grid)
            .await?;

        let latest_base_fee = *history
            .base_fee_per_gas
            .last()
            .ok_or_else(|| unavailable("no base fees returned"))?;

        let sample: Vec<U256> = history
            .base_fee_per_gas
            .iter()
            .rev()
            .take(policy.fee_history_blocks.max(1) as usize)
            .copied()
            .collect();
        let metrics = measure_volatility(&sample, policy.volatility_threshold);
        crate::metrics::record_volatility(chain_id, metrics.coefficient_of_variation);

        if metrics.is_volatile {
            info!(
                "Chain {} is volatile (cv {:.3} >= {}), using conservative fees",
                chain_id, metrics.coefficient_of_variation, policy.volatility_threshold
            );
            return Ok(None);
        }

        let target = select_percentile(
            metrics.coefficient_of_variation,
            policy.volatility_threshold,
            policy.min_percentile,
            policy.max_percentile,
        );
        let index = nearest_index(&grid, target);

        let mut rewards: Vec<U256> = history
            .reward
            .iter()
            .filter_map(|block| block.get(index).copied())
            .collect();
        if rewards.is_empty() {
            return Err(unavailable("no priority fee rewards returned"));
        }
        rewards.sort();
        let median = rewards[rewards.len() / 2];

        let priority = clamp_priority_fee(median, policy);
        let max_fee = scale(latest_base_fee, policy.max_fee_multiplier).saturating_add(priority);

        debug!(
            "Chain {} cv {:.3} -> p{} priority fee {}",
            chain_id, metrics.coefficient_of_variation, grid[index], priority
        );
        Ok(Some((max_fee, priority)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::FeeHistory;
    use crate::gas::ChainGasOverride;
    use crate::store::MemoryStore;
    use crate::test_utils::{gwei, MockChain};

    const DEV_CHAIN: u64 = 31337;

    fn strategy(store: MemoryStore) -> GasStrategy {
        GasStrategy::new(Arc::new(store), GasStrategyConfig::default())
    }

    /// Reward rows where the i-th percentile pays (i + 1) gwei
    fn history(base_fees: Vec<U256>, percentiles: usize) -> FeeHistory {
        let reward = base_fees
            .iter()
            .map(|_| (0..percentiles).map(|i| gwei(i as u64 + 1)).collect())
            .collect();
        FeeHistory {
            base_fee_per_gas: base_fees,
            reward,
        }
    }

    fn eip1559_estimate(chain: &mut MockChain) {
        chain.expect_get_fee_estimate().returning(|| {
            Ok(FeeEstimate::Eip1559 {
                max_fee_per_gas: gwei(50),
                max_priority_fee_per_gas: gwei(2),
            })
        });
    }

    #[test]
    fn test_gas_limit_is_exact() {
        let estimate = U256::from(100_000);
        assert_eq!(calculate_gas_limit(estimate, 2.0), U256::from(200_000));
        assert_eq!(calculate_gas_limit(estimate, 1.5), U256::from(150_000));
        assert_eq!(calculate_gas_limit(estimate, 1.15), U256::from(115_000));
    }

    #[test]
    fn test_escalation_scales_fees_only() {
        let gas = GasConfig {
            gas_limit: U256::from(21_000),
            max_fee_per_gas: gwei(10),
            max_priority_fee_per_gas: gwei(1),
        };
        let bumped = escalate_fees(&gas, 1.2);
        assert_eq!(bumped.gas_limit, U256::from(21_000));
        assert_eq!(bumped.max_fee_per_gas, gwei(12));
        assert_eq!(bumped.max_priority_fee_per_gas, U256::from(1_200_000_000u64));
    }

    #[tokio::test]
    async fn test_urgent_trigger_skips_fee_history() {
        let mut chain = MockChain::new();
        // No fee history expectation: calling it would panic
        eip1559_estimate(&mut chain);

        let gas = strategy(MemoryStore::new())
            .get_gas_config(&chain, TriggerType::Webhook, U256::from(100_000), DEV_CHAIN, None)
            .await
            .unwrap();

        assert_eq!(gas.gas_limit, U256::from(250_000));
        assert_eq!(gas.max_fee_per_gas, gwei(60));
        assert_eq!(gas.max_priority_fee_per_gas, U256::from(2_400_000_000u64));
    }

    #[tokio::test]
    async fn test_stable_network_uses_low_percentile() {
        let mut chain = MockChain::new();
        chain
            .expect_get_fee_history()
            .returning(|_, percentiles| Ok(history(vec![gwei(20); 11], percentiles.len())));

        let gas = strategy(MemoryStore::new())
            .get_gas_config(&chain, TriggerType::Schedule, U256::from(100_000), DEV_CHAIN, None)
            .await
            .unwrap();

        assert_eq!(gas.gas_limit, U256::from(200_000));
        assert_eq!(gas.max_priority_fee_per_gas, gwei(1));
        assert_eq!(gas.max_fee_per_gas, gwei(41));
    }

    #[tokio::test]
    async fn test_volatile_network_falls_back_to_conservative() {
        let mut chain = MockChain::new();
        chain.expect_get_fee_history().returning(|_, percentiles| {
            let fees = (0..10)
                .map(|i| if i % 2 == 0 { gwei(10) } else { gwei(30) })
                .collect();
            Ok(history(fees, percentiles.len()))
        });
        eip1559_estimate(&mut chain);

        let gas = strategy(MemoryStore::new())
            .get_gas_config(&chain, TriggerType::Manual, U256::from(100_000), DEV_CHAIN, None)
            .await
            .unwrap();

        assert_eq!(gas.gas_limit, U256::from(200_000));
        assert_eq!(gas.max_fee_per_gas, gwei(60));
    }

    #[tokio::test]
    async fn test_fee_history_failure_degrades() {
        let mut chain = MockChain::new();
        chain.expect_get_fee_history().returning(|_, _| {
            Err(CoordinatorError::FeeHistoryUnavailable {
                chain_id: DEV_CHAIN,
                message: "method not found".to_string(),
            })
        });
        eip1559_estimate(&mut chain);

        let gas = strategy(MemoryStore::new())
            .get_gas_config(&chain, TriggerType::Manual, U256::from(21_000), DEV_CHAIN, None)
            .await
            .unwrap();
        assert_eq!(gas.max_fee_per_gas, gwei(60));
    }

    #[tokio::test]
    async fn test_legacy_chain_derives_fee_pair() {
        let mut chain = MockChain::new();
        chain
            .expect_get_fee_estimate()
            .returning(|| Ok(FeeEstimate::Legacy { gas_price: gwei(10) }));

        let gas = strategy(MemoryStore::new())
            .get_gas_config(&chain, TriggerType::Event, U256::from(21_000), DEV_CHAIN, None)
            .await
            .unwrap();

        assert_eq!(gas.max_fee_per_gas, gwei(12));
        assert_eq!(gas.max_priority_fee_per_gas, U256::from(1_200_000_000u64));
    }

    #[tokio::test]
    async fn test_limit_override_wins() {
        let mut chain = MockChain::new();
        eip1559_estimate(&mut chain);

        let gas = strategy(MemoryStore::new())
            .get_gas_config(&chain, TriggerType::Event, U256::from(100_000), DEV_CHAIN, Some(1.5))
            .await
            .unwrap();
        assert_eq!(gas.gas_limit, U256::from(150_000));
    }

    #[tokio::test]
    async fn test_priority_fee_clamped_to_chain_floor() {
        let mut chain = MockChain::new();
        chain
            .expect_get_fee_history()
            .returning(|_, percentiles| Ok(history(vec![gwei(100); 11], percentiles.len())));

        // Polygon floors priority fees at 30 gwei
        let gas = strategy(MemoryStore::new())
            .get_gas_config(&chain, TriggerType::Manual, U256::from(21_000), 137, None)
            .await
            .unwrap();

        assert_eq!(gas.max_priority_fee_per_gas, gwei(30));
        assert_eq!(gas.max_fee_per_gas, gwei(280));
    }

    #[tokio::test]
    async fn test_database_override_is_read_every_call() {
        let store = MemoryStore::new();
        let strategy = strategy(store.clone());
        let mut chain = MockChain::new();
        eip1559_estimate(&mut chain);

        store.set_gas_override(
            DEV_CHAIN,
            ChainGasOverride {
                conservative_gas_limit_multiplier: Some(3.0),
                ..Default::default()
            },
        );
        let first = strategy
            .get_gas_config(&chain, TriggerType::Event, U256::from(100_000), DEV_CHAIN, None)
            .await
            .unwrap();
        assert_eq!(first.gas_limit, U256::from(300_000));

        store.set_gas_override(
            DEV_CHAIN,
            ChainGasOverride {
                conservative_gas_limit_multiplier: Some(4.0),
                ..Default::default()
            },
        );
        let second = strategy
            .get_gas_config(&chain, TriggerType::Event, U256::from(100_000), DEV_CHAIN, None)
            .await
            .unwrap();
        assert_eq!(second.gas_limit, U256::from(400_000));
    }
}
