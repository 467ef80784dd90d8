//! Network volatility from recent base fees
//!
//! Mean and standard deviation stay in integer wei; only the final
//! coefficient of variation becomes a float, since it just picks a policy.

use ethers::types::U256;

/// Fixed-point scale for the coefficient of variation
const CV_SCALE: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct VolatilityMetrics {
    pub base_fees: Vec<U256>,
    pub mean: U256,
    pub std_dev: U256,
    pub coefficient_of_variation: f64,
    pub is_volatile: bool,
}

/// Population statistics over `base_fees`, volatile when cv >= threshold
pub fn measure_volatility(base_fees: &[U256], threshold: f64) -> VolatilityMetrics {
    if base_fees.is_empty() {
        return VolatilityMetrics {
            base_fees: Vec::new(),
            mean: U256::zero(),
            std_dev: U256::zero(),
            coefficient_of_variation: 0.0,
            is_volatile: false,
        };
    }

    let n = U256::from(base_fees.len());
    let sum = base_fees
        .iter()
        .fold(U256::zero(), |acc, fee| acc.saturating_add(*fee));
    let mean = sum / n;

    let sum_sq = base_fees.iter().fold(U256::zero(), |acc, fee| {
        let diff = if *fee > mean { *fee - mean } else { mean - *fee };
        acc.saturating_add(diff.saturating_mul(diff))
    });
    let std_dev = (sum_sq / n).integer_sqrt();

    let coefficient_of_variation = if mean.is_zero() {
        0.0
    } else {
        let scaled = std_dev.saturating_mul(U256::from(CV_SCALE)) / mean;
        scaled.low_u64() as f64 / CV_SCALE as f64
    };

    VolatilityMetrics {
        base_fees: base_fees.to_vec(),
        mean,
        std_dev,
        coefficient_of_variation,
        is_volatile: coefficient_of_variation >= threshold,
    }
}

/// Map calm networks to cheap percentiles, rising linearly toward `max` as cv nears the threshold
pub fn select_percentile(cv: f64, threshold: f64, min: f64, max: f64) -> f64 {
    if threshold <= 0.0 {
        return max;
    }
    let ratio = (cv / threshold).clamp(0.0, 1.0);
    min + (max - min) * ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(v: u64) -> U256 {
        U256::from(v) * U256::exp10(9)
    }

    #[test]
    fn test_flat_series_is_stable() {
        let fees = vec![gwei(30); 10];
        let m = measure_volatility(&fees, 0.3);
        assert_eq!(m.mean, gwei(30));
        assert_eq!(m.std_dev, U256::zero());
        assert_eq!(m.coefficient_of_variation, 0.0);
        assert!(!m.is_volatile);
    }

    #[test]
    fn test_spiky_series_is_volatile() {
        let fees = vec![gwei(10), gwei(20)];
        let m = measure_volatility(&fees, 0.3);
        assert_eq!(m.mean, gwei(15));
        assert_eq!(m.std_dev, gwei(5));
        assert!((m.coefficient_of_variation - 0.333333).abs() < 1e-6);
        assert!(m.is_volatile);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let fees = vec![U256::from(1), U256::from(3)];
        let m = measure_volatility(&fees, 0.5);
        assert_eq!(m.coefficient_of_variation, 0.5);
        assert!(m.is_volatile);
    }

    #[test]
    fn test_small_wobble_is_stable() {
        let fees = vec![gwei(100), gwei(102), gwei(98), gwei(100)];
        let m = measure_volatility(&fees, 0.3);
        assert!(m.coefficient_of_variation < 0.02);
        assert!(!m.is_volatile);
    }

    #[test]
    fn test_empty_series() {
        let m = measure_volatility(&[], 0.3);
        assert!(!m.is_volatile);
        assert!(m.mean.is_zero());
    }

    #[test]
    fn test_percentile_rises_with_cv() {
        assert_eq!(select_percentile(0.0, 0.3, 10.0, 60.0), 10.0);
        assert_eq!(select_percentile(0.15, 0.3, 10.0, 60.0), 35.0);
        assert_eq!(select_percentile(0.3, 0.3, 10.0, 60.0), 60.0);
        assert_eq!(select_percentile(0.9, 0.3, 10.0, 60.0), 60.0);
    }
}
