//! EIP-1559 fee estimation with a replacement multiplier

use crate::chain::NetworkRpc;
use crate::error::{ExecutorError, ExecutorResult};

use ethers::types::U256;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Baseline tip in wei before the multiplier is applied (1.5 gwei)
pub const BASELINE_PRIORITY_FEE: u64 = 1_500_000_000;

/// Fee fields applied to native transactions
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeConfig {
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    /// Base fee the config was derived from
    pub base_fee: U256,
    pub multiplier: f64,
    #[serde(skip)]
    computed_at: Instant,
}

impl FeeConfig {
    /// Whether this config can still be used for `multiplier`
    pub fn is_fresh(&self, multiplier: f64, ttl: Duration) -> bool {
        self.multiplier == multiplier && self.computed_at.elapsed() < ttl
    }
}

/// Computes priority and max fee per gas from the network base fee
#[derive(Debug, Clone)]
pub struct FeeEstimator {
    baseline_priority_fee: u64,
}

impl FeeEstimator {
    pub fn new() -> Self {
        Self {
            baseline_priority_fee: BASELINE_PRIORITY_FEE,
        }
    }

    /// Derive fees from a known base fee
    ///
    /// A zero base fee (local chains) yields a zero tip so unfunded accounts
    /// can still transact.
    pub fn compute(&self, base_fee: U256, multiplier: f64) -> FeeConfig {
        let max_priority_fee_per_gas = if base_fee.is_zero() {
            U256::zero()
        } else {
            let scaled = (self.baseline_priority_fee as f64 * multiplier).floor();
            U256::from(scaled as u128)
        };

        FeeConfig {
            max_priority_fee_per_gas,
            max_fee_per_gas: base_fee * 2 + max_priority_fee_per_gas,
            base_fee,
            multiplier,
            computed_at: Instant::now(),
        }
    }

    /// Read the latest base fee and derive fees from it
    pub async fn current_fees(&self, rpc: &dyn NetworkRpc, multiplier: f64) -> ExecutorResult<FeeConfig> {
        let base_fee = rpc.base_fee().await?.ok_or_else(|| {
            ExecutorError::Config(format!(
                "Can not fetch base fee from chain {}",
                rpc.chain_id()
            ))
        })?;

        let fees = self.compute(base_fee, multiplier);
        debug!(
            "Fees for chain {}: base {} tip {} max {} (x{})",
            rpc.chain_id(),
            base_fee,
            fees.max_priority_fee_per_gas,
            fees.max_fee_per_gas,
            multiplier
        );
        crate::metrics::record_priority_fee(&fees.max_priority_fee_per_gas);

        Ok(fees)
    }
}

impl Default for FeeEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockNetworkRpc;

    #[test]
    fn test_zero_base_fee_has_no_tip() {
        let fees = FeeEstimator::new().compute(U256::zero(), 1.0);
        assert_eq!(fees.max_priority_fee_per_gas, U256::zero());
        assert_eq!(fees.max_fee_per_gas, U256::zero());
    }

    #[test]
    fn test_max_fee_is_twice_base_plus_tip() {
        let base = U256::from(30_000_000_000u64);
        let fees = FeeEstimator::new().compute(base, 1.0);
        assert_eq!(fees.max_priority_fee_per_gas, U256::from(1_500_000_000u64));
        assert_eq!(fees.max_fee_per_gas, base * 2 + U256::from(1_500_000_000u64));
    }

    #[test]
    fn test_multiplier_scales_tip() {
        let fees = FeeEstimator::new().compute(U256::from(100u64), 1.1);
        assert_eq!(fees.max_priority_fee_per_gas, U256::from(1_650_000_000u64));
        assert_eq!(fees.max_fee_per_gas, U256::from(1_650_000_200u64));
    }

    #[test]
    fn test_freshness_tracks_multiplier() {
        let fees = FeeEstimator::new().compute(U256::from(100u64), 1.0);
        assert!(fees.is_fresh(1.0, Duration::from_secs(60)));
        assert!(!fees.is_fresh(1.1, Duration::from_secs(60)));
        assert!(!fees.is_fresh(1.0, Duration::ZERO));
    }

    #[tokio::test]
    async fn test_missing_base_fee_is_fatal() {
        let mut rpc = MockNetworkRpc::new();
        rpc.expect_chain_id().return_const(1u64);
        rpc.expect_base_fee().returning(|| Ok(None));

        let err = FeeEstimator::new().current_fees(&rpc, 1.0).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Config(_)));
    }
}
