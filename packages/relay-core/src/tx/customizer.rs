use alloy::primitives::{U256, U64};
use tracing::{debug, warn};
use crate::{
    chain_adapter::{CallRequest, ChainAdapter},
    config::GasConfig,
    Error,
};

/// 1 gwei，gas 价格下限
pub const MIN_GAS_PRICE: u64 = 1_000_000_000;

/// 倍率按万分之一精度计算
const MULTIPLIER_SCALE: u64 = 10_000;

/// 每个链角色一份的 gas 价格与 gas 上限调整器，启动后只读
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransactionCustomizer {
    gas_price_multiplier: Option<f64>,
    gas_multiplier: f64,
}

impl Default for TransactionCustomizer {
    fn default() -> Self {
        Self::from(GasConfig::side_chain_default())
    }
}

impl From<GasConfig> for TransactionCustomizer {
    fn from(gas: GasConfig) -> Self {
        Self {
            gas_price_multiplier: gas.gas_price_multiplier,
            gas_multiplier: gas.gas_multiplier,
        }
    }
}

fn scale(value: U256, multiplier: f64) -> U256 {
    let factor = (multiplier * MULTIPLIER_SCALE as f64).round().max(0.0) as u64;
    value.saturating_mul(U256::from(factor)) / U256::from(MULTIPLIER_SCALE)
}

impl TransactionCustomizer {
    pub fn new(gas_price_multiplier: Option<f64>, gas_multiplier: f64) -> Self {
        Self {
            gas_price_multiplier,
            gas_multiplier,
        }
    }

    /// 当前 gas 价格，不低于 1 gwei；配置了倍率时乘上倍率并以 max_gas_price 封顶
    pub async fn compute_gas_price(
        &self,
        adapter: &dyn ChainAdapter,
        max_gas_price: U256,
    ) -> Result<U256, Error> {
        let gas_price = adapter.gas_price().await?;
        if gas_price <= U256::from(MIN_GAS_PRICE) {
            return Ok(U256::from(MIN_GAS_PRICE));
        }
        match self.gas_price_multiplier {
            Some(multiplier) if multiplier >= 0.0 => {
                let multiplied = scale(gas_price, multiplier);
                Ok(multiplied.min(max_gas_price).max(U256::from(MIN_GAS_PRICE)))
            }
            _ => Ok(gas_price),
        }
    }

    /// 估算 gas，估算失败或为零时使用推荐值，最后乘上安全系数
    pub async fn compute_gas(
        &self,
        adapter: &dyn ChainAdapter,
        request: &CallRequest,
        recommended: u64,
    ) -> u64 {
        let mut request = request.clone();
        if recommended > 0 {
            request.gas = Some(U64::from(recommended));
        }
        let estimated = match adapter.estimate_gas(&request).await {
            Ok(gas) => {
                debug!("Estimate-gas success: {}", gas);
                gas
            }
            Err(e) => {
                warn!(
                    "Estimate-gas error: {}, default recommended gas value will be used instead of estimated",
                    e
                );
                0
            }
        };
        let gas = if estimated == 0 {
            warn!("Will use recommended gas {} instead of estimated", recommended);
            recommended
        } else {
            estimated
        };
        if self.gas_multiplier > 0.0 {
            (gas as f64 * self.gas_multiplier).round() as u64
        } else {
            gas
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::MockChainAdapter;
    use alloy::primitives::Address;

    fn request() -> CallRequest {
        CallRequest {
            to: Address::repeat_byte(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_gas_price_floor() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_gas_price().returning(|| Ok(U256::from(100u64)));

        let customizer = TransactionCustomizer::from(GasConfig::main_chain_default());
        let price = customizer
            .compute_gas_price(&adapter, U256::from(200_000_000_000u64))
            .await
            .unwrap();
        assert_eq!(price, U256::from(MIN_GAS_PRICE));
    }

    #[tokio::test]
    async fn test_gas_price_multiplier_and_cap() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_gas_price().returning(|| Ok(U256::from(4_000_000_000u64)));

        let customizer = TransactionCustomizer::new(Some(1.25), 1.25);
        let price = customizer
            .compute_gas_price(&adapter, U256::from(200_000_000_000u64))
            .await
            .unwrap();
        assert_eq!(price, U256::from(5_000_000_000u64));

        let capped = customizer
            .compute_gas_price(&adapter, U256::from(4_500_000_000u64))
            .await
            .unwrap();
        assert_eq!(capped, U256::from(4_500_000_000u64));

        // 未配置倍率时原样使用节点价格
        let plain = TransactionCustomizer::new(None, 1.25);
        let price = plain
            .compute_gas_price(&adapter, U256::from(1_000_000_000u64))
            .await
            .unwrap();
        assert_eq!(price, U256::from(4_000_000_000u64));
    }

    #[tokio::test]
    async fn test_compute_gas_uses_recommended_on_failure() {
        let mut adapter = MockChainAdapter::new();
        adapter
            .expect_estimate_gas()
            .returning(|_| Err(Error::Chain("execution reverted".to_string())));

        let customizer = TransactionCustomizer::new(None, 1.25);
        let gas = customizer.compute_gas(&adapter, &request(), 1_000_000).await;
        assert_eq!(gas, 1_250_000);
    }

    #[tokio::test]
    async fn test_compute_gas_applies_multiplier() {
        let mut adapter = MockChainAdapter::new();
        adapter
            .expect_estimate_gas()
            .withf(|req| req.gas == Some(U64::from(10_000_000)))
            .returning(|_| Ok(200_000));

        let customizer = TransactionCustomizer::new(None, 1.5);
        let gas = customizer.compute_gas(&adapter, &request(), 10_000_000).await;
        assert_eq!(gas, 300_000);
    }
}
