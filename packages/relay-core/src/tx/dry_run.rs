use tracing::{error, trace, warn};
use crate::{
    chain_adapter::{BlockTag, CallRequest, ChainAdapter},
    config::DryRunConfig,
    Error,
};

/// 以 eth_call 模拟执行，Ok(None) 表示通过或被忽略
pub async fn dry_run_call(
    adapter: &dyn ChainAdapter,
    config: &DryRunConfig,
    request: &CallRequest,
    action: &str,
) -> Result<Option<String>, Error> {
    if !config.enabled {
        return Ok(None);
    }
    trace!("Dry-run of action {} via {}", action, adapter.url());
    match adapter.call(request, BlockTag::Latest).await {
        Ok(result) => {
            trace!("Dry-run of {} success: {}", action, result);
            Ok(None)
        }
        Err(e @ Error::Chain(_)) | Err(e @ Error::Network(_)) => {
            error!("Dry-run of {} error: {}", action, e);
            if config.ignore {
                warn!("Dry-run failure of {} is ignored", action);
                return Ok(None);
            }
            Ok(Some(e.to_string()))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_adapter::MockChainAdapter;
    use alloy::primitives::{Address, Bytes};

    fn request() -> CallRequest {
        CallRequest {
            to: Address::repeat_byte(7),
            ..Default::default()
        }
    }

    fn reverting() -> MockChainAdapter {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_url().return_const("http://node".to_string());
        adapter
            .expect_call()
            .returning(|_, _| Err(Error::Chain("execution reverted: Incorrect counter".to_string())));
        adapter
    }

    #[tokio::test]
    async fn test_disabled_skips_call() {
        // 没有设置任何期望，一旦调用就会 panic
        let adapter = MockChainAdapter::new();
        let config = DryRunConfig {
            enabled: false,
            ignore: false,
        };
        assert_eq!(dry_run_call(&adapter, &config, &request(), "test").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_reported() {
        let config = DryRunConfig::default();
        let result = dry_run_call(&reverting(), &config, &request(), "test").await.unwrap();
        assert!(result.unwrap().contains("Incorrect counter"));
    }

    #[tokio::test]
    async fn test_failure_ignored() {
        let config = DryRunConfig {
            enabled: true,
            ignore: true,
        };
        let result = dry_run_call(&reverting(), &config, &request(), "test").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_success() {
        let mut adapter = MockChainAdapter::new();
        adapter.expect_url().return_const("http://node".to_string());
        adapter.expect_call().returning(|_, _| Ok(Bytes::new()));
        let result = dry_run_call(&adapter, &DryRunConfig::default(), &request(), "test")
            .await
            .unwrap();
        assert_eq!(result, None);
    }
}
