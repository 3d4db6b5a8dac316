use alloy::primitives::{Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use crate::{
    types::{RpcLog, TxReceipt},
    Error,
};
use super::{BlockTag, CallRequest, ChainAdapter, LogFilter};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: u64 = 2;

#[derive(Deserialize)]
struct BlockHeader {
    timestamp: U64,
}

/// 基于 HTTP JSON-RPC 的 EVM 链适配器
pub struct EvmAdapter {
    rpc_url: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_unit: Duration,
}

impl EvmAdapter {
    pub async fn new(rpc_url: &str) -> Result<Self, Error> {
        if rpc_url.trim().is_empty() {
            return Err(Error::Config("Empty RPC URL".to_string()));
        }
        Ok(Self {
            rpc_url: rpc_url.to_string(),
            client: reqwest::Client::new(),
            max_retries: MAX_RETRIES,
            retry_unit: Duration::from_secs(1),
        })
    }

    /// 覆盖重试策略，第 n 次重试等待 unit * RETRY_DELAY^n
    pub fn with_retry_policy(mut self, max_retries: u32, retry_unit: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_unit = retry_unit;
        self
    }

    async fn retry_with_backoff<F, Fut, T>(&self, operation: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                // 只有网络层错误才值得重试，节点返回的 error 对象直接上抛
                Err(e @ Error::Network(_)) => {
                    retries += 1;
                    if retries >= self.max_retries {
                        return Err(e);
                    }
                    warn!("RPC call to {} failed, retry {}/{}: {}", self.rpc_url, retries, self.max_retries, e);
                    sleep(self.retry_unit * RETRY_DELAY.pow(retries) as u32).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T, Error> {
        let params = &params;
        let client = &self.client;
        let url = self.rpc_url.as_str();
        self.retry_with_backoff(|| async move {
            debug!("JSON-RPC {} via {}", method, url);
            let response = client
                .post(url)
                .json(&serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": method,
                    "params": params,
                    "id": 1
                }))
                .send()
                .await?;

            let result: serde_json::Value = response.json().await?;

            if let Some(error) = result.get("error") {
                let message = error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string());
                return Err(Error::Chain(format!("{} failed: {}", method, message)));
            }

            let value = result.get("result").cloned().unwrap_or(serde_json::Value::Null);
            serde_json::from_value(value)
                .map_err(|e| Error::Serialization(format!("{} returned unexpected result: {}", method, e)))
        })
        .await
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn url(&self) -> &str {
        &self.rpc_url
    }

    async fn block_number(&self) -> Result<u64, Error> {
        let n: U64 = self.request("eth_blockNumber", serde_json::json!([])).await?;
        Ok(n.to::<u64>())
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, Error> {
        let header: Option<BlockHeader> = self
            .request(
                "eth_getBlockByNumber",
                serde_json::json!([BlockTag::Number(block).to_param(), false]),
            )
            .await?;
        header
            .map(|h| h.timestamp.to::<u64>())
            .ok_or_else(|| Error::Chain(format!("Block {} not found", block)))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, Error> {
        self.request("eth_getLogs", serde_json::json!([filter.to_param()])).await
    }

    async fn call(&self, request: &CallRequest, block: BlockTag) -> Result<Bytes, Error> {
        self.request("eth_call", serde_json::json!([request, block.to_param()])).await
    }

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, Error> {
        let gas: U64 = self.request("eth_estimateGas", serde_json::json!([request])).await?;
        Ok(gas.to::<u64>())
    }

    async fn gas_price(&self) -> Result<U256, Error> {
        self.request("eth_gasPrice", serde_json::json!([])).await
    }

    async fn transaction_count(&self, address: Address, block: BlockTag) -> Result<u64, Error> {
        let n: U64 = self
            .request("eth_getTransactionCount", serde_json::json!([address, block.to_param()]))
            .await?;
        Ok(n.to::<u64>())
    }

    async fn balance(&self, address: Address) -> Result<U256, Error> {
        self.request("eth_getBalance", serde_json::json!([address, "latest"])).await
    }

    async fn chain_id(&self) -> Result<u64, Error> {
        let id: U64 = self.request("eth_chainId", serde_json::json!([])).await?;
        Ok(id.to::<u64>())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, Error> {
        self.request("eth_sendRawTransaction", serde_json::json!([raw])).await
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>, Error> {
        self.request("eth_getTransactionReceipt", serde_json::json!([hash])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    async fn adapter(server: &mockito::Server) -> EvmAdapter {
        EvmAdapter::new(&server.url())
            .await
            .unwrap()
            .with_retry_policy(1, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_block_number() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(serde_json::json!({"method": "eth_blockNumber"})))
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x1b4"}"#)
            .create_async()
            .await;

        let adapter = adapter(&server).await;
        assert_eq!(adapter.block_number().await.unwrap(), 436);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rpc_error_is_chain_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":3,"message":"execution reverted: Chain is not registered"}}"#)
            .expect(1)
            .create_async()
            .await;

        let adapter = EvmAdapter::new(&server.url())
            .await
            .unwrap()
            .with_retry_policy(3, Duration::ZERO);
        let request = CallRequest {
            to: Address::ZERO,
            ..Default::default()
        };
        match adapter.call(&request, BlockTag::Latest).await {
            Err(Error::Chain(msg)) => assert!(msg.contains("Chain is not registered")),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_logs_and_receipt() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(serde_json::json!({"method": "eth_getLogs"})))
            .with_body(
                r#"{"jsonrpc":"2.0","id":1,"result":[{
                    "address":"0xd2aaa00100000000000000000000000000000000",
                    "topics":["0x0000000000000000000000000000000000000000000000000000000000000001"],
                    "data":"0x",
                    "blockNumber":"0x10",
                    "transactionHash":"0x00000000000000000000000000000000000000000000000000000000000000aa",
                    "logIndex":"0x0"
                }]}"#,
            )
            .create_async()
            .await;
        server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(serde_json::json!({"method": "eth_getTransactionReceipt"})))
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":null}"#)
            .create_async()
            .await;

        let adapter = adapter(&server).await;
        let filter = LogFilter {
            address: Address::ZERO,
            topics: vec![None],
            from_block: 0,
            to_block: 100,
        };
        let logs = adapter.get_logs(&filter).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block(), Some(16));

        assert!(adapter.transaction_receipt(B256::ZERO).await.unwrap().is_none());
    }

    #[test]
    fn test_log_filter_param() {
        let filter = LogFilter {
            address: Address::ZERO,
            topics: vec![Some(B256::ZERO), None],
            from_block: 16,
            to_block: 255,
        };
        let param = filter.to_param();
        assert_eq!(param["fromBlock"], "0x10");
        assert_eq!(param["toBlock"], "0xff");
        assert!(param["topics"][1].is_null());
    }
}
