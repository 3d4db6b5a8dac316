use alloy::primitives::{Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use crate::{
    types::{RpcLog, TxReceipt},
    Error,
};

/// 区块标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Number(u64),
    Latest,
    Pending,
}

impl BlockTag {
    pub fn to_param(&self) -> serde_json::Value {
        match self {
            BlockTag::Number(n) => serde_json::Value::String(format!("0x{:x}", n)),
            BlockTag::Latest => serde_json::Value::String("latest".to_string()),
            BlockTag::Pending => serde_json::Value::String("pending".to_string()),
        }
    }
}

/// eth_getLogs 过滤条件，区块范围为闭区间
#[derive(Debug, Clone, PartialEq)]
pub struct LogFilter {
    pub address: Address,
    /// None 表示该位置不限
    pub topics: Vec<Option<B256>>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogFilter {
    pub fn to_param(&self) -> serde_json::Value {
        let topics: Vec<serde_json::Value> = self
            .topics
            .iter()
            .map(|t| match t {
                Some(topic) => serde_json::json!(topic),
                None => serde_json::Value::Null,
            })
            .collect();
        serde_json::json!({
            "address": self.address,
            "fromBlock": format!("0x{:x}", self.from_block),
            "toBlock": format!("0x{:x}", self.to_block),
            "topics": topics,
        })
    }

    pub fn with_range(&self, from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
            ..self.clone()
        }
    }
}

/// eth_call / eth_estimateGas 的交易参数
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<U64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<U256>,
}

/// 链适配器特征，定义了与一个 EVM 节点交互所需的基本功能
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// 节点地址，用于日志
    fn url(&self) -> &str;

    async fn block_number(&self) -> Result<u64, Error>;

    async fn block_timestamp(&self, block: u64) -> Result<u64, Error>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RpcLog>, Error>;

    /// 只读调用，合约 revert 时返回 Error::Chain
    async fn call(&self, request: &CallRequest, block: BlockTag) -> Result<Bytes, Error>;

    async fn estimate_gas(&self, request: &CallRequest) -> Result<u64, Error>;

    async fn gas_price(&self) -> Result<U256, Error>;

    async fn transaction_count(&self, address: Address, block: BlockTag) -> Result<u64, Error>;

    async fn balance(&self, address: Address) -> Result<U256, Error>;

    async fn chain_id(&self) -> Result<u64, Error>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, Error>;

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>, Error>;
}

/// 链适配器工厂，S2S 转发时按节点地址临时创建适配器
#[async_trait]
pub trait ChainAdapterFactory: Send + Sync {
    async fn create_adapter(&self, url: &str) -> Result<Arc<dyn ChainAdapter>, Error>;
}

pub struct DefaultChainAdapterFactory;

#[async_trait]
impl ChainAdapterFactory for DefaultChainAdapterFactory {
    async fn create_adapter(&self, url: &str) -> Result<Arc<dyn ChainAdapter>, Error> {
        let adapter = EvmAdapter::new(url).await?;
        Ok(Arc::new(adapter))
    }
}

pub mod evm;
pub mod message_proxy;
pub mod scan;

pub use evm::EvmAdapter;
pub use message_proxy::MessageProxy;
