use alloy::primitives::{Address, Bytes, B256, U256, U64};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 消息转发方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    M2S,
    S2M,
    S2S,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::M2S => "M2S",
            Direction::S2M => "S2M",
            Direction::S2S => "S2S",
        }
    }

    /// 对应的循环步骤名，供时间分片和 PWA 使用
    pub fn work_type(&self) -> WorkType {
        match self {
            Direction::M2S => WorkType::M2S,
            Direction::S2M => WorkType::S2M,
            Direction::S2S => WorkType::S2S,
        }
    }

    /// 目标链是否为主链，决定 PostMessageError 检查与 PoW 预检
    pub fn targets_main_chain(&self) -> bool {
        matches!(self, Direction::S2M)
    }

    /// 传输错误统计使用的分类名
    pub fn error_category(&self) -> String {
        format!("loop-{}", self.as_str())
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调度循环中的一个步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkType {
    Oracle,
    M2S,
    S2M,
    S2S,
}

impl WorkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::Oracle => "oracle",
            WorkType::M2S => "m2s",
            WorkType::S2M => "s2m",
            WorkType::S2S => "s2s",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "oracle" => Some(WorkType::Oracle),
            "m2s" => Some(WorkType::M2S),
            "s2m" => Some(WorkType::S2M),
            "s2s" => Some(WorkType::S2S),
            _ => None,
        }
    }
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 从源链 OutgoingMessage 事件解码得到的待转发消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub sender: Address,
    pub destination_contract: Address,
    pub to: Option<Address>,
    pub amount: Option<U256>,
    pub data: Bytes,
    /// 事件所在区块，用于 S2S 仲裁时缩小查询范围
    pub source_block_hint: Option<u64>,
}

/// 一条有向边上的消息计数器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounters {
    pub outgoing: u64,
    pub incoming: u64,
}

impl MessageCounters {
    /// 需要转发的消息数，即 [incoming, outgoing) 的长度
    pub fn pending(&self) -> u64 {
        self.outgoing.saturating_sub(self.incoming)
    }
}

/// PreviousMessageReference 事件构成的反向链表节点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceLogRecord {
    pub current_message: u64,
    pub previous_outgoing_message_block_id: u64,
    pub block_id: u64,
}

/// 解码后的 OutgoingMessage 事件
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessageEvent {
    pub dst_chain_hash: B256,
    pub msg_counter: u64,
    pub src_contract: Address,
    pub dst_contract: Address,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_hash: Option<B256>,
}

/// 坐标对，十进制或 0x 十六进制字符串
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct XYPoint {
    pub x: String,
    pub y: String,
}

impl Default for XYPoint {
    fn default() -> Self {
        Self {
            x: "0".to_string(),
            y: "0".to_string(),
        }
    }
}

/// 外部门限签名步骤返回的聚合结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlueResult {
    pub signature: XYPoint,
    pub hash_point: XYPoint,
    pub hint: String,
}

/// JSON-RPC 返回的日志记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub transaction_hash: Option<B256>,
    #[serde(default)]
    pub log_index: Option<U64>,
}

impl RpcLog {
    pub fn block(&self) -> Option<u64> {
        self.block_number.map(|n| n.to::<u64>())
    }
}

/// 交易回执
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: B256,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub status: Option<U64>,
    #[serde(default)]
    pub gas_used: Option<U256>,
    #[serde(default)]
    pub cumulative_gas_used: U256,
    #[serde(default)]
    pub effective_gas_price: Option<U256>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

impl TxReceipt {
    pub fn block(&self) -> Option<u64> {
        self.block_number.map(|n| n.to::<u64>())
    }

    pub fn succeeded(&self) -> bool {
        self.status.map(|s| s == U64::from(1)).unwrap_or(true)
    }
}
