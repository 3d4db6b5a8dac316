use alloy::primitives::Address;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::peers::{NodeInfo, SChainInfo};
use crate::types::Direction;
use crate::Error;

/// 侧链合约中主链的默认名称
pub const MAIN_CHAIN_NAME: &str = "Mainnet";

/// 签名身份，按凭据类型区分三种后端
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountConfig {
    /// 推入共享队列，由外部交易管理器签名发送
    QueuedManager {
        address: Address,
        redis_url: String,
        #[serde(default = "default_priority")]
        priority: u64,
        #[serde(default = "default_attempts")]
        attempts: u32,
    },
    /// 通过外部进程调用远程安全飞地钱包签名
    RemoteEnclave {
        address: Address,
        wallet_url: String,
        key_name: String,
        cert_path: PathBuf,
        key_path: PathBuf,
        signer_binary: PathBuf,
    },
    /// 本地私钥直接签名
    Direct { private_key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountKind {
    QueuedManager,
    RemoteEnclave,
    DirectKey,
    Invalid,
}

impl AccountConfig {
    /// 根据必填字段是否齐全判断账户类型
    pub fn classify(&self) -> AccountKind {
        match self {
            AccountConfig::QueuedManager { redis_url, .. } if !redis_url.trim().is_empty() => {
                AccountKind::QueuedManager
            }
            AccountConfig::RemoteEnclave {
                wallet_url,
                key_name,
                signer_binary,
                ..
            } if !wallet_url.trim().is_empty()
                && !key_name.trim().is_empty()
                && !signer_binary.as_os_str().is_empty() =>
            {
                AccountKind::RemoteEnclave
            }
            AccountConfig::Direct { private_key } if !private_key.trim().is_empty() => {
                AccountKind::DirectKey
            }
            _ => AccountKind::Invalid,
        }
    }
}

fn default_priority() -> u64 {
    5
}

fn default_attempts() -> u32 {
    1
}

/// gas 价格和 gas 上限的安全系数
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GasConfig {
    #[serde(default)]
    pub gas_price_multiplier: Option<f64>,
    #[serde(default = "default_gas_multiplier")]
    pub gas_multiplier: f64,
}

fn default_gas_multiplier() -> f64 {
    1.25
}

impl GasConfig {
    pub fn main_chain_default() -> Self {
        Self {
            gas_price_multiplier: Some(1.25),
            gas_multiplier: 1.25,
        }
    }

    pub fn side_chain_default() -> Self {
        Self {
            gas_price_multiplier: None,
            gas_multiplier: 1.25,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub message_proxy: Address,
    pub account: AccountConfig,
    #[serde(default)]
    pub gas: Option<GasConfig>,
}

/// 单个方向的批量与安全参数
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct TransferLimits {
    pub transactions_per_block: usize,
    /// 0 表示不限制
    pub transfer_steps: u64,
    /// 0 表示不限制
    pub max_transactions: u64,
    pub block_await_depth: i64,
    pub block_age: i64,
    pub per_message_gas: u64,
    pub s2m_gas_overhead: u64,
    pub recommended_gas: u64,
    pub max_gas_price: u64,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            transactions_per_block: 5,
            transfer_steps: 0,
            max_transactions: 0,
            block_await_depth: 0,
            block_age: 0,
            per_message_gas: 1_000_000,
            s2m_gas_overhead: 200_000,
            recommended_gas: 10_000_000,
            max_gas_price: 200_000_000_000,
        }
    }
}

/// 归一化后的限制，引擎只使用这个版本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub transactions_per_block: usize,
    pub transfer_steps: u64,
    pub max_transactions: u64,
    pub block_await_depth: u64,
    pub block_age: u64,
    pub per_message_gas: u64,
    pub s2m_gas_overhead: u64,
    pub recommended_gas: u64,
    pub max_gas_price: u64,
}

impl TransferLimits {
    pub fn normalized(&self) -> EffectiveLimits {
        let unlimited = |v: u64| if v == 0 { u64::MAX } else { v };
        EffectiveLimits {
            transactions_per_block: if self.transactions_per_block == 0 {
                5
            } else {
                self.transactions_per_block
            },
            transfer_steps: unlimited(self.transfer_steps),
            max_transactions: unlimited(self.max_transactions),
            block_await_depth: self.block_await_depth.max(0) as u64,
            block_age: self.block_age.max(0) as u64,
            per_message_gas: self.per_message_gas,
            s2m_gas_overhead: self.s2m_gas_overhead,
            recommended_gas: self.recommended_gas,
            max_gas_price: self.max_gas_price,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct TransferConfig {
    pub m2s: TransferLimits,
    pub s2m: TransferLimits,
    pub s2s: TransferLimits,
    /// 成功时也把运行明细刷到全局日志
    pub expose_details: bool,
}

impl TransferConfig {
    pub fn limits(&self, direction: Direction) -> &TransferLimits {
        match direction {
            Direction::M2S => &self.m2s,
            Direction::S2M => &self.s2m,
            Direction::S2S => &self.s2s,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct TimeFramingConfig {
    pub node_number: u64,
    pub nodes_count: u64,
    /// 0 表示关闭时间分片
    pub frame_seconds: u64,
    pub next_frame_gap: u64,
}

impl Default for TimeFramingConfig {
    fn default() -> Self {
        Self {
            node_number: 0,
            nodes_count: 1,
            frame_seconds: 0,
            next_frame_gap: 10,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct PwaConfig {
    pub enabled: bool,
    pub timeout_seconds: u64,
    pub print: bool,
    /// 本侧链的节点，下标即节点编号
    pub nodes: Vec<NodeInfo>,
}

impl Default for PwaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: 3600,
            print: false,
            nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct LoopConfig {
    pub period_seconds: u64,
    pub delay_first_run: bool,
    pub enable_oracle: bool,
    pub enable_m2s: bool,
    pub enable_s2m: bool,
    pub enable_s2s: bool,
    pub parallel: bool,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            period_seconds: 10,
            delay_first_run: false,
            enable_oracle: false,
            enable_m2s: true,
            enable_s2m: true,
            enable_s2s: true,
            parallel: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct DryRunConfig {
    pub enabled: bool,
    /// 模拟失败只记警告，不中断
    pub ignore: bool,
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ignore: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct PowConfig {
    pub binary: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ScanConfig {
    pub progressive: bool,
    pub blocks_per_iteration: u64,
    pub max_iterations: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            progressive: true,
            blocks_per_iteration: 1000,
            max_iterations: 5000,
        }
    }
}

/// S2S 多节点复核的通过比例，默认 2/3
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct QuorumConfig {
    pub numerator: u64,
    pub denominator: u64,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            numerator: 2,
            denominator: 3,
        }
    }
}

impl QuorumConfig {
    /// 返回 (必须通过数, 允许失败数)
    pub fn thresholds(&self, node_count: usize) -> (usize, usize) {
        let n = node_count as u64;
        let must_pass = (n * self.numerator).div_ceil(self.denominator.max(1)) as usize;
        let must_pass = must_pass.min(node_count);
        (must_pass, node_count - must_pass)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct S2SConfig {
    pub enabled: bool,
    pub peers: Vec<SChainInfo>,
    pub quorum: QuorumConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct SigningConfig {
    /// 关闭时使用零签名桩
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub main_chain: ChainConfig,
    pub side_chain: ChainConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub time_framing: TimeFramingConfig,
    #[serde(default)]
    pub pwa: PwaConfig,
    #[serde(default, rename = "loop")]
    pub run_loop: LoopConfig,
    #[serde(default)]
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub pow: PowConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub s2s: S2SConfig,
    #[serde(default)]
    pub signing: SigningConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        if is_toml {
            Self::from_toml(&config_str)
        } else {
            Self::from_json(&config_str)
        }
    }

    pub fn from_json(s: &str) -> Result<Self, Error> {
        let config: Config = serde_json::from_str(s)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(s)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        // 链配置
        for chain in [&self.main_chain, &self.side_chain] {
            if chain.name.trim().is_empty() {
                return Err(Error::Config("Chain name must not be empty".to_string()));
            }
            if chain.rpc_url.trim().is_empty() {
                return Err(Error::Config(format!("RPC URL is missing for chain {}", chain.name)));
            }
            if chain.account.classify() == AccountKind::Invalid {
                return Err(Error::Config(format!(
                    "Bad credentials information specified for chain {}, no explicit SGX, no explicit private key, no explicit queue store URL",
                    chain.name
                )));
            }
            if let Some(gas) = &chain.gas {
                let price_ok = gas
                    .gas_price_multiplier
                    .map(|m| m.is_finite() && m > 0.0)
                    .unwrap_or(true);
                if !price_ok || !gas.gas_multiplier.is_finite() || gas.gas_multiplier <= 0.0 {
                    return Err(Error::Config(format!("Invalid gas multipliers for chain {}", chain.name)));
                }
            }
        }
        if self.main_chain.name == self.side_chain.name {
            return Err(Error::Config("Main and side chain names must differ".to_string()));
        }

        // 时间分片
        let tf = &self.time_framing;
        if tf.nodes_count > 1 && tf.node_number >= tf.nodes_count {
            return Err(Error::Config(format!(
                "Node number {} is out of range for {} nodes",
                tf.node_number, tf.nodes_count
            )));
        }
        if tf.frame_seconds > 0 && tf.next_frame_gap >= tf.frame_seconds {
            return Err(Error::Config(format!(
                "Next frame gap {} must be less than frame size {}",
                tf.next_frame_gap, tf.frame_seconds
            )));
        }

        // 循环
        if self.run_loop.period_seconds == 0 {
            return Err(Error::Config("Loop period must be greater than 0".to_string()));
        }

        let quorum = &self.s2s.quorum;
        if quorum.denominator == 0 || quorum.numerator == 0 || quorum.numerator > quorum.denominator {
            return Err(Error::Config(format!(
                "Invalid S2S quorum {}/{}",
                quorum.numerator, quorum.denominator
            )));
        }

        for peer in &self.s2s.peers {
            if peer.name == self.side_chain.name {
                return Err(Error::Config(format!("S2S peer {} is this side chain itself", peer.name)));
            }
        }

        Ok(())
    }

    pub fn main_gas(&self) -> GasConfig {
        self.main_chain.gas.unwrap_or_else(GasConfig::main_chain_default)
    }

    pub fn side_gas(&self) -> GasConfig {
        self.side_chain.gas.unwrap_or_else(GasConfig::side_chain_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "main_chain": {
            "name": "Mainnet",
            "chain_id": 1,
            "rpc_url": "http://127.0.0.1:8545",
            "message_proxy": "0x1000000000000000000000000000000000000001",
            "account": { "kind": "direct", "private_key": "0x23abdbd3c61b5330af61ebe8bef582f4e5cc08e554053a718bdce7813b9dc1fc" }
        },
        "side_chain": {
            "name": "Bob",
            "chain_id": 1234,
            "rpc_url": "http://127.0.0.1:15000",
            "message_proxy": "0xd2AAa00100000000000000000000000000000000",
            "account": {
                "kind": "queued_manager",
                "address": "0x7aa5E36AA15E93D10F4F26357C30F052DacDde5F",
                "redis_url": "redis://127.0.0.1:6379"
            }
        },
        "transfer": { "s2m": { "transactions_per_block": 2, "block_age": -7 } },
        "time_framing": { "node_number": 1, "nodes_count": 3, "frame_seconds": 60, "next_frame_gap": 10 }
    }"#;

    // 基本解析测试
    #[test]
    fn test_parse_and_defaults() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.main_chain.account.classify(), AccountKind::DirectKey);
        assert_eq!(config.side_chain.account.classify(), AccountKind::QueuedManager);
        match &config.side_chain.account {
            AccountConfig::QueuedManager { priority, attempts, .. } => {
                assert_eq!(*priority, 5);
                assert_eq!(*attempts, 1);
            }
            other => panic!("unexpected account {:?}", other),
        }

        let s2m = config.transfer.limits(Direction::S2M).normalized();
        assert_eq!(s2m.transactions_per_block, 2);
        assert_eq!(s2m.block_age, 0);
        assert_eq!(s2m.transfer_steps, u64::MAX);

        assert_eq!(config.main_gas().gas_price_multiplier, Some(1.25));
        assert_eq!(config.side_gas().gas_price_multiplier, None);
        assert!(config.dry_run.enabled);
        assert_eq!(config.run_loop.period_seconds, 10);
    }

    #[test]
    fn test_zero_block_size_falls_back_to_default() {
        let limits = TransferLimits {
            transactions_per_block: 0,
            ..Default::default()
        };
        assert_eq!(limits.normalized().transactions_per_block, 5);
    }

    // 无效配置测试
    #[test]
    fn test_rejects_bad_credentials() {
        let bad = SAMPLE.replace(
            "\"private_key\": \"0x23abdbd3c61b5330af61ebe8bef582f4e5cc08e554053a718bdce7813b9dc1fc\"",
            "\"private_key\": \"\"",
        );
        let err = Config::from_json(&bad).unwrap_err();
        assert!(err.to_string().contains("Bad credentials"));
    }

    #[test]
    fn test_rejects_node_number_out_of_range() {
        let bad = SAMPLE.replace("\"node_number\": 1", "\"node_number\": 3");
        assert!(Config::from_json(&bad).is_err());
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let bad = SAMPLE.replace("\"transfer\"", "\"transfers\"");
        assert!(Config::from_json(&bad).is_err());
    }

    #[test]
    fn test_quorum_thresholds() {
        let quorum = QuorumConfig::default();
        assert_eq!(quorum.thresholds(3), (2, 1));
        assert_eq!(quorum.thresholds(6), (4, 2));
        assert_eq!(quorum.thresholds(4), (3, 1));
        assert_eq!(quorum.thresholds(1), (1, 0));
        assert_eq!(quorum.thresholds(0), (0, 0));

        let bad = SAMPLE.replace(
            "\"time_framing\"",
            "\"s2s\": { \"quorum\": { \"numerator\": 4, \"denominator\": 3 } },\n        \"time_framing\"",
        );
        assert!(Config::from_json(&bad).is_err());
    }

    #[test]
    fn test_toml_config() {
        let toml_str = r#"
            [main_chain]
            name = "Mainnet"
            chain_id = 1
            rpc_url = "http://127.0.0.1:8545"
            message_proxy = "0x1000000000000000000000000000000000000001"
            account = { kind = "direct", private_key = "0x01" }

            [side_chain]
            name = "Bob"
            chain_id = 1234
            rpc_url = "http://127.0.0.1:15000"
            message_proxy = "0xd2AAa00100000000000000000000000000000000"
            account = { kind = "remote_enclave", address = "0x7aa5E36AA15E93D10F4F26357C30F052DacDde5F", wallet_url = "https://sgx:1026", key_name = "NEK:abc", cert_path = "c.crt", key_path = "k.key", signer_binary = "/usr/bin/sgx-signer" }

            [loop]
            parallel = true
        "#;
        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.side_chain.account.classify(), AccountKind::RemoteEnclave);
        assert!(config.run_loop.parallel);
    }
}
