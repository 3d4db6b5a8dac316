use alloy::primitives::{keccak256, B256, U256};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};
use crate::{config::PwaConfig, types::WorkType, unix_now, Error};

/// 循环步骤开始前的外部否决，以及开始/结束通知
#[async_trait]
pub trait PendingWorkGate: Send + Sync {
    /// 返回 false 表示其他节点正在做同样的工作，本步骤应跳过
    async fn check_on_loop_start(&self, work: WorkType, s2s_index: usize) -> bool;

    async fn notify_start(&self, work: WorkType, s2s_index: usize);

    async fn notify_end(&self, work: WorkType, s2s_index: usize);
}

/// 不做任何协调
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPendingWork;

#[async_trait]
impl PendingWorkGate for NoPendingWork {
    async fn check_on_loop_start(&self, _work: WorkType, _s2s_index: usize) -> bool {
        true
    }

    async fn notify_start(&self, _work: WorkType, _s2s_index: usize) {}

    async fn notify_end(&self, _work: WorkType, _s2s_index: usize) {}
}

/// 对 PWA 通知哈希签名与验签，通常由门限签名服务提供
#[async_trait]
pub trait ReadyHashSigner: Send + Sync {
    async fn sign_ready_hash(&self, hash: B256) -> Result<String, Error>;

    async fn verify_ready_hash(&self, hash: B256, node_number: u64, signature: &str) -> Result<bool, Error>;
}

/// 不签名也不验签，只用于节点间网络可信的部署
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedNetwork;

#[async_trait]
impl ReadyHashSigner for TrustedNetwork {
    async fn sign_ready_hash(&self, _hash: B256) -> Result<String, Error> {
        Ok(String::new())
    }

    async fn verify_ready_hash(&self, _hash: B256, _node_number: u64, _signature: &str) -> Result<bool, Error> {
        Ok(true)
    }
}

/// 某节点某步骤的最近通知
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PwaEntry {
    pub in_progress: bool,
    pub ts: u64,
}

#[derive(Debug, Clone, Default)]
struct NodePwaState {
    oracle: PwaEntry,
    m2s: PwaEntry,
    s2m: PwaEntry,
    s2s: HashMap<usize, PwaEntry>,
}

impl NodePwaState {
    fn entry_mut(&mut self, work: WorkType, s2s_index: usize) -> &mut PwaEntry {
        match work {
            WorkType::Oracle => &mut self.oracle,
            WorkType::M2S => &mut self.m2s,
            WorkType::S2M => &mut self.s2m,
            WorkType::S2S => self.s2s.entry(s2s_index).or_default(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoopWorkNotification<'a> {
    #[serde(rename = "nNodeNumber")]
    node_number: u64,
    #[serde(rename = "strLoopWorkType")]
    loop_work_type: &'a str,
    #[serde(rename = "nIndexS2S")]
    s2s_index: usize,
    is_start: bool,
    ts: u64,
    signature: &'a str,
}

/// keccak256(u256(node) ‖ keccak256(work) ‖ u256(is_start) ‖ u256(ts))
pub fn ready_hash(node_number: u64, work: WorkType, is_start: bool, ts: u64) -> B256 {
    let mut bytes = Vec::with_capacity(128);
    bytes.extend_from_slice(&U256::from(node_number).to_be_bytes::<32>());
    bytes.extend_from_slice(keccak256(work.as_str().as_bytes()).as_slice());
    bytes.extend_from_slice(&U256::from(is_start as u8).to_be_bytes::<32>());
    bytes.extend_from_slice(&U256::from(ts).to_be_bytes::<32>());
    keccak256(&bytes)
}

/// 其他节点的检查顺序：从本节点前一个开始循环递减
pub fn walk_node_indices(node_number: u64, nodes_count: u64) -> Vec<u64> {
    if nodes_count <= 1 || node_number >= nodes_count {
        return Vec::new();
    }
    (1..nodes_count)
        .map(|step| (node_number + nodes_count - step) % nodes_count)
        .collect()
}

/// 基于节点间通知的待处理工作分析
///
/// 每个节点在步骤开始和结束时向其他节点广播 `skale_imaNotifyLoopWork`，
/// 收到的状态记录在本地。开始步骤前如果任一其他节点在超时时间内
/// 声明正在做同一工作，则否决本次运行。
pub struct PwaTracker {
    config: PwaConfig,
    node_number: u64,
    nodes_count: u64,
    states: Mutex<Vec<NodePwaState>>,
    signer: Arc<dyn ReadyHashSigner>,
    client: reqwest::Client,
    clock: fn() -> u64,
}

impl PwaTracker {
    pub fn new(config: PwaConfig, node_number: u64, nodes_count: u64, signer: Arc<dyn ReadyHashSigner>) -> Self {
        Self {
            config,
            node_number,
            nodes_count,
            states: Mutex::new(vec![NodePwaState::default(); nodes_count as usize]),
            signer,
            client: reqwest::Client::new(),
            clock: unix_now,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    fn is_applicable(&self) -> bool {
        self.config.enabled && self.nodes_count > 1 && self.node_number < self.nodes_count
    }

    fn lock(&self) -> MutexGuard<'_, Vec<NodePwaState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 查看本地记录的某节点状态
    pub fn entry(&self, node_number: u64, work: WorkType, s2s_index: usize) -> Option<PwaEntry> {
        self.lock()
            .get_mut(node_number as usize)
            .map(|state| *state.entry_mut(work, s2s_index))
    }

    /// 处理一条到达的通知，验签失败时状态不变
    pub async fn handle_loop_state_arrived(
        &self,
        node_number: u64,
        work: WorkType,
        s2s_index: usize,
        is_start: bool,
        ts: u64,
        signature: &str,
    ) -> Result<(), Error> {
        if !self.is_applicable() {
            return Ok(());
        }
        if node_number >= self.nodes_count {
            return Err(Error::Protocol(format!(
                "PWA state arrived from unknown node {}, have {} node(s)",
                node_number, self.nodes_count
            )));
        }
        let phase = if is_start { "start" } else { "end" };
        let hash = ready_hash(node_number, work, is_start, ts);
        if !self.signer.verify_ready_hash(hash, node_number, signature).await? {
            return Err(Error::Signing(format!(
                "PWA loop-{} state signature verification failed for node {}",
                phase, node_number
            )));
        }

        let mut states = self.lock();
        if let Some(state) = states.get_mut(node_number as usize) {
            *state.entry_mut(work, s2s_index) = PwaEntry {
                in_progress: is_start,
                ts,
            };
        }
        if self.config.print {
            info!(
                "PWA loop-{} state successfully verified for node {}, work {}, S2S index {}",
                phase, node_number, work, s2s_index
            );
        }
        Ok(())
    }

    async fn notify(&self, work: WorkType, s2s_index: usize, is_start: bool) {
        if !self.is_applicable() {
            return;
        }
        let phase = if is_start { "start" } else { "end" };
        let ts = (self.clock)();
        let hash = ready_hash(self.node_number, work, is_start, ts);
        let signature = match self.signer.sign_ready_hash(hash).await {
            Ok(signature) => signature,
            Err(e) => {
                error!("PWA failed to sign loop-{} notification: {}", phase, e);
                return;
            }
        };
        if let Err(e) = self
            .handle_loop_state_arrived(self.node_number, work, s2s_index, is_start, ts, &signature)
            .await
        {
            error!("PWA failed to save own loop-{} state: {}", phase, e);
        }

        let params = LoopWorkNotification {
            node_number: self.node_number,
            loop_work_type: work.as_str(),
            s2s_index,
            is_start,
            ts,
            signature: &signature,
        };
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "skale_imaNotifyLoopWork",
            "params": params,
            "id": 1
        });
        for (idx, node) in self.config.nodes.iter().enumerate() {
            if idx as u64 == self.node_number {
                continue;
            }
            let Some(url) = node.ima_agent_url.as_deref() else {
                debug!("PWA skips node #{} without IMA agent URL", idx);
                continue;
            };
            match self.client.post(url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    if self.config.print {
                        info!("PWA loop-{} notification sent to node #{} with URL {}", phase, idx, url);
                    }
                }
                Ok(response) => warn!(
                    "PWA loop-{} notification to node #{} with URL {} got HTTP {}",
                    phase,
                    idx,
                    url,
                    response.status()
                ),
                Err(e) => error!(
                    "PWA failed to perform loop-{} notification RPC call to node #{} with URL {}, error is: {}",
                    phase, idx, url, e
                ),
            }
        }
    }
}

#[async_trait]
impl PendingWorkGate for PwaTracker {
    async fn check_on_loop_start(&self, work: WorkType, s2s_index: usize) -> bool {
        if !self.is_applicable() {
            return true;
        }
        let now = (self.clock)();
        let walk = walk_node_indices(self.node_number, self.nodes_count);
        trace!("PWA will check loop start condition via node(s) sequence {:?}", walk);

        let mut busy = Vec::new();
        let mut states = self.lock();
        for idx in walk {
            let Some(state) = states.get_mut(idx as usize) else {
                continue;
            };
            let entry = state.entry_mut(work, s2s_index);
            if !(entry.in_progress && entry.ts != 0 && now >= entry.ts) {
                continue;
            }
            let elapsed = now - entry.ts;
            if elapsed >= self.config.timeout_seconds {
                if self.config.print {
                    warn!(
                        "PWA busy state timeout for node #{}, old timestamp is {}, current timestamp is {}, exceeded by {} second(s)",
                        idx,
                        entry.ts,
                        now,
                        elapsed - self.config.timeout_seconds
                    );
                }
                *entry = PwaEntry::default();
                continue;
            }
            busy.push(idx);
        }
        if !busy.is_empty() {
            if self.config.print {
                error!("PWA loop start condition check failed, busy node(s): {:?}", busy);
            }
            return false;
        }
        if self.config.print {
            info!("PWA loop start condition check passed");
        }
        true
    }

    async fn notify_start(&self, work: WorkType, s2s_index: usize) {
        self.notify(work, s2s_index, true).await
    }

    async fn notify_end(&self, work: WorkType, s2s_index: usize) {
        self.notify(work, s2s_index, false).await
    }
}
