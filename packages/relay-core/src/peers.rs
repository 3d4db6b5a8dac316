use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// 侧链中的一个节点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeInfo {
    pub name: String,
    pub http_url: String,
    /// 该节点上中继代理的 JSON-RPC 地址，PWA 通知使用
    #[serde(default)]
    pub ima_agent_url: Option<String>,
}

/// 已发现的侧链及其节点列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SChainInfo {
    pub name: String,
    pub chain_id: u64,
    pub nodes: Vec<NodeInfo>,
}

/// 已缓存的侧链网络视图，读者可以容忍短暂过期的数据
pub trait PeerCache: Send + Sync {
    fn cached_chains(&self) -> Arc<Vec<SChainInfo>>;

    fn pick_random_node_url(&self, chain: &SChainInfo) -> Option<String> {
        chain
            .nodes
            .choose(&mut rand::thread_rng())
            .map(|node| node.http_url.clone())
    }

    fn find_chain(&self, name: &str) -> Option<SChainInfo> {
        self.cached_chains().iter().find(|c| c.name == name).cloned()
    }
}

/// 发现端持有的写入句柄，最新值覆盖旧值
#[derive(Debug, Clone)]
pub struct PeerPublisher {
    tx: Arc<watch::Sender<Arc<Vec<SChainInfo>>>>,
}

impl PeerPublisher {
    pub fn publish(&self, chains: Vec<SChainInfo>) {
        self.tx.send_replace(Arc::new(chains));
    }

    pub fn subscribe(&self) -> WatchPeers {
        WatchPeers {
            rx: self.tx.subscribe(),
        }
    }
}

/// 订阅端，每个 worker 持有一个
#[derive(Debug, Clone)]
pub struct WatchPeers {
    rx: watch::Receiver<Arc<Vec<SChainInfo>>>,
}

impl WatchPeers {
    /// 自上次读取后是否有新的快照
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// 标记当前快照已读，返回其中的侧链数
    pub fn mark_seen(&mut self) -> usize {
        self.rx.borrow_and_update().len()
    }
}

impl PeerCache for WatchPeers {
    fn cached_chains(&self) -> Arc<Vec<SChainInfo>> {
        self.rx.borrow().clone()
    }
}

pub fn peer_channel(initial: Vec<SChainInfo>) -> (PeerPublisher, WatchPeers) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (PeerPublisher { tx: Arc::new(tx) }, WatchPeers { rx })
}

/// 固定不变的节点列表
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    chains: Arc<Vec<SChainInfo>>,
}

impl StaticPeers {
    pub fn new(chains: Vec<SChainInfo>) -> Self {
        Self {
            chains: Arc::new(chains),
        }
    }
}

impl PeerCache for StaticPeers {
    fn cached_chains(&self) -> Arc<Vec<SChainInfo>> {
        self.chains.clone()
    }
}
