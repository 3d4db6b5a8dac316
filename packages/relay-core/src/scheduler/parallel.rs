use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info};
use crate::{
    chain_adapter::ChainAdapterFactory,
    config::Config,
    peers::{peer_channel, PeerPublisher, WatchPeers},
    transfer::{MessageSigner, TransferStats},
    Error,
};
use super::{
    pwa::PendingWorkGate,
    runner::{build_engine, LoopRunner, LoopSteps, OracleStep, RelayChains},
};

/// 两个 worker 的分工：0 号做 Oracle、M2S、S2S，1 号只做 S2M
pub fn worker_steps(config: &Config) -> [LoopSteps; 2] {
    let all = LoopSteps::from_config(config);
    [
        LoopSteps { s2m: false, ..all },
        LoopSteps {
            oracle: false,
            m2s: false,
            s2m: all.s2m,
            s2s: false,
        },
    ]
}

/// 并行模式
///
/// 每个 worker 是独立的 tokio 任务，有自己的引擎和运行标志，
/// 共享统计与目标链句柄。节点缓存通过 watch 通道广播，worker 每轮开始前读取最新快照。
pub struct ParallelLoop {
    config: Config,
    chains: RelayChains,
    stats: TransferStats,
    signer: Arc<dyn MessageSigner>,
    factory: Arc<dyn ChainAdapterFactory>,
    gate: Arc<dyn PendingWorkGate>,
    oracle: Arc<dyn OracleStep>,
    publisher: PeerPublisher,
    peers: WatchPeers,
}

impl ParallelLoop {
    pub fn new(
        config: Config,
        chains: RelayChains,
        stats: TransferStats,
        signer: Arc<dyn MessageSigner>,
        factory: Arc<dyn ChainAdapterFactory>,
        gate: Arc<dyn PendingWorkGate>,
        oracle: Arc<dyn OracleStep>,
    ) -> Self {
        let (publisher, peers) = peer_channel(config.s2s.peers.clone());
        Self {
            config,
            chains,
            stats,
            signer,
            factory,
            gate,
            oracle,
            publisher,
            peers,
        }
    }

    /// 节点发现端用它发布新的侧链列表
    pub fn publisher(&self) -> PeerPublisher {
        self.publisher.clone()
    }

    fn build_worker(&self, index: usize, steps: LoopSteps) -> (LoopRunner, WatchPeers) {
        let peers = self.peers.clone();
        let engine = build_engine(
            &self.config,
            self.stats.clone(),
            self.signer.clone(),
            Arc::new(peers.clone()),
            self.factory.clone(),
        );
        let runner = LoopRunner::new(Arc::new(engine), self.chains.clone(), &self.config)
            .with_name(format!("worker #{}", index))
            .with_gate(self.gate.clone())
            .with_oracle(self.oracle.clone())
            .with_steps(steps);
        (runner, peers)
    }

    /// 启动全部 worker
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        worker_steps(&self.config)
            .into_iter()
            .enumerate()
            .map(|(index, steps)| {
                let (runner, peers) = self.build_worker(index, steps);
                info!("Starting {} with steps {:?}", runner.name(), steps);
                tokio::spawn(run_worker(runner, peers))
            })
            .collect()
    }

    /// 启动并等待 worker，正常情况下不会返回
    pub async fn run(&self) -> Result<(), Error> {
        for handle in self.spawn() {
            if let Err(e) = handle.await {
                error!("Loop worker stopped: {}", e);
                return Err(Error::Process(format!("Loop worker stopped: {}", e)));
            }
        }
        Ok(())
    }
}

async fn run_worker(runner: LoopRunner, mut peers: WatchPeers) {
    if runner.delay_first_run() {
        sleep(runner.period()).await;
    }
    loop {
        if peers.has_changed() {
            let count = peers.mark_seen();
            info!("{} got updated S-Chain network cache with {} chain(s)", runner.name(), count);
        }
        runner.single_transfer_loop().await;
        sleep(runner.period()).await;
    }
}
