use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use crate::{
    chain_adapter::{ChainAdapterFactory, MessageProxy},
    config::{Config, ScanConfig, TransferConfig},
    peers::PeerCache,
    transfer::{
        s2s::{do_all_s2s, S2SDestination},
        ChainEndpoint, MessageSigner, TransferEngine, TransferOutcome, TransferRequest, TransferStats,
    },
    tx::{signer::build_signer, TransactionCustomizer, TxSubmitter},
    types::{Direction, WorkType},
    Error,
};
use super::{
    loop_state::LoopState,
    pwa::{NoPendingWork, PendingWorkGate, PwaTracker, TrustedNetwork},
    time_framing::TimeFraming,
};

/// 主链 gas 价格同步步骤
#[async_trait]
pub trait OracleStep: Send + Sync {
    async fn run(&self) -> Result<bool, Error>;
}

/// 未接入预言机时使用
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOracle;

#[async_trait]
impl OracleStep for NoOracle {
    async fn run(&self) -> Result<bool, Error> {
        Ok(true)
    }
}

/// 主链与侧链的连接句柄
#[derive(Clone)]
pub struct RelayChains {
    pub main: ChainEndpoint,
    pub side: ChainEndpoint,
    pub main_submitter: Arc<TxSubmitter>,
    pub side_submitter: Arc<TxSubmitter>,
}

impl RelayChains {
    pub async fn connect(config: &Config, factory: &dyn ChainAdapterFactory) -> Result<Self, Error> {
        let main_adapter = factory.create_adapter(&config.main_chain.rpc_url).await?;
        let side_adapter = factory.create_adapter(&config.side_chain.rpc_url).await?;
        let main_submitter = TxSubmitter::new(
            main_adapter.clone(),
            build_signer(&config.main_chain.account)?,
            TransactionCustomizer::from(config.main_gas()),
            config.dry_run,
            config.pow.clone(),
        );
        let side_submitter = TxSubmitter::new(
            side_adapter.clone(),
            build_signer(&config.side_chain.account)?,
            TransactionCustomizer::from(config.side_gas()),
            config.dry_run,
            config.pow.clone(),
        );
        info!(
            "Connected to {} via {} and {} via {}",
            config.main_chain.name, config.main_chain.rpc_url, config.side_chain.name, config.side_chain.rpc_url
        );
        Ok(Self {
            main: ChainEndpoint {
                name: config.main_chain.name.clone(),
                proxy: MessageProxy::new(main_adapter, config.main_chain.message_proxy, config.scan),
            },
            side: ChainEndpoint {
                name: config.side_chain.name.clone(),
                proxy: MessageProxy::new(side_adapter, config.side_chain.message_proxy, config.scan),
            },
            main_submitter: Arc::new(main_submitter),
            side_submitter: Arc::new(side_submitter),
        })
    }
}

/// 按配置组装转发引擎
pub fn build_engine(
    config: &Config,
    stats: TransferStats,
    signer: Arc<dyn MessageSigner>,
    peers: Arc<dyn PeerCache>,
    factory: Arc<dyn ChainAdapterFactory>,
) -> TransferEngine {
    TransferEngine::new(stats, signer, TimeFraming::new(config.time_framing.clone()))
        .with_peers(peers, factory)
        .with_quorum(config.s2s.quorum)
        .with_expose_details(config.transfer.expose_details)
}

/// 按配置组装 PWA，关闭时不做协调
pub fn build_gate(config: &Config) -> Arc<dyn PendingWorkGate> {
    if !config.pwa.enabled {
        return Arc::new(NoPendingWork);
    }
    Arc::new(PwaTracker::new(
        config.pwa.clone(),
        config.time_framing.node_number,
        config.time_framing.nodes_count,
        Arc::new(TrustedNetwork),
    ))
}

/// 一个循环实例负责的步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSteps {
    pub oracle: bool,
    pub m2s: bool,
    pub s2m: bool,
    pub s2s: bool,
}

impl LoopSteps {
    pub fn from_config(config: &Config) -> Self {
        Self {
            oracle: config.run_loop.enable_oracle,
            m2s: config.run_loop.enable_m2s,
            s2m: config.run_loop.enable_s2m,
            s2s: config.run_loop.enable_s2s && config.s2s.enabled,
        }
    }
}

/// 单次循环与重复驱动
pub struct LoopRunner {
    name: String,
    engine: Arc<TransferEngine>,
    chains: RelayChains,
    gate: Arc<dyn PendingWorkGate>,
    oracle: Arc<dyn OracleStep>,
    state: LoopState,
    steps: LoopSteps,
    transfer: TransferConfig,
    scan: ScanConfig,
    period: Duration,
    delay_first_run: bool,
}

impl LoopRunner {
    pub fn new(engine: Arc<TransferEngine>, chains: RelayChains, config: &Config) -> Self {
        Self {
            name: "main".to_string(),
            engine,
            chains,
            gate: Arc::new(NoPendingWork),
            oracle: Arc::new(NoOracle),
            state: LoopState::default(),
            steps: LoopSteps::from_config(config),
            transfer: config.transfer.clone(),
            scan: config.scan,
            period: Duration::from_secs(config.run_loop.period_seconds),
            delay_first_run: config.run_loop.delay_first_run,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn PendingWorkGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn OracleStep>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_steps(mut self, steps: LoopSteps) -> Self {
        self.steps = steps;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> LoopSteps {
        self.steps
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn delay_first_run(&self) -> bool {
        self.delay_first_run
    }

    /// 依次执行 Oracle、M2S、S2M、S2S，全部成功返回 true
    ///
    /// 任一步骤返回错误时清除全部运行标志并返回 false。
    pub async fn single_transfer_loop(&self) -> bool {
        match self.run_steps().await {
            Ok(result) => {
                info!(
                    "Single Loop in {}: final completion status for all performed transfer loop parts is {}",
                    self.name, result
                );
                result
            }
            Err(e) => {
                error!("Single Loop in {}: exception in transfer loop: {}", self.name, e);
                self.state.reset_all();
                false
            }
        }
    }

    async fn run_steps(&self) -> Result<bool, Error> {
        let mut result = true;
        for (work, enabled) in [
            (WorkType::Oracle, self.steps.oracle),
            (WorkType::M2S, self.steps.m2s),
            (WorkType::S2M, self.steps.s2m),
            (WorkType::S2S, self.steps.s2s),
        ] {
            if !enabled {
                debug!("Skipped {} step in {}", work, self.name);
                continue;
            }
            let done = self.run_step(work).await?;
            info!("{} step done in {}: {}", work, self.name, done);
            result &= done;
        }
        Ok(result)
    }

    async fn run_step(&self, work: WorkType) -> Result<bool, Error> {
        let step = self.state.step(work);
        if step.is_in_progress() {
            step.mark_skipped();
            warn!(
                "Skipped {} transfer loop part due to other single transfer loop is in progress right now",
                work
            );
            return Ok(true);
        }
        let direction = match work {
            WorkType::Oracle => None,
            WorkType::M2S => Some(Direction::M2S),
            WorkType::S2M => Some(Direction::S2M),
            // S2S 在每个对端上分别做 PWA、时间分片和运行标志检查
            WorkType::S2S => return Ok(self.run_s2s().await),
        };

        if !self.gate.check_on_loop_start(work, 0).await {
            step.mark_skipped();
            info!("Skipped({}) in {} due to cancel mode reported from PWA", work, self.name);
            return Ok(true);
        }
        if !self.engine.framing().allows(work) {
            info!("Skipped({}) in {} due to time framing check", work, self.name);
            return Ok(true);
        }
        if !step.try_begin() {
            return Ok(true);
        }
        self.gate.notify_start(work, 0).await;
        let result = match direction {
            Some(direction) => self.run_transfer(direction).await,
            None => self.oracle.run().await,
        };
        step.finish();
        self.gate.notify_end(work, 0).await;
        result
    }

    async fn run_transfer(&self, direction: Direction) -> Result<bool, Error> {
        let (src, dst, submitter) = match direction {
            Direction::S2M => (&self.chains.side, &self.chains.main, &self.chains.main_submitter),
            _ => (&self.chains.main, &self.chains.side, &self.chains.side_submitter),
        };
        let request = TransferRequest {
            direction,
            src: src.clone(),
            dst: dst.clone(),
            submitter: submitter.clone(),
            limits: self.transfer.limits(direction).normalized(),
        };
        let outcome = self.engine.transfer(&request).await?;
        Ok(!matches!(outcome, TransferOutcome::Failed { .. }))
    }

    async fn run_s2s(&self) -> bool {
        let dst = S2SDestination {
            endpoint: self.chains.side.clone(),
            submitter: self.chains.side_submitter.clone(),
            limits: self.transfer.s2s.normalized(),
            proxy_address: self.chains.side.proxy.address(),
            scan: self.scan,
        };
        do_all_s2s(&self.engine, self.gate.as_ref(), &self.state.s2s, &dst).await
    }

    /// 按固定周期重复执行单次循环，不会返回
    pub async fn run_forever(&self) {
        if self.delay_first_run {
            info!("Loop {} will wait {:?} before the first run", self.name, self.period);
            sleep(self.period).await;
        }
        loop {
            self.single_transfer_loop().await;
            sleep(self.period).await;
        }
    }
}
