use alloy::primitives::Address;
use std::sync::Arc;
use tracing::{error, info, warn};
use crate::{
    chain_adapter::MessageProxy,
    config::{EffectiveLimits, ScanConfig},
    peers::SChainInfo,
    scheduler::{loop_state::StepState, pwa::PendingWorkGate},
    tx::TxSubmitter,
    types::{Direction, WorkType},
    Error,
};
use super::{ChainEndpoint, TransferEngine, TransferOutcome, TransferRequest};

/// S2S 的接收端，即本侧链
#[derive(Clone)]
pub struct S2SDestination {
    pub endpoint: ChainEndpoint,
    pub submitter: Arc<TxSubmitter>,
    pub limits: EffectiveLimits,
    /// 各侧链上 MessageProxy 部署在相同地址
    pub proxy_address: Address,
    pub scan: ScanConfig,
}

/// 依次从每条已缓存的对端侧链向本侧链转发
///
/// PWA 否决的对端既不算成功也不算失败，时间分片跳过算成功。
/// 全部对端都没有失败时返回 true。
pub async fn do_all_s2s(
    engine: &TransferEngine,
    gate: &dyn PendingWorkGate,
    state: &StepState,
    dst: &S2SDestination,
) -> bool {
    let chains = engine.peers().cached_chains();
    info!(
        "Have {} S-Chain(s) connected to this S-Chain for performing S2S transfers",
        chains.len()
    );
    let (mut ok, mut fail) = (0usize, 0usize);
    for (index, chain) in chains.iter().enumerate() {
        if chain.name == dst.endpoint.name {
            continue;
        }
        info!("S2S transfer walk through {}/{} S-Chain", chain.name, chain.chain_id);
        match transfer_from_peer(engine, gate, state, dst, index, chain).await {
            Ok(None) => {}
            Ok(Some(true)) => ok += 1,
            Ok(Some(false)) => fail += 1,
            Err(e) => {
                error!("S2S step error from S-Chain {}, error is: {}", chain.name, e);
                fail += 1;
            }
        }
    }
    if ok > 0 || fail > 0 {
        info!("Got {} S2S step(s) OK and {} S2S step(s) failed", ok, fail);
    }
    fail == 0
}

async fn transfer_from_peer(
    engine: &TransferEngine,
    gate: &dyn PendingWorkGate,
    state: &StepState,
    dst: &S2SDestination,
    index: usize,
    chain: &SChainInfo,
) -> Result<Option<bool>, Error> {
    let url = engine
        .peers()
        .pick_random_node_url(chain)
        .ok_or_else(|| Error::Network(format!("S-Chain {} has no known nodes", chain.name)))?;
    let adapter = engine.factory().create_adapter(&url).await?;

    if !gate.check_on_loop_start(WorkType::S2S, index).await {
        state.mark_skipped();
        info!("Skipped(s2s) for S-Chain {} due to cancel mode reported from PWA", chain.name);
        return Ok(None);
    }
    if !engine.framing().allows(WorkType::S2S) {
        info!("Skipped(s2s) for S-Chain {} due to time framing check", chain.name);
        return Ok(Some(true));
    }
    if !state.try_begin() {
        warn!("Skipped(s2s) for S-Chain {}, another S2S transfer is in progress", chain.name);
        return Ok(Some(true));
    }

    gate.notify_start(WorkType::S2S, index).await;
    let request = TransferRequest {
        direction: Direction::S2S,
        src: ChainEndpoint {
            name: chain.name.clone(),
            proxy: MessageProxy::new(adapter, dst.proxy_address, dst.scan),
        },
        dst: dst.endpoint.clone(),
        submitter: dst.submitter.clone(),
        limits: dst.limits,
    };
    let result = engine.transfer(&request).await;
    state.finish();
    gate.notify_end(WorkType::S2S, index).await;

    Ok(Some(!matches!(result?, TransferOutcome::Failed { .. })))
}
