use alloy::primitives::Address;
use tracing::{debug, error};
use crate::{
    chain_adapter::{ChainAdapterFactory, MessageProxy},
    config::{QuorumConfig, ScanConfig},
    peers::{NodeInfo, SChainInfo},
    types::Message,
    Error,
};
use super::details::RunLog;

/// 一条消息的复核结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeTally {
    pub passed: usize,
    pub failed: usize,
}

/// S2S 消息多节点复核
pub struct QuorumValidator<'a> {
    pub factory: &'a dyn ChainAdapterFactory,
    pub chain: &'a SChainInfo,
    pub proxy_address: Address,
    pub scan: ScanConfig,
    pub dst_chain: &'a str,
    pub policy: QuorumConfig,
}

impl QuorumValidator<'_> {
    /// 逐条复核，任一消息未达到阈值即整批失败
    pub async fn validate_batch(
        &self,
        messages: &[Message],
        counters: &[u64],
        run: &mut RunLog,
    ) -> Result<(), Error> {
        let (must_pass, may_fail) = self.policy.thresholds(self.chain.nodes.len());
        run.debug(format!(
            "Will validate {} S2S message(s) on {} node(s) of {}, {} must pass, {} may fail",
            messages.len(),
            self.chain.nodes.len(),
            self.chain.name,
            must_pass,
            may_fail
        ));
        for (idx, (message, counter)) in messages.iter().zip(counters).enumerate() {
            let tally = self.validate_message(idx, message, *counter, must_pass, may_fail, run).await;
            if tally.failed > may_fail || tally.passed < must_pass {
                return Err(Error::Protocol(format!(
                    "S2S message {} validation failed on chain {}: {} node(s) passed, {} failed, {} must pass, {} may fail",
                    idx + 1,
                    self.chain.name,
                    tally.passed,
                    tally.failed,
                    must_pass,
                    may_fail
                )));
            }
            run.debug(format!(
                "S2S message {} validation passed on {} node(s)",
                idx + 1,
                tally.passed
            ));
        }
        Ok(())
    }

    async fn validate_message(
        &self,
        idx: usize,
        message: &Message,
        counter: u64,
        must_pass: usize,
        may_fail: usize,
        run: &mut RunLog,
    ) -> NodeTally {
        let mut tally = NodeTally::default();
        for node in &self.chain.nodes {
            match self.observe_on_node(node, message, counter).await {
                Ok(true) => {
                    tally.passed += 1;
                    run.trace(format!(
                        "S2S message {} validation on node {} using URL {} is passed",
                        idx + 1,
                        node.name,
                        node.http_url
                    ));
                }
                Ok(false) => {
                    tally.failed += 1;
                    run.error(format!(
                        "S2S message {} validation on node {} using URL {} is failed",
                        idx + 1,
                        node.name,
                        node.http_url
                    ));
                }
                Err(e) => {
                    tally.failed += 1;
                    error!("Failed to scan events on node {}: {}", node.name, e);
                    run.error(format!(
                        "S2S message analysis error: Failed to scan events on node {}, error is: {}",
                        node.name, e
                    ));
                }
            }
            if tally.failed > may_fail || tally.passed >= must_pass {
                break;
            }
        }
        tally
    }

    async fn observe_on_node(&self, node: &NodeInfo, message: &Message, counter: u64) -> Result<bool, Error> {
        let adapter = self.factory.create_adapter(&node.http_url).await?;
        let proxy = MessageProxy::new(adapter, self.proxy_address, self.scan);
        let (from_block, to_block) = match message.source_block_hint {
            Some(block) => (block, Some(block)),
            None => (0, None),
        };
        let events = proxy
            .outgoing_messages(self.dst_chain, counter, from_block, to_block)
            .await?;
        debug!("Got {} OutgoingMessage event(s) on node {}", events.len(), node.name);
        Ok(events.iter().any(|event| {
            event.src_contract == message.sender && event.dst_contract == message.destination_contract
        }))
    }
}
