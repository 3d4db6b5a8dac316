use std::collections::BTreeMap;
use tracing::{debug, warn};
use crate::{
    chain_adapter::MessageProxy,
    types::MessageCounters,
    Error,
};
use super::details::RunLog;

/// 消息所在区块的查找方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryStrategy {
    /// 先沿 PreviousMessageReference 反向链表查找，失败再全量扫描
    #[default]
    Optimized,
    /// 只做逐条全量扫描
    Classic,
}

/// 消息序号到所在区块的映射
pub type BlockHints = BTreeMap<u64, u64>;

/// 为 [incoming, outgoing) 内的消息找出所在区块
///
/// 反向链表不完整时整体丢弃，改用逐条扫描。没有提示的消息在收集阶段做全范围查询。
pub async fn discover_message_blocks(
    src: &MessageProxy,
    dst_chain: &str,
    counters: MessageCounters,
    strategy: DiscoveryStrategy,
    run: &mut RunLog,
) -> Result<BlockHints, Error> {
    if strategy == DiscoveryStrategy::Optimized {
        match src.last_outgoing_message_block_id(dst_chain).await {
            Ok(0) if counters.pending() > 0 => {
                warn!(
                    "{}Last outgoing message block is 0, optimized log search is un-available",
                    run.prefix()
                );
                run.warn("Last outgoing message block is 0, optimized log search is un-available");
            }
            Ok(block_id) => match walk_references(src, block_id, counters, run).await {
                Ok(records) => return Ok(records),
                Err(e) => {
                    warn!(
                        "{}Optimized log search is off, running old message proxy contract? Error is: {}",
                        run.prefix(),
                        e
                    );
                    run.warn(format!(
                        "Optimized log search is off. Running old message proxy contract? Error is: {}",
                        e
                    ));
                }
            },
            Err(e) => {
                warn!("{}Optimized log search is un-available: {}", run.prefix(), e);
                run.warn(format!("Optimized log search is un-available: {}", e));
            }
        }
    }
    classic_scan(src, dst_chain, counters, run).await
}

/// 从最后一条消息所在块开始，逐条向前直到 incoming，缺一条即失败
async fn walk_references(
    src: &MessageProxy,
    last_block_id: u64,
    counters: MessageCounters,
    run: &mut RunLog,
) -> Result<BlockHints, Error> {
    let mut records = BlockHints::new();
    let expected = counters.pending();
    if expected == 0 {
        run.debug("Optimized message search has nothing to search");
        return Ok(records);
    }
    run.debug(format!(
        "Optimized message search will start at block {}, will search for outgoing message counter {} and approach down to incoming message counter {}",
        last_block_id, counters.outgoing, counters.incoming
    ));

    let mut block_id = last_block_id;
    for message in (counters.incoming..counters.outgoing).rev() {
        let found = src
            .previous_message_references(block_id)
            .await?
            .into_iter()
            .find(|r| r.current_message == message);
        let Some(record) = found else {
            return Err(Error::Protocol(format!(
                "PreviousMessageReference record for message {} is missing in block {}, found {} of {} record(s)",
                message,
                block_id,
                records.len(),
                expected
            )));
        };
        block_id = record.previous_outgoing_message_block_id;
        records.insert(message, record.block_id);
    }

    run.debug(format!(
        "Optimized message search found all {} log record(s)",
        expected
    ));
    Ok(records)
}

async fn classic_scan(
    src: &MessageProxy,
    dst_chain: &str,
    counters: MessageCounters,
    run: &mut RunLog,
) -> Result<BlockHints, Error> {
    let mut records = BlockHints::new();
    for message in counters.incoming..counters.outgoing {
        let events = src.outgoing_messages(dst_chain, message, 0, None).await?;
        debug!(
            "{}Classic scan got {} event(s) for message {}",
            run.prefix(),
            events.len(),
            message
        );
        if let Some(event) = events.last() {
            records.insert(message, event.block_number);
        }
    }
    run.debug(format!("Classic scan collected {} record(s)", records.len()));
    Ok(records)
}
