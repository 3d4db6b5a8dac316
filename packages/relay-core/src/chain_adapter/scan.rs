use tracing::{debug, error, trace, warn};
use crate::{config::ScanConfig, types::RpcLog, Error};
use super::{ChainAdapter, LogFilter};

/// 日志查询默认尝试次数
pub const DEFAULT_ATTEMPTS: usize = 10;

// 按主网每分钟 6 个块估算
const BLOCKS_IN_ONE_MINUTE: u64 = 6;
const BLOCKS_IN_ONE_HOUR: u64 = BLOCKS_IN_ONE_MINUTE * 60;
const BLOCKS_IN_ONE_DAY: u64 = BLOCKS_IN_ONE_HOUR * 24;
const BLOCKS_IN_ONE_WEEK: u64 = BLOCKS_IN_ONE_DAY * 7;
const BLOCKS_IN_ONE_MONTH: u64 = BLOCKS_IN_ONE_DAY * 31;
const BLOCKS_IN_ONE_YEAR: u64 = BLOCKS_IN_ONE_DAY * 366;
const BLOCKS_IN_THREE_YEARS: u64 = BLOCKS_IN_ONE_YEAR * 3;

/// 渐进式扫描计划中的一个窗口，终点总是最新块
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub from_block: u64,
    pub label: &'static str,
}

/// 从最近一天开始逐步扩大窗口，最后一项总是全范围
pub fn progressive_plan(latest_plus_one: u64) -> Vec<ScanWindow> {
    let candidates = [
        (BLOCKS_IN_ONE_DAY, "1 day"),
        (BLOCKS_IN_ONE_WEEK, "1 week"),
        (BLOCKS_IN_ONE_MONTH, "1 month"),
        (BLOCKS_IN_ONE_YEAR, "1 year"),
        (BLOCKS_IN_THREE_YEARS, "3 years"),
    ];
    let mut plan: Vec<ScanWindow> = candidates
        .iter()
        .filter_map(|(span, label)| {
            latest_plus_one
                .checked_sub(*span)
                .map(|from_block| ScanWindow { from_block, label })
        })
        .collect();
    if plan.last().map(|w| w.from_block != 0).unwrap_or(true) {
        plan.push(ScanWindow {
            from_block: 0,
            label: "entire block range",
        });
    }
    plan
}

/// 有限次数重试的 eth_getLogs
pub async fn safe_get_logs(
    adapter: &dyn ChainAdapter,
    filter: &LogFilter,
    attempts: usize,
) -> Result<Vec<RpcLog>, Error> {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        trace!(
            "Log filtering attempt {} of {} via {}, blocks {}..={}",
            attempt, attempts, adapter.url(), filter.from_block, filter.to_block
        );
        match adapter.get_logs(filter).await {
            Ok(logs) => return Ok(logs),
            Err(e) => {
                error!(
                    "Failed filtering attempt {} of {} via {}, from block {} to block {}: {}",
                    attempt, attempts, adapter.url(), filter.from_block, filter.to_block, e
                );
            }
        }
    }
    Err(Error::Chain(format!(
        "Failed filtering logs from block {} to block {} via {} after {} attempts",
        filter.from_block,
        filter.to_block,
        adapter.url(),
        attempts
    )))
}

/// 从区间末端向前按子区间扫描，返回第一个非空结果
pub async fn get_logs_iterative(
    adapter: &dyn ChainAdapter,
    filter: &LogFilter,
    attempts: usize,
    scan: &ScanConfig,
) -> Result<Vec<RpcLog>, Error> {
    let step = scan.blocks_per_iteration;
    if step == 0 || scan.max_iterations == 0 {
        warn!(
            "Iterative scan is disabled, scanning blocks {}..={} at once",
            filter.from_block, filter.to_block
        );
        return safe_get_logs(adapter, filter, attempts).await;
    }
    let latest = adapter.block_number().await?;
    let is_last_latest = filter.to_block >= latest;
    if filter.from_block == 0 && is_last_latest && latest / step > scan.max_iterations {
        warn!(
            "Too many iterations needed for blocks {}..={}, scanning at once",
            filter.from_block, filter.to_block
        );
        return safe_get_logs(adapter, filter, attempts).await;
    }

    let mut sub_to = filter.to_block;
    loop {
        let sub_from = sub_to.saturating_sub(step).max(filter.from_block);
        match safe_get_logs(adapter, &filter.with_range(sub_from, sub_to), attempts).await {
            Ok(logs) if !logs.is_empty() => return Ok(logs),
            Ok(_) => {}
            Err(e) => {
                error!(
                    "Scan error in sub-range {}..={} of {}..={}: {}",
                    sub_from, sub_to, filter.from_block, filter.to_block, e
                );
            }
        }
        sub_to = sub_from;
        if sub_to <= filter.from_block {
            break;
        }
    }
    Ok(Vec::new())
}

/// 渐进式扫描，to_block 为 None 表示最新块
///
/// 只有在请求整条链时才按扫描计划逐步扩大窗口，
/// 否则直接查询给定区间。
pub async fn get_logs_progressive(
    adapter: &dyn ChainAdapter,
    filter: &LogFilter,
    to_block: Option<u64>,
    attempts: usize,
    scan: &ScanConfig,
) -> Result<Vec<RpcLog>, Error> {
    let latest = adapter.block_number().await?;
    let latest_plus_one = latest + 1;
    let to = to_block.unwrap_or(latest_plus_one);
    let ranged = filter.with_range(filter.from_block, to);

    if !scan.progressive {
        warn!(
            "Progressive scan is disabled, scanning blocks {}..={}",
            filter.from_block, to
        );
        return safe_get_logs(adapter, &ranged, attempts).await;
    }

    let is_last_latest = to_block.is_none() || to >= latest;
    if !(filter.from_block == 0 && is_last_latest) {
        trace!("Scanning fixed block range {}..={}", filter.from_block, to);
        return safe_get_logs(adapter, &ranged, attempts).await;
    }

    let plan = progressive_plan(latest_plus_one);
    for window in &plan {
        debug!(
            "Progressive scan of blocks {}..={} ({}) via {}",
            window.from_block, latest_plus_one, window.label, adapter.url()
        );
        let windowed = filter.with_range(window.from_block, latest_plus_one);
        match get_logs_iterative(adapter, &windowed, attempts, scan).await {
            Ok(logs) if !logs.is_empty() => return Ok(logs),
            Ok(_) => {}
            Err(e) => debug!("Progressive scan window {} failed: {}", window.label, e),
        }
    }
    error!(
        "Progressive scan found no log records in blocks 0..={} via {}",
        latest_plus_one,
        adapter.url()
    );
    Ok(Vec::new())
}
