use tracing::trace;
use crate::{config::TimeFramingConfig, types::WorkType, unix_now};

/// 一次时间分片判定的完整信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDecision {
    pub allowed: bool,
    pub active_index: u64,
    pub inside_gap: bool,
    pub range_start: u64,
    pub frame_start: u64,
    pub gap_start: u64,
}

impl FrameDecision {
    fn always() -> Self {
        Self {
            allowed: true,
            active_index: 0,
            inside_gap: false,
            range_start: 0,
            frame_start: 0,
            gap_start: 0,
        }
    }
}

/// 多个中继节点按时间片轮流提交
///
/// 把 Unix 秒映射到长度为 `frame_seconds * nodes_count` 的周期上，
/// 当前时间片的下标即活跃节点编号。节点还要在自己时间片结束前
/// `next_frame_gap` 秒停止提交。
#[derive(Debug, Clone)]
pub struct TimeFraming {
    config: TimeFramingConfig,
    clock: fn() -> u64,
}

impl TimeFraming {
    pub fn new(config: TimeFramingConfig) -> Self {
        Self {
            config,
            clock: unix_now,
        }
    }

    pub fn disabled() -> Self {
        Self::new(TimeFramingConfig::default())
    }

    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.frame_seconds > 0 && self.config.nodes_count > 1
    }

    pub fn check(&self, now: u64, work: WorkType) -> FrameDecision {
        if !self.is_enabled() {
            return FrameDecision::always();
        }
        let frame = self.config.frame_seconds;
        let range = frame * self.config.nodes_count;
        let modulo = now % range;
        let active_index = modulo / frame;
        let range_start = now - modulo;
        let frame_start = range_start + self.config.node_number * frame;
        let gap_start = (frame_start + frame).saturating_sub(self.config.next_frame_gap);

        let mut allowed = active_index == self.config.node_number;
        let mut inside_gap = false;
        if allowed && now >= gap_start {
            allowed = false;
            inside_gap = true;
        }
        trace!(
            "Time framing for {}: now {}, all chains range {}, range mod {}, active node frame index {}, testing frame index {}, frame start {}, gap start {}, inside gap {}, skip {}",
            work,
            now,
            range,
            modulo,
            active_index,
            self.config.node_number,
            frame_start,
            gap_start,
            inside_gap,
            !allowed
        );
        FrameDecision {
            allowed,
            active_index,
            inside_gap,
            range_start,
            frame_start,
            gap_start,
        }
    }

    /// 按当前时钟判断
    pub fn allows(&self, work: WorkType) -> bool {
        self.check((self.clock)(), work).allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framing(node_number: u64) -> TimeFraming {
        TimeFraming::new(TimeFramingConfig {
            node_number,
            nodes_count: 3,
            frame_seconds: 60,
            next_frame_gap: 10,
        })
    }

    #[test]
    fn test_exactly_one_active_node() {
        for now in (1_700_000_000u64..1_700_000_400).step_by(7) {
            let active: Vec<u64> = (0..3)
                .filter(|n| {
                    let d = framing(*n).check(now, WorkType::M2S);
                    d.allowed || d.inside_gap
                })
                .collect();
            assert_eq!(active.len(), 1, "at {}", now);
            assert_eq!(active[0], framing(0).check(now, WorkType::M2S).active_index);
        }
    }

    #[test]
    fn test_gap_window() {
        // 周期 180 秒，节点 1 的时间片为 [60, 120)，最后 10 秒为间隙
        let tf = framing(1);
        let base = 180 * 1000;
        assert!(!tf.check(base + 59, WorkType::S2M).allowed);
        assert!(tf.check(base + 60, WorkType::S2M).allowed);
        assert!(tf.check(base + 109, WorkType::S2M).allowed);

        let gap = tf.check(base + 110, WorkType::S2M);
        assert!(!gap.allowed);
        assert!(gap.inside_gap);
        assert_eq!(gap.frame_start, base + 60);
        assert_eq!(gap.gap_start, base + 110);
        assert!(!tf.check(base + 120, WorkType::S2M).allowed);
    }

    #[test]
    fn test_disabled_always_allows() {
        assert!(TimeFraming::disabled().allows(WorkType::S2S));
        let single = TimeFraming::new(TimeFramingConfig {
            node_number: 0,
            nodes_count: 1,
            frame_seconds: 60,
            next_frame_gap: 10,
        });
        assert!(single.check(12345, WorkType::Oracle).allowed);
    }

    #[test]
    fn test_injected_clock() {
        let tf = framing(2).with_clock(|| 180 * 5 + 130);
        assert!(tf.allows(WorkType::M2S));
        let tf = framing(0).with_clock(|| 180 * 5 + 130);
        assert!(!tf.allows(WorkType::M2S));
    }
}
