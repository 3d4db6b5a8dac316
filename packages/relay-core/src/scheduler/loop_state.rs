use std::sync::atomic::{AtomicBool, Ordering};
use crate::types::WorkType;

/// 单个循环步骤的运行标志
#[derive(Debug, Default)]
pub struct StepState {
    in_progress: AtomicBool,
    was_in_progress: AtomicBool,
}

impl StepState {
    /// 抢占运行权，已在运行时返回 false
    pub fn try_begin(&self) -> bool {
        let acquired = self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if acquired {
            self.was_in_progress.store(true, Ordering::Release);
        }
        acquired
    }

    pub fn finish(&self) {
        self.in_progress.store(false, Ordering::Release);
    }

    /// 本轮被跳过
    pub fn mark_skipped(&self) {
        self.was_in_progress.store(false, Ordering::Release);
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn was_in_progress(&self) -> bool {
        self.was_in_progress.load(Ordering::Acquire)
    }
}

/// 调度器持有的四个步骤标志，每个 worker 一份
#[derive(Debug, Default)]
pub struct LoopState {
    pub oracle: StepState,
    pub m2s: StepState,
    pub s2m: StepState,
    pub s2s: StepState,
}

impl LoopState {
    pub fn step(&self, work: WorkType) -> &StepState {
        match work {
            WorkType::Oracle => &self.oracle,
            WorkType::M2S => &self.m2s,
            WorkType::S2M => &self.s2m,
            WorkType::S2S => &self.s2s,
        }
    }

    /// 循环异常后清除全部运行标志
    pub fn reset_all(&self) {
        for step in [&self.oracle, &self.m2s, &self.s2m, &self.s2s] {
            step.finish();
        }
    }
}
