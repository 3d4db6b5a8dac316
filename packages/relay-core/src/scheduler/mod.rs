//! 多节点调度：时间分片、待处理工作分析、循环驱动与并行 worker

pub mod loop_state;
pub mod parallel;
pub mod pwa;
pub mod runner;
pub mod time_framing;

pub use loop_state::{LoopState, StepState};
pub use parallel::ParallelLoop;
pub use pwa::{NoPendingWork, PendingWorkGate, PwaTracker, ReadyHashSigner};
pub use runner::{build_engine, build_gate, LoopRunner, LoopSteps, NoOracle, OracleStep, RelayChains};
pub use time_framing::{FrameDecision, TimeFraming};
