//! 通用的重试任务执行器
//!
//! - `task`: 传输单元接口与结果类型
//! - `engine`: 并发调度、重试、取消

pub mod engine;
pub mod task;

pub use engine::{
    BatchSummary, ExecutorConfig, ExecutorHandle, TaskExecutor, DEFAULT_MAX_RETRY,
    DEFAULT_PARALLEL,
};
pub use task::{
    FailedUnit, TransferUnit, UnitContext, UnitKind, UnitOutcome, UnitRecord, UnitStatus,
};
