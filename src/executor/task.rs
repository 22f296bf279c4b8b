//! 传输单元抽象
//!
//! 执行器只认识 [`TransferUnit`]：一次 `run` 就是一次完整尝试，
//! 返回的错误种类决定执行器是重试、延后还是放弃。

use crate::common::statistic::TransferReporter;
use crate::error::TransferError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Download,
    Upload,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Download => write!(f, "下载"),
            UnitKind::Upload => write!(f, "上传"),
        }
    }
}

/// 单元状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// 一次成功运行的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOutcome {
    /// 本次实际传输的字节数
    pub transferred_bytes: u64,
    /// 是否秒传完成
    pub rapid: bool,
    /// 是否因冲突策略跳过
    pub skipped: bool,
}

impl UnitOutcome {
    pub fn transferred(bytes: u64) -> Self {
        Self {
            transferred_bytes: bytes,
            ..Default::default()
        }
    }

    pub fn rapid() -> Self {
        Self {
            rapid: true,
            ..Default::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// 执行器交给单元的运行上下文
#[derive(Clone)]
pub struct UnitContext {
    pub reporter: Arc<dyn TransferReporter>,
    /// 单元级取消令牌（批次取消时同样会触发）
    pub cancel: CancellationToken,
}

impl UnitContext {
    pub fn new(reporter: Arc<dyn TransferReporter>, cancel: CancellationToken) -> Self {
        Self { reporter, cancel }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for UnitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// 可调度的传输单元
#[async_trait]
pub trait TransferUnit: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> UnitKind;

    fn local_path(&self) -> &Path;

    fn remote_path(&self) -> &str;

    /// 计划传输的字节数（提交时计入统计）
    fn planned_bytes(&self) -> u64;

    /// 互斥键：键相同的单元不会同时运行
    fn exclusive_key(&self) -> Option<String> {
        None
    }

    /// 执行一次完整尝试
    async fn run(&mut self, ctx: &UnitContext) -> Result<UnitOutcome, TransferError>;

    /// 单元被显式取消时调用，清理可续传状态
    async fn abandon(&mut self) {}
}

/// 失败队列中的条目
#[derive(Debug)]
pub struct FailedUnit {
    pub unit: Box<dyn TransferUnit>,
    pub retry_count: u32,
    pub max_retry: u32,
    pub error: TransferError,
}

/// 单元最终报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRecord {
    pub id: String,
    pub kind: UnitKind,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub status: UnitStatus,
    pub retry_count: u32,
    pub outcome: Option<UnitOutcome>,
    pub error: Option<TransferError>,
}
