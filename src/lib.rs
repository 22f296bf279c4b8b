// PCS Transfer Engine
// 百度网盘传输任务引擎核心库

// 公共模块（区间切分、签名、统计、限速、重试）
pub mod common;

// 配置管理模块
pub mod config;

// 下载单元
pub mod downloader;

// 错误分类
pub mod error;

// 通用任务执行器
pub mod executor;

// 日志系统
pub mod logging;

// 网盘会话接口及 PCS 实现
pub mod netdisk;

// 上传进度持久化
pub mod persistence;

// 上传单元
pub mod uploader;

// 导出常用类型
pub use common::{
    ChunkingPolicy, ContentSignature, RangeList, RangeSpec, SignatureEngine, Statistic,
    StatisticSnapshot, TransferReporter,
};
pub use config::AppConfig;
pub use downloader::{DownloadOptions, DownloadUnit};
pub use error::TransferError;
pub use executor::{
    BatchSummary, ExecutorConfig, ExecutorHandle, FailedUnit, TaskExecutor, TransferUnit,
    UnitContext, UnitKind, UnitOutcome, UnitRecord, UnitStatus,
};
pub use logging::{init_logging, LogGuard};
pub use netdisk::{ConflictPolicy, PcsClient, TransferSession};
pub use persistence::{ProgressKey, ProgressStore, UploadProgressRecord};
pub use uploader::{UploadOptions, UploadUnit};
