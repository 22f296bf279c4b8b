//! 传输引擎错误类型
//!
//! 所有单元级失败都归约为 [`TransferError`]，由错误种类决定重试粒度：
//!
//! | 种类 | 重试策略 |
//! |---|---|
//! | `NetworkTransient` / `RateLimited` | 分片级重试，耗尽后升级为 `NetworkExhausted` |
//! | `NetworkExhausted` / `LinkExpired` | 执行器级重试（受 `max_retry` 限制） |
//! | `KeyBusy` | 延后调度，不消耗重试次数 |
//! | 其他 | 永久失败，直接进入失败队列 |

use thiserror::Error;

/// 传输错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// 超时、5xx、连接重置等暂时性网络错误
    #[error("网络暂时性错误: {0}")]
    NetworkTransient(String),

    /// 服务器限流（429 / errno 31023, 31024）
    #[error("服务器限流: {0}")]
    RateLimited(String),

    /// 分片级重试或任务时限耗尽
    #[error("网络重试耗尽: {0}")]
    NetworkExhausted(String),

    /// 下载直链过期，需要重新规划
    #[error("下载链接已失效: {0}")]
    LinkExpired(String),

    #[error("文件不存在: {0}")]
    NotFound(String),

    #[error("权限不足: {0}")]
    PermissionDenied(String),

    #[error("网盘空间不足: {0}")]
    QuotaExceeded(String),

    /// 网盘目标路径已存在且策略禁止覆盖
    #[error("网盘目标已存在: {0}")]
    RemoteConflict(String),

    /// 本地目标文件已存在且策略禁止覆盖
    #[error("本地目标已存在: {0}")]
    LocalConflict(String),

    /// 传输完成后签名不一致
    #[error("完整性校验失败: {0}")]
    Integrity(String),

    /// 本地磁盘读写失败
    #[error("本地 I/O 错误: {0}")]
    Io(String),

    /// 进度存储自身的读写失败，对整批任务致命
    #[error("进度存储不可用: {0}")]
    ProgressStore(String),

    /// 进度记录格式损坏（可恢复：丢弃后从分片 0 重新上传）
    #[error("进度记录损坏: {0}")]
    ProgressCorrupted(String),

    /// 同一个 (路径, 签名) 键已被另一个上传单元持有
    #[error("上传键被占用: {0}")]
    KeyBusy(String),

    #[error("分片策略无效: {0}")]
    InvalidPolicy(String),

    /// 无法归类的远程接口错误
    #[error("远程接口错误 errno={errno}: {message}")]
    Remote { errno: i32, message: String },

    #[error("任务已取消")]
    Cancelled,
}

impl TransferError {
    /// 是否允许在分片粒度上原地重试（同一个 Range / Slice）
    pub fn is_chunk_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::NetworkTransient(_) | TransferError::RateLimited(_)
        )
    }

    /// 是否允许执行器重新排队整个单元
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::NetworkTransient(_)
                | TransferError::RateLimited(_)
                | TransferError::NetworkExhausted(_)
                | TransferError::LinkExpired(_)
        )
    }

    /// 是否应延后调度而非计为失败
    pub fn is_deferred(&self) -> bool {
        matches!(self, TransferError::KeyBusy(_))
    }

    /// 是否对整批任务致命
    pub fn is_fatal_to_batch(&self) -> bool {
        matches!(self, TransferError::ProgressStore(_))
    }

    /// 从百度 API errno 转换
    pub fn from_errno(errno: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match errno {
            -7 | -8 | -9 | -21 => TransferError::NetworkTransient(message),
            -1 | -3 | -11 => TransferError::NetworkTransient(message),
            31023 | 31024 => TransferError::RateLimited(message),
            -9999 | 31066 | 404 => TransferError::NotFound(message),
            -5 | -6 | 31062 | 31063 => TransferError::PermissionDenied(message),
            -10 | 31064 | 31083 | 31112 => TransferError::QuotaExceeded(message),
            -8888 | 31190 => TransferError::RemoteConflict(message),
            _ => TransferError::Remote { errno, message },
        }
    }

    /// 从 HTTP 状态码转换（仅用于非 2xx 响应）
    pub fn from_http_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        let message = format!("HTTP {}: {}", status, context);
        match status {
            403 => TransferError::PermissionDenied(message),
            404 => TransferError::NotFound(message),
            429 => TransferError::RateLimited(message),
            408 | 500..=599 => TransferError::NetworkTransient(message),
            _ => TransferError::Remote {
                errno: status as i32,
                message,
            },
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(TransferError::NetworkTransient("reset".into()).is_chunk_retryable());
        assert!(TransferError::RateLimited("429".into()).is_chunk_retryable());
        assert!(!TransferError::NetworkExhausted("x".into()).is_chunk_retryable());

        assert!(TransferError::NetworkExhausted("x".into()).is_retryable());
        assert!(TransferError::LinkExpired("x".into()).is_retryable());

        assert!(!TransferError::PermissionDenied("x".into()).is_retryable());
        assert!(!TransferError::QuotaExceeded("x".into()).is_retryable());
        assert!(!TransferError::RemoteConflict("x".into()).is_retryable());
        assert!(!TransferError::Integrity("x".into()).is_retryable());
        assert!(!TransferError::Io("x".into()).is_retryable());
        assert!(!TransferError::Cancelled.is_retryable());
    }

    #[test]
    fn test_deferred_and_fatal() {
        assert!(TransferError::KeyBusy("k".into()).is_deferred());
        assert!(!TransferError::KeyBusy("k".into()).is_retryable());
        assert!(TransferError::ProgressStore("disk".into()).is_fatal_to_batch());
        assert!(!TransferError::ProgressCorrupted("bad".into()).is_fatal_to_batch());
    }

    #[test]
    fn test_from_errno() {
        assert!(matches!(
            TransferError::from_errno(31024, "limit"),
            TransferError::RateLimited(_)
        ));
        assert!(matches!(
            TransferError::from_errno(31066, "missing"),
            TransferError::NotFound(_)
        ));
        assert!(matches!(
            TransferError::from_errno(31064, "full"),
            TransferError::QuotaExceeded(_)
        ));
        assert!(matches!(
            TransferError::from_errno(-6, "auth"),
            TransferError::PermissionDenied(_)
        ));
        assert_eq!(
            TransferError::from_errno(12345, "odd"),
            TransferError::Remote {
                errno: 12345,
                message: "odd".to_string()
            }
        );
    }

    #[test]
    fn test_from_http_status() {
        assert!(TransferError::from_http_status(503, "busy").is_chunk_retryable());
        assert!(TransferError::from_http_status(429, "slow down").is_chunk_retryable());
        assert!(matches!(
            TransferError::from_http_status(403, "denied"),
            TransferError::PermissionDenied(_)
        ));
        assert!(matches!(
            TransferError::from_http_status(416, "range"),
            TransferError::Remote { errno: 416, .. }
        ));
    }

    #[test]
    fn test_io_conversion() {
        let err: TransferError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
