// 分片级重试
//
// 同一个区间/分片在原地重试，指数退避；
// 耗尽后把最后一次暂时性错误升级为 NetworkExhausted，交给执行器决定是否整单元重试。

use crate::error::TransferError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 默认分片重试次数
pub const DEFAULT_CHUNK_RETRIES: u32 = 3;

/// 初始退避延迟（毫秒）
const INITIAL_BACKOFF_MS: u64 = 100;

/// 最大退避延迟（毫秒）
const MAX_BACKOFF_MS: u64 = 5000;

/// 限流时的固定退避（毫秒）
const RATE_LIMIT_BACKOFF_MS: u64 = 10000;

/// 计算指数退避延迟
///
/// 100ms → 200ms → 400ms → ... 上限 5s；限流错误固定 10s
pub fn calculate_backoff_delay(retry_count: u32, error: &TransferError) -> Duration {
    if matches!(error, TransferError::RateLimited(_)) {
        return Duration::from_millis(RATE_LIMIT_BACKOFF_MS);
    }
    let exp = retry_count.min(16);
    let delay = INITIAL_BACKOFF_MS.saturating_mul(1u64 << exp);
    Duration::from_millis(delay.min(MAX_BACKOFF_MS))
}

/// 带重试地执行一个分片操作
///
/// # 参数
/// * `label` - 日志里标识该分片的文字
/// * `max_retries` - 首次失败后的最多重试次数
/// * `cancel` - 取消令牌，退避期间也会响应
/// * `op` - 操作本体，参数为当前尝试序号（从 0 开始）
pub async fn with_chunk_retry<T, F, Fut>(
    label: &str,
    max_retries: u32,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, TransferError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_chunk_retryable() {
            return Err(err);
        }
        if attempt >= max_retries {
            return Err(TransferError::NetworkExhausted(format!(
                "{} 重试 {} 次后仍失败: {}",
                label, max_retries, err
            )));
        }

        let delay = calculate_backoff_delay(attempt, &err);
        warn!(
            "{} 第 {} 次尝试失败: {}，{}ms 后重试",
            label,
            attempt + 1,
            err,
            delay.as_millis()
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_growth_and_cap() {
        let transient = TransferError::NetworkTransient("x".into());
        assert_eq!(calculate_backoff_delay(0, &transient).as_millis(), 100);
        assert_eq!(calculate_backoff_delay(1, &transient).as_millis(), 200);
        assert_eq!(calculate_backoff_delay(3, &transient).as_millis(), 800);
        assert_eq!(calculate_backoff_delay(10, &transient).as_millis(), 5000);
        assert_eq!(calculate_backoff_delay(40, &transient).as_millis(), 5000);

        let limited = TransferError::RateLimited("x".into());
        assert_eq!(calculate_backoff_delay(0, &limited).as_millis(), 10000);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = with_chunk_retry("分片 #0", 3, &cancel, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TransferError::NetworkTransient("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_escalates_to_exhausted() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = with_chunk_retry("分片 #1", 2, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransferError::NetworkTransient("timeout".into())) }
        })
        .await;
        assert!(matches!(result, Err(TransferError::NetworkExhausted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), _> = with_chunk_retry("分片 #2", 3, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransferError::QuotaExceeded("full".into())) }
        })
        .await;
        assert!(matches!(result, Err(TransferError::QuotaExceeded(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            with_chunk_retry("分片 #3", 3, &cancel, |_| async { Ok(()) }).await;
        assert_eq!(result, Err(TransferError::Cancelled));
    }
}
