// 单元级限速器
//
// 按已消耗字节数与理论耗时的差值睡眠，粒度为一次 consume 调用。

use std::time::{Duration, Instant};

/// 小于该值的欠账不睡眠，避免频繁唤醒
const MIN_SLEEP: Duration = Duration::from_millis(5);

#[derive(Debug)]
pub struct RateLimiter {
    /// 字节/秒，0 表示不限速
    max_rate: u64,
    started: Instant,
    consumed: u64,
}

impl RateLimiter {
    pub fn new(max_rate: u64) -> Self {
        Self {
            max_rate,
            started: Instant::now(),
            consumed: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_rate == 0
    }

    /// 记录消耗的字节数，必要时睡眠到速率回落到上限以内
    pub async fn consume(&mut self, bytes: u64) {
        if self.is_unlimited() || bytes == 0 {
            return;
        }
        self.consumed += bytes;
        let delay = self.pending_delay();
        if delay >= MIN_SLEEP {
            tokio::time::sleep(delay).await;
        }
    }

    /// 按当前消耗量还需要等待的时间
    fn pending_delay(&self) -> Duration {
        let expected = Duration::from_secs_f64(self.consumed as f64 / self.max_rate as f64);
        expected.saturating_sub(self.started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_sleeps() {
        let mut limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.consume(10 * 1024 * 1024).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_paces_to_max_rate() {
        // 100KB/s，消耗 20KB 至少需要约 200ms
        let mut limiter = RateLimiter::new(100 * 1024);
        let start = Instant::now();
        for _ in 0..4 {
            limiter.consume(5 * 1024).await;
        }
        assert!(start.elapsed() >= Duration::from_millis(180));
    }
}
