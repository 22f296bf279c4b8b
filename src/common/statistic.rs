//! 传输统计
//!
//! 批次级别的计划字节数与已传输字节数，全部使用原子操作，
//! 快照读取无锁，可在任意线程轮询。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// 传输单元向外汇报进度的窄接口
pub trait TransferReporter: Send + Sync {
    /// 增加计划字节数
    fn on_planned(&self, bytes: u64);
    /// 增加已传输字节数
    fn on_transferred(&self, bytes: u64);
}

/// 某一时刻的统计快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticSnapshot {
    pub planned: u64,
    pub transferred: u64,
    pub elapsed: Duration,
    /// 平均速率（字节/秒）
    pub rate: f64,
}

impl StatisticSnapshot {
    /// 完成百分比（计划为 0 时视为 100%）
    pub fn percent(&self) -> f64 {
        if self.planned == 0 {
            100.0
        } else {
            self.transferred as f64 * 100.0 / self.planned as f64
        }
    }
}

/// 统计收集器
#[derive(Debug)]
pub struct Statistic {
    planned: AtomicU64,
    transferred: AtomicU64,
    /// 计时原点
    origin: Instant,
    /// 批次开始时刻相对原点的毫秒数
    start_offset_ms: AtomicU64,
}

impl Default for Statistic {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistic {
    pub fn new() -> Self {
        Self {
            planned: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            origin: Instant::now(),
            start_offset_ms: AtomicU64::new(0),
        }
    }

    pub fn add_planned(&self, bytes: u64) {
        self.planned.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_transferred(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn planned(&self) -> u64 {
        self.planned.load(Ordering::Relaxed)
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        let start = Duration::from_millis(self.start_offset_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(start)
    }

    pub fn snapshot(&self) -> StatisticSnapshot {
        let planned = self.planned();
        let transferred = self.transferred();
        let elapsed = self.elapsed();
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            transferred as f64 / secs
        } else {
            0.0
        };
        StatisticSnapshot {
            planned,
            transferred,
            elapsed,
            rate,
        }
    }

    /// 清零计数并重新开始计时（新批次开始时调用）
    pub fn reset(&self) {
        self.planned.store(0, Ordering::Relaxed);
        self.transferred.store(0, Ordering::Relaxed);
        self.start_offset_ms
            .store(self.origin.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// 启动周期性进度日志任务，取消令牌触发后退出
    pub fn spawn_reporter(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let stat = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let snap = stat.snapshot();
                        info!(
                            "传输进度: {}/{} bytes ({:.1}%), 速度 {:.1} KB/s, 已用 {}s",
                            snap.transferred,
                            snap.planned,
                            snap.percent(),
                            snap.rate / 1024.0,
                            snap.elapsed.as_secs()
                        );
                    }
                }
            }
        })
    }
}

impl TransferReporter for Statistic {
    fn on_planned(&self, bytes: u64) {
        self.add_planned(bytes);
    }

    fn on_transferred(&self, bytes: u64) {
        self.add_transferred(bytes);
    }
}
