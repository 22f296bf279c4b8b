//! 任务执行器
//!
//! 按提交顺序调度传输单元，同时运行的单元数不超过并发上限：
//! - 上限保存在原子变量里，运行中通过 [`ExecutorHandle::set_parallel`] 调整，只影响之后的调度
//! - 互斥键相同的单元串行执行，被占用时跳过、让后面的单元先走
//! - 可重试错误重新排到队尾并累计重试次数，`KeyBusy` 延后调度但不计次
//! - 进度存储故障后不再调度上传单元，`execute` 以该错误返回
//!
//! 执行器本身不做任何网络 I/O。

use super::task::{
    FailedUnit, TransferUnit, UnitContext, UnitKind, UnitOutcome, UnitRecord, UnitStatus,
};
use crate::common::statistic::{Statistic, TransferReporter};
use crate::error::TransferError;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认并发数
pub const DEFAULT_PARALLEL: usize = 4;

/// 默认单元级最大重试次数
pub const DEFAULT_MAX_RETRY: u32 = 3;

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub parallel: usize,
    /// 单元级重试前的等待
    pub retry_backoff: Duration,
    /// 单次运行的时限，None 表示不限
    pub unit_timeout: Option<Duration>,
    /// 按计划字节数从小到大调度
    pub small_first: bool,
    /// 互斥键被外部占用时的重新调度间隔
    pub key_busy_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallel: DEFAULT_PARALLEL,
            retry_backoff: Duration::from_millis(1000),
            unit_timeout: None,
            small_first: false,
            key_busy_delay: Duration::from_millis(500),
        }
    }
}

/// 批次汇总
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub rapid: usize,
    pub skipped: usize,
    pub transferred_bytes: u64,
    pub elapsed: Duration,
}

/// 运行中控制执行器的句柄，可跨任务克隆
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    parallel: Arc<AtomicUsize>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
    unit_tokens: Arc<DashMap<String, CancellationToken>>,
}

impl ExecutorHandle {
    /// 调整并发上限（最小为 1）
    pub fn set_parallel(&self, n: usize) {
        let n = if n == 0 {
            warn!("并发数不能为 0，按 1 处理");
            1
        } else {
            n
        };
        let old = self.parallel.swap(n, Ordering::SeqCst);
        if old != n {
            info!("调整并发上限: {} -> {}", old, n);
        }
        self.wake.notify_one();
    }

    pub fn parallel(&self) -> usize {
        self.parallel.load(Ordering::SeqCst)
    }

    /// 取消整个批次：运行中的单元被中断，排队的单元进入失败队列，进度记录保留
    pub fn cancel(&self) {
        info!("取消传输批次");
        self.cancel.cancel();
        self.wake.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 取消单个单元，并清理其可续传状态
    ///
    /// # 返回
    /// 单元是否存在且尚未结束
    pub fn cancel_unit(&self, id: &str) -> bool {
        match self.unit_tokens.get(id) {
            Some(token) => {
                info!("取消传输单元: {}", id);
                token.cancel();
                self.wake.notify_one();
                true
            }
            None => false,
        }
    }
}

struct QueuedUnit {
    unit: Box<dyn TransferUnit>,
    retry_count: u32,
    max_retry: u32,
    not_before: Option<Instant>,
    cancel: CancellationToken,
}

struct Finished {
    queued: QueuedUnit,
    result: Result<UnitOutcome, TransferError>,
}

/// 任务执行器
pub struct TaskExecutor {
    config: ExecutorConfig,
    handle: ExecutorHandle,
    statistic: Arc<Statistic>,
    pending: VecDeque<QueuedUnit>,
    failed: Vec<FailedUnit>,
    records: Vec<UnitRecord>,
    /// 当前批次是否已经开始累计统计
    batch_open: bool,
    /// 进度存储故障，存在时拒绝新的上传单元
    store_fault: Option<TransferError>,
}

impl TaskExecutor {
    pub fn new(config: ExecutorConfig, statistic: Arc<Statistic>) -> Self {
        let parallel = config.parallel.max(1);
        info!("创建任务执行器: 并发上限 {}", parallel);
        Self {
            handle: ExecutorHandle {
                parallel: Arc::new(AtomicUsize::new(parallel)),
                wake: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
                unit_tokens: Arc::new(DashMap::new()),
            },
            config,
            statistic,
            pending: VecDeque::new(),
            failed: Vec::new(),
            records: Vec::new(),
            batch_open: false,
            store_fault: None,
        }
    }

    /// 提交单元
    ///
    /// # 参数
    /// * `unit` - 传输单元
    /// * `max_retry` - 单元级最大重试次数
    pub fn submit(&mut self, unit: Box<dyn TransferUnit>, max_retry: u32) {
        if !self.batch_open {
            self.statistic.reset();
            self.records.clear();
            self.batch_open = true;
        }

        if unit.kind() == UnitKind::Upload {
            if let Some(fault) = self.store_fault.clone() {
                warn!("进度存储故障未解除，拒绝上传单元: id={}", unit.id());
                let queued = QueuedUnit {
                    unit,
                    retry_count: 0,
                    max_retry,
                    not_before: None,
                    cancel: CancellationToken::new(),
                };
                let mut discarded = BatchSummary::default();
                self.fail(queued, fault, &mut discarded);
                return;
            }
        }

        self.statistic.add_planned(unit.planned_bytes());
        let cancel = self.handle.cancel.child_token();
        self.handle
            .unit_tokens
            .insert(unit.id().to_string(), cancel.clone());

        debug!(
            "提交{}单元: id={}, local={:?}, remote={}, planned={} bytes",
            unit.kind(),
            unit.id(),
            unit.local_path(),
            unit.remote_path(),
            unit.planned_bytes()
        );

        self.pending.push_back(QueuedUnit {
            unit,
            retry_count: 0,
            max_retry,
            not_before: None,
            cancel,
        });
    }

    pub fn set_parallel(&self, n: usize) {
        self.handle.set_parallel(n);
    }

    pub fn handle(&self) -> ExecutorHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn cancel_unit(&self, id: &str) -> bool {
        self.handle.cancel_unit(id)
    }

    pub fn statistic(&self) -> Arc<Statistic> {
        Arc::clone(&self.statistic)
    }

    /// 最近一次批次遇到的进度存储故障
    pub fn store_fault(&self) -> Option<&TransferError> {
        self.store_fault.as_ref()
    }

    /// 存储恢复后重新允许提交上传单元
    pub fn clear_store_fault(&mut self) {
        self.store_fault = None;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 失败队列
    pub fn failed_set(&self) -> &[FailedUnit] {
        &self.failed
    }

    /// 取出失败队列（可重新提交）
    pub fn drain_failed(&mut self) -> Vec<FailedUnit> {
        std::mem::take(&mut self.failed)
    }

    /// 本批次已结束单元的报告，按结束顺序排列
    pub fn records(&self) -> &[UnitRecord] {
        &self.records
    }

    /// 执行队列直到所有单元结束
    ///
    /// # 返回
    /// - `Ok(BatchSummary)` - 所有单元已结束（失败的单元在失败队列中）
    /// - `Err(ProgressStore)` - 进度存储故障，上传单元已全部转入失败队列
    pub async fn execute(&mut self) -> Result<BatchSummary, TransferError> {
        let started = std::time::Instant::now();

        if self.config.small_first {
            self.pending
                .make_contiguous()
                .sort_by_key(|q| q.unit.planned_bytes());
        }

        info!(
            "开始执行传输批次: {} 个单元, 并发上限 {}",
            self.pending.len(),
            self.handle.parallel()
        );

        let reporter: Arc<dyn TransferReporter> = self.statistic.clone();
        let batch_cancel = self.handle.cancel.clone();
        let wake = Arc::clone(&self.handle.wake);
        let mut join_set: JoinSet<Finished> = JoinSet::new();
        let mut running_keys: HashSet<String> = HashSet::new();
        let mut fatal: Option<TransferError> = None;
        let mut summary = BatchSummary::default();

        loop {
            if batch_cancel.is_cancelled() {
                self.fail_pending(&mut summary, |_| true, &TransferError::Cancelled);
            } else {
                self.dispatch(&mut join_set, &mut running_keys, &reporter);
            }

            if join_set.is_empty() && self.pending.is_empty() {
                break;
            }

            let next_due = self.pending.iter().filter_map(|q| q.not_before).min();

            tokio::select! {
                Some(joined) = join_set.join_next() => match joined {
                    Ok(finished) => {
                        self.settle(finished, &mut running_keys, &mut fatal, &mut summary);
                    }
                    Err(e) => error!("传输单元任务异常退出: {}", e),
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {}
                _ = wake.notified() => {}
                _ = batch_cancel.cancelled(), if !batch_cancel.is_cancelled() => {}
            }
        }

        self.batch_open = false;
        summary.elapsed = started.elapsed();

        info!(
            "传输批次结束: 成功 {}（秒传 {}，跳过 {}），失败 {}，传输 {} bytes，耗时 {:.1}s",
            summary.succeeded,
            summary.rapid,
            summary.skipped,
            summary.failed,
            summary.transferred_bytes,
            summary.elapsed.as_secs_f64()
        );

        match fatal {
            Some(e) => {
                self.store_fault = Some(e.clone());
                Err(e)
            }
            None => Ok(summary),
        }
    }

    /// 在并发上限内按队列顺序启动可运行的单元
    fn dispatch(
        &mut self,
        join_set: &mut JoinSet<Finished>,
        running_keys: &mut HashSet<String>,
        reporter: &Arc<dyn TransferReporter>,
    ) {
        let now = Instant::now();
        let mut i = 0;

        while join_set.len() < self.handle.parallel() && i < self.pending.len() {
            let candidate = &self.pending[i];
            let due = candidate.not_before.map_or(true, |t| t <= now);
            let key = candidate.unit.exclusive_key();
            let key_free = key.as_ref().map_or(true, |k| !running_keys.contains(k));

            if !due || !key_free {
                i += 1;
                continue;
            }

            let Some(queued) = self.pending.remove(i) else {
                break;
            };
            if let Some(k) = key {
                running_keys.insert(k);
            }

            debug!(
                "启动{}单元: id={}, 第 {} 次尝试",
                queued.unit.kind(),
                queued.unit.id(),
                queued.retry_count + 1
            );

            let ctx = UnitContext::new(Arc::clone(reporter), queued.cancel.clone());
            let batch_cancel = self.handle.cancel.clone();
            let timeout = self.config.unit_timeout;
            join_set.spawn(run_unit(queued, ctx, batch_cancel, timeout));
        }
    }

    /// 处理一个结束的单元
    fn settle(
        &mut self,
        finished: Finished,
        running_keys: &mut HashSet<String>,
        fatal: &mut Option<TransferError>,
        summary: &mut BatchSummary,
    ) {
        let Finished { mut queued, result } = finished;
        if let Some(k) = queued.unit.exclusive_key() {
            running_keys.remove(&k);
        }

        let error = match result {
            Ok(outcome) => {
                info!(
                    "{}单元完成: id={}, 传输 {} bytes{}{}",
                    queued.unit.kind(),
                    queued.unit.id(),
                    outcome.transferred_bytes,
                    if outcome.rapid { "（秒传）" } else { "" },
                    if outcome.skipped { "（跳过）" } else { "" }
                );
                summary.succeeded += 1;
                summary.transferred_bytes += outcome.transferred_bytes;
                if outcome.rapid {
                    summary.rapid += 1;
                }
                if outcome.skipped {
                    summary.skipped += 1;
                }
                self.handle.unit_tokens.remove(queued.unit.id());
                self.records.push(make_record(&queued, UnitStatus::Succeeded, Some(outcome), None));
                return;
            }
            Err(e) => e,
        };

        let uploads_stopped = fatal.is_some() && queued.unit.kind() == UnitKind::Upload;
        let cancelled = queued.cancel.is_cancelled();

        if error.is_fatal_to_batch() {
            error!(
                "进度存储故障，停止调度上传单元: id={}, {}",
                queued.unit.id(),
                error
            );
            if fatal.is_none() {
                *fatal = Some(error.clone());
            }
            self.fail(queued, error.clone(), summary);
            self.fail_pending(summary, |q| q.unit.kind() == UnitKind::Upload, &error);
            return;
        }

        if uploads_stopped {
            let reason = fatal.clone().unwrap_or(error);
            self.fail(queued, reason, summary);
            return;
        }

        if error.is_deferred() && !cancelled {
            debug!("互斥键被占用，延后调度: id={}", queued.unit.id());
            queued.not_before = Some(Instant::now() + self.config.key_busy_delay);
            self.pending.push_back(queued);
            return;
        }

        if error.is_retryable() && !cancelled && queued.retry_count < queued.max_retry {
            queued.retry_count += 1;
            warn!(
                "{}单元失败，准备第 {}/{} 次重试: id={}, {}",
                queued.unit.kind(),
                queued.retry_count,
                queued.max_retry,
                queued.unit.id(),
                error
            );
            queued.not_before = Some(Instant::now() + self.config.retry_backoff);
            self.pending.push_back(queued);
            return;
        }

        self.fail(queued, error, summary);
    }

    fn fail(&mut self, queued: QueuedUnit, error: TransferError, summary: &mut BatchSummary) {
        if matches!(error, TransferError::Cancelled) {
            info!("{}单元已取消: id={}", queued.unit.kind(), queued.unit.id());
        } else {
            error!(
                "{}单元失败: id={}, 重试 {} 次, {}",
                queued.unit.kind(),
                queued.unit.id(),
                queued.retry_count,
                error
            );
        }
        summary.failed += 1;
        self.handle.unit_tokens.remove(queued.unit.id());
        self.records.push(make_record(
            &queued,
            UnitStatus::Failed,
            None,
            Some(error.clone()),
        ));
        self.failed.push(FailedUnit {
            unit: queued.unit,
            retry_count: queued.retry_count,
            max_retry: queued.max_retry,
            error,
        });
    }

    /// 把满足条件的排队单元直接转入失败队列
    fn fail_pending<F>(&mut self, summary: &mut BatchSummary, pred: F, error: &TransferError)
    where
        F: Fn(&QueuedUnit) -> bool,
    {
        let (matched, kept): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|q| pred(q));
        self.pending = kept.into();
        for queued in matched {
            self.fail(queued, error.clone(), summary);
        }
    }
}

fn make_record(
    queued: &QueuedUnit,
    status: UnitStatus,
    outcome: Option<UnitOutcome>,
    error: Option<TransferError>,
) -> UnitRecord {
    UnitRecord {
        id: queued.unit.id().to_string(),
        kind: queued.unit.kind(),
        local_path: queued.unit.local_path().to_path_buf(),
        remote_path: queued.unit.remote_path().to_string(),
        status,
        retry_count: queued.retry_count,
        outcome,
        error,
    }
}

/// 工作槽：运行一次单元，处理时限、取消和 panic
async fn run_unit(
    mut queued: QueuedUnit,
    ctx: UnitContext,
    batch_cancel: CancellationToken,
    timeout: Option<Duration>,
) -> Finished {
    let result = if queued.cancel.is_cancelled() {
        Err(TransferError::Cancelled)
    } else {
        let cancel = queued.cancel.clone();
        let attempt = AssertUnwindSafe(run_with_deadline(queued.unit.as_mut(), &ctx, timeout))
            .catch_unwind();
        tokio::select! {
            r = attempt => r.unwrap_or_else(|_| {
                Err(TransferError::Remote {
                    errno: -1,
                    message: "传输单元执行时发生 panic".to_string(),
                })
            }),
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
        }
    };

    // 单元被单独取消时清理续传状态；整批取消时保留，便于下次续传
    if matches!(result, Err(TransferError::Cancelled))
        && queued.cancel.is_cancelled()
        && !batch_cancel.is_cancelled()
    {
        queued.unit.abandon().await;
    }

    Finished { queued, result }
}

async fn run_with_deadline(
    unit: &mut dyn TransferUnit,
    ctx: &UnitContext,
    timeout: Option<Duration>,
) -> Result<UnitOutcome, TransferError> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, unit.run(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::NetworkExhausted(format!(
                "单元运行超过时限 {}ms",
                limit.as_millis()
            ))),
        },
        None => unit.run(ctx).await,
    }
}
