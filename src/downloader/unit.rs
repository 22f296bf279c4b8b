//! 下载单元
//!
//! 一次运行的流程：
//! 1. 本地冲突处理（覆盖 / 跳过 / 重命名 / 报错 / 同大小跳过）
//! 2. 查询网盘元信息，获取下载直链
//! 3. 按块大小切分区间，预分配目标文件
//! 4. 有限并发地拉取区间，逐段写入对应偏移
//! 5. 校验大小，可选校验 MD5

use super::chunk::{prepare_file, RangeFetcher};
use crate::common::range::{ChunkingPolicy, RangeList, RangeSpec, DEFAULT_BLOCK_SIZE};
use crate::common::rate_limiter::RateLimiter;
use crate::common::retry::DEFAULT_CHUNK_RETRIES;
use crate::common::signature::SignatureEngine;
use crate::error::TransferError;
use crate::executor::{TransferUnit, UnitContext, UnitKind, UnitOutcome};
use crate::netdisk::{resolve_local_destination, ConflictPolicy, RemoteFileMeta, TransferSession};
use crate::persistence::canonical_path;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 下载选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub block_size: u64,
    pub chunk_retries: u32,
    /// 单元限速（字节/秒），0 表示不限
    pub max_rate: u64,
    /// 下载完成后校验 MD5
    pub verify: bool,
    pub conflict: ConflictPolicy,
    /// 同时拉取的区间数
    pub range_parallel: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            max_rate: 0,
            verify: true,
            conflict: ConflictPolicy::Overwrite,
            range_parallel: 1,
        }
    }
}

/// 下载单元
pub struct DownloadUnit {
    id: String,
    session: Arc<dyn TransferSession>,
    remote_path: String,
    local_path: PathBuf,
    /// 冲突重命名后的实际目标（重试时沿用）
    destination: Option<PathBuf>,
    /// 冲突策略已生效，之后的重试不再检查本地文件
    conflict_resolved: bool,
    planned: u64,
    options: DownloadOptions,
}

impl std::fmt::Debug for DownloadUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadUnit")
            .field("id", &self.id)
            .field("remote_path", &self.remote_path)
            .field("local_path", &self.local_path)
            .field("planned", &self.planned)
            .finish()
    }
}

impl DownloadUnit {
    /// 创建下载单元
    ///
    /// # 参数
    /// * `session` - 网盘会话
    /// * `remote_path` - 网盘文件路径
    /// * `local_path` - 本地目标路径
    /// * `size_hint` - 已知的文件大小（未知时为 0，运行时按元信息补计）
    /// * `options` - 下载选项
    pub fn new(
        session: Arc<dyn TransferSession>,
        remote_path: impl Into<String>,
        local_path: impl Into<PathBuf>,
        size_hint: u64,
        options: DownloadOptions,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session,
            remote_path: remote_path.into(),
            local_path: local_path.into(),
            destination: None,
            conflict_resolved: false,
            planned: size_hint,
            options,
        }
    }

    /// 实际写入的本地路径
    pub fn destination(&self) -> &Path {
        self.destination.as_deref().unwrap_or(&self.local_path)
    }

    async fn remote_meta(&self) -> Result<RemoteFileMeta, TransferError> {
        let meta = self
            .session
            .file_meta(&self.remote_path)
            .await?
            .ok_or_else(|| TransferError::NotFound(self.remote_path.clone()))?;
        if meta.is_dir {
            return Err(TransferError::NotFound(format!(
                "{} 是目录，不能按文件下载",
                self.remote_path
            )));
        }
        Ok(meta)
    }

    /// 处理本地冲突
    ///
    /// 目标文件由首次尝试预分配，重试时本地文件是上次未写完的结果，不再按冲突处理
    ///
    /// # 返回
    /// `true` 表示应跳过本次下载
    async fn resolve_conflict(&mut self, meta: &RemoteFileMeta) -> Result<bool, TransferError> {
        if self.conflict_resolved || !self.local_path.exists() {
            return Ok(false);
        }

        match self.options.conflict {
            ConflictPolicy::Overwrite => Ok(false),
            ConflictPolicy::Skip => {
                info!("本地文件已存在，跳过: {:?}", self.local_path);
                Ok(true)
            }
            ConflictPolicy::Fail => Err(TransferError::LocalConflict(
                self.local_path.display().to_string(),
            )),
            ConflictPolicy::Rename => {
                let renamed = resolve_local_destination(&self.local_path);
                info!("本地文件已存在，另存为: {:?}", renamed);
                self.destination = Some(renamed);
                Ok(false)
            }
            ConflictPolicy::Rsync => {
                let local_size = tokio::fs::metadata(&self.local_path).await?.len();
                if local_size == meta.size {
                    info!(
                        "本地文件大小与网盘一致，跳过: {:?} ({} bytes)",
                        self.local_path, local_size
                    );
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn verify(&self, path: &Path, meta: &RemoteFileMeta) -> Result<(), TransferError> {
        let actual_size = tokio::fs::metadata(path).await?.len();
        if actual_size != meta.size {
            return Err(TransferError::Integrity(format!(
                "文件大小不一致: 预期 {} 实际 {}",
                meta.size, actual_size
            )));
        }

        if !self.options.verify {
            return Ok(());
        }
        match &meta.md5 {
            Some(expected) => {
                let actual = SignatureEngine::file_digest(path).await?;
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(TransferError::Integrity(format!(
                        "MD5 不一致: 预期 {} 实际 {}",
                        expected, actual
                    )));
                }
                debug!("MD5 校验通过: {:?}", path);
            }
            None => warn!("网盘未提供 MD5，跳过内容校验: {}", self.remote_path),
        }
        Ok(())
    }
}

#[async_trait]
impl TransferUnit for DownloadUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Download
    }

    fn local_path(&self) -> &Path {
        &self.local_path
    }

    fn remote_path(&self) -> &str {
        &self.remote_path
    }

    fn planned_bytes(&self) -> u64 {
        self.planned
    }

    fn exclusive_key(&self) -> Option<String> {
        Some(format!(
            "download:{}",
            canonical_path(&self.local_path).display()
        ))
    }

    async fn run(&mut self, ctx: &UnitContext) -> Result<UnitOutcome, TransferError> {
        if ctx.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let meta = self.remote_meta().await?;
        if meta.size > self.planned {
            ctx.reporter.on_planned(meta.size - self.planned);
            self.planned = meta.size;
        }

        if self.resolve_conflict(&meta).await? {
            return Ok(UnitOutcome::skipped());
        }
        self.conflict_resolved = true;

        let link = self.session.locate_download(&self.remote_path).await?;
        let ranges = RangeList::new(meta.size, ChunkingPolicy::BlockSize(self.options.block_size))?;
        let output = self.destination().to_path_buf();

        info!(
            "开始下载: {} -> {:?}, 大小 {} bytes, {} 个区间",
            self.remote_path,
            output,
            meta.size,
            ranges.len()
        );

        prepare_file(&output, meta.size).await?;

        let limiter = Mutex::new(RateLimiter::new(self.options.max_rate));
        let fetcher = RangeFetcher {
            session: self.session.as_ref(),
            link: &link,
            output_path: &output,
            limiter: &limiter,
            reporter: ctx.reporter.as_ref(),
            cancel: &ctx.cancel,
            chunk_retries: self.options.chunk_retries,
        };

        let fetcher = &fetcher;
        let pending: Vec<RangeSpec> = ranges.iter().copied().collect();
        let transferred: u64 = futures::stream::iter(pending)
            .map(move |range| async move { fetcher.fetch(&range).await })
            .buffer_unordered(self.options.range_parallel.max(1))
            .try_fold(0u64, |acc, n| async move { Ok(acc + n) })
            .await?;

        self.verify(&output, &meta).await?;

        info!("下载完成: {:?}, {} bytes", output, transferred);
        Ok(UnitOutcome::transferred(transferred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::statistic::Statistic;
    use crate::executor::{ExecutorConfig, TaskExecutor};
    use crate::netdisk::mock::MockSession;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn context() -> (UnitContext, Arc<Statistic>) {
        let stat = Arc::new(Statistic::new());
        (UnitContext::new(stat.clone(), CancellationToken::new()), stat)
    }

    fn options(conflict: ConflictPolicy) -> DownloadOptions {
        DownloadOptions {
            block_size: 1000,
            range_parallel: 3,
            conflict,
            ..DownloadOptions::default()
        }
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_download_multi_range() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(MockSession::new());
        let data = content(10_007);
        session.put_file("/movies/a.mkv", data.clone());

        let local = dir.path().join("a.mkv");
        let mut unit = DownloadUnit::new(
            session.clone(),
            "/movies/a.mkv",
            &local,
            0,
            options(ConflictPolicy::Overwrite),
        );
        let (ctx, stat) = context();

        let outcome = unit.run(&ctx).await.unwrap();
        assert_eq!(outcome.transferred_bytes, 10_007);
        assert_eq!(std::fs::read(&local).unwrap(), data);
        assert_eq!(stat.planned(), 10_007);
        assert_eq!(stat.transferred(), 10_007);
        assert_eq!(unit.planned_bytes(), 10_007);
    }

    #[tokio::test]
    async fn test_download_empty_file() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(MockSession::new());
        session.put_file("/empty.txt", Vec::new());

        let local = dir.path().join("empty.txt");
        let mut unit = DownloadUnit::new(
            session.clone(),
            "/empty.txt",
            &local,
            0,
            options(ConflictPolicy::Overwrite),
        );
        let (ctx, _) = context();

        let outcome = unit.run(&ctx).await.unwrap();
        assert_eq!(outcome.transferred_bytes, 0);
        assert_eq!(std::fs::metadata(&local).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_missing_remote_is_not_found() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(MockSession::new());
        let mut unit = DownloadUnit::new(
            session,
            "/nope",
            dir.path().join("nope"),
            0,
            DownloadOptions::default(),
        );
        let (ctx, _) = context();
        assert!(matches!(
            unit.run(&ctx).await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_conflict_policies() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(MockSession::new());
        session.put_file("/doc.txt", b"remote".to_vec());
        let local = dir.path().join("doc.txt");
        std::fs::write(&local, b"local!").unwrap();
        let (ctx, _) = context();

        let mut fail = DownloadUnit::new(
            session.clone(),
            "/doc.txt",
            &local,
            0,
            options(ConflictPolicy::Fail),
        );
        assert!(matches!(
            fail.run(&ctx).await,
            Err(TransferError::LocalConflict(_))
        ));

        let mut skip = DownloadUnit::new(
            session.clone(),
            "/doc.txt",
            &local,
            0,
            options(ConflictPolicy::Skip),
        );
        assert!(skip.run(&ctx).await.unwrap().skipped);

        // 大小相同（都是 6 字节），rsync 跳过
        let mut rsync = DownloadUnit::new(
            session.clone(),
            "/doc.txt",
            &local,
            0,
            options(ConflictPolicy::Rsync),
        );
        assert!(rsync.run(&ctx).await.unwrap().skipped);
        assert_eq!(std::fs::read(&local).unwrap(), b"local!");

        let mut rename = DownloadUnit::new(
            session.clone(),
            "/doc.txt",
            &local,
            0,
            options(ConflictPolicy::Rename),
        );
        rename.run(&ctx).await.unwrap();
        let renamed = dir.path().join("doc (1).txt");
        assert_eq!(rename.destination(), renamed.as_path());
        assert_eq!(std::fs::read(&renamed).unwrap(), b"remote");
        assert_eq!(std::fs::read(&local).unwrap(), b"local!");

        let mut overwrite = DownloadUnit::new(
            session.clone(),
            "/doc.txt",
            &local,
            0,
            options(ConflictPolicy::Overwrite),
        );
        overwrite.run(&ctx).await.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"remote");
    }

    #[tokio::test]
    async fn test_expired_link_recovers_on_rerun() {
        let dir = TempDir::new().unwrap();
        let session = Arc::new(MockSession::new());
        let data = content(3000);
        session.put_file("/a.bin", data.clone());
        session.fail_next_fetch(TransferError::LinkExpired("403".to_string()));

        let local = dir.path().join("a.bin");
        let mut unit = DownloadUnit::new(
            session.clone(),
            "/a.bin",
            &local,
            3000,
            DownloadOptions {
                block_size: 1000,
                ..DownloadOptions::default()
            },
        );
        let (ctx, _) = context();

        assert!(matches!(
            unit.run(&ctx).await,
            Err(TransferError::LinkExpired(_))
        ));
        unit.run(&ctx).await.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), data);
        assert_eq!(
            session
                .locate_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            2
        );
    }

    #[tokio::test]
    async fn test_exclusive_key_uses_local_path() {
        let session = Arc::new(MockSession::new());
        let a = DownloadUnit::new(
            session.clone(),
            "/x",
            "/tmp/same-target.bin",
            0,
            DownloadOptions::default(),
        );
        let b = DownloadUnit::new(
            session,
            "/y",
            "/tmp/same-target.bin",
            0,
            DownloadOptions::default(),
        );
        assert_eq!(a.exclusive_key(), b.exclusive_key());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_executor_retry_keeps_conflict_decision() {
        for policy in [ConflictPolicy::Rsync, ConflictPolicy::Skip, ConflictPolicy::Fail] {
            let dir = TempDir::new().unwrap();
            let session = Arc::new(MockSession::new());
            let data = content(3000);
            session.put_file("/a.bin", data.clone());
            session.fail_next_fetch(TransferError::LinkExpired("403".to_string()));

            let local = dir.path().join("a.bin");
            let unit = DownloadUnit::new(session.clone(), "/a.bin", &local, 3000, options(policy));
            let config = ExecutorConfig {
                retry_backoff: Duration::from_millis(5),
                ..ExecutorConfig::default()
            };
            let mut executor = TaskExecutor::new(config, Arc::new(Statistic::new()));
            executor.submit(Box::new(unit), 3);

            // 首次尝试留下的预分配文件不能被当成本地冲突
            let summary = executor.execute().await.unwrap();
            assert_eq!(summary.succeeded, 1, "{:?}", policy);
            assert_eq!(summary.skipped, 0, "{:?}", policy);
            assert_eq!(std::fs::read(&local).unwrap(), data, "{:?}", policy);
            assert_eq!(executor.records()[0].retry_count, 1, "{:?}", policy);
        }
    }
}
