//! 上传单元
//!
//! 一次运行的流程：
//! 1. 获取进度键租约，检查本地文件未变化
//! 2. 远端冲突预检（跳过 / 报错 / 同内容跳过）
//! 3. 秒传查询，命中则直接完成
//! 4. 从进度记录恢复（或新建记录），逐片上传并在每片确认后落盘
//! 5. 提交合并文件，删除进度记录

use super::chunk::{read_slice, SliceUploader, DEFAULT_UPLOAD_SLICE_SIZE};
use crate::common::range::{ChunkingPolicy, RangeList};
use crate::common::rate_limiter::RateLimiter;
use crate::common::retry::{with_chunk_retry, DEFAULT_CHUNK_RETRIES};
use crate::common::signature::{digest_bytes, ContentSignature, SignatureEngine};
use crate::error::TransferError;
use crate::executor::{TransferUnit, UnitContext, UnitKind, UnitOutcome};
use crate::netdisk::{ConflictPolicy, DedupResponse, TransferSession};
use crate::persistence::{ProgressKey, ProgressStore, UploadProgressRecord};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 上传选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// 分片大小，同时也是签名 block_list 的分片大小
    pub slice_size: u64,
    pub chunk_retries: u32,
    /// 单元限速（字节/秒），0 表示不限
    pub max_rate: u64,
    /// 禁用秒传
    pub no_rapid_upload: bool,
    pub conflict: ConflictPolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            slice_size: DEFAULT_UPLOAD_SLICE_SIZE,
            chunk_retries: DEFAULT_CHUNK_RETRIES,
            max_rate: 0,
            no_rapid_upload: false,
            conflict: ConflictPolicy::Overwrite,
        }
    }
}

/// 上传单元
pub struct UploadUnit {
    id: String,
    session: Arc<dyn TransferSession>,
    store: ProgressStore,
    local_path: PathBuf,
    remote_path: String,
    signature: ContentSignature,
    key: ProgressKey,
    options: UploadOptions,
}

impl std::fmt::Debug for UploadUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadUnit")
            .field("id", &self.id)
            .field("local_path", &self.local_path)
            .field("remote_path", &self.remote_path)
            .field("file_size", &self.signature.file_size)
            .field("key", &self.key)
            .finish()
    }
}

impl UploadUnit {
    /// 规划上传：计算内容签名并派生进度键
    ///
    /// # 参数
    /// * `session` - 网盘会话
    /// * `store` - 上传进度存储
    /// * `local_path` - 本地文件路径
    /// * `remote_path` - 网盘目标路径
    /// * `options` - 上传选项
    pub async fn plan(
        session: Arc<dyn TransferSession>,
        store: ProgressStore,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        options: UploadOptions,
    ) -> Result<Self, TransferError> {
        let local_path = local_path.into();
        let remote_path = remote_path.into();

        let signature = SignatureEngine::compute(&local_path, options.slice_size).await?;
        let key = ProgressKey::derive(&local_path, &signature.whole_digest, signature.file_size);

        info!(
            "上传规划完成: {:?} -> {}, 大小 {} bytes, {} 个分片, md5={}",
            local_path,
            remote_path,
            signature.file_size,
            signature.slice_count(),
            signature.whole_digest
        );

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            session,
            store,
            local_path,
            remote_path,
            signature,
            key,
            options,
        })
    }

    pub fn progress_key(&self) -> &ProgressKey {
        &self.key
    }

    pub fn signature(&self) -> &ContentSignature {
        &self.signature
    }

    /// 远端冲突预检
    ///
    /// # 返回
    /// `true` 表示应跳过本次上传
    async fn precheck_remote(&self) -> Result<bool, TransferError> {
        let policy = self.options.conflict;
        if matches!(policy, ConflictPolicy::Overwrite | ConflictPolicy::Rename) {
            return Ok(false);
        }

        let Some(meta) = self.session.file_meta(&self.remote_path).await? else {
            return Ok(false);
        };

        match policy {
            ConflictPolicy::Skip => {
                info!("网盘文件已存在，跳过: {}", self.remote_path);
                Ok(true)
            }
            ConflictPolicy::Fail => Err(TransferError::RemoteConflict(self.remote_path.clone())),
            ConflictPolicy::Rsync => {
                let same_digest = meta
                    .md5
                    .as_deref()
                    .map(|m| m.eq_ignore_ascii_case(&self.signature.whole_digest))
                    .unwrap_or(false);
                if meta.size == self.signature.file_size && same_digest {
                    info!("网盘文件内容一致，跳过: {}", self.remote_path);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            ConflictPolicy::Overwrite | ConflictPolicy::Rename => Ok(false),
        }
    }

    /// 加载可续传的进度记录，布局不一致的记录会被丢弃
    fn load_resumable(&self) -> Result<Option<UploadProgressRecord>, TransferError> {
        let Some(record) = self.store.load(&self.key)? else {
            return Ok(None);
        };

        match record.validate_against(
            self.signature.file_size,
            self.signature.slice_size,
            self.signature.slice_count(),
        ) {
            Ok(()) => Ok(Some(record)),
            Err(e) => {
                warn!("丢弃无法续传的进度记录 key={}: {}，从第 0 片重新上传", self.key, e);
                self.store.delete(&self.key)?;
                Ok(None)
            }
        }
    }

    /// 确认本地文件在规划后没有变化
    async fn ensure_unchanged(&self) -> Result<(), TransferError> {
        let size = tokio::fs::metadata(&self.local_path).await?.len();
        if size != self.signature.file_size {
            return Err(TransferError::Integrity(format!(
                "本地文件在上传前已变化: {:?}, 规划时 {} bytes, 当前 {} bytes",
                self.local_path, self.signature.file_size, size
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransferUnit for UploadUnit {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Upload
    }

    fn local_path(&self) -> &Path {
        &self.local_path
    }

    fn remote_path(&self) -> &str {
        &self.remote_path
    }

    fn planned_bytes(&self) -> u64 {
        self.signature.file_size
    }

    fn exclusive_key(&self) -> Option<String> {
        Some(format!("upload:{}", self.key))
    }

    async fn run(&mut self, ctx: &UnitContext) -> Result<UnitOutcome, TransferError> {
        if ctx.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let _lease = self
            .store
            .try_lease(&self.key)
            .ok_or_else(|| TransferError::KeyBusy(self.key.to_string()))?;

        self.ensure_unchanged().await?;

        if self.precheck_remote().await? {
            return Ok(UnitOutcome::skipped());
        }

        let allow_rapid = !self.options.no_rapid_upload;
        let fresh_upload_id = match self
            .session
            .dedup_query(
                &self.remote_path,
                &self.signature,
                self.options.conflict,
                allow_rapid,
            )
            .await?
        {
            DedupResponse::Rapid(meta) => {
                info!("秒传成功: {:?} -> {}", self.local_path, meta.path);
                self.store.delete(&self.key)?;
                return Ok(UnitOutcome::rapid());
            }
            DedupResponse::Session { upload_id } => upload_id,
        };

        let mut record = match self.load_resumable()? {
            Some(record) => {
                info!(
                    "从进度记录恢复上传: {:?}, 会话 {}, 已完成 {}/{} 片",
                    self.local_path,
                    record.remote_session_id,
                    record.completed_slices.len(),
                    record.slice_count
                );
                record
            }
            None => {
                let record = UploadProgressRecord::new(
                    self.key.clone(),
                    self.local_path.clone(),
                    self.remote_path.clone(),
                    fresh_upload_id,
                    self.signature.file_size,
                    self.signature.slice_size,
                    self.signature.slice_count(),
                );
                self.store.persist(&record).await?;
                record
            }
        };
        let upload_id = record.remote_session_id.clone();

        let slices = RangeList::new(
            self.signature.file_size,
            ChunkingPolicy::BlockSize(self.signature.slice_size),
        )?;
        let pending: Vec<_> = slices.pending(&record.completed_slices).cloned().collect();
        debug!(
            "待上传分片 {} 个, 共 {} bytes",
            pending.len(),
            slices.pending_bytes(&record.completed_slices)
        );

        let uploader = SliceUploader {
            session: self.session.as_ref(),
            remote_path: &self.remote_path,
            upload_id: &upload_id,
            cancel: &ctx.cancel,
            chunk_retries: self.options.chunk_retries,
        };
        let mut limiter = RateLimiter::new(self.options.max_rate);
        let mut transferred = 0u64;

        for range in &pending {
            if ctx.is_cancelled() {
                return Err(TransferError::Cancelled);
            }

            let expected = self
                .signature
                .slice_digests
                .get(range.index)
                .map(|s| s.digest.clone())
                .ok_or_else(|| {
                    TransferError::Integrity(format!("缺少分片 #{} 的摘要", range.index))
                })?;
            let data = read_slice(&self.local_path, range).await?;
            if !digest_bytes(&data).eq_ignore_ascii_case(&expected) {
                return Err(TransferError::Integrity(format!(
                    "本地文件在规划后已变化: {:?}, 分片 #{} 内容与签名不一致，需要重新规划",
                    self.local_path, range.index
                )));
            }
            uploader.upload(range.index, &data, &expected).await?;

            record.mark_completed(range.index);
            self.store.persist(&record).await?;

            ctx.reporter.on_transferred(range.length);
            transferred += range.length;
            limiter.consume(range.length).await;
        }

        let session = self.session.as_ref();
        let remote_path = self.remote_path.as_str();
        let signature = &self.signature;
        let conflict = self.options.conflict;
        let meta = with_chunk_retry("提交文件", self.options.chunk_retries, &ctx.cancel, |_| {
            session.commit(remote_path, &upload_id, signature, conflict)
        })
        .await?;

        if let Err(e) = self.store.delete(&self.key) {
            warn!("上传已完成但删除进度记录失败 key={}: {}", self.key, e);
        }

        info!(
            "上传完成: {:?} -> {}, 本次传输 {} bytes",
            self.local_path, meta.path, transferred
        );
        Ok(UnitOutcome::transferred(transferred))
    }

    async fn abandon(&mut self) {
        match self.store.delete(&self.key) {
            Ok(true) => info!("已取消上传并清除进度记录: {:?}", self.local_path),
            Ok(false) => {}
            Err(e) => warn!("清除进度记录失败 key={}: {}", self.key, e),
        }
    }
}
