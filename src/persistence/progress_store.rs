//! 上传进度存储
//!
//! ## 目录布局
//!
//! ```text
//! {progress_dir}/
//!   {key}.json       # 进度记录
//!   {key}.json.tmp   # 写入中的临时文件（重命名前）
//! ```
//!
//! 每次更新都是"写临时文件 + fsync + rename + 目录 fsync"，进程在任意时刻中断，
//! 磁盘上留下的要么是旧记录，要么是新记录。

use super::types::{ProgressKey, UploadProgressRecord};
use crate::error::TransferError;
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "json.tmp";

/// 进度存储
#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
    leases: Arc<DashMap<ProgressKey, ()>>,
}

/// 键租约，Drop 时自动释放
#[derive(Debug)]
pub struct KeyLease {
    key: ProgressKey,
    leases: Arc<DashMap<ProgressKey, ()>>,
}

impl KeyLease {
    pub fn key(&self) -> &ProgressKey {
        &self.key
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        self.leases.remove(&self.key);
    }
}

fn store_error(action: &str, path: &Path, e: impl std::fmt::Display) -> TransferError {
    TransferError::ProgressStore(format!("{} {:?}: {}", action, path, e))
}

impl ProgressStore {
    /// 打开（必要时创建）进度目录
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| store_error("创建进度目录失败", &dir, e))?;
        debug!("进度存储目录: {:?}", dir);
        Ok(Self {
            dir,
            leases: Arc::new(DashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, key: &ProgressKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, RECORD_EXTENSION))
    }

    fn temp_path(&self, key: &ProgressKey) -> PathBuf {
        self.dir.join(format!("{}.{}", key, TEMP_EXTENSION))
    }

    /// 尝试获取键租约，已被其他单元持有时返回 None
    pub fn try_lease(&self, key: &ProgressKey) -> Option<KeyLease> {
        use dashmap::mapref::entry::Entry;
        match self.leases.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                v.insert(());
                Some(KeyLease {
                    key: key.clone(),
                    leases: Arc::clone(&self.leases),
                })
            }
        }
    }

    pub fn is_leased(&self, key: &ProgressKey) -> bool {
        self.leases.contains_key(key)
    }

    /// 加载进度记录
    ///
    /// # 返回
    /// - `Ok(Some)` - 记录存在且格式正确
    /// - `Ok(None)` - 记录不存在，或已损坏（损坏文件会被删除）
    /// - `Err(ProgressStore)` - 读取本身失败
    pub fn load(&self, key: &ProgressKey) -> Result<Option<UploadProgressRecord>, TransferError> {
        let path = self.record_path(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error("读取进度记录失败", &path, e)),
        };

        match serde_json::from_slice::<UploadProgressRecord>(&bytes) {
            Ok(record) if &record.key == key => Ok(Some(record)),
            Ok(record) => {
                warn!(
                    "进度记录键不匹配，丢弃: 文件 {:?}, 记录键 {}",
                    path, record.key
                );
                self.delete(key)?;
                Ok(None)
            }
            Err(e) => {
                warn!("进度记录已损坏，丢弃 {:?}: {}", path, e);
                self.delete(key)?;
                Ok(None)
            }
        }
    }

    /// 原子保存进度记录
    pub fn save(&self, record: &UploadProgressRecord) -> Result<(), TransferError> {
        let path = self.record_path(&record.key);
        let temp_path = self.temp_path(&record.key);

        let file = File::create(&temp_path).map_err(|e| store_error("创建临时文件失败", &temp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record)
            .map_err(|e| store_error("序列化进度记录失败", &temp_path, e))?;
        writer
            .flush()
            .map_err(|e| store_error("写入临时文件失败", &temp_path, e))?;
        let file = writer
            .into_inner()
            .map_err(|e| store_error("写入临时文件失败", &temp_path, e))?;
        file.sync_all()
            .map_err(|e| store_error("同步临时文件失败", &temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &path).map_err(|e| store_error("重命名进度记录失败", &path, e))?;
        self.sync_dir()?;

        debug!(
            "已保存上传进度: key={}, completed={}/{}",
            record.key,
            record.completed_slices.len(),
            record.slice_count
        );
        Ok(())
    }

    /// 在阻塞线程池中保存进度记录，供异步上下文调用
    ///
    /// # 参数
    /// * `record` - 要落盘的记录，内部会克隆一份
    pub async fn persist(&self, record: &UploadProgressRecord) -> Result<(), TransferError> {
        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.save(&record))
            .await
            .map_err(|e| store_error("进度记录写入线程异常", &self.dir, e))?
    }

    /// rename 之后同步目录项，确保新文件名本身也已落盘
    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), TransferError> {
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| store_error("同步进度目录失败", &self.dir, e))
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), TransferError> {
        Ok(())
    }

    /// 删除进度记录（不存在视为成功）
    ///
    /// # 返回
    /// 是否真的删除了文件
    pub fn delete(&self, key: &ProgressKey) -> Result<bool, TransferError> {
        let _ = fs::remove_file(self.temp_path(key));
        let path = self.record_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("已删除进度记录: {:?}", path);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(store_error("删除进度记录失败", &path, e)),
        }
    }

    /// 列出所有有效的进度记录，跳过无法解析的文件
    pub fn list(&self) -> Result<Vec<UploadProgressRecord>, TransferError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| store_error("扫描进度目录失败", &self.dir, e))?;
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(key) = key_from_record_path(&path) else {
                continue;
            };
            match self.load(&key) {
                Ok(Some(r)) => records.push(r),
                Ok(None) => skipped += 1,
                Err(e) => {
                    warn!("跳过进度记录 {:?}: {}", path, e);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            warn!("扫描进度记录完成，跳过 {} 个无效文件", skipped);
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// 清理超过保留天数未更新的记录
    ///
    /// 正在被持有租约的记录不会被清理
    ///
    /// # 返回
    /// 删除的记录数
    pub fn cleanup_expired(&self, retention_days: u64) -> Result<usize, TransferError> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days as i64);
        let mut removed = 0usize;

        for record in self.list()? {
            if record.updated_at < cutoff && !self.is_leased(&record.key) && self.delete(&record.key)? {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(
                "已清理 {} 条过期上传进度记录 (保留 {} 天)",
                removed, retention_days
            );
        }
        Ok(removed)
    }
}

fn key_from_record_path(path: &Path) -> Option<ProgressKey> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{}", RECORD_EXTENSION))?;
    ProgressKey::from_hex(stem)
}
