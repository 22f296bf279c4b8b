//! 上传进度持久化类型
//!
//! 断点续传只针对上传：每个 (本地文件, 内容签名) 对应一条记录，
//! 记录服务端的上传会话 ID 和已确认的分片集合。

use crate::error::TransferError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// 进度记录键
///
/// 由规范化的绝对路径、完整文件摘要、文件大小派生的 SHA-256 hex，
/// 文件内容变化后键随之变化，旧记录自然失效
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgressKey(String);

impl ProgressKey {
    pub fn derive(local_path: &Path, whole_digest: &str, file_size: u64) -> Self {
        let canonical = canonical_path(local_path);
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        hasher.update(b"\n");
        hasher.update(whole_digest.to_ascii_lowercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(file_size.to_string().as_bytes());
        ProgressKey(hex::encode(hasher.finalize()))
    }

    /// 从文件名恢复键（仅接受 64 位小写 hex）
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)) {
            Some(ProgressKey(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 规范化路径；文件不存在等情况下退回绝对路径
pub fn canonical_path(path: &Path) -> PathBuf {
    match dunce::canonicalize(path) {
        Ok(p) => p,
        Err(_) => std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf()),
    }
}

/// 上传进度记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadProgressRecord {
    pub key: ProgressKey,
    pub local_path: PathBuf,
    pub remote_path: String,
    /// 服务端上传会话 ID（uploadid）
    pub remote_session_id: String,
    pub file_size: u64,
    pub slice_size: u64,
    pub slice_count: usize,
    /// 已被服务端确认的分片序号
    #[serde(default)]
    pub completed_slices: BTreeSet<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadProgressRecord {
    pub fn new(
        key: ProgressKey,
        local_path: PathBuf,
        remote_path: String,
        remote_session_id: String,
        file_size: u64,
        slice_size: u64,
        slice_count: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            local_path,
            remote_path,
            remote_session_id,
            file_size,
            slice_size,
            slice_count,
            completed_slices: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 标记分片完成
    ///
    /// # 返回
    /// 是否为新完成的分片
    pub fn mark_completed(&mut self, index: usize) -> bool {
        let inserted = self.completed_slices.insert(index);
        self.updated_at = Utc::now();
        inserted
    }

    pub fn is_slice_completed(&self, index: usize) -> bool {
        self.completed_slices.contains(&index)
    }

    pub fn is_all_completed(&self) -> bool {
        self.completed_slices.len() == self.slice_count
    }

    /// 检查记录与当前上传计划是否一致
    pub fn validate_against(
        &self,
        file_size: u64,
        slice_size: u64,
        slice_count: usize,
    ) -> Result<(), TransferError> {
        if self.file_size != file_size
            || self.slice_size != slice_size
            || self.slice_count != slice_count
        {
            return Err(TransferError::ProgressCorrupted(format!(
                "分片布局不一致: 记录 size={} slice={} count={}, 当前 size={} slice={} count={}",
                self.file_size,
                self.slice_size,
                self.slice_count,
                file_size,
                slice_size,
                slice_count
            )));
        }
        if let Some(&max) = self.completed_slices.iter().next_back() {
            if max >= self.slice_count {
                return Err(TransferError::ProgressCorrupted(format!(
                    "已完成分片 #{} 超出分片总数 {}",
                    max, self.slice_count
                )));
            }
        }
        if self.remote_session_id.is_empty() {
            return Err(TransferError::ProgressCorrupted(
                "上传会话 ID 为空".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn record(slice_count: usize) -> UploadProgressRecord {
        UploadProgressRecord::new(
            ProgressKey::from_hex(&"a".repeat(64)).unwrap(),
            PathBuf::from("/data/a.bin"),
            "/apps/a.bin".to_string(),
            "N1-123".to_string(),
            4096,
            1024,
            slice_count,
        )
    }

    #[test]
    fn test_key_is_stable_and_content_sensitive() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"content").unwrap();

        let a = ProgressKey::derive(file.path(), "ABCDEF", 7);
        let b = ProgressKey::derive(file.path(), "abcdef", 7);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);

        let c = ProgressKey::derive(file.path(), "abcdef", 8);
        assert_ne!(a, c);
        let d = ProgressKey::derive(file.path(), "123456", 7);
        assert_ne!(a, d);
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(ProgressKey::from_hex("not-a-key").is_none());
        assert!(ProgressKey::from_hex(&"A".repeat(64)).is_none());
        assert!(ProgressKey::from_hex(&"0f".repeat(32)).is_some());
    }

    #[test]
    fn test_mark_completed() {
        let mut r = record(2);
        assert!(r.mark_completed(0));
        assert!(!r.mark_completed(0));
        assert!(!r.is_all_completed());
        r.mark_completed(1);
        assert!(r.is_all_completed());
    }

    #[test]
    fn test_validate_against() {
        let mut r = record(4);
        r.mark_completed(3);
        assert!(r.validate_against(4096, 1024, 4).is_ok());

        assert!(matches!(
            r.validate_against(4096, 2048, 2),
            Err(TransferError::ProgressCorrupted(_))
        ));

        r.completed_slices.insert(4);
        assert!(matches!(
            r.validate_against(4096, 1024, 4),
            Err(TransferError::ProgressCorrupted(_))
        ));
    }

    #[test]
    fn test_json_roundtrip_keeps_completed_set() {
        let mut r = record(4);
        r.mark_completed(0);
        r.mark_completed(2);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"completed_slices\":[0,2]"));
        let back: UploadProgressRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
