// 内容签名计算
//
// 一次顺序读取同时得到：
// 1. 完整文件 MD5（秒传、下载校验）
// 2. 前 256KB MD5（秒传查询必需）
// 3. 按分片大小切分的逐片 MD5（block_list）

use crate::error::TransferError;
use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 头部摘要覆盖的字节数
pub const HEAD_DIGEST_SIZE: u64 = 256 * 1024;

/// 默认签名分片大小: 4MB
pub const DEFAULT_DIGEST_SLICE_SIZE: u64 = 4 * 1024 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceDigest {
    pub index: usize,
    pub digest: String,
}

/// 文件内容签名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentSignature {
    pub algorithm: DigestAlgorithm,
    pub file_size: u64,
    /// 完整文件摘要（小写 hex）
    pub whole_digest: String,
    /// 前 256KB 摘要
    pub head_digest: String,
    pub slice_size: u64,
    pub slice_digests: Vec<SliceDigest>,
}

impl ContentSignature {
    /// 按顺序排列的分片摘要（百度 block_list 格式）
    pub fn block_list(&self) -> Vec<String> {
        self.slice_digests.iter().map(|s| s.digest.clone()).collect()
    }

    /// block_list 的 JSON 数组表示
    pub fn block_list_json(&self) -> String {
        serde_json::to_string(&self.block_list()).unwrap_or_else(|_| "[]".to_string())
    }

    pub fn slice_count(&self) -> usize {
        self.slice_digests.len()
    }
}

/// 签名计算器
pub struct SignatureEngine;

impl SignatureEngine {
    /// 计算文件签名（在阻塞线程池中执行）
    ///
    /// # 参数
    /// * `path` - 本地文件路径
    /// * `slice_size` - 逐片摘要的分片大小
    pub async fn compute(path: &Path, slice_size: u64) -> Result<ContentSignature, TransferError> {
        if slice_size == 0 {
            return Err(TransferError::InvalidPolicy(
                "签名分片大小必须大于 0".to_string(),
            ));
        }
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::compute_sync(&path, slice_size))
            .await
            .map_err(|e| TransferError::Io(format!("签名计算任务执行失败: {}", e)))?
    }

    /// 同步计算签名
    pub fn compute_sync(path: &Path, slice_size: u64) -> Result<ContentSignature, TransferError> {
        let file = File::open(path)
            .map_err(|e| TransferError::Io(format!("无法打开文件 {:?}: {}", path, e)))?;
        let file_size = file
            .metadata()
            .map_err(|e| TransferError::Io(format!("无法获取文件元数据 {:?}: {}", path, e)))?
            .len();

        let mut reader = BufReader::with_capacity(1024 * 1024, file);
        let mut whole = Md5Context::new();
        let mut head = Md5Context::new();
        let mut slice = Md5Context::new();
        let mut slice_filled = 0u64;
        let mut total_read = 0u64;
        let mut slice_digests = Vec::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = reader
                .read(&mut buffer)
                .map_err(|e| TransferError::Io(format!("读取文件失败 {:?}: {}", path, e)))?;
            if n == 0 {
                break;
            }
            let data = &buffer[..n];
            whole.consume(data);

            if total_read < HEAD_DIGEST_SIZE {
                let take = ((HEAD_DIGEST_SIZE - total_read) as usize).min(n);
                head.consume(&data[..take]);
            }
            total_read += n as u64;

            // 按分片边界切换逐片摘要
            let mut rest = data;
            while !rest.is_empty() {
                let room = (slice_size - slice_filled) as usize;
                let take = room.min(rest.len());
                slice.consume(&rest[..take]);
                slice_filled += take as u64;
                rest = &rest[take..];

                if slice_filled == slice_size {
                    let done = std::mem::replace(&mut slice, Md5Context::new());
                    slice_digests.push(SliceDigest {
                        index: slice_digests.len(),
                        digest: format!("{:x}", done.compute()),
                    });
                    slice_filled = 0;
                }
            }
        }

        // 尾片；空文件也保留一个空分片摘要
        if slice_filled > 0 || slice_digests.is_empty() {
            slice_digests.push(SliceDigest {
                index: slice_digests.len(),
                digest: format!("{:x}", slice.compute()),
            });
        }

        if total_read != file_size {
            return Err(TransferError::Io(format!(
                "读取期间文件大小发生变化 {:?}: 预期 {} 实际 {}",
                path, file_size, total_read
            )));
        }

        let signature = ContentSignature {
            algorithm: DigestAlgorithm::Md5,
            file_size,
            whole_digest: format!("{:x}", whole.compute()),
            head_digest: format!("{:x}", head.compute()),
            slice_size,
            slice_digests,
        };

        debug!(
            "签名计算完成: path={:?}, size={}, md5={}, slices={}",
            path,
            file_size,
            signature.whole_digest,
            signature.slice_count()
        );

        Ok(signature)
    }

    /// 仅计算完整文件 MD5（下载校验用）
    pub async fn file_digest(path: &Path) -> Result<String, TransferError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = File::open(&path)
                .map_err(|e| TransferError::Io(format!("无法打开文件 {:?}: {}", path, e)))?;
            let mut reader = BufReader::with_capacity(1024 * 1024, file);
            let mut ctx = Md5Context::new();
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let n = reader
                    .read(&mut buffer)
                    .map_err(|e| TransferError::Io(format!("读取文件失败 {:?}: {}", path, e)))?;
                if n == 0 {
                    break;
                }
                ctx.consume(&buffer[..n]);
            }
            Ok(format!("{:x}", ctx.compute()))
        })
        .await
        .map_err(|e| TransferError::Io(format!("摘要计算任务执行失败: {}", e)))?
    }
}

/// 计算一段内存数据的 MD5
pub fn digest_bytes(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file_with(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_small_file_signature() {
        let file = temp_file_with(b"Hello, World!");
        let sig = SignatureEngine::compute(file.path(), 4).await.unwrap();

        assert_eq!(sig.file_size, 13);
        assert_eq!(sig.whole_digest, "65a8e27d8879283831b664bd8b7f0ad4");
        // 小于 256KB 时头部摘要等于完整摘要
        assert_eq!(sig.head_digest, sig.whole_digest);
        assert_eq!(sig.slice_count(), 4);
        assert_eq!(sig.slice_digests[0].digest, digest_bytes(b"Hell"));
        assert_eq!(sig.slice_digests[3].digest, digest_bytes(b"!"));
    }

    #[tokio::test]
    async fn test_slices_across_buffer_boundaries() {
        let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let file = temp_file_with(&content);
        let slice_size = 100_000u64;
        let sig = SignatureEngine::compute(file.path(), slice_size).await.unwrap();

        assert_eq!(sig.slice_count(), 3);
        for (i, s) in sig.slice_digests.iter().enumerate() {
            let start = i * slice_size as usize;
            let end = (start + slice_size as usize).min(content.len());
            assert_eq!(s.index, i);
            assert_eq!(s.digest, digest_bytes(&content[start..end]));
        }
        assert_eq!(sig.whole_digest, digest_bytes(&content));
        assert_eq!(
            sig.head_digest,
            digest_bytes(&content[..HEAD_DIGEST_SIZE as usize])
        );
    }

    #[tokio::test]
    async fn test_empty_file_has_one_slice() {
        let file = temp_file_with(b"");
        let sig = SignatureEngine::compute(file.path(), 1024).await.unwrap();
        assert_eq!(sig.file_size, 0);
        assert_eq!(sig.slice_count(), 1);
        assert_eq!(sig.whole_digest, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn test_deterministic_and_block_list() {
        let file = temp_file_with(b"abcdefghij");
        let a = SignatureEngine::compute(file.path(), 3).await.unwrap();
        let b = SignatureEngine::compute(file.path(), 3).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.block_list().len(), 4);
        let parsed: Vec<String> = serde_json::from_str(&a.block_list_json()).unwrap();
        assert_eq!(parsed, a.block_list());
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let result = SignatureEngine::compute(Path::new("/nonexistent/file.bin"), 1024).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn test_file_digest_matches_signature() {
        let file = temp_file_with(b"digest me");
        let digest = SignatureEngine::file_digest(file.path()).await.unwrap();
        assert_eq!(digest, digest_bytes(b"digest me"));
    }
}
