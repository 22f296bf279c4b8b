use crate::common::range::RangeSpec;
use crate::common::retry::with_chunk_retry;
use crate::error::TransferError;
use crate::netdisk::{SliceAck, TransferSession};
use std::path::Path;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 默认上传分片大小: 4MB（普通用户上限）
pub const DEFAULT_UPLOAD_SLICE_SIZE: u64 = 4 * 1024 * 1024;

/// 读取分片数据
///
/// # 参数
/// * `file_path` - 本地文件路径
/// * `range` - 分片区间
pub async fn read_slice(file_path: &Path, range: &RangeSpec) -> Result<Vec<u8>, TransferError> {
    let mut buffer = vec![0u8; range.length as usize];
    if range.length == 0 {
        return Ok(buffer);
    }

    let mut file = File::open(file_path)
        .await
        .map_err(|e| TransferError::Io(format!("打开上传文件失败 {:?}: {}", file_path, e)))?;
    file.seek(std::io::SeekFrom::Start(range.offset))
        .await
        .map_err(|e| TransferError::Io(format!("文件定位失败: {}", e)))?;
    file.read_exact(&mut buffer)
        .await
        .map_err(|e| TransferError::Io(format!("读取分片数据失败: {}", e)))?;

    debug!(
        "读取分片 #{}: bytes={}-{}, 大小={} bytes",
        range.index,
        range.offset,
        range.end() - 1,
        range.length
    );
    Ok(buffer)
}

/// 单个上传会话内的分片上传器
pub struct SliceUploader<'a> {
    pub session: &'a dyn TransferSession,
    pub remote_path: &'a str,
    pub upload_id: &'a str,
    pub cancel: &'a CancellationToken,
    pub chunk_retries: u32,
}

impl SliceUploader<'_> {
    /// 上传一个分片，服务端返回的 MD5 与本地不一致时按传输损坏重试
    ///
    /// # 参数
    /// * `index` - 分片序号
    /// * `data` - 分片数据
    /// * `expected_md5` - 本地计算的分片 MD5
    pub async fn upload(
        &self,
        index: usize,
        data: &[u8],
        expected_md5: &str,
    ) -> Result<SliceAck, TransferError> {
        let label = format!("分片 #{}", index);
        with_chunk_retry(&label, self.chunk_retries, self.cancel, |_| async move {
            let ack = self
                .session
                .upload_slice(self.remote_path, self.upload_id, index, data.to_vec())
                .await?;
            if !ack.md5.eq_ignore_ascii_case(expected_md5) {
                return Err(TransferError::NetworkTransient(format!(
                    "分片 #{} 服务端 MD5 不一致: 本地 {} 服务端 {}",
                    index, expected_md5, ack.md5
                )));
            }
            Ok(ack)
        })
        .await
    }
}
