use crate::common::range::RangeSpec;
use crate::common::rate_limiter::RateLimiter;
use crate::common::retry::with_chunk_retry;
use crate::common::statistic::TransferReporter;
use crate::error::TransferError;
use crate::netdisk::{DownloadLink, TransferSession};
use futures::StreamExt;
use std::path::Path;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 创建目标文件并预分配空间
pub async fn prepare_file(path: &Path, size: u64) -> Result<(), TransferError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::Io(format!("创建父目录失败 {:?}: {}", parent, e)))?;
        }
    }

    let file = File::create(path)
        .await
        .map_err(|e| TransferError::Io(format!("创建文件失败 {:?}: {}", path, e)))?;
    file.set_len(size)
        .await
        .map_err(|e| TransferError::Io(format!("预分配文件空间失败 {:?}: {}", path, e)))?;

    info!("文件准备完成: {:?}, 大小: {} bytes", path, size);
    Ok(())
}

/// 一次下载中所有区间共享的环境
pub struct RangeFetcher<'a> {
    pub session: &'a dyn TransferSession,
    pub link: &'a DownloadLink,
    pub output_path: &'a Path,
    pub limiter: &'a Mutex<RateLimiter>,
    pub reporter: &'a dyn TransferReporter,
    pub cancel: &'a CancellationToken,
    pub chunk_retries: u32,
}

impl RangeFetcher<'_> {
    /// 下载一个区间（带分片级重试），成功后计入统计
    pub async fn fetch(&self, range: &RangeSpec) -> Result<u64, TransferError> {
        if range.length == 0 {
            return Ok(0);
        }

        let label = format!("区间 #{} ({})", range.index, range.offset);
        let written = with_chunk_retry(&label, self.chunk_retries, self.cancel, |_| {
            self.fetch_once(range)
        })
        .await?;

        self.reporter.on_transferred(written);
        Ok(written)
    }

    /// 单次尝试：流式读取并写入对应偏移
    async fn fetch_once(&self, range: &RangeSpec) -> Result<u64, TransferError> {
        debug!(
            "下载区间 #{}: bytes={}-{}",
            range.index,
            range.offset,
            range.end() - 1
        );

        let mut stream = self.session.fetch_range(self.link, range).await?;

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.output_path)
            .await
            .map_err(|e| TransferError::Io(format!("打开输出文件失败: {}", e)))?;
        file.seek(std::io::SeekFrom::Start(range.offset))
            .await
            .map_err(|e| TransferError::Io(format!("文件定位失败: {}", e)))?;

        let mut written = 0u64;
        while let Some(piece) = stream.next().await {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let data = piece?;
            let len = data.len() as u64;
            if written + len > range.length {
                return Err(TransferError::NetworkTransient(format!(
                    "区间 #{} 返回数据超出预期: {} > {}",
                    range.index,
                    written + len,
                    range.length
                )));
            }

            file.write_all(&data)
                .await
                .map_err(|e| TransferError::Io(format!("写入文件失败: {}", e)))?;
            written += len;

            self.limiter.lock().await.consume(len).await;
        }

        file.flush()
            .await
            .map_err(|e| TransferError::Io(format!("刷新文件缓冲失败: {}", e)))?;

        if written != range.length {
            return Err(TransferError::NetworkTransient(format!(
                "区间 #{} 数据不完整: {} / {}",
                range.index, written, range.length
            )));
        }

        debug!("区间 #{} 下载完成，大小: {} bytes", range.index, written);
        Ok(written)
    }
}
