//! 传输会话
//!
//! 引擎只通过 [`TransferSession`] 与网盘交互。实现方负责鉴权、签名和
//! 具体 HTTP 细节，返回的错误必须已经归类为 [`TransferError`]。

use super::types::{ConflictPolicy, DedupResponse, DownloadLink, RemoteFileMeta, SliceAck};
use crate::common::range::RangeSpec;
use crate::common::signature::ContentSignature;
use crate::error::TransferError;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// 区间数据流，每一项是一段连续字节
pub type RangeStream = BoxStream<'static, Result<Vec<u8>, TransferError>>;

#[async_trait]
pub trait TransferSession: Send + Sync {
    /// 查询网盘文件元信息，不存在时返回 None
    async fn file_meta(&self, remote_path: &str) -> Result<Option<RemoteFileMeta>, TransferError>;

    /// 获取下载直链
    async fn locate_download(&self, remote_path: &str) -> Result<DownloadLink, TransferError>;

    /// 拉取一个字节区间
    ///
    /// 直链失效（403）时返回 `LinkExpired`
    async fn fetch_range(
        &self,
        link: &DownloadLink,
        range: &RangeSpec,
    ) -> Result<RangeStream, TransferError>;

    /// 秒传查询
    ///
    /// `allow_rapid == false` 时跳过秒传，只申请上传会话
    async fn dedup_query(
        &self,
        remote_path: &str,
        signature: &ContentSignature,
        policy: ConflictPolicy,
        allow_rapid: bool,
    ) -> Result<DedupResponse, TransferError>;

    /// 上传一个分片
    async fn upload_slice(
        &self,
        remote_path: &str,
        upload_id: &str,
        index: usize,
        data: Vec<u8>,
    ) -> Result<SliceAck, TransferError>;

    /// 合并分片生成文件，同一 upload_id 重复调用结果相同
    async fn commit(
        &self,
        remote_path: &str,
        upload_id: &str,
        signature: &ContentSignature,
        policy: ConflictPolicy,
    ) -> Result<RemoteFileMeta, TransferError>;
}
