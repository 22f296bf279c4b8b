// 内存版传输会话，供单元测试使用

use super::session::{RangeStream, TransferSession};
use super::types::{ConflictPolicy, DedupResponse, DownloadLink, RemoteFileMeta, SliceAck};
use crate::common::range::RangeSpec;
use crate::common::signature::{digest_bytes, ContentSignature};
use crate::error::TransferError;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 每次返回的流块大小
const STREAM_PIECE: usize = 1024;

#[derive(Debug, Default)]
pub struct MockSession {
    files: Mutex<HashMap<String, Vec<u8>>>,
    /// 服务端已有的内容摘要（可秒传）
    known_digests: Mutex<HashSet<String>>,
    /// 上传会话 → 已收到的分片
    sessions: Mutex<HashMap<String, BTreeMap<usize, Vec<u8>>>>,
    fetch_failures: Mutex<VecDeque<TransferError>>,
    /// 分片序号 → 依次返回的错误
    upload_failures: Mutex<HashMap<usize, VecDeque<TransferError>>>,
    commit_failures: Mutex<VecDeque<TransferError>>,
    next_session: AtomicUsize,
    pub dedup_calls: AtomicUsize,
    pub locate_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub uploaded_bytes: AtomicU64,
    pub uploaded_slices: Mutex<Vec<usize>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, remote_path: &str, data: Vec<u8>) {
        self.known_digests.lock().insert(digest_bytes(&data));
        self.files.lock().insert(remote_path.to_string(), data);
    }

    pub fn file(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.files.lock().get(remote_path).cloned()
    }

    /// 登记一段服务端已有的内容，不落到任何路径
    pub fn add_known_content(&self, data: &[u8]) {
        self.known_digests.lock().insert(digest_bytes(data));
    }

    /// 预置一个上传会话及其已接收的分片（模拟上次中断前的状态）
    pub fn seed_session(&self, upload_id: &str, slices: Vec<(usize, Vec<u8>)>) {
        self.sessions
            .lock()
            .insert(upload_id.to_string(), slices.into_iter().collect());
    }

    pub fn fail_next_fetch(&self, err: TransferError) {
        self.fetch_failures.lock().push_back(err);
    }

    /// 让指定分片的下一次上传失败
    pub fn fail_upload_of(&self, index: usize, err: TransferError) {
        self.upload_failures
            .lock()
            .entry(index)
            .or_default()
            .push_back(err);
    }

    pub fn fail_next_commit(&self, err: TransferError) {
        self.commit_failures.lock().push_back(err);
    }

    fn meta_of(path: &str, data: &[u8]) -> RemoteFileMeta {
        RemoteFileMeta {
            path: path.to_string(),
            size: data.len() as u64,
            md5: Some(digest_bytes(data)),
            fs_id: data.len() as u64 + 1,
            is_dir: false,
        }
    }
}

#[async_trait]
impl TransferSession for MockSession {
    async fn file_meta(&self, remote_path: &str) -> Result<Option<RemoteFileMeta>, TransferError> {
        Ok(self
            .files
            .lock()
            .get(remote_path)
            .map(|data| Self::meta_of(remote_path, data)))
    }

    async fn locate_download(&self, remote_path: &str) -> Result<DownloadLink, TransferError> {
        self.locate_calls.fetch_add(1, Ordering::SeqCst);
        if !self.files.lock().contains_key(remote_path) {
            return Err(TransferError::NotFound(remote_path.to_string()));
        }
        Ok(DownloadLink {
            url: format!("mock://{}", remote_path),
            headers: Vec::new(),
        })
    }

    async fn fetch_range(
        &self,
        link: &DownloadLink,
        range: &RangeSpec,
    ) -> Result<RangeStream, TransferError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fetch_failures.lock().pop_front() {
            return Err(err);
        }
        let path = link.url.trim_start_matches("mock://");
        let data = self
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(path.to_string()))?;

        let start = range.offset as usize;
        let end = (range.end() as usize).min(data.len());
        let pieces: Vec<Result<Vec<u8>, TransferError>> = data[start..end]
            .chunks(STREAM_PIECE)
            .map(|c| Ok(c.to_vec()))
            .collect();
        Ok(futures::stream::iter(pieces).boxed())
    }

    async fn dedup_query(
        &self,
        remote_path: &str,
        signature: &ContentSignature,
        _policy: ConflictPolicy,
        allow_rapid: bool,
    ) -> Result<DedupResponse, TransferError> {
        self.dedup_calls.fetch_add(1, Ordering::SeqCst);
        if allow_rapid && self.known_digests.lock().contains(&signature.whole_digest) {
            let meta = RemoteFileMeta {
                path: remote_path.to_string(),
                size: signature.file_size,
                md5: Some(signature.whole_digest.clone()),
                fs_id: 1,
                is_dir: false,
            };
            return Ok(DedupResponse::Rapid(meta));
        }
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        let upload_id = format!("mock-upload-{}", n);
        self.sessions.lock().insert(upload_id.clone(), BTreeMap::new());
        Ok(DedupResponse::Session { upload_id })
    }

    async fn upload_slice(
        &self,
        _remote_path: &str,
        upload_id: &str,
        index: usize,
        data: Vec<u8>,
    ) -> Result<SliceAck, TransferError> {
        let injected = self
            .upload_failures
            .lock()
            .get_mut(&index)
            .and_then(|q| q.pop_front());
        if let Some(err) = injected {
            return Err(err);
        }
        let md5 = digest_bytes(&data);
        self.uploaded_bytes
            .fetch_add(data.len() as u64, Ordering::SeqCst);
        self.uploaded_slices.lock().push(index);
        self.sessions
            .lock()
            .entry(upload_id.to_string())
            .or_default()
            .insert(index, data);
        Ok(SliceAck { index, md5 })
    }

    async fn commit(
        &self,
        remote_path: &str,
        upload_id: &str,
        signature: &ContentSignature,
        _policy: ConflictPolicy,
    ) -> Result<RemoteFileMeta, TransferError> {
        if let Some(err) = self.commit_failures.lock().pop_front() {
            return Err(err);
        }
        let slices = self
            .sessions
            .lock()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| TransferError::Remote {
                errno: 31299,
                message: format!("未知的上传会话: {}", upload_id),
            })?;

        if slices.len() != signature.slice_count() {
            return Err(TransferError::Remote {
                errno: 31363,
                message: format!(
                    "分片不完整: 收到 {} / {}",
                    slices.len(),
                    signature.slice_count()
                ),
            });
        }
        let data: Vec<u8> = slices.into_values().flatten().collect();
        if digest_bytes(&data) != signature.whole_digest {
            return Err(TransferError::Integrity(format!(
                "合并后摘要不一致: {}",
                remote_path
            )));
        }
        let meta = Self::meta_of(remote_path, &data);
        self.put_file(remote_path, data);
        Ok(meta)
    }
}
