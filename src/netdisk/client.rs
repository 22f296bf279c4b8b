// PCS 传输会话的 HTTP 实现
//
// 只覆盖传输需要的接口：filemetas、locatedownload、rapidupload、
// precreate、superfile2、create。鉴权 Cookie 由调用方提供。

use super::session::{RangeStream, TransferSession};
use super::types::{
    ConflictPolicy, CreateFileResponse, DedupResponse, DownloadLink, FileMetasResponse,
    LocateDownloadResponse, PrecreateResponse, RapidUploadResponse, RemoteFileMeta, SliceAck,
    UploadChunkResponse,
};
use crate::common::range::RangeSpec;
use crate::common::signature::ContentSignature;
use crate::config::PcsConfig;
use crate::error::TransferError;
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{multipart, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 网盘文件不存在时 filemetas 单条目的 errno
const META_NOT_FOUND_ERRNO: i32 = -9;

/// 校验区间请求的响应状态
///
/// 200 只有在响应体恰好就是所请求区间时才可接受（即整个文件只有这一段），
/// 否则写入会越过区间边界，且重试同一请求结果不会变化。
///
/// # 参数
/// * `content_length` - 响应头声明的长度，未声明时为 None
fn check_range_status(
    status: StatusCode,
    content_length: Option<u64>,
    range: &RangeSpec,
    range_header: &str,
) -> Result<(), TransferError> {
    match status {
        StatusCode::PARTIAL_CONTENT => Ok(()),
        StatusCode::OK if range.offset == 0 && content_length == Some(range.length) => {
            warn!("服务器忽略了 Range 头，整段响应与区间一致: {}", range_header);
            Ok(())
        }
        StatusCode::OK => Err(TransferError::Remote {
            errno: 200,
            message: format!(
                "服务器忽略 Range 头返回整段内容 (长度 {:?})，无法按区间下载: {}",
                content_length, range_header
            ),
        }),
        StatusCode::FORBIDDEN => Err(TransferError::LinkExpired(format!(
            "下载链接返回 403: {}",
            range_header
        ))),
        _ => Err(TransferError::from_http_status(
            status.as_u16(),
            format!("下载区间 {}", range_header),
        )),
    }
}

/// PCS 传输会话
#[derive(Debug, Clone)]
pub struct PcsClient {
    client: Client,
    config: PcsConfig,
    /// 完整 Cookie 串（至少包含 BDUSS）
    cookie: String,
}

/// 把 reqwest 传输层错误归类
fn classify_reqwest_error(e: reqwest::Error, context: &str) -> TransferError {
    if let Some(status) = e.status() {
        return TransferError::from_http_status(status.as_u16(), context);
    }
    if e.is_builder() {
        return TransferError::Remote {
            errno: -1,
            message: format!("{}: {}", context, e),
        };
    }
    // 超时、连接失败、读取中断都按暂时性错误处理
    TransferError::NetworkTransient(format!("{}: {}", context, e))
}

impl PcsClient {
    /// 创建会话
    ///
    /// # 参数
    /// * `config` - PCS 接口配置
    /// * `cookie` - 已登录账号的 Cookie 串
    pub fn new(config: PcsConfig, cookie: impl Into<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("创建 HTTP 客户端失败")?;

        info!(
            "初始化 PCS 会话: app_id={}, upload_server={}",
            config.app_id, config.upload_server
        );

        Ok(Self {
            client,
            config,
            cookie: cookie.into(),
        })
    }

    fn pan_url(&self, path: &str) -> String {
        format!("{}{}", self.config.pan_base_url.trim_end_matches('/'), path)
    }

    fn pcs_url(&self, path: &str) -> String {
        format!("{}{}", self.config.pcs_base_url.trim_end_matches('/'), path)
    }

    /// 读取响应体并解析 JSON，非 2xx 状态按 HTTP 状态码归类
    async fn parse_json<T: DeserializeOwned>(
        response: Response,
        context: &str,
    ) -> Result<T, TransferError> {
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(e, context))?;

        debug!("{} 响应: status={}, body={}", context, status, text);

        if !status.is_success() {
            // PCS 在 4xx 时通常仍返回带 error_code 的 JSON
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                let errno = value["error_code"]
                    .as_i64()
                    .or_else(|| value["errno"].as_i64());
                if let Some(errno) = errno.filter(|n| *n != 0) {
                    let msg = value["error_msg"]
                        .as_str()
                        .or_else(|| value["errmsg"].as_str())
                        .unwrap_or_default();
                    return Err(TransferError::from_errno(errno as i32, msg));
                }
            }
            return Err(TransferError::from_http_status(status.as_u16(), context));
        }

        serde_json::from_str(&text).map_err(|e| TransferError::Remote {
            errno: -1,
            message: format!("{} 响应解析失败: {}, body={}", context, e, text),
        })
    }

    async fn rapid_upload(
        &self,
        remote_path: &str,
        signature: &ContentSignature,
        policy: ConflictPolicy,
    ) -> Result<Option<RemoteFileMeta>, TransferError> {
        let url = self.pan_url("/api/rapidupload");
        let response = self
            .client
            .post(&url)
            .header("Cookie", &self.cookie)
            .header("User-Agent", &self.config.user_agent)
            .form(&[
                ("path", remote_path.to_string()),
                ("content-length", signature.file_size.to_string()),
                ("content-md5", signature.whole_digest.clone()),
                ("slice-md5", signature.head_digest.clone()),
                ("rtype", policy.rtype().to_string()),
            ])
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, "秒传请求"))?;

        let resp: RapidUploadResponse = Self::parse_json(response, "秒传").await?;
        if resp.is_success() {
            let meta = match resp.info {
                Some(item) => item.into_meta(),
                None => RemoteFileMeta {
                    path: remote_path.to_string(),
                    size: signature.file_size,
                    md5: Some(signature.whole_digest.clone()),
                    fs_id: 0,
                    is_dir: false,
                },
            };
            info!("秒传成功: path={}", remote_path);
            return Ok(Some(meta));
        }
        if resp.needs_upload() {
            debug!("服务端无相同内容，转普通上传: errno={}", resp.errno);
            return Ok(None);
        }
        Err(TransferError::from_errno(resp.errno, resp.errmsg))
    }

    async fn precreate(
        &self,
        remote_path: &str,
        signature: &ContentSignature,
        policy: ConflictPolicy,
    ) -> Result<PrecreateResponse, TransferError> {
        info!(
            "预创建文件: path={}, size={}",
            remote_path, signature.file_size
        );

        let url = self.pan_url("/api/precreate");
        let response = self
            .client
            .post(&url)
            .header("Cookie", &self.cookie)
            .header("User-Agent", &self.config.user_agent)
            .form(&[
                ("path", remote_path.to_string()),
                ("size", signature.file_size.to_string()),
                ("isdir", "0".to_string()),
                ("autoinit", "1".to_string()),
                ("rtype", policy.rtype().to_string()),
                ("block_list", signature.block_list_json()),
            ])
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, "预创建请求"))?;

        let resp: PrecreateResponse = Self::parse_json(response, "预创建").await?;
        if resp.errno != 0 {
            error!("预创建失败: errno={}, errmsg={}", resp.errno, resp.errmsg);
            return Err(TransferError::from_errno(resp.errno, resp.errmsg));
        }
        Ok(resp)
    }
}

#[async_trait]
impl TransferSession for PcsClient {
    async fn file_meta(&self, remote_path: &str) -> Result<Option<RemoteFileMeta>, TransferError> {
        let target = serde_json::to_string(&[remote_path]).unwrap_or_default();
        let url = self.pan_url("/api/filemetas");
        let response = self
            .client
            .get(&url)
            .query(&[("target", target.as_str()), ("dlink", "0")])
            .header("Cookie", &self.cookie)
            .header("User-Agent", &self.config.user_agent)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, "查询文件信息"))?;

        let resp: FileMetasResponse = Self::parse_json(response, "查询文件信息").await?;

        let item = resp.info.into_iter().next();
        match item {
            Some(item) if item.errno == META_NOT_FOUND_ERRNO => Ok(None),
            Some(item) if item.errno != 0 => Err(TransferError::from_errno(item.errno, resp.errmsg)),
            Some(item) => Ok(Some(item.into_meta())),
            None if resp.errno == 0 || resp.errno == 12 => Ok(None),
            None => Err(TransferError::from_errno(resp.errno, resp.errmsg)),
        }
    }

    async fn locate_download(&self, remote_path: &str) -> Result<DownloadLink, TransferError> {
        let url = format!(
            "{}?method=locatedownload&app_id={}&ver=4.0&path={}",
            self.pcs_url("/rest/2.0/pcs/file"),
            self.config.app_id,
            urlencoding::encode(remote_path)
        );

        let response = self
            .client
            .post(&url)
            .header("Cookie", &self.cookie)
            .header("User-Agent", &self.config.user_agent)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, "获取下载链接"))?;

        let resp: LocateDownloadResponse = Self::parse_json(response, "获取下载链接").await?;
        if resp.errno != 0 {
            return Err(TransferError::from_errno(resp.errno, resp.errmsg));
        }

        let best = resp.best_url().ok_or_else(|| TransferError::Remote {
            errno: -1,
            message: format!("未找到可用的下载链接: {}", remote_path),
        })?;

        info!("获取下载链接成功: path={}", remote_path);
        Ok(DownloadLink {
            url: best.to_string(),
            headers: vec![("User-Agent".to_string(), self.config.user_agent.clone())],
        })
    }

    async fn fetch_range(
        &self,
        link: &DownloadLink,
        range: &RangeSpec,
    ) -> Result<RangeStream, TransferError> {
        let Some(range_header) = range.header_value() else {
            return Ok(futures::stream::empty().boxed());
        };

        let mut request = self
            .client
            .get(&link.url)
            .header("Cookie", &self.cookie)
            .header("Range", &range_header);
        for (name, value) in &link.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, "下载区间请求"))?;

        check_range_status(
            response.status(),
            response.content_length(),
            range,
            &range_header,
        )?;

        let stream = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| classify_reqwest_error(e, "读取数据流"))
            })
            .boxed();
        Ok(stream)
    }

    async fn dedup_query(
        &self,
        remote_path: &str,
        signature: &ContentSignature,
        policy: ConflictPolicy,
        allow_rapid: bool,
    ) -> Result<DedupResponse, TransferError> {
        if allow_rapid {
            if let Some(meta) = self.rapid_upload(remote_path, signature, policy).await? {
                return Ok(DedupResponse::Rapid(meta));
            }
        }

        let resp = self.precreate(remote_path, signature, policy).await?;
        if resp.is_rapid_upload() {
            let meta = match resp.info {
                Some(item) => item.into_meta(),
                None => RemoteFileMeta {
                    path: remote_path.to_string(),
                    size: signature.file_size,
                    md5: Some(signature.whole_digest.clone()),
                    fs_id: 0,
                    is_dir: false,
                },
            };
            info!("预创建时服务端已有相同内容: path={}", remote_path);
            return Ok(DedupResponse::Rapid(meta));
        }
        if resp.uploadid.is_empty() {
            return Err(TransferError::Remote {
                errno: -1,
                message: "预创建响应缺少 uploadid".to_string(),
            });
        }
        Ok(DedupResponse::Session {
            upload_id: resp.uploadid,
        })
    }

    async fn upload_slice(
        &self,
        remote_path: &str,
        upload_id: &str,
        index: usize,
        data: Vec<u8>,
    ) -> Result<SliceAck, TransferError> {
        debug!(
            "上传分片: path={}, uploadid={}..., part={}, size={}",
            remote_path,
            upload_id.get(..8).unwrap_or(upload_id),
            index,
            data.len()
        );

        let url = format!(
            "https://{}/rest/2.0/pcs/superfile2?method=upload&app_id={}&type=tmpfile&path={}&uploadid={}&partseq={}",
            self.config.upload_server,
            self.config.app_id,
            urlencoding::encode(remote_path),
            urlencoding::encode(upload_id),
            index
        );

        let part = multipart::Part::bytes(data)
            .file_name("file")
            .mime_str("application/octet-stream")
            .map_err(|e| classify_reqwest_error(e, "构建分片表单"))?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&url)
            .header("Cookie", &self.cookie)
            .header("User-Agent", &self.config.user_agent)
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, "上传分片请求"))?;

        let resp: UploadChunkResponse = Self::parse_json(response, "上传分片").await?;
        if !resp.is_success() {
            warn!(
                "上传分片失败: part={}, error_code={}, error_msg={}",
                index, resp.error_code, resp.error_msg
            );
            return Err(TransferError::from_errno(resp.error_code, resp.error_msg));
        }

        Ok(SliceAck {
            index,
            md5: resp.md5,
        })
    }

    async fn commit(
        &self,
        remote_path: &str,
        upload_id: &str,
        signature: &ContentSignature,
        policy: ConflictPolicy,
    ) -> Result<RemoteFileMeta, TransferError> {
        let url = self.pan_url("/api/create");
        let response = self
            .client
            .post(&url)
            .header("Cookie", &self.cookie)
            .header("User-Agent", &self.config.user_agent)
            .form(&[
                ("path", remote_path.to_string()),
                ("size", signature.file_size.to_string()),
                ("isdir", "0".to_string()),
                ("uploadid", upload_id.to_string()),
                ("rtype", policy.rtype().to_string()),
                ("block_list", signature.block_list_json()),
            ])
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, "创建文件请求"))?;

        let resp: CreateFileResponse = Self::parse_json(response, "创建文件").await?;
        if !resp.is_success() {
            error!(
                "创建文件失败: path={}, errno={}, errmsg={}",
                remote_path, resp.errno, resp.errmsg
            );
            return Err(TransferError::from_errno(resp.errno, resp.errmsg));
        }

        info!("创建文件成功: path={}, fs_id={}", remote_path, resp.fs_id);
        Ok(resp.into_meta())
    }
}
