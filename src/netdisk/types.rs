// 网盘传输边界的数据类型
//
// 上半部分是引擎与会话之间的领域类型，
// 下半部分是 PCS 接口的响应结构（仅 PcsClient 使用）

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 网盘文件元信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileMeta {
    pub path: String,
    pub size: u64,
    /// 服务端记录的 MD5，部分老文件为空
    pub md5: Option<String>,
    pub fs_id: u64,
    pub is_dir: bool,
}

/// 有时效的下载直链
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadLink {
    pub url: String,
    /// 请求直链时需要附带的头（User-Agent、Referer 等）
    pub headers: Vec<(String, String)>,
}

/// 秒传查询结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupResponse {
    /// 服务端已有相同内容，文件已直接生成
    Rapid(RemoteFileMeta),
    /// 需要普通上传，附带服务端上传会话 ID
    Session { upload_id: String },
}

/// 分片上传确认
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceAck {
    pub index: usize,
    /// 服务端计算的分片 MD5
    pub md5: String,
}

/// 目标已存在时的处理策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// 报错
    Fail,
    /// 覆盖
    #[default]
    Overwrite,
    /// 跳过
    Skip,
    /// 另存为新副本（`name (1).ext`）
    Rename,
    /// 大小与摘要一致时跳过，否则覆盖
    Rsync,
}

impl ConflictPolicy {
    /// 百度 create/precreate 接口的 rtype 参数
    ///
    /// 0 = 冲突时失败，1 = 冲突时重命名，3 = 冲突时覆盖
    pub fn rtype(&self) -> u8 {
        match self {
            ConflictPolicy::Fail | ConflictPolicy::Skip => 0,
            ConflictPolicy::Rename => 1,
            ConflictPolicy::Overwrite | ConflictPolicy::Rsync => 3,
        }
    }
}

/// 为本地文件找一个不冲突的路径：`name.ext` → `name (1).ext` → `name (2).ext` …
pub fn resolve_local_destination(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

// =====================================================
// PCS 接口响应
// =====================================================

/// filemetas 响应
#[derive(Debug, Deserialize)]
pub struct FileMetasResponse {
    pub errno: i32,

    #[serde(default)]
    pub errmsg: String,

    #[serde(default)]
    pub info: Vec<FileMetaItem>,
}

#[derive(Debug, Deserialize)]
pub struct FileMetaItem {
    /// 单条目错误码（-9 表示不存在）
    #[serde(default)]
    pub errno: i32,

    #[serde(default)]
    pub fs_id: u64,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub md5: String,

    #[serde(default)]
    pub isdir: i32,
}

impl FileMetaItem {
    pub fn into_meta(self) -> RemoteFileMeta {
        RemoteFileMeta {
            path: self.path,
            size: self.size,
            md5: if self.md5.is_empty() {
                None
            } else {
                Some(self.md5.to_ascii_lowercase())
            },
            fs_id: self.fs_id,
            is_dir: self.isdir == 1,
        }
    }
}

/// locatedownload 响应
#[derive(Debug, Deserialize)]
pub struct LocateDownloadResponse {
    #[serde(default)]
    pub errno: i32,

    #[serde(default)]
    pub errmsg: String,

    #[serde(default)]
    pub urls: Vec<LocateUrl>,
}

#[derive(Debug, Deserialize)]
pub struct LocateUrl {
    pub url: String,

    /// 1 = 加密链接，不可直接使用
    #[serde(default)]
    pub encrypt: i32,

    #[serde(default)]
    pub rank: i32,
}

impl LocateDownloadResponse {
    /// 非加密链接中 rank 最小的一个，跳过 nb.cache 节点（除非别无选择）
    pub fn best_url(&self) -> Option<&str> {
        let mut usable: Vec<&LocateUrl> = self.urls.iter().filter(|u| u.encrypt == 0).collect();
        usable.sort_by_key(|u| u.rank);
        usable
            .iter()
            .copied()
            .find(|u| !is_nb_cache(&u.url))
            .or_else(|| usable.first().copied())
            .map(|u| u.url.as_str())
    }
}

fn is_nb_cache(url: &str) -> bool {
    url.starts_with("http://nb.cache") || url.starts_with("https://nb.cache")
}

/// 秒传响应
#[derive(Debug, Deserialize)]
pub struct RapidUploadResponse {
    /// - 0: 秒传成功
    /// - 404: 服务端无此内容（需要普通上传）
    /// - 31079: 校验失败（MD5 不匹配）
    pub errno: i32,

    #[serde(default)]
    pub errmsg: String,

    #[serde(default)]
    pub info: Option<FileMetaItem>,
}

impl RapidUploadResponse {
    pub fn is_success(&self) -> bool {
        self.errno == 0
    }

    /// 是否应退回普通上传
    pub fn needs_upload(&self) -> bool {
        matches!(self.errno, 404 | 31079)
    }
}

/// 预创建响应
#[derive(Debug, Deserialize)]
pub struct PrecreateResponse {
    pub errno: i32,

    /// 1 = 普通上传，2 = 秒传成功
    #[serde(default)]
    pub return_type: i32,

    #[serde(default)]
    pub uploadid: String,

    #[serde(default)]
    pub info: Option<FileMetaItem>,

    #[serde(default)]
    pub errmsg: String,
}

impl PrecreateResponse {
    pub fn is_rapid_upload(&self) -> bool {
        self.return_type == 2
    }
}

/// superfile2 分片上传响应
#[derive(Debug, Deserialize)]
pub struct UploadChunkResponse {
    #[serde(default)]
    pub error_code: i32,

    #[serde(default)]
    pub md5: String,

    #[serde(default)]
    pub error_msg: String,
}

impl UploadChunkResponse {
    pub fn is_success(&self) -> bool {
        self.error_code == 0 && !self.md5.is_empty()
    }
}

/// create 响应
#[derive(Debug, Deserialize)]
pub struct CreateFileResponse {
    pub errno: i32,

    #[serde(default)]
    pub fs_id: u64,

    #[serde(default)]
    pub md5: String,

    #[serde(default)]
    pub path: String,

    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub isdir: i32,

    #[serde(default)]
    pub errmsg: String,
}

impl CreateFileResponse {
    pub fn is_success(&self) -> bool {
        self.errno == 0 && self.fs_id > 0
    }

    pub fn into_meta(self) -> RemoteFileMeta {
        RemoteFileMeta {
            path: self.path,
            size: self.size,
            md5: if self.md5.is_empty() {
                None
            } else {
                Some(self.md5)
            },
            fs_id: self.fs_id,
            is_dir: self.isdir == 1,
        }
    }
}
