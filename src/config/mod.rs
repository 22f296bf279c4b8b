// 配置管理模块
//
// 配置只在启动时加载一次，再转换成各组件的选项结构传入构造函数

use crate::downloader::DownloadOptions;
use crate::executor::{ExecutorConfig, DEFAULT_MAX_RETRY, DEFAULT_PARALLEL};
use crate::netdisk::ConflictPolicy;
use crate::persistence::ProgressStore;
use crate::uploader::UploadOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const MB: u64 = 1024 * 1024;

/// 应用配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// 执行器配置
    #[serde(default)]
    pub executor: ExecutorSection,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 网盘接口配置
    #[serde(default)]
    pub pcs: PcsConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 执行器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorSection {
    /// 同时运行的单元数
    #[serde(default = "default_parallel")]
    pub parallel: usize,
    /// 单元级最大重试次数
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// 单元级重试前的等待（毫秒）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// 单次运行时限（秒），0 表示不限
    #[serde(default)]
    pub unit_timeout_secs: u64,
    /// 小文件优先
    #[serde(default)]
    pub small_first: bool,
    /// 互斥键被占用时的重新调度间隔（毫秒）
    #[serde(default = "default_key_busy_delay_ms")]
    pub key_busy_delay_ms: u64,
}

fn default_parallel() -> usize {
    DEFAULT_PARALLEL
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_key_busy_delay_ms() -> u64 {
    500
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            max_retry: default_max_retry(),
            retry_backoff_ms: default_retry_backoff_ms(),
            unit_timeout_secs: 0,
            small_first: false,
            key_busy_delay_ms: default_key_busy_delay_ms(),
        }
    }
}

impl ExecutorSection {
    pub fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            parallel: self.parallel,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            unit_timeout: (self.unit_timeout_secs > 0)
                .then(|| Duration::from_secs(self.unit_timeout_secs)),
            small_first: self.small_first,
            key_busy_delay: Duration::from_millis(self.key_busy_delay_ms),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadConfig {
    /// 区间大小 (MB)
    #[serde(default = "default_block_size_mb")]
    pub block_size_mb: u64,
    /// 区间级重试次数
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,
    /// 单文件限速（字节/秒），0 表示不限
    #[serde(default)]
    pub max_rate: u64,
    /// 下载完成后校验 MD5
    #[serde(default = "default_verify")]
    pub verify: bool,
    /// 本地文件已存在时的处理方式
    #[serde(default)]
    pub conflict: ConflictPolicy,
    /// 单文件同时拉取的区间数
    #[serde(default = "default_range_parallel")]
    pub range_parallel: usize,
}

fn default_block_size_mb() -> u64 {
    4
}

fn default_chunk_retries() -> u32 {
    3
}

fn default_verify() -> bool {
    true
}

fn default_range_parallel() -> usize {
    1
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            block_size_mb: default_block_size_mb(),
            chunk_retries: default_chunk_retries(),
            max_rate: 0,
            verify: default_verify(),
            conflict: ConflictPolicy::default(),
            range_parallel: default_range_parallel(),
        }
    }
}

impl DownloadConfig {
    pub fn to_options(&self) -> DownloadOptions {
        DownloadOptions {
            block_size: self.block_size_mb * MB,
            chunk_retries: self.chunk_retries,
            max_rate: self.max_rate,
            verify: self.verify,
            conflict: self.conflict,
            range_parallel: self.range_parallel,
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    /// 分片大小 (MB)，百度网盘上传分片最小 4MB
    #[serde(default = "default_slice_size_mb")]
    pub slice_size_mb: u64,
    /// 分片级重试次数
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,
    /// 单文件限速（字节/秒），0 表示不限
    #[serde(default)]
    pub max_rate: u64,
    /// 禁用秒传
    #[serde(default)]
    pub no_rapid_upload: bool,
    /// 网盘文件已存在时的处理方式
    #[serde(default)]
    pub conflict: ConflictPolicy,
}

fn default_slice_size_mb() -> u64 {
    4
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            slice_size_mb: default_slice_size_mb(),
            chunk_retries: default_chunk_retries(),
            max_rate: 0,
            no_rapid_upload: false,
            conflict: ConflictPolicy::default(),
        }
    }
}

impl UploadConfig {
    pub fn to_options(&self) -> UploadOptions {
        UploadOptions {
            slice_size: self.slice_size_mb * MB,
            chunk_retries: self.chunk_retries,
            max_rate: self.max_rate,
            no_rapid_upload: self.no_rapid_upload,
            conflict: self.conflict,
        }
    }
}

/// 持久化配置
///
/// 上传进度记录目录及过期清理
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    /// 上传进度目录
    #[serde(default = "default_progress_dir")]
    pub progress_dir: PathBuf,
    /// 进度记录保留天数（超过此天数未更新的记录将被清理）
    #[serde(default = "default_progress_retention_days")]
    pub retention_days: u64,
}

fn default_progress_dir() -> PathBuf {
    PathBuf::from("progress")
}

fn default_progress_retention_days() -> u64 {
    7
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            progress_dir: default_progress_dir(),
            retention_days: default_progress_retention_days(),
        }
    }
}

impl PersistenceConfig {
    /// 打开进度存储并清理过期记录
    pub fn open_store(&self) -> Result<ProgressStore> {
        let store = ProgressStore::open(&self.progress_dir)
            .with_context(|| format!("打开进度目录失败: {:?}", self.progress_dir))?;
        if self.retention_days > 0 {
            store
                .cleanup_expired(self.retention_days)
                .context("清理过期进度记录失败")?;
        }
        Ok(store)
    }
}

/// 网盘接口配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PcsConfig {
    #[serde(default = "default_pcs_base_url")]
    pub pcs_base_url: String,
    #[serde(default = "default_pan_base_url")]
    pub pan_base_url: String,
    #[serde(default = "default_app_id")]
    pub app_id: u32,
    /// 上传服务器域名
    #[serde(default = "default_upload_server")]
    pub upload_server: String,
    /// 模拟网盘 Android 客户端，Locate 下载接口需要此 UA
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_pcs_base_url() -> String {
    "https://pcs.baidu.com".to_string()
}

fn default_pan_base_url() -> String {
    "https://pan.baidu.com".to_string()
}

fn default_app_id() -> u32 {
    250528
}

fn default_upload_server() -> String {
    "d.pcs.baidu.com".to_string()
}

fn default_user_agent() -> String {
    "netdisk;P2SP;3.0.0.8;netdisk;11.12.3;ANG-AN00;android-android;10.0;JSbridge4.4.0;jointBridge;1.1.0;".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for PcsConfig {
    fn default() -> Self {
        Self {
            pcs_base_url: default_pcs_base_url(),
            pan_base_url: default_pan_base_url(),
            app_id: default_app_id(),
            upload_server: default_upload_server(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 保留的日志文件数（按天滚动）
    #[serde(default = "default_log_retention")]
    pub retention: usize,
    /// 日志级别（默认 info），RUST_LOG 优先
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention() -> usize {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention: default_log_retention(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 校验配置组合
    pub fn validate(&self) -> Result<()> {
        if self.executor.parallel == 0 {
            anyhow::bail!("executor.parallel 必须大于 0");
        }
        if self.download.block_size_mb == 0 {
            anyhow::bail!("download.block_size_mb 必须大于 0");
        }
        if self.download.range_parallel == 0 {
            anyhow::bail!("download.range_parallel 必须大于 0");
        }
        if self.upload.slice_size_mb == 0 {
            anyhow::bail!("upload.slice_size_mb 必须大于 0");
        }
        if self.upload.conflict == ConflictPolicy::Rsync && self.upload.no_rapid_upload {
            anyhow::bail!("upload.conflict = rsync 依赖内容摘要比对，不能与 no_rapid_upload 同时使用");
        }
        if self.pcs.request_timeout_secs == 0 {
            anyhow::bail!("pcs.request_timeout_secs 必须大于 0");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;
        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
            }
        }

        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;

        tracing::info!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();
                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {:#}", e);
                    }
                }
                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.executor.parallel, 4);
        assert_eq!(config.executor.max_retry, 3);
        assert_eq!(config.download.block_size_mb, 4);
        assert_eq!(config.upload.slice_size_mb, 4);
        assert!(config.download.verify);
        assert_eq!(config.upload.conflict, ConflictPolicy::Overwrite);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conversions() {
        let config = AppConfig::default();

        let exec = config.executor.to_executor_config();
        assert_eq!(exec.parallel, 4);
        assert_eq!(exec.unit_timeout, None);
        assert_eq!(exec.retry_backoff, Duration::from_millis(1000));

        let download = config.download.to_options();
        assert_eq!(download, DownloadOptions::default());

        let upload = config.upload.to_options();
        assert_eq!(upload, UploadOptions::default());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [executor]
            parallel = 8
            unit_timeout_secs = 30

            [upload]
            conflict = "rename"
            "#,
        )
        .unwrap();

        assert_eq!(config.executor.parallel, 8);
        assert_eq!(
            config.executor.to_executor_config().unit_timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.executor.max_retry, 3);
        assert_eq!(config.upload.conflict, ConflictPolicy::Rename);
        assert_eq!(config.upload.slice_size_mb, 4);
        assert_eq!(config.pcs.app_id, 250528);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: std::result::Result<AppConfig, _> = toml::from_str(
            r#"
            [download]
            chunk_size_mb = 4
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_combinations() {
        let mut config = AppConfig::default();
        config.executor.parallel = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.download.block_size_mb = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.slice_size_mb = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.conflict = ConflictPolicy::Rsync;
        config.upload.no_rapid_upload = true;
        assert!(config.validate().is_err());

        config.upload.no_rapid_upload = false;
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf/app.toml");

        let mut config = AppConfig::default();
        config.executor.parallel = 2;
        config.download.conflict = ConflictPolicy::Skip;
        config.save_to_file(&path).await.unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_load_or_default_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");

        let config = AppConfig::load_or_default(&path).await;
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        std::fs::write(&path, "[executor]\nparallel = 0\n").unwrap();
        assert!(AppConfig::load_from_file(&path).await.is_err());
    }

    #[test]
    fn test_open_store_creates_dir() {
        let dir = TempDir::new().unwrap();
        let config = PersistenceConfig {
            progress_dir: dir.path().join("progress"),
            retention_days: 7,
        };
        let store = config.open_store().unwrap();
        assert!(store.dir().is_dir());
    }
}
