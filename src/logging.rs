//! 日志系统配置
//!
//! 支持控制台输出和文件持久化，文件按天滚动并按数量保留

use crate::config::LogConfig;
use anyhow::{Context, Result};
use std::fs;
use tracing::info;
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀，完整文件名形如 `pcs-transfer.2024-01-01.log`
const LOG_FILE_PREFIX: &str = "pcs-transfer";
const LOG_FILE_SUFFIX: &str = "log";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    file_guard: Option<WorkerGuard>,
}

impl LogGuard {
    pub fn has_file_output(&self) -> bool {
        self.file_guard.is_some()
    }
}

/// 创建按天滚动的非阻塞文件写入器
fn build_file_writer(config: &LogConfig) -> Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("创建日志目录失败: {:?}", config.log_dir))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(config.retention.max(1))
        .build(&config.log_dir)
        .with_context(|| format!("创建日志文件失败: {:?}", config.log_dir))?;

    Ok(tracing_appender::non_blocking(appender))
}

/// 初始化日志系统
///
/// # 参数
/// * `config` - 日志配置
///
/// # 返回
/// 日志守卫，需要保持存活直到程序结束
pub fn init_logging(config: &LogConfig) -> LogGuard {
    // RUST_LOG 优先于配置文件
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(true);

    let file_writer = if config.enabled {
        match build_file_writer(config) {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!("{:#}，回退到仅控制台输出", e);
                None
            }
        }
    } else {
        None
    };

    match file_writer {
        Some((non_blocking, file_guard)) => {
            // 文件输出层（不带 ANSI 颜色）
            let file_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(non_blocking);

            if let Err(e) = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .try_init()
            {
                eprintln!("日志系统已初始化，忽略重复初始化: {}", e);
            }

            info!(
                "日志系统初始化完成: 目录={:?}, 保留文件数={}, 级别={}",
                config.log_dir, config.retention, config.level
            );
            LogGuard {
                file_guard: Some(file_guard),
            }
        }
        None => {
            if let Err(e) = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init()
            {
                eprintln!("日志系统已初始化，忽略重复初始化: {}", e);
            }

            info!("日志系统初始化完成（仅控制台输出）");
            LogGuard { file_guard: None }
        }
    }
}
