// 下载模块

pub mod chunk;
pub mod unit;

pub use chunk::{prepare_file, RangeFetcher};
pub use unit::{DownloadOptions, DownloadUnit};
