//! 上传断点续传的持久化
//!
//! - `types`: 进度键与进度记录
//! - `progress_store`: 记录的原子读写、租约与过期清理

pub mod progress_store;
pub mod types;

pub use progress_store::{KeyLease, ProgressStore};
pub use types::{canonical_path, ProgressKey, UploadProgressRecord};
