// 上传模块
//
// - `chunk`: 分片读取与单片上传（带分片级重试）
// - `unit`: 上传单元（秒传、断点续传、提交）

pub mod chunk;
pub mod unit;

pub use chunk::{read_slice, SliceUploader, DEFAULT_UPLOAD_SLICE_SIZE};
pub use unit::{UploadOptions, UploadUnit};
