// 网盘会话边界

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod session;
pub mod types;

pub use client::PcsClient;
pub use session::{RangeStream, TransferSession};
pub use types::{
    resolve_local_destination, ConflictPolicy, DedupResponse, DownloadLink, RemoteFileMeta,
    SliceAck,
};
