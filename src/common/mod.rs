// 传输引擎的基础组件

pub mod range;
pub mod rate_limiter;
pub mod retry;
pub mod signature;
pub mod statistic;

pub use range::{generate, ChunkingPolicy, RangeList, RangeSpec, DEFAULT_BLOCK_SIZE, DEFAULT_SLICE_COUNT};
pub use rate_limiter::RateLimiter;
pub use retry::{calculate_backoff_delay, with_chunk_retry, DEFAULT_CHUNK_RETRIES};
pub use signature::{ContentSignature, DigestAlgorithm, SignatureEngine, SliceDigest};
pub use statistic::{Statistic, StatisticSnapshot, TransferReporter};
