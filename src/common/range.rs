// 字节范围生成器
//
// 把 [0, total_size) 切分为连续、不重叠、递增的区间，
// 下载按区间发 Range 请求，上传按区间读取分片。

use crate::error::TransferError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 固定数量切分的默认分片数
pub const DEFAULT_SLICE_COUNT: usize = 4;

/// 默认块大小: 4MB
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// 单个字节区间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeSpec {
    /// 区间序号（从 0 开始）
    pub index: usize,
    /// 起始偏移
    pub offset: u64,
    /// 区间长度
    pub length: u64,
}

impl RangeSpec {
    /// 结束偏移（不含）
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// HTTP Range 请求头的值（闭区间）
    ///
    /// 长度为 0 的区间没有合法的 Range 表示，返回 None
    pub fn header_value(&self) -> Option<String> {
        if self.length == 0 {
            return None;
        }
        Some(format!("bytes={}-{}", self.offset, self.end() - 1))
    }
}

/// 切分策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum ChunkingPolicy {
    /// 切成 N 份，余数并入最后一份
    FixedCount(usize),
    /// 按固定块大小切分，最后一块为余数
    BlockSize(u64),
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        ChunkingPolicy::BlockSize(DEFAULT_BLOCK_SIZE)
    }
}

/// 生成覆盖 [0, total_size) 的区间列表
///
/// # 参数
/// * `total_size` - 总字节数
/// * `policy` - 切分策略
///
/// # 返回
/// 按偏移递增排列的区间；`total_size == 0` 时返回单个零长度区间
pub fn generate(total_size: u64, policy: ChunkingPolicy) -> Result<Vec<RangeSpec>, TransferError> {
    match policy {
        ChunkingPolicy::FixedCount(0) => Err(TransferError::InvalidPolicy(
            "分片数量必须大于 0".to_string(),
        )),
        ChunkingPolicy::BlockSize(0) => Err(TransferError::InvalidPolicy(
            "块大小必须大于 0".to_string(),
        )),
        _ if total_size == 0 => Ok(vec![RangeSpec {
            index: 0,
            offset: 0,
            length: 0,
        }]),
        ChunkingPolicy::FixedCount(count) => Ok(split_by_count(total_size, count as u64)),
        ChunkingPolicy::BlockSize(block_size) => Ok(split_by_block(total_size, block_size)),
    }
}

fn split_by_count(total_size: u64, count: u64) -> Vec<RangeSpec> {
    if total_size < count {
        return vec![RangeSpec {
            index: 0,
            offset: 0,
            length: total_size,
        }];
    }

    let each = total_size / count;
    let mut ranges = Vec::with_capacity(count as usize);
    for i in 0..count {
        let offset = i * each;
        // 余数并入最后一个区间
        let length = if i == count - 1 {
            total_size - offset
        } else {
            each
        };
        ranges.push(RangeSpec {
            index: i as usize,
            offset,
            length,
        });
    }
    ranges
}

fn split_by_block(total_size: u64, block_size: u64) -> Vec<RangeSpec> {
    let count = total_size.div_ceil(block_size);
    let mut ranges = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut index = 0usize;

    while offset < total_size {
        let length = block_size.min(total_size - offset);
        ranges.push(RangeSpec {
            index,
            offset,
            length,
        });
        offset += length;
        index += 1;
    }
    ranges
}

/// 区间列表，附带断点续传需要的查询
#[derive(Debug, Clone)]
pub struct RangeList {
    ranges: Vec<RangeSpec>,
    total_size: u64,
}

impl RangeList {
    pub fn new(total_size: u64, policy: ChunkingPolicy) -> Result<Self, TransferError> {
        Ok(Self {
            ranges: generate(total_size, policy)?,
            total_size,
        })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn get(&self, index: usize) -> Option<&RangeSpec> {
        self.ranges.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RangeSpec> {
        self.ranges.iter()
    }

    /// 尚未完成的区间
    pub fn pending<'a>(
        &'a self,
        completed: &'a BTreeSet<usize>,
    ) -> impl Iterator<Item = &'a RangeSpec> + 'a {
        self.ranges
            .iter()
            .filter(move |r| !completed.contains(&r.index))
    }

    /// 尚未完成的字节数
    pub fn pending_bytes(&self, completed: &BTreeSet<usize>) -> u64 {
        self.pending(completed).map(|r| r.length).sum()
    }
}
