use std::fs::Metadata;
use std::ops::Range;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 文件身份：(dev, ino)；非 unix 平台退化为 (0, 0)，仅依赖 size/head 指纹判断轮转
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn of(_meta: &Metadata) -> Self {
        Self::default()
    }
}

/// 头部指纹长度：同 inode 被 copytruncate 后重新写满的场景靠它识别
pub const HEAD_FINGERPRINT_LEN: usize = 128;

pub fn head_hash(head: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(head)
}

/// 为什么要重置 offset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetReason {
    IdentityChanged,
    Truncated,
    HeadChanged,
}

/// 单个被监控文件的读取状态
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub path: PathBuf,
    pub identity: FileIdentity,
    pub last_offset: u64,
    pub last_size: u64,
    pub last_seen_at: DateTime<Utc>,
    /// 每次重置 +1，参与去重键
    pub epoch: u64,
    /// 最近一次提交时文件头部的指纹（长度 + xxh3）
    pub head_len: u32,
    pub head_hash: u64,
}

impl FileState {
    pub fn new(path: PathBuf, identity: FileIdentity, now: DateTime<Utc>) -> Self {
        Self {
            path,
            identity,
            last_offset: 0,
            last_size: 0,
            last_seen_at: now,
            epoch: 0,
            head_len: 0,
            head_hash: 0,
        }
    }

    /// 与当前观测比较，判断是否发生轮转/截断。
    ///
    /// `head` 只需在 `head_len > 0` 时提供同长度的文件头部字节。
    pub fn detect_reset(
        &self,
        identity: FileIdentity,
        size: u64,
        head: Option<&[u8]>,
    ) -> Option<ResetReason> {
        if identity != self.identity {
            return Some(ResetReason::IdentityChanged);
        }
        if size < self.last_offset {
            return Some(ResetReason::Truncated);
        }
        if self.head_len > 0 {
            match head {
                Some(h) if h.len() == self.head_len as usize && head_hash(h) == self.head_hash => {}
                _ => return Some(ResetReason::HeadChanged),
            }
        }
        None
    }

    /// 重置为“全新文件”：offset 归零，epoch 前进
    pub fn reset(&mut self, identity: FileIdentity) {
        self.identity = identity;
        self.last_offset = 0;
        self.last_size = 0;
        self.head_len = 0;
        self.head_hash = 0;
        self.epoch += 1;
    }

    /// 尚未消费的字节区间
    pub fn pending_range(&self, size: u64) -> Range<u64> {
        self.last_offset.min(size)..size
    }

    /// 成功写入 Index Store 后推进 offset
    pub fn commit(&mut self, offset: u64, size: u64, head: Option<&[u8]>, now: DateTime<Utc>) {
        self.last_offset = offset.max(self.last_offset);
        self.last_size = size;
        self.last_seen_at = now;
        if self.head_len == 0 {
            if let Some(h) = head.filter(|h| !h.is_empty()) {
                self.head_len = h.len() as u32;
                self.head_hash = head_hash(h);
            }
        }
    }
}
