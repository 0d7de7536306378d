use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::core::Clock;
use crate::error::StoreError;
use crate::index::IndexStore;
use crate::parser::LineParser;
use crate::stats::IngestStats;
use crate::tracker::{head_for_commit, ScanItem};

/// 单个文件一次处理的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    /// 已写入并提交 offset
    Committed { records: usize, duplicates: usize, bytes: u64 },
    /// 没有完整行可消费（尾部残行等待下一个换行符）
    Pending,
    ReadFailed,
    /// Index Store 不可用，offset 未提交
    StoreUnavailable,
}

/// 读取 `[start, end)`；tail_only 时多读前一个字节，用来判断首行是否完整。
/// 返回缓冲区及其首字节在文件中的偏移。
fn read_range(path: &Path, range: &Range<u64>, tail_only: bool) -> io::Result<(Vec<u8>, u64)> {
    let base = if tail_only && range.start > 0 {
        range.start - 1
    } else {
        range.start
    };
    let mut f = File::open(path)?;
    f.seek(SeekFrom::Start(base))?;
    let mut buf = Vec::with_capacity((range.end - base) as usize);
    f.take(range.end - base).read_to_end(&mut buf)?;
    Ok((buf, base))
}

/// 处理一个文件增量：读取完整行、解析、整批写入 Index Store，成功后推进 offset。
///
/// 写入失败时不提交，下一轮从原 offset 重读；重复由 Index Store 去重吸收。
pub fn process_file(
    item: ScanItem,
    parser: &LineParser,
    store: &IndexStore,
    clock: &dyn Clock,
    stats: &IngestStats,
) -> FileOutcome {
    if let Some(reason) = item.reset {
        stats.rotations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Reading {:?} from offset 0 after {:?}", item.path, reason);
    }

    let (buf, base) = match read_range(&item.path, &item.range, item.tail_only) {
        Ok(v) => v,
        Err(e) => {
            stats.read_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Failed to read {:?}: {}", item.path, e);
            return FileOutcome::ReadFailed;
        }
    };

    // 尾部窗口的首行多半是残行，丢弃
    let mut pos = 0usize;
    let mut resynced = false;
    if item.tail_only && base < item.range.start {
        match buf.iter().position(|&b| b == b'\n') {
            Some(i) => {
                pos = i + 1;
                resynced = true;
            }
            None => pos = buf.len(),
        }
    }

    let Some(last_nl) = buf[pos..].iter().rposition(|&b| b == b'\n') else {
        if resynced {
            // 残行已结束，换行符之后是行边界
            let boundary = base + pos as u64;
            let head = head_for_commit(&item.path, boundary);
            item.lease.commit(boundary, item.size, head.as_deref(), clock);
        }
        // 窗口内没有换行时不提交：offset 只能停在行边界上
        return FileOutcome::Pending;
    };
    let end = pos + last_nl + 1;
    let consumed_to = base + end as u64;

    let mut records = Vec::new();
    let mut line_start = pos;
    for line in buf[pos..end].split_inclusive(|&b| b == b'\n') {
        let offset = base + line_start as u64;
        line_start += line.len();
        let text = String::from_utf8_lossy(line);
        if let Some(rec) = parser.parse(&text, &item.context, Some(offset)) {
            records.push(rec);
        }
    }

    let bytes = consumed_to - item.range.start.min(consumed_to);
    stats.files_read.fetch_add(1, Ordering::Relaxed);
    stats.bytes_read.fetch_add(bytes, Ordering::Relaxed);

    match store.put(records) {
        Ok(report) => {
            stats
                .records_ingested
                .fetch_add(report.inserted as u64, Ordering::Relaxed);
            stats
                .duplicates
                .fetch_add(report.duplicates as u64, Ordering::Relaxed);
            let head = head_for_commit(&item.path, consumed_to);
            if !item.lease.commit(consumed_to, item.size, head.as_deref(), clock) {
                tracing::debug!("State of {:?} was reset while reading, not committing", item.path);
            }
            FileOutcome::Committed {
                records: report.inserted,
                duplicates: report.duplicates,
                bytes,
            }
        }
        Err(StoreError::Closed) => {
            stats.store_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Index store unavailable, leaving {:?} at offset {}",
                item.path,
                item.lease.last_offset()
            );
            FileOutcome::StoreUnavailable
        }
    }
}
