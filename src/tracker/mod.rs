pub mod layout;
pub mod matcher;

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ignore::WalkBuilder;
use parking_lot::Mutex;

use crate::core::{Clock, FileIdentity, FileState, ResetReason, HEAD_FINGERPRINT_LEN};
use crate::parser::ParseContext;

pub use layout::PathLayout;
pub use matcher::{create_matcher, Matcher, PatternSet};

#[derive(Clone, Debug)]
pub struct TrackerConfig {
    pub roots: Vec<PathBuf>,
    pub patterns: Vec<String>,
    /// 单次增量超过该值时只读尾部窗口
    pub max_file_size: u64,
    pub tail_window: u64,
    /// 消失文件的 epoch 保留多久（应不短于记录的 TTL）
    pub forget_after: Duration,
}

/// 一个被跟踪文件：状态 + 独占租约标记
struct TrackedFile {
    layout: PathLayout,
    state: Mutex<FileState>,
    in_flight: AtomicBool,
}

/// 文件独占租约：持有期间其它扫描不会再返回该文件；Drop 时释放
pub struct FileLease {
    file: Arc<TrackedFile>,
    epoch: u64,
}

impl FileLease {
    /// 成功写入后推进 offset（epoch 不一致说明状态已被重置，放弃提交）
    pub fn commit(&self, offset: u64, size: u64, head: Option<&[u8]>, clock: &dyn Clock) -> bool {
        let mut st = self.file.state.lock();
        if st.epoch != self.epoch {
            return false;
        }
        st.commit(offset, size, head, clock.now());
        true
    }

    pub fn last_offset(&self) -> u64 {
        self.file.state.lock().last_offset
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        self.file.in_flight.store(false, Ordering::Release);
    }
}

/// 单个文件本轮待消费的增量
pub struct ScanItem {
    pub path: PathBuf,
    pub range: Range<u64>,
    pub size: u64,
    pub reset: Option<ResetReason>,
    /// 增量超限，只读尾部窗口（首个残行需丢弃）
    pub tail_only: bool,
    pub context: ParseContext,
    pub lease: FileLease,
}

impl std::fmt::Debug for ScanItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanItem")
            .field("path", &self.path)
            .field("range", &self.range)
            .field("size", &self.size)
            .field("reset", &self.reset)
            .field("tail_only", &self.tail_only)
            .finish()
    }
}

/// 消失文件留下的最后 epoch
#[derive(Clone, Copy, Debug)]
struct Tombstone {
    epoch: u64,
    vanished_at: DateTime<Utc>,
}

/// File Tracker：发现日志文件、维护 per-file offset/identity，返回增量字节区间
pub struct FileTracker {
    config: TrackerConfig,
    patterns: PatternSet,
    states: DashMap<PathBuf, Arc<TrackedFile>>,
    /// 同一路径重新出现时从 `epoch + 1` 开始，与仍在缓存里的旧记录不撞去重键
    tombstones: DashMap<PathBuf, Tombstone>,
    clock: Arc<dyn Clock>,
}

impl FileTracker {
    pub fn new(config: TrackerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            patterns: PatternSet::new(&config.patterns),
            config,
            states: DashMap::new(),
            tombstones: DashMap::new(),
            clock,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.config.roots
    }

    pub fn missing_roots(&self) -> Vec<PathBuf> {
        self.config
            .roots
            .iter()
            .filter(|r| !r.is_dir())
            .cloned()
            .collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.states.len()
    }

    /// 路径是否落在监控范围内且匹配模式（事件过滤用）
    pub fn is_relevant(&self, path: &Path) -> bool {
        self.root_of(path).is_some() && self.patterns.matches(path)
    }

    fn root_of(&self, path: &Path) -> Option<&PathBuf> {
        self.config
            .roots
            .iter()
            .filter(|r| path.starts_with(r))
            .max_by_key(|r| r.as_os_str().len())
    }

    fn discover(&self) -> HashSet<PathBuf> {
        let mut found = HashSet::new();
        for root in &self.config.roots {
            let walker = WalkBuilder::new(root)
                .standard_filters(false)
                .follow_links(false)
                .build();
            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!("Walk error under {:?}: {}", root, e);
                        continue;
                    }
                };
                if entry.file_type().is_some_and(|ft| ft.is_file())
                    && self.patterns.matches(entry.path())
                {
                    found.insert(entry.into_path());
                }
            }
        }
        found
    }

    /// 扫描所有根目录，返回每个文件“恰好”的增量区间。
    ///
    /// 正在被其它 worker 处理的文件本轮跳过；消失的文件移出跟踪表。
    pub fn scan(&self) -> Vec<ScanItem> {
        let found = self.discover();
        let now = self.clock.now();
        self.states.retain(|path, file| {
            let keep = found.contains(path) || file.in_flight.load(Ordering::Acquire);
            if !keep {
                let epoch = file.state.lock().epoch;
                tracing::debug!("File vanished, dropping state: {:?} (epoch {})", path, epoch);
                self.tombstones.insert(
                    path.clone(),
                    Tombstone {
                        epoch,
                        vanished_at: now,
                    },
                );
            }
            keep
        });
        self.tombstones
            .retain(|_, t| now - t.vanished_at < self.config.forget_after);

        let mut paths: Vec<PathBuf> = found.into_iter().collect();
        paths.sort();
        paths
            .into_iter()
            .filter_map(|path| self.check_file(path))
            .collect()
    }

    fn check_file(&self, path: PathBuf) -> Option<ScanItem> {
        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Stat failed for {:?}: {}", path, e);
                return None;
            }
        };
        let root = self.root_of(&path)?.clone();
        let identity = FileIdentity::of(&meta);
        let size = meta.len();
        let now = self.clock.now();

        let file = self
            .states
            .entry(path.clone())
            .or_insert_with(|| {
                let mut state = FileState::new(path.clone(), identity, now);
                if let Some((_, t)) = self.tombstones.remove(&path) {
                    state.epoch = t.epoch + 1;
                    tracing::info!("File reappeared: {:?}, starting at epoch {}", path, state.epoch);
                }
                Arc::new(TrackedFile {
                    layout: PathLayout::derive(&root, &path),
                    state: Mutex::new(state),
                    in_flight: AtomicBool::new(false),
                })
            })
            .clone();

        if file
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        // 从这里起 lease 负责释放 in_flight
        let mut lease = FileLease {
            file: file.clone(),
            epoch: 0,
        };

        let mut st = file.state.lock();
        let head = if st.head_len > 0 {
            read_head(&path, st.head_len as usize)
        } else {
            None
        };
        let reset = st.detect_reset(identity, size, head.as_deref());
        if let Some(reason) = reset {
            tracing::info!(
                "Rotation detected for {:?} ({:?}), restarting at offset 0",
                path,
                reason
            );
            st.reset(identity);
        }
        st.last_seen_at = now;

        let mut range = st.pending_range(size);
        lease.epoch = st.epoch;
        if range.is_empty() {
            st.last_size = size;
            return None;
        }

        let mut tail_only = false;
        if range.end - range.start > self.config.max_file_size {
            let start = range.end.saturating_sub(self.config.tail_window).max(range.start);
            tracing::warn!(
                "Delta of {} bytes in {:?} exceeds max_file_size, reading last {} bytes only",
                range.end - range.start,
                path,
                range.end - start
            );
            range.start = start;
            tail_only = true;
        }

        let context = ParseContext {
            host: file.layout.host.clone(),
            application: file.layout.application.clone(),
            component: file.layout.component.clone(),
            file_path: path.to_string_lossy().into_owned(),
            metadata: file.layout.metadata.clone(),
            epoch: st.epoch,
            scanned_at: now,
        };
        drop(st);

        Some(ScanItem {
            path,
            range,
            size,
            reset,
            tail_only,
            context,
            lease,
        })
    }

    /// 当前所有文件状态（checkpoint / `/api/files`）
    pub fn snapshot(&self) -> Vec<FileState> {
        let mut out: Vec<FileState> = self
            .states
            .iter()
            .map(|e| e.value().state.lock().clone())
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    /// 从 checkpoint 恢复；不在任何根目录下的条目忽略
    pub fn restore(&self, states: Vec<FileState>) -> usize {
        let mut restored = 0;
        for st in states {
            let Some(root) = self.root_of(&st.path).cloned() else {
                continue;
            };
            let path = st.path.clone();
            self.states.insert(
                path.clone(),
                Arc::new(TrackedFile {
                    layout: PathLayout::derive(&root, &path),
                    state: Mutex::new(st),
                    in_flight: AtomicBool::new(false),
                }),
            );
            restored += 1;
        }
        restored
    }
}

/// 读取文件头部指纹所需字节；文件比指纹短时返回 None
pub fn read_head(path: &Path, len: usize) -> Option<Vec<u8>> {
    let mut f = File::open(path).ok()?;
    let mut buf = vec![0u8; len];
    f.read_exact(&mut buf).ok()?;
    Some(buf)
}

/// commit 时记录的头部：至多 HEAD_FINGERPRINT_LEN 字节，且不超过已消费范围
pub fn head_for_commit(path: &Path, consumed_to: u64) -> Option<Vec<u8>> {
    let len = (HEAD_FINGERPRINT_LEN as u64).min(consumed_to) as usize;
    if len == 0 {
        return None;
    }
    read_head(path, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SystemClock;
    use std::io::Write;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("centralog-{}-{}", tag, nanos))
    }

    fn tracker(root: &Path, max: u64, tail: u64) -> FileTracker {
        FileTracker::new(
            TrackerConfig {
                roots: vec![root.to_path_buf()],
                patterns: vec!["*.log".into()],
                max_file_size: max,
                tail_window: tail,
                forget_after: Duration::days(1),
            },
            Arc::new(SystemClock),
        )
    }

    fn append(path: &Path, data: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    fn commit(item: &ScanItem) {
        let head = head_for_commit(&item.path, item.range.end);
        assert!(item.lease.commit(item.range.end, item.size, head.as_deref(), &SystemClock));
    }

    #[test]
    fn returns_only_new_bytes() {
        let root = unique_tmp_dir("delta");
        let dir = root.join("ssdev/app");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("a.log");
        append(&file, "one\ntwo\n");
        std::fs::write(dir.join("ignored.txt"), "x").unwrap();

        let t = tracker(&root, 1 << 20, 1024);
        let items = t.scan();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].range, 0..8);
        assert_eq!(items[0].context.host, "ssdev");
        commit(&items[0]);
        drop(items);

        assert!(t.scan().is_empty());

        append(&file, "three\n");
        let items = t.scan();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].range, 8..14);
        assert!(items[0].reset.is_none());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn in_flight_files_are_skipped() {
        let root = unique_tmp_dir("lease");
        let dir = root.join("h/a");
        std::fs::create_dir_all(&dir).unwrap();
        append(&dir.join("x.log"), "line\n");

        let t = tracker(&root, 1 << 20, 1024);
        let first = t.scan();
        assert_eq!(first.len(), 1);
        assert!(t.scan().is_empty(), "leased file must not be handed out twice");
        drop(first);
        assert_eq!(t.scan().len(), 1);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn truncation_resets_to_zero() {
        let root = unique_tmp_dir("trunc");
        let dir = root.join("h/a");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("x.log");
        append(&file, "old line one\nold line two\n");

        let t = tracker(&root, 1 << 20, 1024);
        let items = t.scan();
        commit(&items[0]);
        let epoch0 = items[0].context.epoch;
        drop(items);

        std::fs::write(&file, "").unwrap();
        append(&file, "new\n");
        let items = t.scan();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].range, 0..4);
        assert!(items[0].reset.is_some());
        assert!(items[0].context.epoch > epoch0);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn recreated_file_starts_a_new_epoch() {
        let root = unique_tmp_dir("recreate");
        let dir = root.join("h/a");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("a.log");
        append(&file, "old one\nold two\n");

        let t = tracker(&root, 1 << 20, 1024);
        let items = t.scan();
        commit(&items[0]);
        let first_epoch = items[0].context.epoch;
        drop(items);

        // logrotate：改名为不匹配模式的 a.log.1，扫描一轮后再新建 a.log
        std::fs::rename(&file, dir.join("a.log.1")).unwrap();
        assert!(t.scan().is_empty());
        assert_eq!(t.tracked_count(), 0);

        append(&file, "new one\n");
        let items = t.scan();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].range, 0..8);
        assert!(items[0].context.epoch > first_epoch);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn oversized_delta_reads_tail_only() {
        let root = unique_tmp_dir("tail");
        let dir = root.join("h/a");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("big.log");
        append(&file, &"0123456789\n".repeat(100));

        let t = tracker(&root, 500, 100);
        let items = t.scan();
        assert_eq!(items.len(), 1);
        assert!(items[0].tail_only);
        assert_eq!(items[0].range, 1000..1100);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn snapshot_restore_resumes_offsets() {
        let root = unique_tmp_dir("restore");
        let dir = root.join("h/a");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("x.log");
        append(&file, "a\nb\n");

        let t = tracker(&root, 1 << 20, 1024);
        let items = t.scan();
        commit(&items[0]);
        drop(items);
        let saved = t.snapshot();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].last_offset, 4);

        let t2 = tracker(&root, 1 << 20, 1024);
        assert_eq!(t2.restore(saved), 1);
        assert!(t2.scan().is_empty());
        append(&file, "c\n");
        let items = t2.scan();
        assert_eq!(items[0].range, 4..6);

        let _ = std::fs::remove_dir_all(&root);
    }
}
