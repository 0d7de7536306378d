use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::shard::{IndexEntry, Shard, SortKey};
use crate::core::{Clock, CompositeKey, LogRecord};
use crate::error::StoreError;
use crate::stats::StoreStats;

/// 运行期可调的容量/TTL 参数
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLimits {
    pub ttl_secs: u64,
    pub max_entries_per_key: usize,
}

impl StoreLimits {
    /// TTL 上限
    pub const MAX_TTL_SECS: u64 = 100 * 365 * 86_400;

    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs.min(Self::MAX_TTL_SECS) as i64)
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            ttl_secs: 86_400,
            max_entries_per_key: 5_000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PutReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub evicted: usize,
}

/// 一次范围查询
#[derive(Clone, Debug, Default)]
pub struct StoreQuery {
    pub host: Option<String>,
    pub application: Option<String>,
    pub component: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
    /// 最多检查的候选条目数；达到上限时 total 只是下界
    pub scan_cap: usize,
    /// 命中数达到该值后停止计数（0 = 不限），total 同样标记为下界
    pub match_cap: usize,
}

impl StoreQuery {
    fn selects(&self, key: &CompositeKey) -> bool {
        self.host.as_ref().map_or(true, |h| *h == key.host)
            && self
                .application
                .as_ref()
                .map_or(true, |a| *a == key.application)
            && self
                .component
                .as_ref()
                .map_or(true, |c| key.component.as_deref() == Some(c.as_str()))
    }
}

#[derive(Clone, Debug, Default)]
pub struct StorePage {
    pub records: Vec<Arc<LogRecord>>,
    pub total: usize,
    pub total_is_lower_bound: bool,
    pub examined: usize,
}

/// `/api/sources` 的一行
#[derive(Clone, Debug, Serialize)]
pub struct SourceSummary {
    pub host: String,
    pub application: String,
    pub component: Option<String>,
    pub entries: usize,
    pub newest: Option<DateTime<Utc>>,
    pub oldest: Option<DateTime<Utc>>,
}

/// Index Store：按 (host, application, component) 分片的有序缓存。
///
/// - 写入方只有 ingestion pool；一个批次在所有相关分片的写锁下整体可见
/// - 查询按分片键顺序加读锁，k 路归并后按时间倒序输出
/// - TTL 在查询时惰性检查，并由 `sweep_loop` 定期物理清理
pub struct IndexStore {
    shards: DashMap<CompositeKey, Arc<RwLock<Shard>>>,
    /// 每新建一个分片 +1；查询据此发现“列出分片之后又出现了新分片”
    topology: AtomicU64,
    limits: ArcSwap<StoreLimits>,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
    closed: AtomicBool,
    inserted_total: AtomicU64,
    duplicates_total: AtomicU64,
    evicted_capacity_total: AtomicU64,
    evicted_ttl_total: AtomicU64,
}

impl IndexStore {
    pub fn new(limits: StoreLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            shards: DashMap::new(),
            topology: AtomicU64::new(0),
            limits: ArcSwap::from_pointee(limits),
            clock,
            seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            inserted_total: AtomicU64::new(0),
            duplicates_total: AtomicU64::new(0),
            evicted_capacity_total: AtomicU64::new(0),
            evicted_ttl_total: AtomicU64::new(0),
        }
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits.load().as_ref().clone()
    }

    /// 原子替换容量参数；下次写入/扫描时生效
    pub fn set_limits(&self, limits: StoreLimits) {
        tracing::info!(
            "Store limits updated: ttl={}s max_entries_per_key={}",
            limits.ttl_secs,
            limits.max_entries_per_key
        );
        self.limits.store(Arc::new(limits));
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::info!("Index store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn shard_for(&self, key: &CompositeKey) -> Arc<RwLock<Shard>> {
        if let Some(s) = self.shards.get(key) {
            return s.value().clone();
        }
        let mut created = false;
        let shard = self
            .shards
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(RwLock::new(Shard::default()))
            })
            .value()
            .clone();
        if created {
            self.topology.fetch_add(1, Ordering::SeqCst);
        }
        shard
    }

    /// 批量写入。同一批次内的记录保持传入顺序；已存在的记录（同 dedup 键）跳过。
    pub fn put(&self, records: Vec<LogRecord>) -> Result<PutReport, StoreError> {
        self.check_open()?;
        let mut report = PutReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        let mut groups: BTreeMap<CompositeKey, Vec<LogRecord>> = BTreeMap::new();
        for r in records {
            groups.entry(r.composite_key()).or_default().push(r);
        }

        let limits = self.limits.load_full();
        let ttl = limits.ttl();
        let now = self.clock.now();

        // 按键顺序取得全部写锁，批次整体可见
        let shards: Vec<Arc<RwLock<Shard>>> = groups.keys().map(|k| self.shard_for(k)).collect();
        let mut guards: Vec<_> = shards.iter().map(|s| s.write()).collect();

        let mut purged = 0usize;
        for (guard, (_, batch)) in guards.iter_mut().zip(groups) {
            purged += guard.purge_expired(now, ttl);
            for r in batch {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                if guard.insert(r, now, seq) {
                    report.inserted += 1;
                } else {
                    report.duplicates += 1;
                }
            }
            report.evicted += guard.enforce_ceiling(limits.max_entries_per_key);
        }
        drop(guards);

        self.inserted_total
            .fetch_add(report.inserted as u64, Ordering::Relaxed);
        self.duplicates_total
            .fetch_add(report.duplicates as u64, Ordering::Relaxed);
        self.evicted_capacity_total
            .fetch_add(report.evicted as u64, Ordering::Relaxed);
        self.evicted_ttl_total
            .fetch_add(purged as u64, Ordering::Relaxed);
        if report.evicted > 0 {
            tracing::debug!("Capacity eviction dropped {} oldest entries", report.evicted);
        }
        Ok(report)
    }

    fn selected_shards(&self, q: &StoreQuery) -> Vec<(CompositeKey, Arc<RwLock<Shard>>)> {
        let mut out: Vec<(CompositeKey, Arc<RwLock<Shard>>)> = self
            .shards
            .iter()
            .filter(|e| q.selects(e.key()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// 有序分页查询。
    ///
    /// 按时间倒序遍历候选条目（已过期的不计入），对每条调用 `filter`；
    /// 最多检查 `scan_cap` 条、最多计入 `match_cap` 条命中，提前停止时 `total` 标记为下界。
    pub fn query<F>(&self, q: &StoreQuery, mut filter: F) -> Result<StorePage, StoreError>
    where
        F: FnMut(&LogRecord) -> bool,
    {
        self.check_open()?;
        let limits = self.limits.load_full();
        let ttl = limits.ttl();
        let now = self.clock.now();
        // 惰性清理：只有确有过期项时才升级为写锁
        let mut purged = 0usize;
        for (_, shard) in &self.selected_shards(q) {
            let guard = shard.upgradable_read();
            if guard.has_expired(now, ttl) {
                let mut w = RwLockUpgradableReadGuard::upgrade(guard);
                purged += w.purge_expired(now, ttl);
            }
        }
        if purged > 0 {
            self.evicted_ttl_total
                .fetch_add(purged as u64, Ordering::Relaxed);
        }

        // 读锁全部到手后分片集合未变，才能保证看到的是完整批次
        loop {
            let topology = self.topology.load(Ordering::SeqCst);
            let selected = self.selected_shards(q);
            let guards: Vec<_> = selected.iter().map(|(_, s)| s.read()).collect();
            if self.topology.load(Ordering::SeqCst) != topology {
                continue;
            }
            return Ok(merge_page(&guards, q, now, ttl, &mut filter));
        }
    }

    /// 物理清理所有分片中的过期条目
    pub fn evict_expired(&self) -> usize {
        let ttl = self.limits.load().ttl();
        let now = self.clock.now();
        let shards: Vec<Arc<RwLock<Shard>>> =
            self.shards.iter().map(|e| e.value().clone()).collect();
        let mut purged = 0;
        for shard in shards {
            purged += shard.write().purge_expired(now, ttl);
        }
        if purged > 0 {
            self.evicted_ttl_total
                .fetch_add(purged as u64, Ordering::Relaxed);
        }
        purged
    }

    /// 定时 TTL 清理；收到 shutdown 后退出
    pub async fn sweep_loop(self: Arc<Self>, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if self.is_closed() {
                break;
            }
            let store = self.clone();
            let purged = match tokio::task::spawn_blocking(move || store.evict_expired()).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("TTL sweep task failed: {}", e);
                    continue;
                }
            };
            if purged > 0 {
                tracing::info!("TTL sweep evicted {} entries", purged);
                if purged >= 10_000 {
                    maybe_trim_rss();
                }
            }
        }
        tracing::info!("TTL sweep stopped");
    }

    pub fn sources(&self) -> Vec<SourceSummary> {
        let mut out: Vec<SourceSummary> = self
            .shards
            .iter()
            .map(|e| {
                let s = e.value().read();
                SourceSummary {
                    host: e.key().host.clone(),
                    application: e.key().application.clone(),
                    component: e.key().component.clone(),
                    entries: s.len(),
                    newest: s.newest(),
                    oldest: s.oldest(),
                }
            })
            .collect();
        out.sort_by(|a, b| {
            (&a.host, &a.application, &a.component).cmp(&(&b.host, &b.application, &b.component))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|e| e.value().read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            available: !self.is_closed(),
            keys: self.shards.len(),
            inserted_total: self.inserted_total.load(Ordering::Relaxed),
            duplicates_total: self.duplicates_total.load(Ordering::Relaxed),
            evicted_capacity_total: self.evicted_capacity_total.load(Ordering::Relaxed),
            evicted_ttl_total: self.evicted_ttl_total.load(Ordering::Relaxed),
            ..Default::default()
        };
        for e in self.shards.iter() {
            let s = e.value().read();
            stats.entries += s.len();
            stats.oldest_record = match (stats.oldest_record, s.oldest()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            stats.newest_record = match (stats.newest_record, s.newest()) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        stats
    }
}

fn merge_page<F>(
    guards: &[RwLockReadGuard<'_, Shard>],
    q: &StoreQuery,
    now: DateTime<Utc>,
    ttl: Duration,
    filter: &mut F,
) -> StorePage
where
    F: FnMut(&LogRecord) -> bool,
{
    let mut cursors: Vec<_> = guards
        .iter()
        .map(|g| g.range(q.start, q.end).peekable())
        .collect();

    let mut page = StorePage::default();
    let cap = q.scan_cap.max(1);
    loop {
        // k 路归并：取所有游标里排序键最小（最新）的一条
        let mut best: Option<(usize, &SortKey)> = None;
        for (i, c) in cursors.iter_mut().enumerate() {
            if let Some((k, _)) = c.peek() {
                if best.map_or(true, |(_, bk)| *k < bk) {
                    best = Some((i, *k));
                }
            }
        }
        let Some((idx, _)) = best else { break };
        let Some((_, entry)) = cursors[idx].next() else {
            break;
        };
        let entry: &IndexEntry = entry;
        if entry.is_expired(now, ttl) {
            continue;
        }
        if page.examined >= cap || (q.match_cap > 0 && page.total >= q.match_cap) {
            page.total_is_lower_bound = true;
            break;
        }
        page.examined += 1;
        if !filter(&entry.record) {
            continue;
        }
        page.total += 1;
        if page.total > q.offset && page.records.len() < q.limit {
            page.records.push(entry.record.clone());
        }
    }
    page
}

#[cfg(feature = "mimalloc")]
fn maybe_trim_rss() {
    // mimalloc 作为全局分配器时 malloc_trim 无效，调用 mimalloc 自己的回收
    extern "C" {
        fn mi_collect(force: bool);
    }
    unsafe { mi_collect(true) };
}

#[cfg(all(not(feature = "mimalloc"), target_os = "linux", target_env = "gnu"))]
fn maybe_trim_rss() {
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(all(
    not(feature = "mimalloc"),
    not(all(target_os = "linux", target_env = "gnu"))
))]
fn maybe_trim_rss() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Level, ManualClock, Metadata};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn rec(host: &str, secs: i64, offset: u64) -> LogRecord {
        LogRecord {
            timestamp: t0() + Duration::seconds(secs),
            level: Level::Info,
            host: host.into(),
            application: "app".into(),
            component: None,
            message: format!("line {offset}"),
            metadata: Metadata::new(),
            source_file: format!("/r/{host}/app/x.log"),
            source_offset: Some(offset),
            source_epoch: 0,
        }
    }

    fn store(max: usize, ttl_secs: u64) -> (IndexStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let s = IndexStore::new(
            StoreLimits {
                ttl_secs,
                max_entries_per_key: max,
            },
            clock.clone(),
        );
        (s, clock)
    }

    fn all(s: &IndexStore) -> StorePage {
        s.query(
            &StoreQuery {
                limit: 1000,
                scan_cap: 100_000,
                ..Default::default()
            },
            |_| true,
        )
        .unwrap()
    }

    #[test]
    fn put_is_idempotent() {
        let (s, _) = store(100, 3600);
        let batch: Vec<_> = (0..5).map(|i| rec("h", i, i as u64)).collect();
        assert_eq!(s.put(batch.clone()).unwrap().inserted, 5);
        let again = s.put(batch).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.duplicates, 5);
        assert_eq!(all(&s).total, 5);
    }

    #[test]
    fn capacity_keeps_newest() {
        let (s, _) = store(10, 3600);
        let batch: Vec<_> = (0..13).map(|i| rec("h", i, i as u64)).collect();
        let r = s.put(batch).unwrap();
        assert_eq!(r.evicted, 3);
        let page = all(&s);
        assert_eq!(page.total, 10);
        let oldest = page.records.last().unwrap();
        assert_eq!(oldest.timestamp, t0() + Duration::seconds(3));
    }

    #[test]
    fn ttl_hides_then_sweeps() {
        let (s, clock) = store(100, 3600);
        s.put(vec![rec("h", 0, 0)]).unwrap();
        clock.advance(Duration::seconds(3599));
        assert_eq!(all(&s).total, 1);
        clock.advance(Duration::seconds(2));
        assert_eq!(all(&s).total, 0);
        assert_eq!(s.len(), 0, "lazy purge on query");
        assert_eq!(s.stats().evicted_ttl_total, 1);
    }

    #[test]
    fn evict_expired_purges_all_shards() {
        let (s, clock) = store(100, 60);
        s.put(vec![rec("a", 0, 0), rec("b", 0, 0)]).unwrap();
        clock.advance(Duration::seconds(61));
        assert_eq!(s.evict_expired(), 2);
        assert!(s.is_empty());
    }

    #[test]
    fn merge_across_keys_is_descending() {
        let (s, _) = store(100, 3600);
        s.put(vec![rec("a", 1, 0), rec("a", 4, 1), rec("b", 2, 0), rec("b", 3, 1)])
            .unwrap();
        let secs: Vec<i64> = all(&s)
            .records
            .iter()
            .map(|r| (r.timestamp - t0()).num_seconds())
            .collect();
        assert_eq!(secs, vec![4, 3, 2, 1]);
    }

    #[test]
    fn host_filter_and_pagination() {
        let (s, _) = store(100, 3600);
        let batch: Vec<_> = (0..10)
            .map(|i| rec(if i % 2 == 0 { "a" } else { "b" }, i, i as u64))
            .collect();
        s.put(batch).unwrap();
        let page = s
            .query(
                &StoreQuery {
                    host: Some("a".into()),
                    offset: 2,
                    limit: 2,
                    scan_cap: 1000,
                    ..Default::default()
                },
                |_| true,
            )
            .unwrap();
        assert_eq!(page.total, 5);
        let secs: Vec<i64> = page
            .records
            .iter()
            .map(|r| (r.timestamp - t0()).num_seconds())
            .collect();
        assert_eq!(secs, vec![4, 2]);
        assert!(!page.total_is_lower_bound);
    }

    #[test]
    fn scan_cap_marks_lower_bound() {
        let (s, _) = store(1000, 3600);
        s.put((0..50).map(|i| rec("h", i, i as u64)).collect()).unwrap();
        let page = s
            .query(
                &StoreQuery {
                    limit: 5,
                    scan_cap: 20,
                    ..Default::default()
                },
                |_| true,
            )
            .unwrap();
        assert_eq!(page.records.len(), 5);
        assert_eq!(page.total, 20);
        assert!(page.total_is_lower_bound);
    }

    #[test]
    fn match_cap_bounds_the_walk_for_small_pages() {
        let (s, _) = store(10_000, 3600);
        s.put((0..5_000).map(|i| rec("h", i, i as u64)).collect()).unwrap();
        let mut calls = 0;
        let page = s
            .query(
                &StoreQuery {
                    limit: 1,
                    scan_cap: 50_000,
                    match_cap: 20,
                    ..Default::default()
                },
                |_| {
                    calls += 1;
                    true
                },
            )
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(calls, 20);
        assert_eq!(page.examined, 20);
        assert_eq!(page.total, 20);
        assert!(page.total_is_lower_bound);

        // 候选不足时计数是精确的
        let page = s
            .query(
                &StoreQuery {
                    host: Some("h".into()),
                    limit: 1,
                    scan_cap: 50_000,
                    match_cap: 20_000,
                    ..Default::default()
                },
                |_| true,
            )
            .unwrap();
        assert_eq!(page.total, 5_000);
        assert!(!page.total_is_lower_bound);
    }

    #[test]
    fn readers_never_observe_a_partial_batch() {
        const BATCH: u64 = 10;
        const BATCHES: u64 = 200;
        let (s, _) = store(1_000_000, 3600);
        let s = Arc::new(s);
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let s = s.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                for b in 0..BATCHES {
                    // 每批跨两个分片键
                    let batch: Vec<_> = (0..BATCH)
                        .map(|i| {
                            let n = b * BATCH + i;
                            rec(if i % 2 == 0 { "a" } else { "b" }, n as i64, n)
                        })
                        .collect();
                    s.put(batch).unwrap();
                }
                done.store(true, Ordering::Release);
            })
        };

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let s = s.clone();
                let done = done.clone();
                std::thread::spawn(move || loop {
                    let finished = done.load(Ordering::Acquire);
                    let page = s
                        .query(
                            &StoreQuery {
                                limit: 0,
                                scan_cap: usize::MAX,
                                ..Default::default()
                            },
                            |_| true,
                        )
                        .unwrap();
                    assert_eq!(page.total as u64 % BATCH, 0, "saw {} records", page.total);
                    if finished {
                        break;
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(all(&s).total as u64, BATCH * BATCHES);
    }

    #[test]
    fn closed_store_rejects() {
        let (s, _) = store(10, 60);
        s.close();
        assert_eq!(s.put(vec![rec("h", 0, 0)]), Err(StoreError::Closed));
        assert!(s.query(&StoreQuery::default(), |_| true).is_err());
        assert!(!s.stats().available);
    }

    #[test]
    fn limits_swap_applies_on_next_put() {
        let (s, _) = store(100, 3600);
        s.put((0..20).map(|i| rec("h", i, i as u64)).collect()).unwrap();
        s.set_limits(StoreLimits {
            ttl_secs: 3600,
            max_entries_per_key: 5,
        });
        s.put(vec![rec("h", 100, 100)]).unwrap();
        assert_eq!(all(&s).total, 5);
    }
}
