use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::core::{LogRecord, RecordKey};

/// 分片内排序键：时间倒序（新在前），同时间按 source_file、offset 升序
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey {
    pub ts: Reverse<DateTime<Utc>>,
    pub file: Arc<str>,
    pub epoch: u64,
    pub offset: Option<u64>,
    /// 全局插入序号：兜底保证唯一
    pub seq: u64,
}

impl SortKey {
    pub fn of(record: &LogRecord, seq: u64) -> Self {
        Self {
            ts: Reverse(record.timestamp),
            file: Arc::from(record.source_file.as_str()),
            epoch: record.source_epoch,
            offset: record.source_offset,
            seq,
        }
    }

    /// 时间戳为 `ts` 的所有键中最小的那个（范围扫描起点）
    pub fn bound_at(ts: DateTime<Utc>) -> Self {
        Self {
            ts: Reverse(ts),
            file: Arc::from(""),
            epoch: 0,
            offset: None,
            seq: 0,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.ts.0
    }
}

#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub record: Arc<LogRecord>,
    pub inserted_at: DateTime<Utc>,
    pub dedup: RecordKey,
}

impl IndexEntry {
    /// TTL 从写入时刻起算
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.inserted_at + ttl <= now
    }
}

/// 单个 (host, application, component) 的有序存储
#[derive(Debug, Default)]
pub struct Shard {
    entries: BTreeMap<SortKey, IndexEntry>,
    dedup: HashMap<RecordKey, SortKey>,
    /// 写入顺序队列（TTL 扫描用）；容量淘汰留下的过期项惰性跳过
    expiry: VecDeque<(DateTime<Utc>, SortKey)>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.dedup.contains_key(key)
    }

    /// 插入一条记录；重复（同 dedup 键）返回 false
    pub fn insert(&mut self, record: LogRecord, now: DateTime<Utc>, seq: u64) -> bool {
        let dedup = RecordKey::of(&record);
        if self.dedup.contains_key(&dedup) {
            return false;
        }
        let key = SortKey::of(&record, seq);
        self.dedup.insert(dedup.clone(), key.clone());
        self.expiry.push_back((now, key.clone()));
        self.entries.insert(
            key,
            IndexEntry {
                record: Arc::new(record),
                inserted_at: now,
                dedup,
            },
        );
        true
    }

    fn remove(&mut self, key: &SortKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.dedup.remove(&entry.dedup);
                true
            }
            None => false,
        }
    }

    /// 超出上限时按时间从旧到新淘汰
    pub fn enforce_ceiling(&mut self, max_entries: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max_entries {
            match self.entries.pop_last() {
                Some((_, entry)) => {
                    self.dedup.remove(&entry.dedup);
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.maybe_compact_expiry();
        }
        evicted
    }

    pub fn has_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.expiry
            .front()
            .is_some_and(|(inserted_at, _)| *inserted_at + ttl <= now)
    }

    /// 物理删除所有过期条目
    pub fn purge_expired(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut purged = 0;
        while let Some((inserted_at, _)) = self.expiry.front() {
            if *inserted_at + ttl > now {
                break;
            }
            if let Some((inserted_at, key)) = self.expiry.pop_front() {
                let still_same = self
                    .entries
                    .get(&key)
                    .is_some_and(|e| e.inserted_at == inserted_at);
                if still_same && self.remove(&key) {
                    purged += 1;
                }
            }
        }
        purged
    }

    /// 队列里积累太多已被容量淘汰的键时重建
    fn maybe_compact_expiry(&mut self) {
        if self.expiry.len() <= self.entries.len() * 2 + 64 {
            return;
        }
        let mut live: Vec<(DateTime<Utc>, SortKey)> = self
            .entries
            .iter()
            .map(|(k, e)| (e.inserted_at, k.clone()))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.seq.cmp(&b.1.seq)));
        self.expiry = live.into();
    }

    /// 时间区间 `[start, end)` 内的条目，按排序键升序（新在前）
    pub fn range(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> impl Iterator<Item = (&SortKey, &IndexEntry)> + '_ {
        let lower = match end {
            Some(end) => Bound::Included(SortKey::bound_at(end)),
            None => Bound::Unbounded,
        };
        self.entries
            .range((lower, Bound::Unbounded))
            .skip_while(move |(k, _)| end.is_some_and(|e| k.timestamp() >= e))
            .take_while(move |(k, _)| start.map_or(true, |s| k.timestamp() >= s))
    }

    pub fn newest(&self) -> Option<DateTime<Utc>> {
        self.entries.first_key_value().map(|(k, _)| k.timestamp())
    }

    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        self.entries.last_key_value().map(|(k, _)| k.timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Level, Metadata};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn rec(secs: i64, offset: u64) -> LogRecord {
        LogRecord {
            timestamp: t0() + Duration::seconds(secs),
            level: Level::Info,
            host: "h".into(),
            application: "a".into(),
            component: None,
            message: format!("m{offset}"),
            metadata: Metadata::new(),
            source_file: "/r/h/a/x.log".into(),
            source_offset: Some(offset),
            source_epoch: 0,
        }
    }

    #[test]
    fn duplicate_offsets_are_noops() {
        let mut s = Shard::default();
        assert!(s.insert(rec(1, 0), t0(), 1));
        assert!(!s.insert(rec(1, 0), t0(), 2));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn ceiling_drops_oldest_first() {
        let mut s = Shard::default();
        for i in 0..10 {
            s.insert(rec(i, i as u64 * 10), t0(), i as u64);
        }
        assert_eq!(s.enforce_ceiling(7), 3);
        assert_eq!(s.len(), 7);
        assert_eq!(s.oldest(), Some(t0() + Duration::seconds(3)));
        assert_eq!(s.newest(), Some(t0() + Duration::seconds(9)));
    }

    #[test]
    fn purge_respects_ttl() {
        let mut s = Shard::default();
        s.insert(rec(0, 0), t0(), 1);
        s.insert(rec(1, 10), t0() + Duration::minutes(30), 2);
        let ttl = Duration::hours(1);
        assert!(!s.has_expired(t0() + Duration::minutes(59), ttl));
        assert_eq!(s.purge_expired(t0() + Duration::minutes(61), ttl), 1);
        assert_eq!(s.len(), 1);
        // 重新写入已过期并清除的记录是允许的
        assert!(s.insert(rec(0, 0), t0() + Duration::minutes(61), 3));
    }

    #[test]
    fn range_is_half_open_and_descending() {
        let mut s = Shard::default();
        for i in 0..5 {
            s.insert(rec(i, i as u64), t0(), i as u64);
        }
        let got: Vec<i64> = s
            .range(
                Some(t0() + Duration::seconds(1)),
                Some(t0() + Duration::seconds(4)),
            )
            .map(|(k, _)| (k.timestamp() - t0()).num_seconds())
            .collect();
        assert_eq!(got, vec![3, 2, 1]);
    }

    #[test]
    fn equal_timestamps_order_by_offset() {
        let mut s = Shard::default();
        s.insert(rec(0, 30), t0(), 1);
        s.insert(rec(0, 10), t0(), 2);
        s.insert(rec(0, 20), t0(), 3);
        let offsets: Vec<u64> = s
            .range(None, None)
            .filter_map(|(_, e)| e.record.source_offset)
            .collect();
        assert_eq!(offsets, vec![10, 20, 30]);
    }
}
