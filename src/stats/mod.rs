pub mod metrics;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Ingestion pool 的累计计数（多 worker 并发更新）
#[derive(Debug, Default)]
pub struct IngestStats {
    pub passes: AtomicU64,
    pub files_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub records_ingested: AtomicU64,
    pub duplicates: AtomicU64,
    pub read_errors: AtomicU64,
    pub store_errors: AtomicU64,
    pub rotations: AtomicU64,
    pub events_received: AtomicU64,
    /// notify -> channel 溢出丢弃次数
    pub overflow_drops: std::sync::Arc<AtomicU64>,
    last_scan: Mutex<Option<DateTime<Utc>>>,
}

impl IngestStats {
    pub fn mark_scan(&self, at: DateTime<Utc>) {
        *self.last_scan.lock() = Some(at);
        self.passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        *self.last_scan.lock()
    }

    pub fn snapshot(&self, now: DateTime<Utc>, files_tracked: usize, stale_after_secs: u64) -> IngestionHealth {
        let last = self.last_scan();
        let since = last.map(|t| (now - t).num_seconds().max(0) as u64);
        IngestionHealth {
            alive: since.is_some_and(|s| s <= stale_after_secs),
            last_scan_at: last,
            seconds_since_last_scan: since,
            passes: self.passes.load(Ordering::Relaxed),
            files_tracked,
            files_read: self.files_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            records_ingested: self.records_ingested.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IngestionHealth {
    pub alive: bool,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub seconds_since_last_scan: Option<u64>,
    pub passes: u64,
    pub files_tracked: usize,
    pub files_read: u64,
    pub bytes_read: u64,
    pub records_ingested: u64,
    pub duplicates: u64,
    pub read_errors: u64,
    pub store_errors: u64,
    pub rotations: u64,
    pub events_received: u64,
    pub overflow_drops: u64,
}

/// Index Store 概况
#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreStats {
    pub available: bool,
    pub keys: usize,
    pub entries: usize,
    pub oldest_record: Option<DateTime<Utc>>,
    pub newest_record: Option<DateTime<Utc>>,
    pub inserted_total: u64,
    pub duplicates_total: u64,
    pub evicted_capacity_total: u64,
    pub evicted_ttl_total: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StoreHealth {
    #[serde(flatten)]
    pub stats: StoreStats,
    pub oldest_record_age_secs: Option<i64>,
    pub newest_record_age_secs: Option<i64>,
}

/// `/health` 响应与周期日志报告
#[derive(Clone, Debug, Default, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub generated_at: Option<DateTime<Utc>>,
    pub ingestion: IngestionHealth,
    pub store: StoreHealth,
    /// 进程级 RSS（从 /proc/self/statm 读取）
    pub process_rss_bytes: u64,
}

impl HealthReport {
    pub fn build(now: DateTime<Utc>, ingestion: IngestionHealth, store: StoreStats) -> Self {
        let age = |t: Option<DateTime<Utc>>| t.map(|t| (now - t).num_seconds());
        let status = if !store.available {
            "unavailable"
        } else if !ingestion.alive {
            "degraded"
        } else {
            "ok"
        };
        Self {
            status,
            generated_at: Some(now),
            store: StoreHealth {
                oldest_record_age_secs: age(store.oldest_record),
                newest_record_age_secs: age(store.newest_record),
                stats: store,
            },
            ingestion,
            process_rss_bytes: Self::read_process_rss(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }

    /// 从 /proc/self/statm 读取进程 RSS
    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm 格式: size resident shared text lib data dt (单位: 页)
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096)
            .unwrap_or(0)
    }
}

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn opt_secs(v: Option<i64>) -> String {
    v.map_or_else(|| "-".to_string(), |s| format!("{s}s"))
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ing = &self.ingestion;
        let st = &self.store;
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           centralog Health Report                ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ Status:      {:>35} ║", self.status)?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Ingestion:                                       ║")?;
        writeln!(f, "║   alive:        {:>10}                       ║", ing.alive)?;
        writeln!(
            f,
            "║   last scan:    {:>10}                       ║",
            opt_secs(ing.seconds_since_last_scan.map(|s| s as i64))
        )?;
        writeln!(f, "║   passes:       {:>10}                       ║", ing.passes)?;
        writeln!(
            f,
            "║   files:        {:>10}                       ║",
            ing.files_tracked
        )?;
        writeln!(
            f,
            "║   records:      {:>10}                       ║",
            ing.records_ingested
        )?;
        writeln!(
            f,
            "║   read:         {:>10}                       ║",
            human_bytes(ing.bytes_read)
        )?;
        writeln!(
            f,
            "║   read errors:  {:>10}                       ║",
            ing.read_errors
        )?;
        writeln!(
            f,
            "║   overflow:     {:>10}                       ║",
            ing.overflow_drops
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Index Store:                                     ║")?;
        writeln!(
            f,
            "║   available:    {:>10}                       ║",
            st.stats.available
        )?;
        writeln!(f, "║   keys:         {:>10}                       ║", st.stats.keys)?;
        writeln!(
            f,
            "║   entries:      {:>10}                       ║",
            st.stats.entries
        )?;
        writeln!(
            f,
            "║   oldest age:   {:>10}                       ║",
            opt_secs(st.oldest_record_age_secs)
        )?;
        writeln!(
            f,
            "║   newest age:   {:>10}                       ║",
            opt_secs(st.newest_record_age_secs)
        )?;
        writeln!(
            f,
            "║   evicted cap:  {:>10}                       ║",
            st.stats.evicted_capacity_total
        )?;
        writeln!(
            f,
            "║   evicted ttl:  {:>10}                       ║",
            st.stats.evicted_ttl_total
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn ingestion_liveness_tracks_last_scan() {
        let s = IngestStats::default();
        assert!(!s.snapshot(t0(), 0, 60).alive);
        s.mark_scan(t0());
        let h = s.snapshot(t0() + Duration::seconds(30), 3, 60);
        assert!(h.alive);
        assert_eq!(h.seconds_since_last_scan, Some(30));
        assert_eq!(h.passes, 1);
        assert!(!s.snapshot(t0() + Duration::seconds(90), 3, 60).alive);
    }

    #[test]
    fn report_status_and_ages() {
        let s = IngestStats::default();
        s.mark_scan(t0());
        let store = StoreStats {
            available: true,
            entries: 2,
            keys: 1,
            oldest_record: Some(t0() - Duration::seconds(100)),
            newest_record: Some(t0() - Duration::seconds(10)),
            ..Default::default()
        };
        let r = HealthReport::build(t0(), s.snapshot(t0(), 1, 60), store);
        assert!(r.is_healthy());
        assert_eq!(r.store.oldest_record_age_secs, Some(100));
        assert_eq!(r.store.newest_record_age_secs, Some(10));

        let text = r.to_string();
        assert!(text.contains("centralog Health Report"));
        assert!(text.contains("entries"));

        let down = HealthReport::build(t0(), s.snapshot(t0(), 1, 60), StoreStats::default());
        assert_eq!(down.status, "unavailable");
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
