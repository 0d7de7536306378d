//! Prometheus 文本格式导出。
//!
//! 计数都保存在 `IngestStats` / `IndexStore` 里；每次抓取新建一个 registry，
//! 把当前快照写进去再编码。

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use super::HealthReport;
use crate::index::SourceSummary;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SourceLabels {
    host: String,
    application: String,
    component: String,
}

fn counter(registry: &mut Registry, name: &str, help: &str, value: u64) {
    let c: Counter = Counter::default();
    c.inc_by(value);
    registry.register(name, help, c);
}

fn gauge(registry: &mut Registry, name: &str, help: &str, value: i64) {
    let g: Gauge = Gauge::default();
    g.set(value);
    registry.register(name, help, g);
}

/// 把健康快照和分片概况编码成 Prometheus 文本
pub fn encode_metrics(report: &HealthReport, sources: &[SourceSummary]) -> Result<String, std::fmt::Error> {
    let mut registry = Registry::with_prefix("centralog");
    let ing = &report.ingestion;
    let st = &report.store.stats;

    counter(&mut registry, "scan_passes", "Completed ingestion passes", ing.passes);
    counter(&mut registry, "files_read", "Files read with new bytes", ing.files_read);
    counter(&mut registry, "bytes_read", "Bytes consumed from log files", ing.bytes_read);
    counter(&mut registry, "records_ingested", "Records inserted into the index", ing.records_ingested);
    counter(&mut registry, "records_duplicate", "Records dropped as duplicates", ing.duplicates);
    counter(&mut registry, "read_errors", "Failed file reads", ing.read_errors);
    counter(&mut registry, "store_errors", "Batches rejected by the index store", ing.store_errors);
    counter(&mut registry, "rotations", "Detected rotations and truncations", ing.rotations);
    counter(&mut registry, "fs_events", "Filesystem change events received", ing.events_received);
    counter(&mut registry, "fs_events_dropped", "Filesystem events dropped on overflow", ing.overflow_drops);
    counter(&mut registry, "evicted_capacity", "Records evicted by per-key capacity", st.evicted_capacity_total);
    counter(&mut registry, "evicted_ttl", "Records evicted by TTL", st.evicted_ttl_total);

    gauge(&mut registry, "ingestion_alive", "1 when a scan finished recently", ing.alive as i64);
    gauge(&mut registry, "store_available", "1 when the index store accepts queries", st.available as i64);
    gauge(&mut registry, "files_monitored", "Log files being tracked", ing.files_tracked as i64);
    gauge(&mut registry, "store_keys", "Source keys held in the index", st.keys as i64);
    gauge(&mut registry, "store_entries", "Records held in the index", st.entries as i64);
    gauge(&mut registry, "process_rss_bytes", "Resident set size of the process", report.process_rss_bytes as i64);
    if let Some(secs) = ing.seconds_since_last_scan {
        gauge(&mut registry, "seconds_since_last_scan", "Age of the last completed scan", secs as i64);
    }

    let per_source = Family::<SourceLabels, Gauge>::default();
    for s in sources {
        per_source
            .get_or_create(&SourceLabels {
                host: s.host.clone(),
                application: s.application.clone(),
                component: s.component.clone().unwrap_or_default(),
            })
            .set(s.entries as i64);
    }
    registry.register("source_entries", "Records held per source key", per_source);

    let mut out = String::new();
    encode(&mut out, &registry)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{IngestStats, StoreStats};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::Ordering;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn exposes_counters_gauges_and_sources() {
        let stats = IngestStats::default();
        stats.mark_scan(t0());
        stats.records_ingested.store(42, Ordering::Relaxed);
        let report = HealthReport::build(
            t0(),
            stats.snapshot(t0(), 3, 60),
            StoreStats {
                available: true,
                keys: 1,
                entries: 42,
                ..Default::default()
            },
        );
        let sources = vec![SourceSummary {
            host: "ssdev".into(),
            application: "auto-scraper".into(),
            component: None,
            entries: 42,
            newest: Some(t0()),
            oldest: Some(t0()),
        }];

        let text = encode_metrics(&report, &sources).unwrap();
        assert!(text.contains("centralog_records_ingested_total 42"));
        assert!(text.contains("centralog_files_monitored 3"));
        assert!(text.contains("centralog_ingestion_alive 1"));
        assert!(text.contains("# TYPE centralog_store_entries gauge"));
        assert!(text.contains(
            "centralog_source_entries{host=\"ssdev\",application=\"auto-scraper\",component=\"\"} 42"
        ));
        assert!(text.trim_end().ends_with("# EOF"));
    }
}
