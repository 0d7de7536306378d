use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use super::time::{TimeResolver, TimeWindow};
use crate::core::{normalize_refresh_id, Clock, Level, LogRecord};
use crate::error::QueryError;
use crate::index::{IndexStore, StoreQuery};

/// HTTP 查询参数（全部可选，AND 组合）。
///
/// 数值参数以字符串接收，解析失败返回带参数名的客户端错误。
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogQuery {
    pub host: Option<String>,
    #[serde(alias = "app")]
    pub application: Option<String>,
    pub component: Option<String>,
    /// 逗号分隔的级别集合；`all` 表示不过滤
    pub level: Option<String>,
    pub search: Option<String>,
    pub pattern: Option<String>,
    #[serde(alias = "refresh")]
    pub refresh_id: Option<String>,
    pub step: Option<String>,
    pub time: Option<String>,
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub analytics: Option<String>,
}

#[derive(Clone, Debug)]
pub struct QueryLimits {
    pub default_limit: usize,
    pub max_limit: usize,
    pub scan_cap: usize,
    /// 命中数达到 `(offset + limit) * overscan` 即停止计数
    pub overscan: usize,
    pub max_regex_bytes: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 500,
            scan_cap: 50_000,
            overscan: 20,
            max_regex_bytes: 1 << 20,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
    pub returned_count: usize,
    pub total_count: usize,
    /// true 时 total_count 只是下界（扫描达到上限）
    pub total_is_lower_bound: bool,
    pub has_more: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Analytics {
    pub level_distribution: BTreeMap<Level, usize>,
    pub refresh_distribution: BTreeMap<String, usize>,
    pub component_distribution: BTreeMap<String, usize>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<LogRecord>,
    pub pagination: Pagination,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics: Option<Analytics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeWindow>,
}

/// 编译后的过滤条件
struct Filter {
    levels: Option<BTreeSet<Level>>,
    search: Option<Regex>,
    pattern: Option<Regex>,
    refresh_id: Option<String>,
    step: Option<String>,
}

impl Filter {
    fn matches(&self, r: &LogRecord) -> bool {
        if let Some(levels) = &self.levels {
            if !levels.contains(&r.level) {
                return false;
            }
        }
        if let Some(re) = &self.search {
            if !re.is_match(&r.message) {
                return false;
            }
        }
        if let Some(re) = &self.pattern {
            if !re.is_match(&r.message) {
                return false;
            }
        }
        if let Some(id) = &self.refresh_id {
            match r.metadata.get("refresh_id") {
                Some(v) if normalize_refresh_id(&v.to_string()) == *id => {}
                _ => return false,
            }
        }
        if let Some(step) = &self.step {
            match r.metadata.get("step") {
                Some(v) if v.matches(step) => {}
                _ => return false,
            }
        }
        true
    }
}

/// 把空串与 `all` 视为“不过滤”
pub(super) fn scope(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("all"))
        .map(str::to_string)
}

pub(super) fn parse_usize(name: &'static str, v: &Option<String>) -> Result<Option<usize>, QueryError> {
    match v.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse::<usize>()
            .map(Some)
            .map_err(|_| QueryError::InvalidParameter {
                name,
                reason: format!("expected a non-negative integer, got {s:?}"),
            }),
    }
}

fn parse_levels(v: &Option<String>) -> Result<Option<BTreeSet<Level>>, QueryError> {
    let Some(raw) = scope(v) else {
        return Ok(None);
    };
    let mut set = BTreeSet::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if token.eq_ignore_ascii_case("all") {
            return Ok(None);
        }
        let level = Level::parse_token(token).ok_or_else(|| QueryError::InvalidParameter {
            name: "level",
            reason: format!("unknown level {token:?}"),
        })?;
        set.insert(level);
    }
    Ok(if set.is_empty() { None } else { Some(set) })
}

fn truthy(v: &Option<String>) -> bool {
    matches!(
        v.as_deref().map(|s| s.trim().to_ascii_lowercase()).as_deref(),
        Some("true" | "1" | "yes" | "on")
    )
}

/// Query Engine：把过滤条件翻译成对 Index Store 的有界扫描
pub struct QueryEngine {
    pub(super) store: Arc<IndexStore>,
    pub(super) resolver: TimeResolver,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) limits: QueryLimits,
}

impl QueryEngine {
    pub fn new(
        store: Arc<IndexStore>,
        resolver: TimeResolver,
        clock: Arc<dyn Clock>,
        limits: QueryLimits,
    ) -> Self {
        Self {
            store,
            resolver,
            clock,
            limits,
        }
    }

    pub fn resolver(&self) -> &TimeResolver {
        &self.resolver
    }

    fn build_regex(&self, name: &'static str, source: &str, literal: bool) -> Result<Regex, QueryError> {
        let src = if literal {
            regex::escape(source)
        } else {
            source.to_string()
        };
        RegexBuilder::new(&src)
            .case_insensitive(literal)
            .size_limit(self.limits.max_regex_bytes)
            .dfa_size_limit(self.limits.max_regex_bytes)
            .build()
            .map_err(|e| match name {
                "pattern" => QueryError::InvalidPattern(e.to_string()),
                _ => QueryError::InvalidParameter {
                    name,
                    reason: e.to_string(),
                },
            })
    }

    pub fn search(&self, q: &LogQuery) -> Result<SearchResponse, QueryError> {
        let filter = Filter {
            levels: parse_levels(&q.level)?,
            search: match q.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                Some(s) => Some(self.build_regex("search", s, true)?),
                None => None,
            },
            pattern: match q.pattern.as_deref().filter(|p| !p.is_empty()) {
                Some(p) => Some(self.build_regex("pattern", p, false)?),
                None => None,
            },
            refresh_id: scope(&q.refresh_id).map(|id| normalize_refresh_id(&id)),
            step: scope(&q.step),
        };

        let time_range = match &q.time {
            Some(phrase) => Some(self.resolver.resolve(phrase, self.clock.now())?),
            None => None,
        };

        let limit = parse_usize("limit", &q.limit)?
            .unwrap_or(self.limits.default_limit)
            .min(self.limits.max_limit);
        let offset = parse_usize("offset", &q.offset)?.unwrap_or(0);
        let want_analytics = truthy(&q.analytics);

        let store_query = StoreQuery {
            host: scope(&q.host),
            application: scope(&q.application),
            component: scope(&q.component),
            start: time_range.map(|w| w.start),
            end: time_range.map(|w| w.end),
            offset,
            limit,
            scan_cap: self.limits.scan_cap,
            match_cap: offset
                .saturating_add(limit)
                .saturating_mul(self.limits.overscan.max(1)),
        };

        let mut analytics = Analytics::default();
        let page = self.store.query(&store_query, |r| {
            if !filter.matches(r) {
                return false;
            }
            if want_analytics {
                *analytics.level_distribution.entry(r.level).or_default() += 1;
                if let Some(id) = r.metadata.get("refresh_id") {
                    *analytics
                        .refresh_distribution
                        .entry(id.to_string())
                        .or_default() += 1;
                }
                if let Some(c) = &r.component {
                    *analytics
                        .component_distribution
                        .entry(c.clone())
                        .or_default() += 1;
                }
            }
            true
        })?;

        let returned_count = page.records.len();
        tracing::debug!(
            "Query examined {} entries, matched {}{}, returned {}",
            page.examined,
            page.total,
            if page.total_is_lower_bound { "+" } else { "" },
            returned_count
        );
        Ok(SearchResponse {
            results: page.records.iter().map(|r| LogRecord::clone(r)).collect(),
            pagination: Pagination {
                offset,
                limit,
                returned_count,
                total_count: page.total,
                total_is_lower_bound: page.total_is_lower_bound,
                has_more: page.total_is_lower_bound || offset + returned_count < page.total,
            },
            analytics: want_analytics.then_some(analytics),
            time_range,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, MetaValue, Metadata};
    use crate::index::StoreLimits;
    use crate::parser::LocalZone;
    use chrono::{DateTime, Duration, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn rec(mins_ago: i64, offset: u64, level: Level, msg: &str) -> LogRecord {
        let mut metadata = Metadata::new();
        if let Some(pos) = msg.find("Refresh-") {
            let id: String = msg[pos..].chars().take_while(|c| !c.is_whitespace()).collect();
            metadata.insert("refresh_id".into(), MetaValue::Text(id));
        }
        LogRecord {
            timestamp: t0() - Duration::minutes(mins_ago),
            level,
            host: "ssdev".into(),
            application: "sports-scheduler".into(),
            component: Some("iptv-orchestrator".into()),
            message: msg.into(),
            metadata,
            source_file: "/r/ssdev/sports-scheduler/iptv-orchestrator/x.log".into(),
            source_offset: Some(offset),
            source_epoch: 0,
        }
    }

    fn engine() -> QueryEngine {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(IndexStore::new(StoreLimits::default(), clock.clone()));
        store
            .put(vec![
                rec(5, 0, Level::Info, "Starting Refresh-9 upload"),
                rec(4, 10, Level::Error, "Upload FAILED for Refresh-9"),
                rec(3, 20, Level::Warn, "Retrying Refresh-10"),
                rec(200, 30, Level::Info, "old heartbeat"),
            ])
            .unwrap();
        QueryEngine::new(
            store,
            TimeResolver::new(LocalZone::utc(), Duration::hours(1), "last 1 hour"),
            clock,
            QueryLimits {
                max_limit: 2,
                ..Default::default()
            },
        )
    }

    fn q() -> LogQuery {
        LogQuery::default()
    }

    #[test]
    fn level_set_and_search() {
        let e = engine();
        let r = e
            .search(&LogQuery {
                level: Some("error,warn".into()),
                ..q()
            })
            .unwrap();
        assert_eq!(r.pagination.total_count, 2);

        let r = e
            .search(&LogQuery {
                search: Some("upload failed".into()),
                ..q()
            })
            .unwrap();
        assert_eq!(r.pagination.total_count, 1);
        assert_eq!(r.results[0].level, Level::Error);
    }

    #[test]
    fn refresh_id_accepts_bare_number() {
        let r = engine()
            .search(&LogQuery {
                refresh_id: Some("9".into()),
                analytics: Some("true".into()),
                ..q()
            })
            .unwrap();
        assert_eq!(r.pagination.total_count, 2);
        let a = r.analytics.unwrap();
        assert_eq!(a.level_distribution.get(&Level::Error), Some(&1));
        assert_eq!(a.refresh_distribution.get("Refresh-9"), Some(&2));
        assert_eq!(a.component_distribution.get("iptv-orchestrator"), Some(&2));
    }

    #[test]
    fn limit_is_clamped() {
        let r = engine()
            .search(&LogQuery {
                limit: Some("1000".into()),
                ..q()
            })
            .unwrap();
        assert_eq!(r.pagination.limit, 2);
        assert_eq!(r.pagination.returned_count, 2);
        assert_eq!(r.pagination.total_count, 4);
        assert!(r.pagination.has_more);
    }

    #[test]
    fn small_pages_stop_counting_early() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(IndexStore::new(StoreLimits::default(), clock.clone()));
        store
            .put((0..500).map(|i| rec(i, i as u64, Level::Info, "tick")).collect())
            .unwrap();
        let e = QueryEngine::new(
            store,
            TimeResolver::new(LocalZone::utc(), Duration::hours(1), "last 1 hour"),
            clock,
            QueryLimits {
                overscan: 4,
                ..Default::default()
            },
        );
        let r = e
            .search(&LogQuery {
                limit: Some("1".into()),
                ..q()
            })
            .unwrap();
        assert_eq!(r.pagination.returned_count, 1);
        assert_eq!(r.pagination.total_count, 4);
        assert!(r.pagination.total_is_lower_bound);
        assert!(r.pagination.has_more);

        let r = e
            .search(&LogQuery {
                offset: Some("10".into()),
                limit: Some("10".into()),
                ..q()
            })
            .unwrap();
        assert_eq!(r.pagination.total_count, 80);
        assert_eq!(r.pagination.returned_count, 10);
    }

    #[test]
    fn time_filter_and_absent_time() {
        let e = engine();
        let r = e
            .search(&LogQuery {
                time: Some("last 1 hour".into()),
                ..q()
            })
            .unwrap();
        assert_eq!(r.pagination.total_count, 3);
        assert!(r.time_range.is_some());

        // 空短语 = last 1 hour；缺省 = 不过滤
        let r = e.search(&LogQuery { time: Some("".into()), ..q() }).unwrap();
        assert_eq!(r.pagination.total_count, 3);
        let r = e.search(&q()).unwrap();
        assert_eq!(r.pagination.total_count, 4);
    }

    #[test]
    fn client_errors() {
        let e = engine();
        assert!(matches!(
            e.search(&LogQuery { pattern: Some("(unclosed".into()), ..q() }),
            Err(QueryError::InvalidPattern(_))
        ));
        match e.search(&LogQuery { time: Some("whenever".into()), ..q() }) {
            Err(QueryError::InvalidTime(p)) => assert_eq!(p, "whenever"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            e.search(&LogQuery { limit: Some("ten".into()), ..q() }),
            Err(QueryError::InvalidParameter { name: "limit", .. })
        ));
        assert!(matches!(
            e.search(&LogQuery { level: Some("loud".into()), ..q() }),
            Err(QueryError::InvalidParameter { name: "level", .. })
        ));
    }

    #[test]
    fn unknown_host_is_empty_not_error() {
        let r = engine()
            .search(&LogQuery {
                host: Some("nope".into()),
                ..q()
            })
            .unwrap();
        assert_eq!(r.pagination.total_count, 0);
        assert!(r.results.is_empty());

        let r = engine()
            .search(&LogQuery {
                host: Some("all".into()),
                ..q()
            })
            .unwrap();
        assert_eq!(r.pagination.total_count, 4);
    }

    #[test]
    fn regex_pattern_matches_message() {
        let r = engine()
            .search(&LogQuery {
                pattern: Some(r"^Retrying Refresh-\d+$".into()),
                ..q()
            })
            .unwrap();
        assert_eq!(r.pagination.total_count, 1);
    }
}
