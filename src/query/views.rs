use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::engine::{parse_usize, scope, QueryEngine};
use super::time::TimeWindow;
use crate::core::{Level, LogRecord};
use crate::error::QueryError;
use crate::index::StoreQuery;

/// troubleshoot 视图返回的最近记录与错误记录条数
const RECENT_SHOWN: usize = 10;
const ERRORS_SHOWN: usize = 5;
const MAX_LOOKBACK_HOURS: usize = 24 * 31;

/// 错误消息的粗分类（按关键字）
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ConnectionIssues,
    PermissionIssues,
    FileIssues,
    DatabaseIssues,
    ApiIssues,
    OtherErrors,
}

impl ErrorCategory {
    pub fn classify(message: &str) -> Self {
        let m = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| m.contains(w));
        if has(&["connection", "timeout", "timed out"]) {
            Self::ConnectionIssues
        } else if has(&["permission", "access denied", "forbidden"]) {
            Self::PermissionIssues
        } else if has(&["file not found", "no such file"]) {
            Self::FileIssues
        } else if has(&["database", "sql"]) {
            Self::DatabaseIssues
        } else if has(&["api", "http"]) {
            Self::ApiIssues
        } else {
            Self::OtherErrors
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorPattern {
    pub category: ErrorCategory,
    pub count: usize,
    /// 该类最新一条错误的消息
    pub example: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TroubleshootQuery {
    pub component: Option<String>,
    pub hours: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TroubleshootAnalysis {
    pub total_logs: usize,
    pub error_count: usize,
    /// true 时计数只是下界（扫描达到上限）
    pub counts_are_lower_bound: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub common_errors: Vec<ErrorPattern>,
    pub status: &'static str,
}

/// `/logger/troubleshoot/:host/:app` 响应
#[derive(Clone, Debug, Serialize)]
pub struct TroubleshootReport {
    pub host: String,
    pub application: String,
    pub component: Option<String>,
    pub time_range: TimeWindow,
    pub analysis: TroubleshootAnalysis,
    pub recent_logs: Vec<LogRecord>,
    pub error_logs: Vec<LogRecord>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ComponentStats {
    pub component: Option<String>,
    pub entries: usize,
    pub error_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
    pub first_seen: Option<DateTime<Utc>>,
}

/// `/logger/components/:host/:app` 响应
#[derive(Clone, Debug, Serialize)]
pub struct ComponentsReport {
    pub host: String,
    pub application: String,
    pub total_components: usize,
    pub components: Vec<ComponentStats>,
    pub error_counts_are_lower_bound: bool,
}

/// `/api/stats` 中按本地日历日统计的部分
#[derive(Clone, Debug, Serialize)]
pub struct DailySummary {
    pub today: TimeWindow,
    pub total_logs_today: usize,
    pub errors_today: usize,
    pub error_rate_percent: f64,
    pub counts_are_lower_bound: bool,
    /// 今天产生过记录的 `host/app[/component]`
    pub active_sources: Vec<String>,
}

fn is_error(r: &LogRecord) -> bool {
    matches!(r.level, Level::Error | Level::Critical)
}

impl QueryEngine {
    /// 单个应用的排障视图：最近活动、错误计数与错误分类
    pub fn troubleshoot(
        &self,
        host: &str,
        application: &str,
        q: &TroubleshootQuery,
    ) -> Result<TroubleshootReport, QueryError> {
        let hours = parse_usize("hours", &q.hours)?.unwrap_or(1);
        if hours == 0 || hours > MAX_LOOKBACK_HOURS {
            return Err(QueryError::InvalidParameter {
                name: "hours",
                reason: format!("must be in 1..={MAX_LOOKBACK_HOURS}"),
            });
        }
        let now = self.clock.now();
        let window = TimeWindow {
            start: now - Duration::hours(hours as i64),
            end: now,
        };
        let component = scope(&q.component);
        let base = StoreQuery {
            host: Some(host.to_string()),
            application: Some(application.to_string()),
            component: component.clone(),
            start: Some(window.start),
            end: Some(window.end),
            offset: 0,
            limit: RECENT_SHOWN,
            scan_cap: self.limits.scan_cap,
            match_cap: 0,
        };

        let recent = self.store.query(&base, |_| true)?;

        let mut patterns: BTreeMap<ErrorCategory, (usize, String)> = BTreeMap::new();
        let errors = self.store.query(
            &StoreQuery {
                limit: ERRORS_SHOWN,
                ..base
            },
            |r| {
                if !is_error(r) {
                    return false;
                }
                let slot = patterns
                    .entry(ErrorCategory::classify(&r.message))
                    .or_insert_with(|| (0, r.message.clone()));
                slot.0 += 1;
                true
            },
        )?;

        let mut common_errors: Vec<ErrorPattern> = patterns
            .into_iter()
            .map(|(category, (count, example))| ErrorPattern {
                category,
                count,
                example,
            })
            .collect();
        common_errors.sort_by(|a, b| b.count.cmp(&a.count).then(a.category.cmp(&b.category)));

        tracing::debug!(
            "Troubleshoot {}/{}: {} records, {} errors in the last {}h",
            host,
            application,
            recent.total,
            errors.total,
            hours
        );
        Ok(TroubleshootReport {
            host: host.to_string(),
            application: application.to_string(),
            component,
            time_range: window,
            analysis: TroubleshootAnalysis {
                total_logs: recent.total,
                error_count: errors.total,
                counts_are_lower_bound: recent.total_is_lower_bound || errors.total_is_lower_bound,
                last_activity: recent.records.first().map(|r| r.timestamp),
                common_errors,
                status: if errors.total == 0 {
                    "healthy"
                } else {
                    "issues_detected"
                },
            },
            recent_logs: recent.records.iter().map(|r| LogRecord::clone(r)).collect(),
            error_logs: errors.records.iter().map(|r| LogRecord::clone(r)).collect(),
        })
    }

    /// 某应用下的组件列表（来自分片概况）及各组件错误数
    pub fn components(&self, host: &str, application: &str) -> Result<ComponentsReport, QueryError> {
        if self.store.is_closed() {
            return Err(QueryError::Unavailable);
        }
        let mut components: Vec<ComponentStats> = self
            .store
            .sources()
            .into_iter()
            .filter(|s| s.host == host && s.application == application)
            .map(|s| ComponentStats {
                component: s.component,
                entries: s.entries,
                error_count: 0,
                last_activity: s.newest,
                first_seen: s.oldest,
            })
            .collect();

        let mut errors: BTreeMap<Option<String>, usize> = BTreeMap::new();
        let page = self.store.query(
            &StoreQuery {
                host: Some(host.to_string()),
                application: Some(application.to_string()),
                limit: 0,
                scan_cap: self.limits.scan_cap,
                ..Default::default()
            },
            |r| {
                if !is_error(r) {
                    return false;
                }
                *errors.entry(r.component.clone()).or_default() += 1;
                true
            },
        )?;
        for c in &mut components {
            c.error_count = errors.get(&c.component).copied().unwrap_or(0);
        }

        Ok(ComponentsReport {
            host: host.to_string(),
            application: application.to_string(),
            total_components: components.len(),
            components,
            error_counts_are_lower_bound: page.total_is_lower_bound,
        })
    }

    /// 今天（本地时区日历日）的记录数、错误率和活跃来源
    pub fn daily_summary(&self) -> Result<DailySummary, QueryError> {
        let now = self.clock.now();
        let today = self.resolver.resolve("today", now)?;
        let mut errors_today = 0usize;
        let page = self.store.query(
            &StoreQuery {
                start: Some(today.start),
                end: Some(today.end),
                limit: 0,
                scan_cap: self.limits.scan_cap,
                ..Default::default()
            },
            |r| {
                if is_error(r) {
                    errors_today += 1;
                }
                true
            },
        )?;

        let active_sources = self
            .store
            .sources()
            .into_iter()
            .filter(|s| s.newest.is_some_and(|t| t >= today.start))
            .map(|s| match s.component {
                Some(c) => format!("{}/{}/{}", s.host, s.application, c),
                None => format!("{}/{}", s.host, s.application),
            })
            .collect();

        let error_rate_percent = if page.total == 0 {
            0.0
        } else {
            errors_today as f64 * 100.0 / page.total as f64
        };
        Ok(DailySummary {
            today,
            total_logs_today: page.total,
            errors_today,
            error_rate_percent,
            counts_are_lower_bound: page.total_is_lower_bound,
            active_sources,
        })
    }
}
