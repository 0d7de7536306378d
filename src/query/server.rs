use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};

use super::engine::{LogQuery, QueryEngine, SearchResponse};
use super::views::{ComponentsReport, DailySummary, TroubleshootQuery, TroubleshootReport};
use crate::core::{Clock, FileState};
use crate::error::QueryError;
use crate::index::{IndexStore, SourceSummary, StoreLimits};
use crate::stats::{metrics, HealthReport, IngestStats, IngestionHealth, StoreStats};
use crate::tracker::FileTracker;

/// 各 handler 共享的只读句柄
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueryEngine>,
    pub store: Arc<IndexStore>,
    pub tracker: Arc<FileTracker>,
    pub stats: Arc<IngestStats>,
    pub clock: Arc<dyn Clock>,
    pub scan_trigger: Arc<Notify>,
    /// 超过该秒数未完成扫描则视为 ingestion 不活跃
    pub stale_after_secs: u64,
}

impl AppState {
    pub fn health(&self) -> HealthReport {
        let now = self.clock.now();
        HealthReport::build(
            now,
            self.stats
                .snapshot(now, self.tracker.tracked_count(), self.stale_after_secs),
            self.store.stats(),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct LimitsUpdate {
    pub ttl_secs: Option<u64>,
    pub max_entries_per_key: Option<usize>,
}

/// `/api/stats` 响应
#[derive(Serialize)]
pub struct StatsResponse {
    pub generated_at: DateTime<Utc>,
    pub ingestion: IngestionHealth,
    pub store: StoreStats,
    #[serde(flatten)]
    pub daily: DailySummary,
}

#[derive(Serialize)]
pub struct ScanAccepted {
    pub accepted: bool,
}

pub struct QueryServer {
    state: AppState,
}

impl QueryServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/logs", get(search_handler))
            .route("/logger/search/:host", get(host_search_handler))
            .route("/logger/troubleshoot/:host/:app", get(troubleshoot_handler))
            .route("/logger/components/:host/:app", get(components_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/stats", get(stats_handler))
            .route("/api/sources", get(sources_handler))
            .route("/api/files", get(files_handler))
            .route("/api/scan", post(scan_handler))
            .route("/api/limits", put(limits_handler).get(get_limits_handler))
            .with_state(self.state.clone())
    }

    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let app = self.router();
        tracing::info!("HTTP Query Server listening on {}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await?;
        tracing::info!("HTTP Query Server stopped");
        Ok(())
    }
}

/// 查询会持有分片读锁并做正则匹配，放到阻塞线程池执行
async fn run_search(engine: Arc<QueryEngine>, q: LogQuery) -> Result<Json<SearchResponse>, QueryError> {
    tokio::task::spawn_blocking(move || engine.search(&q))
        .await
        .map_err(|e| {
            tracing::error!("Search task failed: {}", e);
            QueryError::Unavailable
        })?
        .map(Json)
}

async fn search_handler(
    State(state): State<AppState>,
    Query(q): Query<LogQuery>,
) -> Result<Json<SearchResponse>, QueryError> {
    run_search(state.engine.clone(), q).await
}

async fn host_search_handler(
    State(state): State<AppState>,
    Path(host): Path<String>,
    Query(mut q): Query<LogQuery>,
) -> Result<Json<SearchResponse>, QueryError> {
    q.host = Some(host);
    run_search(state.engine.clone(), q).await
}

/// troubleshoot/components/stats 同样要扫描分片，放到阻塞线程池
async fn run_view<T, F>(engine: Arc<QueryEngine>, f: F) -> Result<T, QueryError>
where
    T: Send + 'static,
    F: FnOnce(&QueryEngine) -> Result<T, QueryError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| {
            tracing::error!("View task failed: {}", e);
            QueryError::Unavailable
        })?
}

async fn troubleshoot_handler(
    State(state): State<AppState>,
    Path((host, app)): Path<(String, String)>,
    Query(q): Query<TroubleshootQuery>,
) -> Result<Json<TroubleshootReport>, QueryError> {
    run_view(state.engine.clone(), move |e| e.troubleshoot(&host, &app, &q))
        .await
        .map(Json)
}

async fn components_handler(
    State(state): State<AppState>,
    Path((host, app)): Path<(String, String)>,
) -> Result<Json<ComponentsReport>, QueryError> {
    run_view(state.engine.clone(), move |e| e.components(&host, &app))
        .await
        .map(Json)
}

async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>, QueryError> {
    if state.store.is_closed() {
        return Err(QueryError::Unavailable);
    }
    let daily = run_view(state.engine.clone(), |e| e.daily_summary()).await?;
    let report = state.health();
    Ok(Json(StatsResponse {
        generated_at: state.clock.now(),
        ingestion: report.ingestion,
        store: report.store.stats,
        daily,
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let report = state.health();
    match metrics::encode_metrics(&report, &state.store.sources()) {
        Ok(body) => ([(header::CONTENT_TYPE, metrics::CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            tracing::error!("Metrics encoding failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let report = state.health();
    let code = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

async fn sources_handler(State(state): State<AppState>) -> Result<Json<Vec<SourceSummary>>, QueryError> {
    if state.store.is_closed() {
        return Err(QueryError::Unavailable);
    }
    Ok(Json(state.store.sources()))
}

async fn files_handler(State(state): State<AppState>) -> Json<Vec<FileState>> {
    Json(state.tracker.snapshot())
}

async fn scan_handler(State(state): State<AppState>) -> (StatusCode, Json<ScanAccepted>) {
    state.scan_trigger.notify_one();
    tracing::info!("Rescan requested over HTTP");
    (StatusCode::ACCEPTED, Json(ScanAccepted { accepted: true }))
}

async fn get_limits_handler(State(state): State<AppState>) -> Json<StoreLimits> {
    Json(state.store.limits())
}

async fn limits_handler(
    State(state): State<AppState>,
    Json(update): Json<LimitsUpdate>,
) -> Result<Json<StoreLimits>, QueryError> {
    let mut limits = state.store.limits();
    if let Some(ttl) = update.ttl_secs {
        if ttl == 0 || ttl > StoreLimits::MAX_TTL_SECS {
            return Err(QueryError::InvalidParameter {
                name: "ttl_secs",
                reason: format!("must be in 1..={}", StoreLimits::MAX_TTL_SECS),
            });
        }
        limits.ttl_secs = ttl;
    }
    if let Some(max) = update.max_entries_per_key {
        if max == 0 {
            return Err(QueryError::InvalidParameter {
                name: "max_entries_per_key",
                reason: "must be positive".into(),
            });
        }
        limits.max_entries_per_key = max;
    }
    state.store.set_limits(limits.clone());
    Ok(Json(limits))
}
