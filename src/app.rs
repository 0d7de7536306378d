use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};

use crate::config::Config;
use crate::core::Clock;
use crate::event::{watch_roots, EventWatcher};
use crate::index::IndexStore;
use crate::ingest::{IngestConfig, IngestPool};
use crate::parser::LineParser;
use crate::query::{AppState, QueryEngine, QueryLimits, QueryServer, TimeResolver};
use crate::stats::IngestStats;
use crate::storage::OffsetCheckpoint;
use crate::tracker::{FileTracker, TrackerConfig};

/// 组装好的服务：各组件共享同一个 Clock
pub struct App {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<IndexStore>,
    pub tracker: Arc<FileTracker>,
    pub parser: Arc<LineParser>,
    pub pool: Arc<IngestPool>,
    pub engine: Arc<QueryEngine>,
    pub stats: Arc<IngestStats>,
    pub trigger: Arc<Notify>,
}

impl App {
    pub fn build(config: Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        config.validate()?;
        let tz = config.query.tz()?;

        let parser = Arc::new(
            LineParser::with_rules(&config.parser.metadata_rules, tz)
                .context("compiling metadata rules")?,
        );
        let store = Arc::new(IndexStore::new(config.store.limits(), clock.clone()));
        let tracker = Arc::new(FileTracker::new(
            TrackerConfig {
                roots: config.ingest.roots.clone(),
                patterns: config.ingest.patterns.clone(),
                max_file_size: config.ingest.max_file_size_bytes,
                tail_window: config.ingest.tail_window_bytes,
                forget_after: chrono::Duration::seconds(config.store.ttl_secs as i64),
            },
            clock.clone(),
        ));
        let stats = Arc::new(IngestStats::default());
        let pool = Arc::new(IngestPool::new(
            tracker.clone(),
            parser.clone(),
            store.clone(),
            clock.clone(),
            stats.clone(),
            config.ingest.state_file.clone().map(OffsetCheckpoint::new),
            IngestConfig {
                workers: config.ingest.workers,
                scan_interval: Duration::from_secs(config.ingest.scan_interval_secs),
                debounce: Duration::from_millis(config.ingest.debounce_ms),
                max_backoff: Duration::from_secs(config.ingest.max_backoff_secs),
            },
        ));
        let engine = Arc::new(QueryEngine::new(
            store.clone(),
            TimeResolver::new(
                tz,
                chrono::Duration::minutes(config.query.around_tolerance_mins),
                &config.query.empty_time_phrase,
            ),
            clock.clone(),
            QueryLimits {
                default_limit: config.query.default_limit,
                max_limit: config.query.max_limit,
                scan_cap: config.query.scan_cap,
                overscan: config.query.overscan,
                max_regex_bytes: config.query.max_regex_bytes,
            },
        ));

        Ok(Self {
            config,
            clock,
            store,
            tracker,
            parser,
            pool,
            engine,
            stats,
            trigger: Arc::new(Notify::new()),
        })
    }

    /// 超过三个扫描周期没有完成一轮扫描即视为 ingestion 不活跃
    pub fn stale_after_secs(&self) -> u64 {
        self.config.ingest.scan_interval_secs.saturating_mul(3)
    }

    pub fn state(&self) -> AppState {
        AppState {
            engine: self.engine.clone(),
            store: self.store.clone(),
            tracker: self.tracker.clone(),
            stats: self.stats.clone(),
            clock: self.clock.clone(),
            scan_trigger: self.trigger.clone(),
            stale_after_secs: self.stale_after_secs(),
        }
    }

    /// 启动全部后台任务并在 `shutdown` 置位后按序停止：
    /// ingestion（完成手头文件并写 checkpoint） -> 关闭 store -> TTL 清理与 HTTP 服务。
    pub async fn run(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        for root in self.tracker.missing_roots() {
            tracing::warn!("Log root {:?} does not exist yet", root);
        }
        let restored = self.pool.restore_checkpoint();
        if restored > 0 {
            tracing::info!("Resuming {} files from checkpoint", restored);
        }

        // watcher 必须活到退出
        let mut _watcher = None;
        let events = if self.config.ingest.watch {
            match EventWatcher::start(
                self.config.ingest.event_channel_size,
                self.stats.overflow_drops.clone(),
            ) {
                Ok((rx, mut w)) => {
                    let n = watch_roots(&mut w, self.tracker.roots());
                    tracing::info!("Watching {} of {} roots for changes", n, self.tracker.roots().len());
                    _watcher = Some(w);
                    Some(rx)
                }
                Err(e) => {
                    tracing::warn!("File watcher unavailable, using periodic scans only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (stop_tx, stop_rx) = watch::channel(false);

        let pool_task = tokio::spawn(self.pool.clone().run(
            events,
            shutdown.clone(),
            self.trigger.clone(),
        ));
        let sweep_task = tokio::spawn(self.store.clone().sweep_loop(
            Duration::from_secs(self.config.store.sweep_interval_secs),
            stop_rx.clone(),
        ));
        let report_task = tokio::spawn(report_loop(
            self.state(),
            Duration::from_secs(self.config.log.report_interval_secs.max(1)),
            stop_rx.clone(),
        ));
        let server_task = tokio::spawn(QueryServer::new(self.state()).run(listener, stop_rx));

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        tracing::info!("Shutting down...");

        if let Err(e) = pool_task.await {
            tracing::error!("Ingestion task failed: {}", e);
        }
        self.store.close();
        let _ = stop_tx.send(true);

        let _ = sweep_task.await;
        let _ = report_task.await;
        match server_task.await {
            Ok(res) => res?,
            Err(e) => tracing::error!("Server task failed: {}", e),
        }
        Ok(())
    }
}

/// 周期性输出健康报告
pub async fn report_loop(state: AppState, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = state.health();
                tracing::info!("\n{}", report);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
