pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

use crate::core::Clock;
use crate::event::changed_paths;
use crate::index::IndexStore;
use crate::parser::LineParser;
use crate::stats::IngestStats;
use crate::storage::OffsetCheckpoint;
use crate::tracker::FileTracker;

pub use worker::{process_file, FileOutcome};

#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// 0 = 按 CPU 核数
    pub workers: usize,
    pub scan_interval: Duration,
    /// 文件事件到达后等待这么久再扫描，合并突发写入
    pub debounce: Duration,
    /// Index Store 不可用时的退避上限
    pub max_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            scan_interval: Duration::from_secs(30),
            debounce: Duration::from_millis(500),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// 一轮扫描的汇总
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub files: usize,
    pub committed: usize,
    pub records: usize,
    pub duplicates: usize,
    pub bytes: u64,
    pub read_errors: usize,
    pub store_unavailable: bool,
}

impl PassReport {
    fn absorb(&mut self, outcome: FileOutcome) {
        self.files += 1;
        match outcome {
            FileOutcome::Committed {
                records,
                duplicates,
                bytes,
            } => {
                self.committed += 1;
                self.records += records;
                self.duplicates += duplicates;
                self.bytes += bytes;
            }
            FileOutcome::Pending => {}
            FileOutcome::ReadFailed => self.read_errors += 1,
            FileOutcome::StoreUnavailable => self.store_unavailable = true,
        }
    }
}

/// Ingestion Worker Pool：每轮从 File Tracker 取增量，分发给固定数量的 worker 线程。
///
/// 同一文件同一时刻只会被一个 worker 处理（由 tracker 的租约保证）；
/// 单个文件读取失败不影响其它文件。
pub struct IngestPool {
    tracker: Arc<FileTracker>,
    parser: Arc<LineParser>,
    store: Arc<IndexStore>,
    clock: Arc<dyn Clock>,
    stats: Arc<IngestStats>,
    checkpoint: Option<OffsetCheckpoint>,
    config: IngestConfig,
    stopping: AtomicBool,
}

impl IngestPool {
    pub fn new(
        tracker: Arc<FileTracker>,
        parser: Arc<LineParser>,
        store: Arc<IndexStore>,
        clock: Arc<dyn Clock>,
        stats: Arc<IngestStats>,
        checkpoint: Option<OffsetCheckpoint>,
        config: IngestConfig,
    ) -> Self {
        Self {
            tracker,
            parser,
            store,
            clock,
            stats,
            checkpoint,
            config,
            stopping: AtomicBool::new(false),
        }
    }

    pub fn worker_count(&self) -> usize {
        match self.config.workers {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    /// 启动时从 checkpoint 恢复 offset；返回恢复的文件数
    pub fn restore_checkpoint(&self) -> usize {
        let Some(ck) = &self.checkpoint else {
            return 0;
        };
        match ck.load() {
            Some(states) => {
                let n = self.tracker.restore(states);
                tracing::info!("Restored offsets for {} files from {:?}", n, ck.path());
                n
            }
            None => 0,
        }
    }

    pub fn save_checkpoint(&self) {
        if let Some(ck) = &self.checkpoint {
            if let Err(e) = ck.save(&self.tracker.snapshot()) {
                tracing::warn!("Failed to write checkpoint {:?}: {}", ck.path(), e);
            }
        }
    }

    /// 请求停止：正在处理的文件会完成并提交，剩余文件留给下次启动
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// 同步执行一轮扫描（阻塞，调用方负责放到阻塞线程）
    pub fn run_pass(&self) -> PassReport {
        let items = self.tracker.scan();
        let report = Mutex::new(PassReport::default());

        if !items.is_empty() {
            let workers = self.worker_count().min(items.len());
            let (tx, rx) = crossbeam::channel::bounded(items.len());
            for item in items {
                // 容量等于任务数，不会阻塞
                let _ = tx.send(item);
            }
            drop(tx);

            let store_down = AtomicBool::new(false);
            std::thread::scope(|s| {
                for _ in 0..workers {
                    let rx = rx.clone();
                    let report = &report;
                    let store_down = &store_down;
                    s.spawn(move || {
                        while let Ok(item) = rx.recv() {
                            // 停止或 store 不可用：剩余文件直接释放租约，不提交
                            if self.is_stopping() || store_down.load(Ordering::Acquire) {
                                continue;
                            }
                            let outcome = process_file(
                                item,
                                &self.parser,
                                &self.store,
                                self.clock.as_ref(),
                                &self.stats,
                            );
                            if outcome == FileOutcome::StoreUnavailable {
                                store_down.store(true, Ordering::Release);
                            }
                            report.lock().absorb(outcome);
                        }
                    });
                }
            });
        }

        self.stats.mark_scan(self.clock.now());
        let report = report.into_inner();
        if report.committed > 0 {
            self.save_checkpoint();
            tracing::debug!(
                "Scan pass: {} files, {} records ({} duplicates), {} bytes",
                report.files,
                report.records,
                report.duplicates,
                report.bytes
            );
        }
        report
    }

    async fn pass(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) -> PassReport {
        let pool = self.clone();
        let mut handle = tokio::task::spawn_blocking(move || pool.run_pass());
        let joined = tokio::select! {
            r = &mut handle => r,
            _ = wait_shutdown(shutdown) => {
                self.stop();
                handle.await
            }
        };
        match joined {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Scan pass failed: {}", e);
                PassReport::default()
            }
        }
    }

    /// 调度循环：定时扫描 + 文件事件（去抖）+ 手动触发；Index Store 不可用时指数退避。
    pub async fn run(
        self: Arc<Self>,
        mut events: Option<mpsc::Receiver<notify::Event>>,
        mut shutdown: watch::Receiver<bool>,
        trigger: Arc<Notify>,
    ) {
        tracing::info!(
            "Ingestion started: {} workers, scan every {:?}",
            self.worker_count(),
            self.config.scan_interval
        );
        let mut backoff: Option<Duration> = None;

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.pass(&mut shutdown).await;
            if self.is_stopping() {
                break;
            }

            if report.store_unavailable {
                let next = backoff
                    .map_or(self.config.scan_interval, |b| b * 2)
                    .min(self.config.max_backoff);
                tracing::warn!("Index store unavailable, retrying in {:?}", next);
                backoff = Some(next);
            } else {
                backoff = None;
            }

            let deadline =
                tokio::time::Instant::now() + backoff.unwrap_or(self.config.scan_interval);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = trigger.notified() => {
                        tracing::debug!("Scan triggered");
                        break;
                    }
                    ev = next_event(&mut events) => {
                        let Some(ev) = ev else {
                            tracing::warn!("Event channel closed, falling back to periodic scans");
                            events = None;
                            continue;
                        };
                        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                        if backoff.is_some() || !changed_paths(&ev).any(|p| self.tracker.is_relevant(p)) {
                            continue;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.debounce) => {}
                            _ = wait_shutdown(&mut shutdown) => break 'outer,
                        }
                        if let Some(rx) = events.as_mut() {
                            while rx.try_recv().is_ok() {
                                self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        break;
                    }
                    _ = wait_shutdown(&mut shutdown) => break 'outer,
                }
            }
        }

        self.stop();
        let pool = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || pool.save_checkpoint()).await {
            tracing::error!("Final checkpoint failed: {}", e);
        }
        tracing::info!("Ingestion stopped");
    }
}

async fn next_event(rx: &mut Option<mpsc::Receiver<notify::Event>>) -> Option<notify::Event> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// 等到 shutdown 置 true（或发送端消失）
async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
