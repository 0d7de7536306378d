use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use notify::{Config, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// 文件系统事件监听器
/// 使用 bounded channel 做背压；事件只用来提前触发一轮扫描，丢弃不影响正确性
pub struct EventWatcher;

impl EventWatcher {
    /// 启动监听，返回事件接收端
    pub fn start(
        channel_size: usize,
        overflow_drops: Arc<AtomicU64>,
    ) -> anyhow::Result<(mpsc::Receiver<notify::Event>, notify::RecommendedWatcher)> {
        let (tx, rx) = mpsc::channel(channel_size.max(1));

        let watcher = notify::RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if !is_content_change(&event.kind) {
                        return;
                    }
                    // 非阻塞发送：队列满时丢弃并计数
                    if tx.try_send(event).is_err() {
                        let drops = overflow_drops.fetch_add(1, Ordering::Relaxed);
                        if drops % 1000 == 0 {
                            tracing::warn!("Event channel overflow, total drops: {}", drops + 1);
                        }
                    }
                }
                Err(e) => tracing::debug!("Watch error: {}", e),
            },
            Config::default(),
        )?;

        // 注意：watcher 必须由调用方持有，否则会被 drop
        Ok((rx, watcher))
    }
}

/// 注册监听路径；失败的根目录只告警，扫描周期仍会覆盖它
pub fn watch_roots(watcher: &mut notify::RecommendedWatcher, roots: &[PathBuf]) -> usize {
    let mut watched = 0;
    for root in roots {
        match watcher.watch(root, RecursiveMode::Recursive) {
            Ok(()) => watched += 1,
            Err(e) => tracing::warn!("Failed to watch {:?}: {}", root, e),
        }
    }
    watched
}

/// 只关心会产生新字节或新文件的事件
pub fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    )
}

pub fn changed_paths(event: &notify::Event) -> impl Iterator<Item = &PathBuf> {
    event.paths.iter()
}
