pub mod watcher;

pub use watcher::{changed_paths, watch_roots, EventWatcher};
