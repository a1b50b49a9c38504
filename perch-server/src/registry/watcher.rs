//! Config watcher - notices app files being added, edited or removed

use super::is_ignored;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Handle that keeps the watcher alive
pub struct WatcherHandle {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    _thread: std::thread::JoinHandle<()>,
}

/// Watches the config directory (non-recursively) and signals when an app
/// file may have changed.
pub struct ConfigWatcher {
    dir: PathBuf,
    debounce: Duration,
    changed_tx: mpsc::Sender<()>,
}

impl ConfigWatcher {
    pub fn new(dir: PathBuf, debounce: Duration, changed_tx: mpsc::Sender<()>) -> Self {
        Self {
            dir,
            debounce,
            changed_tx,
        }
    }

    pub fn start(self) -> notify::Result<WatcherHandle> {
        let (tx, rx) = std_mpsc::channel();
        let mut debouncer = new_debouncer(self.debounce, tx)?;
        debouncer
            .watcher()
            .watch(&self.dir, RecursiveMode::NonRecursive)?;

        let changed_tx = self.changed_tx;
        let dir = self.dir;
        let handle = std::thread::spawn(move || {
            for result in rx {
                match result {
                    Ok(events) => {
                        if events.iter().any(|e| is_relevant(&dir, &e.path)) {
                            // Receiver gone means the daemon is shutting down.
                            if changed_tx.blocking_send(()).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => tracing::warn!(error = ?e, "Config watch error"),
                }
            }
        });

        tracing::debug!("Watching config directory");
        Ok(WatcherHandle {
            _debouncer: debouncer,
            _thread: handle,
        })
    }
}

/// Events on app files (or the directory itself) matter; the theme file,
/// settings and editor droppings don't.
fn is_relevant(dir: &Path, path: &Path) -> bool {
    if path == dir {
        return true;
    }
    if path.parent() != Some(dir) {
        return false;
    }
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => !is_ignored(name),
        None => false,
    }
}
