//! Change watcher for a store's backing file.
//!
//! Uses notify-debouncer-mini to coalesce raw filesystem events, then waits
//! for the file to stop changing before reading it. A change is handed to
//! the store only when
//!
//! 1. no write of our own is in flight or cooling down,
//! 2. no further events arrived and the file size/mtime stayed the same for
//!    the stability threshold, and
//! 3. the file parses as a JSON object.
//!
//! An unparseable file is assumed to be mid-write by someone else; the event
//! is dropped and the next event retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::envelope;
use crate::error::Result;
use crate::writer::WriteActivity;

/// Default quiet period before a changed file is considered fully written.
pub const DEFAULT_STABILITY_THRESHOLD: Duration = Duration::from_millis(600);

/// Default polling interval while waiting for stability.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(120);

/// Timing knobs for the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub stability_threshold: Duration,
    pub poll_interval: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            stability_threshold: DEFAULT_STABILITY_THRESHOLD,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Watches one backing file and reports validated external edits.
pub struct ChangeWatcher {
    /// Debouncer handle (must keep alive)
    _debouncer: Debouncer<RecommendedWatcher>,
    task: JoinHandle<()>,
}

impl ChangeWatcher {
    /// Start watching `path`.
    ///
    /// `on_change` receives the parsed envelope of every settled external
    /// edit; deduplication against known content is the caller's job.
    pub fn start<F>(
        name: String,
        path: PathBuf,
        activity: Arc<WriteActivity>,
        settings: WatchSettings,
        on_change: F,
    ) -> Result<Self>
    where
        F: Fn(Map<String, Value>) + Send + Sync + 'static,
    {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Watch the directory, not the file: atomic renames replace the inode.
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let dir = dir.canonicalize().unwrap_or(dir);
        let file_name = path.file_name().map(|n| n.to_os_string());

        let callback_name = name.clone();
        let mut debouncer = new_debouncer(
            settings.poll_interval,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let touched = events
                        .iter()
                        .any(|e| e.path.file_name().map(|n| n.to_os_string()) == file_name);
                    if touched {
                        // Receiver dropped means the watcher is stopping.
                        let _ = event_tx.send(());
                    }
                }
                Err(e) => error!("[{}] file watcher error: {}", callback_name, e),
            },
        )?;

        debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;
        info!("[{}] watching {}", name, path.display());

        let task = tokio::spawn(run(name, path, event_rx, activity, settings, on_change));

        Ok(Self {
            _debouncer: debouncer,
            task,
        })
    }

    /// Stop watching. No callback runs after this returns.
    pub async fn stop(self) {
        let ChangeWatcher { _debouncer, task } = self;
        drop(_debouncer);
        task.abort();
        let _ = task.await;
    }
}

async fn run<F>(
    name: String,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<()>,
    activity: Arc<WriteActivity>,
    settings: WatchSettings,
    on_change: F,
) where
    F: Fn(Map<String, Value>) + Send + Sync + 'static,
{
    while rx.recv().await.is_some() {
        if activity.is_suppressed() {
            debug!("[{}] ignoring change during own write", name);
            continue;
        }

        if !wait_for_stability(&path, &mut rx, settings).await {
            break;
        }

        // A write of ours may have started while we were waiting.
        if activity.is_suppressed() {
            debug!("[{}] own write started while settling, skipping", name);
            continue;
        }

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("[{}] cannot read changed file yet: {}", name, e);
                continue;
            }
        };

        match envelope::parse(&raw) {
            Some(parsed) => on_change(parsed),
            None => debug!("[{}] changed file is not valid JSON yet, waiting", name),
        }
    }
    debug!("[{}] watcher stopped", name);
}

type FileStat = Option<(u64, Option<SystemTime>)>;

async fn file_stat(path: &Path) -> FileStat {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    Some((metadata.len(), metadata.modified().ok()))
}

/// Wait until neither events nor size/mtime changes were seen for the
/// stability threshold. Returns `false` if the event source went away.
async fn wait_for_stability(
    path: &Path,
    rx: &mut mpsc::UnboundedReceiver<()>,
    settings: WatchSettings,
) -> bool {
    let mut last_change = Instant::now();
    let mut last_stat = file_stat(path).await;

    loop {
        tokio::time::sleep(settings.poll_interval).await;

        let mut saw_event = false;
        loop {
            match rx.try_recv() {
                Ok(()) => saw_event = true,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return false,
            }
        }

        let stat = file_stat(path).await;
        if saw_event || stat != last_stat {
            last_change = Instant::now();
            last_stat = stat;
        } else if last_change.elapsed() >= settings.stability_threshold {
            return true;
        }
    }
}
