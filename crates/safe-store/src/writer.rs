//! Write serializer: one worker task per store commits writes in FIFO order.
//!
//! Callers hand over fully serialized envelopes; the worker writes them one
//! at a time. While any write is queued or in flight, and for a short
//! cool-down after the last one, [`WriteActivity::is_suppressed`] reports
//! true so the change watcher can drop the echo of our own write.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::envelope;

/// Whether this process is currently writing the backing file.
#[derive(Debug, Default)]
pub struct WriteActivity {
    /// Writes submitted but not yet finished.
    pending: AtomicUsize,
    suppress_until: Mutex<Option<Instant>>,
}

impl WriteActivity {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self, cooldown: Duration) {
        *self
            .suppress_until
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now() + cooldown);
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// True while writes are queued or running, or the cool-down after the
    /// last one has not elapsed.
    pub fn is_suppressed(&self) -> bool {
        if self.pending() > 0 {
            return true;
        }
        self.suppress_until
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|until| Instant::now() < until)
    }
}

struct WriteJob {
    bytes: Vec<u8>,
    done: oneshot::Sender<()>,
}

/// Resolves once the corresponding write has been attempted.
///
/// A failed write still resolves: the failure is logged by the worker and
/// the queue moves on.
#[must_use = "a PendingWrite does nothing unless awaited; the write itself is already queued"]
#[derive(Debug)]
pub struct PendingWrite {
    rx: Option<oneshot::Receiver<()>>,
}

impl PendingWrite {
    /// An already-resolved write, returned once a store is closed.
    pub fn ready() -> Self {
        Self { rx: None }
    }
}

impl Future for PendingWrite {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(());
        };
        match Pin::new(rx).poll(cx) {
            Poll::Ready(_) => {
                self.rx = None;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Per-store write queue.
pub struct WriteSerializer {
    tx: Mutex<Option<mpsc::UnboundedSender<WriteJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    activity: Arc<WriteActivity>,
}

impl WriteSerializer {
    /// Start the worker task for `path`.
    pub fn spawn(
        name: String,
        path: PathBuf,
        activity: Arc<WriteActivity>,
        cooldown: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(name, path, rx, Arc::clone(&activity), cooldown));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            activity,
        }
    }

    /// Queue `bytes` to replace the backing file.
    ///
    /// Ordering is fixed at submission: a later `submit` is always written
    /// after an earlier one.
    pub fn submit(&self, bytes: Vec<u8>) -> PendingWrite {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return PendingWrite::ready();
        };

        let (done, rx) = oneshot::channel();
        self.activity.enqueue();
        if tx.send(WriteJob { bytes, done }).is_err() {
            self.activity.finish(Duration::ZERO);
            return PendingWrite::ready();
        }
        PendingWrite { rx: Some(rx) }
    }

    /// Stop accepting writes and wait for the queue to drain.
    pub async fn shutdown(&self) {
        // Dropping the sender lets the worker exit after the last queued job.
        drop(self.tx.lock().unwrap_or_else(|e| e.into_inner()).take());

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Write worker ended abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    name: String,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
    activity: Arc<WriteActivity>,
    cooldown: Duration,
) {
    while let Some(job) = rx.recv().await {
        match envelope::atomic_write(&path, &job.bytes).await {
            Ok(()) => debug!("[{}] wrote {} bytes", name, job.bytes.len()),
            Err(e) => error!("[{}] write error on {}: {}", name, path.display(), e),
        }
        activity.finish(cooldown);

        // The caller may have dropped its PendingWrite; that's fine.
        let _ = job.done.send(());
    }
    debug!("[{}] write queue drained", name);
}
